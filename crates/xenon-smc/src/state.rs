//! Peripheral state owned by the SMC: tray, power/AV identification, sensors and the RTC.

use std::time::{Duration, Instant};

use tracing::info;

use crate::config::SmcConfig;
use crate::regs::{AvPackType, PowerOnReason, TrayState};
use crate::uart::UartSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrayTarget {
    Open,
    Closed,
}

/// Optical drive tray mechanics.
///
/// Requests only set a target; [`TrayMotion::poll`] moves through the intermediate states one
/// step at a time, each lasting at least `step`. The model is driven entirely by the `now`
/// values handed to it.
#[derive(Debug, Clone)]
pub struct TrayMotion {
    state: TrayState,
    target: TrayTarget,
    deadline: Option<Instant>,
    step: Duration,
}

impl TrayMotion {
    pub fn new(step: Duration) -> Self {
        Self {
            state: TrayState::Closed,
            target: TrayTarget::Closed,
            deadline: None,
            step,
        }
    }

    pub fn state(&self) -> TrayState {
        self.state
    }

    /// When the next transition is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn request_open(&mut self, now: Instant) {
        if self.target == TrayTarget::Open {
            return;
        }
        self.target = TrayTarget::Open;
        match self.state {
            TrayState::Open => self.deadline = None,
            TrayState::Opening | TrayState::Closing => {
                self.deadline.get_or_insert(now + self.step);
            }
            TrayState::Closed
            | TrayState::OpenRequest
            | TrayState::Unknown
            | TrayState::Spinup => {
                self.state = TrayState::OpenRequest;
                self.deadline = Some(now + self.step);
            }
        }
    }

    pub fn request_close(&mut self, now: Instant) {
        if self.target == TrayTarget::Closed {
            return;
        }
        self.target = TrayTarget::Closed;
        match self.state {
            TrayState::OpenRequest => {
                self.state = TrayState::Closed;
                self.deadline = None;
            }
            TrayState::Open => self.deadline = Some(now + self.step),
            TrayState::Opening | TrayState::Closing => {
                self.deadline.get_or_insert(now + self.step);
            }
            TrayState::Closed | TrayState::Unknown | TrayState::Spinup => self.deadline = None,
        }
    }

    /// Front-panel eject button: reverse whatever the tray is doing.
    pub fn toggle(&mut self, now: Instant) {
        match self.target {
            TrayTarget::Open => self.request_close(now),
            TrayTarget::Closed => self.request_open(now),
        }
    }

    /// Take at most one step if it is due. Returns the state entered.
    pub fn poll(&mut self, now: Instant) -> Option<TrayState> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let next = match (self.state, self.target) {
            (TrayState::OpenRequest | TrayState::Closing, TrayTarget::Open) => TrayState::Opening,
            (TrayState::Opening, TrayTarget::Open) => TrayState::Open,
            (TrayState::Open | TrayState::Opening, TrayTarget::Closed) => TrayState::Closing,
            (TrayState::Closing, TrayTarget::Closed) => TrayState::Closed,
            _ => {
                self.deadline = None;
                return None;
            }
        };

        self.state = next;
        self.deadline = match next {
            TrayState::Open | TrayState::Closed => None,
            _ => Some(now + self.step),
        };
        Some(next)
    }
}

/// 40-bit millisecond real-time clock.
#[derive(Debug, Clone)]
pub struct Rtc {
    base_ms: u64,
    set_at: Instant,
}

const RTC_MASK: u64 = (1 << 40) - 1;

impl Rtc {
    fn new(now: Instant) -> Self {
        Self {
            base_ms: 0,
            set_at: now,
        }
    }

    pub fn set(&mut self, ms: u64, now: Instant) {
        self.base_ms = ms & RTC_MASK;
        self.set_at = now;
    }

    pub fn millis(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.set_at).as_millis() as u64;
        self.base_ms.wrapping_add(elapsed) & RTC_MASK
    }
}

/// Fan override: bit 7 of the payload enables it, bits 0..=6 carry the duty cycle in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanSpeed {
    pub override_enabled: bool,
    pub percent: u8,
}

impl FanSpeed {
    pub fn from_payload(byte: u8) -> Self {
        Self {
            override_enabled: byte & 0x80 != 0,
            percent: byte & 0x7F,
        }
    }
}

/// Everything the SMC firmware tracks about the console, as seen from the guest.
#[derive(Debug, Clone)]
pub struct CoreState {
    pub tray: TrayMotion,
    pub power_on_reason: PowerOnReason,
    pub avpack: AvPackType,
    pub uart: UartSettings,
    pub rtc: Rtc,
    pub rtc_wake: [u8; 5],
    pub ir_address: u8,
    /// 0 = horizontal.
    pub tilt: u8,
    pub standby: Option<u8>,
    pub fan_algorithm: u8,
    pub cpu_fan: FanSpeed,
    pub gpu_fan: FanSpeed,
    pub power_led: [u8; 2],
    pub front_panel_leds: [u8; 2],
    pub audio_mute: bool,
    pub async_operation: u8,
    pub int_82: u8,
    pub int_9f: u8,
}

impl CoreState {
    pub fn new(config: &SmcConfig, now: Instant) -> Self {
        Self {
            tray: TrayMotion::new(config.tray_step),
            power_on_reason: config.power_on_reason,
            avpack: config.avpack,
            uart: UartSettings::default(),
            rtc: Rtc::new(now),
            rtc_wake: [0; 5],
            ir_address: 0,
            tilt: 0,
            standby: None,
            fan_algorithm: 0,
            cpu_fan: FanSpeed::default(),
            gpu_fan: FanSpeed::default(),
            power_led: [0; 2],
            front_panel_leds: [0; 2],
            audio_mute: false,
            async_operation: 0,
            int_82: 0,
            int_9f: 0,
        }
    }

    /// Advance the tray model, logging each state it enters.
    pub fn poll_tray(&mut self, now: Instant) {
        while let Some(state) = self.tray.poll(now) {
            info!(?state, "tray moved");
        }
    }
}
