//! FIFO command interpretation.
//!
//! Each supported command code maps to one handler. Queries build a response frame from
//! [`CoreState`] without changing it; sets mutate [`CoreState`] and produce nothing. Codes
//! without an entry are dropped.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::fifo::{Frame, FRAME_LEN};
use crate::regs::{FifoCommand as C, FifoCommand, TRAY_REQUEST_CLOSE, TRAY_REQUEST_OPEN};
use crate::state::{CoreState, FanSpeed};

/// SMC firmware version reported by [`FifoCommand::QueryVersion`].
pub const SMC_VERSION: [u8; 3] = [0x41, 0x02, 0x03];

/// CPU, GPU, EDRAM and motherboard temperatures, each 8.8 fixed point (integer byte first).
pub const TEMPERATURES: [u8; 8] = [45, 0x80, 48, 0x40, 47, 0x00, 40, 0xC0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Query,
    Set,
}

#[derive(Clone, Copy)]
enum Handler {
    Query(fn(&CoreState, &Frame, Instant) -> Frame),
    Set(fn(&mut CoreState, &Frame, Instant)),
}

#[derive(Clone, Copy)]
pub struct CommandEntry {
    pub command: FifoCommand,
    handler: Handler,
}

impl CommandEntry {
    const fn query(command: FifoCommand, f: fn(&CoreState, &Frame, Instant) -> Frame) -> Self {
        Self {
            command,
            handler: Handler::Query(f),
        }
    }

    const fn set(command: FifoCommand, f: fn(&mut CoreState, &Frame, Instant)) -> Self {
        Self {
            command,
            handler: Handler::Set(f),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self.handler {
            Handler::Query(_) => CommandKind::Query,
            Handler::Set(_) => CommandKind::Set,
        }
    }
}

impl std::fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEntry")
            .field("command", &self.command)
            .field("kind", &self.kind())
            .finish()
    }
}

pub static COMMANDS: &[CommandEntry] = &[
    CommandEntry::query(C::PowerOnType, |core, _, _| {
        reply(C::PowerOnType, &[core.power_on_reason.code()])
    }),
    CommandEntry::query(C::QueryRtc, query_rtc),
    CommandEntry::query(C::QueryTemperatures, |_, _, _| {
        reply(C::QueryTemperatures, &TEMPERATURES)
    }),
    CommandEntry::query(C::QueryTrayState, |core, _, _| {
        reply(C::QueryTrayState, &[core.tray.state().code()])
    }),
    CommandEntry::query(C::QueryAvPack, |core, _, _| {
        reply(C::QueryAvPack, &[core.avpack.code()])
    }),
    CommandEntry::query(C::I2cReadWrite, |_, _, _| reply(C::I2cReadWrite, &[0x00])),
    CommandEntry::query(C::QueryVersion, |_, _, _| reply(C::QueryVersion, &SMC_VERSION)),
    CommandEntry::query(C::FifoTest, |_, frame, _| *frame),
    CommandEntry::query(C::QueryIrAddress, |core, _, _| {
        reply(C::QueryIrAddress, &[core.ir_address])
    }),
    CommandEntry::query(C::QueryTiltSensor, |core, _, _| {
        reply(C::QueryTiltSensor, &[core.tilt])
    }),
    CommandEntry::query(C::Read82Int, |core, _, _| reply(C::Read82Int, &[core.int_82])),
    CommandEntry::query(C::Read8EInt, |_, _, _| reply(C::Read8EInt, &[0x00])),
    CommandEntry::set(C::SetStandby, set_standby),
    CommandEntry::set(C::SetTime, |core, frame, now| {
        core.rtc.set(rtc_payload(frame), now)
    }),
    CommandEntry::set(C::SetFanAlgorithm, |core, frame, _| core.fan_algorithm = frame[1]),
    CommandEntry::set(C::SetFanSpeedCpu, |core, frame, _| {
        core.cpu_fan = FanSpeed::from_payload(frame[1])
    }),
    CommandEntry::set(C::SetDvdTray, set_tray),
    CommandEntry::set(C::SetPowerLed, |core, frame, _| {
        core.power_led = [frame[1], frame[2]]
    }),
    CommandEntry::set(C::SetAudioMute, |core, frame, _| core.audio_mute = frame[1] != 0),
    CommandEntry::set(C::ArgonRelated, |_, _, _| {}),
    CommandEntry::set(C::SetFanSpeedGpu, |core, frame, _| {
        core.gpu_fan = FanSpeed::from_payload(frame[1])
    }),
    CommandEntry::set(C::SetIrAddress, |core, frame, _| core.ir_address = frame[1]),
    CommandEntry::set(C::SetDvdTraySecure, set_tray),
    CommandEntry::set(C::SetFrontPanelLeds, |core, frame, _| {
        core.front_panel_leds = [frame[1], frame[2]]
    }),
    CommandEntry::set(C::SetRtcWake, |core, frame, _| {
        core.rtc_wake.copy_from_slice(&frame[1..6])
    }),
    CommandEntry::set(C::AnaRelated, |_, _, _| {}),
    CommandEntry::set(C::SetAsyncOperation, |core, frame, _| {
        core.async_operation = frame[1]
    }),
    CommandEntry::set(C::Set82Int, |core, frame, _| core.int_82 = frame[1]),
    CommandEntry::set(C::Set9FInt, |core, frame, _| core.int_9f = frame[1]),
];

pub fn lookup(code: u8) -> Option<&'static CommandEntry> {
    COMMANDS.iter().find(|entry| entry.command.code() == code)
}

/// Interpret one command frame. Returns the response to queue, if the command is a query.
pub fn dispatch(core: &mut CoreState, frame: &Frame, now: Instant) -> Option<Frame> {
    let Some(entry) = lookup(frame[0]) else {
        warn!(code = frame[0], "ignoring unknown SMC command");
        return None;
    };
    debug!(command = ?entry.command, kind = ?entry.kind(), "SMC command");
    match entry.handler {
        Handler::Query(f) => Some(f(core, frame, now)),
        Handler::Set(f) => {
            f(core, frame, now);
            None
        }
    }
}

fn reply(command: FifoCommand, payload: &[u8]) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = command.code();
    frame[1..1 + payload.len()].copy_from_slice(payload);
    frame
}

fn query_rtc(core: &CoreState, _: &Frame, now: Instant) -> Frame {
    let ms = core.rtc.millis(now).to_le_bytes();
    reply(FifoCommand::QueryRtc, &ms[..5])
}

fn rtc_payload(frame: &Frame) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..5].copy_from_slice(&frame[1..6]);
    u64::from_le_bytes(bytes)
}

fn set_standby(core: &mut CoreState, frame: &Frame, _: Instant) {
    core.standby = Some(frame[1]);
    if frame[1] == 0x01 {
        info!("guest requested power off");
    }
}

fn set_tray(core: &mut CoreState, frame: &Frame, now: Instant) {
    match frame[1] {
        TRAY_REQUEST_OPEN => core.tray.request_open(now),
        TRAY_REQUEST_CLOSE => core.tray.request_close(now),
        other => debug!(payload = other, "ignoring tray request"),
    }
}
