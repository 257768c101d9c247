//! Register offsets and guest-visible wire constants.

use crate::error::UnknownCode;

/// Size of the SMC register window.
pub const SMC_WINDOW_SIZE: usize = 0x100;

pub const BUS_CONTROL: u64 = 0x00;
pub const UART_IN: u64 = 0x10;
pub const UART_OUT: u64 = 0x14;
pub const UART_STATUS: u64 = 0x18;
pub const UART_CONFIG: u64 = 0x1C;
pub const SMI_INT_PENDING: u64 = 0x50;
pub const SMI_INT_ACK: u64 = 0x5C;
pub const SMI_INT_ENABLE: u64 = 0x60;
pub const CLOCK_INT_ENABLE: u64 = 0x64;
pub const CLOCK_INT_STATUS: u64 = 0x6C;
pub const FIFO_IN_MSG: u64 = 0x80;
pub const FIFO_IN_STATUS: u64 = 0x84;
pub const FIFO_OUT_MSG: u64 = 0x90;
pub const FIFO_OUT_STATUS: u64 = 0x94;

/// FIFO status bit: in-FIFO ready to accept / out-FIFO has a response.
pub const FIFO_STATUS_READY: u32 = 0x4;

pub const UART_STATUS_RX_AVAILABLE: u32 = 0x1;
pub const UART_STATUS_TX_READY: u32 = 0x2;

/// Bit used in the SMI and clock enable/pending/status registers.
pub const INT_BIT: u32 = 0x1000_0000;

/// Offsets with read or write side effects. Everything else in the window is plain storage.
pub const SIDE_EFFECT_REGISTERS: [u64; 11] = [
    UART_IN,
    UART_OUT,
    UART_STATUS,
    UART_CONFIG,
    SMI_INT_PENDING,
    SMI_INT_ACK,
    CLOCK_INT_STATUS,
    FIFO_IN_MSG,
    FIFO_IN_STATUS,
    FIFO_OUT_MSG,
    FIFO_OUT_STATUS,
];

/// Backing bytes of the register window.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    bytes: [u8; SMC_WINDOW_SIZE],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            bytes: [0; SMC_WINDOW_SIZE],
        }
    }
}

impl RegisterFile {
    pub fn read_u32(&self, reg: u64) -> u32 {
        let off = reg as usize;
        u32::from_le_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    pub fn write_u32(&mut self, reg: u64, value: u32) {
        let off = reg as usize;
        self.bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: u64, data: &mut [u8]) {
        let off = offset as usize;
        data.copy_from_slice(&self.bytes[off..off + data.len()]);
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) {
        let off = offset as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub const fn code(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = UnknownCode;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                match code {
                    $($value => Ok($name::$variant),)+
                    _ => Err(UnknownCode { kind: $kind, code }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.code()
            }
        }
    };
}

wire_enum! {
    /// FIFO command codes (first byte of a command frame).
    pub enum FifoCommand: "FIFO command" {
        PowerOnType = 0x01,
        QueryRtc = 0x04,
        QueryTemperatures = 0x07,
        QueryTrayState = 0x0A,
        QueryAvPack = 0x0F,
        I2cReadWrite = 0x11,
        QueryVersion = 0x12,
        FifoTest = 0x13,
        QueryIrAddress = 0x16,
        QueryTiltSensor = 0x17,
        Read82Int = 0x1E,
        Read8EInt = 0x20,
        SetStandby = 0x82,
        SetTime = 0x85,
        SetFanAlgorithm = 0x88,
        SetFanSpeedCpu = 0x89,
        SetDvdTray = 0x8B,
        SetPowerLed = 0x8C,
        SetAudioMute = 0x8D,
        ArgonRelated = 0x90,
        SetFanSpeedGpu = 0x94,
        SetIrAddress = 0x95,
        SetDvdTraySecure = 0x98,
        SetFrontPanelLeds = 0x99,
        SetRtcWake = 0x9A,
        AnaRelated = 0x9B,
        SetAsyncOperation = 0x9C,
        Set82Int = 0x9D,
        Set9FInt = 0x9F,
    }
}

wire_enum! {
    /// Optical drive tray state as reported by [`FifoCommand::QueryTrayState`].
    pub enum TrayState: "tray state" {
        Open = 0x60,
        OpenRequest = 0x61,
        Closed = 0x62,
        Opening = 0x63,
        Closing = 0x64,
        Unknown = 0x65,
        Spinup = 0x66,
    }
}

wire_enum! {
    /// Why the console powered on.
    pub enum PowerOnReason: "power-on reason" {
        PowerButton = 0x11,
        EjectButton = 0x12,
        Alarm = 0x15,
        RemotePower = 0x20,
        RemoteEject = 0x21,
        RemoteX = 0x22,
        WindowsButton = 0x24,
        Reset = 0x30,
        RechargeReset = 0x31,
        Kiosk = 0x41,
        Wireless = 0x55,
        WiredFront1 = 0x56,
        WiredFront2 = 0x57,
        WiredRear2 = 0x58,
        WiredRear3 = 0x59,
        WiredRear1 = 0x5A,
    }
}

wire_enum! {
    /// Attached audio/video adapter.
    pub enum AvPackType: "AV pack" {
        Component = 0x0C,
        ComponentAlt = 0x0F,
        HdmiAudio = 0x13,
        HdmiAudioAlt = 0x14,
        VgaAdapterFix = 0x1B,
        HdmiAudioGhettoMod = 0x1C,
        Hdmi = 0x1E,
        HdmiNoAudio = 0x1F,
        CompositeTv = 0x43,
        Scart = 0x47,
        CompositeHd = 0x4F,
        CompositeSVideo = 0x54,
        Composite = 0x57,
        VgaAlt = 0x59,
        Vga = 0x5B,
    }
}

/// Payload byte of [`FifoCommand::SetDvdTray`] requesting the tray to open.
pub const TRAY_REQUEST_OPEN: u8 = 0x60;
/// Payload byte of [`FifoCommand::SetDvdTray`] requesting the tray to close.
pub const TRAY_REQUEST_CLOSE: u8 = 0x62;
