//! Interrupt types and their static priority ranking.
//!
//! Each Xenon interrupt source is identified by a code that is a multiple of 4 in
//! `0x08..=0x7C`. The code is what the ACK register hands to the CPU.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterruptType {
    Ipi4 = 0x08,
    Ipi3 = 0x10,
    Smm = 0x14,
    Sfcx = 0x18,
    SataHdd = 0x20,
    SataCdrom = 0x24,
    Ohci0 = 0x2C,
    Ehci0 = 0x30,
    Ohci1 = 0x34,
    Ehci1 = 0x38,
    Xma = 0x40,
    Audio = 0x44,
    Enet = 0x4C,
    Xps = 0x54,
    Graphics = 0x58,
    Profiler = 0x60,
    Biu = 0x64,
    Ioc = 0x68,
    Fsb = 0x6C,
    Ipi2 = 0x70,
    Clock = 0x74,
    Ipi1 = 0x78,
    Spurious = 0x7C,
}

impl InterruptType {
    /// All interrupt types, highest priority first. Callers enumerate it to walk the defined
    /// codes in service order.
    pub const ALL: [InterruptType; 23] = [
        Self::Ipi4,
        Self::Ipi3,
        Self::Smm,
        Self::Sfcx,
        Self::SataHdd,
        Self::SataCdrom,
        Self::Ohci0,
        Self::Ehci0,
        Self::Ohci1,
        Self::Ehci1,
        Self::Xma,
        Self::Audio,
        Self::Enet,
        Self::Xps,
        Self::Graphics,
        Self::Profiler,
        Self::Biu,
        Self::Ioc,
        Self::Fsb,
        Self::Ipi2,
        Self::Clock,
        Self::Ipi1,
        Self::Spurious,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.code() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ipi4 => "IPI4",
            Self::Ipi3 => "IPI3",
            Self::Smm => "SMM",
            Self::Sfcx => "SFCX",
            Self::SataHdd => "SATA_HDD",
            Self::SataCdrom => "SATA_CDROM",
            Self::Ohci0 => "OHCI0",
            Self::Ehci0 => "EHCI0",
            Self::Ohci1 => "OHCI1",
            Self::Ehci1 => "EHCI1",
            Self::Xma => "XMA",
            Self::Audio => "AUDIO",
            Self::Enet => "ENET",
            Self::Xps => "XPS",
            Self::Graphics => "GRAPHICS",
            Self::Profiler => "PROFILER",
            Self::Biu => "BIU",
            Self::Ioc => "IOC",
            Self::Fsb => "FSB",
            Self::Ipi2 => "IPI2",
            Self::Clock => "CLOCK",
            Self::Ipi1 => "IPI1",
            Self::Spurious => "NONE",
        }
    }
}

/// Rank given to codes that are not in the table. They are still delivered, after everything
/// known.
pub(crate) const UNKNOWN_RANK: u8 = u8::MAX;

const SLOTS: usize = 0x80 >> 2;

/// Maps an interrupt code to its rank; a lower rank is serviced first. Only reachable through
/// [`PRIORITY_TABLE`].
#[derive(Debug, Clone)]
pub struct PriorityTable {
    ranks: [u8; SLOTS],
}

impl PriorityTable {
    const fn build() -> Self {
        let mut ranks = [UNKNOWN_RANK; SLOTS];
        let mut i = 0;
        while i < InterruptType::ALL.len() {
            let code = InterruptType::ALL[i] as u8;
            ranks[(code >> 2) as usize] = i as u8;
            i += 1;
        }
        Self { ranks }
    }

    pub fn rank(&self, code: u8) -> u8 {
        if code & 0x3 != 0 {
            return UNKNOWN_RANK;
        }
        self.ranks
            .get(usize::from(code >> 2))
            .copied()
            .unwrap_or(UNKNOWN_RANK)
    }
}

pub static PRIORITY_TABLE: PriorityTable = PriorityTable::build();

/// Human readable name for an interrupt code, for logs.
pub fn interrupt_name(code: u8) -> &'static str {
    InterruptType::from_code(code).map_or("UNKNOWN", InterruptType::name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_code_order() {
        let mut prev = None;
        for ty in InterruptType::ALL {
            let rank = PRIORITY_TABLE.rank(ty.code());
            assert_ne!(rank, UNKNOWN_RANK, "{} must be ranked", ty.name());
            if let Some(prev) = prev {
                assert!(rank > prev);
            }
            prev = Some(rank);
        }
        assert!(PRIORITY_TABLE.rank(InterruptType::Ipi4.code()) < PRIORITY_TABLE.rank(0x74));
    }

    #[test]
    fn unknown_codes_rank_last() {
        for code in [0x00, 0x04, 0x0C, 0x09, 0x80, 0xFF] {
            assert_eq!(PRIORITY_TABLE.rank(code), UNKNOWN_RANK, "code {code:#x}");
        }
        assert_eq!(interrupt_name(0x0C), "UNKNOWN");
        assert_eq!(interrupt_name(0x74), "CLOCK");
    }
}
