//! Minimal PCI type-0 configuration header.

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

const COMMAND_OFFSET: usize = 0x04;
const BAR0_OFFSET: usize = 0x10;
const BAR_COUNT: usize = 6;
const INTERRUPT_LINE_OFFSET: usize = 0x3C;
const INTERRUPT_PIN_OFFSET: usize = 0x3D;

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs into the BDF portion of a config address: bus in bits 8..=15, device in 3..=7,
    /// function in 0..=2.
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }

    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MmioBar {
    size: u32,
    base: u32,
    probe: bool,
}

impl MmioBar {
    fn register_value(&self) -> u32 {
        if self.probe {
            // Size probe: writable address bits read back as ones, memory-space flags are 0.
            !(self.size - 1)
        } else {
            self.base
        }
    }
}

/// 256-byte configuration space for an endpoint function.
///
/// Supports the pieces a firmware enumerator touches: read-only identification bytes, the
/// command register, 32-bit memory BARs with size probing (write `0xFFFF_FFFF`, read back the
/// size mask) and the interrupt line. Everything else is plain storage.
///
/// Accesses may be any length and alignment; bytes beyond offset 0xFF read as `0xFF` and are
/// dropped on write.
#[derive(Debug, Clone)]
pub struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [Option<MmioBar>; BAR_COUNT],
}

impl PciConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        Self {
            bytes,
            bars: [None; BAR_COUNT],
        }
    }

    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x00], self.bytes[0x01]])
    }

    pub fn device_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x02], self.bytes[0x03]])
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0A] = subclass;
        self.bytes[0x0B] = class;
    }

    pub fn command(&self) -> u16 {
        u16::from_le_bytes([self.bytes[COMMAND_OFFSET], self.bytes[COMMAND_OFFSET + 1]])
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.bytes[INTERRUPT_PIN_OFFSET] = pin;
    }

    pub fn interrupt_line(&self) -> u8 {
        self.bytes[INTERRUPT_LINE_OFFSET]
    }

    /// Declare a 32-bit memory BAR.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a BAR slot or `size` is not a power of two of at least 16 bytes.
    pub fn set_mmio_bar(&mut self, index: usize, size: u32, base: u32) {
        assert!(index < BAR_COUNT, "BAR index {index} out of range");
        assert!(
            size.is_power_of_two() && size >= 16,
            "BAR size must be a power of two >= 16 (got {size:#x})"
        );
        self.bars[index] = Some(MmioBar {
            size,
            base: base & !(size - 1),
            probe: false,
        });
    }

    pub fn bar_base(&self, index: usize) -> Option<u32> {
        self.bars.get(index).copied().flatten().map(|bar| bar.base)
    }

    pub fn read_bytes(&self, offset: u64, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = offset
                .checked_add(i as u64)
                .and_then(|addr| usize::try_from(addr).ok())
                .filter(|addr| *addr < PCI_CONFIG_SPACE_SIZE)
                .map_or(0xFF, |addr| self.read_byte(addr));
        }
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) {
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if start >= PCI_CONFIG_SPACE_SIZE {
            return;
        }
        let end = start.saturating_add(data.len()).min(PCI_CONFIG_SPACE_SIZE);

        // BAR registers only take whole aligned dwords.
        let bar_region = BAR0_OFFSET..BAR0_OFFSET + 4 * BAR_COUNT;
        if bar_region.contains(&start) {
            if start % 4 == 0 && end - start == 4 {
                let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.write_bar((start - BAR0_OFFSET) / 4, value);
            }
            return;
        }

        for (i, addr) in (start..end).enumerate() {
            if Self::is_read_only_byte(addr) || bar_region.contains(&addr) {
                continue;
            }
            self.bytes[addr] = data[i];
        }
    }

    pub fn read(&self, offset: u16, size: usize) -> u32 {
        let mut buf = [0u8; 4];
        let size = size.min(4);
        self.read_bytes(u64::from(offset), &mut buf[..size]);
        u32::from_le_bytes(buf)
    }

    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        let size = size.min(4);
        self.write_bytes(u64::from(offset), &value.to_le_bytes()[..size]);
    }

    fn read_byte(&self, addr: usize) -> u8 {
        if (BAR0_OFFSET..BAR0_OFFSET + 4 * BAR_COUNT).contains(&addr) {
            let rel = addr - BAR0_OFFSET;
            let value = self.bars[rel / 4].map_or(0, |bar| bar.register_value());
            return value.to_le_bytes()[rel % 4];
        }
        self.bytes[addr]
    }

    fn write_bar(&mut self, index: usize, value: u32) {
        let Some(bar) = self.bars[index].as_mut() else {
            return;
        };
        if value == 0xFFFF_FFFF {
            bar.probe = true;
        } else {
            bar.base = value & !(bar.size - 1);
            bar.probe = false;
        }
    }

    fn is_read_only_byte(addr: usize) -> bool {
        matches!(addr, 0x00..=0x03 | 0x06..=0x0B | 0x0E | 0x2C..=0x2F | INTERRUPT_PIN_OFFSET)
    }
}
