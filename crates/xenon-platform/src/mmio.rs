use std::sync::Arc;

use tracing::trace;

use crate::pci::PciBdf;

/// A memory-mapped register window.
///
/// Offsets are relative to the window base. Devices are shared between the bus thread and their
/// own worker threads, so every method takes `&self` and implementations serialize internally.
///
/// None of these calls can fail: out-of-range bytes are dropped on write and read back as open
/// bus (`0xFF`), matching what a guest observes on real hardware.
pub trait MmioDevice: Send + Sync {
    /// Size of the register window in bytes.
    fn window_size(&self) -> u64;

    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);

    /// Fill `len` bytes at `offset` with `value`, with the same side effects as an equivalent
    /// [`MmioDevice::write`].
    fn memset(&self, offset: u64, value: u8, len: usize) {
        let len = clamp_access(self.window_size(), offset, len);
        if len == 0 {
            return;
        }
        self.write(offset, &vec![value; len]);
    }

    fn config_read(&self, _offset: u64, data: &mut [u8]) {
        data.fill(0xFF);
    }

    fn config_write(&self, _offset: u64, _data: &[u8]) {}
}

impl<T: MmioDevice + ?Sized> MmioDevice for Arc<T> {
    fn window_size(&self) -> u64 {
        (**self).window_size()
    }

    fn read(&self, offset: u64, data: &mut [u8]) {
        (**self).read(offset, data)
    }

    fn write(&self, offset: u64, data: &[u8]) {
        (**self).write(offset, data)
    }

    fn memset(&self, offset: u64, value: u8, len: usize) {
        (**self).memset(offset, value, len)
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        (**self).config_read(offset, data)
    }

    fn config_write(&self, offset: u64, data: &[u8]) {
        (**self).config_write(offset, data)
    }
}

/// Number of bytes of an `len`-byte access at `offset` that fall inside a `window`-byte window.
pub fn clamp_access(window: u64, offset: u64, len: usize) -> usize {
    if offset >= window {
        return 0;
    }
    let room = window - offset;
    usize::try_from(room).map_or(len, |room| len.min(room))
}

struct MappedWindow {
    start: u64,
    len: u64,
    bdf: Option<PciBdf>,
    dev: Arc<dyn MmioDevice>,
}

impl MappedWindow {
    fn end_exclusive(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    fn contains(&self, paddr: u64) -> bool {
        paddr >= self.start && paddr < self.end_exclusive()
    }
}

/// Physical address router for device register windows.
///
/// Windows never overlap. Accesses are forwarded to the owning device verbatim (the device sees
/// the full length even when it runs off the end of its window, and clamps on its own);
/// accesses that hit no window float high.
#[derive(Default)]
pub struct MmioBus {
    windows: Vec<MappedWindow>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `dev` at `start`, covering [`MmioDevice::window_size`] bytes.
    ///
    /// # Panics
    ///
    /// Panics if the window is empty or overlaps an existing mapping.
    pub fn map(&mut self, start: u64, dev: Arc<dyn MmioDevice>) {
        self.insert(start, None, dev);
    }

    /// Map a PCI function's BAR window and make its configuration space reachable through
    /// [`MmioBus::config_read`]/[`MmioBus::config_write`].
    pub fn map_pci(&mut self, bdf: PciBdf, start: u64, dev: Arc<dyn MmioDevice>) {
        self.insert(start, Some(bdf), dev);
    }

    fn insert(&mut self, start: u64, bdf: Option<PciBdf>, dev: Arc<dyn MmioDevice>) {
        let len = dev.window_size();
        assert!(len != 0, "MMIO window length must be non-zero");
        let end_exclusive = start
            .checked_add(len)
            .expect("MMIO window wraps the physical address space");

        let idx = self.windows.partition_point(|w| w.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.windows.get(i)) {
            assert!(
                start >= prev.end_exclusive(),
                "overlapping MMIO windows: new=[{start:#x}..{end_exclusive:#x}) prev=[{:#x}..{:#x})",
                prev.start,
                prev.end_exclusive()
            );
        }
        if let Some(next) = self.windows.get(idx) {
            assert!(
                end_exclusive <= next.start,
                "overlapping MMIO windows: new=[{start:#x}..{end_exclusive:#x}) next=[{:#x}..{:#x})",
                next.start,
                next.end_exclusive()
            );
        }

        self.windows.insert(
            idx,
            MappedWindow {
                start,
                len,
                bdf,
                dev,
            },
        );
    }

    fn find(&self, paddr: u64) -> Option<&MappedWindow> {
        let idx = self.windows.partition_point(|w| w.start <= paddr);
        let cand = self.windows.get(idx.checked_sub(1)?)?;
        cand.contains(paddr).then_some(cand)
    }

    fn find_pci(&self, bdf: PciBdf) -> Option<&MappedWindow> {
        self.windows.iter().find(|w| w.bdf == Some(bdf))
    }

    pub fn read(&self, paddr: u64, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        match self.find(paddr) {
            Some(window) => window.dev.read(paddr - window.start, data),
            None => {
                trace!(paddr, len = data.len(), "unmapped MMIO read");
                data.fill(0xFF);
            }
        }
    }

    pub fn write(&self, paddr: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.find(paddr) {
            Some(window) => window.dev.write(paddr - window.start, data),
            None => trace!(paddr, len = data.len(), "unmapped MMIO write"),
        }
    }

    pub fn memset(&self, paddr: u64, value: u8, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(window) = self.find(paddr) {
            window.dev.memset(paddr - window.start, value, len);
        }
    }

    pub fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(&self, paddr: u64, value: u32) {
        self.write(paddr, &value.to_le_bytes());
    }

    pub fn config_read(&self, bdf: PciBdf, offset: u64, data: &mut [u8]) {
        match self.find_pci(bdf) {
            Some(window) => window.dev.config_read(offset, data),
            None => data.fill(0xFF),
        }
    }

    pub fn config_write(&self, bdf: PciBdf, offset: u64, data: &[u8]) {
        if let Some(window) = self.find_pci(bdf) {
            window.dev.config_write(offset, data);
        }
    }
}
