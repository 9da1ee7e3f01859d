//! Register access over a mapped controller BAR.

use x86_64::VirtAddr;

/// Byte-offset register access.
///
/// The controller only ever talks to hardware through this trait, which keeps
/// the register layer testable against a simulated device.
pub trait RegisterIo {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);

    /// 64-bit registers are accessed as two dwords, low half first.
    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        hi << 32 | lo
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        (**self).write64(offset, value)
    }
}

/// A mapped MMIO window (BAR0 of the controller).
#[derive(Debug)]
pub struct MmioRegion {
    base: VirtAddr,
    size: usize,
}

// The mapping is device memory, not shared Rust data.
unsafe impl Send for MmioRegion {}

impl MmioRegion {
    /// Create a new register window.
    ///
    /// # Safety
    /// `base` must point to `size` bytes of mapped, uncached device memory that
    /// stays mapped for the lifetime of this value and is not accessed through
    /// any other handle.
    pub unsafe fn new(base: VirtAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {offset:#x} outside of {:#x} byte window",
            self.size
        );
        (self.base + offset as u64).as_mut_ptr::<u32>()
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.register(offset)) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.register(offset), value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_window_round_trips_dwords() {
        let mut backing = vec![0u32; 0x1010 / 4];
        let window = unsafe {
            MmioRegion::new(VirtAddr::from_ptr(backing.as_mut_ptr()), backing.len() * 4)
        };

        window.write32(0x14, 0x0046_0001);
        window.write64(0x28, 0x1234_5678_9abc_d000);

        assert_eq!(window.read32(0x14), 0x0046_0001);
        assert_eq!(window.read32(0x28), 0x9abc_d000);
        assert_eq!(window.read32(0x2c), 0x1234_5678);
        assert_eq!(window.read64(0x28), 0x1234_5678_9abc_d000);
        drop(window);
        assert_eq!(backing[0x14 / 4], 0x0046_0001);
    }

    #[test]
    #[should_panic]
    fn offsets_past_the_window_are_rejected() {
        let mut backing = [0u32; 4];
        let window =
            unsafe { MmioRegion::new(VirtAddr::from_ptr(backing.as_mut_ptr()), 16) };
        window.read32(0x10);
    }
}
