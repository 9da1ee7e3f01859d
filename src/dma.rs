//! DMA page allocation.
//!
//! A [`DmaAllocator`] hands out page-granular, physically contiguous buffers
//! from one pre-registered backing region. Pages are tracked in a bitmap; a
//! bit is set only while the allocation covering it is live.

use alloc::vec;
use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::{debug, trace};

/// Memory page size used for every DMA buffer and PRP entry (CC.MPS = 0).
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// One physically contiguous region shared with the device.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    phys: PhysAddr,
    virt: VirtAddr,
    len: usize,
}

impl DmaRegion {
    /// Describe a pre-registered backing region.
    ///
    /// # Safety
    /// `virt` must map `len` bytes of memory that is physically contiguous
    /// starting at `phys`, stays mapped while any allocator or buffer built from
    /// this region is alive, and is not accessed through any other handle.
    /// Both addresses must be page aligned.
    pub unsafe fn new(phys: PhysAddr, virt: VirtAddr, len: usize) -> Self {
        debug_assert!(phys.as_u64() % PAGE_SIZE as u64 == 0);
        debug_assert!(virt.as_u64() % PAGE_SIZE as u64 == 0);
        Self { phys, virt, len }
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    pub fn virt_addr(&self) -> VirtAddr {
        self.virt
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole pages in the region.
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

/// A live allocation: exclusively owned until handed back to
/// [`DmaAllocator::free`].
#[derive(Debug)]
pub struct DmaBuffer {
    phys_addr: PhysAddr,
    virt_addr: VirtAddr,
    /// size in pages
    size: usize,
}

// The buffer is the sole handle on its pages.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    pub fn virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    /// Size in pages.
    pub fn pages(&self) -> usize {
        self.size
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.size * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Physical address of page `index` of this buffer.
    pub fn page_phys(&self, index: usize) -> PhysAddr {
        debug_assert!(index < self.size);
        self.phys_addr + (index * PAGE_SIZE) as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt_addr.as_ptr::<u8>(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt_addr.as_mut_ptr::<u8>(), self.len()) }
    }

    /// View the buffer as little-endian 64-bit words (PRP lists, namespace lists).
    pub fn as_mut_words(&mut self) -> &mut [u64] {
        unsafe {
            core::slice::from_raw_parts_mut(self.virt_addr.as_mut_ptr::<u64>(), self.len() / 8)
        }
    }
}

/// Bitmap page allocator over one [`DmaRegion`].
#[derive(Debug)]
pub struct DmaAllocator {
    region: DmaRegion,
    /// Bitmap tracking allocated pages (1 = allocated, 0 = free)
    page_bitmap: Vec<u64>,
    total_pages: usize,
    /// Next page to start searching from
    next_search_start: usize,
    /// Number of live allocation records
    live: usize,
    /// Capacity of the allocation record pool
    max_allocations: usize,
}

impl DmaAllocator {
    /// Manage every page of `region`, allowing at most `max_allocations`
    /// simultaneously live buffers.
    pub fn new(region: DmaRegion, max_allocations: usize) -> Self {
        let total_pages = region.pages();
        debug!(
            "DMA allocator: {} pages at phys={:#x} virt={:#x}, {} records",
            total_pages,
            region.phys_addr().as_u64(),
            region.virt_addr().as_u64(),
            max_allocations
        );
        Self {
            region,
            page_bitmap: vec![0; total_pages.div_ceil(64)],
            total_pages,
            next_search_start: 0,
            live: 0,
            max_allocations,
        }
    }

    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Total pages managed.
    pub fn capacity_pages(&self) -> usize {
        self.total_pages
    }

    /// Total bytes managed.
    pub fn capacity_bytes(&self) -> usize {
        self.total_pages * PAGE_SIZE
    }

    pub fn live_allocations(&self) -> usize {
        self.live
    }

    pub fn free_pages(&self) -> usize {
        self.total_pages - self.count_allocated_pages()
    }

    /// Allocate a zeroed buffer of at least `bytes` bytes, rounded up to whole
    /// pages. Returns `None` instead of blocking when the record pool is empty
    /// or no run of contiguous free pages is long enough.
    pub fn alloc(&mut self, bytes: usize) -> Option<DmaBuffer> {
        let pages_needed = bytes.div_ceil(PAGE_SIZE).max(1);
        if self.live >= self.max_allocations {
            trace!("DMA record pool exhausted ({} live)", self.live);
            return None;
        }

        let start_page = self.find_free_pages(pages_needed)?;
        for page in start_page..start_page + pages_needed {
            self.set_page_allocated(page);
        }

        self.next_search_start = start_page + pages_needed;
        if self.next_search_start >= self.total_pages {
            self.next_search_start = 0;
        }
        self.live += 1;

        let offset = (start_page * PAGE_SIZE) as u64;
        let mut buffer = DmaBuffer {
            phys_addr: self.region.phys_addr() + offset,
            virt_addr: self.region.virt_addr() + offset,
            size: pages_needed,
        };
        buffer.as_mut_slice().fill(0);

        trace!(
            "DMA alloc: {} page(s) at phys={:#x}",
            pages_needed,
            buffer.phys_addr.as_u64()
        );
        Some(buffer)
    }

    /// Return a buffer to the allocator, clearing every bit it covered.
    pub fn free(&mut self, buffer: DmaBuffer) {
        let base = self.region.phys_addr().as_u64();
        let phys = buffer.phys_addr.as_u64();
        debug_assert!(
            phys >= base && phys < base + self.region.len() as u64,
            "buffer {phys:#x} does not belong to this allocator"
        );

        let start_page = ((phys - base) / PAGE_SIZE as u64) as usize;
        for page in start_page..start_page + buffer.size {
            debug_assert!(self.is_page_allocated(page), "double free of DMA page {page}");
            self.set_page_free(page);
        }
        self.live -= 1;

        if start_page < self.next_search_start {
            self.next_search_start = start_page;
        }

        trace!("DMA free: {} page(s) at phys={:#x}", buffer.size, phys);
    }

    /// Find contiguous free pages
    fn find_free_pages(&self, pages_needed: usize) -> Option<usize> {
        if pages_needed > self.total_pages {
            return None;
        }
        let last_start = self.total_pages - pages_needed;

        (self.next_search_start..=last_start)
            .find(|&start| self.is_range_free(start, pages_needed))
            .or_else(|| {
                (0..self.next_search_start.min(last_start + 1))
                    .find(|&start| self.is_range_free(start, pages_needed))
            })
    }

    fn is_range_free(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|page| !self.is_page_allocated(page))
    }

    fn set_page_allocated(&mut self, page: usize) {
        self.page_bitmap[page / 64] |= 1u64 << (page % 64);
    }

    fn set_page_free(&mut self, page: usize) {
        self.page_bitmap[page / 64] &= !(1u64 << (page % 64));
    }

    fn is_page_allocated(&self, page: usize) -> bool {
        if page >= self.total_pages {
            return true; // Out of bounds = allocated
        }
        self.page_bitmap[page / 64] & (1u64 << (page % 64)) != 0
    }

    fn count_allocated_pages(&self) -> usize {
        self.page_bitmap.iter().map(|word| word.count_ones() as usize).sum()
    }
}
