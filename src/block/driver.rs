//! Block driver: request validation, PRP setup, submission and the
//! interrupt-driven completion path.

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::request::{DmaPools, Request, RequestTracker};
use super::{BlockError, Completion, Congestion, DriverError, IoError, Operation};
use crate::config::DriverConfig;
use crate::dma::{DmaAllocator, DmaBuffer, DmaRegion, PAGE_SIZE};
use crate::mmio::RegisterIo;
use crate::nvme::{Controller, Delayer, Namespace, NvmeError};
use crate::{info, warn};

/// I/O completion and submission queue id.
const IO_QUEUE: u16 = 1;

/// Live allocations on the control region: admin and I/O rings plus the
/// identify page.
const CONTROL_ALLOCATIONS: usize = 8;

/// Pointers that fit one PRP list page.
const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;

/// CDW12.NLB is a 0-based 16-bit count.
const MAX_BLOCKS_PER_COMMAND: u64 = 1 << 16;

/// NVMe block device serving the first namespace over one I/O queue pair.
///
/// `T` is the caller's acknowledgement handle. It comes back in the
/// [`Completion`] of its request; for reads its buffer is the destination.
pub struct BlockDriver<M, D, T> {
    controller: Controller<M, D>,
    pub(super) pools: DmaPools,
    requests: RequestTracker<T>,
    namespace: Namespace,
    max_transfer_bytes: usize,
    write_zeroes: bool,
}

impl<M: RegisterIo, D: Delayer, T: AsMut<[u8]>> BlockDriver<M, D, T> {
    /// Bring the controller up, identify it and create the I/O queue pair.
    ///
    /// `control` backs the rings and identify pages, `payload` the data of
    /// in-flight requests and `lists` their PRP list pages.
    pub fn new(
        mmio: M,
        delayer: D,
        control: DmaRegion,
        payload: DmaRegion,
        lists: DmaRegion,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        let verbose = config.verbose;
        let control = DmaAllocator::new(control, CONTROL_ALLOCATIONS);
        let mut controller = Controller::new(mmio, delayer, control, config);

        controller.init()?;
        controller.identify()?;
        controller.setup_io(IO_QUEUE, IO_QUEUE)?;

        let namespace = *controller.namespace().ok_or(NvmeError::NoNamespace)?;
        let (max_transfer_bytes, write_zeroes) = controller
            .info()
            .map(|info| (info.max_transfer_bytes, info.write_zeroes))
            .ok_or(NvmeError::NotInitialized)?;
        let capacity = controller
            .io_queue_capacity(IO_QUEUE)
            .ok_or(NvmeError::NoIoQueue(IO_QUEUE))? as usize;

        let pools = DmaPools {
            payload: DmaAllocator::new(payload, capacity),
            lists: DmaAllocator::new(lists, capacity),
        };
        // one request of the largest accepted size must always fit
        if pools.payload.capacity_bytes() < max_transfer_bytes {
            return Err(DriverError::RegionTooSmall {
                region: "payload",
                len: pools.payload.capacity_bytes(),
                needed: max_transfer_bytes,
            });
        }
        if max_transfer_bytes > 2 * PAGE_SIZE && pools.lists.capacity_pages() == 0 {
            return Err(DriverError::RegionTooSmall {
                region: "PRP list",
                len: pools.lists.capacity_bytes(),
                needed: PAGE_SIZE,
            });
        }
        if verbose.mem {
            info!(
                "payload DMA: {} pages at {:#x}, PRP list DMA: {} pages at {:#x}",
                pools.payload.capacity_pages(),
                pools.payload.region().phys_addr().as_u64(),
                pools.lists.capacity_pages(),
                pools.lists.region().phys_addr().as_u64()
            );
        }

        controller.clear_intr();
        info!(
            "block device ready: {} blocks of {} bytes, {} I/O entries",
            namespace.block_count,
            namespace.block_size,
            controller.max_io_entries()
        );

        Ok(Self {
            controller,
            pools,
            requests: RequestTracker::new(IO_QUEUE, capacity),
            namespace,
            max_transfer_bytes,
            write_zeroes,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.namespace.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.namespace.block_count
    }

    /// Largest `count` a single read or write accepts.
    pub fn max_request_blocks(&self) -> u32 {
        self.namespace.max_request_blocks
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn controller(&self) -> &Controller<M, D> {
        &self.controller
    }

    /// Requests accepted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.requests.live()
    }

    /// Requests that may be in flight at once.
    pub fn queue_depth(&self) -> usize {
        self.requests.capacity()
    }

    pub fn payload_allocator(&self) -> &DmaAllocator {
        &self.pools.payload
    }

    pub fn list_allocator(&self) -> &DmaAllocator {
        &self.pools.lists
    }

    /// Read `count` blocks at `lba` into the front of `tag`'s buffer. The
    /// buffer is filled once the completion reports success.
    pub fn read(&mut self, lba: u64, count: u32, mut tag: T) -> Result<(), BlockError> {
        let len = tag.as_mut().len();
        self.submit(Operation::Read, lba, count, &[], len, tag)
    }

    /// Write `count` blocks at `lba` from the front of `data`.
    pub fn write(&mut self, lba: u64, count: u32, data: &[u8], tag: T) -> Result<(), BlockError> {
        self.submit(Operation::Write, lba, count, data, data.len(), tag)
    }

    /// Flush the controller's volatile write cache.
    pub fn sync(&mut self, tag: T) -> Result<(), BlockError> {
        self.submit(Operation::Sync, 0, 0, &[], 0, tag)
    }

    /// Zero `count` blocks at `lba`.
    pub fn trim(&mut self, lba: u64, count: u32, tag: T) -> Result<(), BlockError> {
        self.submit(Operation::Trim, lba, count, &[], 0, tag)
    }

    /// Checks that do not depend on driver state; returns the transfer length.
    /// `buffer_len` is the caller's source or destination size.
    fn validate(
        &self,
        operation: Operation,
        lba: u64,
        count: u32,
        buffer_len: usize,
    ) -> Result<usize, IoError> {
        if operation.is_write() && !self.controller.config().writeable {
            return Err(IoError::ReadOnly);
        }
        if operation == Operation::Sync {
            return Ok(0);
        }
        if operation == Operation::Trim && !self.write_zeroes {
            return Err(IoError::Unsupported(operation));
        }
        if count == 0 {
            return Err(IoError::Empty);
        }

        let block_size = self.namespace.block_size as u64;
        let bytes = count as u64 * block_size;
        let max = if operation.has_payload() {
            self.max_transfer_bytes as u64
        } else {
            MAX_BLOCKS_PER_COMMAND * block_size
        };
        if bytes > max {
            return Err(IoError::TooLarge { bytes, max });
        }

        let past_end = lba
            .checked_add(count as u64)
            .is_none_or(|end| end > self.namespace.block_count);
        if past_end {
            return Err(IoError::OutOfRange { lba, count });
        }

        let bytes = bytes as usize;
        if operation.has_payload() && buffer_len < bytes {
            return Err(IoError::BufferTooSmall {
                len: buffer_len,
                needed: bytes,
            });
        }
        Ok(bytes)
    }

    fn submit(
        &mut self,
        operation: Operation,
        lba: u64,
        count: u32,
        data: &[u8],
        buffer_len: usize,
        tag: T,
    ) -> Result<(), BlockError> {
        let bytes = self.validate(operation, lba, count, buffer_len)?;

        // one slot per ring entry, so a free slot implies a free ring entry
        let cid = self.requests.free_slot().ok_or(Congestion::Slots)?;
        if let Some((other, request)) = self.requests.find_overlap(lba, count) {
            if self.controller.config().verbose.checks {
                info!(
                    "{:?} {}+{} overlaps in-flight {:?} {}+{} (cid {})",
                    operation, lba, count, request.operation, request.lba, request.count, other
                );
            }
            return Err(Congestion::Overlap.into());
        }

        let (payload, list, prp2) = if operation.has_payload() {
            let (mut payload, list, prp2) = self.map_payload(bytes)?;
            if operation == Operation::Write {
                payload.as_mut_slice()[..bytes].copy_from_slice(&data[..bytes]);
            }
            (Some(payload), list, prp2)
        } else {
            (None, None, 0)
        };
        let prp1 = payload.as_ref().map_or(0, |buffer| buffer.phys_addr().as_u64());

        let Some(command) = self.controller.io_command(IO_QUEUE, cid) else {
            // ring and slot table out of step
            self.pools.release(payload, list);
            return Err(Congestion::QueueFull.into());
        };
        command.set_opcode(operation.opcode());
        if operation != Operation::Sync {
            command.set_lba(lba);
            command.set_block_count(count);
        }
        command.prp1 = prp1;
        command.prp2 = prp2;

        self.requests.insert(
            cid,
            Request {
                operation,
                lba,
                count,
                bytes,
                tag,
                payload,
                list,
            },
        );
        self.controller.commit_io(IO_QUEUE);

        if self.controller.config().verbose.io {
            info!(
                "submit cid {}: {:?} lba {} count {} prp1 {:#x} prp2 {:#x}",
                cid, operation, lba, count, prp1, prp2
            );
        }
        Ok(())
    }

    /// Payload buffer for `bytes` and the PRP2 value describing it. Past two
    /// pages PRP2 points at a list page holding every page after the first.
    fn map_payload(
        &mut self,
        bytes: usize,
    ) -> Result<(DmaBuffer, Option<DmaBuffer>, u64), Congestion> {
        let payload = self
            .pools
            .payload
            .alloc(bytes)
            .ok_or(Congestion::PayloadDma)?;
        let pages = payload.pages();

        match pages {
            1 => Ok((payload, None, 0)),
            2 => {
                let prp2 = payload.page_phys(1).as_u64();
                Ok((payload, None, prp2))
            }
            _ => {
                let Some(mut list) = self.pools.lists.alloc(PAGE_SIZE) else {
                    self.pools.payload.free(payload);
                    return Err(Congestion::ListDma);
                };
                debug_assert!(pages - 1 <= PRP_ENTRIES_PER_PAGE);
                for (entry, page) in list.as_mut_words().iter_mut().zip(1..pages) {
                    *entry = payload.page_phys(page).as_u64();
                }
                let prp2 = list.phys_addr().as_u64();
                Ok((payload, Some(list), prp2))
            }
        }
    }

    /// Interrupt entry point: mask, drain every posted completion, unmask.
    ///
    /// `ack` runs once per finished request, successful or not, after the
    /// request's DMA memory has been released. Returns how many requests
    /// finished.
    pub fn handle_interrupt(&mut self, mut ack: impl FnMut(Completion<T>)) -> usize {
        self.controller.mask_intr();

        let verbose_io = self.controller.config().verbose.io;
        let mut finished = 0;
        for completion in self.controller.drain_io_completions(IO_QUEUE) {
            let Some(request) = self.requests.take(completion.request_id()) else {
                warn!("completion without request: {}", completion);
                continue;
            };

            if !completion.is_success() {
                warn!(
                    "{:?} of {} blocks at lba {} failed: {}",
                    request.operation,
                    request.count,
                    request.lba,
                    completion.status()
                );
            } else if verbose_io {
                info!("complete {}", completion);
            }

            ack(request.finish(completion.status(), &mut self.pools));
            finished += 1;
        }

        self.controller.clear_intr();
        finished
    }
}

/// [`BlockDriver`] behind a spin lock, for setups where completions are
/// drained on another thread than the one submitting.
///
/// Submissions hold the lock for their whole duration. Draining holds it only
/// while completions are collected; acknowledgements run unlocked, so an
/// acknowledgement may submit the next request.
pub struct SharedBlockDriver<M, D, T> {
    inner: Mutex<BlockDriver<M, D, T>>,
}

impl<M: RegisterIo, D: Delayer, T: AsMut<[u8]>> SharedBlockDriver<M, D, T> {
    pub fn new(driver: BlockDriver<M, D, T>) -> Self {
        Self {
            inner: Mutex::new(driver),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockDriver<M, D, T>> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> BlockDriver<M, D, T> {
        self.inner.into_inner()
    }

    pub fn block_size(&self) -> u32 {
        self.lock().block_size()
    }

    pub fn block_count(&self) -> u64 {
        self.lock().block_count()
    }

    pub fn read(&self, lba: u64, count: u32, tag: T) -> Result<(), BlockError> {
        self.lock().read(lba, count, tag)
    }

    pub fn write(&self, lba: u64, count: u32, data: &[u8], tag: T) -> Result<(), BlockError> {
        self.lock().write(lba, count, data, tag)
    }

    pub fn sync(&self, tag: T) -> Result<(), BlockError> {
        self.lock().sync(tag)
    }

    pub fn trim(&self, lba: u64, count: u32, tag: T) -> Result<(), BlockError> {
        self.lock().trim(lba, count, tag)
    }

    pub fn handle_interrupt(&self, ack: impl FnMut(Completion<T>)) -> usize {
        let mut finished = Vec::new();
        self.lock()
            .handle_interrupt(|completion| finished.push(completion));

        let count = finished.len();
        finished.into_iter().for_each(ack);
        count
    }
}
