//! In-flight request bookkeeping.
//!
//! Every accepted request occupies one slot of the tracker. The slot index is
//! the NVMe command id, so a completion finds its request without a search.

use alloc::vec::Vec;

use super::{Completion, Operation};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::nvme::commands::CommandStatus;

/// Payload and PRP list allocators.
#[derive(Debug)]
pub(crate) struct DmaPools {
    pub payload: DmaAllocator,
    pub lists: DmaAllocator,
}

impl DmaPools {
    pub fn release(&mut self, payload: Option<DmaBuffer>, list: Option<DmaBuffer>) {
        if let Some(payload) = payload {
            self.payload.free(payload);
        }
        if let Some(list) = list {
            self.lists.free(list);
        }
    }
}

/// One accepted request, alive until its completion has been processed.
#[derive(Debug)]
pub(crate) struct Request<T> {
    pub operation: Operation,
    pub lba: u64,
    pub count: u32,
    /// Transfer length in bytes
    pub bytes: usize,
    pub tag: T,
    pub payload: Option<DmaBuffer>,
    pub list: Option<DmaBuffer>,
}

impl<T> Request<T> {
    /// Blocks `[lba, lba + count)` intersect this request's range.
    pub fn overlaps(&self, lba: u64, count: u32) -> bool {
        if self.count == 0 || count == 0 {
            return false;
        }
        let end = self.lba + self.count as u64;
        lba < end && self.lba < lba + count as u64
    }
}

impl<T: AsMut<[u8]>> Request<T> {
    /// Copy read data into the caller's buffer, give the DMA memory back and
    /// build the acknowledgement.
    pub fn finish(mut self, status: CommandStatus, pools: &mut DmaPools) -> Completion<T> {
        if status.is_success() && self.operation == Operation::Read {
            let target = self.tag.as_mut().get_mut(..self.bytes);
            if let (Some(target), Some(payload)) = (target, &self.payload) {
                target.copy_from_slice(&payload.as_slice()[..self.bytes]);
            }
        }
        pools.release(self.payload, self.list);

        Completion {
            tag: self.tag,
            operation: self.operation,
            lba: self.lba,
            count: self.count,
            status,
        }
    }
}

/// Fixed table of request slots for one submission queue.
#[derive(Debug)]
pub(crate) struct RequestTracker<T> {
    sq_id: u16,
    slots: Vec<Option<Request<T>>>,
    live: usize,
}

impl<T> RequestTracker<T> {
    pub fn new(sq_id: u16, capacity: usize) -> Self {
        Self {
            sq_id,
            slots: (0..capacity).map(|_| None).collect(),
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Lowest free slot; its index is the command id.
    pub fn free_slot(&self) -> Option<u16> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|index| index as u16)
    }

    pub fn insert(&mut self, cid: u16, request: Request<T>) {
        let slot = &mut self.slots[cid as usize];
        debug_assert!(slot.is_none(), "command id {cid} already in flight");
        *slot = Some(request);
        self.live += 1;
    }

    /// First in-flight request whose range intersects `[lba, lba + count)`.
    pub fn find_overlap(&self, lba: u64, count: u32) -> Option<(u16, &Request<T>)> {
        self.slots.iter().enumerate().find_map(|(cid, slot)| {
            slot.as_ref()
                .filter(|request| request.overlaps(lba, count))
                .map(|request| (cid as u16, request))
        })
    }

    /// Remove the request a completion refers to: submission queue id in the
    /// upper half of `request_id`, command id in the lower.
    pub fn take(&mut self, request_id: u32) -> Option<Request<T>> {
        if (request_id >> 16) as u16 != self.sq_id {
            return None;
        }
        let request = self.slots.get_mut((request_id & 0xFFFF) as usize)?.take()?;
        self.live -= 1;
        Some(request)
    }
}
