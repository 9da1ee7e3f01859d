//! Submission and completion rings.
//!
//! Each ring is a fixed array of plain-data entries living in a DMA buffer the
//! controller reads from (submission) or writes to (completion). Slots are
//! addressed by index into a bounds-checked slice; the software-owned cursor of
//! each ring (`tail` for submission, `head` for completion) is only mutated
//! here.

use core::sync::atomic::{Ordering, fence};

use x86_64::PhysAddr;

use super::commands::{NvmeCommand, NvmeCompletion};
use crate::dma::DmaBuffer;

pub const SQE_LEN_LOG2: u32 = 6;
pub const SQE_LEN: usize = 1 << SQE_LEN_LOG2;
pub const CQE_LEN_LOG2: u32 = 4;
pub const CQE_LEN: usize = 1 << CQE_LEN_LOG2;

/// Submission queue
#[derive(Debug)]
pub struct SubmissionQueue {
    id: u16,
    buffer: DmaBuffer,
    entries: u16,
    tail: u16,
}

impl SubmissionQueue {
    pub fn new(id: u16, buffer: DmaBuffer, entries: u16) -> Self {
        assert!(entries >= 2, "a ring needs at least two entries");
        assert!(buffer.len() >= entries as usize * SQE_LEN);
        Self {
            id,
            buffer,
            entries,
            tail: 0,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.buffer.phys_addr()
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    pub fn tail(&self) -> u16 {
        self.tail
    }

    fn ring(&mut self) -> &mut [NvmeCommand] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.buffer.virt_addr().as_mut_ptr::<NvmeCommand>(),
                self.entries as usize,
            )
        }
    }

    /// Zero the slot at `tail`, advance `tail` and hand the slot out for
    /// filling. The caller checks for a full ring first.
    pub fn next_slot(&mut self) -> &mut NvmeCommand {
        let index = self.tail as usize;
        self.tail = (self.tail + 1) % self.entries;

        let slot = &mut self.ring()[index];
        *slot = NvmeCommand::new();
        slot
    }

    pub fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }

    /// Make filled slots visible before the tail doorbell is written.
    pub fn publish(&self) -> u16 {
        fence(Ordering::SeqCst);
        self.tail
    }
}

/// Completion queue
#[derive(Debug)]
pub struct CompletionQueue {
    id: u16,
    buffer: DmaBuffer,
    entries: u16,
    head: u16,
    phase: bool,
}

impl CompletionQueue {
    pub fn new(id: u16, buffer: DmaBuffer, entries: u16) -> Self {
        assert!(entries >= 2, "a ring needs at least two entries");
        assert!(buffer.len() >= entries as usize * CQE_LEN);
        Self {
            id,
            buffer,
            entries,
            head: 0,
            phase: true,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.buffer.phys_addr()
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    /// Phase value that marks a fresh entry on the current pass.
    pub fn phase(&self) -> bool {
        self.phase
    }

    fn ring(&self) -> &[NvmeCompletion] {
        unsafe {
            core::slice::from_raw_parts(
                self.buffer.virt_addr().as_ptr::<NvmeCompletion>(),
                self.entries as usize,
            )
        }
    }

    /// Entry at `head` if the controller has posted it on the current pass.
    pub fn peek(&self) -> Option<NvmeCompletion> {
        let slot: *const NvmeCompletion = &self.ring()[self.head as usize];
        let completion = unsafe { core::ptr::read_volatile(slot) };

        if !completion.is_valid(self.phase) {
            return None;
        }
        fence(Ordering::Acquire);
        Some(completion)
    }

    /// Consume the entry at `head`, flipping the phase on wrap.
    pub fn advance(&mut self) {
        self.head += 1;
        if self.head >= self.entries {
            self.head = 0;
            self.phase = !self.phase;
        }
    }

    pub fn pop(&mut self) -> Option<NvmeCompletion> {
        let completion = self.peek()?;
        self.advance();
        Some(completion)
    }

    pub fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }
}

/// A submission ring and the completion ring it reports to.
#[derive(Debug)]
pub struct QueuePair {
    pub sq: SubmissionQueue,
    pub cq: CompletionQueue,
}

impl QueuePair {
    pub fn new(sq: SubmissionQueue, cq: CompletionQueue) -> Self {
        debug_assert_eq!(sq.entries(), cq.entries());
        Self { sq, cq }
    }

    /// Usable slots: one entry always stays empty to tell full from empty.
    pub fn capacity(&self) -> u16 {
        self.sq.entries() - 1
    }

    /// The ring is full when advancing `tail` would reach the completion `head`.
    pub fn is_full(&self) -> bool {
        (self.sq.tail() + 1) % self.sq.entries() == self.cq.head()
    }

    /// Give back the ring memory (submission, completion).
    pub fn into_buffers(self) -> (DmaBuffer, DmaBuffer) {
        (self.sq.into_buffer(), self.cq.into_buffer())
    }
}
