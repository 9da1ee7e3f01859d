//! Block front end.
//!
//! Turns read/write/sync/trim calls into NVMe I/O commands and hands each
//! finished request back through [`BlockDriver::handle_interrupt`].
//! Submission never blocks: anything the driver cannot take right now is
//! rejected with [`BlockError::Congestion`] and may be retried once
//! completions have drained.

mod driver;
mod request;


use thiserror::Error;

pub use driver::{BlockDriver, SharedBlockDriver};

use crate::nvme::commands::{CommandStatus, opcodes};
use crate::nvme::NvmeError;

/// Kind of block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    /// Flush the volatile write cache.
    Sync,
    /// Zero a block range without transferring data.
    Trim,
}

impl Operation {
    pub fn opcode(self) -> u8 {
        match self {
            Operation::Read => opcodes::NVM_READ,
            Operation::Write => opcodes::NVM_WRITE,
            Operation::Sync => opcodes::NVM_FLUSH,
            Operation::Trim => opcodes::NVM_WRITE_ZEROES,
        }
    }

    /// Moves data through a payload buffer.
    pub fn has_payload(self) -> bool {
        matches!(self, Operation::Read | Operation::Write)
    }

    /// Modifies the medium.
    pub fn is_write(self) -> bool {
        matches!(self, Operation::Write | Operation::Trim)
    }
}

/// Requests refused before reaching the controller. Retrying will not help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("transfer of {bytes} bytes exceeds the {max} byte limit")]
    TooLarge { bytes: u64, max: u64 },
    #[error("{0:?} is not supported by the controller")]
    Unsupported(Operation),
    #[error("zero-length request")]
    Empty,
    #[error("blocks {lba}+{count} lie past the end of the namespace")]
    OutOfRange { lba: u64, count: u32 },
    #[error("device is read-only")]
    ReadOnly,
    #[error("buffer of {len} bytes is too small for {needed}")]
    BufferTooSmall { len: usize, needed: usize },
}

/// Resources that are busy right now; retry after completions drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Congestion {
    #[error("all request slots in use")]
    Slots,
    #[error("submission queue full")]
    QueueFull,
    #[error("payload DMA memory exhausted")]
    PayloadDma,
    #[error("PRP list DMA memory exhausted")]
    ListDma,
    #[error("range overlaps an in-flight request")]
    Overlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
    #[error("request congestion: {0}")]
    Congestion(#[from] Congestion),
}

impl BlockError {
    /// Congestion clears by itself once in-flight requests complete.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlockError::Congestion(_))
    }
}

/// Driver startup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("initialization failed: {0}")]
    InitializationFailed(#[from] NvmeError),
    /// A DMA region cannot back the largest request the driver accepts.
    #[error("{region} DMA region holds {len} bytes, {needed} needed")]
    RegionTooSmall {
        region: &'static str,
        len: usize,
        needed: usize,
    },
}

/// A finished request, handed to the acknowledgement callback.
#[derive(Debug)]
pub struct Completion<T> {
    /// The caller's handle. A successful read has filled the front of its
    /// buffer; every other outcome leaves the buffer untouched.
    pub tag: T,
    pub operation: Operation,
    pub lba: u64,
    pub count: u32,
    pub status: CommandStatus,
}

impl<T> Completion<T> {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
