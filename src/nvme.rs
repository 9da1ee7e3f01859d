//! NVMe (Non-Volatile Memory Express) controller layer.
//!
//! Register access, queue rings, command encoding and the admin-side
//! controller lifecycle. The block front end in [`crate::block`] sits on top.

pub mod commands;
pub mod controller;
pub mod queue;
pub mod registers;


pub use commands::{CommandStatus, NvmeCommand, NvmeCompletion};
pub use controller::{
    Controller, ControllerInfo, Delayer, IoCompletions, Namespace, NvmeError, SpinDelayer,
};
pub use registers::{Capabilities, NvmeRegisters, Version};
