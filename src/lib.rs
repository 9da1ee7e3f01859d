/*
Copyright © 2024–2025 Mako and JayAndJef

This file is part of locOS.

locOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

locOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with locOS. If not, see
<https://www.gnu.org/licenses/>.
*/

//! NVMe block driver for locOS.
//!
//! Drives a memory-mapped NVMe controller: register-level bring-up, admin and
//! I/O queue pairs, PRP-described DMA transfers and a block front end that
//! turns read/write/sync/trim calls into hardware commands and back.
//!
//! The driver never reaches for globals. The embedding environment hands it a
//! register mapping ([`mmio::RegisterIo`]), DMA backing regions
//! ([`dma::DmaRegion`]) and a [`nvme::Delayer`], and routes the controller's
//! interrupt to [`block::BlockDriver::handle_interrupt`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod macros;

#[doc(hidden)]
pub use log as __log;

pub mod block;
pub mod config;
pub mod dma;
pub mod mmio;
pub mod nvme;

#[cfg(test)]
pub mod testing;

pub use block::{
    BlockDriver, BlockError, Completion, Congestion, DriverError, IoError, Operation,
    SharedBlockDriver,
};
pub use config::{DriverConfig, Verbosity};
pub use dma::{DmaAllocator, DmaBuffer, DmaRegion, PAGE_SIZE};
pub use mmio::{MmioRegion, RegisterIo};
pub use nvme::{Controller, Delayer, NvmeError, SpinDelayer};
