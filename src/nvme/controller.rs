//! NVMe controller management
//!
//! Bring-up (reset, admin queues, enable), Identify, I/O queue creation and
//! the submit/drain primitives the block front end drives I/O through.
//! Admin commands are issued one at a time and busy-polled to completion;
//! that only happens during startup, never on the I/O path.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use super::commands::{
    CommandStatus, IDENTIFY_LEN, IdentifyController, IdentifyNamespace, NvmeCommand,
    NvmeCompletion, parse_namespace_list,
};
use super::queue::{
    CQE_LEN, CQE_LEN_LOG2, CompletionQueue, QueuePair, SQE_LEN, SQE_LEN_LOG2, SubmissionQueue,
};
use super::registers::{ControllerStatus, NvmeRegisters, Version};
use crate::config::{DriverConfig, MAX_IO_LEN};
use crate::dma::{DmaAllocator, DmaBuffer, PAGE_SIZE};
use crate::mmio::RegisterIo;
use crate::{debug, error, info, warn};

pub const ADMIN_QUEUE: u16 = 0;

/// Admin command identifiers. Only one admin command is outstanding at a time.
pub const IDENTIFY_CID: u16 = 0x666;
pub const NSLIST_CID: u16 = IDENTIFY_CID + 1;
pub const QUERYNS_CID: u16 = IDENTIFY_CID + 2;
pub const CREATE_IO_CQ_CID: u16 = IDENTIFY_CID + 3;
pub const CREATE_IO_SQ_CID: u16 = IDENTIFY_CID + 4;

/// CC.MPS for 4 KiB memory pages
const MPS_4K: u32 = 0;
/// AQA.ASQS/ACQS are 12 bits wide.
const MAX_ADMIN_QUEUE_ENTRIES: u16 = 4096;
/// CDW12.NLB is a 0-based 16-bit count.
const MAX_BLOCKS_PER_COMMAND: usize = 1 << 16;
/// Interrupt vector 0
const INTR_VECTOR_0: u32 = 1;

/// NVMe controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NvmeError {
    #[error("timed out waiting for controller ready={ready}")]
    ReadyTimeout { ready: bool },
    #[error("fatal controller status")]
    ControllerFatal,
    #[error("controller does not support 4 KiB memory pages")]
    UnsupportedPageSize,
    #[error("controller not initialized")]
    NotInitialized,
    #[error("admin command {cid:#x} timed out")]
    CommandTimeout { cid: u16 },
    #[error("admin command {cid:#x} failed: {status}")]
    CommandFailed { cid: u16, status: CommandStatus },
    #[error("admin submission queue full")]
    QueueFull,
    #[error("DMA allocation failed")]
    AllocationFailed,
    #[error("no active namespace")]
    NoNamespace,
    #[error("namespace {0} has unusable geometry")]
    InvalidNamespace(u32),
    #[error("queue id {0} is invalid or already in use")]
    InvalidQueue(u16),
    #[error("I/O queue {0} not set up")]
    NoIoQueue(u16),
}

/// Microsecond sleeps for the bounded polling loops.
pub trait Delayer {
    fn usleep(&mut self, us: u64);
}

/// Busy-wait delay calibrated in `spin_loop` iterations per microsecond.
#[derive(Debug, Clone, Copy)]
pub struct SpinDelayer {
    spins_per_us: u64,
}

impl SpinDelayer {
    pub const fn new(spins_per_us: u64) -> Self {
        Self { spins_per_us }
    }
}

impl Default for SpinDelayer {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Delayer for SpinDelayer {
    fn usleep(&mut self, us: u64) {
        for _ in 0..us.saturating_mul(self.spins_per_us) {
            core::hint::spin_loop();
        }
    }
}

/// What Identify Controller told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub version: Version,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub mdts: u8,
    /// Largest single transfer, after MDTS and the PRP shape.
    pub max_transfer_bytes: usize,
    pub namespaces: u32,
    pub volatile_write_cache: bool,
    pub write_zeroes: bool,
}

/// Geometry of the namespace the driver serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    pub nsid: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub max_request_blocks: u32,
}

/// One NVMe controller behind a register window.
#[derive(Debug)]
pub struct Controller<M, D> {
    regs: NvmeRegisters<M>,
    delayer: D,
    /// Backing for rings and identify pages
    dma: DmaAllocator,
    config: DriverConfig,
    admin: Option<QueuePair>,
    io_queues: Vec<QueuePair>,
    info: Option<ControllerInfo>,
    namespace: Option<Namespace>,
}

impl<M: RegisterIo, D: Delayer> Controller<M, D> {
    pub fn new(mmio: M, delayer: D, dma: DmaAllocator, config: DriverConfig) -> Self {
        Self {
            regs: NvmeRegisters::new(mmio),
            delayer,
            dma,
            config,
            admin: None,
            io_queues: Vec::new(),
            info: None,
            namespace: None,
        }
    }

    pub fn registers(&self) -> &NvmeRegisters<M> {
        &self.regs
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn dma(&self) -> &DmaAllocator {
        &self.dma
    }

    /// Populated by [`Controller::identify`].
    pub fn info(&self) -> Option<&ControllerInfo> {
        self.info.as_ref()
    }

    /// Populated by [`Controller::identify`].
    pub fn namespace(&self) -> Option<&Namespace> {
        self.namespace.as_ref()
    }

    /// Entries per I/O queue: the configured count clamped to CAP.MQES + 1,
    /// rounded down to a power of two.
    pub fn max_io_entries(&self) -> u16 {
        let supported = self.regs.capabilities().max_queue_entries().min(u16::MAX as u32) as u16;
        let entries = self.config.max_io_entries.min(supported).max(2);
        1 << entries.ilog2()
    }

    pub fn max_transfer_bytes(&self) -> usize {
        match &self.info {
            Some(info) => info.max_transfer_bytes,
            None => self.transfer_limit(0),
        }
    }

    /// Reset the controller, set up the admin queues and enable it again.
    pub fn init(&mut self) -> Result<(), NvmeError> {
        let cap = self.regs.capabilities();
        if self.config.verbose.regs {
            info!("CAP: {:#018x}", cap.0);
            info!(
                "  mqes={} cqr={} to={}ms dstrd={} css={:#x} mps={}..{}",
                cap.max_queue_entries(),
                cap.contiguous_queues_required(),
                cap.timeout_ms(),
                cap.doorbell_stride(),
                cap.command_sets(),
                cap.min_page_size(),
                cap.max_page_size()
            );
            info!("VS: {}", self.regs.version());
        }
        if cap.mpsmin() != 0 {
            return Err(NvmeError::UnsupportedPageSize);
        }

        self.regs.mask_interrupts(INTR_VECTOR_0);
        self.regs.disable();
        self.wait_for_ready(false)?;
        self.release_queues();

        self.regs.configure(MPS_4K, SQE_LEN_LOG2, CQE_LEN_LOG2);
        self.setup_admin()?;

        self.regs.enable();
        self.wait_for_ready(true)?;

        info!("NVMe controller {} enabled", self.regs.version());
        Ok(())
    }

    fn setup_admin(&mut self) -> Result<(), NvmeError> {
        let supported = self.regs.capabilities().max_queue_entries().min(u16::MAX as u32) as u16;
        let entries = self
            .config
            .max_admin_entries
            .min(MAX_ADMIN_QUEUE_ENTRIES)
            .min(supported)
            .max(2);

        let (sq_buffer, cq_buffer) = self.alloc_ring_pair(entries)?;
        self.regs.set_admin_queue_attributes(entries, entries);
        self.regs.set_admin_sq_base(sq_buffer.phys_addr().as_u64());
        self.regs.set_admin_cq_base(cq_buffer.phys_addr().as_u64());

        if self.config.verbose.mem {
            info!(
                "admin queues: {} entries, SQ={:#x} CQ={:#x}",
                entries,
                sq_buffer.phys_addr().as_u64(),
                cq_buffer.phys_addr().as_u64()
            );
        }

        self.admin = Some(QueuePair::new(
            SubmissionQueue::new(ADMIN_QUEUE, sq_buffer, entries),
            CompletionQueue::new(ADMIN_QUEUE, cq_buffer, entries),
        ));
        Ok(())
    }

    fn alloc_ring_pair(&mut self, entries: u16) -> Result<(DmaBuffer, DmaBuffer), NvmeError> {
        let sq_buffer = self
            .dma
            .alloc(entries as usize * SQE_LEN)
            .ok_or(NvmeError::AllocationFailed)?;
        match self.dma.alloc(entries as usize * CQE_LEN) {
            Some(cq_buffer) => Ok((sq_buffer, cq_buffer)),
            None => {
                self.dma.free(sq_buffer);
                Err(NvmeError::AllocationFailed)
            }
        }
    }

    /// Drop every ring; only valid while the controller is disabled.
    fn release_queues(&mut self) {
        let pairs = self.admin.take().into_iter().chain(self.io_queues.drain(..));
        for pair in pairs {
            let (sq_buffer, cq_buffer) = pair.into_buffers();
            self.dma.free(sq_buffer);
            self.dma.free(cq_buffer);
        }
    }

    /// Poll CSTS.RDY until it matches `ready`, spreading CAP.TO over the
    /// configured number of attempts.
    fn wait_for_ready(&mut self, ready: bool) -> Result<(), NvmeError> {
        let attempts = self.config.ready_poll_attempts.max(1);
        let delay_us = self.regs.capabilities().timeout_ms() * 1000 / attempts as u64;

        for _ in 0..attempts {
            let status = self.regs.status();
            if status.contains(ControllerStatus::CFS) {
                error!("fatal controller status");
                return Err(NvmeError::ControllerFatal);
            }
            if status.contains(ControllerStatus::RDY) == ready {
                return Ok(());
            }
            self.delayer.usleep(delay_us);
        }

        error!("controller not {} in time", if ready { "ready" } else { "disabled" });
        Err(NvmeError::ReadyTimeout { ready })
    }

    /// Submit one admin command and poll for its completion.
    fn admin_command(
        &mut self,
        mut command: NvmeCommand,
        cid: u16,
    ) -> Result<NvmeCompletion, NvmeError> {
        let admin = self.admin.as_mut().ok_or(NvmeError::NotInitialized)?;
        if admin.is_full() {
            return Err(NvmeError::QueueFull);
        }

        command.set_command_id(cid);
        *admin.sq.next_slot() = command;
        let tail = admin.sq.publish();
        self.regs.ring_sq_doorbell(ADMIN_QUEUE, tail);

        self.wait_for_admin(cid)
    }

    fn wait_for_admin(&mut self, cid: u16) -> Result<NvmeCompletion, NvmeError> {
        for _ in 0..self.config.admin_poll_attempts {
            let admin = self.admin.as_mut().ok_or(NvmeError::NotInitialized)?;

            if let Some(completion) = admin.cq.pop() {
                self.regs.ring_cq_doorbell(ADMIN_QUEUE, admin.cq.head());
                if completion.cid != cid {
                    warn!("stray admin completion {}", completion);
                    continue;
                }
                if !completion.is_success() {
                    error!("admin command {:#x} failed: {}", cid, completion);
                    return Err(NvmeError::CommandFailed {
                        cid,
                        status: completion.status(),
                    });
                }
                return Ok(completion);
            }

            self.delayer.usleep(self.config.admin_poll_delay_us);
        }

        error!("admin command {:#x} timed out", cid);
        Err(NvmeError::CommandTimeout { cid })
    }

    /// Identify the controller and its first active namespace.
    pub fn identify(&mut self) -> Result<(), NvmeError> {
        let mut page = self
            .dma
            .alloc(IDENTIFY_LEN)
            .ok_or(NvmeError::AllocationFailed)?;
        let result = self.identify_into(&mut page);
        self.dma.free(page);
        let (info, namespace) = result?;

        info!(
            "NVMe {} serial '{}' model '{}' firmware '{}'",
            info.version, info.serial, info.model, info.firmware
        );
        info!(
            "namespace {}: {} blocks of {} bytes, up to {} blocks per request",
            namespace.nsid, namespace.block_count, namespace.block_size, namespace.max_request_blocks
        );

        self.info = Some(info);
        self.namespace = Some(namespace);
        Ok(())
    }

    fn identify_into(
        &mut self,
        page: &mut DmaBuffer,
    ) -> Result<(ControllerInfo, Namespace), NvmeError> {
        let addr = page.phys_addr().as_u64();

        self.admin_command(NvmeCommand::identify_controller(addr), IDENTIFY_CID)?;
        let controller = IdentifyController::parse(page.as_slice());
        if self.config.verbose.identify {
            info!("{:#?}", controller);
        }

        let namespaces = if controller.supports_namespace_management() {
            page.as_mut_slice().fill(0);
            self.admin_command(NvmeCommand::identify_namespace_list(addr), NSLIST_CID)?;
            parse_namespace_list(page.as_slice())
        } else {
            vec![1]
        };
        if self.config.verbose.identify {
            info!("active namespaces: {:?}", namespaces);
        }

        let nsid = *namespaces.first().ok_or(NvmeError::NoNamespace)?;
        if namespaces.len() > 1 {
            warn!(
                "{} namespaces reported, only namespace {} is used",
                namespaces.len(),
                nsid
            );
        }

        page.as_mut_slice().fill(0);
        self.admin_command(NvmeCommand::identify_namespace(nsid, addr), QUERYNS_CID)?;
        let identify = IdentifyNamespace::parse(page.as_slice());
        if self.config.verbose.identify {
            info!("{:#?}", identify);
        }

        let max_transfer_bytes = self.transfer_limit(controller.mdts);
        let block_size = identify
            .lba_size()
            .filter(|&size| size != 0 && size as usize <= max_transfer_bytes)
            .ok_or(NvmeError::InvalidNamespace(nsid))?;
        if identify.nsze == 0 {
            return Err(NvmeError::InvalidNamespace(nsid));
        }

        let max_request_blocks =
            (max_transfer_bytes / block_size as usize).min(MAX_BLOCKS_PER_COMMAND) as u32;

        let info = ControllerInfo {
            version: self.regs.version(),
            write_zeroes: controller.supports_write_zeroes(),
            volatile_write_cache: controller.vwc & 1 != 0,
            serial: controller.sn,
            model: controller.mn,
            firmware: controller.fr,
            mdts: controller.mdts,
            max_transfer_bytes,
            namespaces: controller.nn,
        };
        let namespace = Namespace {
            nsid,
            block_size,
            block_count: identify.nsze,
            max_request_blocks,
        };
        Ok((info, namespace))
    }

    /// Transfer limit: configured size, capped by the PRP shape and by MDTS
    /// (2^mdts pages) when the controller reports one.
    fn transfer_limit(&self, mdts: u8) -> usize {
        let limit = self.config.max_transfer_bytes.min(MAX_IO_LEN);
        if mdts == 0 {
            return limit;
        }
        let mdts_bytes = 1usize
            .checked_shl(mdts as u32)
            .and_then(|pages| pages.checked_mul(PAGE_SIZE))
            .unwrap_or(usize::MAX);
        limit.min(mdts_bytes)
    }

    /// Create I/O completion queue `cq_id` and submission queue `sq_id` bound to it.
    pub fn setup_io(&mut self, cq_id: u16, sq_id: u16) -> Result<(), NvmeError> {
        if cq_id == ADMIN_QUEUE || sq_id == ADMIN_QUEUE {
            return Err(NvmeError::InvalidQueue(ADMIN_QUEUE));
        }
        let in_use = self
            .io_queues
            .iter()
            .any(|pair| pair.sq.id() == sq_id || pair.cq.id() == cq_id);
        if in_use {
            return Err(NvmeError::InvalidQueue(sq_id));
        }

        let entries = self.max_io_entries();
        let (sq_buffer, cq_buffer) = self.alloc_ring_pair(entries)?;
        let cq_addr = cq_buffer.phys_addr().as_u64();
        let sq_addr = sq_buffer.phys_addr().as_u64();

        let created = self
            .admin_command(
                NvmeCommand::create_io_cq(cq_id, entries, cq_addr, 0),
                CREATE_IO_CQ_CID,
            )
            .and_then(|_| {
                self.admin_command(
                    NvmeCommand::create_io_sq(sq_id, cq_id, entries, sq_addr),
                    CREATE_IO_SQ_CID,
                )
            });
        if let Err(err) = created {
            self.dma.free(sq_buffer);
            self.dma.free(cq_buffer);
            return Err(err);
        }

        if self.config.verbose.mem {
            info!(
                "I/O queue {}: SQ={:#x} CQ={:#x} (cq {})",
                sq_id, sq_addr, cq_addr, cq_id
            );
        }
        info!("I/O queue {}: {} entries", sq_id, entries);

        self.io_queues.push(QueuePair::new(
            SubmissionQueue::new(sq_id, sq_buffer, entries),
            CompletionQueue::new(cq_id, cq_buffer, entries),
        ));
        Ok(())
    }

    fn io_pair(&self, qid: u16) -> Option<&QueuePair> {
        self.io_queues.iter().find(|pair| pair.sq.id() == qid)
    }

    /// Commands queue `qid` can hold at once, one less than its ring size.
    pub fn io_queue_capacity(&self, qid: u16) -> Option<u16> {
        self.io_pair(qid).map(QueuePair::capacity)
    }

    pub fn io_queue_full(&self, qid: u16) -> bool {
        self.io_pair(qid).is_none_or(QueuePair::is_full)
    }

    /// Next free submission slot of queue `qid`, zeroed and prefilled with
    /// `cid` and the namespace id. `None` means the ring is full (or `qid`
    /// was never set up): back off and retry after completions drain.
    pub fn io_command(&mut self, qid: u16, cid: u16) -> Option<&mut NvmeCommand> {
        let nsid = self.namespace.as_ref().map_or(0, |ns| ns.nsid);
        let pair = self.io_queues.iter_mut().find(|pair| pair.sq.id() == qid)?;
        if pair.is_full() {
            return None;
        }

        let slot = pair.sq.next_slot();
        slot.set_command_id(cid);
        slot.nsid = nsid;
        Some(slot)
    }

    /// Hand every slot filled since the last commit to the controller.
    pub fn commit_io(&mut self, qid: u16) {
        match self.io_pair(qid) {
            Some(pair) => {
                let tail = pair.sq.publish();
                self.regs.ring_sq_doorbell(qid, tail);
            }
            None => {
                warn!("commit on unknown I/O queue {}", qid);
            }
        }
    }

    /// Completions the controller has posted for queue `qid` in the current phase.
    pub fn drain_io_completions(&mut self, qid: u16) -> IoCompletions<'_, M> {
        IoCompletions {
            regs: &self.regs,
            pair: self.io_queues.iter_mut().find(|pair| pair.sq.id() == qid),
        }
    }

    /// Visit every pending completion of queue `qid`; returns how many there were.
    pub fn handle_io_completions(
        &mut self,
        qid: u16,
        mut handler: impl FnMut(NvmeCompletion),
    ) -> usize {
        let mut handled = 0;
        for completion in self.drain_io_completions(qid) {
            handler(completion);
            handled += 1;
        }
        handled
    }

    /// Mask the controller interrupt for the length of a drain pass.
    pub fn mask_intr(&self) {
        self.regs.mask_interrupts(INTR_VECTOR_0);
    }

    /// Unmask the controller interrupt.
    pub fn clear_intr(&self) {
        self.regs.unmask_interrupts(INTR_VECTOR_0);
    }
}

/// Drained entries of one I/O completion ring.
///
/// Every yielded entry has already been released: `head` advanced (flipping
/// the phase on wrap) and the head doorbell written, one entry at a time.
/// Dropping the iterator early leaves the rest for the next pass.
pub struct IoCompletions<'a, M> {
    regs: &'a NvmeRegisters<M>,
    pair: Option<&'a mut QueuePair>,
}

impl<M: RegisterIo> Iterator for IoCompletions<'_, M> {
    type Item = NvmeCompletion;

    fn next(&mut self) -> Option<NvmeCompletion> {
        let pair = self.pair.as_mut()?;
        let completion = pair.cq.pop()?;
        self.regs.ring_cq_doorbell(pair.cq.id(), pair.cq.head());
        debug!("I/O completion {}", completion);
        Some(completion)
    }
}
