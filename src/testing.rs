//! Test support: identity-mapped DMA backing and a simulated NVMe controller.
//!
//! [`TestMemory`] hands out page-aligned heap memory whose "physical" address
//! is its virtual address, so [`SimController`] can follow queue base
//! addresses and PRP pointers directly.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use std::alloc::{Layout, alloc_zeroed, dealloc};

use x86_64::{PhysAddr, VirtAddr};

use crate::dma::{DmaRegion, PAGE_SIZE};
use crate::mmio::RegisterIo;
use crate::nvme::Delayer;
use crate::nvme::commands::{
    IDENTIFY_LEN, IdentifyController, IdentifyNamespace, LbaFormat, NvmeCommand, NvmeCompletion,
    identify_cns, opcodes,
};
use crate::nvme::registers::{cap_bits, cc_bits, offsets};

/// Status fields (phase bit excluded)
pub mod status {
    pub const SUCCESS: u16 = 0;
    pub const INVALID_OPCODE: u16 = 0x01 << 1;
    pub const INVALID_FIELD: u16 = 0x02 << 1;
    pub const LBA_OUT_OF_RANGE: u16 = 0x80 << 1;
    /// Command specific: completion queue invalid
    pub const INVALID_CQ: u16 = 1 << 9;
    /// Media error: unrecovered read error
    pub const MEDIA_ERROR: u16 = 2 << 9 | 0x81 << 1;
}

/// Page-aligned, zeroed heap memory standing in for a DMA region.
pub struct TestMemory {
    base: *mut u8,
    layout: Layout,
}

impl TestMemory {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages.max(1) * PAGE_SIZE, PAGE_SIZE)
            .expect("test memory layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test memory allocation failed");
        Self { base, layout }
    }

    pub fn region(&self) -> DmaRegion {
        unsafe {
            DmaRegion::new(
                PhysAddr::new(self.base as u64),
                VirtAddr::from_ptr(self.base),
                self.layout.size(),
            )
        }
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Records sleeps instead of waiting.
#[derive(Debug, Default)]
pub struct TestDelayer {
    calls: Cell<u32>,
    slept_us: Cell<u64>,
}

impl TestDelayer {
    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    pub fn slept_us(&self) -> u64 {
        self.slept_us.get()
    }
}

impl Delayer for &TestDelayer {
    fn usleep(&mut self, us: u64) {
        self.calls.set(self.calls.get() + 1);
        self.slept_us.set(self.slept_us.get() + us);
    }
}

/// Shape of the simulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// CAP.MQES (0-based)
    pub mqes: u16,
    /// CAP.TO in 500 ms units
    pub timeout: u8,
    pub dstrd: u8,
    pub mdts: u8,
    pub namespace_management: bool,
    pub namespaces: Vec<u32>,
    /// log2 of the formatted block size
    pub lbads: u8,
    pub block_count: u64,
    pub write_zeroes: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mqes: 1023,
            timeout: 20,
            dstrd: 0,
            mdts: 0,
            namespace_management: false,
            namespaces: vec![1],
            lbads: 12,
            block_count: 1 << 20,
            write_zeroes: true,
        }
    }
}

#[derive(Debug)]
struct SimSq {
    base: u64,
    entries: u16,
    head: u16,
    cqid: u16,
}

#[derive(Debug)]
struct SimCq {
    base: u64,
    entries: u16,
    tail: u16,
    phase: bool,
}

#[derive(Debug, Default)]
struct SimState {
    cc: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    enabled: bool,
    never_ready: bool,
    fatal: bool,
    drop_admin: bool,
    deferred: bool,
    fail_lbas: BTreeSet<u64>,
    sqs: BTreeMap<u16, SimSq>,
    cqs: BTreeMap<u16, SimCq>,
    pending: VecDeque<(u16, NvmeCompletion)>,
    media: BTreeMap<u64, Vec<u8>>,
    admin_log: Vec<NvmeCommand>,
    io_log: Vec<NvmeCommand>,
    cq_doorbells: Vec<(u16, u16)>,
    intms_writes: u32,
    intmc_writes: u32,
    masked: bool,
    flushes: u32,
}

/// In-memory NVMe controller behind a [`RegisterIo`] window.
///
/// Admin commands complete as soon as the tail doorbell is written. I/O
/// commands do too unless deferred mode is on, in which case completions
/// queue up until [`SimController::complete_pending`].
#[derive(Debug, Default)]
pub struct SimController {
    config: SimConfig,
    state: RefCell<SimState>,
}

impl SimController {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: RefCell::default(),
        }
    }

    pub fn block_size(&self) -> usize {
        1 << self.config.lbads
    }

    /// Keep CSTS.RDY clear whatever CC.EN says.
    pub fn set_never_ready(&self, never_ready: bool) {
        self.state.borrow_mut().never_ready = never_ready;
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.state.borrow_mut().fatal = fatal;
    }

    /// Swallow admin commands without completing them.
    pub fn set_drop_admin(&self, drop_admin: bool) {
        self.state.borrow_mut().drop_admin = drop_admin;
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.state.borrow_mut().deferred = deferred;
    }

    /// Fail every read or write touching `lba` with a media error.
    pub fn fail_lba(&self, lba: u64) {
        self.state.borrow_mut().fail_lbas.insert(lba);
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Post up to `count` deferred completions; returns how many were posted.
    pub fn complete_pending(&self, count: usize) -> usize {
        let mut state = self.state.borrow_mut();
        let mut posted = 0;
        while posted < count {
            let Some((cqid, completion)) = state.pending.pop_front() else {
                break;
            };
            state.post(cqid, completion);
            posted += 1;
        }
        posted
    }

    pub fn complete_all(&self) -> usize {
        self.complete_pending(usize::MAX)
    }

    /// Post a completion no command asked for.
    pub fn inject_completion(&self, cqid: u16, sq_id: u16, cid: u16, status: u16) {
        let completion = NvmeCompletion {
            sq_id,
            cid,
            status,
            ..Default::default()
        };
        self.state.borrow_mut().post(cqid, completion);
    }

    pub fn admin_commands(&self) -> Vec<NvmeCommand> {
        self.state.borrow().admin_log.clone()
    }

    pub fn io_commands(&self) -> Vec<NvmeCommand> {
        self.state.borrow().io_log.clone()
    }

    /// Head values written to the completion doorbell of `qid`, in order.
    pub fn cq_doorbells(&self, qid: u16) -> Vec<u16> {
        let state = self.state.borrow();
        state
            .cq_doorbells
            .iter()
            .filter(|(id, _)| *id == qid)
            .map(|(_, head)| *head)
            .collect()
    }

    /// (INTMS writes, INTMC writes)
    pub fn interrupt_writes(&self) -> (u32, u32) {
        let state = self.state.borrow();
        (state.intms_writes, state.intmc_writes)
    }

    pub fn masked(&self) -> bool {
        self.state.borrow().masked
    }

    pub fn flushes(&self) -> u32 {
        self.state.borrow().flushes
    }

    pub fn io_queue_entries(&self, qid: u16) -> Option<u16> {
        self.state.borrow().sqs.get(&qid).map(|sq| sq.entries)
    }

    /// Contents of `count` blocks starting at `lba`; unwritten blocks read as zero.
    pub fn media(&self, lba: u64, count: u64) -> Vec<u8> {
        let state = self.state.borrow();
        let block_size = self.block_size();
        (lba..lba + count)
            .flat_map(|block| match state.media.get(&block) {
                Some(data) => data.clone(),
                None => vec![0; block_size],
            })
            .collect()
    }

    pub fn write_media(&self, lba: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        for (block, chunk) in (lba..).zip(data.chunks(self.block_size())) {
            state.media.insert(block, chunk.to_vec());
        }
    }

    fn capabilities(&self) -> u64 {
        self.config.mqes as u64
            | 1 << cap_bits::CQR_SHIFT
            | (self.config.timeout as u64) << cap_bits::TO_SHIFT
            | (self.config.dstrd as u64) << cap_bits::DSTRD_SHIFT
            | 1 << cap_bits::CSS_SHIFT
    }

    fn controller_status(&self, state: &SimState) -> u32 {
        let mut csts = 0;
        if state.enabled && !state.never_ready {
            csts |= 1;
        }
        if state.fatal {
            csts |= 1 << 1;
        }
        csts
    }

    fn doorbell(&self, state: &mut SimState, offset: usize, value: u32) {
        let stride = 4 << self.config.dstrd;
        let index = (offset - offsets::DOORBELLS) / stride;
        let qid = (index / 2) as u16;

        if index % 2 == 1 {
            state.cq_doorbells.push((qid, value as u16));
        } else {
            self.process_submissions(state, qid, value as u16);
        }
    }

    fn process_submissions(&self, state: &mut SimState, qid: u16, tail: u16) {
        loop {
            let Some(sq) = state.sqs.get_mut(&qid) else {
                return;
            };
            if sq.head == tail {
                return;
            }

            let slot = (sq.base + sq.head as u64 * 64) as *const NvmeCommand;
            let command = unsafe { core::ptr::read_volatile(slot) };
            sq.head = (sq.head + 1) % sq.entries;
            let (sq_head, cqid) = (sq.head, sq.cqid);

            let result = if qid == 0 {
                self.admin(state, &command)
            } else {
                self.io(state, &command)
            };
            let Some(status) = result else {
                continue;
            };

            let completion = NvmeCompletion {
                sq_head,
                sq_id: qid,
                cid: command.command_id(),
                status,
                ..Default::default()
            };
            if qid != 0 && state.deferred {
                state.pending.push_back((cqid, completion));
            } else {
                state.post(cqid, completion);
            }
        }
    }

    fn admin(&self, state: &mut SimState, command: &NvmeCommand) -> Option<u16> {
        state.admin_log.push(*command);
        if state.drop_admin {
            return None;
        }

        let status = match command.opcode() {
            opcodes::ADMIN_IDENTIFY => match self.identify(command) {
                Some(page) => {
                    copy_to_memory(command.prp1, &page);
                    status::SUCCESS
                }
                None => status::INVALID_FIELD,
            },
            opcodes::ADMIN_CREATE_IO_CQ => {
                let qid = command.cdw10 as u16;
                let entries = (command.cdw10 >> 16) as u16 + 1;
                state.cqs.insert(
                    qid,
                    SimCq {
                        base: command.prp1,
                        entries,
                        tail: 0,
                        phase: true,
                    },
                );
                status::SUCCESS
            }
            opcodes::ADMIN_CREATE_IO_SQ => {
                let qid = command.cdw10 as u16;
                let entries = (command.cdw10 >> 16) as u16 + 1;
                let cqid = (command.cdw11 >> 16) as u16;
                if !state.cqs.contains_key(&cqid) {
                    return Some(status::INVALID_CQ);
                }
                state.sqs.insert(
                    qid,
                    SimSq {
                        base: command.prp1,
                        entries,
                        head: 0,
                        cqid,
                    },
                );
                status::SUCCESS
            }
            _ => status::INVALID_OPCODE,
        };
        Some(status)
    }

    fn identify(&self, command: &NvmeCommand) -> Option<Vec<u8>> {
        let mut page = vec![0u8; IDENTIFY_LEN];
        match command.cns() {
            identify_cns::CONTROLLER => {
                put_ascii(&mut page, IdentifyController::SN_OFFSET, IdentifyController::SN_LEN, "SIM0001");
                put_ascii(
                    &mut page,
                    IdentifyController::MN_OFFSET,
                    IdentifyController::MN_LEN,
                    "nvmed simulated controller",
                );
                put_ascii(&mut page, IdentifyController::FR_OFFSET, IdentifyController::FR_LEN, "1.0");
                page[IdentifyController::MDTS_OFFSET] = self.config.mdts;
                if self.config.namespace_management {
                    page[IdentifyController::OACS_OFFSET] = 1 << 3;
                }
                let nn = self.config.namespaces.len() as u32;
                page[IdentifyController::NN_OFFSET..][..4].copy_from_slice(&nn.to_le_bytes());
                if self.config.write_zeroes {
                    page[IdentifyController::ONCS_OFFSET] = 1 << 3;
                }
                page[IdentifyController::VWC_OFFSET] = 1;
            }
            identify_cns::NAMESPACE_LIST => {
                let active = self
                    .config
                    .namespaces
                    .iter()
                    .filter(|&&nsid| nsid > command.nsid)
                    .take(IDENTIFY_LEN / 4);
                for (chunk, nsid) in page.chunks_exact_mut(4).zip(active) {
                    chunk.copy_from_slice(&nsid.to_le_bytes());
                }
            }
            identify_cns::NAMESPACE => {
                if self.config.namespaces.contains(&command.nsid) {
                    let blocks = self.config.block_count.to_le_bytes();
                    page[0x00..0x08].copy_from_slice(&blocks);
                    page[0x08..0x10].copy_from_slice(&blocks);
                    page[0x10..0x18].copy_from_slice(&blocks);
                    page[IdentifyNamespace::NLBAF_OFFSET] = 1;
                    page[IdentifyNamespace::FLBAS_OFFSET] = 1;
                    let formats = [
                        LbaFormat { lbads: 9, ..Default::default() },
                        LbaFormat { lbads: self.config.lbads, ..Default::default() },
                    ];
                    for (index, format) in formats.iter().enumerate() {
                        let offset = IdentifyNamespace::LBAF_OFFSET + index * 4;
                        page[offset..offset + 4].copy_from_slice(&format.to_dword().to_le_bytes());
                    }
                }
            }
            _ => return None,
        }
        Some(page)
    }

    fn io(&self, state: &mut SimState, command: &NvmeCommand) -> Option<u16> {
        state.io_log.push(*command);

        let opcode = command.opcode();
        if opcode == opcodes::NVM_FLUSH {
            state.flushes += 1;
            return Some(status::SUCCESS);
        }
        if ![opcodes::NVM_READ, opcodes::NVM_WRITE, opcodes::NVM_WRITE_ZEROES].contains(&opcode) {
            return Some(status::INVALID_OPCODE);
        }

        let lba = command.lba();
        let count = command.block_count() as u64;
        if lba + count > self.config.block_count {
            return Some(status::LBA_OUT_OF_RANGE);
        }
        if (lba..lba + count).any(|block| state.fail_lbas.contains(&block)) {
            return Some(status::MEDIA_ERROR);
        }

        let block_size = self.block_size();
        let len = count as usize * block_size;
        match opcode {
            opcodes::NVM_READ => {
                let mut data = Vec::with_capacity(len);
                for block in lba..lba + count {
                    match state.media.get(&block) {
                        Some(bytes) => data.extend_from_slice(bytes),
                        None => data.resize(data.len() + block_size, 0),
                    }
                }
                let mut offset = 0;
                for (addr, chunk) in prp_segments(command, len) {
                    copy_to_memory(addr, &data[offset..offset + chunk]);
                    offset += chunk;
                }
            }
            opcodes::NVM_WRITE => {
                let mut data = Vec::with_capacity(len);
                for (addr, chunk) in prp_segments(command, len) {
                    data.extend_from_slice(unsafe {
                        core::slice::from_raw_parts(addr as *const u8, chunk)
                    });
                }
                for (block, bytes) in (lba..).zip(data.chunks(block_size)) {
                    state.media.insert(block, bytes.to_vec());
                }
            }
            _ => {
                for block in lba..lba + count {
                    state.media.remove(&block);
                }
            }
        }
        Some(status::SUCCESS)
    }
}

impl SimState {
    fn post(&mut self, cqid: u16, mut completion: NvmeCompletion) {
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            return;
        };
        completion.status = (completion.status & !1) | cq.phase as u16;
        let slot = (cq.base + cq.tail as u64 * 16) as *mut NvmeCompletion;
        unsafe { core::ptr::write_volatile(slot, completion) };

        cq.tail += 1;
        if cq.tail == cq.entries {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }
}

impl RegisterIo for SimController {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.borrow();
        let cap = self.capabilities();
        match offset {
            offsets::CAP => cap as u32,
            o if o == offsets::CAP + 4 => (cap >> 32) as u32,
            offsets::VS => 0x0001_0400,
            offsets::INTMS | offsets::INTMC => state.masked as u32,
            offsets::CC => state.cc,
            offsets::CSTS => self.controller_status(&state),
            offsets::AQA => state.aqa,
            offsets::ASQ => state.asq as u32,
            o if o == offsets::ASQ + 4 => (state.asq >> 32) as u32,
            offsets::ACQ => state.acq as u32,
            o if o == offsets::ACQ + 4 => (state.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.borrow_mut();
        match offset {
            offsets::INTMS => {
                state.intms_writes += 1;
                state.masked = true;
            }
            offsets::INTMC => {
                state.intmc_writes += 1;
                state.masked = false;
            }
            offsets::CC => {
                let enable = value & cc_bits::EN != 0;
                if enable && !state.enabled {
                    let sq_entries = (state.aqa & 0xfff) as u16 + 1;
                    let cq_entries = ((state.aqa >> 16) & 0xfff) as u16 + 1;
                    let (asq, acq) = (state.asq, state.acq);
                    state.sqs.insert(
                        0,
                        SimSq {
                            base: asq,
                            entries: sq_entries,
                            head: 0,
                            cqid: 0,
                        },
                    );
                    state.cqs.insert(
                        0,
                        SimCq {
                            base: acq,
                            entries: cq_entries,
                            tail: 0,
                            phase: true,
                        },
                    );
                }
                if !enable {
                    state.sqs.clear();
                    state.cqs.clear();
                    state.pending.clear();
                }
                state.cc = value;
                state.enabled = enable;
            }
            offsets::AQA => state.aqa = value,
            offsets::ASQ => state.asq = (state.asq & !0xffff_ffff) | value as u64,
            o if o == offsets::ASQ + 4 => {
                state.asq = (state.asq & 0xffff_ffff) | (value as u64) << 32
            }
            offsets::ACQ => state.acq = (state.acq & !0xffff_ffff) | value as u64,
            o if o == offsets::ACQ + 4 => {
                state.acq = (state.acq & 0xffff_ffff) | (value as u64) << 32
            }
            o if o >= offsets::DOORBELLS => self.doorbell(&mut state, o, value),
            _ => {}
        }
    }
}

fn put_ascii(page: &mut [u8], offset: usize, len: usize, text: &str) {
    let field = &mut page[offset..offset + len];
    field.fill(b' ');
    field[..text.len()].copy_from_slice(text.as_bytes());
}

fn copy_to_memory(addr: u64, data: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

/// Split a transfer of `len` bytes into (address, length) pieces following
/// PRP1, PRP2 or the PRP list PRP2 points at.
fn prp_segments(command: &NvmeCommand, len: usize) -> Vec<(u64, usize)> {
    let first = (PAGE_SIZE - command.prp1 as usize % PAGE_SIZE).min(len);
    let mut segments = vec![(command.prp1, first)];
    let mut remaining = len - first;

    if remaining == 0 {
        return segments;
    }
    if remaining <= PAGE_SIZE {
        segments.push((command.prp2, remaining));
        return segments;
    }

    let list = command.prp2 as *const u64;
    for index in 0.. {
        if remaining == 0 {
            break;
        }
        let addr = unsafe { core::ptr::read_volatile(list.add(index)) };
        let chunk = remaining.min(PAGE_SIZE);
        segments.push((addr, chunk));
        remaining -= chunk;
    }
    segments
}
