//! NVMe controller register definitions
//!
//! Typed accessors over the memory-mapped register layout of an NVMe
//! controller (BAR0). Every accessor owns its byte offset and field masks;
//! the raw window is reached only through [`RegisterIo`].

use core::fmt;

use bitflags::bitflags;

use crate::mmio::RegisterIo;

/// Register byte offsets
pub mod offsets {
    pub const CAP: usize = 0x00; // Controller Capabilities
    pub const VS: usize = 0x08; // Version
    pub const INTMS: usize = 0x0C; // Interrupt Mask Set
    pub const INTMC: usize = 0x10; // Interrupt Mask Clear
    pub const CC: usize = 0x14; // Controller Configuration
    pub const CSTS: usize = 0x1C; // Controller Status
    pub const NSSR: usize = 0x20; // NVM Subsystem Reset
    pub const AQA: usize = 0x24; // Admin Queue Attributes
    pub const ASQ: usize = 0x28; // Admin Submission Queue Base Address
    pub const ACQ: usize = 0x30; // Admin Completion Queue Base Address
    pub const DOORBELLS: usize = 0x1000; // First doorbell (admin SQ tail)
}

/// Controller Capabilities Register (CAP) bit definitions
pub mod cap_bits {
    pub const MQES_MASK: u64 = 0xFFFF; // Maximum Queue Entries Supported
    pub const CQR_SHIFT: u64 = 16; // Contiguous Queues Required
    pub const AMS_SHIFT: u64 = 17; // Arbitration Mechanism Supported
    pub const AMS_MASK: u64 = 0x3;
    pub const TO_SHIFT: u64 = 24; // Timeout
    pub const TO_MASK: u64 = 0xFF;
    pub const DSTRD_SHIFT: u64 = 32; // Doorbell Stride
    pub const CSS_SHIFT: u64 = 37; // Command Sets Supported
    pub const CSS_MASK: u64 = 0xFF;
    pub const MPSMIN_SHIFT: u64 = 48; // Memory Page Size Minimum
    pub const MPSMAX_SHIFT: u64 = 52; // Memory Page Size Maximum
    pub const NIBBLE: u64 = 0xF;
}

/// Controller Configuration Register (CC) bit definitions
pub mod cc_bits {
    pub const EN: u32 = 1 << 0; // Enable
    pub const CSS_SHIFT: u32 = 4; // I/O Command Set Selected
    pub const MPS_SHIFT: u32 = 7; // Memory Page Size
    pub const MPS_MASK: u32 = 0xF << MPS_SHIFT;
    pub const AMS_SHIFT: u32 = 11; // Arbitration Mechanism Selected
    pub const SHN_SHIFT: u32 = 14; // Shutdown Notification
    pub const IOSQES_SHIFT: u32 = 16; // I/O Submission Queue Entry Size
    pub const IOSQES_MASK: u32 = 0xF << IOSQES_SHIFT;
    pub const IOCQES_SHIFT: u32 = 20; // I/O Completion Queue Entry Size
    pub const IOCQES_MASK: u32 = 0xF << IOCQES_SHIFT;
}

/// Admin Queue Attributes Register (AQA) bit definitions
pub mod aqa_bits {
    pub const ASQS_MASK: u32 = 0xFFF; // Admin Submission Queue Size
    pub const ACQS_SHIFT: u32 = 16; // Admin Completion Queue Size shift
    pub const ACQS_MASK: u32 = 0xFFF << ACQS_SHIFT; // Admin Completion Queue Size
}

bitflags! {
    /// Controller Status Register (CSTS)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerStatus: u32 {
        const RDY = 1 << 0; // Ready
        const CFS = 1 << 1; // Controller Fatal Status
        const SHST = 0x3 << 2; // Shutdown Status
        const NSSRO = 1 << 4; // NVM Subsystem Reset Occurred
        const PP = 1 << 5; // Processing Paused
    }
}

/// Decoded CAP register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum queue entries supported (CAP.MQES + 1)
    pub fn max_queue_entries(&self) -> u32 {
        (self.0 & cap_bits::MQES_MASK) as u32 + 1
    }

    pub fn contiguous_queues_required(&self) -> bool {
        (self.0 >> cap_bits::CQR_SHIFT) & 1 != 0
    }

    pub fn arbitration_mechanisms(&self) -> u8 {
        ((self.0 >> cap_bits::AMS_SHIFT) & cap_bits::AMS_MASK) as u8
    }

    /// CAP.TO in 500 ms units
    pub fn timeout(&self) -> u8 {
        ((self.0 >> cap_bits::TO_SHIFT) & cap_bits::TO_MASK) as u8
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout() as u64 * 500
    }

    /// CAP.DSTRD exponent
    pub fn doorbell_stride_log2(&self) -> u8 {
        ((self.0 >> cap_bits::DSTRD_SHIFT) & cap_bits::NIBBLE) as u8
    }

    /// Doorbell stride in bytes (4 << CAP.DSTRD)
    pub fn doorbell_stride(&self) -> usize {
        4 << self.doorbell_stride_log2()
    }

    pub fn command_sets(&self) -> u8 {
        ((self.0 >> cap_bits::CSS_SHIFT) & cap_bits::CSS_MASK) as u8
    }

    pub fn mpsmin(&self) -> u8 {
        ((self.0 >> cap_bits::MPSMIN_SHIFT) & cap_bits::NIBBLE) as u8
    }

    pub fn mpsmax(&self) -> u8 {
        ((self.0 >> cap_bits::MPSMAX_SHIFT) & cap_bits::NIBBLE) as u8
    }

    /// Minimum memory page size (4KB << CAP.MPSMIN)
    pub fn min_page_size(&self) -> usize {
        4096 << self.mpsmin()
    }

    /// Maximum memory page size (4KB << CAP.MPSMAX)
    pub fn max_page_size(&self) -> usize {
        4096 << self.mpsmax()
    }
}

/// Decoded VS register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u32);

impl Version {
    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn tertiary(&self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.tertiary())
    }
}

/// NVMe controller registers (mapped via BAR0)
#[derive(Debug)]
pub struct NvmeRegisters<M> {
    mmio: M,
    doorbell_stride: usize,
}

impl<M: RegisterIo> NvmeRegisters<M> {
    /// Wrap a register window; the doorbell stride is latched from CAP.
    pub fn new(mmio: M) -> Self {
        let doorbell_stride = Capabilities(mmio.read64(offsets::CAP)).doorbell_stride();
        Self {
            mmio,
            doorbell_stride,
        }
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities(self.mmio.read64(offsets::CAP))
    }

    pub fn version(&self) -> Version {
        Version(self.mmio.read32(offsets::VS))
    }

    /// Mask interrupt vectors (INTMS, pin-based / MSI only)
    pub fn mask_interrupts(&self, vectors: u32) {
        self.mmio.write32(offsets::INTMS, vectors);
    }

    /// Unmask interrupt vectors (INTMC)
    pub fn unmask_interrupts(&self, vectors: u32) {
        self.mmio.write32(offsets::INTMC, vectors);
    }

    pub fn configuration(&self) -> u32 {
        self.mmio.read32(offsets::CC)
    }

    pub fn set_configuration(&self, cc: u32) {
        self.mmio.write32(offsets::CC, cc);
    }

    /// Program page size and queue entry sizes, leaving CC.EN clear.
    ///
    /// `mps` amounts to a page size of 2^(12 + mps) bytes, entry sizes are
    /// log2 of the entry length.
    pub fn configure(&self, mps: u32, iosqes: u32, iocqes: u32) {
        let mut cc = 0;
        cc |= 0 << cc_bits::CSS_SHIFT; // NVM Command Set
        cc |= (mps << cc_bits::MPS_SHIFT) & cc_bits::MPS_MASK;
        cc |= 0 << cc_bits::AMS_SHIFT; // Round Robin arbitration
        cc |= (iosqes << cc_bits::IOSQES_SHIFT) & cc_bits::IOSQES_MASK;
        cc |= (iocqes << cc_bits::IOCQES_SHIFT) & cc_bits::IOCQES_MASK;
        self.set_configuration(cc);
    }

    /// Enable the controller
    pub fn enable(&self) {
        self.set_configuration(self.configuration() | cc_bits::EN);
    }

    /// Disable the controller
    pub fn disable(&self) {
        self.set_configuration(self.configuration() & !cc_bits::EN);
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus::from_bits_retain(self.mmio.read32(offsets::CSTS))
    }

    /// Check if the controller is ready
    pub fn is_ready(&self) -> bool {
        self.status().contains(ControllerStatus::RDY)
    }

    /// Check if the controller has a fatal status
    pub fn is_fatal(&self) -> bool {
        self.status().contains(ControllerStatus::CFS)
    }

    /// Set admin queue attributes; sizes are entry counts, written 0-based.
    pub fn set_admin_queue_attributes(&self, sq_size: u16, cq_size: u16) {
        let asqs = (sq_size as u32 - 1) & aqa_bits::ASQS_MASK;
        let acqs = ((cq_size as u32 - 1) << aqa_bits::ACQS_SHIFT) & aqa_bits::ACQS_MASK;
        self.mmio.write32(offsets::AQA, acqs | asqs);
    }

    /// Set admin submission queue base address
    pub fn set_admin_sq_base(&self, addr: u64) {
        self.mmio.write64(offsets::ASQ, addr);
    }

    /// Set admin completion queue base address
    pub fn set_admin_cq_base(&self, addr: u64) {
        self.mmio.write64(offsets::ACQ, addr);
    }

    /// Byte offset of the submission tail doorbell of queue `qid`.
    pub fn sq_doorbell_offset(&self, qid: u16) -> usize {
        offsets::DOORBELLS + (2 * qid as usize) * self.doorbell_stride
    }

    /// Byte offset of the completion head doorbell of queue `qid`.
    pub fn cq_doorbell_offset(&self, qid: u16) -> usize {
        offsets::DOORBELLS + (2 * qid as usize + 1) * self.doorbell_stride
    }

    /// Hand submission entries up to `tail` to the controller.
    pub fn ring_sq_doorbell(&self, qid: u16, tail: u16) {
        self.mmio.write32(self.sq_doorbell_offset(qid), tail as u32);
    }

    /// Release completion entries before `head` back to the controller.
    pub fn ring_cq_doorbell(&self, qid: u16, head: u16) {
        self.mmio.write32(self.cq_doorbell_offset(qid), head as u32);
    }
}
