//! NVMe command structures and helpers
//!
//! Submission and completion queue entries plus the Identify data the driver
//! consumes.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Length of an Identify data structure.
pub const IDENTIFY_LEN: usize = 4096;

/// NVMe command opcodes
pub mod opcodes {
    // Admin commands
    pub const ADMIN_DELETE_IO_SQ: u8 = 0x00;
    pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
    pub const ADMIN_DELETE_IO_CQ: u8 = 0x04;
    pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
    pub const ADMIN_IDENTIFY: u8 = 0x06;
    pub const ADMIN_SET_FEATURES: u8 = 0x09;
    pub const ADMIN_GET_FEATURES: u8 = 0x0A;

    // NVM commands
    pub const NVM_FLUSH: u8 = 0x00;
    pub const NVM_WRITE: u8 = 0x01;
    pub const NVM_READ: u8 = 0x02;
    pub const NVM_WRITE_ZEROES: u8 = 0x08;
}

/// IDENTIFY command CNS (Controller or Namespace Structure) values
pub mod identify_cns {
    pub const NAMESPACE: u32 = 0x00; // Identify Namespace
    pub const CONTROLLER: u32 = 0x01; // Identify Controller
    pub const NAMESPACE_LIST: u32 = 0x02; // Active Namespace ID list
}

/// NVMe Submission Queue Entry (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    pub cdw0: u32,  // Command Dword 0 (Opcode, Flags, CID)
    pub nsid: u32,  // Namespace Identifier
    pub cdw2: u32,  // Command Dword 2
    pub cdw3: u32,  // Command Dword 3
    pub mptr: u64,  // Metadata Pointer
    pub prp1: u64,  // PRP Entry 1 (Physical Region Page)
    pub prp2: u64,  // PRP Entry 2
    pub cdw10: u32, // Command Dword 10
    pub cdw11: u32, // Command Dword 11
    pub cdw12: u32, // Command Dword 12
    pub cdw13: u32, // Command Dword 13
    pub cdw14: u32, // Command Dword 14
    pub cdw15: u32, // Command Dword 15
}

/// NVMe Completion Queue Entry (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCompletion {
    pub dw0: u32,     // Command Specific
    pub dw1: u32,     // Reserved
    pub sq_head: u16, // Submission Queue Head Pointer
    pub sq_id: u16,   // Submission Queue Identifier
    pub cid: u16,     // Command Identifier
    pub status: u16,  // Status Field (Phase bit + Status)
}

const_assert_eq!(core::mem::size_of::<NvmeCommand>(), 64);
const_assert_eq!(core::mem::offset_of!(NvmeCommand, prp1), 0x18);
const_assert_eq!(core::mem::offset_of!(NvmeCommand, prp2), 0x20);
const_assert_eq!(core::mem::offset_of!(NvmeCommand, cdw10), 0x28);
const_assert_eq!(core::mem::offset_of!(NvmeCommand, cdw12), 0x30);
const_assert_eq!(core::mem::size_of::<NvmeCompletion>(), 16);
const_assert_eq!(core::mem::offset_of!(NvmeCompletion, sq_id), 0x0a);
const_assert_eq!(core::mem::offset_of!(NvmeCompletion, status), 0x0e);

impl NvmeCommand {
    /// Create a new command with all fields zeroed
    pub const fn new() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    /// Get the opcode from CDW0 (bits 0-7)
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    /// Set the opcode in CDW0 (bits 0-7)
    pub fn set_opcode(&mut self, opcode: u8) {
        self.cdw0 = (self.cdw0 & !0xFF) | (opcode as u32);
    }

    /// Get the command identifier from CDW0 (bits 16-31)
    pub fn command_id(&self) -> u16 {
        ((self.cdw0 >> 16) & 0xFFFF) as u16
    }

    /// Set the command identifier in CDW0 (bits 16-31)
    pub fn set_command_id(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000FFFF) | ((cid as u32) << 16);
    }

    /// Starting LBA (CDW10/CDW11)
    pub fn lba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    pub fn set_lba(&mut self, lba: u64) {
        self.cdw10 = lba as u32; // SLBA (lower 32 bits)
        self.cdw11 = (lba >> 32) as u32; // SLBA (upper 32 bits)
    }

    /// Number of logical blocks (CDW12.NLB is 0-based)
    pub fn block_count(&self) -> u32 {
        (self.cdw12 & 0xFFFF) + 1
    }

    pub fn set_block_count(&mut self, blocks: u32) {
        debug_assert!((1..=0x1_0000).contains(&blocks));
        self.cdw12 = (self.cdw12 & !0xFFFF) | (blocks - 1);
    }

    /// Controller or namespace structure selector (CDW10 bits 0-7)
    pub fn cns(&self) -> u32 {
        self.cdw10 & 0xFF
    }

    /// Create an IDENTIFY Controller command
    pub fn identify_controller(buffer_addr: u64) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.nsid = 0;
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = identify_cns::CONTROLLER;
        cmd
    }

    /// Create an IDENTIFY Active Namespace List command
    pub fn identify_namespace_list(buffer_addr: u64) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = identify_cns::NAMESPACE_LIST;
        cmd
    }

    /// Create an IDENTIFY Namespace command
    pub fn identify_namespace(nsid: u32, buffer_addr: u64) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.nsid = nsid;
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = identify_cns::NAMESPACE;
        cmd
    }

    /// Create a CREATE I/O Completion Queue command with interrupts enabled
    pub fn create_io_cq(queue_id: u16, queue_size: u16, buffer_addr: u64, vector: u16) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_CREATE_IO_CQ);
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = ((queue_size - 1) as u32) << 16 | (queue_id as u32); // QSIZE | QID
        cmd.cdw11 = ((vector as u32) << 16) | (1 << 1) | 1; // IV | IEN | PC
        cmd
    }

    /// Create a CREATE I/O Submission Queue command
    pub fn create_io_sq(queue_id: u16, cq_id: u16, queue_size: u16, buffer_addr: u64) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_CREATE_IO_SQ);
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = ((queue_size - 1) as u32) << 16 | (queue_id as u32); // QSIZE | QID
        cmd.cdw11 = (cq_id as u32) << 16 | 1; // CQID | QPRIO = urgent | PC
        cmd
    }
}

/// Decoded completion status field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStatus {
    /// Status code (SF bits 1-8)
    pub code: u8,
    /// Status code type (SF bits 9-11)
    pub code_type: u8,
    /// More information in the error log (SF bit 14)
    pub more: bool,
    /// Do not retry (SF bit 15)
    pub do_not_retry: bool,
}

impl CommandStatus {
    pub fn from_field(status: u16) -> Self {
        Self {
            code: ((status >> 1) & 0xFF) as u8,
            code_type: ((status >> 9) & 0x7) as u8,
            more: status & (1 << 14) != 0,
            do_not_retry: status & (1 << 15) != 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0 && self.code_type == 0
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct:{:#x} sc:{:#x}", self.code_type, self.code)?;
        if self.do_not_retry {
            f.write_str(" dnr")?;
        }
        Ok(())
    }
}

impl NvmeCompletion {
    /// Get the phase bit (bit 0 of status field)
    pub fn phase_bit(&self) -> bool {
        (self.status & 1) != 0
    }

    pub fn status(&self) -> CommandStatus {
        CommandStatus::from_field(self.status)
    }

    /// Check if the command completed successfully
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Check if this completion entry is valid (has expected phase bit)
    pub fn is_valid(&self, expected_phase: bool) -> bool {
        self.phase_bit() == expected_phase
    }

    /// Request identity: submission queue in the upper half, command id in the lower.
    pub fn request_id(&self) -> u32 {
        (self.sq_id as u32) << 16 | self.cid as u32
    }
}

impl fmt::Display for NvmeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sqhd:{} sqid:{} cid:{} p:{} status:{:#x} {}",
            self.sq_head,
            self.sq_id,
            self.cid,
            self.phase_bit() as u8,
            self.status,
            self.status()
        )
    }
}

bitflags! {
    /// Optional Admin Command Support (Identify Controller OACS)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionalAdminCommands: u16 {
        const SECURITY = 1 << 0; // Security Send/Receive
        const FORMAT = 1 << 1; // Format NVM
        const FIRMWARE = 1 << 2; // Firmware Commit/Image Download
        const NAMESPACE_MANAGEMENT = 1 << 3;
        const VIRTUALIZATION = 1 << 7;
    }
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// ASCII field, space/NUL padded.
fn ascii(data: &[u8], offset: usize, len: usize) -> String {
    let field = &data[offset..offset + len];
    let text = core::str::from_utf8(field).unwrap_or("Unknown");
    String::from(text.trim_end_matches('\0').trim())
}

/// Identify Controller data, the fields the driver uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyController {
    pub vid: u16,    // PCI Vendor ID
    pub ssvid: u16,  // PCI Subsystem Vendor ID
    pub sn: String,  // Serial Number
    pub mn: String,  // Model Number
    pub fr: String,  // Firmware Revision
    pub mdts: u8,    // Maximum Data Transfer Size (2^n pages, 0 = unlimited)
    pub oacs: OptionalAdminCommands,
    pub nn: u32,   // Number of Namespaces
    pub oncs: u16, // Optional NVM Command Support
    pub vwc: u8,   // Volatile Write Cache
}

impl IdentifyController {
    pub const SN_OFFSET: usize = 0x04;
    pub const SN_LEN: usize = 20;
    pub const MN_OFFSET: usize = 0x18;
    pub const MN_LEN: usize = 40;
    pub const FR_OFFSET: usize = 0x40;
    pub const FR_LEN: usize = 8;
    pub const MDTS_OFFSET: usize = 0x4D;
    pub const OACS_OFFSET: usize = 0x100;
    pub const NN_OFFSET: usize = 0x204;
    pub const ONCS_OFFSET: usize = 0x208;
    pub const VWC_OFFSET: usize = 0x20D;

    /// Decode a 4096-byte Identify Controller page.
    pub fn parse(data: &[u8]) -> Self {
        debug_assert!(data.len() >= IDENTIFY_LEN);
        Self {
            vid: le16(data, 0x00),
            ssvid: le16(data, 0x02),
            sn: ascii(data, Self::SN_OFFSET, Self::SN_LEN),
            mn: ascii(data, Self::MN_OFFSET, Self::MN_LEN),
            fr: ascii(data, Self::FR_OFFSET, Self::FR_LEN),
            mdts: data[Self::MDTS_OFFSET],
            oacs: OptionalAdminCommands::from_bits_retain(le16(data, Self::OACS_OFFSET)),
            nn: le32(data, Self::NN_OFFSET),
            oncs: le16(data, Self::ONCS_OFFSET),
            vwc: data[Self::VWC_OFFSET],
        }
    }

    pub fn supports_namespace_management(&self) -> bool {
        self.oacs.contains(OptionalAdminCommands::NAMESPACE_MANAGEMENT)
    }

    /// ONCS bit 3
    pub fn supports_write_zeroes(&self) -> bool {
        self.oncs & (1 << 3) != 0
    }
}

/// LBA Format Data Structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LbaFormat {
    pub ms: u16,   // Metadata Size
    pub lbads: u8, // LBA Data Size (2^n bytes)
    pub rp: u8,    // Relative Performance
}

impl LbaFormat {
    pub fn from_dword(dword: u32) -> Self {
        Self {
            ms: dword as u16,
            lbads: (dword >> 16) as u8,
            rp: ((dword >> 24) & 0x3) as u8,
        }
    }

    pub fn to_dword(&self) -> u32 {
        self.ms as u32 | (self.lbads as u32) << 16 | ((self.rp & 0x3) as u32) << 24
    }
}

/// Identify Namespace data, the fields the driver uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyNamespace {
    pub nsze: u64,  // Namespace Size
    pub ncap: u64,  // Namespace Capacity
    pub nuse: u64,  // Namespace Utilization
    pub nlbaf: u8,  // Number of LBA Formats (0-based)
    pub flbas: u8,  // Formatted LBA Size
    pub lbaf: [LbaFormat; Self::MAX_LBAF],
}

impl IdentifyNamespace {
    pub const MAX_LBAF: usize = 16;
    pub const NLBAF_OFFSET: usize = 0x19;
    pub const FLBAS_OFFSET: usize = 0x1A;
    pub const LBAF_OFFSET: usize = 0x80;

    /// Decode a 4096-byte Identify Namespace page.
    pub fn parse(data: &[u8]) -> Self {
        debug_assert!(data.len() >= IDENTIFY_LEN);
        let mut lbaf = [LbaFormat::default(); Self::MAX_LBAF];
        for (index, format) in lbaf.iter_mut().enumerate() {
            *format = LbaFormat::from_dword(le32(data, Self::LBAF_OFFSET + index * 4));
        }
        Self {
            nsze: le64(data, 0x00),
            ncap: le64(data, 0x08),
            nuse: le64(data, 0x10),
            nlbaf: data[Self::NLBAF_OFFSET],
            flbas: data[Self::FLBAS_OFFSET],
            lbaf,
        }
    }

    /// LBA format selected by FLBAS bits 0-3
    pub fn current_format(&self) -> LbaFormat {
        self.lbaf[(self.flbas & 0x0F) as usize]
    }

    /// Get the LBA size in bytes for the current format
    pub fn lba_size(&self) -> Option<u32> {
        1u32.checked_shl(self.current_format().lbads as u32)
    }

    /// Get the namespace size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.nsze * self.lba_size().unwrap_or(0) as u64
    }
}

/// Decode an Active Namespace ID list: entries up to the first zero.
pub fn parse_namespace_list(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .take(1024)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .take_while(|&nsid| nsid != 0)
        .collect()
}
