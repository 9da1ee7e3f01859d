//! Driver configuration.

/// Largest transfer a single command may describe: one direct page plus one
/// PRP list page of 512 pointers covers 2 MiB.
pub const MAX_IO_LEN: usize = 2 << 20;

/// Upper bound on I/O queue entries; rounded down to what the controller supports.
pub const MAX_IO_ENTRIES: u16 = 512;

/// Admin queue entries.
pub const MAX_ADMIN_ENTRIES: u16 = 128;

/// Runtime switches for the chattier diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    /// Log every LBA-overlap rejection.
    pub checks: bool,
    /// Dump identify data and the namespace list.
    pub identify: bool,
    /// Trace each submitted command and each completion.
    pub io: bool,
    /// Log DMA region layout.
    pub mem: bool,
    /// Dump the capability and version registers.
    pub regs: bool,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub verbose: Verbosity,
    /// Accept writes and trims.
    pub writeable: bool,
    pub max_io_entries: u16,
    pub max_admin_entries: u16,
    pub max_transfer_bytes: usize,
    pub admin_poll_attempts: u32,
    pub admin_poll_delay_us: u64,
    pub ready_poll_attempts: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            verbose: Verbosity::default(),
            writeable: true,
            max_io_entries: MAX_IO_ENTRIES,
            max_admin_entries: MAX_ADMIN_ENTRIES,
            max_transfer_bytes: MAX_IO_LEN,
            admin_poll_attempts: 10,
            admin_poll_delay_us: 100 * 1000,
            ready_poll_attempts: 50,
        }
    }
}

impl DriverConfig {
    /// Read-only variant of the default configuration.
    pub fn read_only() -> Self {
        Self {
            writeable: false,
            ..Self::default()
        }
    }
}
