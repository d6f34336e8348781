mod uffd;

pub use uffd::UffdPageBackend;

use crate::vlm_error::VLMError;

/// Outcome of one wait on the fault channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultWait {
    /// A thread faulted at this address.
    Fault { addr: usize },
    /// Nothing happened within the timeout (periodic-tick opportunity).
    Timeout,
    /// `signal_shutdown` was called.
    Shutdown,
}

/// The kernel facility behind demand paging: reserve address space, get
/// told about touches of unmapped pages, atomically install page content,
/// and drop physical backing again.
///
/// Everything OS-specific lives behind this trait; a port to another OS
/// supplies an equivalent implementation.
pub trait PageBackendModule: Send + Sync + Sized {
    fn new() -> Result<Self, VLMError>;

    fn page_size(&self) -> usize;

    /// Reserves `len` bytes of address space without physical commit.
    fn map_arena(&self, len: usize) -> Result<usize, VLMError>;

    /// Releases an arena reservation.
    fn unmap_arena(&self, addr: usize, len: usize);

    /// Arms fault interception for `[addr, addr + len)`.
    fn register_range(&self, addr: usize, len: usize) -> Result<(), VLMError>;

    /// Disarms fault interception for `[addr, addr + len)`.
    fn unregister_range(&self, addr: usize, len: usize) -> Result<(), VLMError>;

    /// Blocks until a fault arrives, shutdown is signalled or `timeout_ms`
    /// expires. Only the dispatcher calls this.
    fn await_fault(&self, timeout_ms: i32) -> Result<FaultWait, VLMError>;

    /// Makes the next `await_fault` (or the one in progress) return
    /// `Shutdown`. Callable from any thread.
    fn signal_shutdown(&self);

    /// Atomically installs `src` (a whole number of pages) at `dst` and
    /// wakes every thread faulted on that range. Installing over an
    /// already-present page degrades to a wake.
    fn install_pages(&self, dst: usize, src: &[u8]) -> Result<(), VLMError>;

    /// Like `install_pages` with zero-filled content, without a source
    /// buffer copy.
    fn install_zero_pages(&self, dst: usize, len: usize) -> Result<(), VLMError>;

    /// Wakes threads faulted on the range without installing anything.
    /// The woken threads retry the access and may fault again.
    fn wake_range(&self, addr: usize, len: usize) -> Result<(), VLMError>;

    /// Drops the physical backing of resident pages; the address range
    /// stays reserved and registered, subsequent touches fault again.
    fn drop_pages(&self, addr: usize, len: usize) -> Result<(), VLMError>;
}
