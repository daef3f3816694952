//! KernelProvider
//!
//! The KernelProvider trait is how the allocator obtains memory from, and returns memory to, the operating system. By
//! abstracting the underlying kernel interface, the engine can be ported, and more importantly tested, without ever
//! issuing a real system call.

use core::ptr::NonNull;

/// Memory protection applied to a mapped Region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protection {
    /// No access at all; used for guard Sheets.
    None,
    /// Read-only; used by `freeze`.
    Read,
    /// Read and write; the default for data Regions.
    ReadWrite,
}

/// Usage hints forwarded to the kernel for a mapped Region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Advice {
    /// The Region is about to be used in full.
    WillNeed,
    /// The Region content is no longer needed; backing pages may be reclaimed.
    DontNeed,
}

/// Why a mapping request failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// The kernel is out of memory, or the process out of address space.
    OutOfMemory,
    /// The requested length overflows what the kernel can express.
    Overflow,
    /// The request itself was malformed.
    InvalidArgument,
    /// A mapping already exists at the requested (fixed) address.
    AlreadyExists,
    /// The protection requested is not permitted.
    PermissionDenied,
    /// A transient failure; the request may succeed if retried.
    TryAgain,
    /// Any other kernel error, by number.
    Other(i32),
}

/// A raw mapping result, as returned by the kernel.
///
/// The kernel aliases errors onto the pointer range: any value in `[-4095, -1]` is a negated error number, not an
/// address. A bare `-1` check misses most of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapAddress(pub isize);

impl MapAddress {
    /// Decodes the raw value into an address or an error.
    pub fn decode(self) -> Result<NonNull<u8>, MapError> {
        const ENOMEM: isize = -12;
        const EOVERFLOW: isize = -75;
        const EINVAL: isize = -22;
        const EEXIST: isize = -17;
        const EACCES: isize = -13;
        const EPERM: isize = -1;
        const EAGAIN: isize = -11;

        match self.0 {
            0 => Err(MapError::Other(0)),
            ENOMEM => Err(MapError::OutOfMemory),
            EOVERFLOW => Err(MapError::Overflow),
            EINVAL => Err(MapError::InvalidArgument),
            EEXIST => Err(MapError::AlreadyExists),
            EACCES | EPERM => Err(MapError::PermissionDenied),
            EAGAIN => Err(MapError::TryAgain),
            error if error >= -4095 && error < 0 => Err(MapError::Other(-error as i32)),
            address => {
                //  Safety:
                //  -   `address` is neither 0 nor in the error window, as per the match.
                Ok(unsafe { NonNull::new_unchecked(address as *mut u8) })
            },
        }
    }
}

/// A snapshot of system memory health, for the OOM pre-checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryPressure {
    /// Bytes of memory currently available.
    pub available: usize,
    /// Bytes of memory in total.
    pub total: usize,
}

impl MemoryPressure {
    /// Returns the fraction of memory still available, in `[0, 1]`.
    pub fn available_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }

        self.available as f64 / self.total as f64
    }
}

/// Abstraction of kernel memory mapping.
///
/// #   Safety
///
/// Implementations must hand out Regions that are valid, page-aligned, and unaliased until unmapped, and must be
/// callable from multiple threads without external synchronization.
pub unsafe trait KernelProvider {
    /// Maps `length` bytes of fresh memory, with the given protection.
    ///
    /// `hint` is a placement suggestion and may be null; the kernel is free to ignore it.
    ///
    /// The result is raw: callers must `decode` it, and treat the whole error window as failure.
    ///
    /// #   Safety
    ///
    /// -   Assumes `length` is a multiple of the page size.
    unsafe fn map(&self, hint: *mut u8, length: usize, protection: Protection) -> MapAddress;

    /// Unmaps `length` bytes at `address`.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[address, address + length)` was mapped by this provider, and is no longer in use.
    unsafe fn unmap(&self, address: NonNull<u8>, length: usize);

    /// Changes the protection of `length` bytes at `address`. Returns whether the kernel accepted.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[address, address + length)` was mapped by this provider.
    unsafe fn protect(&self, address: NonNull<u8>, length: usize, protection: Protection) -> bool;

    /// Forwards a usage hint for `length` bytes at `address`. Returns whether the kernel accepted.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[address, address + length)` was mapped by this provider.
    unsafe fn advise(&self, address: NonNull<u8>, length: usize, advice: Advice) -> bool;

    /// Returns a snapshot of system memory health.
    fn memory_pressure(&self) -> MemoryPressure;

    /// Sinks a fatal-path diagnostic; the default discards it.
    fn report(&self, _message: &str) {}
}

//  The engine only ever takes `&self` on its provider; sharing one is routine, in tests especially.
unsafe impl<'a, P> KernelProvider for &'a P
    where
        P: KernelProvider,
{
    unsafe fn map(&self, hint: *mut u8, length: usize, protection: Protection) -> MapAddress {
        (**self).map(hint, length, protection)
    }

    unsafe fn unmap(&self, address: NonNull<u8>, length: usize) { (**self).unmap(address, length) }

    unsafe fn protect(&self, address: NonNull<u8>, length: usize, protection: Protection) -> bool {
        (**self).protect(address, length, protection)
    }

    unsafe fn advise(&self, address: NonNull<u8>, length: usize, advice: Advice) -> bool {
        (**self).advise(address, length, advice)
    }

    fn memory_pressure(&self) -> MemoryPressure { (**self).memory_pressure() }

    fn report(&self, message: &str) { (**self).report(message) }
}
