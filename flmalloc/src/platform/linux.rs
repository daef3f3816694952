//! Implementation of Linux specific calls.

use core::mem;

use flmalloc_core::{Advice, Config, KernelProvider, MapAddress, MemoryPressure, PowerOf2, Protection};

/// Implementation of the Config trait, for Linux.
#[derive(Default)]
pub(crate) struct FlConfig;

impl Config for FlConfig {
    //  4 KB
    const PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4096) };

    //  1 MB of metadata to start with.
    const ARENA_PAGES: usize = 256;

    const MIN_SHEET_PAGES: usize = 32;

    //  3 MB steps for the small-object cache.
    const CACHE_STEP_PAGES: usize = 768;

    const OVERCOMMIT: usize = 2;

    const MAX_RETRIES: usize = 2;

    const ALLOC_LIMIT: Option<usize> = None;

    const EAGER_INIT: bool = true;
}

/// Implementation of the KernelProvider trait, for Linux.
#[derive(Default)]
pub(crate) struct FlProvider;

impl FlProvider {
    /// Creates an instance.
    pub(crate) const fn new() -> Self { Self }
}

//  Safety:
//  -   `mmap` hands out page-aligned, unaliased mappings, and is callable from any thread.
unsafe impl KernelProvider for FlProvider {
    unsafe fn map(&self, hint: *mut u8, length: usize, protection: Protection) -> MapAddress {
        let prot = protection_bits(protection);
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        //  When used in conjunction with MAP_ANONYMOUS, fd is mandated to be -1 on some implementations, and offset
        //  to be 0.
        let result = libc::mmap(hint as *mut libc::c_void, length, prot, flags, -1, 0);

        //  The C library strips the kernel's negative-errno encoding; fold it back, so that `decode` sees the whole
        //  error window.
        if result == libc::MAP_FAILED {
            MapAddress(-(*libc::__errno_location()) as isize)
        } else {
            MapAddress(result as isize)
        }
    }

    unsafe fn unmap(&self, address: core::ptr::NonNull<u8>, length: usize) {
        let result = libc::munmap(address.as_ptr() as *mut libc::c_void, length);
        assert!(result == 0, "Could not munmap {:x}, {}: {}", address.as_ptr() as usize, length, result);
    }

    unsafe fn protect(&self, address: core::ptr::NonNull<u8>, length: usize, protection: Protection) -> bool {
        let prot = protection_bits(protection);

        libc::mprotect(address.as_ptr() as *mut libc::c_void, length, prot) == 0
    }

    unsafe fn advise(&self, address: core::ptr::NonNull<u8>, length: usize, advice: Advice) -> bool {
        let advice = match advice {
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::DontNeed => libc::MADV_DONTNEED,
        };

        libc::madvise(address.as_ptr() as *mut libc::c_void, length, advice) == 0
    }

    fn memory_pressure(&self) -> MemoryPressure {
        //  Safety:
        //  -   A zeroed sysinfo is a valid out-parameter.
        let mut info: libc::sysinfo = unsafe { mem::zeroed() };

        //  Safety:
        //  -   `info` is a valid sysinfo out-parameter.
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            //  No verdict is better than a false alarm.
            return MemoryPressure { available: 1, total: 1 };
        }

        let unit = info.mem_unit as usize;

        MemoryPressure {
            available: info.freeram as usize * unit,
            total: info.totalram as usize * unit,
        }
    }

    fn report(&self, message: &str) {
        //  Safety:
        //  -   Writing to stderr; the kernel bounds-checks nothing beyond the given length.
        unsafe {
            libc::write(2, message.as_ptr() as *const libc::c_void, message.len());
            libc::write(2, b"\n".as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn protection_bits(protection: Protection) -> libc::c_int {
    match protection {
        Protection::None => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}
