//! Arena instances and their lifecycle.
//!
//! The engine Arena is single-threaded; this module makes it usable from a multi-threaded process, in one of two
//! mutually exclusive modes selected at compile time:
//!
//! -   Global: one process-wide Arena behind a lazy `Unloaded -> Loading -> Ready` state machine and a coarse spin
//!     lock. The first caller constructs it; losers of the construction race spin until it is published.
//! -   PerThread: one Arena per thread, stored behind a pthread key in a region mapped straight from the provider,
//!     and torn down by the key destructor when the thread exits.

use core::cell::UnsafeCell;
use core::marker;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use flmalloc_core::{Arena, Config, KernelProvider, Policy, Protection};

use crate::platform::{FlConfig, FlProvider};

/// How Arena instances are handed out to threads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InstanceMode {
    /// One process-wide Arena behind a spin lock.
    Global,
    /// One Arena per thread, behind a pthread key.
    //  Selected by rebuilding with `INSTANCE_MODE` pointed here; never constructed in the default build.
    #[allow(dead_code)]
    PerThread,
}

pub(crate) const INSTANCE_MODE: InstanceMode = InstanceMode::Global;

/// The policy every instance runs under.
pub(crate) const POLICY: Policy = Policy::DEFAULT;

pub(crate) type FlArena = Arena<FlConfig, FlProvider>;

/// Runs `f` against the calling thread's Arena, initializing it first if need be.
///
/// Returns None if no Arena could be constructed.
#[inline(always)]
pub(crate) fn with<R, F>(f: F) -> Option<R>
    where
        F: FnOnce(&mut FlArena) -> R,
{
    match INSTANCE_MODE {
        InstanceMode::Global => GLOBAL.with(f),
        InstanceMode::PerThread => PerThread::with(f),
    }
}

//
//  Global mode.
//

const UNLOADED: u8 = 0;
const LOADING: u8 = 1;
const READY: u8 = 2;

static GLOBAL: Global = Global::new();

struct Global {
    state: AtomicU8,
    lock: SpinLock,
    arena: UnsafeCell<MaybeUninit<FlArena>>,
}

//  Safety:
//  -   The arena cell is only touched with the state READY and the lock held.
unsafe impl Sync for Global {}

impl Global {
    const fn new() -> Global {
        Global {
            state: AtomicU8::new(UNLOADED),
            lock: SpinLock::new(),
            arena: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline(always)]
    fn with<R, F>(&self, f: F) -> Option<R>
        where
            F: FnOnce(&mut FlArena) -> R,
    {
        if self.state.load(Ordering::Acquire) != READY && !self.ensure() {
            return None;
        }

        let _guard = self.lock.lock();

        //  Safety:
        //  -   READY implies the arena is initialized, and it is never torn down.
        //  -   The lock serializes every access.
        let arena = unsafe { &mut *(*self.arena.get()).as_mut_ptr() };

        Some(f(arena))
    }

    #[cold]
    #[inline(never)]
    fn ensure(&self) -> bool {
        loop {
            match self.state.compare_exchange(UNLOADED, LOADING, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => return self.initialize(),
                Err(state) if state == READY => return true,
                Err(_) => {
                    //  Another thread is constructing; let it finish.
                    core::hint::spin_loop();
                },
            }
        }
    }

    #[cold]
    fn initialize(&self) -> bool {
        match Arena::new(FlProvider::new(), POLICY) {
            Ok(arena) => {
                //  Safety:
                //  -   This thread won the LOADING transition; nobody else touches the cell.
                unsafe { (*self.arena.get()).as_mut_ptr().write(arena) };

                self.state.store(READY, Ordering::Release);

                true
            },
            Err(_) => {
                //  Allow a later attempt; the kernel may be less starved then.
                self.state.store(UNLOADED, Ordering::Release);

                false
            },
        }
    }
}

struct SpinLock(AtomicBool);

impl SpinLock {
    const fn new() -> SpinLock { SpinLock(AtomicBool::new(false)) }

    #[inline(always)]
    fn lock(&self) -> SpinGuard<'_> {
        while self.0.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinGuard(self)
    }
}

struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) { (self.0).0.store(false, Ordering::Release); }
}

//
//  PerThread mode.
//

//  Safety:
//  -   `drop_arena` is an `unsafe extern "C" fn(*mut c_void)`.
static THREAD_ARENA: ThreadKey<FlArena> = unsafe { ThreadKey::new(drop_arena as *const u8) };

struct PerThread;

impl PerThread {
    #[inline(always)]
    fn with<R, F>(f: F) -> Option<R>
        where
            F: FnOnce(&mut FlArena) -> R,
    {
        let mut arena = Self::get().or_else(Self::initialize)?;

        //  Safety:
        //  -   The Arena belongs to this thread alone; no other reference exists.
        Some(f(unsafe { arena.as_mut() }))
    }

    #[inline(always)]
    fn get() -> Option<NonNull<FlArena>> { NonNull::new(THREAD_ARENA.get()) }

    //  The Arena cannot live inside itself; its slot comes straight from the provider.
    #[cold]
    #[inline(never)]
    fn initialize() -> Option<NonNull<FlArena>> {
        let provider = FlProvider::new();
        let bytes = FlConfig::PAGE_SIZE.round_up(mem::size_of::<FlArena>());

        //  Safety:
        //  -   `bytes` is a page multiple.
        let slot = unsafe { provider.map(ptr::null_mut(), bytes, Protection::ReadWrite) }.decode().ok()?;

        let arena = match Arena::new(FlProvider::new(), POLICY) {
            Ok(arena) => arena,
            Err(_) => {
                //  Safety:
                //  -   The slot was just mapped, and nothing points into it.
                unsafe { provider.unmap(slot, bytes) };
                return None;
            },
        };

        let slot = slot.cast::<FlArena>();

        //  Safety:
        //  -   The slot is fresh, writable, and large enough.
        unsafe { slot.as_ptr().write(arena) };

        THREAD_ARENA.set(slot.as_ptr());

        Some(slot)
    }
}

#[cold]
unsafe extern "C" fn drop_arena(pointer: *mut libc::c_void) {
    let pointer = pointer as *mut FlArena;

    //  Tears down the Arena, then the slot it lived in.
    ptr::drop_in_place(pointer);

    let provider = FlProvider::new();
    let bytes = FlConfig::PAGE_SIZE.round_up(mem::size_of::<FlArena>());

    provider.unmap(NonNull::new_unchecked(pointer as *mut u8), bytes);
}

//
//  Thread-local key plumbing.
//

struct ThreadKey<T> {
    key: AtomicI64,
    destructor: *const u8,
    _marker: marker::PhantomData<*const T>,
}

//  Safety:
//  -   The key is an atomic; the destructor pointer is immutable.
unsafe impl<T> Sync for ThreadKey<T> {}

impl<T> ThreadKey<T> {
    const UNINITIALIZED: i64 = -1;
    const UNDER_INITIALIZATION: i64 = -2;

    //  Creates an uninitialized instance.
    //
    //  #   Safety
    //
    //  -   Assumes that `destructor` points to an `unsafe extern "C" fn(*mut c_void)` function, or compatible.
    const unsafe fn new(destructor: *const u8) -> Self {
        ThreadKey {
            key: AtomicI64::new(Self::UNINITIALIZED),
            destructor,
            _marker: marker::PhantomData,
        }
    }

    #[inline(always)]
    fn get(&self) -> *mut T {
        let key = self.key.load(Ordering::Relaxed);

        //  An uninitialized key yields a null pointer, as befits an unset value.
        //
        //  Safety:
        //  -   `pthread_getspecific` has no preconditions.
        unsafe { libc::pthread_getspecific(key as libc::pthread_key_t) as *mut T }
    }

    #[cold]
    #[inline(never)]
    fn set(&self, value: *mut T) {
        let key = self.get_key();

        //  Safety:
        //  -   `key` was created by `pthread_key_create`.
        let result = unsafe { libc::pthread_setspecific(key, value as *mut libc::c_void) };
        assert!(result == 0, "Could not set thread-local value for {}: {}", key, result);
    }

    #[inline(always)]
    fn get_key(&self) -> libc::pthread_key_t {
        let key = self.key.load(Ordering::Relaxed);

        if key >= 0 { key as libc::pthread_key_t } else { self.initialize() }
    }

    #[cold]
    #[inline(never)]
    fn initialize(&self) -> libc::pthread_key_t {
        const RELAXED: Ordering = Ordering::Relaxed;

        let mut key = self.key.load(RELAXED);

        if self.key.compare_exchange(Self::UNINITIALIZED, Self::UNDER_INITIALIZATION, RELAXED, RELAXED).is_ok() {
            key = self.create_key();
            self.key.store(key, RELAXED);
        }

        while key < 0 {
            //  Safety:
            //  -   `sched_yield` has no preconditions.
            unsafe { libc::sched_yield() };
            key = self.key.load(RELAXED);
        }

        key as libc::pthread_key_t
    }

    #[cold]
    fn create_key(&self) -> i64 {
        let mut key: libc::pthread_key_t = 0;

        //  Safety:
        //  -   fn pointers are just pointers.
        let destructor = unsafe { mem::transmute::<_, Destructor>(self.destructor) };

        //  Safety:
        //  -   `key` is a valid out-parameter.
        let result = unsafe { libc::pthread_key_create(&mut key as *mut _, Some(destructor)) };
        assert!(result == 0, "Could not create thread-local key: {}", result);

        key as i64
    }
}

type Destructor = unsafe extern "C" fn(*mut libc::c_void);
