#![deny(missing_docs)]

//! Multi-threaded test helpers for exercising the allocator under contention.
//!
//! The two types cooperate:
//!
//! -   `Pool` spawns N threads from a per-thread factory, and joins them all, collecting their results.
//! -   `RendezVous` is a resettable spin barrier, so that the threads of a `Pool` release a burst of calls as
//!     simultaneously as possible.

use std::{
    mem,
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
    thread,
};

/// A pool of threads, joined on drop.
pub struct Pool<T>(Vec<thread::JoinHandle<T>>);

impl<T> Pool<T> {
    /// Spawns `count` threads, each running the closure produced by `factory(thread_index)`.
    pub fn new<F, G>(count: usize, mut factory: F) -> Self
        where
            F: FnMut(usize) -> G,
            G: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
    {
        let threads: Vec<_> = (0..count)
            .map(|i| thread::spawn(factory(i)))
            .collect();

        Self(threads)
    }

    /// Joins all threads, and collects their results in spawn order.
    ///
    /// #   Panics
    ///
    /// -   If any of the threads panicked.
    pub fn join(mut self) -> Vec<T> {
        let handles = mem::replace(&mut self.0, vec!());
        Self::join_handles(handles)
    }

    fn join_handles(handles: Vec<thread::JoinHandle<T>>) -> Vec<T> {
        //  First join _all_ threads, then unwrap, so that a panicking thread does not leave the others dangling.
        let results: Vec<_> = handles.into_iter()
            .map(|handle| handle.join())
            .collect();

        results.into_iter()
            .map(|result| result.unwrap())
            .collect()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let handles = mem::replace(&mut self.0, vec!());
        Self::join_handles(handles);
    }
}

/// A named, resettable spin barrier.
///
/// Each participant calls `wait_until_all_ready`; all of them resume only once the last one arrived.
///
/// #   Warning
///
/// Rearming a RendezVous is delicate:
///
/// 1.  An instance should only be rearmed by a single thread.
/// 2.  An instance cannot be rearmed right before a `wait_until_all_ready` on the same instance, as some threads may
///     already have decremented the counter prior to the reset.
/// 3.  An instance cannot be rearmed right after a `wait_until_all_ready` on the same instance, as threads which have
///     not yet exited the wait would get stuck.
///
/// The usual pattern interleaves two or more instances, so that rearming one is always separated from its next use by
/// a wait on another.
#[derive(Clone, Debug)]
pub struct RendezVous(&'static str, Arc<AtomicUsize>);

impl RendezVous {
    /// Creates an instance expecting `count` participants.
    pub fn new(name: &'static str, count: usize) -> Self {
        Self(name, Arc::new(AtomicUsize::new(count)))
    }

    /// Signals this thread's readiness, then spins until all participants signalled theirs.
    pub fn wait_until_all_ready(&self) {
        self.1.fetch_sub(1, Ordering::AcqRel);

        while !self.is_ready() {}
    }

    /// Returns whether all participants have signalled.
    pub fn is_ready(&self) -> bool { self.1.load(Ordering::Acquire) == 0 }

    /// Rearms the barrier for `count` participants.
    ///
    /// #   Panics
    ///
    /// -   If the barrier has not been fully released yet.
    pub fn reset(&self, count: usize) {
        assert!(self.is_ready(), "{} not ready: {:?}", self.0, self.1);
        self.1.store(count, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

#[test]
fn pool_collects_results_in_spawn_order() {
    let pool = Pool::new(4, |i| move || i * i);

    assert_eq!(vec!(0, 1, 4, 9), pool.join());
}

#[test]
fn rendez_vous_releases_all_participants() {
    const THREADS: usize = 4;

    let gate = RendezVous::new("gate", THREADS);
    let arrived = Arc::new(AtomicUsize::new(0));

    let pool = Pool::new(THREADS, |_| {
        let gate = gate.clone();
        let arrived = arrived.clone();

        move || {
            arrived.fetch_add(1, Ordering::AcqRel);

            gate.wait_until_all_ready();

            //  Nobody passes the gate before everybody arrived.
            arrived.load(Ordering::Acquire)
        }
    });

    for count in pool.join() {
        assert_eq!(THREADS, count);
    }
}

#[test]
fn rendez_vous_rearms() {
    const THREADS: usize = 2;

    let first = RendezVous::new("first", THREADS);
    let second = RendezVous::new("second", THREADS);

    let pool = Pool::new(THREADS, |i| {
        let first = first.clone();
        let second = second.clone();

        move || {
            first.wait_until_all_ready();

            second.wait_until_all_ready();

            //  The second wait guarantees everybody left the first; thread 0 may rearm it.
            if i == 0 {
                first.reset(THREADS);
            }
        }
    });

    pool.join();

    assert!(!first.is_ready());
    assert!(second.is_ready());
}

} // mod tests
