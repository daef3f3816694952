//! Configuration.
//!
//! The sizing knobs of the allocator, fixed at compile time. Runtime-selectable behavior lives in `Policy` instead.

use crate::utils::PowerOf2;

/// Compile-time sizing configuration of an Arena.
pub trait Config {
    /// The size of a kernel page; all Regions are multiples of it.
    const PAGE_SIZE: PowerOf2;

    /// The number of pages of the initial metadata Region, out of which Sheet/Node bookkeeping is carved.
    const ARENA_PAGES: usize;

    /// The minimum number of pages a fresh Sheet provisions, whatever its growth curve says.
    const MIN_SHEET_PAGES: usize;

    /// The number of pages by which the small-object cache chain grows; the cache bypasses the growth curves.
    const CACHE_STEP_PAGES: usize;

    /// Multiplier applied to predicted growth sizes, so that a growing chain over-provisions.
    ///
    /// Not applied to gigabyte-scale requests.
    const OVERCOMMIT: usize;

    /// The number of grow-and-retry attempts `push` makes before returning the failure sentinel.
    const MAX_RETRIES: usize;

    /// An optional ceiling on individual request sizes; exceeding it is a constraint violation, not a soft failure.
    const ALLOC_LIMIT: Option<usize>;

    /// Whether the cache and sub-page chains are provisioned at Arena construction.
    ///
    /// The Large and Huge chains always initialize lazily; many processes never touch them.
    const EAGER_INIT: bool;
}
