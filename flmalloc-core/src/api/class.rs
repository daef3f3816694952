//! Size classification.
//!
//! Every allocation request is classified by its byte count alone; the class selects the Bucket Chain serving the
//! request and the growth curve used when that chain must be extended.

use core::{cmp, ptr};

use crate::api::Config;
use crate::utils::{ln, PowerOf2};

/// A contiguous span of memory, as handed out by the allocator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Span {
    /// The first byte of the span.
    pub ptr: *mut u8,
    /// The number of bytes in the span.
    pub len: usize,
}

impl Span {
    /// The empty span; returned by a Sheet which cannot satisfy a request.
    pub const EMPTY: Span = Span { ptr: ptr::null_mut(), len: 0 };

    /// The failure sentinel; returned by `push` when its retry budget is exhausted.
    ///
    /// Deliberately distinct from the empty span, and never a valid address.
    pub const FAILURE: Span = Span { ptr: usize::MAX as *mut u8, len: usize::MAX };

    /// Creates a span.
    pub fn new(ptr: *mut u8, len: usize) -> Span { Span { ptr, len } }

    /// Returns whether the span is the empty span.
    pub fn is_empty(&self) -> bool { self.ptr.is_null() }

    /// Returns whether the span is the failure sentinel.
    pub fn is_failure(&self) -> bool { self.len == usize::MAX }

    /// Returns whether the span is an actual allocation.
    pub fn is_allocation(&self) -> bool { !self.is_empty() && !self.is_failure() }
}

/// The size classes, in strictly increasing order of the sizes they cover.
///
/// `Bulk` and `Giant` select growth curves only; their requests are served by the `Huge` chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SizeClass {
    /// Requests of at most 256 bytes.
    Precise,
    /// Requests of at most 512 bytes.
    Small,
    /// Requests of at most 4 KB.
    Medium,
    /// Requests of at most 32 KB.
    Large,
    /// Requests of at most 256 KB.
    Huge,
    /// Requests of at most 1 GB.
    Bulk,
    /// Anything larger.
    Giant,
}

impl SizeClass {
    /// Upper bound of the `Precise` class, inclusive.
    pub const PRECISE_LIMIT: usize = 256;

    /// Upper bound of the `Small` class, inclusive.
    pub const SMALL_LIMIT: usize = 512;

    /// Upper bound of the `Medium` class, inclusive.
    pub const MEDIUM_LIMIT: usize = 4 * 1024;

    /// Upper bound of the `Large` class, inclusive.
    pub const LARGE_LIMIT: usize = 32 * 1024;

    /// Upper bound of the `Huge` class, inclusive.
    pub const HUGE_LIMIT: usize = 256 * 1024;

    /// Upper bound of the `Bulk` class, inclusive.
    pub const BULK_LIMIT: usize = 1024 * 1024 * 1024;

    /// Classifies a request size.
    ///
    /// Pure and monotonic: a larger size never yields a smaller class.
    pub fn of(size: usize) -> SizeClass {
        if size <= Self::PRECISE_LIMIT {
            SizeClass::Precise
        } else if size <= Self::SMALL_LIMIT {
            SizeClass::Small
        } else if size <= Self::MEDIUM_LIMIT {
            SizeClass::Medium
        } else if size <= Self::LARGE_LIMIT {
            SizeClass::Large
        } else if size <= Self::HUGE_LIMIT {
            SizeClass::Huge
        } else if size <= Self::BULK_LIMIT {
            SizeClass::Bulk
        } else {
            SizeClass::Giant
        }
    }

    /// Returns the upper bound of the class, or None for `Giant`.
    pub fn limit(&self) -> Option<usize> {
        match *self {
            SizeClass::Precise => Some(Self::PRECISE_LIMIT),
            SizeClass::Small => Some(Self::SMALL_LIMIT),
            SizeClass::Medium => Some(Self::MEDIUM_LIMIT),
            SizeClass::Large => Some(Self::LARGE_LIMIT),
            SizeClass::Huge => Some(Self::HUGE_LIMIT),
            SizeClass::Bulk => Some(Self::BULK_LIMIT),
            SizeClass::Giant => None,
        }
    }
}

/// Returns the number of bytes a fresh Sheet of `class` should provision, absent any better estimate.
///
/// The curves are super-linear on purpose: larger classes provision disproportionately more slack, so that their
/// chains expand rarely; small classes stay conservative. The result is a page multiple, floored at
/// `Config::MIN_SHEET_PAGES` pages.
///
/// `Bulk` and `Giant` have no representative size; use [`bulk_region_size`] with the actual request instead.
pub fn expected_region_size<C>(class: SizeClass) -> usize
    where
        C: Config,
{
    let page = C::PAGE_SIZE;

    let bytes = match class {
        SizeClass::Precise | SizeClass::Small => {
            let s = representative(class) as f64;
            (s * ln(s)) as usize
        },
        SizeClass::Medium => {
            //  The raw `s ln(s)` curve over-provisions at 4 KB granularity; damp it.
            let s = representative(class) as f64;
            (s * ln(s) * ln(ln(ln(s)))) as usize
        },
        SizeClass::Large | SizeClass::Huge => {
            let s = representative(class);
            let pages = (s / page) * (s / page);
            let pages = (pages as f64 * ln(s as f64)) as usize;

            PowerOf2::ceil(pages).value() * page.value()
        },
        SizeClass::Bulk | SizeClass::Giant => {
            return bulk_region_size::<C>(representative(class));
        },
    };

    let floor = C::MIN_SHEET_PAGES * page.value();

    cmp::max(page.round_up(bytes), floor)
}

/// Returns the number of bytes to provision for a single gigabyte-scale request.
///
/// A logarithmic taper, `1 + 0.1 ln(size / 1 GB)` floored at 1, rounded up to the next power of 2. No overcommit
/// multiplier applies at this scale; inflating a giant allocation would be ruinous.
pub fn bulk_region_size<C>(request: usize) -> usize
    where
        C: Config,
{
    const GIGABYTE: f64 = (1024 * 1024 * 1024) as f64;

    let factor = 1.0 + 0.1 * ln(request as f64 / GIGABYTE);
    let factor = if factor < 1.0 { 1.0 } else { factor };

    let bytes = cmp::max((request as f64 * factor) as usize, request);

    PowerOf2::ceil(C::PAGE_SIZE.round_up(bytes)).value()
}

//  Representative size of a class: its upper bound, except for Giant which has none.
fn representative(class: SizeClass) -> usize {
    class.limit().unwrap_or(SizeClass::BULK_LIMIT)
}

#[cfg(test)]
mod tests {

use super::*;

//  The curves only take realistic shape with a realistic page size; the shared tiny test configuration is no use here.
struct CurveConfig;

impl Config for CurveConfig {
    const PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4096) };

    const ARENA_PAGES: usize = 256;

    const MIN_SHEET_PAGES: usize = 32;

    const CACHE_STEP_PAGES: usize = 768;

    const OVERCOMMIT: usize = 2;

    const MAX_RETRIES: usize = 2;

    const ALLOC_LIMIT: Option<usize> = None;

    const EAGER_INIT: bool = true;
}

#[test]
fn size_class_of() {
    assert_eq!(SizeClass::Precise, SizeClass::of(0));
    assert_eq!(SizeClass::Precise, SizeClass::of(1));
    assert_eq!(SizeClass::Precise, SizeClass::of(256));
    assert_eq!(SizeClass::Small, SizeClass::of(257));
    assert_eq!(SizeClass::Small, SizeClass::of(512));
    assert_eq!(SizeClass::Medium, SizeClass::of(513));
    assert_eq!(SizeClass::Medium, SizeClass::of(4096));
    assert_eq!(SizeClass::Large, SizeClass::of(4097));
    assert_eq!(SizeClass::Large, SizeClass::of(32768));
    assert_eq!(SizeClass::Huge, SizeClass::of(32769));
    assert_eq!(SizeClass::Huge, SizeClass::of(262144));
    assert_eq!(SizeClass::Bulk, SizeClass::of(262145));
    assert_eq!(SizeClass::Bulk, SizeClass::of(1 << 30));
    assert_eq!(SizeClass::Giant, SizeClass::of((1 << 30) + 1));
}

#[test]
fn size_class_monotonic() {
    let mut previous = SizeClass::of(0);

    for shift in 0..40 {
        let current = SizeClass::of(1usize << shift);

        assert!(previous <= current, "classify not monotonic at 1 << {}", shift);

        previous = current;
    }
}

#[test]
fn span_sentinels() {
    assert!(Span::EMPTY.is_empty());
    assert!(!Span::EMPTY.is_failure());

    assert!(Span::FAILURE.is_failure());
    assert!(!Span::FAILURE.is_empty());

    let span = Span::new(4096 as *mut u8, 256);
    assert!(span.is_allocation());
}

#[test]
fn expected_region_size_floored() {
    //  Small classes fall below the floor; they get the minimum Sheet.
    let floor = CurveConfig::MIN_SHEET_PAGES * CurveConfig::PAGE_SIZE.value();

    assert_eq!(floor, expected_region_size::<CurveConfig>(SizeClass::Precise));
    assert_eq!(floor, expected_region_size::<CurveConfig>(SizeClass::Small));
}

#[test]
fn expected_region_size_page_multiple() {
    let page = CurveConfig::PAGE_SIZE.value();

    for class in [SizeClass::Precise, SizeClass::Small, SizeClass::Medium].iter() {
        let bytes = expected_region_size::<CurveConfig>(*class);

        assert_eq!(0, bytes % page, "{:?} -> {} not a page multiple", class, bytes);
    }
}

#[test]
fn expected_region_size_super_linear() {
    //  Each class provisions at least as much as the one below it.
    let mut previous = 0;

    for class in [SizeClass::Precise, SizeClass::Small, SizeClass::Medium, SizeClass::Large, SizeClass::Huge].iter() {
        let bytes = expected_region_size::<CurveConfig>(*class);

        assert!(bytes >= previous, "{:?} -> {} < {}", class, bytes, previous);

        previous = bytes;
    }
}

#[test]
fn bulk_region_size_below_taper() {
    //  Below 1 GB the factor floors at 1: a bare power-of-2 round-up.
    assert_eq!(1 << 29, bulk_region_size::<CurveConfig>((1 << 29) - 12345));
    assert_eq!(1 << 29, bulk_region_size::<CurveConfig>(1 << 29));
    assert_eq!(1 << 30, bulk_region_size::<CurveConfig>((1 << 29) + 1));
}

#[test]
fn bulk_region_size_tapered() {
    //  At 4 GB the factor is 1 + 0.1 ln(4) ~ 1.14; the round-up lands on 8 GB.
    let four_gigabytes = 4usize << 30;

    assert_eq!(8usize << 30, bulk_region_size::<CurveConfig>(four_gigabytes + 1));
    assert!(bulk_region_size::<CurveConfig>(four_gigabytes) >= four_gigabytes);
}

}
