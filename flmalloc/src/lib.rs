#![no_std]
#![deny(missing_docs)]

//! A hardened memory allocator library.
//!
//! The type `FlAllocator` provides a hardened memory allocator, as a drop-in replacement for regular allocators:
//! freed memory is tombstoned rather than recycled by default, and guard pages, poisoning, and provenance checking
//! are available as policies.
//!
//! #   Warning
//!
//! This allocator trades memory for safety. Long-lived processes churning through many short-lived allocations will
//! see their footprint grow until whole Sheets can be reclaimed.
//!
//! See the README.md file for the limitations and trade-offs made.

mod allocator;
mod instance;
mod platform;

pub use allocator::FlAllocator;

pub use flmalloc_core::{SizeClass, Span, Stats};
