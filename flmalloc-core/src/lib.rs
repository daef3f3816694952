#![no_std]

#![deny(missing_docs)]

//! Building blocks for a hardened user-space allocator.
//!
//! flmalloc-core is the engine of a malloc replacement built around buddy-managed Regions. It contains:
//! -   A provider trait, used to obtain raw Regions of memory from the kernel to be carved up.
//! -   The Arena, a single-threaded engine serving size-classed requests out of Bucket Chains of Sheets, with
//!     tombstoning, guard pages, and provenance checking as runtime policies.
//!
//! The crate is freestanding and generic over its kernel interface; wiring it to an actual platform, and making it
//! safe to share across threads, is the frontend's business.

mod api;
mod internals;
mod utils;

pub use api::*;
