//! The API of flmalloc-core.

mod arena;
mod class;
mod config;
mod policy;
mod provider;
mod stats;

pub use arena::Arena;
pub use class::{bulk_region_size, expected_region_size, SizeClass, Span};
pub use config::Config;
pub use policy::{FailurePolicy, Policy};
pub use provider::{Advice, KernelProvider, MapAddress, MapError, MemoryPressure, Protection};
pub use stats::Stats;

pub use crate::utils::PowerOf2;
