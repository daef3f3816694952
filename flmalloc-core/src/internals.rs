//! The internals of flmalloc-core.
//!
//! The internals provide all the heavy-lifting.

pub(crate) mod book;
pub(crate) mod chain;
pub(crate) mod harden;
pub(crate) mod predictor;
pub(crate) mod sheet;
