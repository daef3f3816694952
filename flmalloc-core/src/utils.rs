//! A collection of utilities.

mod log;
mod power_of_2;

pub use power_of_2::PowerOf2;

pub(crate) use log::ln;
