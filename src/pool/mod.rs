//! Worker pool module.

mod worker;

pub use worker::*;
