//! HTTP client module (checkpoint transport).

mod download;

pub use download::*;
