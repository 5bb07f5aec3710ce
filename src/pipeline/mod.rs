//! Pipeline module - manifest pairing and the mask generation run.

mod layout;
mod manifest;
mod pairing;
mod report;
mod runner;

pub use layout::*;
pub use manifest::*;
pub use pairing::*;
pub use report::*;
pub use runner::*;
