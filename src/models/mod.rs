//! Core data models for maskflow.
//!
//! - `config`: the immutable run configuration
//! - `error`: error taxonomy and the crate `Result`
//! - `record`: records, handles and batches flowing through the pipeline

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
