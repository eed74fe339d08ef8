//! Shared domain types, errors and defaults for the market ingestion services

pub mod constants;
pub mod errors;
pub mod types;

pub use errors::*;
pub use types::*;
