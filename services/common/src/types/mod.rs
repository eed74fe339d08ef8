//! Domain types shared between ingestion components

pub mod event;
pub mod health;
pub mod market;

pub use event::*;
pub use health::*;
pub use market::*;
