//! Exchange adapters implementing the upstream contracts

pub mod kalshi;
