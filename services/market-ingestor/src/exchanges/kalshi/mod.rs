//! Kalshi trade API v2 adapters

pub mod rest;
pub mod websocket;

pub use rest::KalshiRestClient;
pub use websocket::KalshiWsConnector;
