// ===============================
// src/lib.rs
// ===============================
//
// Venue connectivity and reconciliation core: signed REST, rate limiting,
// circuit breaking, streams, order book replicas and the order/position
// state kept equal to the venue.
//
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod market;
pub mod metrics;
pub mod orderbook;
pub mod orders;
pub mod persist;
pub mod rate_limiter;
pub mod reconcile;
pub mod recorder;
pub mod rest;
pub mod shutdown;
pub mod signing;
pub mod state;
pub mod stream;
pub mod transport;
pub mod wire;
