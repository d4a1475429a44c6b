//! System telemetry core: a sampler feeding a bounded snapshot window,
//! window statistics, cooldown-gated incident detection, and read-only
//! history queries served as tool calls.

pub mod aggregator;
pub mod bridge;
pub mod collector;
pub mod config;
pub mod detector;
pub mod error;
pub mod protocol;
pub mod sampler;
pub mod snapshot;
pub mod socket;
pub mod window;
