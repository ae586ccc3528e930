//! Device seams for the pod firmware.
//!
//! The worker threads in the `pod` crate never talk to transports directly;
//! they go through the capability traits defined here. The `sim` module
//! provides simulated implementations with realistic timing and noise for
//! bench runs and the integration tests.

pub mod can;
pub mod sensors;
pub mod sim;
