//! Worker threads and entry points for the pod control firmware.
//!
//! Each module here is one long-lived worker: the sensor aggregator,
//! the navigation estimator, the pod state machine, the motor controller,
//! and the ground-station link. Workers communicate exclusively through the
//! [`telemetry::Registry`] plus the state machine's event channel, and every
//! loop polls the registry's `running` flag for shutdown.

pub mod comms;
pub mod config;
pub mod motor;
pub mod navigation;
pub mod sensors;
pub mod state_machine;
