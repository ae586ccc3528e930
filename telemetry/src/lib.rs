//! Shared data model and telemetry registry for the pod control firmware.
//!
//! Every worker thread in the firmware exchanges state exclusively through
//! the [`Registry`]: producers commit whole snapshots of their substructure,
//! consumers poll by-value copies. There is no message bus and no shared
//! pointers between workers.

pub mod data;
pub mod registry;

pub use data::{
    Batteries, Battery, DataPoint, Imu, ModuleStatus, MotorData, Navigation, Proximity,
    ProximityBank, Sensors, State, StateMachineData, StripeCount, Timestamp, NUM_HP_BATTERIES,
    NUM_IMUS, NUM_LP_BATTERIES, NUM_MOTORS, NUM_PROXIMITIES,
};
pub use registry::{lock, Registry};
