//! Sensor capability traits.
//!
//! Every pod sensor boils down to the same two capabilities: read the latest
//! value, and say whether the device is currently online. The aggregator
//! owns one boxed device per physical sensor for the lifetime of the run and
//! polls it from a manager thread.
//!
//! Real transports (I²C to the MPU9250 and VL6180, CAN to the BMS and the
//! CAN-attached rangefinders, GPIO for the stripe counter) live behind these
//! traits; the [`sim`](crate::sim) module provides in-process stand-ins.

use telemetry::{Battery, DataPoint, Imu, Proximity, StripeCount};
use thiserror::Error;

/// Errors surfaced by a single sensor read.
///
/// A one-off `ReadFailed` is transient: the caller logs it at DEBUG and
/// keeps the stale value. A device that keeps failing takes itself offline
/// and reports `Offline` until it recovers.
#[derive(Error, Debug)]
pub enum SensorError {
    /// Single read failed; retry next cycle.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Device is offline and excluded from freshness checks.
    #[error("device offline")]
    Offline,

    /// Transport-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sensor reads.
pub type SensorResult<T> = Result<T, SensorError>;

/// An inertial measurement unit (accelerometer + gyroscope).
pub trait ImuSensor: Send {
    /// Latest accelerometer and gyroscope reading, each stamped with the
    /// time it was taken.
    fn read(&mut self) -> SensorResult<Imu>;

    /// Whether the device currently responds on its transport.
    fn is_online(&self) -> bool;
}

/// A time-of-flight rangefinder.
pub trait ProximitySensor: Send {
    fn read(&mut self) -> SensorResult<DataPoint<Proximity>>;

    fn is_online(&self) -> bool;
}

/// A battery management system reporting one pack.
pub trait BatterySensor: Send {
    fn read(&mut self) -> SensorResult<Battery>;

    fn is_online(&self) -> bool;
}

/// The reflective-stripe edge counter.
pub trait StripeCounter: Send {
    /// Total edges counted since process start, stamped with the time of
    /// the most recent edge. The timestamp is non-decreasing.
    fn read(&mut self) -> SensorResult<StripeCount>;

    fn is_online(&self) -> bool;
}
