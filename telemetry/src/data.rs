//! Published telemetry substructures.
//!
//! Each struct here is a plain-old-data snapshot: `Copy`, zero-initialised at
//! process start, and committed to the [`Registry`](crate::Registry) as a
//! whole. Producers never publish partially-updated values.

use nalgebra::Vector3;

/// Number of inertial measurement units on the pod.
pub const NUM_IMUS: usize = 8;
/// Rangefinders per proximity bank (one bank at each end of the pod).
pub const NUM_PROXIMITIES: usize = 24;
/// Low-power battery packs (electronics supply).
pub const NUM_LP_BATTERIES: usize = 2;
/// High-power battery packs (propulsion supply).
pub const NUM_HP_BATTERIES: usize = 2;
/// Wheel motor controllers on the CAN bus.
pub const NUM_MOTORS: usize = 4;

/// Microseconds since process start.
///
/// Every sensor reading carries one of these; producers guarantee the value
/// is non-decreasing, which is what the aggregator's publish-on-change
/// policy keys off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from microseconds.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Get the timestamp as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Elapsed seconds between `earlier` and `self`. Saturates at zero if
    /// the arguments are out of order.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 * 1e-6
    }
}

/// A sensor value paired with the time it was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DataPoint<T> {
    pub value: T,
    pub timestamp: Timestamp,
}

impl<T> DataPoint<T> {
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// One IMU reading: accelerometer and gyroscope triples.
///
/// Acceleration in m/s², angular rate in rad/s, both in the sensor frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Imu {
    pub acc: DataPoint<Vector3<f64>>,
    pub gyr: DataPoint<Vector3<f64>>,
}

impl Default for Imu {
    fn default() -> Self {
        Self {
            acc: DataPoint::new(Vector3::zeros(), Timestamp::ZERO),
            gyr: DataPoint::new(Vector3::zeros(), Timestamp::ZERO),
        }
    }
}

/// One time-of-flight rangefinder reading, in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Proximity {
    pub val: u8,
}

/// A full sweep of one proximity bank. The timestamp covers the whole bank
/// and advances only when a complete sweep of the online devices finished.
pub type ProximityBank = DataPoint<[Proximity; NUM_PROXIMITIES]>;

/// Reflective-stripe edge count with the time of the last counted edge.
pub type StripeCount = DataPoint<u32>;

/// Latest raw readings from every pod-mounted sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensors {
    pub imu: [Imu; NUM_IMUS],
    pub proxi_front: ProximityBank,
    pub proxi_back: ProximityBank,
    pub stripe_count: StripeCount,
}

impl Default for Sensors {
    fn default() -> Self {
        Self {
            imu: [Imu::default(); NUM_IMUS],
            proxi_front: ProximityBank::default(),
            proxi_back: ProximityBank::default(),
            stripe_count: StripeCount::default(),
        }
    }
}

/// One battery pack report from a BMS.
///
/// Voltage in decivolts, current in deciamps, temperature in °C, charge in
/// percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Battery {
    pub voltage: u16,
    pub current: i16,
    pub temperature: i8,
    pub charge: u8,
}

/// Latest state of every battery pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Batteries {
    pub low_power: [Battery; NUM_LP_BATTERIES],
    pub high_power: [Battery; NUM_HP_BATTERIES],
}

/// Per-subsystem readiness, published alongside each subsystem's data.
///
/// `CriticalFailure` is a one-way street: the state machine reacts to it by
/// forcing emergency braking and the reporting module never clears it for
/// the remainder of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModuleStatus {
    #[default]
    Start,
    Init,
    Ready,
    CriticalFailure,
}

/// Fused motion estimate published by the navigation estimator.
///
/// `velocity` is the forward component and is never negative;
/// `emergency_braking_distance` is `velocity² / (2 · 24 m/s²)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Navigation {
    /// Forward displacement from the start of the run, metres.
    pub distance: f64,
    /// Forward velocity, m/s, clamped non-negative.
    pub velocity: f64,
    /// Forward acceleration, m/s², signed.
    pub acceleration: f64,
    /// Minimum stopping distance at the emergency deceleration limit, metres.
    pub emergency_braking_distance: f64,
    /// Stripe edges counted so far.
    pub stripe_count: u32,
    pub module_status: ModuleStatus,
}

/// Actual wheel motor state as last reported over CAN.
///
/// All four velocities at zero means the motors are fully stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorData {
    /// Angular velocity per controller, rpm.
    pub velocity: [i32; NUM_MOTORS],
    /// Torque per controller, controller units.
    pub torque: [i16; NUM_MOTORS],
    pub module_status: ModuleStatus,
}

/// Global pod state owned by the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum State {
    #[default]
    Idle,
    Calibrating,
    Ready,
    Accelerating,
    Cruising,
    Decelerating,
    RunComplete,
    Exiting,
    EmergencyBraking,
    FailureStopped,
}

impl State {
    /// The terminal state; nothing transitions out of it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::FailureStopped)
    }
}

/// State machine snapshot every other worker dispatches on.
///
/// `critical_failure` is monotonic: once true it stays true for the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateMachineData {
    pub current_state: State,
    pub critical_failure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_seconds_since() {
        let a = Timestamp::from_micros(1_000_000);
        let b = Timestamp::from_micros(3_500_000);
        assert!((b.seconds_since(a) - 2.5).abs() < 1e-12);
        // Out-of-order arguments saturate instead of going negative.
        assert_eq!(a.seconds_since(b), 0.0);
    }

    #[test]
    fn test_zero_initialised_defaults() {
        let sensors = Sensors::default();
        assert_eq!(sensors.stripe_count.value, 0);
        assert_eq!(sensors.imu[0].acc.timestamp, Timestamp::ZERO);

        let motors = MotorData::default();
        assert_eq!(motors.velocity, [0; NUM_MOTORS]);
        assert_eq!(motors.module_status, ModuleStatus::Start);

        let sm = StateMachineData::default();
        assert_eq!(sm.current_state, State::Idle);
        assert!(!sm.critical_failure);
    }

    #[test]
    fn test_only_failure_stopped_is_terminal() {
        use strum::IntoEnumIterator;
        for state in State::iter() {
            assert_eq!(state.is_terminal(), state == State::FailureStopped);
        }
    }
}
