//! Navigation estimation.
//!
//! Consumes `Sensors` snapshots from the registry and fuses them into the
//! published `Navigation` estimate. The estimator runs a calibration phase
//! first (gravity vector and per-IMU gyro bias), then an operational phase
//! where each tick applies the update variant matching whichever sensor
//! groups advanced: gyro integration for orientation, gravity-corrected
//! accelerometer integration for velocity and displacement, proximity
//! corrections for orientation and ride height, and stripe-count snapping
//! for forward displacement.
//!
//! Calibration completion is the synchronisation point of the whole run:
//! the estimator publishes `Operational`, emits `CalibrationComplete`, and
//! then parks on the post-calibration barrier where the motor controller
//! rendezvouses before its first acceleration tick.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::{UnitQuaternion, Vector3};
use telemetry::{
    ModuleStatus, Navigation, Registry, Sensors, State, StripeCount, Timestamp, NUM_IMUS,
};
use tracing::{debug, error, info};

use crate::state_machine::{Event, EventSender};

/// Emergency deceleration assumed by the braking-distance derivation, m/s².
const EMERGENCY_DECELERATION: f64 = 24.0;

/// Nominal rangefinder reading when the pod sits level, millimetres.
const NOMINAL_RIDE_HEIGHT_MM: f64 = 25.0;

/// Longitudinal distance between the front and back proximity banks, metres.
const PROXI_BASELINE_M: f64 = 3.0;

/// Blend gains for the proximity corrections.
const PROXI_ORIENTATION_GAIN: f64 = 0.02;
const PROXI_DISPLACEMENT_GAIN: f64 = 0.1;

/// Sleep between polls when no fresh IMU data is available.
const IDLE_POLL: Duration = Duration::from_micros(500);

/// Minimum stopping distance at the emergency deceleration limit.
pub fn emergency_braking_distance(velocity: f64) -> f64 {
    velocity * velocity / (2.0 * EMERGENCY_DECELERATION)
}

/// Tunables for the estimator.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// IMU readings required before calibration may finish.
    pub min_calibration_samples: u32,
    /// Wall-clock budget for calibration once the pod enters `Calibrating`.
    pub calibration_timeout: Duration,
    /// Track distance between reflective stripes, metres.
    pub stripe_spacing: f64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            min_calibration_samples: 200_000,
            calibration_timeout: Duration::from_secs(120),
            stripe_spacing: 30.48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EstimatorState {
    Init,
    Calibrating,
    Operational,
}

/// Which sensor groups advanced since the estimator last looked.
#[derive(Debug, Clone, Copy)]
struct AdvancedGroups {
    imu: bool,
    proxi: bool,
    stripe: bool,
}

/// The navigation worker.
pub struct NavigationEstimator {
    registry: Arc<Registry>,
    events: EventSender,
    barrier: Arc<Barrier>,
    config: NavigationConfig,

    state: EstimatorState,
    calibration_deadline: Option<Instant>,

    // Calibration accumulators.
    gravity_sum: Vector3<f64>,
    gyro_bias_sum: [Vector3<f64>; NUM_IMUS],
    calibration_snapshots: u32,

    // Calibration results.
    gravity: Vector3<f64>,
    gyro_bias: [Vector3<f64>; NUM_IMUS],

    // Fused estimate in the track frame (x forward, z up).
    orientation: UnitQuaternion<f64>,
    acceleration: Vector3<f64>,
    velocity: Vector3<f64>,
    displacement: Vector3<f64>,

    // Freshness bookkeeping.
    last_imu_stamp: [Timestamp; NUM_IMUS],
    last_front_stamp: Timestamp,
    last_back_stamp: Timestamp,
    last_stripe_stamp: Timestamp,
    last_tick: Option<Timestamp>,

    data: Navigation,
}

impl NavigationEstimator {
    pub fn new(
        registry: Arc<Registry>,
        events: EventSender,
        barrier: Arc<Barrier>,
        config: NavigationConfig,
    ) -> Self {
        let data = Navigation::default();
        registry.set_navigation(data);
        Self {
            registry,
            events,
            barrier,
            config,
            state: EstimatorState::Init,
            calibration_deadline: None,
            gravity_sum: Vector3::zeros(),
            gyro_bias_sum: [Vector3::zeros(); NUM_IMUS],
            calibration_snapshots: 0,
            gravity: Vector3::zeros(),
            gyro_bias: [Vector3::zeros(); NUM_IMUS],
            orientation: UnitQuaternion::identity(),
            acceleration: Vector3::zeros(),
            velocity: Vector3::zeros(),
            displacement: Vector3::zeros(),
            last_imu_stamp: [Timestamp::ZERO; NUM_IMUS],
            last_front_stamp: Timestamp::ZERO,
            last_back_stamp: Timestamp::ZERO,
            last_stripe_stamp: Timestamp::ZERO,
            last_tick: None,
            data,
        }
    }

    /// Run until shutdown or a calibration timeout.
    pub fn run(mut self) {
        info!(target: "navigation", "navigation estimator started");
        loop {
            if !self.registry.is_running() {
                return;
            }

            let pod = self.registry.state_machine();
            if pod.current_state == State::Calibrating && self.calibration_deadline.is_none() {
                self.calibration_deadline = Some(Instant::now() + self.config.calibration_timeout);
            }
            if self.state != EstimatorState::Operational {
                if let Some(deadline) = self.calibration_deadline {
                    if Instant::now() > deadline {
                        error!(
                            target: "navigation",
                            "CRITICAL: calibration did not complete within {:?}",
                            self.config.calibration_timeout
                        );
                        self.data.module_status = ModuleStatus::CriticalFailure;
                        self.registry.set_navigation(self.data);
                        return;
                    }
                }
            }

            let sensors = self.registry.sensors();
            let advanced = self.observe(&sensors);
            if !advanced.imu {
                thread::sleep(IDLE_POLL);
                continue;
            }

            match self.state {
                EstimatorState::Init => {
                    self.state = EstimatorState::Calibrating;
                    self.data.module_status = ModuleStatus::Init;
                    self.registry.set_navigation(self.data);
                    info!(target: "navigation", "first sensor tick, calibrating");
                }
                EstimatorState::Calibrating => {
                    self.calibration_update(&sensors);
                    let run_started = matches!(
                        pod.current_state,
                        State::Calibrating | State::Ready | State::Accelerating
                    );
                    if self.calibration_samples() >= self.config.min_calibration_samples
                        && run_started
                    {
                        self.finish_calibration();
                    }
                }
                EstimatorState::Operational => {
                    self.update(&sensors, advanced);
                    self.publish();
                }
            }
        }
    }

    /// Compare sensor timestamps against the last observed set and record
    /// the new ones.
    fn observe(&mut self, sensors: &Sensors) -> AdvancedGroups {
        let mut imu = false;
        for i in 0..NUM_IMUS {
            if sensors.imu[i].acc.timestamp != self.last_imu_stamp[i] {
                imu = true;
                self.last_imu_stamp[i] = sensors.imu[i].acc.timestamp;
            }
        }

        let front = sensors.proxi_front.timestamp != self.last_front_stamp
            && sensors.proxi_front.timestamp != Timestamp::ZERO;
        let back = sensors.proxi_back.timestamp != self.last_back_stamp
            && sensors.proxi_back.timestamp != Timestamp::ZERO;
        if front {
            self.last_front_stamp = sensors.proxi_front.timestamp;
        }
        if back {
            self.last_back_stamp = sensors.proxi_back.timestamp;
        }

        let stripe = sensors.stripe_count.timestamp != self.last_stripe_stamp
            && sensors.stripe_count.timestamp != Timestamp::ZERO;
        if stripe {
            self.last_stripe_stamp = sensors.stripe_count.timestamp;
        }

        AdvancedGroups {
            imu,
            proxi: front && back,
            stripe,
        }
    }

    fn calibration_samples(&self) -> u32 {
        self.calibration_snapshots.saturating_mul(NUM_IMUS as u32)
    }

    /// Accumulate the gravity vector and per-IMU gyro bias.
    fn calibration_update(&mut self, sensors: &Sensors) {
        for (i, imu) in sensors.imu.iter().enumerate() {
            self.gravity_sum += imu.acc.value;
            self.gyro_bias_sum[i] += imu.gyr.value;
        }
        self.calibration_snapshots += 1;
    }

    /// Freeze the calibration results, go operational, and rendezvous with
    /// the motor controller.
    ///
    /// `Operational` is published *before* parking on the barrier, so the
    /// motor controller can never observe the barrier released while the
    /// estimate is still calibrating.
    fn finish_calibration(&mut self) {
        let snapshots = self.calibration_snapshots.max(1) as f64;
        self.gravity = self.gravity_sum / (snapshots * NUM_IMUS as f64);
        for i in 0..NUM_IMUS {
            self.gyro_bias[i] = self.gyro_bias_sum[i] / snapshots;
        }

        self.state = EstimatorState::Operational;
        self.data.module_status = ModuleStatus::Ready;
        self.publish();
        info!(
            target: "navigation",
            "calibration complete after {} samples, |g| = {:.3} m/s²",
            self.calibration_samples(),
            self.gravity.norm()
        );
        let _ = self.events.send(Event::CalibrationComplete);

        debug!(target: "navigation", "waiting on post-calibration barrier");
        self.barrier.wait();
        debug!(target: "navigation", "post-calibration barrier released");
    }

    /// One operational tick.
    fn update(&mut self, sensors: &Sensors, advanced: AdvancedGroups) {
        let now = sensors
            .imu
            .iter()
            .map(|imu| imu.acc.timestamp)
            .max()
            .unwrap_or(Timestamp::ZERO);
        let dt = match self.last_tick {
            Some(prev) => now.seconds_since(prev),
            None => {
                self.last_tick = Some(now);
                return;
            }
        };
        self.last_tick = Some(now);
        if dt <= 0.0 {
            return;
        }

        let mut mean_acc = Vector3::zeros();
        let mut mean_gyr = Vector3::zeros();
        for (i, imu) in sensors.imu.iter().enumerate() {
            mean_acc += imu.acc.value;
            mean_gyr += imu.gyr.value - self.gyro_bias[i];
        }
        mean_acc /= NUM_IMUS as f64;
        mean_gyr /= NUM_IMUS as f64;

        // Gyro integration keeps the orientation current so the gravity
        // subtraction below stays valid as the pod pitches.
        self.orientation = UnitQuaternion::from_scaled_axis(mean_gyr * dt) * self.orientation;

        let world_acc = self.orientation * mean_acc - self.gravity;
        self.acceleration = world_acc;
        self.velocity += world_acc * dt;
        self.displacement += self.velocity * dt;
        if self.velocity.x < 0.0 {
            self.velocity.x = 0.0;
        }

        if advanced.proxi {
            self.proximity_orientation_update(sensors);
            self.proximity_displacement_update(sensors);
        }
        if advanced.stripe {
            // Applied after the proximity correction: stripe edges are
            // absolute track marks and win any displacement disagreement.
            self.stripe_update(sensors.stripe_count);
        }
    }

    fn proximity_orientation_update(&mut self, sensors: &Sensors) {
        let front = bank_mean(&sensors.proxi_front.value);
        let back = bank_mean(&sensors.proxi_back.value);
        let measured_pitch = ((back - front) / 1000.0 / PROXI_BASELINE_M).atan();

        let (roll, pitch, yaw) = self.orientation.euler_angles();
        let corrected = pitch + PROXI_ORIENTATION_GAIN * (measured_pitch - pitch);
        self.orientation = UnitQuaternion::from_euler_angles(roll, corrected, yaw);
    }

    fn proximity_displacement_update(&mut self, sensors: &Sensors) {
        let mean = (bank_mean(&sensors.proxi_front.value) + bank_mean(&sensors.proxi_back.value))
            / 2.0;
        let measured_z = (NOMINAL_RIDE_HEIGHT_MM - mean) / 1000.0;
        self.displacement.z += PROXI_DISPLACEMENT_GAIN * (measured_z - self.displacement.z);
    }

    fn stripe_update(&mut self, stripe: StripeCount) {
        self.data.stripe_count = stripe.value;
        self.displacement.x = stripe.value as f64 * self.config.stripe_spacing;
    }

    fn publish(&mut self) {
        let forward = self.velocity.x.max(0.0);
        self.data.distance = self.displacement.x;
        self.data.velocity = forward;
        self.data.acceleration = self.acceleration.x;
        self.data.emergency_braking_distance = emergency_braking_distance(forward);
        self.registry.set_navigation(self.data);
    }
}

fn bank_mean(bank: &[telemetry::Proximity]) -> f64 {
    if bank.is_empty() {
        return NOMINAL_RIDE_HEIGHT_MM;
    }
    bank.iter().map(|p| p.val as f64).sum::<f64>() / bank.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::mpsc;
    use telemetry::DataPoint;

    fn estimator(parties: usize) -> (NavigationEstimator, mpsc::Receiver<Event>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::channel();
        let estimator = NavigationEstimator::new(
            registry.clone(),
            tx,
            Arc::new(Barrier::new(parties)),
            NavigationConfig {
                min_calibration_samples: 8,
                calibration_timeout: Duration::from_secs(5),
                stripe_spacing: 30.48,
            },
        );
        (estimator, rx, registry)
    }

    fn sensors_at(micros: u64, acc: Vector3<f64>) -> Sensors {
        let mut sensors = Sensors::default();
        let stamp = Timestamp::from_micros(micros);
        for imu in sensors.imu.iter_mut() {
            imu.acc = DataPoint::new(acc, stamp);
            imu.gyr = DataPoint::new(Vector3::zeros(), stamp);
        }
        sensors
    }

    #[test]
    fn test_emergency_braking_distance_formula() {
        for velocity in [0.0, 1.0, 12.5, 90.0] {
            assert_relative_eq!(
                emergency_braking_distance(velocity),
                velocity * velocity / 48.0,
                max_relative = 1e-6
            );
        }
        assert_relative_eq!(emergency_braking_distance(10.0), 100.0 / 48.0);
    }

    #[test]
    fn test_finish_calibration_publishes_before_barrier() {
        let (mut estimator, rx, registry) = estimator(1);
        estimator.state = EstimatorState::Calibrating;
        estimator.calibration_update(&sensors_at(1_000, Vector3::new(0.0, 0.0, 9.81)));

        // A one-party barrier releases immediately, so reaching the end of
        // finish_calibration proves Operational was published first.
        estimator.finish_calibration();

        assert_eq!(registry.navigation().module_status, ModuleStatus::Ready);
        assert_eq!(rx.try_recv().unwrap(), Event::CalibrationComplete);
        assert_relative_eq!(estimator.gravity.z, 9.81, max_relative = 1e-9);
    }

    #[test]
    fn test_observe_tracks_group_freshness() {
        let (mut estimator, _rx, _registry) = estimator(1);

        let mut sensors = sensors_at(1_000, Vector3::zeros());
        sensors.proxi_front.timestamp = Timestamp::from_micros(1_000);
        sensors.proxi_back.timestamp = Timestamp::from_micros(1_000);

        let first = estimator.observe(&sensors);
        assert!(first.imu);
        assert!(first.proxi);
        assert!(!first.stripe);

        // Nothing moved: every group reads stale.
        let second = estimator.observe(&sensors);
        assert!(!second.imu);
        assert!(!second.proxi);
    }

    #[test]
    fn test_update_integrates_forward_acceleration() {
        let (mut estimator, _rx, registry) = estimator(1);
        estimator.state = EstimatorState::Operational;
        estimator.gravity = Vector3::new(0.0, 0.0, 9.81);

        let acc = Vector3::new(2.0, 0.0, 9.81);
        let first = sensors_at(1_000_000, acc);
        let advanced = estimator.observe(&first);
        estimator.update(&first, advanced); // primes the tick clock

        let second = sensors_at(2_000_000, acc);
        let advanced = estimator.observe(&second);
        estimator.update(&second, advanced);
        estimator.publish();

        let nav = registry.navigation();
        assert_relative_eq!(nav.velocity, 2.0, max_relative = 1e-9);
        assert_relative_eq!(nav.distance, 2.0, max_relative = 1e-9);
        assert_relative_eq!(nav.acceleration, 2.0, max_relative = 1e-9);
        assert_relative_eq!(
            nav.emergency_braking_distance,
            4.0 / 48.0,
            max_relative = 1e-6
        );
    }

    #[test]
    fn test_forward_velocity_never_negative() {
        let (mut estimator, _rx, registry) = estimator(1);
        estimator.state = EstimatorState::Operational;
        estimator.gravity = Vector3::new(0.0, 0.0, 9.81);

        let acc = Vector3::new(-3.0, 0.0, 9.81);
        let first = sensors_at(1_000_000, acc);
        let advanced = estimator.observe(&first);
        estimator.update(&first, advanced);

        let second = sensors_at(2_000_000, acc);
        let advanced = estimator.observe(&second);
        estimator.update(&second, advanced);
        estimator.publish();

        assert_eq!(registry.navigation().velocity, 0.0);
    }

    #[test]
    fn test_stripe_count_snaps_displacement() {
        let (mut estimator, _rx, _registry) = estimator(1);
        estimator.state = EstimatorState::Operational;
        estimator.displacement.x = 80.0;

        estimator.stripe_update(DataPoint::new(3, Timestamp::from_micros(5_000)));

        assert_relative_eq!(estimator.displacement.x, 3.0 * 30.48);
        assert_eq!(estimator.data.stripe_count, 3);
    }
}
