//! CAN motor-controller bus abstraction.
//!
//! The pod drives four wheel motor controllers over CAN. Frame layout and
//! the CANopen state dance are transport concerns; the control loop only
//! needs the operation set in [`MotorBus`]. [`SimMotorBus`] implements the
//! same operations against a slew-limited four-motor model so the control
//! loop can be exercised without a bus.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use telemetry::{Timestamp, NUM_MOTORS};
use thiserror::Error;
use tracing::debug;

use crate::sim::SimClock;

/// Errors reported by the motor bus.
#[derive(Error, Debug)]
pub enum CanError {
    /// Controllers have not been registered on the bus yet.
    #[error("controllers not registered")]
    NotRegistered,

    /// A motion command was issued outside operational mode.
    #[error("controllers not in operational mode")]
    NotOperational,

    /// Controller configuration was rejected.
    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    /// A controller raised a fault flag during a health check.
    #[error("controller {id} fault")]
    ControllerFault { id: usize },

    /// Transport-level bus error.
    #[error("bus error: {0}")]
    Bus(String),
}

/// Result type for motor bus operations.
pub type CanResult<T> = Result<T, CanError>;

/// Operation set the motor control loop requires from the CAN transport.
///
/// All four controllers are always addressed together; per-controller
/// values travel as fixed arrays indexed by controller id.
pub trait MotorBus: Send {
    /// Register all four controllers on the bus.
    fn register_controllers(&mut self) -> CanResult<()>;

    /// Push configuration parameters to every controller.
    fn configure_controllers(&mut self) -> CanResult<()>;

    /// Bring every controller into operational mode.
    fn prepare_motors(&mut self) -> CanResult<()>;

    /// Poll controller status words for faults and warnings.
    fn health_check(&mut self) -> CanResult<()>;

    /// Command a target angular velocity (rpm) per controller.
    fn send_target_velocity(&mut self, rpm: [i32; NUM_MOTORS]) -> CanResult<()>;

    /// Command a target torque per controller.
    fn send_target_torque(&mut self, torque: [i16; NUM_MOTORS]) -> CanResult<()>;

    /// Read back the actual angular velocity (rpm) per controller.
    fn request_actual_velocity(&mut self) -> CanResult<[i32; NUM_MOTORS]>;

    /// Read back the actual torque per controller.
    fn request_actual_torque(&mut self) -> CanResult<[i16; NUM_MOTORS]>;

    /// Issue a quick-stop to all controllers at once.
    fn quick_stop_all(&mut self) -> CanResult<()>;

    /// Command every controller into the pre-operational (safe) state.
    fn enter_pre_operational(&mut self) -> CanResult<()>;
}

/// Counters and fault injection shared between a [`SimMotorBus`] and a test.
///
/// Counters are bumped on every accepted command, which lets a test assert
/// things like "no velocity command was sent before the barrier released"
/// without reaching into the bus.
#[derive(Debug, Default)]
pub struct SimBusProbe {
    pub velocity_commands: AtomicU64,
    pub torque_commands: AtomicU64,
    pub quick_stops: AtomicU64,
    pub pre_operational_commands: AtomicU64,
    fault: AtomicBool,
}

impl SimBusProbe {
    /// Make the next health check report a controller fault.
    pub fn inject_fault(&self) {
        self.fault.store(true, Ordering::SeqCst);
    }

    fn has_fault(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }
}

/// Rates for the simulated motor model.
const SLEW_RPM_PER_S: f64 = 6_000.0;
const BRAKE_RPM_PER_S: f64 = 12_000.0;

/// Four simulated motor controllers with slew-limited velocity tracking.
///
/// Velocities track the commanded targets at a bounded rate and decay to
/// zero under quick-stop, so stop procedures observe a realistic ramp-down
/// rather than an instant halt.
pub struct SimMotorBus {
    clock: SimClock,
    probe: Arc<SimBusProbe>,
    registered: bool,
    configured: bool,
    operational: bool,
    quick_stopped: bool,
    targets: [i32; NUM_MOTORS],
    torque_targets: [i16; NUM_MOTORS],
    velocity: [f64; NUM_MOTORS],
    last_step: Timestamp,
}

impl SimMotorBus {
    pub fn new(clock: SimClock) -> Self {
        let now = clock.now();
        Self {
            clock,
            probe: Arc::new(SimBusProbe::default()),
            registered: false,
            configured: false,
            operational: false,
            quick_stopped: false,
            targets: [0; NUM_MOTORS],
            torque_targets: [0; NUM_MOTORS],
            velocity: [0.0; NUM_MOTORS],
            last_step: now,
        }
    }

    /// Shared handle for command counters and fault injection.
    pub fn probe(&self) -> Arc<SimBusProbe> {
        self.probe.clone()
    }

    /// Advance the motor model to the current time.
    fn step(&mut self) {
        let now = self.clock.now();
        let dt = now.seconds_since(self.last_step);
        self.last_step = now;
        if dt <= 0.0 {
            return;
        }

        for i in 0..NUM_MOTORS {
            let (target, rate) = if self.quick_stopped || !self.operational {
                (0.0, BRAKE_RPM_PER_S)
            } else {
                (self.targets[i] as f64, SLEW_RPM_PER_S)
            };
            let delta = target - self.velocity[i];
            let step = rate * dt;
            if delta.abs() <= step {
                self.velocity[i] = target;
            } else {
                self.velocity[i] += step * delta.signum();
            }
        }
    }
}

impl MotorBus for SimMotorBus {
    fn register_controllers(&mut self) -> CanResult<()> {
        self.registered = true;
        debug!(target: "can", "controllers registered");
        Ok(())
    }

    fn configure_controllers(&mut self) -> CanResult<()> {
        if !self.registered {
            return Err(CanError::NotRegistered);
        }
        self.configured = true;
        debug!(target: "can", "controllers configured");
        Ok(())
    }

    fn prepare_motors(&mut self) -> CanResult<()> {
        if !self.configured {
            return Err(CanError::ConfigurationFailed(
                "controllers not configured".to_string(),
            ));
        }
        self.operational = true;
        self.quick_stopped = false;
        debug!(target: "can", "controllers operational");
        Ok(())
    }

    fn health_check(&mut self) -> CanResult<()> {
        if self.probe.has_fault() {
            return Err(CanError::ControllerFault { id: 0 });
        }
        Ok(())
    }

    fn send_target_velocity(&mut self, rpm: [i32; NUM_MOTORS]) -> CanResult<()> {
        if !self.operational {
            return Err(CanError::NotOperational);
        }
        self.targets = rpm;
        self.probe.velocity_commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_target_torque(&mut self, torque: [i16; NUM_MOTORS]) -> CanResult<()> {
        if !self.operational {
            return Err(CanError::NotOperational);
        }
        self.torque_targets = torque;
        self.probe.torque_commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn request_actual_velocity(&mut self) -> CanResult<[i32; NUM_MOTORS]> {
        self.step();
        let mut out = [0i32; NUM_MOTORS];
        for (slot, v) in out.iter_mut().zip(self.velocity.iter()) {
            *slot = v.round() as i32;
        }
        Ok(out)
    }

    fn request_actual_torque(&mut self) -> CanResult<[i16; NUM_MOTORS]> {
        Ok(self.torque_targets)
    }

    fn quick_stop_all(&mut self) -> CanResult<()> {
        self.quick_stopped = true;
        self.targets = [0; NUM_MOTORS];
        self.torque_targets = [0; NUM_MOTORS];
        self.probe.quick_stops.fetch_add(1, Ordering::SeqCst);
        debug!(target: "can", "quick stop issued");
        Ok(())
    }

    fn enter_pre_operational(&mut self) -> CanResult<()> {
        self.operational = false;
        self.probe
            .pre_operational_commands
            .fetch_add(1, Ordering::SeqCst);
        debug!(target: "can", "controllers pre-operational");
        Ok(())
    }
}
