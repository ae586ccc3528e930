//! Motor control.
//!
//! A single cooperative worker that tracks the pod state machine and drives
//! the four CAN motor controllers through a [`Communicator`]. The worker
//! guarantees a safe stop on any failure path: a critical-failure flag from
//! the state machine, a failed health check, or an explicit
//! `EmergencyBraking` state all funnel into [`MotorControl::stop_motors`],
//! which quick-stops every controller and polls until all four report zero.
//!
//! The first acceleration tick waits on the post-calibration barrier so no
//! velocity command can be sent before navigation has gone operational.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hardware::can::{CanResult, MotorBus};
use telemetry::{ModuleStatus, MotorData, Registry, State, NUM_MOTORS};
use tracing::{debug, error, info};

use crate::state_machine::{Event, EventSender};

/// Control-loop tick.
const TICK: Duration = Duration::from_millis(10);

/// Poll interval while waiting for the motors to spin down.
const STOP_POLL: Duration = Duration::from_millis(5);

/// Velocity setpoint step per tick, rpm.
const VELOCITY_STEP: i32 = 100;

/// Failure-latching wrapper around the CAN motor bus.
///
/// Every operation logs and latches on error instead of propagating, so
/// the control loop can keep its shape and consult [`has_failure`]
/// (mirroring the controllers' own sticky fault words).
///
/// [`has_failure`]: Communicator::has_failure
pub struct Communicator {
    bus: Box<dyn MotorBus>,
    failure: bool,
    last_velocity: [i32; NUM_MOTORS],
    last_torque: [i16; NUM_MOTORS],
}

impl Communicator {
    pub fn new(bus: Box<dyn MotorBus>) -> Self {
        Self {
            bus,
            failure: false,
            last_velocity: [0; NUM_MOTORS],
            last_torque: [0; NUM_MOTORS],
        }
    }

    /// Whether any bus operation has failed since construction.
    pub fn has_failure(&self) -> bool {
        self.failure
    }

    fn guard(&mut self, result: CanResult<()>, what: &str) {
        if let Err(e) = result {
            error!(target: "motor", "{what} failed: {e}");
            self.failure = true;
        }
    }

    pub fn register_controllers(&mut self) {
        let result = self.bus.register_controllers();
        self.guard(result, "controller registration");
    }

    pub fn configure_controllers(&mut self) {
        let result = self.bus.configure_controllers();
        self.guard(result, "controller configuration");
    }

    pub fn prepare_motors(&mut self) {
        let result = self.bus.prepare_motors();
        self.guard(result, "entering operational mode");
    }

    pub fn health_check(&mut self) {
        let result = self.bus.health_check();
        self.guard(result, "health check");
    }

    pub fn send_target_velocity(&mut self, rpm: i32) {
        let result = self.bus.send_target_velocity([rpm; NUM_MOTORS]);
        self.guard(result, "target velocity command");
    }

    pub fn send_target_torque(&mut self, torque: i16) {
        let result = self.bus.send_target_torque([torque; NUM_MOTORS]);
        self.guard(result, "target torque command");
    }

    pub fn request_actual_velocity(&mut self) -> [i32; NUM_MOTORS] {
        match self.bus.request_actual_velocity() {
            Ok(velocity) => {
                self.last_velocity = velocity;
                velocity
            }
            Err(e) => {
                error!(target: "motor", "velocity readback failed: {e}");
                self.failure = true;
                self.last_velocity
            }
        }
    }

    pub fn request_actual_torque(&mut self) -> [i16; NUM_MOTORS] {
        match self.bus.request_actual_torque() {
            Ok(torque) => {
                self.last_torque = torque;
                torque
            }
            Err(e) => {
                error!(target: "motor", "torque readback failed: {e}");
                self.failure = true;
                self.last_torque
            }
        }
    }

    pub fn quick_stop_all(&mut self) {
        let result = self.bus.quick_stop_all();
        self.guard(result, "quick stop");
    }

    pub fn enter_pre_operational(&mut self) {
        let result = self.bus.enter_pre_operational();
        self.guard(result, "entering pre-operational mode");
    }
}

/// The motor control worker.
pub struct MotorControl {
    registry: Arc<Registry>,
    events: EventSender,
    barrier: Arc<Barrier>,
    comm: Communicator,
    data: MotorData,
    target_velocity: i32,
    target_torque: i16,
    nav_synced: bool,
    motors_init: bool,
    motors_ready: bool,
    motor_failure: bool,
    all_motors_stopped: bool,
    preop_commanded: bool,
}

impl MotorControl {
    pub fn new(
        registry: Arc<Registry>,
        events: EventSender,
        barrier: Arc<Barrier>,
        bus: Box<dyn MotorBus>,
    ) -> Self {
        let data = MotorData::default();
        registry.set_motors(data);
        Self {
            registry,
            events,
            barrier,
            comm: Communicator::new(bus),
            data,
            target_velocity: 0,
            target_torque: 0,
            nav_synced: false,
            motors_init: false,
            motors_ready: false,
            motor_failure: false,
            all_motors_stopped: false,
            preop_commanded: false,
        }
    }

    /// Track the pod state machine until shutdown.
    pub fn run(mut self) {
        info!(target: "motor", "motor controller started");
        while self.registry.is_running() {
            let state = self.registry.state_machine();
            match state.current_state {
                State::Idle => {
                    self.init_motors();
                    thread::yield_now();
                    thread::sleep(Duration::from_millis(1));
                }
                State::Calibrating => {
                    self.prepare_motors();
                    thread::yield_now();
                    thread::sleep(Duration::from_millis(1));
                }
                State::Ready | State::RunComplete => thread::sleep(TICK),
                State::Accelerating => self.accelerate(),
                State::Cruising => self.cruise(),
                State::Decelerating => self.decelerate(),
                State::Exiting => {
                    self.service_propulsion();
                    thread::sleep(TICK);
                }
                State::EmergencyBraking => {
                    if state.critical_failure {
                        self.fail("run aborted with critical failure latched");
                    }
                    self.stop_motors();
                    thread::sleep(TICK);
                }
                State::FailureStopped => {
                    if !self.preop_commanded {
                        self.comm.enter_pre_operational();
                        self.preop_commanded = true;
                        info!(target: "motor", "controllers in pre-operational");
                    }
                    thread::sleep(TICK);
                }
            }
        }
        info!(target: "motor", "motor controller stopped");
    }

    /// Register and configure the controllers. One-shot; no-op once done or
    /// after a failure.
    fn init_motors(&mut self) {
        if self.motors_init || self.motor_failure {
            return;
        }
        self.comm.register_controllers();
        self.comm.configure_controllers();

        if self.comm.has_failure() {
            self.fail("controller configuration failed");
        } else {
            self.data.module_status = ModuleStatus::Init;
            self.registry.set_motors(self.data);
            self.motors_init = true;
            info!(target: "motor", "controllers configured");
        }
    }

    /// Bring the controllers into operational mode and verify their health.
    fn prepare_motors(&mut self) {
        if self.motors_ready || self.motor_failure {
            return;
        }
        self.comm.prepare_motors();
        self.comm.health_check();

        if self.comm.has_failure() {
            self.fail("controller preparation failed");
        } else {
            self.data.module_status = ModuleStatus::Ready;
            self.registry.set_motors(self.data);
            self.motors_ready = true;
            info!(target: "motor", "controllers ready");
        }
    }

    fn accelerate(&mut self) {
        // First acceleration tick of the run: rendezvous with navigation so
        // setpoints are only ever shaped by an operational estimate.
        if !self.nav_synced {
            debug!(target: "motor", "waiting on post-calibration barrier");
            self.barrier.wait();
            self.nav_synced = true;
            debug!(target: "motor", "post-calibration barrier released");
        }

        info!(target: "motor", "accelerating");
        while self.registry.is_running() {
            let state = self.registry.state_machine();
            if state.critical_failure {
                self.fail("run aborted with critical failure latched");
                self.stop_motors();
                return;
            }
            if state.current_state != State::Accelerating {
                return;
            }

            self.comm.health_check();
            if self.comm.has_failure() {
                self.fail("controller health check failed");
                self.stop_motors();
                return;
            }

            let nav = self.registry.navigation();
            self.target_velocity = self.acceleration_velocity(nav.velocity);
            self.target_torque = self.acceleration_torque(nav.velocity);
            self.comm.send_target_velocity(self.target_velocity);
            self.comm.send_target_torque(self.target_torque);
            self.refresh_motor_data();
            thread::sleep(TICK);
        }
    }

    /// Hold the last setpoint while monitoring health.
    fn cruise(&mut self) {
        info!(target: "motor", "cruising");
        while self.registry.is_running() {
            let state = self.registry.state_machine();
            if state.critical_failure {
                self.fail("run aborted with critical failure latched");
                self.stop_motors();
                return;
            }
            if state.current_state != State::Cruising {
                return;
            }

            self.comm.health_check();
            if self.comm.has_failure() {
                self.fail("controller health check failed");
                self.stop_motors();
                return;
            }

            self.refresh_motor_data();
            thread::sleep(TICK);
        }
    }

    fn decelerate(&mut self) {
        info!(target: "motor", "decelerating");
        while self.registry.is_running() {
            let state = self.registry.state_machine();
            if state.critical_failure {
                self.fail("run aborted with critical failure latched");
                self.stop_motors();
                return;
            }
            if state.current_state != State::Decelerating {
                return;
            }

            self.comm.health_check();
            if self.comm.has_failure() {
                self.fail("controller health check failed");
                self.stop_motors();
                return;
            }

            let nav = self.registry.navigation();
            self.target_velocity = self.deceleration_velocity(nav.velocity);
            self.target_torque = self.deceleration_torque(nav.velocity);
            self.comm.send_target_velocity(self.target_velocity);
            self.comm.send_target_torque(self.target_torque);
            self.refresh_motor_data();

            if self.data.velocity == [0; NUM_MOTORS] && self.target_velocity == 0 {
                self.all_motors_stopped = true;
                info!(target: "motor", "all motors stopped");
                let _ = self.events.send(Event::AllMotorsStopped);
                return;
            }
            thread::sleep(TICK);
        }
    }

    /// Quick-stop every controller and poll until all four report zero.
    ///
    /// Polls only the motor bus and the shutdown flag; it never waits on
    /// another module.
    fn stop_motors(&mut self) {
        if self.all_motors_stopped {
            return;
        }
        info!(target: "motor", "quick-stopping all motors");
        self.comm.quick_stop_all();

        while !self.all_motors_stopped && self.registry.is_running() {
            self.refresh_motor_data();
            if self.comm.has_failure() {
                error!(target: "motor", "lost contact with controllers during stop");
                break;
            }
            if self.data.velocity == [0; NUM_MOTORS] {
                self.all_motors_stopped = true;
                info!(target: "motor", "all motors stopped");
            } else {
                thread::sleep(STOP_POLL);
            }
        }

        self.refresh_motor_data();
        let _ = self.events.send(Event::AllMotorsStopped);
        self.comm.enter_pre_operational();
        self.preop_commanded = true;
    }

    /// Service propulsion maintenance while exiting the tube.
    fn service_propulsion(&mut self) {
        // Nothing to service on this propulsion revision.
    }

    /// Constant-step ramp. The measured velocity is accepted so a richer
    /// control law can slot in without touching the call sites; any
    /// replacement must stay non-decreasing while accelerating.
    fn acceleration_velocity(&mut self, _velocity: f64) -> i32 {
        self.target_velocity.saturating_add(VELOCITY_STEP)
    }

    /// Constant-step ramp down, floored at zero; must stay non-increasing
    /// while decelerating.
    fn deceleration_velocity(&mut self, _velocity: f64) -> i32 {
        (self.target_velocity - VELOCITY_STEP).max(0)
    }

    fn acceleration_torque(&mut self, _velocity: f64) -> i16 {
        0
    }

    fn deceleration_torque(&mut self, _velocity: f64) -> i16 {
        0
    }

    /// Read actuals back from the controllers and publish.
    fn refresh_motor_data(&mut self) {
        self.data.velocity = self.comm.request_actual_velocity();
        self.data.torque = self.comm.request_actual_torque();
        self.registry.set_motors(self.data);
    }

    fn fail(&mut self, reason: &str) {
        if self.motor_failure {
            return;
        }
        error!(target: "motor", "CRITICAL: {reason}");
        self.data.module_status = ModuleStatus::CriticalFailure;
        self.registry.set_motors(self.data);
        self.motor_failure = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::can::{CanError, SimMotorBus};
    use hardware::sim::SimClock;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    /// Bus whose configuration step always fails.
    struct BrokenBus;

    impl MotorBus for BrokenBus {
        fn register_controllers(&mut self) -> CanResult<()> {
            Ok(())
        }
        fn configure_controllers(&mut self) -> CanResult<()> {
            Err(CanError::ConfigurationFailed("no response".to_string()))
        }
        fn prepare_motors(&mut self) -> CanResult<()> {
            Ok(())
        }
        fn health_check(&mut self) -> CanResult<()> {
            Ok(())
        }
        fn send_target_velocity(&mut self, _: [i32; NUM_MOTORS]) -> CanResult<()> {
            Ok(())
        }
        fn send_target_torque(&mut self, _: [i16; NUM_MOTORS]) -> CanResult<()> {
            Ok(())
        }
        fn request_actual_velocity(&mut self) -> CanResult<[i32; NUM_MOTORS]> {
            Ok([0; NUM_MOTORS])
        }
        fn request_actual_torque(&mut self) -> CanResult<[i16; NUM_MOTORS]> {
            Ok([0; NUM_MOTORS])
        }
        fn quick_stop_all(&mut self) -> CanResult<()> {
            Ok(())
        }
        fn enter_pre_operational(&mut self) -> CanResult<()> {
            Ok(())
        }
    }

    fn control(bus: Box<dyn MotorBus>) -> (MotorControl, mpsc::Receiver<Event>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::channel();
        let control = MotorControl::new(registry.clone(), tx, Arc::new(Barrier::new(1)), bus);
        (control, rx, registry)
    }

    #[test]
    fn test_init_and_prepare_publish_status() {
        let (mut control, _rx, registry) = control(Box::new(SimMotorBus::new(SimClock::new())));

        control.init_motors();
        assert_eq!(registry.motors().module_status, ModuleStatus::Init);

        control.prepare_motors();
        assert_eq!(registry.motors().module_status, ModuleStatus::Ready);
        assert!(!control.motor_failure);
    }

    #[test]
    fn test_configuration_failure_latches() {
        let (mut control, _rx, registry) = control(Box::new(BrokenBus));

        control.init_motors();
        assert_eq!(registry.motors().module_status, ModuleStatus::CriticalFailure);
        assert!(control.motor_failure);

        // Latched: further init/prepare calls are no-ops.
        control.init_motors();
        control.prepare_motors();
        assert!(!control.motors_init);
        assert!(!control.motors_ready);
    }

    #[test]
    fn test_stop_motors_reaches_zero_and_reports() {
        let mut bus = SimMotorBus::new(SimClock::new());
        let probe = bus.probe();
        bus.register_controllers().unwrap();
        bus.configure_controllers().unwrap();
        bus.prepare_motors().unwrap();
        bus.send_target_velocity([400; NUM_MOTORS]).unwrap();
        thread::sleep(Duration::from_millis(150));

        let (mut control, rx, registry) = control(Box::new(bus));
        control.stop_motors();

        assert!(control.all_motors_stopped);
        assert_eq!(registry.motors().velocity, [0; NUM_MOTORS]);
        assert_eq!(rx.try_recv().unwrap(), Event::AllMotorsStopped);
        assert_eq!(probe.quick_stops.load(Ordering::SeqCst), 1);
        assert_eq!(probe.pre_operational_commands.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acceleration_setpoints_are_non_decreasing() {
        let (mut control, _rx, _registry) = control(Box::new(SimMotorBus::new(SimClock::new())));

        let mut previous = 0;
        for _ in 0..50 {
            let next = control.acceleration_velocity(0.0);
            assert!(next >= previous);
            control.target_velocity = next;
            previous = next;
        }
        assert_eq!(previous, 5_000);
    }

    #[test]
    fn test_deceleration_setpoints_floor_at_zero() {
        let (mut control, _rx, _registry) = control(Box::new(SimMotorBus::new(SimClock::new())));
        control.target_velocity = 250;

        let mut previous = control.target_velocity;
        for _ in 0..10 {
            let next = control.deceleration_velocity(0.0);
            assert!(next <= previous);
            assert!(next >= 0);
            control.target_velocity = next;
            previous = next;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_state_critical_failure_marks_motor_module() {
        let (mut control, _rx, registry) = control(Box::new(SimMotorBus::new(SimClock::new())));
        control.fail("run aborted with critical failure latched");
        assert_eq!(registry.motors().module_status, ModuleStatus::CriticalFailure);

        // fail() is idempotent once latched.
        control.fail("second report");
        assert!(control.motor_failure);
    }
}
