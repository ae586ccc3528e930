//! The pod state machine.
//!
//! Owns the pod's global state and is the only writer of
//! [`StateMachineData`]. Events arrive through a single-consumer channel
//! (from the ground-station link, the navigation estimator, and the motor
//! controller); the machine also polls the registry's module-status flags
//! and synthesises [`Event::CriticalFailureDetected`] when any module
//! reports a critical failure.
//!
//! `critical_failure` is latched on entry to `EmergencyBraking` and never
//! clears for the remainder of the run; the only way out of
//! `EmergencyBraking` is `FailureStopped`.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use telemetry::{ModuleStatus, Registry, State, StateMachineData};
use tracing::{error, info, warn};

/// Handle workers use to inject events into the state machine.
pub type EventSender = Sender<Event>;

/// Everything that can drive a pod state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Event {
    OnStart,
    CalibrationComplete,
    MaxDistanceReached,
    EndOfRunReached,
    OnExit,
    EndOfTubeReached,
    CriticalFailureDetected,
    AllMotorsStopped,
}

/// How long one `recv` waits before the machine re-polls module statuses.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The pod's finite-state controller.
pub struct StateMachine {
    registry: Arc<Registry>,
    events: Receiver<Event>,
    data: StateMachineData,
    nav_failure_reported: bool,
    motor_failure_reported: bool,
}

impl StateMachine {
    /// Create the machine in `Idle` and publish the initial snapshot.
    pub fn new(registry: Arc<Registry>, events: Receiver<Event>) -> Self {
        let data = StateMachineData::default();
        registry.set_state_machine(data);
        Self {
            registry,
            events,
            data,
            nav_failure_reported: false,
            motor_failure_reported: false,
        }
    }

    /// The state the machine is currently in.
    pub fn current_state(&self) -> State {
        self.data.current_state
    }

    /// Process events until the terminal state is reached or the registry
    /// signals shutdown. Returns the final published snapshot.
    pub fn run(mut self) -> StateMachineData {
        info!(target: "state_machine", "state machine started in {}", self.data.current_state);
        while self.registry.is_running() && !self.data.current_state.is_terminal() {
            match self.events.recv_timeout(EVENT_POLL_INTERVAL) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll_module_status();
        }

        if self.data.critical_failure {
            error!(
                target: "state_machine",
                "CRITICAL: run ended in {} with critical failure latched",
                self.data.current_state
            );
        } else {
            info!(target: "state_machine", "run ended cleanly in {}", self.data.current_state);
        }
        self.data
    }

    /// Apply one event. Events that are not legal from the current state
    /// change nothing beyond a warning.
    pub fn handle_event(&mut self, event: Event) {
        match next_state(self.data.current_state, event) {
            Some(next) => self.transition(next),
            None => warn!(
                target: "state_machine",
                "ignoring {event} in {}", self.data.current_state
            ),
        }
    }

    fn transition(&mut self, next: State) {
        let previous = self.data.current_state;
        self.data.current_state = next;
        if next == State::EmergencyBraking {
            self.data.critical_failure = true;
        }
        self.registry.set_state_machine(self.data);
        info!(target: "state_machine", "{previous} -> {next}");
    }

    /// Turn a module-status critical failure into an event, once per module.
    fn poll_module_status(&mut self) {
        if self.data.critical_failure {
            return;
        }

        if !self.nav_failure_reported
            && self.registry.navigation().module_status == ModuleStatus::CriticalFailure
        {
            self.nav_failure_reported = true;
            error!(target: "state_machine", "navigation module reported critical failure");
            self.handle_event(Event::CriticalFailureDetected);
            return;
        }

        if !self.motor_failure_reported
            && self.registry.motors().module_status == ModuleStatus::CriticalFailure
        {
            self.motor_failure_reported = true;
            error!(target: "state_machine", "motor module reported critical failure");
            self.handle_event(Event::CriticalFailureDetected);
        }
    }
}

/// The transition table. `None` means the event is not legal from the
/// given state.
fn next_state(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, OnStart) => Some(Calibrating),
        (Calibrating, CalibrationComplete) => Some(Ready),
        (Ready, OnStart) => Some(Accelerating),
        (Accelerating, MaxDistanceReached) => Some(Cruising),
        (Cruising, EndOfRunReached) => Some(Decelerating),
        (Decelerating, AllMotorsStopped) => Some(RunComplete),
        (RunComplete, OnExit) => Some(Exiting),
        (Exiting, EndOfTubeReached) => Some(FailureStopped),

        // Emergency braking only ever resolves into the terminal state.
        (EmergencyBraking, AllMotorsStopped) => Some(FailureStopped),
        (EmergencyBraking, _) => None,
        (FailureStopped, _) => None,
        (_, CriticalFailureDetected) => Some(EmergencyBraking),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use strum::IntoEnumIterator;

    fn machine() -> (StateMachine, EventSender, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::channel();
        let machine = StateMachine::new(registry.clone(), rx);
        (machine, tx, registry)
    }

    #[test]
    fn test_clean_run_sequence() {
        let (mut machine, _tx, registry) = machine();
        let sequence = [
            (Event::OnStart, State::Calibrating),
            (Event::CalibrationComplete, State::Ready),
            (Event::OnStart, State::Accelerating),
            (Event::MaxDistanceReached, State::Cruising),
            (Event::EndOfRunReached, State::Decelerating),
            (Event::AllMotorsStopped, State::RunComplete),
            (Event::OnExit, State::Exiting),
            (Event::EndOfTubeReached, State::FailureStopped),
        ];

        for (event, expected) in sequence {
            machine.handle_event(event);
            assert_eq!(machine.current_state(), expected);
            assert_eq!(registry.state_machine().current_state, expected);
        }
        assert!(!registry.state_machine().critical_failure);
    }

    #[test]
    fn test_illegal_event_changes_nothing() {
        let (mut machine, _tx, registry) = machine();
        let before = registry.state_machine();

        machine.handle_event(Event::MaxDistanceReached);

        assert_eq!(machine.current_state(), State::Idle);
        assert_eq!(registry.state_machine(), before);
    }

    #[test]
    fn test_critical_failure_from_any_non_terminal_state() {
        for entry in [
            State::Idle,
            State::Calibrating,
            State::Ready,
            State::Accelerating,
            State::Cruising,
            State::Decelerating,
            State::RunComplete,
            State::Exiting,
        ] {
            assert_eq!(
                next_state(entry, Event::CriticalFailureDetected),
                Some(State::EmergencyBraking),
                "critical failure must preempt {entry}"
            );
        }
    }

    #[test]
    fn test_emergency_braking_only_exits_to_failure_stopped() {
        for event in [
            Event::OnStart,
            Event::CalibrationComplete,
            Event::MaxDistanceReached,
            Event::EndOfRunReached,
            Event::OnExit,
            Event::EndOfTubeReached,
            Event::CriticalFailureDetected,
        ] {
            assert_eq!(next_state(State::EmergencyBraking, event), None);
        }
        assert_eq!(
            next_state(State::EmergencyBraking, Event::AllMotorsStopped),
            Some(State::FailureStopped)
        );
    }

    #[test]
    fn test_terminal_state_ignores_everything() {
        for event in [
            Event::OnStart,
            Event::CalibrationComplete,
            Event::MaxDistanceReached,
            Event::EndOfRunReached,
            Event::OnExit,
            Event::EndOfTubeReached,
            Event::CriticalFailureDetected,
            Event::AllMotorsStopped,
        ] {
            assert_eq!(next_state(State::FailureStopped, event), None);
        }
    }

    #[test]
    fn test_critical_failure_is_latched() {
        let (mut machine, _tx, registry) = machine();
        machine.handle_event(Event::OnStart);
        machine.handle_event(Event::CriticalFailureDetected);
        assert!(registry.state_machine().critical_failure);

        machine.handle_event(Event::AllMotorsStopped);
        assert_eq!(machine.current_state(), State::FailureStopped);
        assert!(registry.state_machine().critical_failure);
    }

    #[test]
    fn test_no_state_reenters_propulsion_after_critical_failure() {
        // Once latched, the only reachable states are the braking pair.
        for state in State::iter() {
            let reachable = [
                next_state(state, Event::OnStart),
                next_state(state, Event::AllMotorsStopped),
            ];
            if matches!(state, State::EmergencyBraking | State::FailureStopped) {
                for next in reachable.into_iter().flatten() {
                    assert!(matches!(
                        next,
                        State::EmergencyBraking | State::FailureStopped
                    ));
                }
            }
        }
    }

    #[test]
    fn test_module_critical_status_forces_emergency_braking() {
        let (mut machine, _tx, registry) = machine();
        machine.handle_event(Event::OnStart);

        let mut nav = registry.navigation();
        nav.module_status = ModuleStatus::CriticalFailure;
        registry.set_navigation(nav);

        machine.poll_module_status();
        assert_eq!(machine.current_state(), State::EmergencyBraking);
        assert!(registry.state_machine().critical_failure);
    }
}
