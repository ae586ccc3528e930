//! Drive the pod state machine through a clean run.
//!
//! Feeds the full event sequence of a nominal run and logs every
//! transition. Useful as a smoke test of the transition table without any
//! hardware or worker threads.

use std::sync::{mpsc, Arc};

use pod::state_machine::{Event, StateMachine};
use telemetry::Registry;
use tracing::info;

fn main() {
    tracing_subscriber::fmt::init();

    let registry = Arc::new(Registry::new());
    let (_events, event_rx) = mpsc::channel();
    let mut machine = StateMachine::new(registry.clone(), event_rx);

    for event in [
        Event::OnStart,
        Event::CalibrationComplete,
        Event::OnStart,
        Event::MaxDistanceReached,
        Event::EndOfRunReached,
        Event::AllMotorsStopped,
        Event::OnExit,
        Event::EndOfTubeReached,
    ] {
        machine.handle_event(event);
    }

    let final_state = registry.state_machine();
    info!(
        "final state: {} (critical failure: {})",
        final_state.current_state, final_state.critical_failure
    );
}
