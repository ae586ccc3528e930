//! Pod firmware entry point.
//!
//! Parses flags, wires the selected workers to a fresh registry, and runs
//! the pod state machine to its terminal state. Exit codes: 0 for a clean
//! run, 1 for a configuration error, 2 when the run ended with a critical
//! failure.

use std::process;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use clap::Parser;
use hardware::can::SimMotorBus;
use hardware::sim::SimClock;
use pod::comms::GroundStation;
use pod::config::{Args, Config};
use pod::motor::MotorControl;
use pod::navigation::NavigationEstimator;
use pod::sensors::{Aggregator, SensorSuite};
use pod::state_machine::StateMachine;
use telemetry::Registry;
use tracing::{error, info};

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            process::exit(code);
        }
    };

    let level: tracing::Level = match args.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("invalid log level {:?}", args.log_level);
            process::exit(1);
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match Config::resolve(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            process::exit(1);
        }
    };

    process::exit(run(config));
}

fn run(config: Config) -> i32 {
    let registry = Arc::new(Registry::new());
    let clock = SimClock::new();

    // Ctrl-C clears the shared running flag; every worker loop drains on
    // it, so both run modes terminate through the same path.
    {
        let registry = registry.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            registry.shutdown();
        }) {
            error!("failed to install interrupt handler: {e}");
        }
    }

    if config.sensors_only {
        info!("sensors-only run");
        let aggregator = Aggregator::new(registry.clone(), SensorSuite::simulated(clock));
        let aggregator = thread::spawn(move || aggregator.run());
        // Runs until the interrupt handler clears the flag; the aggregator
        // joins its manager threads before returning.
        let _ = aggregator.join();
        registry.shutdown();
        return 0;
    }

    let (events, event_rx) = mpsc::channel();
    let barrier = Arc::new(Barrier::new(config.barrier_parties));

    let machine = StateMachine::new(registry.clone(), event_rx);
    let machine_handle = thread::spawn(move || machine.run());

    if !config.motors_only {
        let aggregator = Aggregator::new(registry.clone(), SensorSuite::simulated(clock));
        thread::spawn(move || aggregator.run());

        let estimator = NavigationEstimator::new(
            registry.clone(),
            events.clone(),
            barrier.clone(),
            config.navigation(),
        );
        thread::spawn(move || estimator.run());
    }

    let motors = MotorControl::new(
        registry.clone(),
        events.clone(),
        barrier.clone(),
        Box::new(SimMotorBus::new(clock)),
    );
    thread::spawn(move || motors.run());

    if config.ground_station.is_some() {
        let station = GroundStation::new(registry.clone(), events.clone(), config.comms());
        thread::spawn(move || station.run());
    }
    drop(events);

    let final_state = match machine_handle.join() {
        Ok(data) => data,
        Err(_) => {
            error!("CRITICAL: state machine thread panicked");
            registry.shutdown();
            return 2;
        }
    };

    // Drain period: the motor worker needs to observe the terminal state
    // and command pre-operational before the shutdown flag stops it.
    thread::sleep(Duration::from_millis(300));
    registry.shutdown();
    thread::sleep(Duration::from_millis(200));

    // Workers still blocked on the barrier or a socket die with the process.
    if final_state.critical_failure {
        2
    } else {
        0
    }
}
