//! The telemetry registry: last-writer-wins snapshot exchange.
//!
//! One exclusive lock per substructure; critical sections are bounded by the
//! copy of a `Copy` struct, so no read or write can block for long. Readers
//! always see a fully-committed snapshot of one substructure; consistency
//! *across* substructures is deliberately not provided and consumers must
//! tolerate mild skew.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::error;

use crate::data::{Batteries, MotorData, Navigation, Sensors, StateMachineData};

/// Holds the authoritative copy of every published substructure.
///
/// Constructed once at startup, wrapped in an `Arc`, and handed to each
/// worker. Each substructure has exactly one producer thread and any number
/// of consumers.
///
/// The registry also carries the process-wide `running` flag that every
/// worker loop polls for shutdown.
#[derive(Debug, Default)]
pub struct Registry {
    navigation: Mutex<Navigation>,
    sensors: Mutex<Sensors>,
    batteries: Mutex<Batteries>,
    motors: Mutex<MotorData>,
    state_machine: Mutex<StateMachineData>,
    running: AtomicBool,
}

impl Registry {
    /// Create a registry with zero-initialised substructures and the
    /// `running` flag set.
    pub fn new() -> Self {
        let registry = Self::default();
        registry.running.store(true, Ordering::SeqCst);
        registry
    }

    /// True until [`shutdown`](Self::shutdown) is called. Worker loops poll
    /// this once per iteration and exit cleanly when it clears.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal every worker loop to drain and exit.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn navigation(&self) -> Navigation {
        *lock(&self.navigation, "navigation")
    }

    pub fn set_navigation(&self, data: Navigation) {
        *lock(&self.navigation, "navigation") = data;
    }

    pub fn sensors(&self) -> Sensors {
        *lock(&self.sensors, "sensors")
    }

    pub fn set_sensors(&self, data: Sensors) {
        *lock(&self.sensors, "sensors") = data;
    }

    pub fn batteries(&self) -> Batteries {
        *lock(&self.batteries, "batteries")
    }

    pub fn set_batteries(&self, data: Batteries) {
        *lock(&self.batteries, "batteries") = data;
    }

    pub fn motors(&self) -> MotorData {
        *lock(&self.motors, "motors")
    }

    pub fn set_motors(&self, data: MotorData) {
        *lock(&self.motors, "motors") = data;
    }

    pub fn state_machine(&self) -> StateMachineData {
        *lock(&self.state_machine, "state_machine")
    }

    pub fn set_state_machine(&self, data: StateMachineData) {
        *lock(&self.state_machine, "state_machine") = data;
    }
}

/// Acquire a lock, aborting the process if it is poisoned.
///
/// A poisoned lock means the holder crashed mid-write; serving that
/// half-written value to a safety-critical consumer is worse than dying.
/// Every registry substructure goes through here, and workers use the same
/// helper for their internal buffers so a poisoned lock has exactly one
/// behaviour anywhere in the process.
pub fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(_) => {
            error!(target: "telemetry", "CRITICAL: {name} lock poisoned, aborting");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ModuleStatus, State, NUM_MOTORS};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_snapshots_start_zeroed() {
        let registry = Registry::new();
        assert_eq!(registry.navigation().distance, 0.0);
        assert_eq!(registry.motors().module_status, ModuleStatus::Start);
        assert_eq!(registry.state_machine().current_state, State::Idle);
        assert!(registry.is_running());
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = Registry::new();

        let mut nav = registry.navigation();
        nav.velocity = 12.5;
        registry.set_navigation(nav);
        nav.velocity = 13.0;
        registry.set_navigation(nav);

        assert_eq!(registry.navigation().velocity, 13.0);
    }

    #[test]
    fn test_get_returns_a_copy() {
        let registry = Registry::new();
        let mut snapshot = registry.motors();
        snapshot.velocity = [1, 2, 3, 4];
        // Mutating the copy must not touch the stored value.
        assert_eq!(registry.motors().velocity, [0; NUM_MOTORS]);
    }

    #[test]
    fn test_concurrent_reads_never_see_torn_snapshots() {
        let registry = Arc::new(Registry::new());
        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 1..=5_000i32 {
                    registry.set_motors(MotorData {
                        velocity: [i; NUM_MOTORS],
                        torque: [0; NUM_MOTORS],
                        module_status: ModuleStatus::Ready,
                    });
                }
            })
        };

        // All four velocities are written together, so any snapshot with
        // mismatched components is a torn read.
        for _ in 0..5_000 {
            let snapshot = registry.motors();
            assert!(snapshot.velocity.iter().all(|&v| v == snapshot.velocity[0]));
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_shutdown_clears_running_flag() {
        let registry = Registry::new();
        assert!(registry.is_running());
        registry.shutdown();
        assert!(!registry.is_running());
    }
}
