//! Simulated pod devices.
//!
//! Stand-ins for the real sensor fleet with believable values and
//! timestamps from a shared monotonic clock. Bench binaries run against
//! these, and the integration tests use their freeze/offline handles to
//! provoke the failure paths that are hard to hit on real hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use telemetry::{
    Battery, DataPoint, Imu, Proximity, StripeCount, Timestamp, NUM_IMUS, NUM_PROXIMITIES,
};

use crate::sensors::{
    BatterySensor, ImuSensor, ProximitySensor, SensorError, SensorResult, StripeCounter,
};

/// Standard gravity, m/s².
const GRAVITY: f64 = 9.80665;

/// Monotonic microsecond clock shared by every simulated device.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    origin: Instant,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.origin.elapsed().as_micros() as u64)
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated IMU: gravity on the z axis plus sensor noise.
///
/// The freeze handle stops the timestamp from advancing while keeping the
/// device online, which is exactly the stuck-sensor case the aggregator's
/// publish policy has to be tested against.
pub struct SimImu {
    clock: SimClock,
    rng: SmallRng,
    frozen: Arc<AtomicBool>,
    online: Arc<AtomicBool>,
    last: Imu,
}

impl SimImu {
    pub fn new(id: usize, clock: SimClock) -> Self {
        Self {
            clock,
            rng: SmallRng::seed_from_u64(0x1b5e_d000 + id as u64),
            frozen: Arc::new(AtomicBool::new(false)),
            online: Arc::new(AtomicBool::new(true)),
            last: Imu::default(),
        }
    }

    /// Handle that freezes the device's timestamps when set.
    pub fn freeze_handle(&self) -> Arc<AtomicBool> {
        self.frozen.clone()
    }

    /// Handle that takes the device offline when cleared.
    pub fn online_handle(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }

    fn noise(&mut self, scale: f64) -> Vector3<f64> {
        Vector3::new(
            self.rng.gen_range(-scale..scale),
            self.rng.gen_range(-scale..scale),
            self.rng.gen_range(-scale..scale),
        )
    }
}

impl ImuSensor for SimImu {
    fn read(&mut self) -> SensorResult<Imu> {
        if !self.is_online() {
            return Err(SensorError::Offline);
        }
        if self.frozen.load(Ordering::SeqCst) {
            return Ok(self.last);
        }

        let now = self.clock.now();
        let acc = Vector3::new(0.0, 0.0, GRAVITY) + self.noise(0.05);
        let gyr = self.noise(0.01);
        self.last = Imu {
            acc: DataPoint::new(acc, now),
            gyr: DataPoint::new(gyr, now),
        };
        Ok(self.last)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Simulated rangefinder hovering around the nominal ride height.
pub struct SimProximity {
    clock: SimClock,
    rng: SmallRng,
    online: Arc<AtomicBool>,
    nominal_mm: u8,
}

impl SimProximity {
    pub fn new(id: usize, clock: SimClock) -> Self {
        Self {
            clock,
            rng: SmallRng::seed_from_u64(0x9807_1000 + id as u64),
            online: Arc::new(AtomicBool::new(true)),
            nominal_mm: 25,
        }
    }

    pub fn online_handle(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }
}

impl ProximitySensor for SimProximity {
    fn read(&mut self) -> SensorResult<DataPoint<Proximity>> {
        if !self.is_online() {
            return Err(SensorError::Offline);
        }
        let jitter: i16 = self.rng.gen_range(-2..=2);
        let val = (self.nominal_mm as i16 + jitter).clamp(0, u8::MAX as i16) as u8;
        Ok(DataPoint::new(Proximity { val }, self.clock.now()))
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Which supply a simulated battery pack models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKind {
    LowPower,
    HighPower,
}

/// Simulated BMS pack with a slow discharge and jittery voltage readout.
pub struct SimBattery {
    clock: SimClock,
    rng: SmallRng,
    online: Arc<AtomicBool>,
    kind: PackKind,
}

impl SimBattery {
    pub fn new(id: usize, kind: PackKind, clock: SimClock) -> Self {
        Self {
            clock,
            rng: SmallRng::seed_from_u64(0xba77_0000 + id as u64),
            online: Arc::new(AtomicBool::new(true)),
            kind,
        }
    }

    pub fn online_handle(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }
}

impl BatterySensor for SimBattery {
    fn read(&mut self) -> SensorResult<Battery> {
        if !self.is_online() {
            return Err(SensorError::Offline);
        }
        let base_voltage: u16 = match self.kind {
            PackKind::HighPower => 1100,
            PackKind::LowPower => 170,
        };
        let jitter: i16 = self.rng.gen_range(-1..=1);
        let minutes = self.clock.now().as_micros() / 60_000_000;
        Ok(Battery {
            voltage: (base_voltage as i16 + jitter) as u16,
            current: 200,
            temperature: 30,
            charge: 100u8.saturating_sub(minutes as u8),
        })
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Simulated stripe counter: one edge per configured interval.
///
/// The timestamp is the time of the most recent edge, so it is
/// non-decreasing and only moves when the count does.
pub struct SimStripeCounter {
    clock: SimClock,
    online: Arc<AtomicBool>,
    interval: Duration,
}

impl SimStripeCounter {
    pub fn new(clock: SimClock, interval: Duration) -> Self {
        Self {
            clock,
            online: Arc::new(AtomicBool::new(true)),
            interval,
        }
    }

    pub fn online_handle(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }
}

impl StripeCounter for SimStripeCounter {
    fn read(&mut self) -> SensorResult<StripeCount> {
        if !self.is_online() {
            return Err(SensorError::Offline);
        }
        let interval_us = self.interval.as_micros().max(1) as u64;
        let count = self.clock.now().as_micros() / interval_us;
        Ok(DataPoint::new(
            count as u32,
            Timestamp::from_micros(count * interval_us),
        ))
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// The full IMU complement as boxed trait objects.
pub fn sim_imu_array(clock: SimClock) -> Vec<Box<dyn ImuSensor>> {
    (0..NUM_IMUS)
        .map(|id| Box::new(SimImu::new(id, clock)) as Box<dyn ImuSensor>)
        .collect()
}

/// One proximity bank's worth of rangefinders. `offset` keeps the RNG seeds
/// of the front and back banks apart.
pub fn sim_proximity_bank(clock: SimClock, offset: usize) -> Vec<Box<dyn ProximitySensor>> {
    (0..NUM_PROXIMITIES)
        .map(|id| Box::new(SimProximity::new(offset + id, clock)) as Box<dyn ProximitySensor>)
        .collect()
}

/// A set of simulated BMS packs of one kind.
pub fn sim_battery_packs(clock: SimClock, kind: PackKind, count: usize) -> Vec<Box<dyn BatterySensor>> {
    (0..count)
        .map(|id| Box::new(SimBattery::new(id, kind, clock)) as Box<dyn BatterySensor>)
        .collect()
}
