//! Sensor aggregation.
//!
//! The aggregator owns every sensor device for the lifetime of the run and
//! spawns one manager thread per device group (IMUs, each proximity bank,
//! batteries, the stripe counter). Managers poll their devices into small
//! internal buffers; the collation loop merges the buffers into `Sensors`
//! and `Batteries` snapshots and publishes to the registry only on change.
//!
//! Publish policy: a `Sensors` snapshot goes out when every online IMU's
//! timestamp advanced, or when both proximity banks' timestamps advanced.
//! The all-IMUs condition means a single stuck-but-online IMU holds back
//! the IMU path; the proximity path keeps publication alive in that case.
//! The behaviour is pinned by tests.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hardware::sensors::{BatterySensor, ImuSensor, ProximitySensor, StripeCounter};
use hardware::sim::{self, PackKind, SimClock, SimStripeCounter};
use telemetry::{
    lock, Batteries, Imu, ProximityBank, Registry, Sensors, StripeCount, Timestamp,
    NUM_HP_BATTERIES, NUM_IMUS, NUM_LP_BATTERIES, NUM_PROXIMITIES,
};
use tracing::{debug, info, warn};

const IMU_POLL_INTERVAL: Duration = Duration::from_millis(2);
const PROXI_POLL_INTERVAL: Duration = Duration::from_millis(5);
const BMS_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STRIPE_POLL_INTERVAL: Duration = Duration::from_millis(2);
const COLLATE_INTERVAL: Duration = Duration::from_millis(1);

/// The device complement handed to the aggregator at construction.
///
/// The aggregator takes exclusive ownership of every driver; nothing else
/// in the process holds a handle to a device.
pub struct SensorSuite {
    pub imus: Vec<Box<dyn ImuSensor>>,
    pub proxi_front: Vec<Box<dyn ProximitySensor>>,
    pub proxi_back: Vec<Box<dyn ProximitySensor>>,
    pub stripe: Option<Box<dyn StripeCounter>>,
    pub lp_batteries: Vec<Box<dyn BatterySensor>>,
    pub hp_batteries: Vec<Box<dyn BatterySensor>>,
}

impl SensorSuite {
    /// The full simulated complement used by the bench binaries and the
    /// integration tests.
    pub fn simulated(clock: SimClock) -> Self {
        Self {
            imus: sim::sim_imu_array(clock),
            proxi_front: sim::sim_proximity_bank(clock, 0),
            proxi_back: sim::sim_proximity_bank(clock, NUM_PROXIMITIES),
            stripe: Some(Box::new(SimStripeCounter::new(
                clock,
                Duration::from_millis(250),
            ))),
            lp_batteries: sim::sim_battery_packs(clock, PackKind::LowPower, NUM_LP_BATTERIES),
            hp_batteries: sim::sim_battery_packs(clock, PackKind::HighPower, NUM_HP_BATTERIES),
        }
    }

    /// A suite with no devices at all; tests add what they need.
    pub fn empty() -> Self {
        Self {
            imus: Vec::new(),
            proxi_front: Vec::new(),
            proxi_back: Vec::new(),
            stripe: None,
            lp_batteries: Vec::new(),
            hp_batteries: Vec::new(),
        }
    }
}

/// Latest per-IMU readings plus which devices are currently online.
struct ImuBuffer {
    imus: [Imu; NUM_IMUS],
    online: [bool; NUM_IMUS],
}

impl Default for ImuBuffer {
    fn default() -> Self {
        Self {
            imus: [Imu::default(); NUM_IMUS],
            online: [false; NUM_IMUS],
        }
    }
}

/// Latest sweep of one proximity bank.
#[derive(Default)]
struct BankBuffer {
    bank: ProximityBank,
    online: bool,
}

/// The sensor aggregation worker.
pub struct Aggregator {
    registry: Arc<Registry>,
    suite: SensorSuite,
}

impl Aggregator {
    pub fn new(registry: Arc<Registry>, suite: SensorSuite) -> Self {
        assert!(suite.imus.len() <= NUM_IMUS);
        assert!(suite.proxi_front.len() <= NUM_PROXIMITIES);
        assert!(suite.proxi_back.len() <= NUM_PROXIMITIES);
        assert!(suite.lp_batteries.len() <= NUM_LP_BATTERIES);
        assert!(suite.hp_batteries.len() <= NUM_HP_BATTERIES);
        Self { registry, suite }
    }

    /// Spawn the manager threads and run the collation loop until the
    /// registry signals shutdown.
    pub fn run(self) {
        info!(target: "sensors", "sensor aggregator started");

        let imu_buf = Arc::new(Mutex::new(ImuBuffer::default()));
        let front_buf = Arc::new(Mutex::new(BankBuffer::default()));
        let back_buf = Arc::new(Mutex::new(BankBuffer::default()));
        let stripe_buf = Arc::new(Mutex::new(StripeCount::default()));
        let batteries_buf = Arc::new(Mutex::new(Batteries::default()));

        let Self { registry, suite } = self;
        let mut handles = Vec::new();

        {
            let registry = registry.clone();
            let buf = imu_buf.clone();
            let devices = suite.imus;
            handles.push(thread::spawn(move || imu_manager(registry, devices, buf)));
        }
        {
            let registry = registry.clone();
            let buf = front_buf.clone();
            let devices = suite.proxi_front;
            handles.push(thread::spawn(move || {
                proxi_manager(registry, "front", devices, buf)
            }));
        }
        {
            let registry = registry.clone();
            let buf = back_buf.clone();
            let devices = suite.proxi_back;
            handles.push(thread::spawn(move || {
                proxi_manager(registry, "back", devices, buf)
            }));
        }
        if let Some(stripe) = suite.stripe {
            let registry = registry.clone();
            let buf = stripe_buf.clone();
            handles.push(thread::spawn(move || stripe_worker(registry, stripe, buf)));
        }
        {
            let registry = registry.clone();
            let buf = batteries_buf.clone();
            let lp = suite.lp_batteries;
            let hp = suite.hp_batteries;
            handles.push(thread::spawn(move || bms_manager(registry, lp, hp, buf)));
        }

        collate(
            &registry,
            &imu_buf,
            &front_buf,
            &back_buf,
            &stripe_buf,
            &batteries_buf,
        );

        for handle in handles {
            let _ = handle.join();
        }
        info!(target: "sensors", "sensor aggregator stopped");
    }
}

/// Merge manager buffers and publish on change.
fn collate(
    registry: &Registry,
    imu_buf: &Mutex<ImuBuffer>,
    front_buf: &Mutex<BankBuffer>,
    back_buf: &Mutex<BankBuffer>,
    stripe_buf: &Mutex<StripeCount>,
    batteries_buf: &Mutex<Batteries>,
) {
    let mut old_sensors = Sensors::default();
    let mut old_batteries = Batteries::default();

    while registry.is_running() {
        let (imus, imu_online) = {
            let buf = lock(imu_buf, "imu buffer");
            (buf.imus, buf.online)
        };
        let (front, front_online) = {
            let buf = lock(front_buf, "front proximity buffer");
            (buf.bank, buf.online)
        };
        let (back, back_online) = {
            let buf = lock(back_buf, "back proximity buffer");
            (buf.bank, buf.online)
        };
        let stripe = *lock(stripe_buf, "stripe buffer");

        let sensors = Sensors {
            imu: imus,
            proxi_front: front,
            proxi_back: back,
            stripe_count: stripe,
        };

        if imu_updated(&old_sensors, &sensors, &imu_online)
            || proxi_updated(&old_sensors, &sensors, front_online, back_online)
        {
            registry.set_sensors(sensors);
            old_sensors = sensors;
            thread::yield_now();
        }

        let batteries = *lock(batteries_buf, "battery buffer");
        if battery_updated(&old_batteries, &batteries) {
            registry.set_batteries(batteries);
            old_batteries = batteries;
            thread::yield_now();
        }

        thread::sleep(COLLATE_INTERVAL);
    }
}

/// True when every online IMU's accelerometer timestamp advanced.
///
/// One online IMU with a stuck timestamp is enough to return false; offline
/// devices are excluded until they recover.
fn imu_updated(old: &Sensors, new: &Sensors, online: &[bool; NUM_IMUS]) -> bool {
    let mut any_online = false;
    for i in 0..NUM_IMUS {
        if !online[i] {
            continue;
        }
        any_online = true;
        if old.imu[i].acc.timestamp == new.imu[i].acc.timestamp {
            return false;
        }
    }
    any_online
}

/// True when both online proximity banks' timestamps advanced.
fn proxi_updated(old: &Sensors, new: &Sensors, front_online: bool, back_online: bool) -> bool {
    if !front_online && !back_online {
        return false;
    }
    let front_fresh =
        !front_online || old.proxi_front.timestamp != new.proxi_front.timestamp;
    let back_fresh = !back_online || old.proxi_back.timestamp != new.proxi_back.timestamp;
    front_fresh && back_fresh
}

/// True when any pack's voltage or temperature changed.
fn battery_updated(old: &Batteries, new: &Batteries) -> bool {
    let lp_changed = old
        .low_power
        .iter()
        .zip(new.low_power.iter())
        .any(|(a, b)| a.voltage != b.voltage || a.temperature != b.temperature);
    let hp_changed = old
        .high_power
        .iter()
        .zip(new.high_power.iter())
        .any(|(a, b)| a.voltage != b.voltage || a.temperature != b.temperature);
    lp_changed || hp_changed
}

fn imu_manager(registry: Arc<Registry>, mut devices: Vec<Box<dyn ImuSensor>>, buf: Arc<Mutex<ImuBuffer>>) {
    let mut offline_logged = vec![false; devices.len()];
    while registry.is_running() {
        for (i, device) in devices.iter_mut().enumerate() {
            if !device.is_online() {
                if !offline_logged[i] {
                    warn!(target: "sensors", "IMU {i} offline");
                    offline_logged[i] = true;
                }
                lock(&buf, "imu buffer").online[i] = false;
                continue;
            }
            if offline_logged[i] {
                info!(target: "sensors", "IMU {i} back online");
                offline_logged[i] = false;
            }
            match device.read() {
                Ok(reading) => {
                    let mut guard = lock(&buf, "imu buffer");
                    guard.imus[i] = reading;
                    guard.online[i] = true;
                }
                Err(e) => debug!(target: "sensors", "IMU {i} read failed: {e}"),
            }
        }
        thread::sleep(IMU_POLL_INTERVAL);
    }
}

fn proxi_manager(
    registry: Arc<Registry>,
    name: &'static str,
    mut devices: Vec<Box<dyn ProximitySensor>>,
    buf: Arc<Mutex<BankBuffer>>,
) {
    let mut offline_logged = vec![false; devices.len()];
    while registry.is_running() {
        let mut values = lock(&buf, "proximity buffer").bank.value;
        let mut latest = Timestamp::ZERO;
        let mut any_online = false;
        let mut sweep_complete = true;

        for (i, device) in devices.iter_mut().enumerate() {
            if !device.is_online() {
                if !offline_logged[i] {
                    warn!(target: "sensors", "{name} proximity {i} offline");
                    offline_logged[i] = true;
                }
                continue;
            }
            if offline_logged[i] {
                info!(target: "sensors", "{name} proximity {i} back online");
                offline_logged[i] = false;
            }
            any_online = true;
            match device.read() {
                Ok(point) => {
                    values[i] = point.value;
                    latest = latest.max(point.timestamp);
                }
                Err(e) => {
                    debug!(target: "sensors", "{name} proximity {i} read failed: {e}");
                    sweep_complete = false;
                }
            }
        }

        let mut guard = lock(&buf, "proximity buffer");
        if any_online && sweep_complete {
            // The bank timestamp only moves on a complete sweep of the
            // online devices.
            guard.bank = ProximityBank::new(values, latest);
            guard.online = true;
        } else if !any_online {
            guard.online = false;
        }
        drop(guard);

        thread::sleep(PROXI_POLL_INTERVAL);
    }
}

fn stripe_worker(
    registry: Arc<Registry>,
    mut device: Box<dyn StripeCounter>,
    buf: Arc<Mutex<StripeCount>>,
) {
    let mut offline_logged = false;
    while registry.is_running() {
        if !device.is_online() {
            if !offline_logged {
                warn!(target: "sensors", "stripe counter offline");
                offline_logged = true;
            }
        } else {
            if offline_logged {
                info!(target: "sensors", "stripe counter back online");
                offline_logged = false;
            }
            match device.read() {
                Ok(count) => *lock(&buf, "stripe buffer") = count,
                Err(e) => debug!(target: "sensors", "stripe counter read failed: {e}"),
            }
        }
        thread::sleep(STRIPE_POLL_INTERVAL);
    }
}

fn bms_manager(
    registry: Arc<Registry>,
    mut lp: Vec<Box<dyn BatterySensor>>,
    mut hp: Vec<Box<dyn BatterySensor>>,
    buf: Arc<Mutex<Batteries>>,
) {
    let mut offline_logged = vec![false; lp.len() + hp.len()];
    while registry.is_running() {
        let mut batteries = *lock(&buf, "battery buffer");

        for (i, device) in lp.iter_mut().enumerate() {
            poll_battery(device, &mut batteries.low_power[i], "LP", i, &mut offline_logged[i]);
        }
        let lp_count = lp.len();
        for (i, device) in hp.iter_mut().enumerate() {
            poll_battery(
                device,
                &mut batteries.high_power[i],
                "HP",
                i,
                &mut offline_logged[lp_count + i],
            );
        }

        *lock(&buf, "battery buffer") = batteries;
        thread::sleep(BMS_POLL_INTERVAL);
    }
}

fn poll_battery(
    device: &mut Box<dyn BatterySensor>,
    slot: &mut telemetry::Battery,
    kind: &str,
    id: usize,
    offline_logged: &mut bool,
) {
    if !device.is_online() {
        if !*offline_logged {
            warn!(target: "sensors", "{kind} BMS {id} offline");
            *offline_logged = true;
        }
        return;
    }
    if *offline_logged {
        info!(target: "sensors", "{kind} BMS {id} back online");
        *offline_logged = false;
    }
    match device.read() {
        Ok(reading) => *slot = reading,
        Err(e) => debug!(target: "sensors", "{kind} BMS {id} read failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::{Battery, DataPoint, Proximity};

    fn sensors_with_imu_stamps(stamps: [u64; NUM_IMUS]) -> Sensors {
        let mut sensors = Sensors::default();
        for (imu, stamp) in sensors.imu.iter_mut().zip(stamps.iter()) {
            imu.acc.timestamp = Timestamp::from_micros(*stamp);
        }
        sensors
    }

    #[test]
    fn test_imu_updated_when_all_advance() {
        let old = sensors_with_imu_stamps([100; NUM_IMUS]);
        let new = sensors_with_imu_stamps([200; NUM_IMUS]);
        assert!(imu_updated(&old, &new, &[true; NUM_IMUS]));
    }

    #[test]
    fn test_single_stalled_imu_blocks_the_imu_path() {
        // One stuck-but-online IMU is enough to veto the whole group; this
        // pins the current policy rather than endorsing it.
        let old = sensors_with_imu_stamps([100; NUM_IMUS]);
        let mut stamps = [200u64; NUM_IMUS];
        stamps[3] = 100;
        let new = sensors_with_imu_stamps(stamps);
        assert!(!imu_updated(&old, &new, &[true; NUM_IMUS]));
    }

    #[test]
    fn test_offline_imu_is_excluded_from_the_check() {
        let old = sensors_with_imu_stamps([100; NUM_IMUS]);
        let mut stamps = [200u64; NUM_IMUS];
        stamps[3] = 100; // stalled, but offline below
        let new = sensors_with_imu_stamps(stamps);
        let mut online = [true; NUM_IMUS];
        online[3] = false;
        assert!(imu_updated(&old, &new, &online));
    }

    #[test]
    fn test_all_imus_offline_never_updates() {
        let old = sensors_with_imu_stamps([100; NUM_IMUS]);
        let new = sensors_with_imu_stamps([200; NUM_IMUS]);
        assert!(!imu_updated(&old, &new, &[false; NUM_IMUS]));
    }

    #[test]
    fn test_proxi_updated_requires_both_banks() {
        let mut old = Sensors::default();
        old.proxi_front.timestamp = Timestamp::from_micros(100);
        old.proxi_back.timestamp = Timestamp::from_micros(100);

        let mut new = old;
        new.proxi_front.timestamp = Timestamp::from_micros(200);
        assert!(!proxi_updated(&old, &new, true, true));

        new.proxi_back.timestamp = Timestamp::from_micros(200);
        assert!(proxi_updated(&old, &new, true, true));
    }

    #[test]
    fn test_offline_bank_does_not_block_the_other() {
        let mut old = Sensors::default();
        old.proxi_front.timestamp = Timestamp::from_micros(100);
        let mut new = old;
        new.proxi_front.timestamp = Timestamp::from_micros(200);
        // Back bank never advances but is offline, so the front bank alone
        // carries the update.
        assert!(proxi_updated(&old, &new, true, false));
        assert!(!proxi_updated(&old, &new, false, false));
    }

    #[test]
    fn test_battery_updated_on_voltage_or_temperature_change() {
        let old = Batteries::default();

        let mut voltage_change = old;
        voltage_change.low_power[0].voltage = 170;
        assert!(battery_updated(&old, &voltage_change));

        let mut temp_change = old;
        temp_change.high_power[1].temperature = 31;
        assert!(battery_updated(&old, &temp_change));

        let mut current_change = old;
        current_change.low_power[0].current = 50;
        assert!(!battery_updated(&old, &current_change));
    }

    #[test]
    fn test_duplicate_snapshot_is_not_an_update() {
        let sensors = sensors_with_imu_stamps([100; NUM_IMUS]);
        assert!(!imu_updated(&sensors, &sensors, &[true; NUM_IMUS]));
        assert!(!proxi_updated(&sensors, &sensors, true, true));

        let batteries = Batteries {
            low_power: [Battery {
                voltage: 170,
                current: 200,
                temperature: 30,
                charge: 100,
            }; NUM_LP_BATTERIES],
            high_power: [Battery {
                voltage: 1100,
                current: 200,
                temperature: 30,
                charge: 100,
            }; NUM_HP_BATTERIES],
        };
        assert!(!battery_updated(&batteries, &batteries));
    }

    #[test]
    fn test_bank_buffer_update_shape() {
        let bank = ProximityBank::new(
            [Proximity { val: 25 }; NUM_PROXIMITIES],
            Timestamp::from_micros(42),
        );
        let point: DataPoint<[Proximity; NUM_PROXIMITIES]> = bank;
        assert_eq!(point.timestamp.as_micros(), 42);
        assert_eq!(point.value[0].val, 25);
    }
}
