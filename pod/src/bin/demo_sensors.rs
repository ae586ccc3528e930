//! Sensors-only bring-up loop.
//!
//! Creates one of each simulated device, polls them on a fixed cadence, and
//! logs every reading. Handy for checking sensor plumbing and log output
//! without starting the full worker stack.

use std::thread;
use std::time::Duration;

use clap::Parser;
use hardware::sensors::{BatterySensor, ImuSensor, ProximitySensor, StripeCounter};
use hardware::sim::{PackKind, SimBattery, SimClock, SimImu, SimProximity, SimStripeCounter};
use tracing::{info, warn};

/// Poll the simulated sensor suite and log readings.
#[derive(Parser, Debug)]
#[command(name = "demo_sensors")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,

    /// Number of polling cycles (0 = run until killed)
    #[arg(long, default_value_t = 0)]
    cycles: u64,
}

fn main() {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let clock = SimClock::new();
    info!("creating sensors");
    let mut imu = SimImu::new(0, clock);
    let mut proxi = SimProximity::new(0, clock);
    let mut bms_lp = SimBattery::new(0, PackKind::LowPower, clock);
    let mut bms_hp = SimBattery::new(1, PackKind::HighPower, clock);
    let mut stripes = SimStripeCounter::new(clock, Duration::from_millis(500));

    info!("all sensors created, entering test loop");
    let mut cycle = 0u64;
    loop {
        match imu.read() {
            Ok(reading) => info!(
                "imu acc {:.3} {:.3} {:.3}  gyr {:.4} {:.4} {:.4}",
                reading.acc.value.x,
                reading.acc.value.y,
                reading.acc.value.z,
                reading.gyr.value.x,
                reading.gyr.value.y,
                reading.gyr.value.z,
            ),
            Err(e) => warn!("imu read failed: {e}"),
        }
        match proxi.read() {
            Ok(point) => info!("proxi distance: {} mm", point.value.val),
            Err(e) => warn!("proxi read failed: {e}"),
        }
        match bms_lp.read() {
            Ok(pack) => info!(
                "bms lp voltage, current, temp: {} {} {}",
                pack.voltage, pack.current, pack.temperature
            ),
            Err(e) => warn!("bms lp read failed: {e}"),
        }
        match bms_hp.read() {
            Ok(pack) => info!(
                "bms hp voltage, current, temp: {} {} {}",
                pack.voltage, pack.current, pack.temperature
            ),
            Err(e) => warn!("bms hp read failed: {e}"),
        }
        match stripes.read() {
            Ok(count) => info!("stripe count: {}", count.value),
            Err(e) => warn!("stripe counter read failed: {e}"),
        }

        cycle += 1;
        if args.cycles != 0 && cycle >= args.cycles {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
}
