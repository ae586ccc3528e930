//! CLI flags and run parameters.
//!
//! The `pod` binary is configured in two layers: an optional JSON parameter
//! file for tunables, and CLI flags that select which workers run and
//! override individual file values. Flag spellings match the operator
//! runbook (`--log_level`, `--sensors_only`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::comms::CommsConfig;
use crate::navigation::NavigationConfig;

/// Pod control firmware.
#[derive(Parser, Debug)]
#[command(name = "pod", about = "Pod control firmware", version)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,

    /// Run only the sensor acquisition stack
    #[arg(long = "sensors_only", conflicts_with = "motors_only")]
    pub sensors_only: bool,

    /// Run only the state machine and motor control stack
    #[arg(long = "motors_only")]
    pub motors_only: bool,

    /// Override the post-calibration barrier party count
    #[arg(long = "sync_barrier")]
    pub sync_barrier: Option<usize>,

    /// Ground station address, host:port
    #[arg(long = "gs_addr")]
    pub gs_addr: Option<String>,

    /// Run without a ground-station link
    #[arg(long = "no_gs")]
    pub no_gs: bool,

    /// JSON parameter file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// Tunable run parameters, loadable from a JSON file.
///
/// Missing fields fall back to the defaults below, so a parameter file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodParams {
    pub gs_addr: String,
    pub min_calibration_samples: u32,
    pub calibration_timeout_s: u64,
    pub stripe_spacing_m: f64,
    pub telemetry_interval_ms: u64,
}

impl Default for PodParams {
    fn default() -> Self {
        Self {
            gs_addr: "127.0.0.1:5695".to_string(),
            min_calibration_samples: 200_000,
            calibration_timeout_s: 120,
            stripe_spacing_m: 30.48,
            telemetry_interval_ms: 200,
        }
    }
}

impl PodParams {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading parameter file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing parameter file {}", path.display()))
    }
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub params: PodParams,
    pub sensors_only: bool,
    pub motors_only: bool,
    /// Parties on the post-calibration barrier: navigation plus motors in a
    /// full run, one in motors-only mode.
    pub barrier_parties: usize,
    /// Ground-station address, or `None` when the link is disabled.
    pub ground_station: Option<String>,
}

impl Config {
    pub fn resolve(args: &Args) -> anyhow::Result<Self> {
        let mut params = match &args.config {
            Some(path) => PodParams::load(path)?,
            None => PodParams::default(),
        };
        if let Some(addr) = &args.gs_addr {
            params.gs_addr = addr.clone();
        }

        let barrier_parties = args
            .sync_barrier
            .unwrap_or(if args.motors_only { 1 } else { 2 });
        anyhow::ensure!(barrier_parties >= 1, "sync barrier needs at least one party");

        let ground_station = if args.no_gs || args.sensors_only {
            None
        } else {
            Some(params.gs_addr.clone())
        };

        Ok(Self {
            params,
            sensors_only: args.sensors_only,
            motors_only: args.motors_only,
            barrier_parties,
            ground_station,
        })
    }

    pub fn navigation(&self) -> NavigationConfig {
        NavigationConfig {
            min_calibration_samples: self.params.min_calibration_samples,
            calibration_timeout: Duration::from_secs(self.params.calibration_timeout_s),
            stripe_spacing: self.params.stripe_spacing_m,
        }
    }

    pub fn comms(&self) -> CommsConfig {
        CommsConfig {
            addr: self.params.gs_addr.clone(),
            telemetry_interval: Duration::from_millis(self.params.telemetry_interval_ms),
            ..CommsConfig::default()
        }
    }
}
