//! Ground-station link.
//!
//! A long-lived TCP client speaking newline-terminated text. Inbound lines
//! carry one integer command code each (`1` stop, `2` kill power, `3`
//! launch) and are translated into state-machine events. Outbound lines are
//! `"<code> <value>\n"` telemetry pushed on a fixed cadence from the latest
//! navigation snapshot.
//!
//! Connection drops trigger reconnects with exponential backoff; once the
//! station stays unreachable past the configured attempt budget, the link
//! surfaces `CriticalFailureDetected` and exits.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use telemetry::Registry;
use tracing::{error, info, warn};

use crate::state_machine::{Event, EventSender};

/// Outbound telemetry codes.
const CODE_VELOCITY: u8 = 1;
const CODE_DISTANCE: u8 = 2;
const CODE_BRAKING_DISTANCE: u8 = 3;

/// Socket read timeout; also paces the telemetry push checks.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Link tunables.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    /// Ground-station address, `host:port`.
    pub addr: String,
    /// Cadence of outbound telemetry lines.
    pub telemetry_interval: Duration,
    /// Consecutive failed connects tolerated before surfacing a critical
    /// failure.
    pub max_connect_attempts: u32,
    /// Initial reconnect backoff; doubles per attempt up to a ceiling.
    pub retry_backoff: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5695".to_string(),
            telemetry_interval: Duration::from_millis(200),
            max_connect_attempts: 5,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// The ground-station worker.
pub struct GroundStation {
    registry: Arc<Registry>,
    events: EventSender,
    config: CommsConfig,
}

impl GroundStation {
    pub fn new(registry: Arc<Registry>, events: EventSender, config: CommsConfig) -> Self {
        Self {
            registry,
            events,
            config,
        }
    }

    /// Run until shutdown or until the station is declared unreachable.
    pub fn run(self) {
        let mut attempts = 0u32;
        let mut backoff = self.config.retry_backoff;

        while self.registry.is_running() {
            match TcpStream::connect(&self.config.addr) {
                Ok(stream) => {
                    info!(target: "comms", "connected to ground station at {}", self.config.addr);
                    attempts = 0;
                    backoff = self.config.retry_backoff;
                    if let Err(e) = self.serve(stream) {
                        warn!(target: "comms", "ground station connection lost: {e}");
                    }
                }
                Err(e) => {
                    attempts += 1;
                    warn!(
                        target: "comms",
                        "connect to {} failed ({attempts}/{}): {e}",
                        self.config.addr, self.config.max_connect_attempts
                    );
                    if attempts >= self.config.max_connect_attempts {
                        error!(target: "comms", "CRITICAL: ground station unreachable");
                        let _ = self.events.send(Event::CriticalFailureDetected);
                        return;
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Service one established connection until it drops or shutdown.
    fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let mut last_push = Instant::now();

        while self.registry.is_running() {
            match reader.read_line(&mut line) {
                Ok(0) => return Ok(()), // station closed the connection
                Ok(_) => {
                    match parse_command(&line) {
                        Some(event) => {
                            info!(
                                target: "comms",
                                "ground station command {} -> {event}",
                                line.trim()
                            );
                            let _ = self.events.send(event);
                        }
                        None => {
                            warn!(target: "comms", "unknown ground station command {:?}", line.trim())
                        }
                    }
                    line.clear();
                }
                // Timeouts leave any partial line in the buffer for the
                // next read to complete.
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e),
            }

            if last_push.elapsed() >= self.config.telemetry_interval {
                self.push_telemetry(&mut writer)?;
                last_push = Instant::now();
            }
        }
        Ok(())
    }

    /// Push the latest navigation figures upstream.
    fn push_telemetry(&self, writer: &mut impl Write) -> std::io::Result<()> {
        let nav = self.registry.navigation();
        writer.write_all(format_telemetry(CODE_VELOCITY, nav.velocity).as_bytes())?;
        writer.write_all(format_telemetry(CODE_DISTANCE, nav.distance).as_bytes())?;
        writer.write_all(
            format_telemetry(CODE_BRAKING_DISTANCE, nav.emergency_braking_distance).as_bytes(),
        )?;
        writer.flush()
    }
}

/// Map an inbound command line to a state-machine event.
fn parse_command(line: &str) -> Option<Event> {
    match line.trim().parse::<i32>().ok()? {
        1 => Some(Event::EndOfRunReached),
        2 => Some(Event::CriticalFailureDetected),
        3 => Some(Event::OnStart),
        _ => None,
    }
}

/// One outbound telemetry line: `"<code> <value>\n"`.
fn format_telemetry(code: u8, value: f64) -> String {
    format!("{code} {value:.3}\n")
}
