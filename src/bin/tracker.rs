//! Tracker node: receives beacon positions and reports distance and bearing
//!
//! `--simulate` replaces the radio with a synthetic beacon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use lora_tracker::controller::{ControllerResult, TrackerController};
use lora_tracker::gps::{GpsReceiver, NmeaSource, SerialNmeaSource};
use lora_tracker::protocol::LoRaEngine;
use lora_tracker::utils::{init_logging, BusConfig, GpsConfig, ProtocolConfig, RadioConfig, TrackerConfig};
use lora_tracker::UdpTransceiver;

#[derive(Parser, Debug)]
#[command(name = "tracker", version, about = "LoRa GPS tracker")]
struct Args {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Generate beacon positions instead of listening on the radio
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = "TRACKER01")]
    node_id: String,

    /// Local NMEA device; the tracker runs without its own position if absent
    #[arg(long)]
    gps_device: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:5602")]
    bind: SocketAddr,

    /// Beacon address; learned from the first datagram when omitted
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// AES key (16, 24 or 32 bytes)
    #[arg(long)]
    key: Option<String>,

    #[arg(long, conflicts_with = "key")]
    no_encryption: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Tracker failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> ControllerResult<()> {
    let engine = if args.simulate {
        info!("Simulation mode, radio disabled");
        None
    } else {
        let mut protocol = ProtocolConfig {
            node_id: args.node_id.clone(),
            ..Default::default()
        };
        if args.no_encryption {
            protocol.encryption_key = None;
        } else if let Some(key) = &args.key {
            protocol.encryption_key = Some(key.clone());
        }
        let engine = LoRaEngine::with_transceiver(protocol, UdpTransceiver::new(args.bind, args.peer))?;
        engine.connect(&BusConfig::default(), &RadioConfig::default())?;
        Some(engine)
    };

    let (gps, gps_source) = match &args.gps_device {
        Some(path) => match SerialNmeaSource::open(path) {
            Ok(source) => (
                Some(GpsReceiver::new(GpsConfig::default())),
                Some(Box::new(source) as Box<dyn NmeaSource>),
            ),
            Err(e) => {
                warn!(error = %e, device = %path.display(), "Tracker GPS unavailable, continuing without own position");
                (None, None)
            }
        },
        None => (None, None),
    };

    let config = TrackerConfig {
        simulate: args.simulate,
        ..Default::default()
    };
    let mut tracker = TrackerController::new(config, engine, gps)?;
    tracker.start(gps_source)?;
    info!(node_id = %args.node_id, "Tracker running");

    wait_for_shutdown(args.duration);

    info!(
        beacon_updates = tracker.beacon_updates(),
        distance = %tracker.formatted_distance(),
        bearing = %tracker.formatted_bearing(),
        "Tracker shutting down"
    );
    tracker.stop()
}

/// Block until Ctrl+C or until `duration_secs` elapses
fn wait_for_shutdown(duration_secs: Option<u64>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "Failed to install signal handler");
    }

    let deadline = duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    while !shutdown.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        thread::sleep(Duration::from_millis(200));
    }
}
