//! Beacon node: reads GPS and reports positions over the LoRa link
//!
//! Without radio hardware the link runs over UDP (`--bind`/`--peer`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use lora_tracker::controller::{BeaconController, ControllerResult, SimulatedBattery};
use lora_tracker::gps::{GpsReceiver, NmeaSource, SerialNmeaSource, SimulatedNmeaSource};
use lora_tracker::protocol::{LoRaEngine, ProtocolError};
use lora_tracker::utils::{init_logging, BeaconConfig, BusConfig, GpsConfig, ProtocolConfig, RadioConfig};
use lora_tracker::{GeoPoint, UdpTransceiver};

#[derive(Parser, Debug)]
#[command(name = "beacon", version, about = "LoRa GPS beacon")]
struct Args {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[arg(long, default_value = "BEACON01")]
    node_id: String,

    /// Destination node for reports
    #[arg(long, default_value = "TRACKER01")]
    dest: String,

    /// NMEA device or recorded log
    #[arg(long, default_value = "/dev/serial0")]
    gps_device: PathBuf,

    /// Synthesize GPS sentences instead of reading a device
    #[arg(long)]
    simulate_gps: bool,

    #[arg(long, default_value = "0.0.0.0:5601")]
    bind: SocketAddr,

    /// Tracker address; learned from the first datagram when omitted
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
            error!(error = %e, "Beacon failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> ControllerResult<()> {
    let mut protocol = ProtocolConfig {
        node_id: args.node_id.clone(),
        destination_id: args.dest.clone(),
        ..Default::default()
    };
    if args.no_encryption {
        protocol.encryption_key = None;
    } else if let Some(key) = &args.key {
        protocol.encryption_key = Some(key.clone());
    }

    let gps_source: Box<dyn NmeaSource> = if args.simulate_gps {
        info!("Using simulated GPS");
        Box::new(SimulatedNmeaSource::new(
            GeoPoint::new(51.5074, -0.1278),
            Duration::from_secs(1),
        ))
    } else {
        Box::new(SerialNmeaSource::open(&args.gps_device).map_err(ProtocolError::from)?)
    };

    let engine = LoRaEngine::with_transceiver(protocol, UdpTransceiver::new(args.bind, args.peer))?;
    engine.connect(&BusConfig::default(), &RadioConfig::default())?;

    let gps = GpsReceiver::new(GpsConfig::default());
    let mut beacon = BeaconController::new(
        BeaconConfig::default(),
        engine,
        gps,
        Box::new(SimulatedBattery::default()),
    )?;
    beacon.start(gps_source)?;
    info!(node_id = %args.node_id, dest = %args.dest, "Beacon running");

    wait_for_shutdown(args.duration);

    let stats = beacon.engine().statistics();
    info!(
        tx_packets = stats.tx_packets,
        tx_errors = stats.tx_errors,
        retries = stats.retries,
        rx_packets = stats.rx_packets,
        "Beacon shutting down"
    );
    beacon.stop()
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
