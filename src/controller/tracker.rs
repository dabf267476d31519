//! Tracker controller
//!
//! Receives beacon positions (or synthesises them in simulation mode), keeps
//! the tracker's own position from an optional local GPS, and feeds both into
//! the navigation calculator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::algorithms::{NavigationCalculator, NavigationSnapshot};
use crate::controller::{sleep_while_running, ControllerError, ControllerResult, LoopWorker, CONTROLLER_SHUTDOWN_GRACE};
use crate::core::{epoch_seconds, GeoPoint, BROADCAST_ID};
use crate::gps::{GpsReceiver, NmeaSource};
use crate::protocol::{LoRaEngine, Message, Payload, PositionReport};
use crate::utils::config::TrackerConfig;

/// How long one loop iteration waits for an inbound message
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const LOOP_INTERVAL: Duration = Duration::from_millis(100);
/// Source id of synthetic beacon positions
pub const SIMULATED_BEACON_ID: &str = "SIMULATED";

/// Latest beacon position with the link quality it arrived with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconFix {
    pub src: String,
    pub position: GeoPoint,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub satellites: Option<u32>,
    pub battery: Option<f64>,
    pub rssi: f64,
    pub snr: f64,
    /// Epoch seconds
    pub received_at: f64,
}

struct TrackerInner {
    config: TrackerConfig,
    engine: Option<LoRaEngine>,
    navigation: Mutex<NavigationCalculator>,
    last_beacon: Mutex<Option<BeaconFix>>,
    beacon_updates: AtomicU64,
    gps: Mutex<Option<GpsReceiver>>,
    running: Arc<AtomicBool>,
}

impl TrackerInner {
    fn process_message(&self, message: &Message, rssi: f64, snr: f64) -> bool {
        let fix = match &message.payload {
            Payload::Position(report) => BeaconFix {
                src: message.src.clone(),
                position: GeoPoint::new(report.lat, report.lon),
                altitude: report.altitude,
                speed: report.speed,
                course: report.course,
                satellites: report.satellites,
                battery: report.battery,
                rssi,
                snr,
                received_at: epoch_seconds(),
            },
            Payload::Heartbeat(heartbeat) => match (heartbeat.lat, heartbeat.lon) {
                (Some(lat), Some(lon)) => BeaconFix {
                    src: message.src.clone(),
                    position: GeoPoint::new(lat, lon),
                    altitude: None,
                    speed: None,
                    course: None,
                    satellites: None,
                    battery: heartbeat.battery,
                    rssi,
                    snr,
                    received_at: epoch_seconds(),
                },
                _ => {
                    debug!(src = %message.src, battery = ?heartbeat.battery, "Heartbeat without position");
                    return false;
                }
            },
            Payload::Alert(alert) => {
                warn!(src = %message.src, ?alert, "Beacon alert");
                return false;
            }
            Payload::Status(status) => {
                info!(src = %message.src, gps = ?status.gps, battery = ?status.battery, mode = ?status.mode, "Beacon status");
                return false;
            }
            Payload::Response(response) => {
                info!(
                    src = %message.src,
                    response = %response.response,
                    status = %response.status,
                    request_id = ?response.request_id,
                    "Command response"
                );
                return false;
            }
            Payload::Command(_) | Payload::Ack { .. } => return false,
        };

        debug!(
            src = %fix.src,
            lat = fix.position.lat,
            lon = fix.position.lon,
            rssi = fix.rssi,
            snr = fix.snr,
            "Beacon position received"
        );
        self.navigation
            .lock()
            .update_beacon_position(fix.position.lat, fix.position.lon);
        *self.last_beacon.lock() = Some(fix);
        self.beacon_updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Synthetic beacon report jittered around the configured location
    fn simulate_beacon(&self) -> bool {
        let mut rng = rand::thread_rng();
        let jitter = self.config.simulation_jitter_deg;
        let center = self.config.simulated_location;
        let offset = |rng: &mut rand::rngs::ThreadRng| {
            if jitter > 0.0 {
                rng.gen_range(-jitter..=jitter)
            } else {
                0.0
            }
        };

        let report = PositionReport {
            lat: center.lat + offset(&mut rng),
            lon: center.lon + offset(&mut rng),
            altitude: Some(100.0 + rng.gen_range(-5.0..=5.0)),
            speed: Some(rng.gen_range(0.0..=5.0)),
            course: Some(f64::from(rng.gen_range(0u32..360))),
            fix_quality: Some(1),
            satellites: Some(8),
            battery: None,
            ..Default::default()
        };
        let rssi = -65.0 + rng.gen_range(-10.0..=10.0);
        let snr = 9.0 + rng.gen_range(-2.0..=2.0);

        let message = Message::new(
            format!("{}_{}", SIMULATED_BEACON_ID, epoch_seconds() as u64),
            SIMULATED_BEACON_ID,
            BROADCAST_ID,
            Payload::Position(report),
            false,
        );
        self.process_message(&message, rssi, snr)
    }

    fn refresh_tracker_position(&self) {
        let position = self
            .gps
            .lock()
            .as_ref()
            .and_then(|gps| gps.location())
            .and_then(|fix| fix.position());
        if let Some(position) = position {
            self.navigation
                .lock()
                .update_tracker_position(position.lat, position.lon);
        }
    }

    fn log_status(&self) {
        let navigation = self.navigation.lock();
        if navigation.beacon_position().is_none() {
            debug!("Waiting for beacon position");
            return;
        }
        let snapshot = navigation.snapshot();
        info!(
            distance = %navigation.formatted_distance(),
            bearing = %navigation.formatted_bearing(),
            distance_trend = ?snapshot.distance_trend,
            bearing_trend = ?snapshot.bearing_trend,
            tracker_fix = snapshot.tracker_position.is_some(),
            "Navigation status"
        );
    }
}

/// Tracker node: beacon positions in, distance and bearing out
pub struct TrackerController {
    inner: Arc<TrackerInner>,
    worker: Option<LoopWorker>,
}

impl TrackerController {
    /// `engine` must already be connected; it may be omitted only in
    /// simulation mode
    pub fn new(
        config: TrackerConfig,
        engine: Option<LoRaEngine>,
        gps: Option<GpsReceiver>,
    ) -> ControllerResult<Self> {
        config.validate()?;
        if !config.simulate && engine.is_none() {
            return Err(ControllerError::MissingRadio);
        }
        let navigation = NavigationCalculator::with_history_size(config.history_size);
        info!(simulate = config.simulate, local_gps = gps.is_some(), "Tracker controller initialized");
        Ok(Self {
            inner: Arc::new(TrackerInner {
                config,
                engine,
                navigation: Mutex::new(navigation),
                last_beacon: Mutex::new(None),
                beacon_updates: AtomicU64::new(0),
                gps: Mutex::new(gps),
                running: Arc::new(AtomicBool::new(false)),
            }),
            worker: None,
        })
    }

    /// Start the local GPS (if any), the protocol engine (if any) and the
    /// main loop. A GPS that fails to start leaves the tracker running
    /// without its own position.
    pub fn start(&mut self, gps_source: Option<Box<dyn NmeaSource>>) -> ControllerResult<()> {
        if self.worker.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }

        {
            let mut gps = self.inner.gps.lock();
            match (gps.as_mut(), gps_source) {
                (Some(receiver), Some(source)) => {
                    if let Err(e) = receiver.start(source) {
                        warn!(error = %e, "Tracker GPS failed to start, continuing without own position");
                    }
                }
                (Some(_), None) => warn!("Tracker GPS has no sentence source, continuing without own position"),
                (None, _) => info!("No tracker GPS, distance needs a fixed tracker position"),
            }
        }

        if let Some(engine) = &self.inner.engine {
            engine.start()?;
        }

        let inner = Arc::clone(&self.inner);
        let worker = LoopWorker::spawn("tracker-main", Arc::clone(&self.inner.running), move || {
            run_loop(&inner)
        });
        match worker {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                if let Some(engine) = &self.inner.engine {
                    let _ = engine.stop();
                }
                return Err(e);
            }
        }
        info!("Tracker controller started");
        Ok(())
    }

    /// Stop the loop, engine and GPS; the first error is returned after all
    /// three have been asked to stop
    pub fn stop(&mut self) -> ControllerResult<()> {
        let mut result = Ok(());
        if let Some(worker) = self.worker.take() {
            result = worker.stop(CONTROLLER_SHUTDOWN_GRACE);
        }
        if let Some(engine) = &self.inner.engine {
            if engine.is_running() {
                if let Err(e) = engine.stop() {
                    result = result.and(Err(e.into()));
                }
            }
        }
        if let Some(gps) = self.inner.gps.lock().as_mut() {
            if gps.is_running() {
                if let Err(e) = gps.stop() {
                    result = result.and(Err(e.into()));
                }
            }
        }
        info!(beacon_updates = self.beacon_updates(), "Tracker controller stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Apply an inbound message; true when it carried a beacon position
    pub fn process_message(&self, message: &Message, rssi: f64, snr: f64) -> bool {
        self.inner.process_message(message, rssi, snr)
    }

    pub fn simulate_beacon(&self) -> bool {
        self.inner.simulate_beacon()
    }

    /// Pin the tracker position, for stations without a GPS
    pub fn set_tracker_position(&self, position: GeoPoint) {
        self.inner
            .navigation
            .lock()
            .update_tracker_position(position.lat, position.lon);
    }

    pub fn navigation(&self) -> NavigationSnapshot {
        self.inner.navigation.lock().snapshot()
    }

    pub fn formatted_distance(&self) -> String {
        self.inner.navigation.lock().formatted_distance()
    }

    pub fn formatted_bearing(&self) -> String {
        self.inner.navigation.lock().formatted_bearing()
    }

    pub fn last_beacon(&self) -> Option<BeaconFix> {
        self.inner.last_beacon.lock().clone()
    }

    pub fn beacon_updates(&self) -> u64 {
        self.inner.beacon_updates.load(Ordering::Relaxed)
    }

    pub fn engine(&self) -> Option<&LoRaEngine> {
        self.inner.engine.as_ref()
    }
}

impl Drop for TrackerController {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

fn run_loop(inner: &TrackerInner) {
    let mut last_simulated: Option<Instant> = None;
    let mut last_status = Instant::now();

    loop {
        if inner.config.simulate
            && last_simulated.map_or(true, |at| at.elapsed() >= inner.config.simulation_period())
        {
            inner.simulate_beacon();
            last_simulated = Some(Instant::now());
        }

        if let Some(engine) = &inner.engine {
            if let Some(received) = engine.poll_received(POLL_TIMEOUT) {
                inner.process_message(&received.message, received.rssi, received.snr);
            }
        }

        inner.refresh_tracker_position();

        if last_status.elapsed() >= inner.config.status_interval() {
            inner.log_status();
            last_status = Instant::now();
        }

        if !sleep_while_running(&inner.running, LOOP_INTERVAL) {
            break;
        }
    }
}
