//! Beacon controller
//!
//! Drives the transmitting node: periodic and movement-triggered position
//! reports, heartbeats, a status report at startup, geofence, waypoint and
//! low-battery alerts, and answers to remote commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::algorithms::geo::distance;
use crate::controller::{sleep_while_running, ControllerError, ControllerResult, LoopWorker, CONTROLLER_SHUTDOWN_GRACE};
use crate::core::{epoch_seconds, GeoPoint, GpsFix, UNKNOWN_SENDER_ID};
use crate::gps::{GpsReceiver, NmeaSource};
use crate::protocol::{
    Alert, CommandPayload, Extra, FenceTransition, GpsState, Heartbeat, LoRaEngine, Message,
    MessageSender, MessageType, Payload, PositionReport, ProtocolResult, ResponsePayload,
    StatusReport,
};
use crate::utils::config::{BeaconConfig, ConfigError};

/// Loop period in low-power mode while there is no fix
const LOW_POWER_IDLE: Duration = Duration::from_secs(5);
/// Pause after a failed loop iteration
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const FENCE_ID: &str = "main";

/// Source of the battery charge level
pub trait BatteryMonitor: Send {
    /// Current charge, percent
    fn read_level(&mut self) -> f64;
}

/// Battery that drains a fixed amount on every reading
#[derive(Debug, Clone)]
pub struct SimulatedBattery {
    level: f64,
    drain_per_read: f64,
}

impl SimulatedBattery {
    pub fn new(level: f64, drain_per_read: f64) -> Self {
        Self {
            level: level.clamp(0.0, 100.0),
            drain_per_read,
        }
    }
}

impl Default for SimulatedBattery {
    fn default() -> Self {
        Self::new(100.0, 0.01)
    }
}

impl BatteryMonitor for SimulatedBattery {
    fn read_level(&mut self) -> f64 {
        self.level = (self.level - self.drain_per_read).clamp(0.0, 100.0);
        self.level
    }
}

/// A point the beacon reports reaching, once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waypoint {
    pub id: String,
    pub position: GeoPoint,
    pub radius_m: f64,
    pub visited: bool,
    /// Epoch seconds of the first visit
    pub visited_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WaypointArgs {
    lat: f64,
    lon: f64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    radius: Option<f64>,
}

/// A remote command, decoded from its payload
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Partial [`BeaconConfig`] to merge into the running configuration
    SetConfig(Extra),
    RequestPosition,
    /// `None` when the waypoint argument is missing or malformed
    AddWaypoint(Option<(GeoPoint, Option<String>, Option<f64>)>),
    ClearWaypoints,
    PowerSave { enable: bool },
    Unknown(String),
}

impl Command {
    pub fn parse(payload: &CommandPayload) -> Self {
        let args = &payload.args;
        match payload.command.as_str() {
            "set_config" => Command::SetConfig(
                args.get("config")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            ),
            "request_position" => Command::RequestPosition,
            "add_waypoint" => Command::AddWaypoint(
                args.get("waypoint")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<WaypointArgs>(v).ok())
                    .map(|wp| (GeoPoint::new(wp.lat, wp.lon), wp.id, wp.radius)),
            ),
            "clear_waypoints" => Command::ClearWaypoints,
            "power_save" => Command::PowerSave {
                enable: args.get("enable").and_then(Value::as_bool).unwrap_or(false),
            },
            other => Command::Unknown(other.to_string()),
        }
    }

    /// Name carried in the `response` field of the answer
    pub fn response_name(&self) -> &str {
        match self {
            Command::SetConfig(_) => "config_update",
            Command::RequestPosition => "position",
            Command::AddWaypoint(_) => "add_waypoint",
            Command::ClearWaypoints => "clear_waypoints",
            Command::PowerSave { .. } => "power_save",
            Command::Unknown(name) => name,
        }
    }
}

#[derive(Debug)]
struct BeaconState {
    config: BeaconConfig,
    last_report: Option<(GeoPoint, Instant)>,
    last_heartbeat: Option<Instant>,
    battery: f64,
    battery_alert_sent: bool,
    inside_geofence: Option<bool>,
    waypoints: Vec<Waypoint>,
    /// Count of waypoints ever added; source of default ids
    waypoints_added: usize,
}

impl BeaconState {
    fn mode(&self) -> &'static str {
        if self.config.low_power_mode {
            "low_power"
        } else {
            "normal"
        }
    }
}

struct BeaconInner {
    sender: MessageSender,
    gps: Mutex<GpsReceiver>,
    battery: Mutex<Box<dyn BatteryMonitor>>,
    state: Mutex<BeaconState>,
    started_at: Instant,
    running: Arc<AtomicBool>,
}

impl BeaconInner {
    /// Queue a message; recoverable failures are logged and yield `None`
    fn send(&self, payload: Payload, dst: Option<&str>, ack_req: bool) -> ProtocolResult<Option<String>> {
        let kind = payload.message_type();
        match self.sender.send(payload, dst, ack_req) {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.is_recoverable() => {
                warn!(%kind, error = %e, "Message not queued");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn gps_state(&self) -> GpsState {
        let gps = self.gps.lock();
        if !gps.is_running() {
            GpsState::Inactive
        } else if gps.has_fix() {
            GpsState::Fixed
        } else {
            GpsState::NoFix
        }
    }

    /// One main-loop iteration; returns how long to sleep before the next
    fn tick(&self) -> ProtocolResult<Duration> {
        let fix = self.gps.lock().location();
        let battery = self.battery.lock().read_level();

        let mut state = self.state.lock();
        state.battery = battery;

        if let Some(fix) = &fix {
            if let Some(position) = fix.position() {
                self.report_position(&mut state, fix, position)?;
                self.check_geofence(&mut state, position)?;
                self.check_waypoints(&mut state, position)?;
            }
        }

        let heartbeat_due = state
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= state.config.heartbeat_interval());
        if heartbeat_due {
            let heartbeat = Heartbeat {
                battery: Some(state.battery),
                has_fix: fix.is_some(),
                mode: Some(state.mode().to_string()),
                lat: fix.as_ref().and_then(|f| f.latitude),
                lon: fix.as_ref().and_then(|f| f.longitude),
                extra: Extra::new(),
            };
            if let Some(id) = self.send(Payload::Heartbeat(heartbeat), None, false)? {
                debug!(message_id = %id, "Heartbeat queued");
                state.last_heartbeat = Some(Instant::now());
            }
        }

        self.check_battery(&mut state)?;

        if state.config.low_power_mode && fix.is_none() {
            Ok(LOW_POWER_IDLE)
        } else {
            Ok(state.config.loop_interval())
        }
    }

    fn report_position(&self, state: &mut BeaconState, fix: &GpsFix, position: GeoPoint) -> ProtocolResult<()> {
        let (moved, due) = match state.last_report {
            None => (false, true),
            Some((last, at)) => (
                distance(last.lat, last.lon, position.lat, position.lon) > state.config.position_change_threshold_m,
                at.elapsed() >= state.config.position_interval(),
            ),
        };
        if !(moved || due) {
            return Ok(());
        }

        let queued = if state.config.low_power_mode {
            // Airtime is scarce: 12-byte packet, no acknowledgment
            match self
                .sender
                .send_minimal(position.lat, position.lon, epoch_seconds() as u32)
            {
                Ok(id) => Some(id),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Minimal position not queued");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            match PositionReport::from_fix(fix, Some(state.battery)) {
                Some(report) => self.send(Payload::Position(report), None, true)?,
                None => None,
            }
        };

        if let Some(id) = queued {
            debug!(message_id = %id, lat = position.lat, lon = position.lon, moved, "Position update queued");
            state.last_report = Some((position, Instant::now()));
        }
        Ok(())
    }

    fn check_geofence(&self, state: &mut BeaconState, position: GeoPoint) -> ProtocolResult<()> {
        let Some(fence) = state.config.geofence else {
            return Ok(());
        };
        let inside = distance(fence.center.lat, fence.center.lon, position.lat, position.lon) <= fence.radius_m;

        match state.inside_geofence {
            Some(previous) if previous != inside => {
                let status = if inside {
                    FenceTransition::Enter
                } else {
                    FenceTransition::Exit
                };
                let alert = Alert::Geofence {
                    status,
                    lat: position.lat,
                    lon: position.lon,
                    fence_id: FENCE_ID.to_string(),
                };
                // Transition kept pending until the alert is queued
                if let Some(id) = self.send(Payload::Alert(alert), None, true)? {
                    info!(message_id = %id, ?status, "Geofence alert queued");
                    state.inside_geofence = Some(inside);
                }
            }
            Some(_) => {}
            None => state.inside_geofence = Some(inside),
        }
        Ok(())
    }

    fn check_waypoints(&self, state: &mut BeaconState, position: GeoPoint) -> ProtocolResult<()> {
        for index in 0..state.waypoints.len() {
            let waypoint = &state.waypoints[index];
            if waypoint.visited {
                continue;
            }
            let d = distance(waypoint.position.lat, waypoint.position.lon, position.lat, position.lon);
            if d > waypoint.radius_m {
                continue;
            }

            let alert = Alert::Waypoint {
                wp_id: waypoint.id.clone(),
                lat: position.lat,
                lon: position.lon,
                distance: d,
            };
            if let Some(id) = self.send(Payload::Alert(alert), None, true)? {
                let waypoint = &mut state.waypoints[index];
                waypoint.visited = true;
                waypoint.visited_at = Some(epoch_seconds());
                info!(message_id = %id, wp_id = %waypoint.id, distance = d, "Waypoint reached");
            }
        }
        Ok(())
    }

    /// Alert once per crossing below the threshold; re-armed on recovery
    fn check_battery(&self, state: &mut BeaconState) -> ProtocolResult<()> {
        let low = state.battery <= state.config.low_battery_threshold;
        if !low {
            state.battery_alert_sent = false;
            return Ok(());
        }
        if state.battery_alert_sent {
            return Ok(());
        }

        let alert = Alert::Battery { level: state.battery };
        if let Some(id) = self.send(Payload::Alert(alert), None, true)? {
            warn!(message_id = %id, level = state.battery, "Low battery alert queued");
            state.battery_alert_sent = true;
        }
        Ok(())
    }

    fn send_status(&self) -> ProtocolResult<Option<String>> {
        let gps = self.gps_state();
        let status = {
            let state = self.state.lock();
            StatusReport {
                node_id: self.sender.node_id().to_string(),
                gps: Some(gps),
                battery: Some(state.battery),
                mode: Some(state.mode().to_string()),
                uptime: Some(self.started_at.elapsed().as_secs()),
                lora_stats: Some(self.sender.statistics()),
                extra: Extra::new(),
            }
        };
        let queued = self.send(Payload::Status(status), None, true)?;
        if let Some(id) = &queued {
            info!(message_id = %id, "Status message queued");
        }
        Ok(queued)
    }

    fn handle_command(&self, message: &Message) {
        let Payload::Command(payload) = &message.payload else {
            return;
        };
        let command = Command::parse(payload);
        info!(command = %payload.command, request_id = %message.id, "Command received");

        let response = self.execute(&command, &message.id);
        let dst = if message.src.is_empty() || message.src == UNKNOWN_SENDER_ID {
            None
        } else {
            Some(message.src.as_str())
        };
        if let Err(e) = self.send(Payload::Response(response), dst, true) {
            error!(error = %e, command = %payload.command, "Failed to queue command response");
        }
    }

    fn execute(&self, command: &Command, request_id: &str) -> ResponsePayload {
        let mut extra = Extra::new();
        let status = match command {
            Command::SetConfig(changes) => match self.apply_config(changes) {
                Ok(()) => "success",
                Err(e) => {
                    warn!(error = %e, "Configuration update rejected");
                    extra.insert("error".to_string(), json!(e.to_string()));
                    "failed"
                }
            },
            Command::RequestPosition => {
                let fix = self.gps.lock().location();
                let battery = self.state.lock().battery;
                match fix.and_then(|f| PositionReport::from_fix(&f, Some(battery))) {
                    Some(report) => {
                        if let Ok(Value::Object(fields)) = serde_json::to_value(&report) {
                            extra.extend(fields);
                        }
                        "success"
                    }
                    None => "no_fix",
                }
            }
            Command::AddWaypoint(Some((position, id, radius))) => {
                let mut state = self.state.lock();
                let id = id.clone().unwrap_or_else(|| format!("wp_{}", state.waypoints_added));
                let waypoint = Waypoint {
                    id: id.clone(),
                    position: *position,
                    radius_m: radius.unwrap_or(state.config.waypoint_radius_m),
                    visited: false,
                    visited_at: None,
                };
                info!(wp_id = %id, lat = position.lat, lon = position.lon, radius_m = waypoint.radius_m, "Waypoint added");
                state.waypoints.push(waypoint);
                state.waypoints_added += 1;
                extra.insert("wp_id".to_string(), json!(id));
                "success"
            }
            Command::AddWaypoint(None) => "failed",
            Command::ClearWaypoints => {
                self.state.lock().waypoints.clear();
                info!("Waypoints cleared");
                "success"
            }
            Command::PowerSave { enable } => {
                let mut state = self.state.lock();
                state.config.low_power_mode = *enable;
                info!(enabled = enable, "Power save mode changed");
                extra.insert("mode".to_string(), json!(state.mode()));
                "success"
            }
            Command::Unknown(name) => {
                warn!(command = %name, "Unknown command");
                "unknown_command"
            }
        };

        ResponsePayload {
            response: command.response_name().to_string(),
            status: status.to_string(),
            request_id: Some(request_id.to_string()),
            extra,
        }
    }

    /// Merge `changes` into the running configuration, all or nothing
    fn apply_config(&self, changes: &Extra) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        let mut merged = match serde_json::to_value(&state.config) {
            Ok(Value::Object(map)) => map,
            _ => Extra::new(),
        };
        for (key, value) in changes {
            if !merged.contains_key(key) {
                return Err(ConfigError::InvalidParameter {
                    parameter: key.clone(),
                    value: value.to_string(),
                    reason: "unknown setting".to_string(),
                });
            }
            merged.insert(key.clone(), value.clone());
        }

        let updated: BeaconConfig =
            serde_json::from_value(Value::Object(merged)).map_err(|e| ConfigError::InvalidParameter {
                parameter: "config".to_string(),
                value: Value::Object(changes.clone()).to_string(),
                reason: e.to_string(),
            })?;
        updated.validate()?;
        info!(?updated, "Beacon configuration updated");
        state.config = updated;
        Ok(())
    }
}

/// Beacon node: GPS in, position reports and alerts out
pub struct BeaconController {
    engine: LoRaEngine,
    inner: Arc<BeaconInner>,
    worker: Option<LoopWorker>,
}

impl BeaconController {
    /// `engine` must already be connected; the controller starts its workers
    pub fn new(
        config: BeaconConfig,
        engine: LoRaEngine,
        gps: GpsReceiver,
        battery: Box<dyn BatteryMonitor>,
    ) -> ControllerResult<Self> {
        config.validate()?;
        let inner = Arc::new(BeaconInner {
            sender: engine.sender(),
            gps: Mutex::new(gps),
            battery: Mutex::new(battery),
            state: Mutex::new(BeaconState {
                config,
                last_report: None,
                last_heartbeat: None,
                battery: 100.0,
                battery_alert_sent: false,
                inside_geofence: None,
                waypoints: Vec::new(),
                waypoints_added: 0,
            }),
            started_at: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
        });
        info!(node_id = %engine.node_id(), "Beacon controller initialized");
        Ok(Self {
            engine,
            inner,
            worker: None,
        })
    }

    /// Start GPS reading, the protocol engine and the main loop, then send
    /// the startup status report
    pub fn start(&mut self, gps_source: Box<dyn NmeaSource>) -> ControllerResult<()> {
        if self.worker.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }

        self.inner.gps.lock().start(gps_source)?;

        let handler_inner = Arc::clone(&self.inner);
        self.engine
            .register_handler(MessageType::Command, move |message| handler_inner.handle_command(&message));
        if let Err(e) = self.engine.start() {
            let _ = self.inner.gps.lock().stop();
            return Err(e.into());
        }

        let inner = Arc::clone(&self.inner);
        let worker = LoopWorker::spawn("beacon-main", Arc::clone(&self.inner.running), move || {
            run_loop(&inner)
        });
        match worker {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                let _ = self.engine.stop();
                let _ = self.inner.gps.lock().stop();
                return Err(e);
            }
        }

        info!("Beacon controller started");
        self.inner.send_status()?;
        Ok(())
    }

    /// Stop the main loop, the engine and the GPS reader; every stage runs
    /// even if an earlier one failed, the first error is returned
    pub fn stop(&mut self) -> ControllerResult<()> {
        let mut result = Ok(());
        if let Some(worker) = self.worker.take() {
            result = worker.stop(CONTROLLER_SHUTDOWN_GRACE);
        }
        if let Err(e) = self.engine.stop() {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        if let Err(e) = self.inner.gps.lock().stop() {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        info!("Beacon controller stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Run one main-loop iteration on the calling thread
    pub fn tick(&self) -> ProtocolResult<Duration> {
        self.inner.tick()
    }

    /// Execute a command as if it had arrived over the radio
    pub fn handle_command(&self, message: &Message) {
        self.inner.handle_command(message);
    }

    pub fn send_status(&self) -> ProtocolResult<Option<String>> {
        self.inner.send_status()
    }

    pub fn engine(&self) -> &LoRaEngine {
        &self.engine
    }

    /// Feed an NMEA line straight into the GPS receiver
    pub fn process_gps_line(&self, line: &str) {
        let gps = self.inner.gps.lock();
        gps.process_line(line);
        let _ = gps.evaluate_now();
    }

    pub fn config(&self) -> BeaconConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn battery_level(&self) -> f64 {
        self.inner.state.lock().battery
    }

    pub fn waypoints(&self) -> Vec<Waypoint> {
        self.inner.state.lock().waypoints.clone()
    }

    pub fn inside_geofence(&self) -> Option<bool> {
        self.inner.state.lock().inside_geofence
    }

    pub fn gps_state(&self) -> GpsState {
        self.inner.gps_state()
    }
}

impl Drop for BeaconController {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

fn run_loop(inner: &BeaconInner) {
    loop {
        let pause = match inner.tick() {
            Ok(pause) => pause,
            Err(e) => {
                error!(error = %e, "Error in beacon loop");
                LOOP_ERROR_BACKOFF
            }
        };
        if !sleep_while_running(&inner.running, pause) {
            break;
        }
    }
}
