//! GPS receiver worker
//!
//! A single reader thread pulls lines from an [`NmeaSource`], feeds them
//! through the parser into the shared [`GpsFix`] and periodically re-evaluates
//! fix validity. Consumers read snapshots through the accessors; the fix is
//! only ever touched while holding its lock.
//!
//! Validity is promoted only at the evaluation interval, to limit log churn,
//! but it is withdrawn as soon as a sentence makes the fix fail its
//! requirements, so `valid` never outlives the conditions behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{epoch_seconds, GeoPoint, GpsFix};
use crate::gps::fix::{evaluate_fix, FixRejection, FixRequirements};
use crate::gps::nmea::{NmeaParser, ParserStats};
use crate::gps::source::NmeaSource;
use crate::utils::config::GpsConfig;

/// Pause after a failed read before trying the source again
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum GpsError {
    #[error("GPS receiver already running")]
    AlreadyRunning,
    #[error("GPS reader did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("Failed to spawn GPS reader: {0}")]
    Spawn(#[from] std::io::Error),
}

struct GpsShared {
    fix: Mutex<GpsFix>,
    requirements: Mutex<FixRequirements>,
    parser: Mutex<NmeaParser>,
    running: AtomicBool,
}

struct ReaderHandle {
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct GpsReceiver {
    config: GpsConfig,
    shared: Arc<GpsShared>,
    reader: Option<ReaderHandle>,
}

impl GpsReceiver {
    pub fn new(config: GpsConfig) -> Self {
        let requirements = FixRequirements::from(&config);
        Self {
            config,
            shared: Arc::new(GpsShared {
                fix: Mutex::new(GpsFix::default()),
                requirements: Mutex::new(requirements),
                parser: Mutex::new(NmeaParser::new()),
                running: AtomicBool::new(false),
            }),
            reader: None,
        }
    }

    /// Spawn the reader thread over `source`
    pub fn start(&mut self, mut source: Box<dyn NmeaSource>) -> Result<(), GpsError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(GpsError::AlreadyRunning);
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let (done_tx, done_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("gps-reader".to_string())
            .spawn(move || {
                info!("GPS reading thread started");
                read_loop(&shared, source.as_mut(), &config);
                info!("GPS reading thread stopped");
                let _ = done_tx.send(());
            });

        match handle {
            Ok(handle) => {
                self.reader = Some(ReaderHandle {
                    done: done_rx,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(GpsError::Spawn(e))
            }
        }
    }

    /// Signal the reader to stop and wait up to the shutdown grace period
    pub fn stop(&mut self) -> Result<(), GpsError> {
        self.shared.running.store(false, Ordering::SeqCst);
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };

        let grace = self.config.shutdown_grace();
        match reader.done.recv_timeout(grace) {
            Ok(()) => {
                let _ = reader.handle.join();
                Ok(())
            }
            Err(_) => {
                // A blocked device read; the thread is left detached
                warn!(?grace, "GPS reader did not stop in time");
                Err(GpsError::ShutdownTimeout(grace))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Feed one line directly, bypassing the reader thread
    pub fn process_line(&self, line: &str) {
        process_line(&self.shared, line);
    }

    /// Re-evaluate validity now and record the verdict on the fix
    pub fn evaluate_now(&self) -> Result<(), FixRejection> {
        evaluate_and_record(&self.shared)
    }

    pub fn set_requirements(&self, requirements: FixRequirements) {
        *self.shared.requirements.lock() = requirements;
        info!(
            min_satellites = requirements.min_satellites,
            max_hdop = requirements.max_hdop,
            require_3d = requirements.require_3d,
            "GPS fix requirements updated"
        );
        let _ = evaluate_and_record(&self.shared);
    }

    pub fn requirements(&self) -> FixRequirements {
        *self.shared.requirements.lock()
    }

    /// Live check against the current requirements
    pub fn has_fix(&self) -> bool {
        self.fix_status().is_ok()
    }

    /// Live check, with the reason when there is no usable fix
    pub fn fix_status(&self) -> Result<(), FixRejection> {
        let requirements = *self.shared.requirements.lock();
        let fix = self.shared.fix.lock();
        evaluate_fix(&fix, &requirements)
    }

    /// Block the calling thread until a fix is available or `timeout` passes
    pub fn wait_for_fix(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_fix() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.config.fix_poll_interval().min(deadline - now));
        }
    }

    pub fn position(&self) -> Option<GeoPoint> {
        self.shared.fix.lock().position()
    }

    pub fn altitude(&self) -> Option<f64> {
        self.shared.fix.lock().altitude
    }

    /// Ground speed (km/h)
    pub fn speed(&self) -> Option<f64> {
        self.shared.fix.lock().speed_kmh
    }

    pub fn course(&self) -> Option<f64> {
        self.shared.fix.lock().course_deg
    }

    pub fn satellites(&self) -> u32 {
        self.shared.fix.lock().satellites
    }

    pub fn fix_quality(&self) -> u8 {
        self.shared.fix.lock().fix_quality
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        self.shared.fix.lock().datetime()
    }

    /// Copy of the complete fix state
    pub fn snapshot(&self) -> GpsFix {
        self.shared.fix.lock().clone()
    }

    /// Snapshot only while the fix meets the requirements
    pub fn location(&self) -> Option<GpsFix> {
        let requirements = *self.shared.requirements.lock();
        let fix = self.shared.fix.lock();
        evaluate_fix(&fix, &requirements).ok().map(|_| fix.clone())
    }

    pub fn parser_stats(&self) -> ParserStats {
        self.shared.parser.lock().stats()
    }
}

impl Drop for GpsReceiver {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

fn process_line(shared: &GpsShared, line: &str) {
    let requirements = *shared.requirements.lock();
    let mut fix = shared.fix.lock();
    let result = shared.parser.lock().process_line(line, &mut fix);
    match result {
        Ok(Some(kind)) => {
            if fix.valid {
                if let Err(reason) = evaluate_fix(&fix, &requirements) {
                    fix.valid = false;
                    fix.last_update = epoch_seconds();
                    info!(%reason, sentence = kind, "GPS fix lost");
                }
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "Discarding NMEA sentence"),
    }
}

fn evaluate_and_record(shared: &GpsShared) -> Result<(), FixRejection> {
    let requirements = *shared.requirements.lock();
    let mut fix = shared.fix.lock();
    let verdict = evaluate_fix(&fix, &requirements);
    let was_valid = fix.valid;
    fix.valid = verdict.is_ok();
    fix.last_update = epoch_seconds();

    match (&verdict, was_valid) {
        (Ok(()), false) => info!(
            lat = fix.latitude.unwrap_or_default(),
            lon = fix.longitude.unwrap_or_default(),
            satellites = fix.satellites,
            hdop = fix.hdop,
            "GPS fix acquired"
        ),
        (Err(reason), true) => info!(%reason, "GPS fix lost"),
        (Err(reason), false) => debug!(%reason, "No valid GPS fix"),
        (Ok(()), true) => {}
    }
    verdict
}

fn read_loop(shared: &GpsShared, source: &mut dyn NmeaSource, config: &GpsConfig) {
    let evaluation_interval = config.evaluation_interval();
    let mut last_evaluation = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        match source.read_line() {
            Ok(Some(line)) => process_line(shared, &line),
            Ok(None) => thread::sleep(config.read_idle()),
            Err(e) => {
                warn!(error = %e, "GPS read failed");
                thread::sleep(READ_ERROR_BACKOFF);
            }
        }

        if last_evaluation.elapsed() >= evaluation_interval {
            let _ = evaluate_and_record(shared);
            last_evaluation = Instant::now();
        }
    }
}
