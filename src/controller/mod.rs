//! Beacon and tracker application controllers
//!
//! Each controller owns one main-loop thread on top of the protocol engine
//! and GPS receiver workers. Loops observe a shared stop flag and are joined
//! with a bounded grace period.

pub mod beacon;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use thiserror::Error;
use tracing::{error, info};

use crate::gps::GpsError;
use crate::protocol::ProtocolError;
use crate::utils::config::ConfigError;

pub use beacon::{BatteryMonitor, BeaconController, Command, SimulatedBattery, Waypoint};
pub use tracker::{BeaconFix, TrackerController};

/// How long `stop()` waits for a controller loop
pub const CONTROLLER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Longest single sleep inside a controller loop
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller already running")]
    AlreadyRunning,
    #[error("No radio available outside simulation mode")]
    MissingRadio,
    #[error("Controller loop {name} did not stop within {grace:?}")]
    ShutdownTimeout { name: String, grace: Duration },
    #[error("Failed to spawn controller loop: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Gps(#[from] GpsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Sleep up to `duration` in short slices; false once `running` clears
pub(crate) fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// A named loop thread that reports completion on a channel
pub(crate) struct LoopWorker {
    name: &'static str,
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl LoopWorker {
    /// Spawn `body`, which must return once `running` is cleared
    pub(crate) fn spawn<F>(name: &'static str, running: Arc<AtomicBool>, body: F) -> ControllerResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        running.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = bounded(1);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            info!(name, "Controller loop started");
            body();
            info!(name, "Controller loop stopped");
            let _ = done_tx.send(());
        });

        match spawned {
            Ok(handle) => Ok(Self {
                name,
                running,
                done: done_rx,
                handle,
            }),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                Err(ControllerError::Spawn(e))
            }
        }
    }

    pub(crate) fn stop(self, grace: Duration) -> ControllerResult<()> {
        self.running.store(false, Ordering::SeqCst);
        match self.done.recv_timeout(grace) {
            Ok(()) => {
                let _ = self.handle.join();
                Ok(())
            }
            Err(_) => {
                error!(name = self.name, ?grace, "Controller loop did not stop in time");
                Err(ControllerError::ShutdownTimeout {
                    name: self.name.to_string(),
                    grace,
                })
            }
        }
    }
}
