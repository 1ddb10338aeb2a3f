//! The contract between the session controller and recorder panels.

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// What a panel does when a session starts, declared once per panel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    /// Writes files into its session subdirectory (`start_recording`).
    RecordsToFile,
    /// Drives an external stimulus or process (`start`), writes nothing.
    DrivesProcess,
    /// Display only, ignored by the fan-out.
    Passive,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::RecordsToFile => "records",
            Capability::DrivesProcess => "drives process",
            Capability::Passive => "passive",
        };
        f.write_str(label)
    }
}

/// Result of a start hook. A missing device is not an error: the panel keeps
/// existing, records nothing and reports why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelStatus {
    Idle,
    Recording,
    Running,
    Degraded(String),
    Failed(String),
    Closed,
}

impl fmt::Display for PanelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelStatus::Idle => f.write_str("idle"),
            PanelStatus::Recording => f.write_str("recording"),
            PanelStatus::Running => f.write_str("running"),
            PanelStatus::Degraded(reason) => write!(f, "degraded: {}", reason),
            PanelStatus::Failed(reason) => write!(f, "failed: {}", reason),
            PanelStatus::Closed => f.write_str("closed"),
        }
    }
}

/// A recorder or controller for one modality.
///
/// Hooks run on the host thread and must return quickly; slow device work
/// belongs on a panel-owned thread. `stop_recording` and `stop` must be
/// idempotent and must not return before any sink opened by the matching
/// start hook is flushed and closed. Background I/O opened at construction
/// lives until [`ModalityPanel::close`], across any number of sessions.
pub trait ModalityPanel: Send {
    fn kind(&self) -> &str;

    fn status(&self) -> PanelStatus;

    fn start_recording(&mut self, _dir: &Path) -> Result<Availability> {
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<Availability> {
        Ok(Availability::Ready)
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Live values for display (level meters, signal quality, counters).
    fn readout(&self) -> Option<String> {
        None
    }

    /// Release background I/O. Called once when the panel is detached.
    fn close(&mut self) {}
}

/// Mutex-guarded scalar written by a background thread and polled by the
/// host at its own rate.
#[derive(Debug, Default)]
pub struct LastValue<T>(Arc<Mutex<T>>);

impl<T> Clone for LastValue<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> LastValue<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn set(&self, value: T) {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = value;
    }

    pub fn get(&self) -> T {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
