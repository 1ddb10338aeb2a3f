use anyhow::Result;
use crossbeam_channel::Receiver;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::path::SessionRequest;
use super::ticker::Ticker;
use crate::clock::{self, MonotonicStamper};
use crate::config::{AdalogConfig, PanelSettings};
use crate::error::{RegistryError, SessionError};
use crate::panel::{Availability, Capability, ModalityPanel, PanelStatus};
use crate::registry::PanelRegistry;
use crate::sink::sanitize_component;
use crate::tags::TagStore;

/// What happens to a recording panel attached while a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateAttach {
    /// Wait for the next session.
    Defer,
    /// Start it right away into the running session.
    #[default]
    JoinRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running { dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PanelId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Ok,
    Unavailable(String),
    Failed(String),
    /// Passive panel, no hook to call.
    Skipped,
}

/// Per-panel results of one start or stop fan-out.
#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub session_dir: Option<PathBuf>,
    pub outcomes: Vec<(String, HookOutcome)>,
}

impl FanOutReport {
    pub fn outcome(&self, title: &str) -> Option<&HookOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &(String, HookOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, HookOutcome::Failed(_)))
    }
}

#[derive(Debug, Clone)]
pub struct PanelInfo {
    pub id: PanelId,
    pub title: String,
    pub kind: String,
    pub capability: Capability,
    pub status: PanelStatus,
    pub readout: Option<String>,
}

struct AttachedPanel {
    id: PanelId,
    title: String,
    kind: String,
    capability: Capability,
    panel: Box<dyn ModalityPanel>,
    failure: Option<String>,
}

/// Owns the Idle/Running state machine and every attached panel.
pub struct SessionController {
    root: PathBuf,
    late_attach: LateAttach,
    tick_every: Duration,
    panels: Vec<AttachedPanel>,
    kind_counts: HashMap<String, usize>,
    next_id: u64,
    state: SessionState,
    started_at: Option<Instant>,
    ticker: Option<Ticker>,
    stamper: MonotonicStamper,
    tags: Arc<TagStore>,
    status_message: Option<String>,
}

impl SessionController {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            late_attach: LateAttach::default(),
            tick_every: Duration::from_secs(1),
            panels: Vec::new(),
            kind_counts: HashMap::new(),
            next_id: 1,
            state: SessionState::Idle,
            started_at: None,
            ticker: None,
            stamper: MonotonicStamper::default(),
            tags: Arc::new(TagStore::default()),
            status_message: None,
        }
    }

    pub fn from_config(config: &AdalogConfig) -> Self {
        let mut controller = Self::new(config.sessions_root.clone())
            .with_late_attach(config.late_attach)
            .with_tick_interval(Duration::from_millis(config.tick_ms.max(1)));
        controller.tags = Arc::new(TagStore::new(config.initial_tags.iter().cloned()));
        controller
    }

    pub fn with_late_attach(mut self, policy: LateAttach) -> Self {
        self.late_attach = policy;
        self
    }

    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_every = every;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running { .. })
    }

    pub fn session_dir(&self) -> Option<&Path> {
        match &self.state {
            SessionState::Running { dir } => Some(dir),
            SessionState::Idle => None,
        }
    }

    /// Last user-facing message (validation failures, directory errors).
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn tags(&self) -> &Arc<TagStore> {
        &self.tags
    }

    pub fn add_tag(&self, tag: &str) -> Result<bool> {
        self.tags.add(tag)
    }

    pub fn remove_tag(&self, tag: &str) -> Result<bool> {
        self.tags.remove(tag)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|started| started.elapsed())
    }

    pub fn elapsed_label(&self) -> String {
        clock::elapsed_label(self.elapsed().unwrap_or_default())
    }

    /// Elapsed-time heartbeat while a session runs.
    pub fn ticks(&self) -> Option<Receiver<Duration>> {
        self.ticker.as_ref().map(Ticker::ticks)
    }

    pub fn attach(
        &mut self,
        registry: &PanelRegistry,
        name: &str,
        settings: &PanelSettings,
    ) -> Result<PanelId, RegistryError> {
        let descriptor = registry
            .descriptor(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let capability = descriptor.capability;
        let panel = registry.instantiate(name, settings)?;
        Ok(self.attach_panel(name, capability, panel))
    }

    /// Attach an already built panel. `kind` drives the display title:
    /// `Kind`, then `Kind2`, `Kind3`, ...
    pub fn attach_panel(
        &mut self,
        kind: &str,
        capability: Capability,
        panel: Box<dyn ModalityPanel>,
    ) -> PanelId {
        let count = self.kind_counts.entry(kind.to_string()).or_insert(0);
        *count += 1;
        let title = if *count == 1 {
            kind.to_string()
        } else {
            format!("{}{}", kind, count)
        };
        let id = PanelId(self.next_id);
        self.next_id += 1;
        info!("attached panel {} ({})", title, capability);
        self.panels.push(AttachedPanel {
            id,
            title,
            kind: kind.to_string(),
            capability,
            panel,
            failure: None,
        });

        if let (SessionState::Running { dir }, LateAttach::JoinRunning) =
            (&self.state, self.late_attach)
        {
            let dir = dir.clone();
            if let Some(attached) = self.panels.last_mut() {
                let outcome = start_hook(attached, &dir);
                info!("late-attached {} joined session: {:?}", attached.title, outcome);
            }
        }
        id
    }

    /// Stop (if needed) and close a panel, releasing its I/O.
    pub fn detach(&mut self, id: PanelId) -> bool {
        let Some(idx) = self.panels.iter().position(|p| p.id == id) else {
            return false;
        };
        let mut attached = self.panels.remove(idx);
        if self.is_running() {
            let outcome = stop_hook(&mut attached);
            if let HookOutcome::Failed(reason) = outcome {
                warn!("{} failed to stop on detach: {}", attached.title, reason);
            }
        }
        let title = attached.title.clone();
        if let Err(reason) = guarded(|| {
            attached.panel.close();
            Ok(())
        }) {
            warn!("{} failed to close: {}", title, reason);
        }
        info!("detached panel {}", title);
        true
    }

    pub fn panels(&self) -> Vec<PanelInfo> {
        self.panels
            .iter()
            .map(|attached| PanelInfo {
                id: attached.id,
                title: attached.title.clone(),
                kind: attached.kind.clone(),
                capability: attached.capability,
                status: match &attached.failure {
                    Some(reason) => PanelStatus::Failed(reason.clone()),
                    None => attached.panel.status(),
                },
                readout: attached.panel.readout(),
            })
            .collect()
    }

    /// Idle -> Running. Validation and directory failures leave the
    /// controller Idle; panel failures are only reported.
    pub fn start(&mut self, request: &SessionRequest) -> Result<FanOutReport, SessionError> {
        if let SessionState::Running { dir } = &self.state {
            return Err(SessionError::AlreadyRunning(dir.clone()));
        }
        let stamp = self.stamper.next();
        let Some(dir) = request.session_dir(&self.root, stamp) else {
            self.status_message =
                Some("Please enter a User Name before starting the session.".into());
            return Err(SessionError::MissingUser);
        };
        if let Err(source) = fs::create_dir_all(&dir) {
            self.status_message = Some(format!(
                "Could not create session folder {}: {}",
                dir.display(),
                source
            ));
            return Err(SessionError::CreateDir { path: dir, source });
        }
        if let Err(err) = self.tags.open(&dir) {
            self.status_message = Some(format!("Could not write tag log: {:#}", err));
            return Err(SessionError::TagLog(err));
        }

        let started = Instant::now();
        self.state = SessionState::Running { dir: dir.clone() };
        self.started_at = Some(started);
        self.ticker = Some(Ticker::start(started, self.tick_every));
        self.status_message = None;
        info!("session started in {}", dir.display());

        let mut report = FanOutReport {
            session_dir: Some(dir.clone()),
            outcomes: Vec::with_capacity(self.panels.len()),
        };
        // ids first: the fan-out walks a snapshot of the attached set
        let ids: Vec<PanelId> = self.panels.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(attached) = self.panels.iter_mut().find(|p| p.id == id) {
                let outcome = start_hook(attached, &dir);
                report.outcomes.push((attached.title.clone(), outcome));
            }
        }
        Ok(report)
    }

    /// Running -> Idle. Files stay on disk.
    pub fn stop(&mut self) -> Result<FanOutReport, SessionError> {
        let dir = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Running { dir } => dir,
            SessionState::Idle => return Err(SessionError::NotRunning),
        };
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }

        let mut report = FanOutReport {
            session_dir: Some(dir.clone()),
            outcomes: Vec::with_capacity(self.panels.len()),
        };
        let ids: Vec<PanelId> = self.panels.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(attached) = self.panels.iter_mut().find(|p| p.id == id) {
                let outcome = stop_hook(attached);
                report.outcomes.push((attached.title.clone(), outcome));
            }
        }
        self.tags.close();
        if let Some(elapsed) = self.elapsed() {
            info!(
                "session in {} stopped after {}",
                dir.display(),
                clock::elapsed_label(elapsed)
            );
        }
        self.started_at = None;
        Ok(report)
    }

    pub fn toggle(&mut self, request: &SessionRequest) -> Result<FanOutReport, SessionError> {
        if self.is_running() {
            self.stop()
        } else {
            self.start(request)
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
        let ids: Vec<PanelId> = self.panels.iter().map(|p| p.id).collect();
        for id in ids {
            self.detach(id);
        }
    }
}

fn start_hook(attached: &mut AttachedPanel, session_dir: &Path) -> HookOutcome {
    let result = match attached.capability {
        Capability::Passive => return HookOutcome::Skipped,
        Capability::RecordsToFile => {
            let panel_dir = session_dir.join(sanitize_component(&attached.title));
            let panel = &mut attached.panel;
            guarded(|| {
                fs::create_dir_all(&panel_dir)?;
                panel.start_recording(&panel_dir)
            })
        }
        Capability::DrivesProcess => {
            let panel = &mut attached.panel;
            guarded(|| panel.start())
        }
    };
    match result {
        Ok(Availability::Ready) => {
            attached.failure = None;
            HookOutcome::Ok
        }
        Ok(Availability::Unavailable(reason)) => {
            attached.failure = None;
            warn!("{} has nothing to record: {}", attached.title, reason);
            HookOutcome::Unavailable(reason)
        }
        Err(reason) => {
            warn!("{} failed to start: {}", attached.title, reason);
            attached.failure = Some(reason.clone());
            HookOutcome::Failed(reason)
        }
    }
}

fn stop_hook(attached: &mut AttachedPanel) -> HookOutcome {
    let panel = &mut attached.panel;
    let result = match attached.capability {
        Capability::Passive => return HookOutcome::Skipped,
        Capability::RecordsToFile => guarded(|| panel.stop_recording()),
        Capability::DrivesProcess => guarded(|| panel.stop()),
    };
    match result {
        Ok(()) => HookOutcome::Ok,
        Err(reason) => {
            warn!("{} failed to stop: {}", attached.title, reason);
            attached.failure = Some(reason.clone());
            HookOutcome::Failed(reason)
        }
    }
}

/// Run one panel hook, turning both errors and panics into a message.
fn guarded<T>(hook: impl FnOnce() -> Result<T>) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Quiet;

    impl ModalityPanel for Quiet {
        fn kind(&self) -> &str {
            "Quiet"
        }

        fn status(&self) -> PanelStatus {
            PanelStatus::Idle
        }
    }

    #[test]
    fn titles_count_per_kind() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(dir.path());
        controller.attach_panel("Audio", Capability::RecordsToFile, Box::new(Quiet));
        let second = controller.attach_panel("Audio", Capability::RecordsToFile, Box::new(Quiet));
        controller.attach_panel("Text", Capability::RecordsToFile, Box::new(Quiet));
        controller.detach(second);
        controller.attach_panel("Audio", Capability::RecordsToFile, Box::new(Quiet));
        let titles: Vec<String> = controller.panels().into_iter().map(|p| p.title).collect();
        assert_eq!(titles, vec!["Audio", "Text", "Audio3"]);
    }

    #[test]
    fn stop_while_idle_is_rejected() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(dir.path());
        assert!(matches!(controller.stop(), Err(SessionError::NotRunning)));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = guarded::<()>(|| panic!("device exploded")).unwrap_err();
        assert_eq!(err, "panicked: device exploded");
        let err = guarded::<()>(|| Err(anyhow::anyhow!("plain"))).unwrap_err();
        assert_eq!(err, "plain");
    }

    #[test]
    fn elapsed_resets_after_stop() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(dir.path());
        controller.start(&SessionRequest::for_user("amy")).unwrap();
        assert!(controller.elapsed().is_some());
        assert!(controller.ticks().is_some());
        controller.stop().unwrap();
        assert!(controller.elapsed().is_none());
        assert!(controller.ticks().is_none());
        assert_eq!(controller.elapsed_label(), "00:00");
    }
}
