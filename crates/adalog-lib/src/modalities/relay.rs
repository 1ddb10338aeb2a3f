//! Physiological recorders whose data is written by an external backend.
//! The panel only tells the backend where to write and when.

use anyhow::Result;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::backend::{
    default_resolver, stream_choices, BackendLink, MetricCells, StreamResolver, NO_STREAMS,
};
use crate::bus::{BusClient, BusValue};
use crate::config::{PanelSettings, RelaySettings};
use crate::panel::{Availability, ModalityPanel, PanelStatus};

/// Delay between announcing the file and starting the backend recorder.
const START_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy)]
pub struct RelaySpec {
    pub kind: &'static str,
    pub control_addr: &'static str,
    pub listen_addr: &'static str,
    pub file_name: &'static str,
    pub metrics: &'static [&'static str],
    readout: fn(&MetricCells) -> String,
}

pub const EEG: RelaySpec = RelaySpec {
    kind: "Eeg",
    control_addr: "127.0.0.1:5005",
    listen_addr: "127.0.0.1:5008",
    file_name: "eeg.csv",
    metrics: &["/eeg_quality"],
    readout: eeg_readout,
};

pub const ECG: RelaySpec = RelaySpec {
    kind: "Ecg",
    control_addr: "127.0.0.1:9124",
    listen_addr: "127.0.0.1:9123",
    file_name: "ecg.csv",
    metrics: &["/ecg_raw", "/ecg_bpm"],
    readout: ecg_readout,
};

pub fn quality_label(value: Option<f64>) -> &'static str {
    match value.map(|v| v.round() as i64) {
        Some(0) => "Disconnected",
        Some(1) => "Bad Signal",
        Some(2) => "Good Signal",
        _ => "Unknown",
    }
}

fn eeg_readout(metrics: &MetricCells) -> String {
    format!("signal: {}", quality_label(metrics.get("/eeg_quality")))
}

fn ecg_readout(metrics: &MetricCells) -> String {
    let raw = metrics.get("/ecg_raw").unwrap_or(0.0).clamp(0.0, 1.0);
    match metrics.get("/ecg_bpm") {
        Some(bpm) => format!("raw: {:.0}%, BPM: {}", raw * 100.0, bpm as i64),
        None => format!("raw: {:.0}%, BPM: --", raw * 100.0),
    }
}

pub struct RelayPanel {
    spec: RelaySpec,
    link: BackendLink,
    resolver: Box<dyn StreamResolver>,
    stream: Option<String>,
    recording: bool,
    /// Bumped on every start and stop. A delayed start command is only sent
    /// while the generation it was issued under is still current.
    generation: Arc<Mutex<u64>>,
    target_file: Option<PathBuf>,
}

impl RelayPanel {
    pub fn new(spec: RelaySpec, settings: &RelaySettings) -> Self {
        let control = settings.control_addr.as_deref().unwrap_or(spec.control_addr);
        let listen = settings.listen_addr.as_deref().unwrap_or(spec.listen_addr);
        Self {
            spec,
            link: BackendLink::open(control, listen, spec.metrics),
            resolver: default_resolver(),
            stream: settings.stream.clone(),
            recording: false,
            generation: Arc::new(Mutex::new(0)),
            target_file: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn StreamResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn streams(&self) -> Vec<String> {
        stream_choices(self.resolver.as_ref())
    }

    /// Choose the input stream; forwarded right away when recording.
    pub fn select_stream(&mut self, label: &str) -> Result<()> {
        if label.trim().is_empty() || label.contains(NO_STREAMS) {
            self.stream = None;
            return Ok(());
        }
        self.stream = Some(label.to_string());
        if self.recording {
            self.link
                .send("/lsl_stream_selected", vec![BusValue::from(label)])?;
        }
        Ok(())
    }

    pub fn selected_stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn target_file(&self) -> Option<&Path> {
        self.target_file.as_deref()
    }

    pub fn metrics(&self) -> &MetricCells {
        self.link.metrics()
    }

    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.link.listen_addr()
    }
}

impl ModalityPanel for RelayPanel {
    fn kind(&self) -> &str {
        self.spec.kind
    }

    fn status(&self) -> PanelStatus {
        if let Some(problem) = self.link.problem() {
            PanelStatus::Degraded(problem.to_string())
        } else if self.recording {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if let Some(problem) = self.link.problem() {
            return Ok(Availability::Unavailable(problem.to_string()));
        }
        let Some(target) = self.link.control_target() else {
            return Ok(Availability::Unavailable("no backend connection".into()));
        };
        if self.recording {
            return Ok(Availability::Ready);
        }
        let path = dir.join(self.spec.file_name);
        self.link.send(
            "/recording_path",
            vec![BusValue::from(path.to_string_lossy().as_ref())],
        )?;
        if let Some(stream) = &self.stream {
            self.link
                .send("/lsl_stream_selected", vec![BusValue::from(stream.as_str())])?;
        }
        let issued = bump(&self.generation);
        self.recording = true;

        let generation = Arc::clone(&self.generation);
        let kind = self.spec.kind;
        thread::Builder::new()
            .name(format!("{}-start", kind.to_lowercase()))
            .spawn(move || {
                thread::sleep(START_DELAY);
                // Held across the send so a stop cannot slip in between.
                let current = generation.lock().unwrap_or_else(|p| p.into_inner());
                if *current != issued {
                    return;
                }
                let sent = BusClient::connect(&target).and_then(|client| {
                    client.send("/recording_start", vec![BusValue::Float(1.0)])
                });
                if let Err(err) = sent {
                    warn!("{} backend did not get the start command: {}", kind, err);
                }
            })?;
        info!("{} recording to {}", self.spec.kind, path.display());
        self.target_file = Some(path);
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;
        let mut current = self.generation.lock().unwrap_or_else(|p| p.into_inner());
        *current += 1;
        self.link.send("/recording_stop", vec![BusValue::Int(1)])?;
        drop(current);
        info!("{} recording stopped", self.spec.kind);
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        Some((self.spec.readout)(self.link.metrics()))
    }

    fn close(&mut self) {
        self.link.close();
    }
}

fn bump(generation: &Mutex<u64>) -> u64 {
    let mut current = generation.lock().unwrap_or_else(|p| p.into_inner());
    *current += 1;
    *current
}

pub(crate) fn build_eeg(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(RelayPanel::new(EEG, &settings.eeg)))
}

pub(crate) fn build_ecg(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(RelayPanel::new(ECG, &settings.ecg)))
}
