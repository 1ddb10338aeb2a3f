//! Dream-incubation protocol driver. Starts and resets a closed-loop
//! stimulation process in the backend; records nothing itself.

use anyhow::Result;
use log::info;
use std::path::Path;

use super::backend::{default_resolver, stream_choices, BackendLink, StreamResolver, NO_STREAMS};
use crate::bus::BusValue;
use crate::config::{PanelSettings, RelaySettings};
use crate::panel::{Availability, ModalityPanel, PanelStatus};

pub const CONTROL_ADDR: &str = "127.0.0.1:5010";
pub const LISTEN_ADDR: &str = "127.0.0.1:5009";

const ALPHA_THETA: &str = "/alpha_theta_ratio";
const LZIV: &str = "/lziv_complexity";
const DURATION: &str = "/duration";

pub struct DreamIncubatorPanel {
    link: BackendLink,
    resolver: Box<dyn StreamResolver>,
    running: bool,
    cue_file: Option<String>,
}

impl DreamIncubatorPanel {
    pub fn new(settings: &RelaySettings) -> Self {
        let control = settings.control_addr.as_deref().unwrap_or(CONTROL_ADDR);
        let listen = settings.listen_addr.as_deref().unwrap_or(LISTEN_ADDR);
        let panel = Self {
            link: BackendLink::open(control, listen, &[ALPHA_THETA, LZIV, DURATION]),
            resolver: default_resolver(),
            running: false,
            cue_file: None,
        };
        if let Some(stream) = &settings.stream {
            let _ = panel.link.send("/lsl_stream_selected", vec![BusValue::from(stream.as_str())]);
        }
        panel
    }

    pub fn with_resolver(mut self, resolver: Box<dyn StreamResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn streams(&self) -> Vec<String> {
        stream_choices(self.resolver.as_ref())
    }

    pub fn select_stream(&self, label: &str) -> Result<()> {
        if label.trim().is_empty() || label.contains(NO_STREAMS) {
            return Ok(());
        }
        self.link
            .send("/lsl_stream_selected", vec![BusValue::from(label)])
    }

    /// Audio cue played by the backend during incubation.
    pub fn set_cue_file(&mut self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.link
            .send("/audio_file_path", vec![BusValue::from(path.as_str())])?;
        self.cue_file = Some(path);
        Ok(())
    }

    pub fn cue_file(&self) -> Option<&str> {
        self.cue_file.as_deref()
    }

    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.link.listen_addr()
    }
}

fn duration_label(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

impl ModalityPanel for DreamIncubatorPanel {
    fn kind(&self) -> &str {
        "DreamIncubator"
    }

    fn status(&self) -> PanelStatus {
        if let Some(problem) = self.link.problem() {
            PanelStatus::Degraded(problem.to_string())
        } else if self.running {
            PanelStatus::Running
        } else {
            PanelStatus::Idle
        }
    }

    fn start(&mut self) -> Result<Availability> {
        if let Some(problem) = self.link.problem() {
            return Ok(Availability::Unavailable(problem.to_string()));
        }
        if self.running {
            return Ok(Availability::Ready);
        }
        self.link.send("/start_incubation", vec![BusValue::Int(1)])?;
        self.running = true;
        info!("dream incubation started");
        Ok(Availability::Ready)
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.link.send("/reset_incubation", vec![BusValue::Int(1)])?;
        info!("dream incubation reset");
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        let metrics = self.link.metrics();
        let fmt = |v: Option<f64>| v.map_or_else(|| "N/A".to_string(), |v| format!("{:.2}", v));
        Some(format!(
            "alpha/theta: {}, LZiv: {}, duration: {}",
            fmt(metrics.get(ALPHA_THETA)),
            fmt(metrics.get(LZIV)),
            duration_label(metrics.get(DURATION).unwrap_or(0.0)),
        ))
    }

    fn close(&mut self) {
        self.link.close();
    }
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(DreamIncubatorPanel::new(&settings.incubator)))
}
