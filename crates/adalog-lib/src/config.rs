use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::LateAttach;

/// Host configuration, read from TOML. Every field has a default so an empty
/// file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdalogConfig {
    pub sessions_root: PathBuf,
    pub late_attach: LateAttach,
    pub stop_timeout_ms: u64,
    pub tick_ms: u64,
    pub initial_tags: Vec<String>,
    #[serde(flatten)]
    pub panels: PanelSettings,
}

impl Default for AdalogConfig {
    fn default() -> Self {
        Self {
            sessions_root: PathBuf::from("sessions"),
            late_attach: LateAttach::default(),
            stop_timeout_ms: 2000,
            tick_ms: 1000,
            initial_tags: Vec::new(),
            panels: PanelSettings::default(),
        }
    }
}

impl AdalogConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Panel tables with the host-wide stop timeout applied.
    pub fn panel_settings(&self) -> PanelSettings {
        PanelSettings {
            stop_timeout_ms: Some(self.stop_timeout_ms),
            ..self.panels.clone()
        }
    }
}

/// Per-panel tables (`[osc]`, `[eeg]`, ...) handed to panel constructors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PanelSettings {
    pub osc: OscSettings,
    pub eeg: RelaySettings,
    pub ecg: RelaySettings,
    pub incubator: RelaySettings,
    pub audio: AudioSettings,
    pub meteo: MeteoSettings,
    pub midi: MidiSettings,
    pub drawing: DrawingSettings,
    /// Upper bound for joining a panel's writer thread on stop.
    #[serde(skip)]
    pub stop_timeout_ms: Option<u64>,
}

impl PanelSettings {
    pub fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stop_timeout_ms.unwrap_or(2000))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OscSettings {
    pub listen_addr: String,
    pub store_prefix: String,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".into(),
            store_prefix: "_store".into(),
        }
    }
}

/// Addresses of an external processing backend. Unset fields fall back to the
/// defaults of the panel kind using them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub control_addr: Option<String>,
    pub listen_addr: Option<String>,
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub block_size: usize,
    pub queue_depth: usize,
    /// `default` for the host's default input, `external` when the host
    /// pushes samples itself, `synthetic` for generated noise, otherwise the
    /// name of an input device.
    pub device: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            queue_depth: 256,
            device: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeteoSettings {
    pub poll_secs: u64,
    pub timeout_secs: u64,
    pub mag_url: String,
    pub plasma_url: String,
    /// Disable the background poller (offline runs and tests).
    pub enabled: bool,
}

impl Default for MeteoSettings {
    fn default() -> Self {
        Self {
            poll_secs: 10,
            timeout_secs: 10,
            mag_url: "https://services.swpc.noaa.gov/products/solar-wind/mag-1-day.json".into(),
            plasma_url: "https://services.swpc.noaa.gov/products/solar-wind/plasma-1-day.json"
                .into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    pub port: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrawingSettings {
    pub width: u32,
    pub height: u32,
    pub pen_width: u32,
}

impl Default for DrawingSettings {
    fn default() -> Self {
        Self {
            width: 300,
            height: 200,
            pen_width: 2,
        }
    }
}
