//! Built-in panels.

pub mod audio;
pub mod backend;
pub mod drawing;
pub mod incubator;
pub mod meteo;
pub mod midi;
pub mod osc;
pub mod relay;
pub mod text;
mod worker;

use anyhow::Result;

use crate::config::MeteoSettings;
use crate::panel::Capability;
use crate::registry::{PanelBuilder, PanelDescriptor};

fn http_client_probe() -> Result<()> {
    meteo::NoaaProvider::new(&MeteoSettings::default()).map(|_| ())
}

/// Descriptors for every panel shipped with the crate.
pub fn catalog() -> Vec<PanelDescriptor> {
    let records = |identifier: &'static str, build: PanelBuilder| PanelDescriptor {
        identifier,
        capability: Capability::RecordsToFile,
        probe: None,
        build,
    };
    vec![
        records("text", text::build),
        records("drawing", drawing::build),
        records("audio", audio::build),
        records("osc", osc::build),
        records("eeg", relay::build_eeg),
        records("ecg", relay::build_ecg),
        records("midi", midi::build),
        PanelDescriptor {
            probe: Some(http_client_probe),
            ..records("meteo", meteo::build)
        },
        PanelDescriptor {
            identifier: "dream_incubator",
            capability: Capability::DrivesProcess,
            probe: None,
            build: incubator::build,
        },
    ]
}
