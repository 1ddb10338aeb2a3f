//! Session coordination for multimodal experiment recording.
//!
//! A [`SessionController`] owns any number of [`ModalityPanel`]s and starts
//! and stops them together. Each session gets a timestamped directory with
//! one subdirectory per panel and a shared `tags.csv`.

pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod inspect;
pub mod modalities;
pub mod panel;
pub mod registry;
pub mod session;
pub mod sink;
pub mod tags;

pub use config::{AdalogConfig, PanelSettings};
pub use error::{BusError, RegistryError, SessionError};
pub use panel::{Availability, Capability, ModalityPanel, PanelStatus};
pub use registry::{PanelDescriptor, PanelRegistry};
pub use session::{
    FanOutReport, HookOutcome, LateAttach, PanelId, PanelInfo, SessionController, SessionRequest,
    SessionState,
};
pub use tags::TagStore;
