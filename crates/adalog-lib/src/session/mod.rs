//! Session lifecycle: directory layout, the Idle/Running state machine and
//! the fan-out of start/stop hooks to attached panels.

mod controller;
mod path;
mod ticker;

pub use controller::{
    FanOutReport, HookOutcome, LateAttach, PanelId, PanelInfo, SessionController, SessionState,
};
pub use path::SessionRequest;
pub use ticker::Ticker;
