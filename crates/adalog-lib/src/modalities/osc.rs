//! Catch-all message recorder.
//!
//! Every message arriving on the listen address is appended to `osc.csv`
//! while a session records. Messages addressed `/<store_prefix>/<name>` are
//! not logged as rows; their payload is written to `<name>.txt` in the panel
//! directory instead.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::bus::{BusListener, BusMessage, BusValue};
use crate::clock;
use crate::config::{OscSettings, PanelSettings};
use crate::panel::{Availability, ModalityPanel, PanelStatus};
use crate::sink::{sanitize_component, CsvSink, RecordingSink};

pub const OSC_FILE: &str = "osc.csv";
const RECENT_WINDOW: Duration = Duration::from_secs(60);

struct OscState {
    store_prefix: String,
    session_dir: Option<PathBuf>,
    sink: Option<CsvSink>,
    recent: HashMap<String, Instant>,
    received: u64,
}

impl OscState {
    fn handle(&mut self, msg: &BusMessage) -> Result<()> {
        if let Some(rest) = self.store_suffix(&msg.address) {
            return self.store(&msg.address, rest, &msg.args);
        }
        self.received += 1;
        self.recent.insert(msg.address.clone(), Instant::now());
        if let Some(sink) = self.sink.as_mut() {
            sink.append([
                clock::iso_now(),
                msg.address.clone(),
                row_value(&msg.args),
            ])?;
        }
        Ok(())
    }

    fn store_suffix<'a>(&self, address: &'a str) -> Option<&'a str> {
        let prefix = self.store_prefix.trim();
        if prefix.is_empty() {
            return None;
        }
        address.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')
    }

    fn store(&self, address: &str, name: &str, args: &[BusValue]) -> Result<()> {
        let Some(dir) = &self.session_dir else {
            warn!("dropping {}: no active session", address);
            return Ok(());
        };
        if name.is_empty() {
            warn!("dropping {}: no file name", address);
            return Ok(());
        }
        let mut file_name = sanitize_component(name);
        if !file_name.ends_with(".txt") {
            file_name.push_str(".txt");
        }
        let path = dir.join(&file_name);
        fs::write(&path, store_content(args))
            .with_context(|| format!("writing {}", path.display()))?;
        info!("stored {} to {}", address, file_name);
        Ok(())
    }
}

fn row_value(args: &[BusValue]) -> String {
    match args {
        [] => String::new(),
        [single] => single.to_string(),
        many => {
            let items: Vec<String> = many
                .iter()
                .map(|v| match v {
                    BusValue::Str(s) => format!("'{}'", s),
                    other => other.to_string(),
                })
                .collect();
            format!("[{}]", items.join(", "))
        }
    }
}

fn store_content(args: &[BusValue]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct OscPanel {
    state: Arc<Mutex<OscState>>,
    listener: Option<BusListener>,
    bind_error: Option<String>,
}

impl OscPanel {
    /// Binds the listener right away; a failed bind leaves the panel
    /// degraded rather than failing construction.
    pub fn new(settings: &OscSettings) -> Self {
        let state = Arc::new(Mutex::new(OscState {
            store_prefix: settings.store_prefix.clone(),
            session_dir: None,
            sink: None,
            recent: HashMap::new(),
            received: 0,
        }));
        let handler_state = Arc::clone(&state);
        let (listener, bind_error) = match BusListener::bind(&settings.listen_addr, move |msg| {
            let mut state = handler_state.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(err) = state.handle(&msg) {
                warn!("failed to record {}: {:#}", msg.address, err);
            }
        }) {
            Ok(listener) => {
                info!("listening for messages on {}", listener.local_addr());
                (Some(listener), None)
            }
            Err(err) => {
                warn!("message recorder unavailable: {}", err);
                (None, Some(err.to_string()))
            }
        };
        Self {
            state,
            listener,
            bind_error,
        }
    }

    fn state(&self) -> MutexGuard<'_, OscState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(BusListener::local_addr)
    }

    /// Record one message as if it had arrived on the socket.
    pub fn handle_message(&self, msg: &BusMessage) -> Result<()> {
        debug!("message {}", msg.address);
        self.state().handle(msg)
    }

    pub fn set_store_prefix(&self, prefix: &str) {
        self.state().store_prefix = prefix.trim().to_string();
    }

    /// Addresses seen within the last minute, most recent first.
    pub fn recent_addresses(&self) -> Vec<String> {
        let mut state = self.state();
        let now = Instant::now();
        state
            .recent
            .retain(|_, seen| now.duration_since(*seen) <= RECENT_WINDOW);
        let mut recent: Vec<(String, Instant)> =
            state.recent.iter().map(|(a, t)| (a.clone(), *t)).collect();
        recent.sort_by(|a, b| b.1.cmp(&a.1));
        recent.into_iter().map(|(address, _)| address).collect()
    }

    pub fn received(&self) -> u64 {
        self.state().received
    }
}

impl ModalityPanel for OscPanel {
    fn kind(&self) -> &str {
        "Osc"
    }

    fn status(&self) -> PanelStatus {
        if let Some(reason) = &self.bind_error {
            return PanelStatus::Degraded(reason.clone());
        }
        if self.listener.is_none() {
            return PanelStatus::Closed;
        }
        if self.state().sink.is_some() {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if let Some(reason) = &self.bind_error {
            return Ok(Availability::Unavailable(reason.clone()));
        }
        let mut state = self.state();
        if state.sink.is_none() {
            state.sink = Some(CsvSink::open(
                &dir.join(OSC_FILE),
                &["timestamp", "address", "value"],
            )?);
        }
        state.session_dir = Some(dir.to_path_buf());
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        let mut state = self.state();
        state.session_dir = None;
        if let Some(mut sink) = state.sink.take() {
            sink.close()?;
        }
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        Some(format!("messages received: {}", self.received()))
    }

    fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
    }
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(OscPanel::new(&settings.osc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusClient;
    use csv::ReaderBuilder;
    use tempfile::tempdir;

    fn local() -> OscPanel {
        OscPanel::new(&OscSettings {
            listen_addr: "127.0.0.1:0".into(),
            ..OscSettings::default()
        })
    }

    fn rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = ReaderBuilder::new().from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn value_formatting() {
        assert_eq!(row_value(&[]), "");
        assert_eq!(row_value(&[BusValue::Float(0.5)]), "0.5");
        assert_eq!(
            row_value(&[BusValue::Int(1), BusValue::from("b")]),
            "[1, 'b']"
        );
        assert_eq!(
            store_content(&[BusValue::from("line one"), BusValue::Int(2)]),
            "line one\n2"
        );
    }

    #[test]
    fn store_messages_write_text_files_not_rows() {
        let dir = tempdir().unwrap();
        let mut panel = local();
        panel.start_recording(dir.path()).unwrap();
        panel
            .handle_message(&BusMessage::new("/_store/myfile", vec!["hello".into()]))
            .unwrap();
        panel
            .handle_message(&BusMessage::new("/_store/a/b.txt", vec![]))
            .unwrap();
        panel
            .handle_message(&BusMessage::new("/marker", vec![BusValue::Int(3)]))
            .unwrap();
        panel.stop_recording().unwrap();

        let stored = fs::read_to_string(dir.path().join("myfile.txt")).unwrap();
        assert_eq!(stored, "hello");
        assert!(dir.path().join("a_b.txt").exists());
        let rows = rows(&dir.path().join(OSC_FILE));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], "/marker");
        assert_eq!(rows[0][2], "3");
    }

    #[test]
    fn store_without_session_is_dropped() {
        let panel = local();
        panel
            .handle_message(&BusMessage::new("/_store/late", vec!["x".into()]))
            .unwrap();
        assert_eq!(panel.received(), 0);
    }

    #[test]
    fn messages_arrive_over_the_socket() {
        let dir = tempdir().unwrap();
        let mut panel = local();
        let addr = panel.local_addr().unwrap();
        panel.start_recording(dir.path()).unwrap();

        let client = BusClient::connect(&addr.to_string()).unwrap();
        client.send("/eyes_closed", vec![BusValue::Int(1)]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while panel.received() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        panel.stop_recording().unwrap();
        panel.close();

        assert_eq!(panel.recent_addresses(), vec!["/eyes_closed".to_string()]);
        assert_eq!(rows(&dir.path().join(OSC_FILE)).len(), 1);
        assert_eq!(panel.status(), PanelStatus::Closed);
    }

    #[test]
    fn bind_failure_degrades() {
        let first = local();
        let taken = first.local_addr().unwrap().to_string();
        let mut second = OscPanel::new(&OscSettings {
            listen_addr: taken,
            ..OscSettings::default()
        });
        assert!(matches!(second.status(), PanelStatus::Degraded(_)));
        let dir = tempdir().unwrap();
        assert!(matches!(
            second.start_recording(dir.path()).unwrap(),
            Availability::Unavailable(_)
        ));
    }
}
