//! MIDI input capture.
//!
//! A panel-owned thread appends one `midi.csv` row per channel message
//! while a session records, and on stop writes the same messages to a
//! single-track `midi_<stamp>.mid` at 120 BPM. Real-time and system
//! messages are dropped.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select, unbounded, Sender};
use log::{debug, info, warn};
use midir::{Ignore, MidiInput, MidiInputConnection};
use midly::live::LiveEvent;
use midly::num::{u15, u24, u28};
use midly::{Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::worker::Worker;
use crate::clock::{self, MonotonicStamper};
use crate::config::{MidiSettings, PanelSettings};
use crate::panel::{Availability, LastValue, ModalityPanel, PanelStatus};
use crate::sink::{CsvSink, RecordingSink};

pub const MIDI_FILE: &str = "midi.csv";
const HEADER: [&str; 5] = ["timestamp", "elapsed_s", "status", "data1", "data2"];

pub const TICKS_PER_BEAT: u16 = 480;
/// Microseconds per beat at 120 BPM.
pub const TEMPO_US: u32 = 500_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub status: u8,
    pub data: Vec<u8>,
}

impl MidiEvent {
    pub fn new(status: u8, data: &[u8]) -> Self {
        Self {
            status,
            data: data.to_vec(),
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.status >= 0xF8
    }

    /// Channel voice messages.
    pub fn is_storable(&self) -> bool {
        (0x80..=0xEF).contains(&self.status)
    }

    fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 1);
        bytes.push(self.status);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn csv_record(&self, elapsed: Duration) -> [String; 5] {
        let data = |i: usize| self.data.get(i).map(u8::to_string).unwrap_or_default();
        [
            clock::iso_now(),
            format!("{:.6}", elapsed.as_secs_f64()),
            self.status.to_string(),
            data(0),
            data(1),
        ]
    }
}

/// Source of MIDI input ports.
pub trait MidiBackend: Send {
    fn ports(&self) -> Vec<String>;
    /// Start delivering events from `port`.
    fn connect(&mut self, port: &str, events: Sender<MidiEvent>) -> Result<()>;
    /// Stop delivering events. No-op when not connected.
    fn disconnect(&mut self);
}

/// Backend for builds without MIDI input support.
pub struct NoMidi;

impl MidiBackend for NoMidi {
    fn ports(&self) -> Vec<String> {
        Vec::new()
    }

    fn connect(&mut self, port: &str, _: Sender<MidiEvent>) -> Result<()> {
        anyhow::bail!("MIDI input '{}' is not available", port)
    }

    fn disconnect(&mut self) {}
}

/// System MIDI inputs through midir.
#[derive(Default)]
pub struct MidirBackend {
    connection: Option<MidiInputConnection<()>>,
}

impl MidiBackend for MidirBackend {
    fn ports(&self) -> Vec<String> {
        let input = match MidiInput::new("adalog-ports") {
            Ok(input) => input,
            Err(err) => {
                debug!("MIDI input unavailable: {}", err);
                return Vec::new();
            }
        };
        input
            .ports()
            .iter()
            .filter_map(|port| input.port_name(port).ok())
            .collect()
    }

    fn connect(&mut self, port: &str, events: Sender<MidiEvent>) -> Result<()> {
        self.disconnect();
        let mut input = MidiInput::new("adalog-capture").context("opening MIDI input")?;
        input.ignore(Ignore::None);
        let found = input
            .ports()
            .into_iter()
            .find(|p| input.port_name(p).ok().as_deref() == Some(port))
            .ok_or_else(|| anyhow!("MIDI port '{}' not found", port))?;
        let connection = input
            .connect(
                &found,
                "adalog-midi",
                move |_, message, _| {
                    if let Some((&status, data)) = message.split_first() {
                        let _ = events.send(MidiEvent::new(status, data));
                    }
                },
                (),
            )
            .map_err(|err| anyhow!("connecting to MIDI port '{}': {}", port, err))?;
        self.connection = Some(connection);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

/// In-process port fed through [`VirtualPort`] handles.
pub struct VirtualMidi {
    name: String,
    target: Arc<Mutex<Option<Sender<MidiEvent>>>>,
}

/// Sending side of a [`VirtualMidi`] port.
#[derive(Clone)]
pub struct VirtualPort {
    target: Arc<Mutex<Option<Sender<MidiEvent>>>>,
}

impl VirtualMidi {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Arc::new(Mutex::new(None)),
        }
    }

    pub fn port(&self) -> VirtualPort {
        VirtualPort {
            target: Arc::clone(&self.target),
        }
    }
}

impl VirtualPort {
    /// Returns whether anyone was listening.
    pub fn send(&self, event: MidiEvent) -> bool {
        let target = self.target.lock().unwrap_or_else(|p| p.into_inner());
        match target.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl MidiBackend for VirtualMidi {
    fn ports(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn connect(&mut self, port: &str, events: Sender<MidiEvent>) -> Result<()> {
        anyhow::ensure!(port == self.name, "unknown MIDI port '{}'", port);
        *self.target.lock().unwrap_or_else(|p| p.into_inner()) = Some(events);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.target.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

struct Capture {
    stop_tx: Sender<()>,
    worker: Worker,
}

pub struct MidiPanel {
    backend: Box<dyn MidiBackend>,
    port: Option<String>,
    capture: Option<Capture>,
    events_seen: LastValue<u64>,
    stop_timeout: Duration,
    last_written: Option<u64>,
    stamper: MonotonicStamper,
    smf_file: Option<PathBuf>,
}

impl MidiPanel {
    pub fn new(
        settings: &MidiSettings,
        backend: Box<dyn MidiBackend>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            port: settings.port.clone(),
            capture: None,
            events_seen: LastValue::new(0),
            stop_timeout,
            last_written: None,
            stamper: MonotonicStamper::default(),
            smf_file: None,
        }
    }

    /// The `.mid` file of the current (or last) recording.
    pub fn smf_file(&self) -> Option<&Path> {
        self.smf_file.as_deref()
    }

    pub fn ports(&self) -> Vec<String> {
        self.backend.ports()
    }

    pub fn select_port(&mut self, port: &str) {
        self.port = Some(port.to_string());
    }

    /// Incoming events of the current (or last) recording, storable or not.
    pub fn events_seen(&self) -> u64 {
        self.events_seen.get()
    }

    /// Rows written by the last completed recording.
    pub fn last_written(&self) -> Option<u64> {
        self.last_written
    }

    fn chosen_port(&self) -> Option<String> {
        self.port
            .clone()
            .or_else(|| self.backend.ports().into_iter().next())
    }
}

impl ModalityPanel for MidiPanel {
    fn kind(&self) -> &str {
        "Midi"
    }

    fn status(&self) -> PanelStatus {
        if self.capture.is_some() {
            PanelStatus::Recording
        } else if self.backend.ports().is_empty() {
            PanelStatus::Degraded("no MIDI input ports".into())
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if self.capture.is_some() {
            return Ok(Availability::Ready);
        }
        let Some(port) = self.chosen_port() else {
            warn!("no MIDI input device selected");
            return Ok(Availability::Unavailable("No MIDI input device selected.".into()));
        };
        let (event_tx, event_rx) = unbounded::<MidiEvent>();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        if let Err(err) = self.backend.connect(&port, event_tx) {
            warn!("MIDI input unavailable: {:#}", err);
            return Ok(Availability::Unavailable(err.to_string()));
        }
        let mut sink = match CsvSink::open(&dir.join(MIDI_FILE), &HEADER) {
            Ok(sink) => sink,
            Err(err) => {
                self.backend.disconnect();
                return Err(err);
            }
        };
        let smf_path = dir.join(format!(
            "midi_{}.mid",
            clock::file_stamp(self.stamper.next())
        ));

        self.events_seen.set(0);
        let seen = self.events_seen.clone();
        let smf_target = smf_path.clone();
        let worker = Worker::spawn("midi-capture", move || {
            let started = Instant::now();
            let mut count = 0u64;
            let mut kept: Vec<(Duration, MidiEvent)> = Vec::new();
            let mut keep = |event: MidiEvent, sink: &mut CsvSink| -> Result<()> {
                count += 1;
                seen.set(count);
                if event.is_storable() {
                    let elapsed = started.elapsed();
                    sink.append(event.csv_record(elapsed))?;
                    kept.push((elapsed, event));
                }
                Ok(())
            };
            loop {
                select! {
                    recv(event_rx) -> event => match event {
                        Ok(event) => keep(event, &mut sink)?,
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            }
            for event in event_rx.try_iter() {
                keep(event, &mut sink)?;
            }
            let rows = sink.rows() as u64;
            sink.close()?;
            write_smf(&smf_target, &kept)?;
            Ok(rows)
        })?;

        info!("MIDI capture from '{}' started", port);
        self.capture = Some(Capture { stop_tx, worker });
        self.smf_file = Some(smf_path);
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        let Some(capture) = self.capture.take() else {
            return Ok(());
        };
        self.backend.disconnect();
        let _ = capture.stop_tx.try_send(());
        if let Some(rows) = capture.worker.finish(self.stop_timeout)? {
            info!("MIDI capture stopped after {} events", rows);
            self.last_written = Some(rows);
        }
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        Some(format!("events: {}", self.events_seen()))
    }

    fn close(&mut self) {
        if let Err(err) = self.stop_recording() {
            warn!("closing MIDI capture: {:#}", err);
        }
    }
}

fn ticks(elapsed: Duration) -> u32 {
    let beats = elapsed.as_secs_f64() * 1_000_000.0 / f64::from(TEMPO_US);
    (beats * f64::from(TICKS_PER_BEAT)).round() as u32
}

/// Single-track file: tempo, the events with delta times, end of track.
fn write_smf(path: &Path, events: &[(Duration, MidiEvent)]) -> Result<()> {
    let mut track = vec![TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(TEMPO_US))),
    }];
    let mut previous = 0u32;
    for (elapsed, event) in events {
        let bytes = event.bytes();
        let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(&bytes) else {
            debug!("skipping malformed MIDI message {:02X?}", bytes);
            continue;
        };
        let at = ticks(*elapsed).max(previous);
        track.push(TrackEvent {
            delta: u28::new((at - previous).min(0x0FFF_FFFF)),
            kind: TrackEventKind::Midi { channel, message },
        });
        previous = at;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_BEAT)),
    ));
    smf.tracks.push(track);
    smf.save(path)
        .with_context(|| format!("writing {}", path.display()))
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(MidiPanel::new(
        &settings.midi,
        Box::new(MidirBackend::default()),
        settings.stop_timeout(),
    )))
}
