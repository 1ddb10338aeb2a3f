//! Solar-wind and geomagnetic telemetry.
//!
//! A poller thread asks a [`SpaceWeatherProvider`] for the latest reading
//! for as long as the panel lives. A reading is taken only when its
//! `time_tag` is newer than the last one; it always refreshes the gauges
//! and is appended to `meteo.csv` while a session records.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::worker::Worker;
use crate::clock;
use crate::config::{MeteoSettings, PanelSettings};
use crate::panel::{Availability, ModalityPanel, PanelStatus};
use crate::sink::{CsvSink, RecordingSink};

pub const METEO_FILE: &str = "meteo.csv";

const HEADER: [&str; 9] = [
    "timestamp",
    "time_tag",
    "Bx_GSM_nT",
    "By_GSM_nT",
    "Bz_GSM_nT",
    "Mag_Field_Total_nT",
    "Proton_Density_per_cm3",
    "Solar_Wind_Speed_kmps",
    "Plasma_Temperature_K",
];

/// One merged magnetometer + plasma reading.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolarWind {
    pub time_tag: String,
    pub bx_gsm: Option<f64>,
    pub by_gsm: Option<f64>,
    pub bz_gsm: Option<f64>,
    pub bt: Option<f64>,
    pub density: Option<f64>,
    pub speed: Option<f64>,
    pub temperature: Option<f64>,
}

impl SolarWind {
    fn csv_record(&self, timestamp: String) -> Vec<String> {
        let cell = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        vec![
            timestamp,
            self.time_tag.clone(),
            cell(self.bx_gsm),
            cell(self.by_gsm),
            cell(self.bz_gsm),
            cell(self.bt),
            cell(self.density),
            cell(self.speed),
            cell(self.temperature),
        ]
    }
}

pub trait SpaceWeatherProvider: Send + Sync {
    /// Latest reading, or `None` when the sources disagree on time.
    fn latest(&self) -> Result<Option<SolarWind>>;
}

/// NOAA SWPC real-time solar-wind products.
pub struct NoaaProvider {
    client: reqwest::blocking::Client,
    mag_url: String,
    plasma_url: String,
}

impl NoaaProvider {
    pub fn new(settings: &MeteoSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("adalog/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            mag_url: settings.mag_url.clone(),
            plasma_url: settings.plasma_url.clone(),
        })
    }

    fn fetch(&self, url: &str) -> Result<Vec<Vec<Value>>> {
        self.client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("requesting {}", url))?
            .json()
            .with_context(|| format!("decoding {}", url))
    }
}

impl SpaceWeatherProvider for NoaaProvider {
    fn latest(&self) -> Result<Option<SolarWind>> {
        let mag = last_row(&self.fetch(&self.mag_url)?)?;
        let plasma = last_row(&self.fetch(&self.plasma_url)?)?;
        Ok(merge(&mag, &plasma))
    }
}

/// The last data row of a NOAA table (first row holds the column names),
/// keyed by column name.
pub fn last_row(table: &[Vec<Value>]) -> Result<BTreeMap<String, Value>> {
    let header = table.first().ok_or_else(|| anyhow!("empty table"))?;
    if table.len() < 2 {
        return Err(anyhow!("table has no data rows"));
    }
    let row = &table[table.len() - 1];
    header
        .iter()
        .zip(row)
        .map(|(name, value)| {
            let name = name
                .as_str()
                .ok_or_else(|| anyhow!("column name is not a string: {}", name))?;
            Ok((name.to_string(), value.clone()))
        })
        .collect()
}

fn number(row: &BTreeMap<String, Value>, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Inner join of the two rows on `time_tag`.
pub fn merge(mag: &BTreeMap<String, Value>, plasma: &BTreeMap<String, Value>) -> Option<SolarWind> {
    let tag = mag.get("time_tag")?.as_str()?;
    if plasma.get("time_tag")?.as_str()? != tag {
        return None;
    }
    Some(SolarWind {
        time_tag: tag.to_string(),
        bx_gsm: number(mag, "bx_gsm"),
        by_gsm: number(mag, "by_gsm"),
        bz_gsm: number(mag, "bz_gsm"),
        bt: number(mag, "bt"),
        density: number(plasma, "density"),
        speed: number(plasma, "speed"),
        temperature: number(plasma, "temperature"),
    })
}

#[derive(Default)]
struct MeteoState {
    latest: Option<SolarWind>,
    sink: Option<CsvSink>,
    last_error: Option<String>,
}

impl MeteoState {
    fn accept(&mut self, reading: SolarWind) -> Result<bool> {
        if let Some(latest) = &self.latest {
            if reading.time_tag <= latest.time_tag {
                return Ok(false);
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.append(reading.csv_record(clock::iso_now()))?;
        }
        self.latest = Some(reading);
        Ok(true)
    }
}

fn poll_once(provider: &dyn SpaceWeatherProvider, state: &Mutex<MeteoState>) -> Result<bool> {
    // the request runs without the lock so hooks never wait on the network
    let fetched = provider.latest();
    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
    match fetched {
        Ok(Some(reading)) => {
            state.last_error = None;
            state.accept(reading)
        }
        Ok(None) => Ok(false),
        Err(err) => {
            state.last_error = Some(format!("{:#}", err));
            Err(err)
        }
    }
}

struct Poller {
    stop_tx: Sender<()>,
    worker: Worker,
}

pub struct MeteoPanel {
    provider: Arc<dyn SpaceWeatherProvider>,
    state: Arc<Mutex<MeteoState>>,
    poller: Option<Poller>,
    stop_timeout: Duration,
}

impl MeteoPanel {
    pub fn new(settings: &MeteoSettings, stop_timeout: Duration) -> Result<Self> {
        let provider: Arc<dyn SpaceWeatherProvider> = Arc::new(NoaaProvider::new(settings)?);
        let every = settings
            .enabled
            .then(|| Duration::from_secs(settings.poll_secs.max(1)));
        Self::with_provider(provider, every, stop_timeout)
    }

    /// `poll_every = None` leaves polling to [`MeteoPanel::poll_now`].
    pub fn with_provider(
        provider: Arc<dyn SpaceWeatherProvider>,
        poll_every: Option<Duration>,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(MeteoState::default()));
        let poller = match poll_every {
            Some(every) => Some(spawn_poller(Arc::clone(&provider), Arc::clone(&state), every)?),
            None => None,
        };
        Ok(Self {
            provider,
            state,
            poller,
            stop_timeout,
        })
    }

    fn state(&self) -> MutexGuard<'_, MeteoState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fetch once on the calling thread. Returns whether a new reading was
    /// taken.
    pub fn poll_now(&self) -> Result<bool> {
        poll_once(self.provider.as_ref(), &self.state)
    }

    pub fn latest(&self) -> Option<SolarWind> {
        self.state().latest.clone()
    }
}

fn spawn_poller(
    provider: Arc<dyn SpaceWeatherProvider>,
    state: Arc<Mutex<MeteoState>>,
    every: Duration,
) -> Result<Poller> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let worker = Worker::spawn("meteo-poll", move || {
        let mut polls = 0u64;
        loop {
            match poll_once(provider.as_ref(), &state) {
                Ok(true) => debug!("new space-weather reading"),
                Ok(false) => {}
                Err(err) => debug!("space-weather poll failed: {:#}", err),
            }
            polls += 1;
            match stop_rx.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        Ok(polls)
    })?;
    Ok(Poller { stop_tx, worker })
}

impl ModalityPanel for MeteoPanel {
    fn kind(&self) -> &str {
        "Meteo"
    }

    fn status(&self) -> PanelStatus {
        let state = self.state();
        if let Some(err) = &state.last_error {
            PanelStatus::Degraded(err.clone())
        } else if state.sink.is_some() {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        let mut state = self.state();
        if state.sink.is_none() {
            state.sink = Some(CsvSink::open(&dir.join(METEO_FILE), &HEADER)?);
        }
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        if let Some(mut sink) = self.state().sink.take() {
            info!("meteo: {} readings recorded", sink.rows());
            sink.close()?;
        }
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        let state = self.state();
        let Some(w) = &state.latest else {
            return Some("Last update: --:--:--".into());
        };
        let gauge = |v: Option<f64>| v.map_or_else(|| "--".to_string(), |v| format!("{:.2}", v));
        Some(format!(
            "Bz {} nT, Bt {} nT, speed {} km/s, density {} /cm3, temp {} K, last update {}",
            gauge(w.bz_gsm),
            gauge(w.bt),
            gauge(w.speed),
            gauge(w.density),
            gauge(w.temperature),
            w.time_tag
        ))
    }

    fn close(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.stop_tx.try_send(());
            if let Err(err) = poller.worker.finish(self.stop_timeout) {
                warn!("meteo poller: {:#}", err);
            }
        }
    }
}

impl Drop for MeteoPanel {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(MeteoPanel::new(
        &settings.meteo,
        settings.stop_timeout(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Scripted {
        readings: Mutex<Vec<SolarWind>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(tags: &[&str]) -> Arc<Self> {
            let readings = tags
                .iter()
                .rev()
                .map(|tag| SolarWind {
                    time_tag: tag.to_string(),
                    bz_gsm: Some(-2.5),
                    speed: Some(410.0),
                    ..SolarWind::default()
                })
                .collect();
            Arc::new(Self {
                readings: Mutex::new(readings),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SpaceWeatherProvider for Scripted {
        fn latest(&self) -> Result<Option<SolarWind>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            if readings.len() > 1 {
                Ok(readings.pop())
            } else {
                Ok(readings.last().cloned())
            }
        }
    }

    fn rows(path: &Path) -> usize {
        csv::Reader::from_path(path).unwrap().records().count()
    }

    #[test]
    fn merges_noaa_tables_on_time_tag() {
        let mag: Vec<Vec<Value>> = serde_json::from_str(
            r#"[["time_tag","bx_gsm","by_gsm","bz_gsm","lon_gsm","lat_gsm","bt"],
                ["2024-05-01 12:00:00.000","1.0","2.0","-3.5","10","5","4.2"],
                ["2024-05-01 12:01:00.000","1.1","2.1","-3.6","10","5","4.3"]]"#,
        )
        .unwrap();
        let plasma: Vec<Vec<Value>> = serde_json::from_str(
            r#"[["time_tag","density","speed","temperature"],
                ["2024-05-01 12:01:00.000","3.2","415.0",null]]"#,
        )
        .unwrap();
        let reading = merge(&last_row(&mag).unwrap(), &last_row(&plasma).unwrap()).unwrap();
        assert_eq!(reading.time_tag, "2024-05-01 12:01:00.000");
        assert_eq!(reading.bz_gsm, Some(-3.6));
        assert_eq!(reading.bt, Some(4.3));
        assert_eq!(reading.speed, Some(415.0));
        assert_eq!(reading.temperature, None);

        let stale: Vec<Vec<Value>> = serde_json::from_str(
            r#"[["time_tag","density","speed","temperature"],
                ["2024-05-01 11:59:00.000","3.2","415.0","90000"]]"#,
        )
        .unwrap();
        assert!(merge(&last_row(&mag).unwrap(), &last_row(&stale).unwrap()).is_none());
        assert!(last_row(&mag[..1]).is_err());
    }

    #[test]
    fn repeated_time_tag_is_written_once() {
        let dir = tempdir().unwrap();
        let provider = Scripted::new(&["t1", "t1", "t2"]);
        let mut panel = MeteoPanel::with_provider(provider, None, Duration::from_secs(1)).unwrap();
        panel.start_recording(dir.path()).unwrap();
        assert!(panel.poll_now().unwrap());
        assert!(!panel.poll_now().unwrap());
        assert!(panel.poll_now().unwrap());
        assert!(!panel.poll_now().unwrap());
        panel.stop_recording().unwrap();
        assert_eq!(rows(&dir.path().join(METEO_FILE)), 2);
    }

    #[test]
    fn idle_polls_update_gauges_only() {
        let dir = tempdir().unwrap();
        let provider = Scripted::new(&["t1", "t2"]);
        let mut panel = MeteoPanel::with_provider(provider, None, Duration::from_secs(1)).unwrap();
        assert!(panel.poll_now().unwrap());
        assert_eq!(panel.latest().unwrap().time_tag, "t1");
        assert!(panel.readout().unwrap().contains("Bz -2.50 nT"));

        panel.start_recording(dir.path()).unwrap();
        panel.stop_recording().unwrap();
        assert!(panel.poll_now().unwrap());
        assert_eq!(rows(&dir.path().join(METEO_FILE)), 0);
    }

    #[test]
    fn poller_runs_until_closed() {
        let provider = Scripted::new(&["t1"]);
        let mut panel = MeteoPanel::with_provider(
            provider.clone(),
            Some(Duration::from_millis(10)),
            Duration::from_secs(2),
        )
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while provider.calls.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        panel.close();
        let after_close = provider.calls.load(Ordering::SeqCst);
        assert!(after_close >= 3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(provider.calls.load(Ordering::SeqCst), after_close);
        assert_eq!(panel.latest().unwrap().time_tag, "t1");
    }
}
