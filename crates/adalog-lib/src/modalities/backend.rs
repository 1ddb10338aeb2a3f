//! Plumbing shared by panels that front an external processing backend:
//! a control client, a metrics listener and stream enumeration.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::bus::{BusClient, BusListener, BusValue};

pub const NO_STREAMS: &str = "No streams available";

/// A sensor stream the backend can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub source_id: String,
    pub name: String,
    pub host: String,
}

impl StreamInfo {
    pub fn label(&self) -> String {
        format!("{} ({} @ {})", self.source_id, self.name, self.host)
    }
}

/// Enumerates streams visible on the network.
pub trait StreamResolver: Send {
    fn resolve(&self) -> Vec<StreamInfo>;
}

/// Resolver for builds without stream discovery.
pub struct NoStreams;

impl StreamResolver for NoStreams {
    fn resolve(&self) -> Vec<StreamInfo> {
        Vec::new()
    }
}

/// Fixed list of streams, for hosts that discover streams themselves.
pub struct KnownStreams(pub Vec<StreamInfo>);

impl StreamResolver for KnownStreams {
    fn resolve(&self) -> Vec<StreamInfo> {
        self.0.clone()
    }
}

/// Lab Streaming Layer discovery. Needs the `lsl` feature and liblsl.
#[cfg(feature = "lsl")]
pub struct LslResolver {
    /// Restrict to streams of this type (`EEG`, `ECG`, ...); all when unset.
    pub stream_type: Option<String>,
    pub wait_s: f64,
}

#[cfg(feature = "lsl")]
impl Default for LslResolver {
    fn default() -> Self {
        Self {
            stream_type: None,
            wait_s: 1.0,
        }
    }
}

#[cfg(feature = "lsl")]
impl LslResolver {
    pub(crate) fn describe(info: &lsl::StreamInfo) -> StreamInfo {
        StreamInfo {
            source_id: info.source_id(),
            name: info.stream_name(),
            host: info.hostname(),
        }
    }
}

#[cfg(feature = "lsl")]
impl StreamResolver for LslResolver {
    fn resolve(&self) -> Vec<StreamInfo> {
        let found = match &self.stream_type {
            Some(kind) => lsl::resolve_byprop("type", kind, 1, self.wait_s),
            None => lsl::resolve_streams(self.wait_s),
        };
        match found {
            Ok(streams) => streams.iter().map(Self::describe).collect(),
            Err(err) => {
                warn!("stream discovery failed: {:?}", err);
                Vec::new()
            }
        }
    }
}

/// LSL discovery when built with it, otherwise nothing.
pub fn default_resolver() -> Box<dyn StreamResolver> {
    #[cfg(feature = "lsl")]
    {
        Box::new(LslResolver::default())
    }
    #[cfg(not(feature = "lsl"))]
    {
        Box::new(NoStreams)
    }
}

/// Dropdown entries: one label per stream, or the single placeholder.
pub fn stream_choices(resolver: &dyn StreamResolver) -> Vec<String> {
    let streams = resolver.resolve();
    if streams.is_empty() {
        return vec![NO_STREAMS.to_string()];
    }
    streams.iter().map(StreamInfo::label).collect()
}

/// Latest value per metric address, written by the listener thread.
#[derive(Debug, Clone, Default)]
pub struct MetricCells {
    values: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl MetricCells {
    pub fn update(&self, address: &str, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address.to_string(), value);
    }

    pub fn get(&self, address: &str) -> Option<f64> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .copied()
    }
}

pub(crate) struct BackendLink {
    client: Option<BusClient>,
    listener: Option<BusListener>,
    metrics: MetricCells,
    problem: Option<String>,
}

impl BackendLink {
    /// Connects the control client and starts the metrics listener. Failures
    /// are kept as a degradation reason instead of aborting construction.
    pub(crate) fn open(
        control_addr: &str,
        listen_addr: &str,
        metrics: &'static [&'static str],
    ) -> Self {
        let cells = MetricCells::default();
        let mut problem = None;

        let client = match BusClient::connect(control_addr) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!("backend control {} unavailable: {}", control_addr, err);
                problem = Some(err.to_string());
                None
            }
        };

        let handler_cells = cells.clone();
        let listener = match BusListener::bind(listen_addr, move |msg| {
            if !metrics.iter().any(|m| *m == msg.address) {
                debug!("ignoring {}", msg.address);
                return;
            }
            match msg.first_f64() {
                Some(value) => handler_cells.update(&msg.address, value),
                None => debug!("{} carried no numeric value", msg.address),
            }
        }) {
            Ok(listener) => Some(listener),
            Err(err) => {
                warn!("backend metrics listener unavailable: {}", err);
                problem.get_or_insert(err.to_string());
                None
            }
        };

        Self {
            client,
            listener,
            metrics: cells,
            problem,
        }
    }

    pub(crate) fn problem(&self) -> Option<&str> {
        self.problem.as_deref()
    }

    pub(crate) fn metrics(&self) -> &MetricCells {
        &self.metrics
    }

    pub(crate) fn control_target(&self) -> Option<String> {
        self.client.as_ref().map(|c| c.target().to_string())
    }

    pub(crate) fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(BusListener::local_addr)
    }

    pub(crate) fn send(&self, address: &str, args: Vec<BusValue>) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("no control connection for {}", address))?;
        client.send(address, args)?;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.client = None;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::bus::{BusListener, BusMessage};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::{Duration, Instant};

    /// Stand-in backend collecting every control message it receives.
    pub(crate) struct FakeBackend {
        pub(crate) listener: BusListener,
        pub(crate) rx: Receiver<BusMessage>,
    }

    impl FakeBackend {
        pub(crate) fn start() -> Self {
            let (tx, rx) = unbounded();
            let listener = BusListener::bind("127.0.0.1:0", move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
            Self { listener, rx }
        }

        pub(crate) fn addr(&self) -> String {
            self.listener.local_addr().to_string()
        }

        pub(crate) fn collect(&self, within: Duration) -> Vec<BusMessage> {
            let deadline = Instant::now() + within;
            let mut seen = Vec::new();
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                match self.rx.recv_timeout(left) {
                    Ok(msg) => seen.push(msg),
                    Err(_) => break,
                }
            }
            seen
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn placeholder_when_no_streams() {
        assert_eq!(stream_choices(&NoStreams), vec![NO_STREAMS.to_string()]);
        let known = KnownStreams(vec![StreamInfo {
            source_id: "muse-7A3F".into(),
            name: "EEG".into(),
            host: "lab-pc".into(),
        }]);
        assert_eq!(stream_choices(&known), vec!["muse-7A3F (EEG @ lab-pc)".to_string()]);
    }

    #[cfg(not(feature = "lsl"))]
    #[test]
    fn builds_without_discovery_offer_the_placeholder() {
        assert_eq!(stream_choices(default_resolver().as_ref()), vec![NO_STREAMS.to_string()]);
    }

    #[cfg(feature = "lsl")]
    #[test]
    fn lsl_stream_info_is_labelled_by_source() {
        let info = lsl::StreamInfo::new(
            "Muse",
            "EEG",
            4,
            256.0,
            lsl::ChannelFormat::Float32,
            "muse-7A3F",
        )
        .unwrap();
        let described = LslResolver::describe(&info);
        assert_eq!(described.source_id, "muse-7A3F");
        assert_eq!(described.name, "Muse");
    }

    #[test]
    fn only_listed_metrics_are_kept() {
        let mut link = BackendLink::open("127.0.0.1:9", "127.0.0.1:0", &["/bpm"]);
        let addr = link.listen_addr().unwrap().to_string();
        let client = BusClient::connect(&addr).unwrap();
        client.send("/other", vec![BusValue::Float(1.0)]).unwrap();
        client.send("/bpm", vec![BusValue::Float(61.0)]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while link.metrics().get("/bpm").is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(link.metrics().get("/bpm"), Some(61.0));
        assert_eq!(link.metrics().get("/other"), None);
        link.close();
        assert!(link.send("/x", vec![]).is_err());
    }
}
