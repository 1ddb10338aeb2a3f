//! Local real-time message bus used to talk to sensor-processing backends.
//!
//! One message per UDP datagram, framed as a JSON object
//! `{"address": "/recording_start", "args": [1.0]}`.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::BusError;

const MAX_DATAGRAM: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Float(v) => Some(*v),
            BusValue::Str(s) => s.trim().parse().ok(),
            BusValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Bool(v) => write!(f, "{}", v),
            BusValue::Int(v) => write!(f, "{}", v),
            BusValue::Float(v) => write!(f, "{:?}", v),
            BusValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Str(value.to_string())
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Float(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub address: String,
    #[serde(default)]
    pub args: Vec<BusValue>,
}

impl BusMessage {
    pub fn new(address: impl Into<String>, args: Vec<BusValue>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn first_f64(&self) -> Option<f64> {
        self.args.first().and_then(BusValue::as_f64)
    }
}

/// Fire-and-forget sender towards one backend.
pub struct BusClient {
    socket: UdpSocket,
    target: String,
}

impl BusClient {
    pub fn connect(target: &str) -> Result<Self, BusError> {
        let socket = UdpSocket::bind("127.0.0.1:0").map_err(|source| BusError::Bind {
            addr: "127.0.0.1:0".into(),
            source,
        })?;
        Ok(Self {
            socket,
            target: target.to_string(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn send(&self, address: &str, args: Vec<BusValue>) -> Result<(), BusError> {
        let payload = BusMessage::new(address, args).encode()?;
        self.socket
            .send_to(&payload, &self.target)
            .map_err(|source| BusError::Send {
                addr: self.target.clone(),
                source,
            })?;
        debug!("sent {} to {}", address, self.target);
        Ok(())
    }
}

/// Background receive loop dispatching decoded messages to a handler.
pub struct BusListener {
    local_addr: SocketAddr,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl BusListener {
    pub fn bind<F>(addr: &str, handler: F) -> Result<Self, BusError>
    where
        F: Fn(BusMessage) + Send + 'static,
    {
        let bind_err = |source| BusError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind(addr).map_err(bind_err)?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(format!("bus-{}", local_addr.port()))
            .spawn(move || receive_loop(socket, handler, stop_rx))
            .map_err(bind_err)?;
        Ok(Self {
            local_addr,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop<F>(socket: UdpSocket, handler: F, stop_rx: Receiver<()>)
where
    F: Fn(BusMessage),
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue
            }
            Err(err) => {
                warn!("bus receive on {:?} failed: {}", socket.local_addr(), err);
                continue;
            }
        };
        let message = match BusMessage::decode(&buf[..len]) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping datagram: {}", err);
                continue;
            }
        };
        let address = message.address.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            warn!("handler for {} panicked; listener keeps running", address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mixed_arguments() {
        let msg = BusMessage::decode(br#"{"address":"/a","args":[1,2.5,"x",true]}"#).unwrap();
        assert_eq!(
            msg.args,
            vec![
                BusValue::Int(1),
                BusValue::Float(2.5),
                BusValue::Str("x".into()),
                BusValue::Bool(true)
            ]
        );
        let bare = BusMessage::decode(br#"{"address":"/b"}"#).unwrap();
        assert!(bare.args.is_empty());
        assert!(BusMessage::decode(b"not json").is_err());
    }

    #[test]
    fn numeric_strings_read_as_numbers() {
        assert_eq!(BusValue::Str(" 2 ".into()).as_f64(), Some(2.0));
        assert_eq!(BusValue::Bool(true).as_f64(), None);
        assert_eq!(BusValue::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn client_reaches_listener() {
        let (tx, rx) = bounded(4);
        let mut listener = BusListener::bind("127.0.0.1:0", move |msg| {
            let _ = tx.send(msg);
        })
        .unwrap();
        let client = BusClient::connect(&listener.local_addr().to_string()).unwrap();
        client
            .send("/recording_path", vec!["/tmp/eeg.csv".into()])
            .unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.address, "/recording_path");
        assert_eq!(got.args, vec![BusValue::Str("/tmp/eeg.csv".into())]);
        listener.stop();
        listener.stop();
    }

    #[test]
    fn panicking_handler_does_not_kill_listener() {
        let (tx, rx) = bounded(4);
        let listener = BusListener::bind("127.0.0.1:0", move |msg: BusMessage| {
            if msg.address == "/boom" {
                panic!("handler failure");
            }
            let _ = tx.send(msg);
        })
        .unwrap();
        let client = BusClient::connect(&listener.local_addr().to_string()).unwrap();
        client.send("/boom", vec![]).unwrap();
        client.send("/ok", vec![]).unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.address, "/ok");
    }
}
