use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Periodic elapsed-time heartbeat for the host display. Cosmetic: it never
/// touches session files.
pub struct Ticker {
    stop_tx: Sender<()>,
    ticks: Receiver<Duration>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(started: Instant, every: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        // a slow host only ever sees the latest ticks
        let (tick_tx, ticks) = bounded(4);
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => {
                    let _ = tick_tx.try_send(started.elapsed());
                }
                _ => break,
            }
        });
        Self {
            stop_tx,
            ticks,
            handle: Some(handle),
        }
    }

    pub fn ticks(&self) -> Receiver<Duration> {
        self.ticks.clone()
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_until_stopped() {
        let mut ticker = Ticker::start(Instant::now(), Duration::from_millis(10));
        let ticks = ticker.ticks();
        let first = ticks.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first >= Duration::from_millis(10));
        ticker.stop();
        while ticks.try_recv().is_ok() {}
        assert!(ticks.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
