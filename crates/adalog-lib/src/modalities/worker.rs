use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::warn;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A panel-owned background thread whose completion can be awaited with an
/// upper bound. The thread reports how many items it handled.
pub(crate) struct Worker {
    name: String,
    done_rx: Receiver<Result<u64>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, work: F) -> Result<Self>
    where
        F: FnOnce() -> Result<u64> + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = done_tx.send(work());
            })?;
        Ok(Self {
            name: name.to_string(),
            done_rx,
            handle: Some(handle),
        })
    }

    /// Wait for the thread to finish. After `timeout` the thread is left
    /// detached and `Ok(None)` is returned.
    pub(crate) fn finish(mut self, timeout: Duration) -> Result<Option<u64>> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(result) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                result.map(Some)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} did not finish within {:?}; leaving it detached",
                    self.name, timeout
                );
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Err(anyhow!("{} exited without reporting (panicked)", self.name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_result() {
        let worker = Worker::spawn("count", || Ok(3)).unwrap();
        assert_eq!(worker.finish(Duration::from_secs(2)).unwrap(), Some(3));
    }

    #[test]
    fn gives_up_after_timeout() {
        let worker = Worker::spawn("slow", || {
            thread::sleep(Duration::from_millis(300));
            Ok(0)
        })
        .unwrap();
        assert_eq!(worker.finish(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn panics_surface_as_errors() {
        let worker = Worker::spawn("boom", || -> Result<u64> { panic!("writer crashed") }).unwrap();
        assert!(worker.finish(Duration::from_secs(2)).is_err());
    }
}
