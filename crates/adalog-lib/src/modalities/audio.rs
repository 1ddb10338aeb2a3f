//! Audio capture to WAV.
//!
//! Samples come from a cpal input device (the default one unless a device
//! name is configured), from the host through [`AudioPanel::feed`], or from
//! a noise generator when `synthetic` is asked for explicitly.
//!
//! The capture side pushes sample blocks through an [`AudioFeed`]. While a
//! session records, blocks go through a bounded queue to a writer thread
//! that owns the WAV file. Stopping queues a `Finish` marker behind the last
//! block and waits for the writer, so every block pushed before the stop
//! call ends up in the file.

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hound::{WavSpec, WavWriter};
use log::{info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::worker::Worker;
use crate::clock::{self, MonotonicStamper};
use crate::config::{AudioSettings, PanelSettings};
use crate::panel::{Availability, LastValue, ModalityPanel, PanelStatus};

/// The host's default input device.
pub const DEFAULT_DEVICE: &str = "default";
/// Generated noise, for demos and tests only.
pub const SYNTHETIC_DEVICE: &str = "synthetic";
/// Samples are supplied by the host through [`AudioPanel::feed`].
pub const EXTERNAL_DEVICE: &str = "external";

enum WriterMsg {
    Chunk(Vec<f32>),
    Finish,
}

/// Capture-side handle. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct AudioFeed {
    queue: Arc<Mutex<Option<Sender<WriterMsg>>>>,
    level: LastValue<f32>,
}

impl AudioFeed {
    fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(None)),
            level: LastValue::new(0.0),
        }
    }

    /// Update the level meter and, while recording, queue the block for the
    /// file. Blocks when the queue is full. Returns whether the block was
    /// queued.
    pub fn push(&self, samples: &[f32]) -> bool {
        if !samples.is_empty() {
            self.level.set(rms(samples));
        }
        let queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        match queue.as_ref() {
            Some(tx) => tx.send(WriterMsg::Chunk(samples.to_vec())).is_ok(),
            None => false,
        }
    }

    pub fn level(&self) -> f32 {
        self.level.get()
    }

    fn attach(&self, tx: Sender<WriterMsg>) {
        *self.queue.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
    }

    fn detach(&self) -> Option<Sender<WriterMsg>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

fn rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Thread owning a sample source. cpal streams are not `Send`, so a device
/// stream is opened, played and dropped on this thread.
struct InputThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl InputThread {
    fn synthetic(feed: AudioFeed, sample_rate: u32, block_size: usize) -> Result<Self> {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let block_size = block_size.max(1);
        let period = Duration::from_secs_f64(block_size as f64 / f64::from(sample_rate.max(1)));
        let handle = thread::Builder::new()
            .name("audio-synthetic".into())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut block = vec![0.0f32; block_size];
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    for sample in block.iter_mut() {
                        *sample = rng.gen_range(-0.05..0.05);
                    }
                    feed.push(&block);
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Opens `device` (`None` for the default input) and returns the sample
    /// rate it actually runs at.
    fn device(feed: AudioFeed, device: Option<String>, sample_rate: u32) -> Result<(Self, u32)> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let handle = thread::Builder::new()
            .name("audio-input".into())
            .spawn(move || {
                let stream = match open_input(device.as_deref(), sample_rate, feed) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })?;
        let input = Self {
            stop_tx,
            handle: Some(handle),
        };
        let rate = ready_rx
            .recv()
            .map_err(|_| anyhow!("audio input thread exited before opening the device"))??;
        Ok((input, rate))
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InputThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(
    name: Option<&str>,
    sample_rate: u32,
    feed: AudioFeed,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match name {
        Some(name) => host
            .input_devices()
            .context("enumerating audio input devices")?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| anyhow!("audio device '{}' not found", name))?,
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("no default audio input device"))?,
    };
    let (config, format) = input_config(&device, sample_rate)?;
    let channels = usize::from(config.channels.max(1));
    let on_error = |err: cpal::StreamError| warn!("audio input error: {}", err);
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| s));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| f32::from(s) / f32::from(i16::MAX)));
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| (f32::from(s) - 32768.0) / 32768.0));
            },
            on_error,
            None,
        ),
        other => bail!("unsupported audio sample format {:?}", other),
    }
    .context("building audio input stream")?;
    stream.play().context("starting audio input stream")?;
    if let Ok(name) = device.name() {
        info!("audio input from '{}' at {} Hz", name, config.sample_rate.0);
    }
    Ok((stream, config.sample_rate.0))
}

/// Prefers f32 at the configured rate, else the device default.
fn input_config(device: &cpal::Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let wanted = cpal::SampleRate(sample_rate);
    let preferred = device
        .supported_input_configs()
        .context("querying audio input configurations")?
        .find(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= wanted
                && wanted <= c.max_sample_rate()
        });
    if let Some(supported) = preferred {
        return Ok((supported.with_sample_rate(wanted).config(), SampleFormat::F32));
    }
    let fallback = device
        .default_input_config()
        .context("querying the default audio input configuration")?;
    Ok((fallback.config(), fallback.sample_format()))
}

/// Interleaved frames to mono by averaging channels.
fn downmix<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    data.chunks(channels.max(1))
        .map(|frame| frame.iter().map(|s| convert(*s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

pub struct AudioPanel {
    settings: AudioSettings,
    stop_timeout: Duration,
    feed: AudioFeed,
    source: Option<InputThread>,
    sample_rate: u32,
    missing_device: Option<String>,
    writer: Option<Worker>,
    current_file: Option<PathBuf>,
    stamper: MonotonicStamper,
    last_written: Option<u64>,
}

impl AudioPanel {
    pub fn new(settings: &AudioSettings, stop_timeout: Duration) -> Result<Self> {
        let feed = AudioFeed::new();
        let mut missing_device = None;
        let mut sample_rate = settings.sample_rate;
        let source = match settings.device.as_str() {
            SYNTHETIC_DEVICE => {
                warn!("audio panel records generated noise");
                Some(InputThread::synthetic(
                    feed.clone(),
                    settings.sample_rate,
                    settings.block_size,
                )?)
            }
            EXTERNAL_DEVICE => None,
            device => {
                let name = (device != DEFAULT_DEVICE).then(|| device.to_string());
                match InputThread::device(feed.clone(), name, settings.sample_rate) {
                    Ok((input, rate)) => {
                        sample_rate = rate;
                        Some(input)
                    }
                    Err(err) => {
                        warn!("audio input unavailable: {:#}", err);
                        missing_device = Some(err.to_string());
                        None
                    }
                }
            }
        };
        Ok(Self {
            settings: settings.clone(),
            stop_timeout,
            feed,
            source,
            sample_rate,
            missing_device,
            writer: None,
            current_file: None,
            stamper: MonotonicStamper::default(),
            last_written: None,
        })
    }

    pub fn feed(&self) -> AudioFeed {
        self.feed.clone()
    }

    /// The WAV file of the current (or last) recording.
    pub fn current_file(&self) -> Option<&Path> {
        self.current_file.as_deref()
    }

    /// Samples written by the last completed recording.
    pub fn last_written(&self) -> Option<u64> {
        self.last_written
    }

    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }
}

impl ModalityPanel for AudioPanel {
    fn kind(&self) -> &str {
        "Audio"
    }

    fn status(&self) -> PanelStatus {
        if let Some(reason) = &self.missing_device {
            PanelStatus::Degraded(reason.clone())
        } else if self.writer.is_some() {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if let Some(reason) = &self.missing_device {
            return Ok(Availability::Unavailable(reason.clone()));
        }
        if self.writer.is_some() {
            return Ok(Availability::Ready);
        }
        let path = dir.join(format!(
            "audio_{}.wav",
            clock::file_stamp(self.stamper.next())
        ));
        let mut wav = WavWriter::create(&path, self.wav_spec())
            .with_context(|| format!("creating {}", path.display()))?;
        let (tx, rx) = bounded::<WriterMsg>(self.settings.queue_depth.max(1));
        let worker = Worker::spawn("audio-writer", move || {
            let mut written = 0u64;
            for msg in rx.iter() {
                match msg {
                    WriterMsg::Chunk(block) => {
                        for sample in block {
                            wav.write_sample(to_pcm16(sample))?;
                            written += 1;
                        }
                        wav.flush()?;
                    }
                    WriterMsg::Finish => break,
                }
            }
            wav.finalize()?;
            Ok(written)
        })?;
        self.feed.attach(tx);
        self.writer = Some(worker);
        info!("audio recording to {}", path.display());
        self.current_file = Some(path);
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        if let Some(tx) = self.feed.detach() {
            if tx.send_timeout(WriterMsg::Finish, self.stop_timeout).is_err() {
                warn!("audio writer did not accept the finish marker");
            }
        }
        if let Some(worker) = self.writer.take() {
            if let Some(written) = worker.finish(self.stop_timeout)? {
                info!("audio recording closed after {} samples", written);
                self.last_written = Some(written);
            }
        }
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        Some(format!("level: {:.3}", self.feed.level()))
    }

    fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
    }
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(AudioPanel::new(
        &settings.audio,
        settings.stop_timeout(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn external(queue_depth: usize) -> AudioPanel {
        let settings = AudioSettings {
            device: EXTERNAL_DEVICE.into(),
            queue_depth,
            ..AudioSettings::default()
        };
        AudioPanel::new(&settings, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn every_pushed_sample_reaches_the_file() {
        let dir = tempdir().unwrap();
        let mut panel = external(2);
        let feed = panel.feed();
        panel.start_recording(dir.path()).unwrap();

        let pusher = thread::spawn(move || {
            for i in 0..50 {
                let block = vec![(i as f32) / 100.0; 97];
                assert!(feed.push(&block));
            }
        });
        pusher.join().unwrap();
        panel.stop_recording().unwrap();

        let path = panel.current_file().unwrap().to_path_buf();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 50 * 97);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(panel.last_written(), Some(50 * 97));
    }

    #[test]
    fn pushes_while_idle_only_move_the_meter() {
        let panel = external(4);
        let feed = panel.feed();
        assert!(!feed.push(&[0.5, -0.5]));
        assert!((feed.level() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn missing_device_is_unavailable_not_an_error() {
        let dir = tempdir().unwrap();
        let settings = AudioSettings {
            device: "usb-interface-7".into(),
            ..AudioSettings::default()
        };
        let mut panel = AudioPanel::new(&settings, Duration::from_secs(1)).unwrap();
        let availability = panel.start_recording(dir.path()).unwrap();
        assert!(matches!(availability, Availability::Unavailable(_)));
        assert!(matches!(panel.status(), PanelStatus::Degraded(_)));
        panel.stop_recording().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn default_settings_capture_from_a_device_or_nothing() {
        assert_eq!(AudioSettings::default().device, DEFAULT_DEVICE);
        let dir = tempdir().unwrap();
        let mut panel = AudioPanel::new(&AudioSettings::default(), Duration::from_secs(1)).unwrap();
        match panel.start_recording(dir.path()).unwrap() {
            Availability::Unavailable(_) => {
                assert!(matches!(panel.status(), PanelStatus::Degraded(_)));
                assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
            }
            Availability::Ready => assert!(panel.missing_device.is_none()),
        }
        panel.stop_recording().unwrap();
        panel.close();
    }

    #[test]
    fn downmix_averages_frames() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2, |s| s), vec![0.0, 0.5]);
        let pcm = [i16::MAX, i16::MAX];
        assert_eq!(downmix(&pcm, 1, |s| f32::from(s) / f32::from(i16::MAX)), vec![1.0, 1.0]);
    }

    #[test]
    fn stop_is_idempotent_and_files_are_distinct() {
        let dir = tempdir().unwrap();
        let mut panel = external(4);
        panel.start_recording(dir.path()).unwrap();
        panel.stop_recording().unwrap();
        panel.stop_recording().unwrap();
        let first = panel.current_file().unwrap().to_path_buf();
        panel.start_recording(dir.path()).unwrap();
        panel.stop_recording().unwrap();
        assert_ne!(first, panel.current_file().unwrap());
    }

    #[test]
    fn synthetic_source_moves_the_meter() {
        let settings = AudioSettings {
            block_size: 64,
            device: SYNTHETIC_DEVICE.into(),
            ..AudioSettings::default()
        };
        let mut panel = AudioPanel::new(&settings, Duration::from_secs(1)).unwrap();
        let feed = panel.feed();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while feed.level() == 0.0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        panel.close();
        assert!(feed.level() > 0.0);
    }
}
