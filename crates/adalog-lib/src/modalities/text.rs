//! Typed text, logged one row per completed word.

use anyhow::Result;
use std::path::Path;

use crate::clock;
use crate::config::PanelSettings;
use crate::panel::{Availability, ModalityPanel, PanelStatus};
use crate::sink::{CsvSink, RecordingSink};

pub const TEXT_FILE: &str = "text.csv";

/// Word tracker fed with keystrokes by the host. A word is stamped at its
/// first character and written when whitespace ends it.
#[derive(Default)]
pub struct TextPanel {
    buffer: String,
    word: String,
    word_started: Option<String>,
    sink: Option<CsvSink>,
    words_logged: usize,
}

impl TextPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn words_logged(&self) -> usize {
        self.words_logged
    }

    pub fn type_text(&mut self, text: &str) -> Result<()> {
        for ch in text.chars() {
            self.key(ch)?;
        }
        Ok(())
    }

    pub fn key(&mut self, ch: char) -> Result<()> {
        self.buffer.push(ch);
        if ch.is_whitespace() {
            return self.end_word();
        }
        if self.word.is_empty() && self.sink.is_some() {
            self.word_started = Some(clock::iso_now());
        }
        self.word.push(ch);
        Ok(())
    }

    fn end_word(&mut self) -> Result<()> {
        let word = std::mem::take(&mut self.word);
        let started = self.word_started.take();
        if let (Some(started), Some(sink)) = (started, self.sink.as_mut()) {
            if !word.is_empty() {
                sink.append([started.as_str(), word.as_str()])?;
                self.words_logged += 1;
            }
        }
        Ok(())
    }
}

impl ModalityPanel for TextPanel {
    fn kind(&self) -> &str {
        "Text"
    }

    fn status(&self) -> PanelStatus {
        if self.sink.is_some() {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if self.sink.is_some() {
            return Ok(Availability::Ready);
        }
        self.sink = Some(CsvSink::open(
            &dir.join(TEXT_FILE),
            &["timestamp", "content"],
        )?);
        self.buffer.clear();
        self.word.clear();
        self.word_started = None;
        self.words_logged = 0;
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        // a word still being typed counts
        let flushed = self.end_word();
        if let Some(mut sink) = self.sink.take() {
            sink.close()?;
        }
        flushed
    }

    fn readout(&self) -> Option<String> {
        Some(format!("words: {}", self.words_logged))
    }
}

pub(crate) fn build(_: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(TextPanel::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv::ReaderBuilder;
    use tempfile::tempdir;

    fn words(path: &Path) -> Vec<String> {
        let mut reader = ReaderBuilder::new().from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap()[1].to_string())
            .collect()
    }

    #[test]
    fn whitespace_ends_words() {
        let dir = tempdir().unwrap();
        let mut panel = TextPanel::new();
        panel.start_recording(dir.path()).unwrap();
        panel.type_text("hello  world\nagain").unwrap();
        assert_eq!(panel.words_logged(), 2);
        panel.stop_recording().unwrap();
        assert_eq!(words(&dir.path().join(TEXT_FILE)), vec!["hello", "world", "again"]);
    }

    #[test]
    fn typing_while_idle_is_not_logged() {
        let dir = tempdir().unwrap();
        let mut panel = TextPanel::new();
        panel.type_text("before ").unwrap();
        panel.start_recording(dir.path()).unwrap();
        assert_eq!(panel.text(), "");
        panel.stop_recording().unwrap();
        panel.type_text("after ").unwrap();
        assert!(words(&dir.path().join(TEXT_FILE)).is_empty());
    }

    #[test]
    fn stop_twice_keeps_file() {
        let dir = tempdir().unwrap();
        let mut panel = TextPanel::new();
        panel.start_recording(dir.path()).unwrap();
        panel.type_text("one ").unwrap();
        panel.stop_recording().unwrap();
        let before = std::fs::read(dir.path().join(TEXT_FILE)).unwrap();
        panel.stop_recording().unwrap();
        let after = std::fs::read(dir.path().join(TEXT_FILE)).unwrap();
        assert_eq!(before, after);
    }
}
