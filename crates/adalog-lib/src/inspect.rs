//! Offline summary of recorded sessions: per-modality totals and how much
//! recording time each pair of modalities shares.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use csv::ReaderBuilder;
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::clock;
use crate::modalities::{drawing::DRAWING_INDEX, text::TEXT_FILE};
use crate::sink::sanitize_component;
use crate::tags::{read_tags_from_log, TAG_LOG_FILE};

/// Sample rate assumed for EEG files written by the backend.
pub const EEG_SAMPLE_RATE: f64 = 256.0;

/// Panel directories the summary knows how to measure.
pub const INSPECTED: [&str; 4] = ["Text", "Eeg", "Drawing", "Audio"];

#[derive(Debug, Clone, Default)]
pub struct InspectFilter {
    /// Sessions must carry all of these tags. Empty keeps every session.
    pub tags: BTreeSet<String>,
    /// Modalities to measure. Empty measures all of [`INSPECTED`].
    pub modalities: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModalityStats {
    pub sessions: usize,
    pub duration_s: f64,
    pub words: usize,
    pub snapshots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlap {
    pub a: String,
    pub b: String,
    pub seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetSummary {
    pub sessions: usize,
    pub modalities: BTreeMap<String, ModalityStats>,
    pub overlaps: Vec<Overlap>,
}

/// Everything a user could filter on: tags used and panel directories seen.
pub fn available_filters(root: &Path, user: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut tags = BTreeSet::new();
    let mut modalities = BTreeSet::new();
    for session in session_dirs(root, user)? {
        let log = session.join(TAG_LOG_FILE);
        if log.exists() {
            if let Err(err) = read_tags_from_log(&log, &mut tags) {
                warn!("could not read {}: {:#}", log.display(), err);
            }
        }
        for entry in fs::read_dir(&session)?.flatten() {
            if entry.path().is_dir() {
                let title = entry.file_name().to_string_lossy().into_owned();
                modalities.insert(panel_kind(&title).to_string());
            }
        }
    }
    Ok((tags.into_iter().collect(), modalities.into_iter().collect()))
}

/// Session directories of `user`, at any nesting depth, oldest first.
pub fn session_dirs(root: &Path, user: &str) -> Result<Vec<PathBuf>> {
    let user_dir = root.join(sanitize_component(user));
    let mut found = Vec::new();
    if user_dir.is_dir() {
        collect_sessions(&user_dir, &mut found)?;
    }
    found.sort_by_key(|dir| {
        dir.file_name()
            .and_then(|n| n.to_str())
            .and_then(clock::parse_file_stamp)
    });
    Ok(found)
}

fn collect_sessions(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let is_session = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(clock::parse_file_stamp)
            .is_some();
        if is_session {
            out.push(path);
        } else {
            collect_sessions(&path, out)?;
        }
    }
    Ok(())
}

pub fn summarize(root: &Path, user: &str, filter: &InspectFilter) -> Result<DatasetSummary> {
    let wanted: Vec<&str> = INSPECTED
        .iter()
        .copied()
        .filter(|m| filter.modalities.is_empty() || filter.modalities.contains(*m))
        .collect();

    let mut summary = DatasetSummary::default();
    let mut overlaps: BTreeMap<(String, String), f64> = BTreeMap::new();
    for a in &wanted {
        for b in &wanted {
            if a < b {
                overlaps.insert((a.to_string(), b.to_string()), 0.0);
            }
        }
    }

    for session in session_dirs(root, user)? {
        if !has_tags(&session, &filter.tags) {
            continue;
        }
        summary.sessions += 1;
        let mut present: BTreeMap<&str, ModalityStats> = BTreeMap::new();
        for panel_dir in panel_dirs(&session) {
            let Some(title) = panel_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(modality) = wanted.iter().copied().find(|m| *m == panel_kind(title)) else {
                continue;
            };
            let Some(measured) = measure(&panel_dir, modality) else {
                continue;
            };
            // Instances of one kind run side by side: counts add up, time does not.
            let merged = present.entry(modality).or_default();
            merged.duration_s = merged.duration_s.max(measured.duration_s);
            merged.words += measured.words;
            merged.snapshots += measured.snapshots;
        }
        for (modality, measured) in &present {
            let stats = summary.modalities.entry(modality.to_string()).or_default();
            stats.sessions += 1;
            stats.duration_s += measured.duration_s;
            stats.words += measured.words;
            stats.snapshots += measured.snapshots;
        }
        let present: BTreeMap<&str, f64> = present
            .into_iter()
            .map(|(modality, stats)| (modality, stats.duration_s))
            .collect();
        for (a, da) in &present {
            for (b, db) in &present {
                if a < b {
                    if let Some(total) = overlaps.get_mut(&(a.to_string(), b.to_string())) {
                        *total += da.min(*db);
                    }
                }
            }
        }
    }

    summary.overlaps = overlaps
        .into_iter()
        .map(|((a, b), seconds)| Overlap { a, b, seconds })
        .collect();
    Ok(summary)
}

/// Panel kind of a directory titled by the controller: `Text2` is a `Text`.
pub fn panel_kind(title: &str) -> &str {
    let kind = title.trim_end_matches(|c: char| c.is_ascii_digit());
    if kind.is_empty() {
        title
    } else {
        kind
    }
}

fn panel_dirs(session: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(session)
        .map(|entries| entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect())
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn has_tags(session: &Path, wanted: &BTreeSet<String>) -> bool {
    if wanted.is_empty() {
        return true;
    }
    let mut tags = BTreeSet::new();
    let log = session.join(TAG_LOG_FILE);
    if !log.exists() || read_tags_from_log(&log, &mut tags).is_err() {
        return false;
    }
    wanted.is_subset(&tags)
}

/// Per-session measurement of one panel directory, `None` when it holds
/// nothing for that modality.
fn measure(dir: &Path, modality: &str) -> Option<ModalityStats> {
    if !dir.is_dir() {
        return None;
    }
    let stats = match modality {
        "Text" => {
            let csv = dir.join(TEXT_FILE);
            let timestamps = read_timestamps(&csv);
            ModalityStats {
                words: timestamps.len(),
                duration_s: span(&timestamps),
                ..ModalityStats::default()
            }
        }
        "Eeg" => {
            let rows = files_with_extension(dir, "csv")
                .first()
                .map(|csv| count_data_rows(csv))
                .unwrap_or(0);
            ModalityStats {
                duration_s: rows as f64 / EEG_SAMPLE_RATE,
                ..ModalityStats::default()
            }
        }
        "Drawing" => ModalityStats {
            snapshots: files_with_extension(dir, "png").len(),
            duration_s: span(&read_timestamps(&dir.join(DRAWING_INDEX))),
            ..ModalityStats::default()
        },
        "Audio" => ModalityStats {
            duration_s: files_with_extension(dir, "wav")
                .iter()
                .map(|wav| wav_seconds(wav))
                .sum(),
            ..ModalityStats::default()
        },
        _ => return None,
    };
    let empty = stats.words == 0 && stats.snapshots == 0 && stats.duration_s == 0.0;
    (!empty).then_some(stats)
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn read_timestamps(csv: &Path) -> Vec<DateTime<FixedOffset>> {
    let Ok(mut reader) = ReaderBuilder::new().from_path(csv) else {
        return Vec::new();
    };
    let Some(col) = reader
        .headers()
        .ok()
        .and_then(|h| h.iter().position(|name| name == "timestamp"))
    else {
        return Vec::new();
    };
    reader
        .records()
        .flatten()
        .filter_map(|record| {
            record
                .get(col)
                .and_then(|cell| DateTime::parse_from_rfc3339(cell).ok())
        })
        .collect()
}

fn span(timestamps: &[DateTime<FixedOffset>]) -> f64 {
    match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => {
            ((*last - *first).num_microseconds().unwrap_or(0) as f64 / 1e6).max(0.0)
        }
        _ => 0.0,
    }
}

fn count_data_rows(csv: &Path) -> usize {
    match ReaderBuilder::new().from_path(csv) {
        Ok(mut reader) => reader.records().count(),
        Err(err) => {
            debug!("skipping {}: {}", csv.display(), err);
            0
        }
    }
}

fn wav_seconds(path: &Path) -> f64 {
    match hound::WavReader::open(path) {
        Ok(reader) => {
            let spec = reader.spec();
            reader.duration() as f64 / f64::from(spec.sample_rate.max(1))
        }
        Err(err) => {
            debug!("skipping {}: {}", path.display(), err);
            0.0
        }
    }
}

/// `1h 02m 03s`, `2m 05s` or `5s`.
pub fn human_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
