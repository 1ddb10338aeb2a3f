//! Free-text session tags and their append-only log.
//!
//! The log receives the whole tag set on every mutation, so the tags that
//! applied at any instant can be recovered offline from the last row before
//! that instant.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::clock;
use crate::sink::{append_row, sanitize_component};

pub const TAG_LOG_FILE: &str = "tags.csv";
const TAG_LOG_HEADER: [&str; 2] = ["timestamp", "tags"];

#[derive(Default)]
struct TagState {
    tags: Vec<String>,
    log_path: Option<PathBuf>,
}

/// Ordered, deduplicated tag set bound to at most one session log.
///
/// Mutations are only accepted while a log is open; outside a session they
/// are silent no-ops. All appends go through one lock.
#[derive(Default)]
pub struct TagStore {
    state: Mutex<TagState>,
}

impl TagStore {
    pub fn new<I, S>(initial: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tags: Vec<String> = Vec::new();
        for tag in initial {
            let raw: String = tag.into();
            let Some(tag) = parse_tag_input(&raw) else {
                continue;
            };
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Self {
            state: Mutex::new(TagState {
                tags,
                log_path: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TagState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tags(&self) -> Vec<String> {
        self.lock().tags.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().log_path.is_some()
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.lock().log_path.clone()
    }

    /// Bind the log to `<session_dir>/tags.csv` and record the current set.
    pub fn open(&self, session_dir: &Path) -> Result<()> {
        let mut state = self.lock();
        let path = session_dir.join(TAG_LOG_FILE);
        write_snapshot(&path, &state.tags)?;
        state.log_path = Some(path);
        Ok(())
    }

    pub fn close(&self) {
        self.lock().log_path = None;
    }

    /// Insert `tag` if absent. Returns whether the set changed.
    pub fn add(&self, tag: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(path) = state.log_path.clone() else {
            debug!("ignoring tag '{}' outside a session", tag);
            return Ok(false);
        };
        let Some(tag) = parse_tag_input(tag) else {
            return Ok(false);
        };
        if state.tags.contains(&tag) {
            return Ok(false);
        }
        state.tags.push(tag);
        write_snapshot(&path, &state.tags)?;
        Ok(true)
    }

    /// Remove `tag` if present. Returns whether the set changed.
    pub fn remove(&self, tag: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(path) = state.log_path.clone() else {
            debug!("ignoring tag removal '{}' outside a session", tag);
            return Ok(false);
        };
        let Some(tag) = parse_tag_input(tag) else {
            return Ok(false);
        };
        let Some(idx) = state.tags.iter().position(|t| *t == tag) else {
            return Ok(false);
        };
        state.tags.remove(idx);
        write_snapshot(&path, &state.tags)?;
        Ok(true)
    }
}

fn write_snapshot(path: &Path, tags: &[String]) -> Result<()> {
    append_row(path, &TAG_LOG_HEADER, [clock::iso_now(), tags.join(", ")])
        .with_context(|| format!("writing tag log {}", path.display()))
}

/// Normalize raw tag-entry text: surrounding spaces and commas are dropped
/// and inner commas become spaces, since the log joins tags with `", "`.
pub fn parse_tag_input(text: &str) -> Option<String> {
    let cleaned = text
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Every tag used in earlier sessions of `user`, sorted, for tag completion.
/// Unreadable logs are skipped with a warning.
pub fn known_tags(root: &Path, user: &str) -> Result<Vec<String>> {
    let user_dir = root.join(sanitize_component(user));
    let mut found = BTreeSet::new();
    if !user_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    collect_tag_logs(&user_dir, &mut logs)?;
    for log_path in logs {
        if let Err(err) = read_tags_from_log(&log_path, &mut found) {
            warn!("could not read {}: {:#}", log_path.display(), err);
        }
    }
    Ok(found.into_iter().collect())
}

fn collect_tag_logs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_tag_logs(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(TAG_LOG_FILE) {
            out.push(path);
        }
    }
    Ok(())
}

pub(crate) fn read_tags_from_log(path: &Path, found: &mut BTreeSet<String>) -> Result<()> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let Some(col) = headers.iter().position(|h| h == "tags") else {
        return Ok(());
    };
    for record in reader.records() {
        let record = record?;
        if let Some(cell) = record.get(col) {
            for tag in cell.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                found.insert(tag.to_string());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rows(path: &Path) -> Vec<(String, String)> {
        let mut reader = ReaderBuilder::new().from_path(path).unwrap();
        reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                (r[0].to_string(), r[1].to_string())
            })
            .collect()
    }

    #[test]
    fn mutations_while_idle_are_noops() {
        let dir = tempdir().unwrap();
        let store = TagStore::new(["seed"]);
        assert!(!store.add("a").unwrap());
        assert!(!store.remove("seed").unwrap());
        assert_eq!(store.tags(), vec!["seed"]);
        assert!(!dir.path().join(TAG_LOG_FILE).exists());
    }

    #[test]
    fn add_then_remove_appends_two_rows() {
        let dir = tempdir().unwrap();
        let store = TagStore::default();
        store.open(dir.path()).unwrap();
        assert!(store.add("a").unwrap());
        assert!(store.add("b").unwrap());
        assert!(store.remove("b").unwrap());

        let rows = rows(&dir.path().join(TAG_LOG_FILE));
        // first row is the (empty) set recorded at session start
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].1, "a, b");
        assert_eq!(rows[3].1, "a");
    }

    #[test]
    fn duplicates_and_unknown_removals_do_not_log() {
        let dir = tempdir().unwrap();
        let store = TagStore::new(["a"]);
        store.open(dir.path()).unwrap();
        assert!(!store.add("a").unwrap());
        assert!(store.add("A").unwrap());
        assert!(!store.remove("zzz").unwrap());
        let rows = rows(&dir.path().join(TAG_LOG_FILE));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1, "a, A");
    }

    #[test]
    fn closed_store_keeps_last_running_set() {
        let dir = tempdir().unwrap();
        let store = TagStore::default();
        store.open(dir.path()).unwrap();
        store.add("kept").unwrap();
        store.close();
        assert!(!store.add("late").unwrap());
        assert_eq!(store.tags(), vec!["kept"]);
    }

    #[test]
    fn parses_tag_entry_text() {
        assert_eq!(parse_tag_input(" focus, ").as_deref(), Some("focus"));
        assert_eq!(parse_tag_input(" , "), None);
        assert_eq!(parse_tag_input("a,b").as_deref(), Some("a b"));
        assert_eq!(parse_tag_input(" deep , sleep,").as_deref(), Some("deep sleep"));
    }

    #[test]
    fn comma_tags_stay_one_tag_in_the_log() {
        let root = tempdir().unwrap();
        let session = root.path().join("ivy").join("2024-01-03T00-00-00-000000");
        fs::create_dir_all(&session).unwrap();
        let store = TagStore::default();
        store.open(&session).unwrap();
        assert!(store.add("a,b").unwrap());
        assert!(!store.add("a b").unwrap());
        assert_eq!(store.tags(), vec!["a b"]);
        assert!(store.remove("a, b").unwrap());
        store.add("a,b").unwrap();
        store.close();
        assert_eq!(known_tags(root.path(), "ivy").unwrap(), vec!["a b"]);
    }

    #[test]
    fn known_tags_collects_across_sessions() {
        let root = tempdir().unwrap();
        let s1 = root.path().join("alice").join("2024-01-01T00-00-00-000000");
        let s2 = root
            .path()
            .join("alice")
            .join("dream")
            .join("2024-01-02T00-00-00-000000");
        fs::create_dir_all(&s1).unwrap();
        fs::create_dir_all(&s2).unwrap();
        TagStore::new(["rest", "eyes closed"]).open(&s1).unwrap();
        TagStore::new(["rest", "music"]).open(&s2).unwrap();

        let tags = known_tags(root.path(), "alice").unwrap();
        assert_eq!(tags, vec!["eyes closed", "music", "rest"]);
        assert!(known_tags(root.path(), "bob").unwrap().is_empty());
    }
}
