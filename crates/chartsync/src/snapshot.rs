// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-context key-value area.
//!
//! Sibling contexts (result viewers, the AI bridge) cannot reach the
//! in-memory store, so every commit mirrors a condensed per-subject blob
//! here. Two backends: [`MemorySnapshotStore`] and a directory of JSON files,
//! [`FileSnapshotStore`].

use crate::config::data_dir;
use crate::error::HarvestResult;
use crate::normalizer::Record;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use url::form_urlencoded;

/// Key under which the last seen session fingerprint is kept.
pub const FINGERPRINT_KEY: &str = "session/fingerprint";

/// Key of the persisted blob for one subject.
pub fn subject_key(fingerprint: &str) -> String {
    format!("subject/{fingerprint}")
}

/// Lightweight subject descriptor shown by consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDisplay {
    /// Display name, or the fingerprint when no name is known.
    pub display_name: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
}

/// One data type inside a subject snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub records: Vec<Record>,
    pub captured_at: DateTime<Utc>,
}

/// The per-subject blob read by sibling contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
    pub subject: SubjectDisplay,
    /// Keyed by data type wire key.
    pub data: BTreeMap<String, DataSnapshot>,
}

impl SubjectSnapshot {
    pub fn new(fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            updated_at: now,
            subject: SubjectDisplay {
                display_name: fingerprint.to_string(),
                ..SubjectDisplay::default()
            },
            data: BTreeMap::new(),
        }
    }
}

/// Longer-lived key-value storage shared across contexts.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> HarvestResult<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> HarvestResult<()>;
    fn remove(&self, key: &str) -> HarvestResult<()>;
    fn keys(&self) -> HarvestResult<Vec<String>>;
}

/// Read a subject blob, if present and well-formed.
pub fn load_subject(
    store: &dyn SnapshotStore,
    fingerprint: &str,
) -> HarvestResult<Option<SubjectSnapshot>> {
    match store.get(&subject_key(fingerprint))? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<String, Value>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &str) -> HarvestResult<Option<Value>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &Value) -> HarvestResult<()> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> HarvestResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> HarvestResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory of `<encoded key>.json` files.
///
/// Keys are form-urlencoded, so `subject/A123` lands in `subject%2FA123.json`
/// and every key round-trips through [`SnapshotStore::keys`].
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open(dir: PathBuf) -> HarvestResult<Self> {
        fs::create_dir_all(&dir)?;
        tracing::debug!("snapshot store at {}", dir.display());
        Ok(Self { dir })
    }

    /// Open the default store at ~/.chartsync/snapshots.
    pub fn default_store() -> HarvestResult<Self> {
        Self::open(data_dir().join("snapshots"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.dir.join(format!("{encoded}.json"))
    }
}

fn decode_key(stem: &str) -> Option<String> {
    form_urlencoded::parse(stem.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self, key: &str) -> HarvestResult<Option<Value>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &Value) -> HarvestResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> HarvestResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> HarvestResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
