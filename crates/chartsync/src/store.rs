// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence & broadcast.
//!
//! The shared, keyed record store. Each data type owns one slot that is
//! overwritten, never merged, on every commit. Commits are mirrored as a
//! condensed per-subject blob into the [`SnapshotStore`] and announced on the
//! [`EventBus`].

use crate::clock::Clock;
use crate::events::{BatchCompletion, CaptureOrigin, EventBus, HarvestEvent};
use crate::normalizer::{NormalizedRecordSet, Record, RecordView};
use crate::registry::DataType;
use crate::snapshot::{
    load_subject, subject_key, DataSnapshot, SnapshotStore, SubjectDisplay, SubjectSnapshot,
};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

const NAME_KEYS: [&str; 3] = ["name", "patientName", "ptName"];
const AGE_KEYS: [&str; 2] = ["age", "ptAge"];
const SEX_KEYS: [&str; 3] = ["sex", "gender", "ptSex"];

#[derive(Debug, Clone)]
struct Slot {
    set: NormalizedRecordSet,
    /// Subject fingerprint current when the set was committed.
    fingerprint: Option<String>,
}

/// Shared keyed store of normalized record sets.
pub struct RecordStore {
    slots: DashMap<DataType, Slot>,
    subject: RwLock<Option<String>>,
    snapshots: Arc<dyn SnapshotStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    record_limit: usize,
}

impl RecordStore {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        record_limit: usize,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            subject: RwLock::new(None),
            snapshots,
            bus,
            clock,
            record_limit,
        }
    }

    /// Fingerprint that subsequent commits are attributed to.
    pub fn set_subject(&self, fingerprint: &str) {
        *self.subject.write().unwrap_or_else(PoisonError::into_inner) = Some(fingerprint.to_string());
    }

    pub fn subject(&self) -> Option<String> {
        self.subject
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrite the slot for `set.data_type` under the current subject and
    /// mirror it.
    ///
    /// Used for passively observed responses. Mirror failures are logged; the
    /// in-memory commit always succeeds.
    pub fn commit(&self, set: NormalizedRecordSet, origin: CaptureOrigin) {
        let fingerprint = self.subject();
        self.write(set, origin, fingerprint);
    }

    /// Commit a set fetched for `fingerprint`.
    ///
    /// Returns `false` and drops the set when the store has since moved to a
    /// different subject. A store with no subject yet adopts the tag as is.
    pub fn commit_for(
        &self,
        set: NormalizedRecordSet,
        origin: CaptureOrigin,
        fingerprint: &str,
    ) -> bool {
        if let Some(current) = self.subject() {
            if current != fingerprint {
                tracing::info!(
                    "dropping {} fetched for {fingerprint}; subject is now {current}",
                    set.data_type
                );
                return false;
            }
        }
        self.write(set, origin, Some(fingerprint.to_string()));
        true
    }

    fn write(&self, set: NormalizedRecordSet, origin: CaptureOrigin, fingerprint: Option<String>) {
        let data_type = set.data_type;
        let record_count = set.records.len();

        if let Some(fp) = fingerprint.as_deref() {
            if let Err(e) = self.mirror(fp, &set) {
                tracing::warn!("snapshot mirror failed for {data_type}: {e}");
            }
        }

        self.slots.insert(data_type, Slot { set, fingerprint });
        tracing::debug!("committed {record_count} {data_type} record(s) ({origin:?})");

        self.bus.emit(HarvestEvent::DataCaptured {
            data_type,
            record_count,
            origin,
        });
    }

    fn mirror(&self, fingerprint: &str, set: &NormalizedRecordSet) -> crate::error::HarvestResult<()> {
        let mut snapshot = load_subject(self.snapshots.as_ref(), fingerprint)?
            .unwrap_or_else(|| SubjectSnapshot::new(fingerprint, set.captured_at));

        snapshot.updated_at = set.captured_at;
        snapshot.data.insert(
            set.data_type.key().to_string(),
            DataSnapshot {
                records: set.records.iter().take(self.record_limit).cloned().collect(),
                captured_at: set.captured_at,
            },
        );
        if set.data_type == DataType::PatientSummary {
            if let Some(record) = set.records.first() {
                snapshot.subject = subject_display(record, fingerprint);
            }
        }

        self.snapshots
            .put(&subject_key(fingerprint), &serde_json::to_value(&snapshot)?)
    }

    /// Reset every slot to empty.
    pub fn clear_all(&self) {
        self.slots.clear();
        tracing::info!("record store cleared");
        self.bus.emit(HarvestEvent::StoreCleared {
            timestamp: self.clock.now(),
        });
    }

    /// Emit the run's completion event.
    pub fn broadcast_completion(&self, completion: BatchCompletion) {
        tracing::info!(
            "batch {} finished: {:?}, {} outcome(s), {} record(s)",
            completion.batch_id,
            completion.status,
            completion.outcomes.len(),
            completion.total_records()
        );
        self.bus.emit(HarvestEvent::BatchCompleted(completion));
    }

    pub fn get(&self, data_type: DataType) -> Option<NormalizedRecordSet> {
        self.slots.get(&data_type).map(|slot| slot.set.clone())
    }

    /// Canonical view; empty when nothing has been captured.
    pub fn records(&self, data_type: DataType) -> RecordView {
        RecordView {
            records: self
                .slots
                .get(&data_type)
                .map(|slot| slot.set.records.clone())
                .unwrap_or_default(),
        }
    }

    /// Fingerprint the slot was captured under, if the slot exists.
    pub fn captured_under(&self, data_type: DataType) -> Option<Option<String>> {
        self.slots.get(&data_type).map(|slot| slot.fingerprint.clone())
    }

    pub fn contains(&self, data_type: DataType) -> bool {
        self.slots.contains_key(&data_type)
    }

    /// Views for every captured data type.
    pub fn all(&self) -> BTreeMap<DataType, RecordView> {
        self.slots
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    RecordView {
                        records: e.value().set.records.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }
}

/// Derive the display descriptor from a patient summary record.
fn subject_display(record: &Record, fingerprint: &str) -> SubjectDisplay {
    let lookup = |keys: &[&str]| -> Option<Value> {
        let nested = ["rObject", "robject"]
            .iter()
            .find_map(|f| record.get(*f))
            .filter(|v| v.is_object());
        keys.iter()
            .find_map(|k| record.get(*k))
            .or_else(|| nested.and_then(|n| keys.iter().find_map(|k| n.get(*k))))
            .cloned()
    };

    let display_name = lookup(&NAME_KEYS)
        .and_then(|v| v.as_str().map(str::trim).map(String::from))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fingerprint.to_string());

    let age = lookup(&AGE_KEYS).and_then(|v| match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    let sex = lookup(&SEX_KEYS)
        .and_then(|v| v.as_str().map(String::from))
        .filter(|s| !s.is_empty());

    SubjectDisplay {
        display_name,
        age,
        sex,
    }
}
