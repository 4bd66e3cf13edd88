// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Event bus carrying typed events from the acquisition engine.
//!
//! The EventBus is a `tokio::sync::broadcast` channel that carries
//! [`HarvestEvent`] values. Consumers such as the CLI listener
//! can subscribe independently. When no subscribers exist, events are
//! silently dropped.

use crate::registry::DataType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Per-type result status as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
    /// Skipped by authorization gating; no call was made.
    NoData,
}

/// Outcome of one data type within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub status: OutcomeStatus,
    pub record_count: usize,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn success(data_type: DataType, record_count: usize) -> Self {
        Self {
            status: OutcomeStatus::Success,
            record_count,
            data_type,
            error: None,
        }
    }

    pub fn no_data(data_type: DataType) -> Self {
        Self {
            status: OutcomeStatus::NoData,
            record_count: 0,
            data_type,
            error: None,
        }
    }

    pub fn error(data_type: DataType, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            record_count: 0,
            data_type,
            error: Some(message.into()),
        }
    }
}

/// How an orchestrator run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BatchStatus {
    /// Menu and fan-out ran; outcomes carry per-type results.
    Completed,
    /// Fast path: data already current, nothing fetched.
    Skipped,
    /// Aborted before any data-type fetch started.
    Failed { reason: String },
}

/// The single completion event raised per orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompletion {
    pub batch_id: String,
    pub status: BatchStatus,
    pub fingerprint: Option<String>,
    pub outcomes: Vec<FetchOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl BatchCompletion {
    /// Total records across successful outcomes.
    pub fn total_records(&self) -> usize {
        self.outcomes.iter().map(|o| o.record_count).sum()
    }

    pub fn outcome(&self, data_type: DataType) -> Option<&FetchOutcome> {
        self.outcomes.iter().find(|o| o.data_type == data_type)
    }
}

/// Where a committed record set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureOrigin {
    /// Passively observed on a host-initiated call.
    Observed,
    /// Actively fetched by the orchestrator.
    Fetched,
}

/// Every event chartsync emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HarvestEvent {
    /// A batch passed its guards and started the menu fetch.
    BatchStarted {
        batch_id: String,
        fingerprint: String,
    },
    /// A record set was committed to the store.
    DataCaptured {
        data_type: DataType,
        record_count: usize,
        origin: CaptureOrigin,
    },
    /// The subject changed and stale state was dropped.
    SessionInvalidated {
        previous: String,
        current: String,
    },
    /// Every record slot was reset.
    StoreCleared { timestamp: DateTime<Utc> },
    /// A batch finished (including fast-path and failed runs).
    BatchCompleted(BatchCompletion),
}

/// The central event bus.
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: HarvestEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Check if an event concerns a specific data type.
pub fn event_matches_data_type(event: &HarvestEvent, data_type: DataType) -> bool {
    match event {
        HarvestEvent::DataCaptured { data_type: d, .. } => *d == data_type,
        HarvestEvent::BatchCompleted(completion) => completion.outcome(data_type).is_some(),
        // Session-wide events concern every type
        HarvestEvent::BatchStarted { .. }
        | HarvestEvent::SessionInvalidated { .. }
        | HarvestEvent::StoreCleared { .. } => true,
    }
}
