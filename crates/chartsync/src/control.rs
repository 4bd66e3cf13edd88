// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inbound control messages from sibling contexts.
//!
//! Only `triggerRefetch` and `clearAll` reach the orchestrator. Result-view
//! and settings traffic belongs to the presentation layer and is
//! acknowledged without effect.

use crate::events::BatchCompletion;
use crate::orchestrator::FetchOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A control message as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    TriggerRefetch,
    ClearAll,
    OpenResultView,
    SettingChanged { key: String, value: Value },
    SettingsSnapshot { settings: Map<String, Value> },
}

/// What handling a control message did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "camelCase")]
pub enum ControlAck {
    /// A batch ran (or was skipped) and produced this completion.
    Triggered { completion: BatchCompletion },
    /// A refetch was requested but could not run.
    Rejected { reason: String },
    Cleared,
    Ignored,
}

impl ControlMessage {
    /// Parse one JSON control message.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Route a control message to the orchestrator.
pub async fn dispatch(orchestrator: &FetchOrchestrator, message: ControlMessage) -> ControlAck {
    match message {
        ControlMessage::TriggerRefetch => {
            tracing::info!("refetch requested");
            match orchestrator.run_batch().await {
                Ok(completion) => ControlAck::Triggered { completion },
                Err(e) => ControlAck::Rejected {
                    reason: e.to_string(),
                },
            }
        }
        ControlMessage::ClearAll => {
            tracing::info!("clear requested");
            orchestrator.clear_all();
            ControlAck::Cleared
        }
        other => {
            tracing::debug!("ignoring presentation message: {other:?}");
            ControlAck::Ignored
        }
    }
}
