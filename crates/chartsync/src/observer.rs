// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network observation.
//!
//! The host's network primitives are reached through an
//! [`ObservationAdapter`], which lets the engine register
//! `before_send`/`on_complete` hooks. [`NetworkObserver`] is the hook set:
//! for calls that hit a registry endpoint it normalizes the response into the
//! record store and snapshots the request headers for credential extraction
//! and header replay. Calls that match nothing pass through untouched, and
//! hooks never change what the host sees.

use crate::clock::Clock;
use crate::events::CaptureOrigin;
use crate::normalizer::{normalize, try_normalize};
use crate::registry::{DataType, Registry};
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Headers never replayed on orchestrator-issued calls.
const NON_REPLAYABLE: [&str; 10] = [
    "authorization",
    "cookie",
    "host",
    "content-length",
    "content-type",
    "connection",
    "accept",
    "accept-encoding",
    "user-agent",
    "origin",
];

/// A call about to leave the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A finished call as the host saw it.
#[derive(Debug, Clone)]
pub struct CompletedExchange {
    pub request: OutboundRequest,
    pub status: u16,
    pub body: String,
}

impl CompletedExchange {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Hooks fired around every call the adapter sees.
pub trait ExchangeHooks: Send + Sync {
    fn before_send(&self, request: &OutboundRequest);
    fn on_complete(&self, exchange: &CompletedExchange);
}

/// Something that can report the host's calls to registered hooks.
pub trait ObservationAdapter: Send + Sync {
    fn register(&self, hooks: Arc<dyn ExchangeHooks>);
}

/// Plain hook list; the building block for adapters.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ExchangeHooks>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_before_send(&self, request: &OutboundRequest) {
        for hook in self.snapshot() {
            hook.before_send(request);
        }
    }

    pub fn fire_complete(&self, exchange: &CompletedExchange) {
        for hook in self.snapshot() {
            hook.on_complete(exchange);
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ExchangeHooks>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ObservationAdapter for HookRegistry {
    fn register(&self, hooks: Arc<dyn ExchangeHooks>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hooks);
    }
}

/// Request headers from the latest successful registry call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedHeaders {
    pub data_type: DataType,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub captured_at: DateTime<Utc>,
}

impl CapturedHeaders {
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
            .map(|(_, v)| v.as_str())
    }

    /// Non-credential headers to carry onto orchestrator calls.
    pub fn replayable(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(k, _)| {
                let lower = k.to_ascii_lowercase();
                !NON_REPLAYABLE.contains(&lower.as_str())
            })
            .cloned()
            .collect()
    }
}

/// Latest captured header set, shared by the observer and its readers.
#[derive(Debug, Default)]
pub struct HeaderLedger {
    latest: RwLock<Option<CapturedHeaders>>,
}

impl HeaderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, captured: CapturedHeaders) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(captured);
    }

    pub fn latest(&self) -> Option<CapturedHeaders> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replayable(&self) -> Vec<(String, String)> {
        self.latest().map(|h| h.replayable()).unwrap_or_default()
    }

    pub fn clear(&self) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Hook set that mines registry calls.
pub struct NetworkObserver {
    registry: Arc<Registry>,
    store: Arc<RecordStore>,
    ledger: Arc<HeaderLedger>,
    clock: Arc<dyn Clock>,
    /// Headers seen in `before_send`, keyed by URL, until the call completes.
    pending: DashMap<String, Vec<(String, String)>>,
}

impl NetworkObserver {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<RecordStore>,
        ledger: Arc<HeaderLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            ledger,
            clock,
            pending: DashMap::new(),
        }
    }

    /// Register this observer's hooks with an adapter.
    pub fn attach(self: &Arc<Self>, adapter: &dyn ObservationAdapter) {
        adapter.register(self.clone());
    }

    pub fn ledger(&self) -> &Arc<HeaderLedger> {
        &self.ledger
    }
}

impl ExchangeHooks for NetworkObserver {
    fn before_send(&self, request: &OutboundRequest) {
        if self.registry.match_url(&request.url).is_none() {
            return;
        }
        self.pending
            .insert(request.url.clone(), request.headers.clone());
    }

    fn on_complete(&self, exchange: &CompletedExchange) {
        let url = &exchange.request.url;
        let Some(descriptor) = self.registry.match_url(url) else {
            return;
        };
        let sent_headers = self.pending.remove(url).map(|(_, h)| h);

        if !exchange.is_success() {
            tracing::debug!(
                "observed {} call returned HTTP {}",
                descriptor.data_type,
                exchange.status
            );
            return;
        }

        let now = self.clock.now();
        let headers = if exchange.request.headers.is_empty() {
            sent_headers.unwrap_or_default()
        } else {
            exchange.request.headers.clone()
        };
        self.ledger.record(CapturedHeaders {
            data_type: descriptor.data_type,
            url: url.clone(),
            headers,
            captured_at: now,
        });

        let raw: serde_json::Value = match serde_json::from_str(&exchange.body) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("observed {} body is not JSON: {e}", descriptor.data_type);
                return;
            }
        };

        let set = match try_normalize(&raw, descriptor, now) {
            Ok(set) => set,
            Err(reason) => {
                tracing::warn!("observed {} response malformed: {reason}", descriptor.data_type);
                normalize(&raw, descriptor, now)
            }
        };
        self.store.commit(set, CaptureOrigin::Observed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::EventBus;
    use crate::snapshot::MemorySnapshotStore;
    use serde_json::json;

    const MED_URL: &str = "https://portal.example/imu/api/imue0008/imue0008s02/get-data?_=1";

    fn observer() -> (Arc<NetworkObserver>, Arc<RecordStore>, HookRegistry) {
        let store = Arc::new(RecordStore::new(
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(EventBus::new(16)),
            Arc::new(SystemClock),
            100,
        ));
        let observer = Arc::new(NetworkObserver::new(
            Arc::new(Registry::standard()),
            store.clone(),
            Arc::new(HeaderLedger::new()),
            Arc::new(SystemClock),
        ));
        let adapter = HookRegistry::new();
        observer.attach(&adapter);
        (observer, store, adapter)
    }

    fn exchange(url: &str, status: u16, body: &str) -> CompletedExchange {
        CompletedExchange {
            request: OutboundRequest::get(url)
                .with_header("Authorization", "Bearer abc.def.ghi")
                .with_header("X-Batch-Id", "batch-77")
                .with_header("Cookie", "sid=1"),
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_matching_call_is_normalized_and_headers_captured() {
        let (observer, store, adapter) = observer();
        let ex = exchange(MED_URL, 200, r#"{"rObject": [{"drug": "A"}, {"drug": "B"}]}"#);

        adapter.fire_before_send(&ex.request);
        adapter.fire_complete(&ex);

        assert_eq!(store.records(DataType::Medication).records.len(), 2);
        let captured = observer.ledger().latest().unwrap();
        assert_eq!(captured.authorization(), Some("Bearer abc.def.ghi"));
        assert_eq!(
            captured.replayable(),
            vec![("X-Batch-Id".to_string(), "batch-77".to_string())]
        );
    }

    #[test]
    fn test_non_matching_call_passes_through() {
        let (observer, store, adapter) = observer();
        let ex = exchange("https://portal.example/assets/app.js", 200, "console.log(1)");
        adapter.fire_before_send(&ex.request);
        adapter.fire_complete(&ex);

        assert!(store.all().is_empty());
        assert!(observer.ledger().latest().is_none());
    }

    #[test]
    fn test_failed_call_captures_nothing() {
        let (observer, store, adapter) = observer();
        adapter.fire_complete(&exchange(MED_URL, 401, "{}"));
        assert!(!store.contains(DataType::Medication));
        assert!(observer.ledger().latest().is_none());
    }

    #[test]
    fn test_malformed_body_records_empty_set() {
        let (_observer, store, adapter) = observer();
        adapter.fire_complete(&exchange(MED_URL, 200, r#"{"unexpected": true}"#));
        assert!(store.contains(DataType::Medication));
        assert!(store.records(DataType::Medication).records.is_empty());

        // Non-JSON body is dropped entirely
        let lab = "https://portal.example/imu/api/imue0060/imue0060s02/get-data";
        adapter.fire_complete(&exchange(lab, 200, "<html>"));
        assert!(!store.contains(DataType::LabResults));
    }

    #[test]
    fn test_headers_from_before_send_used_when_exchange_has_none() {
        let (observer, _store, adapter) = observer();
        let request = OutboundRequest::get(MED_URL).with_header("authorization", "Bearer x.y.z");
        adapter.fire_before_send(&request);
        adapter.fire_complete(&CompletedExchange {
            request: OutboundRequest::get(MED_URL),
            status: 200,
            body: json!({"rObject": []}).to_string(),
        });
        assert_eq!(
            observer.ledger().latest().unwrap().authorization(),
            Some("Bearer x.y.z")
        );
    }
}
