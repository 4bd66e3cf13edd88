// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fetch orchestration.
//!
//! One [`FetchOrchestrator`] exists per subject session and owns every piece
//! of mutable state: the credential cache, the session tracker, the pending
//! request set and the batch flag.
//!
//! There is no cancellation. Invalidation and explicit clears bump a
//! generation counter instead; a fetch that settles under an older generation
//! keeps its pending slot until it returns, then drops its result.
//!
//! ## Batch pipeline
//!
//! `Idle → MenuFetch → FanOut → Aggregating → Completed | Failed`
//!
//! 1. Reject if a batch is already running.
//! 2. Extract a credential and compute the session fingerprint; invalidate
//!    stale state if the subject changed.
//! 3. Fast path: primary data type already captured for this subject →
//!    one `Skipped` completion, no calls.
//! 4. No credential → one `Failed` completion and `NoCredential`.
//! 5. Menu fetch (best effort) yields the authorization set; failure means
//!    fail-open.
//! 6. Every other type is fetched concurrently. Types gated out by the
//!    authorization set resolve to `nodata` without a call.
//! 7. All outcomes settle, then exactly one completion is broadcast.

use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::credentials::{CapturedCredential, CredentialExtractor};
use crate::error::{HarvestError, HarvestResult};
use crate::events::{BatchCompletion, BatchStatus, CaptureOrigin, EventBus, FetchOutcome, HarvestEvent};
use crate::normalizer::{authorization_set, normalize, try_normalize, NormalizedRecordSet};
use crate::observer::{HeaderLedger, NetworkObserver, ObservationAdapter, OutboundRequest};
use crate::page::HostPage;
use crate::registry::{DataType, DataTypeDescriptor, Registry};
use crate::session::{compute_fingerprint, page_identity, Invalidation, SessionIdentity, SessionTracker};
use crate::snapshot::SnapshotStore;
use crate::store::RecordStore;
use crate::transport::PortalTransport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Event bus buffer.
const EVENT_CAPACITY: usize = 256;

/// Where the current (or last) batch is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchPhase {
    Idle,
    MenuFetch,
    FanOut,
    Aggregating,
    Completed,
    Failed,
}

/// External pieces the orchestrator is wired to.
pub struct Collaborators {
    /// Used for orchestrator-issued calls; not the observed host transport.
    pub transport: Arc<dyn PortalTransport>,
    pub page: Arc<dyn HostPage>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub clock: Arc<dyn Clock>,
}

/// Holds the batch flag for the life of one run.
struct BatchGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Holds a data type's pending slot for the life of one fetch.
struct PendingGuard<'a> {
    pending: &'a DashMap<DataType, u64>,
    data_type: DataType,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.pending
            .remove_if(&self.data_type, |_, held| *held == generation);
    }
}

/// The acquisition state machine.
pub struct FetchOrchestrator {
    config: Arc<HarvestConfig>,
    registry: Arc<Registry>,
    transport: Arc<dyn PortalTransport>,
    page: Arc<dyn HostPage>,
    clock: Arc<dyn Clock>,
    ledger: Arc<HeaderLedger>,
    observer: Arc<NetworkObserver>,
    extractor: CredentialExtractor,
    tracker: SessionTracker,
    store: Arc<RecordStore>,
    /// Data type -> generation the outstanding fetch started under.
    pending: DashMap<DataType, u64>,
    generation: AtomicU64,
    batch_in_progress: AtomicBool,
    phase: Mutex<BatchPhase>,
}

impl FetchOrchestrator {
    pub fn new(config: HarvestConfig, registry: Registry, parts: Collaborators) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new(EVENT_CAPACITY));
        let store = Arc::new(RecordStore::new(
            parts.snapshots.clone(),
            bus,
            parts.clock.clone(),
            config.snapshot_record_limit,
        ));
        let ledger = Arc::new(HeaderLedger::new());
        let observer = Arc::new(NetworkObserver::new(
            registry.clone(),
            store.clone(),
            ledger.clone(),
            parts.clock.clone(),
        ));
        let extractor = CredentialExtractor::new(
            config.credentials.clone(),
            parts.page.clone(),
            ledger.clone(),
            parts.clock.clone(),
        );
        let tracker = SessionTracker::new(
            config.invalidation_cooldown_ms,
            parts.clock.clone(),
            parts.snapshots.clone(),
        );

        Self {
            config,
            registry,
            transport: parts.transport,
            page: parts.page,
            clock: parts.clock,
            ledger,
            observer,
            extractor,
            tracker,
            store,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
            batch_in_progress: AtomicBool::new(false),
            phase: Mutex::new(BatchPhase::Idle),
        }
    }

    /// Start passively observing the host's calls through `adapter`.
    pub fn attach(&self, adapter: &dyn ObservationAdapter) {
        self.observer.attach(adapter);
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.store.subscribe()
    }

    pub fn phase(&self) -> BatchPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_batch_in_progress(&self) -> bool {
        self.batch_in_progress.load(Ordering::Acquire)
    }

    /// Whether a fetch for `data_type` is outstanding.
    pub fn is_pending(&self, data_type: DataType) -> bool {
        self.pending.contains_key(&data_type)
    }

    /// Retire every in-flight fetch; their results will not be committed.
    fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn set_phase(&self, phase: BatchPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn begin_batch(&self) -> HarvestResult<BatchGuard<'_>> {
        self.batch_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| HarvestError::BatchInProgress)?;
        Ok(BatchGuard {
            flag: &self.batch_in_progress,
        })
    }

    /// Atomic check-and-set of the pending slot.
    ///
    /// A retired fetch still holds its slot until it returns, so at most one
    /// request per type is ever on the wire.
    fn acquire(&self, data_type: DataType) -> HarvestResult<PendingGuard<'_>> {
        match self.pending.entry(data_type) {
            Entry::Occupied(_) => Err(HarvestError::RequestInProgress(data_type)),
            Entry::Vacant(slot) => {
                let generation = self.generation.load(Ordering::Acquire);
                slot.insert(generation);
                Ok(PendingGuard {
                    pending: &self.pending,
                    data_type,
                    generation,
                })
            }
        }
    }

    /// Re-derive credential and fingerprint.
    fn current_identity(&self) -> (Option<CapturedCredential>, SessionIdentity) {
        let hint = page_identity(self.page.as_ref(), &self.config.session);
        let credential = self.extractor.extract(hint.as_ref());
        let identity = compute_fingerprint(
            credential.as_ref(),
            self.page.as_ref(),
            &self.config,
            self.clock.as_ref(),
        );
        (credential, identity)
    }

    /// Apply a tracker decision to the store.
    fn apply_invalidation(&self, decision: &Invalidation, identity: &SessionIdentity) {
        match decision {
            Invalidation::Invalidated { previous } => {
                tracing::info!(
                    "subject changed ({previous} -> {}); invalidating",
                    identity.fingerprint
                );
                self.advance_generation();
                self.store.clear_all();
                self.extractor.invalidate_cache();
                self.store.bus().emit(HarvestEvent::SessionInvalidated {
                    previous: previous.clone(),
                    current: identity.fingerprint.clone(),
                });
            }
            Invalidation::DeferredBatchInProgress => return,
            Invalidation::Initial
            | Invalidation::Unchanged
            | Invalidation::SuppressedByCooldown { .. } => {}
        }
        self.store.set_subject(&identity.fingerprint);
    }

    /// Navigation trigger: re-check the subject without fetching.
    pub fn on_navigation(&self) -> Invalidation {
        let (_, identity) = self.current_identity();
        let decision = self
            .tracker
            .observe(&identity, self.is_batch_in_progress());
        self.apply_invalidation(&decision, &identity);
        decision
    }

    /// Explicit clear: drop every record set and forget the subject.
    pub fn clear_all(&self) {
        self.advance_generation();
        self.store.clear_all();
        self.tracker.reset();
        self.extractor.invalidate_cache();
        self.ledger.clear();
    }

    /// Run one full batch.
    pub async fn run_batch(&self) -> HarvestResult<BatchCompletion> {
        let _batch = self.begin_batch()?;
        let batch_id = uuid::Uuid::new_v4().to_string();

        let (credential, identity) = self.current_identity();
        let decision = self.tracker.observe(&identity, false);
        self.apply_invalidation(&decision, &identity);

        let primary = self.config.primary_data_type;
        if self.store.captured_under(primary) == Some(Some(identity.fingerprint.clone())) {
            tracing::info!("{primary} already current for {}; skipping batch", identity.fingerprint);
            let completion = self.finish(batch_id, BatchStatus::Skipped, &identity, Vec::new());
            self.set_phase(BatchPhase::Completed);
            return Ok(completion);
        }

        let Some(credential) = credential else {
            self.set_phase(BatchPhase::Failed);
            self.finish(
                batch_id,
                BatchStatus::Failed {
                    reason: HarvestError::NoCredential.to_string(),
                },
                &identity,
                Vec::new(),
            );
            return Err(HarvestError::NoCredential);
        };

        self.store.bus().emit(HarvestEvent::BatchStarted {
            batch_id: batch_id.clone(),
            fingerprint: identity.fingerprint.clone(),
        });

        self.set_phase(BatchPhase::MenuFetch);
        let authorization = self.fetch_authorization(&credential, &identity).await;

        self.set_phase(BatchPhase::FanOut);
        let descriptors: Vec<&DataTypeDescriptor> = self.registry.data_descriptors().collect();
        let width = descriptors.len().max(1);
        let outcomes: Vec<FetchOutcome> = stream::iter(descriptors)
            .map(|descriptor| self.settle(descriptor, &credential, authorization.as_ref(), &identity))
            .buffered(width)
            .collect()
            .await;

        self.set_phase(BatchPhase::Aggregating);
        let completion = self.finish(batch_id, BatchStatus::Completed, &identity, outcomes);
        self.set_phase(BatchPhase::Completed);
        Ok(completion)
    }

    fn finish(
        &self,
        batch_id: String,
        status: BatchStatus,
        identity: &SessionIdentity,
        outcomes: Vec<FetchOutcome>,
    ) -> BatchCompletion {
        let completion = BatchCompletion {
            batch_id,
            status,
            fingerprint: Some(identity.fingerprint.clone()),
            outcomes,
            finished_at: self.clock.now(),
        };
        self.store.broadcast_completion(completion.clone());
        completion
    }

    /// Menu fetch. `None` means fail-open.
    async fn fetch_authorization(
        &self,
        credential: &CapturedCredential,
        identity: &SessionIdentity,
    ) -> Option<HashSet<String>> {
        let Some(menu) = self.registry.get(DataType::Menu) else {
            tracing::debug!("registry has no menu; attempting every type");
            return None;
        };

        match self.fetch_one(menu, credential, identity).await {
            Ok(set) => {
                let granted = authorization_set(&set);
                match &granted {
                    Some(nodes) => tracing::debug!("menu grants {} node(s)", nodes.len()),
                    None => tracing::warn!("menu carried no authorization list; failing open"),
                }
                granted
            }
            Err(e) => {
                tracing::warn!("menu fetch failed ({e}); failing open");
                None
            }
        }
    }

    /// One fan-out branch; never fails.
    async fn settle(
        &self,
        descriptor: &DataTypeDescriptor,
        credential: &CapturedCredential,
        authorization: Option<&HashSet<String>>,
        identity: &SessionIdentity,
    ) -> FetchOutcome {
        let data_type = descriptor.data_type;
        if let Some(granted) = authorization {
            if !descriptor.is_authorized(granted) {
                tracing::debug!("{data_type} not authorized; skipping");
                return FetchOutcome::no_data(data_type);
            }
        }

        match self.fetch_one(descriptor, credential, identity).await {
            Ok(set) => FetchOutcome::success(data_type, set.len()),
            Err(e) => {
                tracing::warn!("{data_type} failed: {e}");
                FetchOutcome::error(data_type, e.to_string())
            }
        }
    }

    /// Fetch a single data type outside a batch.
    ///
    /// Re-checks the subject first, exactly like a navigation trigger.
    pub async fn fetch_data_type(&self, data_type: DataType) -> HarvestResult<FetchOutcome> {
        let descriptor = self
            .registry
            .get(data_type)
            .ok_or_else(|| HarvestError::UnsupportedDataType(data_type.key().to_string()))?;

        let (credential, identity) = self.current_identity();
        let decision = self
            .tracker
            .observe(&identity, self.is_batch_in_progress());
        self.apply_invalidation(&decision, &identity);
        let credential = credential.ok_or(HarvestError::NoCredential)?;
        let set = self.fetch_one(descriptor, &credential, &identity).await?;
        Ok(FetchOutcome::success(data_type, set.len()))
    }

    /// [`fetch_data_type`](Self::fetch_data_type) by wire key.
    pub async fn fetch_by_key(&self, key: &str) -> HarvestResult<FetchOutcome> {
        let data_type = self.registry.lookup(key)?.data_type;
        self.fetch_data_type(data_type).await
    }

    /// Per-type fetch: lock, request, retry on 401, normalize, commit.
    async fn fetch_one(
        &self,
        descriptor: &DataTypeDescriptor,
        credential: &CapturedCredential,
        identity: &SessionIdentity,
    ) -> HarvestResult<NormalizedRecordSet> {
        let data_type = descriptor.data_type;
        let pending = self.acquire(data_type)?;
        let max_attempts = self.config.max_retries.max(1);
        let mut credential = credential.clone();

        let mut attempt = 1;
        let response = loop {
            let request = self.build_request(descriptor, &credential)?;
            tracing::debug!("GET {} (attempt {attempt}/{max_attempts})", request.url);
            let response = self.transport.send(&request).await?;

            if response.status != 401 {
                break response;
            }
            if attempt >= max_attempts {
                return Err(HarvestError::HttpError {
                    data_type,
                    status: 401,
                });
            }

            tracing::warn!("{data_type} unauthorized; retrying ({attempt}/{max_attempts})");
            attempt += 1;
            if self.config.retry_delay_ms > 0 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
            if !self.is_current(pending.generation) {
                return Err(HarvestError::Superseded(data_type));
            }
            self.extractor.invalidate_cache();
            if let Some(fresh) = self.extractor.extract(Some(identity)) {
                credential = fresh;
            }
        };

        if !response.is_success() {
            return Err(HarvestError::HttpError {
                data_type,
                status: response.status,
            });
        }

        let now = self.clock.now();
        let set = match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(raw) => try_normalize(&raw, descriptor, now).unwrap_or_else(|reason| {
                let err = HarvestError::MalformedResponse {
                    data_type,
                    reason: reason.to_string(),
                };
                tracing::warn!("{err}");
                normalize(&raw, descriptor, now)
            }),
            Err(e) => {
                let err = HarvestError::MalformedResponse {
                    data_type,
                    reason: e.to_string(),
                };
                tracing::warn!("{err}");
                NormalizedRecordSet::empty(data_type, now)
            }
        };

        if !self.is_current(pending.generation)
            || !self
                .store
                .commit_for(set.clone(), CaptureOrigin::Fetched, &identity.fingerprint)
        {
            tracing::info!("{data_type} result for {} is stale; dropped", identity.fingerprint);
            return Err(HarvestError::Superseded(data_type));
        }
        Ok(set)
    }

    fn build_request(
        &self,
        descriptor: &DataTypeDescriptor,
        credential: &CapturedCredential,
    ) -> HarvestResult<OutboundRequest> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = url::Url::parse(&format!("{base}{}", descriptor.endpoint_fragment))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in descriptor.query.params(self.clock.now().timestamp_millis()) {
                query.append_pair(key, &value);
            }
        }

        let mut request = OutboundRequest::get(url.as_str());
        request.headers = self.ledger.replayable();
        request
            .headers
            .push(("Authorization".to_string(), credential.bearer()));
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::HarvestResult;
    use crate::events::OutcomeStatus;
    use crate::observer::{CapturedHeaders, ExchangeHooks};
    use crate::page::StaticPage;
    use crate::registry::{QueryStyle, ResponseShape};
    use crate::snapshot::MemorySnapshotStore;
    use crate::transport::PortalResponse;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use tokio::sync::Notify;

    /// Answers by endpoint fragment; unscripted calls get 404.
    #[derive(Default)]
    struct ScriptedTransport {
        routes: Mutex<HashMap<String, Vec<(u16, String)>>>,
        calls: Mutex<Vec<OutboundRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedTransport {
        fn route(&self, fragment: &str, status: u16, body: &str) {
            self.routes
                .lock()
                .unwrap()
                .entry(fragment.to_string())
                .or_default()
                .push((status, body.to_string()));
        }

        fn calls_to(&self, fragment: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.contains(fragment))
                .count()
        }
    }

    #[async_trait]
    impl PortalTransport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest) -> HarvestResult<PortalResponse> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let mut routes = self.routes.lock().unwrap();
            let reply = routes
                .iter_mut()
                .find(|(fragment, _)| request.url.contains(fragment.as_str()))
                .and_then(|(_, replies)| {
                    if replies.len() > 1 {
                        Some(replies.remove(0))
                    } else {
                        replies.first().cloned()
                    }
                });
            let (status, body) = reply.unwrap_or((404, String::new()));
            Ok(PortalResponse {
                url: request.url.clone(),
                status,
                body,
            })
        }
    }

    fn fixture_registry() -> Registry {
        Registry::from_descriptors(vec![
            DataTypeDescriptor::new(DataType::Menu, "/menu", ResponseShape::WrappedEnvelope, &[], QueryStyle::Menu),
            DataTypeDescriptor::new(DataType::Medication, "/med", ResponseShape::Array, &["1.1"], QueryStyle::ClientTimestamp),
            DataTypeDescriptor::new(DataType::Allergy, "/allergy", ResponseShape::Array, &[], QueryStyle::ClientTimestamp),
            DataTypeDescriptor::new(DataType::HepatitisPanel, "/hep", ResponseShape::Array, &["6.3"], QueryStyle::ClientTimestamp),
        ])
    }

    fn orchestrator(transport: Arc<ScriptedTransport>, page: StaticPage) -> FetchOrchestrator {
        let config = HarvestConfig {
            base_url: "https://portal.example".to_string(),
            retry_delay_ms: 0,
            ..HarvestConfig::default()
        };
        FetchOrchestrator::new(
            config,
            fixture_registry(),
            Collaborators {
                transport,
                page: Arc::new(page),
                snapshots: Arc::new(MemorySnapshotStore::new()),
                clock: Arc::new(ManualClock::new(
                    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
                )),
            },
        )
    }

    fn patient_page() -> StaticPage {
        StaticPage::new()
            .with_location("https://portal.example/imu/?pid=A123")
            .with_session_item("token", "opaque-session-token-0001")
    }

    #[tokio::test]
    async fn test_request_carries_credential_query_and_replayed_headers() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 200, r#"{"rObject":[]}"#);
        let orch = orchestrator(transport.clone(), patient_page());

        orch.observer.on_complete(&crate::observer::CompletedExchange {
            request: OutboundRequest::get("https://portal.example/allergy")
                .with_header("X-Audit-Id", "audit-9")
                .with_header("Cookie", "sid=1"),
            status: 200,
            body: r#"{"robject":[]}"#.to_string(),
        });

        orch.fetch_data_type(DataType::Medication).await.unwrap();

        let calls = transport.calls.lock().unwrap();
        let request = &calls[0];
        assert!(request.url.starts_with("https://portal.example/med?_="));
        assert_eq!(request.header("authorization"), Some("Bearer opaque-session-token-0001"));
        assert_eq!(request.header("x-audit-id"), Some("audit-9"));
        assert!(request.header("cookie").is_none());
    }

    #[tokio::test]
    async fn test_second_fetch_for_pending_type_is_rejected() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(ScriptedTransport {
            gate: Some(gate.clone()),
            ..ScriptedTransport::default()
        });
        transport.route("/med", 200, r#"{"rObject":[{"a":1}]}"#);
        let orch = orchestrator(transport.clone(), patient_page());

        let (first, second) = tokio::join!(orch.fetch_data_type(DataType::Medication), async {
            tokio::task::yield_now().await;
            assert!(orch.is_pending(DataType::Medication));
            let result = orch.fetch_data_type(DataType::Medication).await;
            gate.notify_one();
            result
        });

        assert_eq!(first.unwrap().record_count, 1);
        assert!(matches!(
            second,
            Err(HarvestError::RequestInProgress(DataType::Medication))
        ));
        assert_eq!(transport.calls_to("/med"), 1);
        assert!(!orch.is_pending(DataType::Medication));
    }

    #[tokio::test]
    async fn test_unauthorized_retries_are_bounded() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 401, "");
        let orch = orchestrator(transport.clone(), patient_page());

        let err = orch.fetch_data_type(DataType::Medication).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls_to("/med"), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 500, "");
        let orch = orchestrator(transport.clone(), patient_page());

        let err = orch.fetch_data_type(DataType::Medication).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(transport.calls_to("/med"), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_then_success() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 401, "");
        transport.route("/med", 200, r#"{"rObject":[{"a":1},{"a":2}]}"#);
        let orch = orchestrator(transport.clone(), patient_page());

        let outcome = orch.fetch_data_type(DataType::Medication).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.record_count, 2);
        assert_eq!(transport.calls_to("/med"), 2);
    }

    #[tokio::test]
    async fn test_malformed_body_is_recorded_empty() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 200, "<html>maintenance</html>");
        let orch = orchestrator(transport, patient_page());

        let outcome = orch.fetch_data_type(DataType::Medication).await.unwrap();
        assert_eq!(outcome.record_count, 0);
        assert!(orch.store().contains(DataType::Medication));
    }

    #[tokio::test]
    async fn test_unknown_key_is_unsupported() {
        let orch = orchestrator(Arc::new(ScriptedTransport::default()), patient_page());
        assert!(matches!(
            orch.fetch_by_key("imaging").await,
            Err(HarvestError::UnsupportedDataType(_))
        ));
        assert!(matches!(
            orch.fetch_by_key("nonsense").await,
            Err(HarvestError::UnsupportedDataType(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_batch_is_rejected() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(ScriptedTransport {
            gate: Some(gate.clone()),
            ..ScriptedTransport::default()
        });
        let orch = orchestrator(transport, patient_page());

        let (first, second) = tokio::join!(orch.run_batch(), async {
            tokio::task::yield_now().await;
            let result = orch.run_batch().await;
            // Release the menu call and every fan-out call
            for _ in 0..8 {
                gate.notify_one();
                tokio::task::yield_now().await;
            }
            result
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(HarvestError::BatchInProgress)));
        assert_eq!(orch.phase(), BatchPhase::Completed);
        assert!(!orch.is_batch_in_progress());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_batch_with_one_event() {
        let transport = Arc::new(ScriptedTransport::default());
        let orch = orchestrator(transport.clone(), StaticPage::new());
        let mut rx = orch.subscribe();

        let err = orch.run_batch().await.unwrap_err();
        assert!(matches!(err, HarvestError::NoCredential));
        assert_eq!(orch.phase(), BatchPhase::Failed);
        assert!(transport.calls.lock().unwrap().is_empty());

        let mut completions = 0;
        while let Ok(event) = rx.try_recv() {
            if let HarvestEvent::BatchCompleted(c) = event {
                assert!(matches!(c.status, BatchStatus::Failed { .. }));
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    /// Orchestrator over a gated transport, with the page kept for navigation.
    fn gated_orchestrator() -> (
        FetchOrchestrator,
        Arc<ScriptedTransport>,
        Arc<StaticPage>,
        Arc<Notify>,
    ) {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(ScriptedTransport {
            gate: Some(gate.clone()),
            ..ScriptedTransport::default()
        });
        let page = Arc::new(patient_page());
        let orch = FetchOrchestrator::new(
            HarvestConfig {
                retry_delay_ms: 0,
                ..HarvestConfig::default()
            },
            fixture_registry(),
            Collaborators {
                transport: transport.clone(),
                page: page.clone(),
                snapshots: Arc::new(MemorySnapshotStore::new()),
                clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap())),
            },
        );
        (orch, transport, page, gate)
    }

    #[tokio::test]
    async fn test_navigation_during_batch_defers_invalidation() {
        let (orch, transport, page, gate) = gated_orchestrator();
        transport.route("/menu", 200, r#"{"prsnAuth":["1.1"]}"#);
        transport.route("/med", 200, r#"{"rObject":[{"a":1}]}"#);

        let (batch, decision) = tokio::join!(orch.run_batch(), async {
            tokio::task::yield_now().await;
            page.set_location("https://portal.example/imu/?pid=B456");
            let decision = orch.on_navigation();
            for _ in 0..8 {
                gate.notify_one();
                tokio::task::yield_now().await;
            }
            decision
        });

        assert_eq!(decision, Invalidation::DeferredBatchInProgress);
        batch.unwrap();
        // Batch results survived the mid-batch navigation
        assert_eq!(orch.store().records(DataType::Medication).records.len(), 1);

        // The next trigger applies it
        assert!(matches!(orch.on_navigation(), Invalidation::Invalidated { .. }));
        assert!(orch.store().records(DataType::Medication).records.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_retired_by_navigation_keeps_its_slot() {
        let (orch, transport, page, gate) = gated_orchestrator();
        transport.route("/med", 200, r#"{"rObject":[{"owner":"A123"}]}"#);

        let (stale, second) = tokio::join!(orch.fetch_data_type(DataType::Medication), async {
            tokio::task::yield_now().await;
            page.set_location("https://portal.example/imu/?pid=B456");
            assert!(matches!(orch.on_navigation(), Invalidation::Invalidated { .. }));
            assert!(orch.is_pending(DataType::Medication));
            let second = orch.fetch_data_type(DataType::Medication).await;
            gate.notify_one();
            second
        });

        assert!(matches!(
            second,
            Err(HarvestError::RequestInProgress(DataType::Medication))
        ));
        assert!(matches!(stale, Err(HarvestError::Superseded(DataType::Medication))));
        assert_eq!(transport.calls_to("/med"), 1);
        assert!(!orch.is_pending(DataType::Medication));
        assert!(!orch.store().contains(DataType::Medication));
    }

    #[tokio::test]
    async fn test_clear_during_fetch_drops_result() {
        let (orch, transport, _page, gate) = gated_orchestrator();
        transport.route("/med", 200, r#"{"rObject":[{"a":1}]}"#);

        let (stale, ()) = tokio::join!(orch.fetch_data_type(DataType::Medication), async {
            tokio::task::yield_now().await;
            orch.clear_all();
            gate.notify_one();
        });

        assert!(matches!(stale, Err(HarvestError::Superseded(DataType::Medication))));
        assert!(orch.store().all().is_empty());

        // The next fetch starts a fresh generation and commits normally
        gate.notify_one();
        let outcome = orch.fetch_data_type(DataType::Medication).await.unwrap();
        assert_eq!(outcome.record_count, 1);
        assert!(orch.store().contains(DataType::Medication));
    }

    #[tokio::test]
    async fn test_clear_all_forgets_subject() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.route("/med", 200, r#"{"rObject":[{"a":1}]}"#);
        let orch = orchestrator(transport, patient_page());
        orch.ledger.record(CapturedHeaders {
            data_type: DataType::Medication,
            url: "https://portal.example/med".to_string(),
            headers: vec![("X-Audit-Id".to_string(), "1".to_string())],
            captured_at: Utc::now(),
        });
        orch.run_batch().await.unwrap();
        assert!(orch.store().contains(DataType::Medication));

        orch.clear_all();
        assert!(orch.store().all().is_empty());
        assert!(orch.ledger.latest().is_none());
        assert!(orch.tracker.last_fingerprint().is_none());
    }

    #[test]
    fn test_phase_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&BatchPhase::MenuFetch).unwrap(),
            "\"menuFetch\""
        );
    }

    #[test]
    fn test_orchestrator_is_shareable() {
        fn check<T: Send + Sync>() {}
        check::<FetchOrchestrator>();
    }
}
