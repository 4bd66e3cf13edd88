// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session identity tracking.
//!
//! A session fingerprint identifies the subject currently being viewed. It
//! is derived from, in priority order: a subject claim in the current
//! credential, a URL query parameter, a DOM element, and finally a
//! timestamp that guarantees uniqueness. [`SessionTracker`] compares each
//! new fingerprint against the last persisted one and decides whether stale
//! state must be invalidated.
//!
//! ## Cooldown
//!
//! Two invalidations closer together than the cooldown collapse into one.
//! A change that lands inside the window is recorded as the new fingerprint
//! without clearing state. Changes seen while a batch is running are
//! deferred: the fingerprint is left untouched so the next trigger sees the
//! change again.

use crate::clock::Clock;
use crate::config::{HarvestConfig, SessionConfig};
use crate::credentials::{decode_claims, CapturedCredential};
use crate::page::HostPage;
use crate::snapshot::{SnapshotStore, FINGERPRINT_KEY};
use chrono::{DateTime, Duration, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// How a fingerprint was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivationMethod {
    CredentialClaim,
    QueryParameter,
    DomElement,
    TimestampFallback,
}

/// Who is being viewed right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub fingerprint: String,
    pub method: DerivationMethod,
}

impl SessionIdentity {
    pub fn new(fingerprint: impl Into<String>, method: DerivationMethod) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            method,
        }
    }

    /// Whether the fingerprint names a real subject.
    pub fn is_subject(&self) -> bool {
        self.method != DerivationMethod::TimestampFallback
    }
}

/// Fingerprint inequality.
pub fn has_changed(previous: &SessionIdentity, current: &SessionIdentity) -> bool {
    previous.fingerprint != current.fingerprint
}

/// Compute the current session identity.
pub fn compute_fingerprint(
    credential: Option<&CapturedCredential>,
    page: &dyn HostPage,
    config: &HarvestConfig,
    clock: &dyn Clock,
) -> SessionIdentity {
    if let Some(subject) = credential
        .and_then(|c| decode_claims(&c.token, &config.credentials.subject_claim_keys))
        .and_then(|claims| claims.subject)
    {
        return SessionIdentity::new(subject, DerivationMethod::CredentialClaim);
    }

    if let Some(identity) = page_identity(page, &config.session) {
        return identity;
    }

    SessionIdentity::new(
        format!("ts-{}", clock.now().timestamp_millis()),
        DerivationMethod::TimestampFallback,
    )
}

/// Identity visible from the page alone (query parameter, then DOM).
pub fn page_identity(page: &dyn HostPage, config: &SessionConfig) -> Option<SessionIdentity> {
    if let Some(id) = page
        .location()
        .and_then(|loc| query_identifier(&loc, &config.query_param_keys))
    {
        return Some(SessionIdentity::new(id, DerivationMethod::QueryParameter));
    }

    page.document_html()
        .and_then(|html| dom_identifier(&html, &config.dom_selectors))
        .map(|id| SessionIdentity::new(id, DerivationMethod::DomElement))
}

/// First configured key present in the URL query or in a hash-route query.
fn query_identifier(location: &str, keys: &[String]) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if let Some((_, hash_query)) = url.fragment().and_then(|f| f.split_once('?')) {
        pairs.extend(url::form_urlencoded::parse(hash_query.as_bytes()).into_owned());
    }

    keys.iter().find_map(|key| {
        pairs
            .iter()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    })
}

fn dom_identifier(html: &str, selectors: &[String]) -> Option<String> {
    let document = Html::parse_document(html);
    selectors.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        let element = document.select(&selector).next()?;
        let value = element
            .value()
            .attr("data-patient-id")
            .or_else(|| element.value().attr("value"))
            .map(str::to_string)
            .unwrap_or_else(|| element.text().collect::<String>());
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Result of feeding a fingerprint to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Nothing was known before; the fingerprint is now recorded.
    Initial,
    Unchanged,
    /// Stale state must be dropped now.
    Invalidated { previous: String },
    /// Changed within the cooldown of the last invalidation; recorded, not cleared.
    SuppressedByCooldown { previous: String },
    /// Changed while a batch runs; left for the next trigger.
    DeferredBatchInProgress,
}

#[derive(Debug, Default)]
struct TrackerState {
    last: Option<String>,
    last_invalidation: Option<DateTime<Utc>>,
}

/// Detects subject changes against the last persisted fingerprint.
pub struct SessionTracker {
    state: Mutex<TrackerState>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl SessionTracker {
    /// Create a tracker, reloading the last persisted fingerprint.
    pub fn new(cooldown_ms: u64, clock: Arc<dyn Clock>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        let last = match snapshots.get(FINGERPRINT_KEY) {
            Ok(Some(Value::String(fp))) => Some(fp),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("could not read persisted fingerprint: {e}");
                None
            }
        };

        Self {
            state: Mutex::new(TrackerState {
                last,
                last_invalidation: None,
            }),
            cooldown: Duration::milliseconds(i64::try_from(cooldown_ms).unwrap_or(i64::MAX)),
            clock,
            snapshots,
        }
    }

    /// Compare `current` with the last fingerprint and decide what to do.
    pub fn observe(&self, current: &SessionIdentity, batch_in_progress: bool) -> Invalidation {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(previous) = state.last.clone() else {
            state.last = Some(current.fingerprint.clone());
            drop(state);
            self.persist(&current.fingerprint);
            return Invalidation::Initial;
        };
        if previous == current.fingerprint {
            return Invalidation::Unchanged;
        }

        if batch_in_progress {
            tracing::debug!("subject change deferred: batch in progress");
            return Invalidation::DeferredBatchInProgress;
        }

        let now = self.clock.now();
        let in_cooldown = state
            .last_invalidation
            .is_some_and(|at| now.signed_duration_since(at) < self.cooldown);

        state.last = Some(current.fingerprint.clone());
        let outcome = if in_cooldown {
            tracing::info!("subject change inside cooldown; not clearing");
            Invalidation::SuppressedByCooldown { previous }
        } else {
            state.last_invalidation = Some(now);
            Invalidation::Invalidated { previous }
        };
        drop(state);

        self.persist(&current.fingerprint);
        outcome
    }

    pub fn last_fingerprint(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    /// Forget the recorded fingerprint (used by an explicit clear).
    pub fn reset(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).last = None;
        if let Err(e) = self.snapshots.remove(FINGERPRINT_KEY) {
            tracing::warn!("could not remove persisted fingerprint: {e}");
        }
    }

    fn persist(&self, fingerprint: &str) {
        if let Err(e) = self
            .snapshots
            .put(FINGERPRINT_KEY, &Value::String(fingerprint.to_string()))
        {
            tracing::warn!("could not persist fingerprint: {e}");
        }
    }
}
