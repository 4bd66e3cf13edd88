// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Credential extraction.
//!
//! ## Source order
//!
//! 1. The `Authorization` header of the latest observed registry call
//! 2. Named keys in session storage
//! 3. Bearer values embedded in inline page scripts
//! 4. Named keys in local storage (claims required)
//!
//! Every candidate is shape-checked. Tokens that decode as a JWT must not be
//! expired and, when a subject identity is known, must carry a matching
//! subject claim. A rejected candidate is logged and the search moves on.
//! A header-sourced credential is reused for a few seconds to avoid
//! re-deriving it for every call in the same burst.

use crate::clock::Clock;
use crate::config::CredentialConfig;
use crate::observer::HeaderLedger;
use crate::page::HostPage;
use crate::session::SessionIdentity;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Minimum plausible token length.
const MIN_TOKEN_LEN: usize = 16;

/// Where a credential was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CredentialSource {
    CapturedHeader,
    SessionStorage { key: String },
    PageScript,
    LocalStorage { key: String },
}

/// A bearer credential and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedCredential {
    pub token: String,
    pub source: CredentialSource,
    pub captured_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CapturedCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Claims the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub expires_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
}

/// Decodes the payload portion of a JWT token.
fn decode_jwt_payload(token: &str) -> Option<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    // Some issuers pad the base64url payload
    let payload = parts[1].trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Read expiry and subject from a JWT. `None` for opaque tokens.
pub fn decode_claims(token: &str, subject_keys: &[String]) -> Option<TokenClaims> {
    let payload = decode_jwt_payload(token)?;
    let obj = payload.as_object()?;

    let expires_at = obj
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    let subject = subject_keys.iter().find_map(|key| match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    });

    Some(TokenClaims {
        expires_at,
        subject,
    })
}

/// Strip quoting and a `Bearer ` prefix; `None` if the result is not token-shaped.
fn clean_token(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(value) {
        return clean_token(&inner);
    }
    if value
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
    {
        value = value[7..].trim();
    }

    let well_formed = value.len() >= MIN_TOKEN_LEN
        && value.chars().all(|c| c.is_ascii_graphic() && c != '"' && c != '\'');
    well_formed.then(|| value.to_string())
}

fn script_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#"(?i)bearer\s+([A-Za-z0-9\-_=]+\.[A-Za-z0-9\-_=]+\.[A-Za-z0-9\-_=+/]*)"#)
                .expect("bearer regex is valid"),
            Regex::new(
                r#"(?i)["']?(?:access_?token|auth_?token|jwt|token)["']?\s*[:=]\s*["']([A-Za-z0-9\-_.=+/]+)["']"#,
            )
            .expect("token assignment regex is valid"),
        ]
    })
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    Malformed,
    Expired,
    SubjectMismatch { claimed: String },
    MissingClaims,
}

/// Locates and validates a bearer credential.
pub struct CredentialExtractor {
    config: CredentialConfig,
    page: Arc<dyn HostPage>,
    headers: Arc<HeaderLedger>,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CapturedCredential>>,
}

impl CredentialExtractor {
    pub fn new(
        config: CredentialConfig,
        page: Arc<dyn HostPage>,
        headers: Arc<HeaderLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            page,
            headers,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Find a valid credential, or `None` when every source is exhausted.
    pub fn extract(&self, identity: Option<&SessionIdentity>) -> Option<CapturedCredential> {
        let now = self.clock.now();

        if let Some(cached) = self.cached_header(now) {
            if self.validate(&cached.token, &cached.source, identity, now).is_ok() {
                return Some(cached);
            }
        }

        for (raw, source) in self.candidates() {
            let Some(token) = clean_token(&raw) else {
                tracing::debug!("discarding malformed credential from {source:?}");
                continue;
            };
            match self.validate(&token, &source, identity, now) {
                Ok(claims) => {
                    let credential = CapturedCredential {
                        token,
                        source,
                        captured_at: now,
                        expires_at: claims.and_then(|c| c.expires_at),
                    };
                    if credential.source == CredentialSource::CapturedHeader {
                        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(credential.clone());
                    }
                    tracing::debug!("credential extracted from {:?}", credential.source);
                    return Some(credential);
                }
                Err(reason) => {
                    tracing::warn!("discarding credential from {source:?}: {reason:?}");
                }
            }
        }

        tracing::warn!("no credential source yielded a valid token");
        None
    }

    /// Drop the header cache so the next call re-derives.
    pub fn invalidate_cache(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn cached_header(&self, now: DateTime<Utc>) -> Option<CapturedCredential> {
        let window = Duration::milliseconds(
            i64::try_from(self.config.header_cache_ms).unwrap_or(i64::MAX),
        );
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|c| now.signed_duration_since(c.captured_at) < window)
            .cloned()
    }

    /// Raw candidate values in source priority order.
    ///
    /// Lazy so later sources are only read when earlier ones fail.
    fn candidates(&self) -> impl Iterator<Item = (String, CredentialSource)> + '_ {
        let header = std::iter::once_with(move || {
            self.headers
                .latest()
                .and_then(|h| h.authorization().map(str::to_string))
                .map(|v| (v, CredentialSource::CapturedHeader))
        })
        .flatten();

        let session = self.config.session_storage_keys.iter().filter_map(move |key| {
            self.page
                .session_storage(key)
                .map(|v| (v, CredentialSource::SessionStorage { key: key.clone() }))
        });

        let scripts = std::iter::once_with(move || self.page.inline_scripts())
            .flatten()
            .flat_map(|source| {
                script_patterns()
                    .iter()
                    .flat_map(|re| {
                        re.captures_iter(&source)
                            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .map(|token| (token, CredentialSource::PageScript));

        let local = self.config.local_storage_keys.iter().filter_map(move |key| {
            self.page
                .local_storage(key)
                .map(|v| (v, CredentialSource::LocalStorage { key: key.clone() }))
        });

        header.chain(session).chain(scripts).chain(local)
    }

    fn validate(
        &self,
        token: &str,
        source: &CredentialSource,
        identity: Option<&SessionIdentity>,
        now: DateTime<Utc>,
    ) -> Result<Option<TokenClaims>, Rejection> {
        if clean_token(token).is_none() {
            return Err(Rejection::Malformed);
        }

        let claims = decode_claims(token, &self.config.subject_claim_keys);
        let long_lived = matches!(source, CredentialSource::LocalStorage { .. });

        let Some(claims) = claims else {
            return if long_lived {
                Err(Rejection::MissingClaims)
            } else {
                Ok(None)
            };
        };

        match claims.expires_at {
            Some(exp) if exp <= now => return Err(Rejection::Expired),
            None if long_lived => return Err(Rejection::MissingClaims),
            _ => {}
        }

        if let (Some(identity), Some(claimed)) = (identity, claims.subject.as_deref()) {
            if identity.is_subject() && identity.fingerprint != claimed {
                return Err(Rejection::SubjectMismatch {
                    claimed: claimed.to_string(),
                });
            }
        }

        Ok(Some(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::observer::CapturedHeaders;
    use crate::page::StaticPage;
    use crate::registry::DataType;
    use crate::session::DerivationMethod;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn jwt(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    fn valid_jwt(subject: &str) -> String {
        let exp = (start() + Duration::hours(1)).timestamp();
        jwt(&format!(r#"{{"patientId":"{subject}","exp":{exp}}}"#))
    }

    fn expired_jwt() -> String {
        let exp = (start() - Duration::hours(1)).timestamp();
        jwt(&format!(r#"{{"exp":{exp}}}"#))
    }

    fn extractor(page: StaticPage, ledger: Arc<HeaderLedger>, clock: &ManualClock) -> CredentialExtractor {
        CredentialExtractor::new(
            CredentialConfig::default(),
            Arc::new(page),
            ledger,
            Arc::new(clock.clone()),
        )
    }

    fn record_header(ledger: &HeaderLedger, value: &str) {
        ledger.record(CapturedHeaders {
            data_type: DataType::Medication,
            url: "https://portal.example/imu/api/x".to_string(),
            headers: vec![("Authorization".to_string(), value.to_string())],
            captured_at: start(),
        });
    }

    #[test]
    fn test_decode_claims() {
        let keys = vec!["patientId".to_string()];
        let claims = decode_claims(&valid_jwt("A1"), &keys).unwrap();
        assert_eq!(claims.subject.as_deref(), Some("A1"));
        assert_eq!(claims.expires_at, Some(start() + Duration::hours(1)));

        assert!(decode_claims("not-a-jwt", &keys).is_none());
        assert!(decode_claims("only.two", &keys).is_none());
        assert!(decode_claims("", &keys).is_none());
    }

    #[test]
    fn test_clean_token() {
        assert_eq!(
            clean_token("Bearer abcdefghijklmnopqrstuvwxyz").as_deref(),
            Some("abcdefghijklmnopqrstuvwxyz")
        );
        assert_eq!(
            clean_token(r#""abcdefghijklmnopqrstuvwxyz""#).as_deref(),
            Some("abcdefghijklmnopqrstuvwxyz")
        );
        assert!(clean_token("short").is_none());
        assert!(clean_token("has spaces in the middle of it").is_none());
        assert!(clean_token("").is_none());
    }

    #[test]
    fn test_header_source_wins() {
        let clock = ManualClock::new(start());
        let ledger = Arc::new(HeaderLedger::new());
        record_header(&ledger, &format!("Bearer {}", valid_jwt("A1")));
        let page = StaticPage::new().with_session_item("token", &valid_jwt("A1"));

        let cred = extractor(page, ledger, &clock).extract(None).unwrap();
        assert_eq!(cred.source, CredentialSource::CapturedHeader);
        assert_eq!(cred.expires_at, Some(start() + Duration::hours(1)));
    }

    #[test]
    fn test_falls_through_sources_in_order() {
        let clock = ManualClock::new(start());
        let ledger = Arc::new(HeaderLedger::new());

        let page = StaticPage::new().with_local_item("token", &valid_jwt("A1"));
        let cred = extractor(page, ledger.clone(), &clock).extract(None).unwrap();
        assert_eq!(
            cred.source,
            CredentialSource::LocalStorage {
                key: "token".to_string()
            }
        );

        let page = StaticPage::new()
            .with_script(&format!(r#"axios.defaults.headers.Authorization = "Bearer {}";"#, valid_jwt("A1")))
            .with_local_item("token", &valid_jwt("A1"));
        let cred = extractor(page, ledger.clone(), &clock).extract(None).unwrap();
        assert_eq!(cred.source, CredentialSource::PageScript);

        let page = StaticPage::new()
            .with_session_item("jwt", &valid_jwt("A1"))
            .with_script(r#"var token = "abcdefghijklmnopqrstuvwx";"#);
        let cred = extractor(page, ledger, &clock).extract(None).unwrap();
        assert_eq!(
            cred.source,
            CredentialSource::SessionStorage {
                key: "jwt".to_string()
            }
        );
    }

    #[test]
    fn test_expired_token_is_skipped() {
        let clock = ManualClock::new(start());
        let page = StaticPage::new()
            .with_session_item("token", &expired_jwt())
            .with_session_item("access_token", &valid_jwt("A1"));
        let cred = extractor(page, Arc::new(HeaderLedger::new()), &clock)
            .extract(None)
            .unwrap();
        assert_eq!(
            cred.source,
            CredentialSource::SessionStorage {
                key: "access_token".to_string()
            }
        );
    }

    #[test]
    fn test_subject_mismatch_is_skipped() {
        let clock = ManualClock::new(start());
        let page = StaticPage::new()
            .with_session_item("token", &valid_jwt("OLD"))
            .with_session_item("jwt", &valid_jwt("NEW"));
        let identity = SessionIdentity::new("NEW", DerivationMethod::QueryParameter);
        let cred = extractor(page, Arc::new(HeaderLedger::new()), &clock)
            .extract(Some(&identity))
            .unwrap();
        assert!(cred.token == valid_jwt("NEW"));

        // A timestamp fingerprint names no subject, so nothing is rejected
        let page = StaticPage::new().with_session_item("token", &valid_jwt("OLD"));
        let fallback = SessionIdentity::new("ts-1", DerivationMethod::TimestampFallback);
        assert!(extractor(page, Arc::new(HeaderLedger::new()), &clock)
            .extract(Some(&fallback))
            .is_some());
    }

    #[test]
    fn test_long_lived_storage_requires_claims() {
        let clock = ManualClock::new(start());
        let page = StaticPage::new().with_local_item("token", "opaque-token-without-claims");
        assert!(extractor(page, Arc::new(HeaderLedger::new()), &clock)
            .extract(None)
            .is_none());

        // The same opaque value is fine in session storage
        let page = StaticPage::new().with_session_item("token", "opaque-token-without-claims");
        assert!(extractor(page, Arc::new(HeaderLedger::new()), &clock)
            .extract(None)
            .is_some());
    }

    #[test]
    fn test_no_sources_yields_none() {
        let clock = ManualClock::new(start());
        assert!(extractor(StaticPage::new(), Arc::new(HeaderLedger::new()), &clock)
            .extract(None)
            .is_none());
    }

    #[test]
    fn test_header_credential_is_cached_briefly() {
        let clock = ManualClock::new(start());
        let ledger = Arc::new(HeaderLedger::new());
        record_header(&ledger, &format!("Bearer {}", valid_jwt("A1")));
        let ex = extractor(StaticPage::new(), ledger.clone(), &clock);

        let first = ex.extract(None).unwrap();
        ledger.clear();

        clock.advance(Duration::seconds(1));
        let second = ex.extract(None).unwrap();
        assert_eq!(first, second);

        clock.advance(Duration::seconds(5));
        assert!(ex.extract(None).is_none());
    }
}
