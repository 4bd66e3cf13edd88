// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading and resolution.

use crate::error::HarvestResult;
use crate::registry::DataType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "CHARTSYNC_CONFIG";
/// Env var overriding `base_url`.
pub const BASE_URL_ENV: &str = "CHARTSYNC_BASE_URL";

/// Engine configuration. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Portal origin the registry fragments are appended to.
    pub base_url: String,
    /// Data type whose presence enables the fast path.
    pub primary_data_type: DataType,
    /// Total attempts for a data type that keeps answering 401.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Minimum spacing between two session invalidations.
    pub invalidation_cooldown_ms: u64,
    /// Per-type record cap in the persisted snapshot.
    pub snapshot_record_limit: usize,
    pub credentials: CredentialConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Short-lived page storage keys, tried in order.
    pub session_storage_keys: Vec<String>,
    /// Long-lived page storage keys, tried last.
    pub local_storage_keys: Vec<String>,
    /// How long a header-sourced credential is reused without re-extraction.
    pub header_cache_ms: u64,
    /// JWT claims carrying the subject identifier.
    pub subject_claim_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub query_param_keys: Vec<String>,
    /// CSS selectors for a subject identifier in the page DOM.
    pub dom_selectors: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            primary_data_type: DataType::Medication,
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_ms: 15_000,
            invalidation_cooldown_ms: 3000,
            snapshot_record_limit: 500,
            credentials: CredentialConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            session_storage_keys: strings(&["token", "jwt", "access_token"]),
            local_storage_keys: strings(&["token", "authToken"]),
            header_cache_ms: 3000,
            subject_claim_keys: strings(&["patientId", "pid", "idNo"]),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            query_param_keys: strings(&["patientId", "pid", "idNo"]),
            dom_selectors: strings(&["[data-patient-id]", "#patientId", ".patient-id"]),
        }
    }
}

impl HarvestConfig {
    /// Load from a JSON file, then apply env overrides.
    pub fn load(path: &Path) -> HarvestResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: HarvestConfig = serde_json::from_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Load from the resolved path, or fall back to defaults when no file exists.
    pub fn load_or_default(explicit: Option<&str>) -> HarvestResult<Self> {
        match resolve_config_path(explicit) {
            Some(path) => {
                tracing::debug!("loading config from {}", path.display());
                Self::load(&path)
            }
            None => {
                let mut config = Self::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(base) = std::env::var(BASE_URL_ENV) {
            if !base.is_empty() {
                self.base_url = base;
            }
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Resolve the config file path.
///
/// Explicit path, then `CHARTSYNC_CONFIG`, then `./.chartsync/config.json`,
/// then `~/.chartsync/config.json`. `None` when nothing exists.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from(".chartsync/config.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    let home_config = data_dir().join("config.json");
    home_config.exists().then_some(home_config)
}

/// `~/.chartsync`, or `/tmp/.chartsync` without a home directory.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".chartsync")
}
