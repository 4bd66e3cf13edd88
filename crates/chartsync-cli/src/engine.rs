// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wiring a [`FetchOrchestrator`] from command-line options.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use chartsync::snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use chartsync::{
    Collaborators, FetchOrchestrator, HarvestConfig, Registry, ReqwestTransport, StaticPage,
    SystemClock,
};

/// Environment variable consulted when `--token` is absent.
pub const TOKEN_ENV: &str = "CHARTSYNC_TOKEN";

/// Session-storage key the CLI plants the token under.
const TOKEN_KEY: &str = "token";

/// Options shared by commands that talk to the portal.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub config: Option<String>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub page_url: Option<String>,
    pub snapshot_dir: Option<PathBuf>,
    pub ephemeral: bool,
}

/// Load config with CLI overrides applied.
pub fn load_config(options: &EngineOptions) -> anyhow::Result<HarvestConfig> {
    let mut config = HarvestConfig::load_or_default(options.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(base) = &options.base_url {
        config.base_url = base.clone();
    }
    Ok(config)
}

/// Open the snapshot store the options point at.
pub fn open_snapshots(
    dir: Option<PathBuf>,
    ephemeral: bool,
) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    if ephemeral {
        return Ok(Arc::new(MemorySnapshotStore::new()));
    }
    let store = match dir {
        Some(dir) => FileSnapshotStore::open(dir.clone())
            .with_context(|| format!("failed to open snapshot dir {}", dir.display()))?,
        None => FileSnapshotStore::default_store().context("failed to open snapshot store")?,
    };
    Ok(Arc::new(store))
}

/// Build an orchestrator against the real portal.
///
/// The host page is simulated: `--page-url` becomes its location and the
/// token is planted in session storage, so the usual extraction and
/// fingerprinting rules apply.
pub fn build(options: EngineOptions) -> anyhow::Result<FetchOrchestrator> {
    let config = load_config(&options)?;

    let token = options
        .token
        .clone()
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .filter(|t| !t.trim().is_empty());
    let mut page = StaticPage::new();
    if let Some(token) = &token {
        page = page.with_session_item(TOKEN_KEY, token);
    } else {
        tracing::warn!("no token given (--token or {TOKEN_ENV}); batches will fail");
    }
    if let Some(url) = &options.page_url {
        page = page.with_location(url);
    }

    let transport = ReqwestTransport::new(config.request_timeout());
    let snapshots = open_snapshots(options.snapshot_dir, options.ephemeral)?;
    tracing::info!("portal: {}", config.base_url);

    Ok(FetchOrchestrator::new(
        config,
        Registry::standard(),
        Collaborators {
            transport: Arc::new(transport),
            page: Arc::new(page),
            snapshots,
            clock: Arc::new(SystemClock),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"base_url": "https://from-file.example", "max_retries": 5}"#)
            .unwrap();

        let options = EngineOptions {
            config: Some(path.to_string_lossy().into_owned()),
            base_url: Some("https://from-flag.example".to_string()),
            ..EngineOptions::default()
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.base_url, "https://from-flag.example");
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let options = EngineOptions {
            config: Some("/nonexistent/chartsync.json".to_string()),
            ..EngineOptions::default()
        };
        assert!(load_config(&options).is_err());
    }

    #[test]
    fn test_snapshot_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("snapshots");
        let store = open_snapshots(Some(target.clone()), false).unwrap();
        assert!(target.is_dir());
        assert!(store.keys().unwrap().is_empty());
    }
}
