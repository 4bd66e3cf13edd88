// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only access to the host page.
//!
//! Credential extraction and session fingerprinting both need to peek at the
//! page: its storage areas, inline scripts, current URL and DOM. [`HostPage`]
//! is that seam; [`StaticPage`] is a snapshot-backed implementation used by
//! the CLI and tests.

use std::collections::HashMap;
use std::sync::RwLock;

/// What the engine may read from the page it is embedded in.
pub trait HostPage: Send + Sync {
    /// Value under `key` in short-lived, page-scoped storage.
    fn session_storage(&self, key: &str) -> Option<String>;
    /// Value under `key` in long-lived, page-scoped storage.
    fn local_storage(&self, key: &str) -> Option<String>;
    /// Source text of every inline script on the page.
    fn inline_scripts(&self) -> Vec<String>;
    /// The page's current URL.
    fn location(&self) -> Option<String>;
    /// Serialized DOM.
    fn document_html(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct PageState {
    session_storage: HashMap<String, String>,
    local_storage: HashMap<String, String>,
    scripts: Vec<String>,
    location: Option<String>,
    html: Option<String>,
}

/// An in-memory page whose contents can be replaced as the host navigates.
#[derive(Debug, Default)]
pub struct StaticPage {
    state: RwLock<PageState>,
}

impl StaticPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(self, url: &str) -> Self {
        self.set_location(url);
        self
    }

    pub fn with_session_item(self, key: &str, value: &str) -> Self {
        self.set_session_item(key, value);
        self
    }

    pub fn with_local_item(self, key: &str, value: &str) -> Self {
        self.write(|s| {
            s.local_storage.insert(key.to_string(), value.to_string());
        });
        self
    }

    pub fn with_script(self, source: &str) -> Self {
        self.write(|s| s.scripts.push(source.to_string()));
        self
    }

    pub fn with_html(self, html: &str) -> Self {
        self.write(|s| s.html = Some(html.to_string()));
        self
    }

    /// Simulate navigation.
    pub fn set_location(&self, url: &str) {
        self.write(|s| s.location = Some(url.to_string()));
    }

    pub fn set_session_item(&self, key: &str, value: &str) {
        self.write(|s| {
            s.session_storage.insert(key.to_string(), value.to_string());
        });
    }

    pub fn remove_session_item(&self, key: &str) {
        self.write(|s| {
            s.session_storage.remove(key);
        });
    }

    fn write(&self, f: impl FnOnce(&mut PageState)) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state);
    }

    fn read<R>(&self, f: impl FnOnce(&PageState) -> R) -> R {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&state)
    }
}

impl HostPage for StaticPage {
    fn session_storage(&self, key: &str) -> Option<String> {
        self.read(|s| s.session_storage.get(key).cloned())
    }

    fn local_storage(&self, key: &str) -> Option<String> {
        self.read(|s| s.local_storage.get(key).cloned())
    }

    fn inline_scripts(&self) -> Vec<String> {
        self.read(|s| s.scripts.clone())
    }

    fn location(&self) -> Option<String> {
        self.read(|s| s.location.clone())
    }

    fn document_html(&self) -> Option<String> {
        self.read(|s| s.html.clone())
    }
}
