// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Portal transport.
//!
//! [`PortalTransport`] is the network primitive both the host and the
//! orchestrator issue calls through. [`ReqwestTransport`] is the real one.
//! It reports every status as-is; retry policy lives in the orchestrator.
//! [`ObservedTransport`] wraps any transport and doubles as the production
//! observation adapter: registered hooks see each call, and the caller gets
//! exactly what the inner transport returned.

use crate::error::{HarvestError, HarvestResult};
use crate::observer::{
    CompletedExchange, ExchangeHooks, HookRegistry, ObservationAdapter, OutboundRequest,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Response from a portal call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

impl PortalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues a single call and reports the raw outcome.
#[async_trait]
pub trait PortalTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> HarvestResult<PortalResponse>;
}

#[async_trait]
impl<T: PortalTransport + ?Sized> PortalTransport for Arc<T> {
    async fn send(&self, request: &OutboundRequest) -> HarvestResult<PortalResponse> {
        (**self).send(request).await
    }
}

/// HTTP transport over reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("chartsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self { client }
    }
}

#[async_trait]
impl PortalTransport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> HarvestResult<PortalResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| HarvestError::Transport(format!("bad method {}: {e}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .header("accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;

        Ok(PortalResponse { url, status, body })
    }
}

/// A transport whose calls are reported to registered hooks.
pub struct ObservedTransport<T> {
    inner: T,
    hooks: HookRegistry,
}

impl<T: PortalTransport> ObservedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            hooks: HookRegistry::new(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: PortalTransport> ObservationAdapter for ObservedTransport<T> {
    fn register(&self, hooks: Arc<dyn ExchangeHooks>) {
        self.hooks.register(hooks);
    }
}

#[async_trait]
impl<T: PortalTransport> PortalTransport for ObservedTransport<T> {
    async fn send(&self, request: &OutboundRequest) -> HarvestResult<PortalResponse> {
        self.hooks.fire_before_send(request);
        let result = self.inner.send(request).await;
        if let Ok(resp) = &result {
            self.hooks.fire_complete(&CompletedExchange {
                request: request.clone(),
                status: resp.status,
                body: resp.body.clone(),
            });
        }
        result
    }
}
