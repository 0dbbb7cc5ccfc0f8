/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Probe implementations behind the [`HealthCheckProvider`] capability.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::HealthCheck;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("unknown health check provider `{0}`, available: none, tcp, http")]
    Unknown(String),
}

/// One way of probing a backend. Implementations take their time budget from
/// the owning [`HealthCheck`].
#[async_trait]
pub trait HealthCheckProvider: Send + Sync {
    /// Probe the backend once, returning a human-readable message and
    /// whether the backend counts as healthy.
    async fn check(&self, check: &HealthCheck) -> (String, bool);
}

/// Look up a provider by its flag value.
pub fn provider_for(name: &str) -> Result<Arc<dyn HealthCheckProvider>, ProviderError> {
    match name {
        "none" => Ok(Arc::new(NoneProvider)),
        "tcp" => Ok(Arc::new(TcpProvider)),
        "http" => Ok(Arc::new(HttpProvider::new())),
        other => Err(ProviderError::Unknown(other.to_string())),
    }
}

/// Assumes every backend is healthy. For backends without anything to probe.
pub struct NoneProvider;

#[async_trait]
impl HealthCheckProvider for NoneProvider {
    async fn check(&self, _check: &HealthCheck) -> (String, bool) {
        ("unknown".to_string(), true)
    }
}

/// Healthy iff a TCP connection can be established within the response-time
/// budget.
pub struct TcpProvider;

#[async_trait]
impl HealthCheckProvider for TcpProvider {
    async fn check(&self, check: &HealthCheck) -> (String, bool) {
        let connect = TcpStream::connect((check.ip, check.port));
        match tokio::time::timeout(check.max_response_time, connect).await {
            Ok(Ok(_stream)) => ("success".to_string(), true),
            Ok(Err(e)) => (e.to_string(), false),
            Err(_) => (
                format!("timeout connecting to {}", check.address()),
                false,
            ),
        }
    }
}

/// Healthy iff `GET /healthz` answers with a 2xx within the response-time
/// budget.
pub struct HttpProvider {
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new() -> HttpProvider {
        HttpProvider {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        HttpProvider::new()
    }
}

#[async_trait]
impl HealthCheckProvider for HttpProvider {
    async fn check(&self, check: &HealthCheck) -> (String, bool) {
        let url = format!("http://{}/healthz", check.address());

        let response = self
            .client
            .get(&url)
            .timeout(check.max_response_time)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => ("success".to_string(), true),
            Ok(resp) => (format!("status code is `{}`", resp.status().as_u16()), false),
            Err(e) => (e.to_string(), false),
        }
    }
}
