/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Backend health monitoring.
//!
//! Every backend endpoint gets its own monitor task that periodically runs a
//! blocking probe and publishes the result on a channel. Probe cadence
//! adapts: the interval is jittered so probes spread out, grows while a
//! backend stays down and snaps back to the base interval on the first
//! success.

pub mod provider;

use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::Endpoint;

pub use provider::{provider_for, HealthCheckProvider, HttpProvider, NoneProvider, TcpProvider};

/// Recurring health probing of one backend endpoint.
pub struct HealthCheck {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub healthy: bool,
    pub last_time_healthy: Option<Instant>,
    pub last_check: Option<Instant>,
    pub last_message: String,
    pub retention: Duration,
    pub max_retention: Duration,
    pub max_response_time: Duration,
    provider: Arc<dyn HealthCheckProvider>,
    base_retention: Duration,
}

/// One probe result as published to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckStatus {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub healthy: bool,
    pub message: String,
    pub did_change: bool,
}

impl HealthCheckStatus {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip, self.port)
    }
}

impl Display for HealthCheckStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.healthy { "UP" } else { "DOWN" };
        write!(f, "{} {}:{} - {}", sign, self.ip, self.port, self.message)
    }
}

impl HealthCheck {
    pub fn new(
        ip: Ipv4Addr,
        port: u16,
        provider: Arc<dyn HealthCheckProvider>,
        base_retention: Duration,
        max_retention: Duration,
        max_response_time: Duration,
    ) -> HealthCheck {
        HealthCheck {
            ip,
            port,
            healthy: false,
            last_time_healthy: None,
            last_check: None,
            last_message: String::new(),
            retention: base_retention,
            max_retention,
            max_response_time,
            provider,
            base_retention,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Run one probe and update state and cadence: a jittered base interval
    /// after a success, an interval that keeps growing (up to the cap) while
    /// the backend stays down.
    pub async fn check_health(&mut self) {
        let provider = self.provider.clone();
        let (message, healthy) = provider.check(self).await;

        // Jitter keeps the monitors from probing in lockstep.
        let retention = self.base_retention + self.base_retention.mul_f64(rand::random::<f64>() / 2.0);

        self.last_check = Some(Instant::now());
        self.healthy = healthy;
        self.last_message = message;

        if healthy {
            self.last_time_healthy = self.last_check;
            self.retention = retention;
        } else if self.retention < self.max_retention {
            self.retention = (self.retention + retention).min(self.max_retention);
        }
    }

    /// Start probing until `token` is cancelled. Results arrive on the
    /// returned channel; `did_change` marks the first probe and every
    /// up/down transition.
    pub fn monitor(mut self, token: CancellationToken) -> mpsc::Receiver<HealthCheckStatus> {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            debug!(endpoint = %self.address(), "started monitoring");

            loop {
                if token.is_cancelled() {
                    break;
                }

                let first = self.last_check.is_none();
                let before = self.healthy;
                self.check_health().await;

                let status = HealthCheckStatus {
                    ip: self.ip,
                    port: self.port,
                    healthy: self.healthy,
                    message: self.last_message.clone(),
                    did_change: first || before != self.healthy,
                };

                if tx.send(status).await.is_err() {
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.retention) => {}
                }
            }

            debug!(endpoint = %self.address(), "stopped monitoring");
        });

        rx
    }
}
