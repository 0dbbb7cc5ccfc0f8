/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Prometheus metrics and the `/metrics` listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

pub struct Metrics {
    pub errors_total: IntCounter,
    pub lb_total: IntCounter,
    pub lb_healthy: IntGauge,
    pub lb_healthy_endpoints: IntGaugeVec,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        let errors_total = IntCounter::with_opts(
            Opts::new("errors_total", "Total number of errors happened.").subsystem("general"),
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let lb_total = IntCounter::with_opts(
            Opts::new("lb_total", "Amount of total configured loadbalancers.").subsystem("general"),
        )?;
        registry.register(Box::new(lb_total.clone()))?;

        let lb_healthy = IntGauge::with_opts(
            Opts::new("lb_healthy", "Amount of healthy loadbalancers.").subsystem("general"),
        )?;
        registry.register(Box::new(lb_healthy.clone()))?;

        let lb_healthy_endpoints = IntGaugeVec::new(
            Opts::new(
                "lb_healthy_endpoints",
                "Loadbalancers with amount of healthy endpoints.",
            )
            .subsystem("general"),
            &["lb"],
        )?;
        registry.register(Box::new(lb_healthy_endpoints.clone()))?;

        Ok(Metrics {
            errors_total,
            lb_total,
            lb_healthy,
            lb_healthy_endpoints,
            registry,
        })
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    /// Serve `/metrics` on all interfaces. Runs until the process exits.
    pub async fn serve(self: Arc<Metrics>, port: u16) -> std::io::Result<()> {
        let app = Router::new()
            .route("/metrics", get(render_handler))
            .with_state(self);

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "metrics listener started");
        axum::serve(listener, app).await
    }
}

async fn render_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}
