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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use ipnet::Ipv4Net;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use common::{parse_endpoints, parse_protocol_endpoint, Loadbalancer};
use controller::metrics::Metrics;
use controller::{Controller, ExecDriver, Scheduler};
use health::{provider_for, HealthCheck, HealthCheckStatus};

const BASE_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(60);
const MAX_PROBE_RESPONSE_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(about = "Loadbalances TCP/UDP traffic onto backend pools by programming netfilter NAT rules")]
struct Opt {
    /// Input of a loadbalancer, e.g. "tcp://192.168.0.1:80". Repeatable.
    #[clap(short, long = "in")]
    inputs: Vec<String>,

    /// Outputs for the matching --in, e.g. "192.168.2.1:8080,192.168.2.2-255:8080".
    #[clap(short, long = "out")]
    outputs: Vec<String>,

    /// Health check for the matching --in, available: none, tcp, http.
    #[clap(long = "health-check")]
    health_checks: Vec<String>,

    /// Tick interval of the controller in seconds.
    #[clap(short, long, default_value_t = 1)]
    tick_rate: u64,

    /// Port to listen on for the metrics endpoint.
    #[clap(short = 'p', long, default_value_t = 9080)]
    metrics_port: u16,

    /// NAT-internal CIDR; sets up the hairpinning chain when given.
    #[clap(long)]
    hairpinning_cidr: Option<Ipv4Net>,
}

/// A health status update attributed to the loadbalancer owning the probed
/// backend.
struct LbHealthEvent {
    key: String,
    status: HealthCheckStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let opt = Opt::parse();

    if opt.inputs.len() != opt.outputs.len() || opt.inputs.len() != opt.health_checks.len() {
        bail!("for every --in you have to specify exactly one --out and one --health-check");
    }
    if opt.inputs.is_empty() {
        bail!("no loadbalancers specified");
    }

    let metrics = Arc::new(Metrics::new().context("couldn't set up metrics")?);
    metrics.lb_total.inc_by(opt.inputs.len() as u64);

    let driver = Arc::new(ExecDriver::new().context("couldn't initialize the iptables driver")?);
    let mut ctrl = Controller::new(driver, Some(metrics.clone()));
    if let Some(cidr) = opt.hairpinning_cidr {
        ctrl = ctrl.with_hairpinning(cidr);
    }
    let ctrl = Arc::new(ctrl);

    let shutdown = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel::<LbHealthEvent>(64);

    // The updater task below is the only owner of these records; the
    // controller's registry holds its own copies.
    let mut loadbalancers: HashMap<String, Loadbalancer> = HashMap::new();

    for ((input, outputs), health) in opt.inputs.iter().zip(&opt.outputs).zip(&opt.health_checks) {
        let (protocol, input_endpoint) = parse_protocol_endpoint(input)
            .with_context(|| format!("couldn't parse input `{input}`"))?;
        let output_endpoints = parse_endpoints(outputs)
            .with_context(|| format!("couldn't parse outputs `{outputs}`"))?;
        let provider = provider_for(health)
            .with_context(|| format!("couldn't set up health provider `{health}`"))?;

        let lb = Loadbalancer::new(protocol, input_endpoint, output_endpoints.clone());
        let key = lb.key();
        loadbalancers.insert(key.clone(), lb);

        // One monitor per backend; all of them fan into the event channel.
        for endpoint in &output_endpoints {
            let check = HealthCheck::new(
                endpoint.ip,
                endpoint.port,
                provider.clone(),
                BASE_PROBE_INTERVAL,
                MAX_PROBE_INTERVAL,
                MAX_PROBE_RESPONSE_TIME,
            );

            let mut feed = check.monitor(shutdown.child_token());
            let tx = event_tx.clone();
            let key = key.clone();
            tokio::spawn(async move {
                while let Some(status) = feed.recv().await {
                    let event = LbHealthEvent {
                        key: key.clone(),
                        status,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
    drop(event_tx);

    {
        let metrics = metrics.clone();
        let port = opt.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(port).await {
                error!(error = %e, "metrics listener stopped");
            }
        });
    }

    {
        let ctrl = ctrl.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(lb) = loadbalancers.get_mut(&event.key) else {
                    warn!(lb = %event.key, status = %event.status, "got a status update for an unconfigured loadbalancer");
                    continue;
                };

                if !event.status.did_change {
                    trace!("{}", event.status);
                    continue;
                }

                info!("{}", event.status);

                let endpoint = event.status.endpoint();
                if event.status.healthy {
                    lb.add_output(endpoint);
                } else {
                    lb.remove_output(endpoint);
                }

                ctrl.upsert_loadbalancer(lb);
            }
        });
    }

    // Let the first round of probe results land before programming any rules.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let scheduler = Scheduler::start(ctrl.clone(), Duration::from_secs(opt.tick_rate));

    tokio::signal::ctrl_c().await?;
    info!("received interrupt, shutting down");
    shutdown.cancel();
    scheduler.shutdown().await;
    info!("stopped");

    Ok(())
}
