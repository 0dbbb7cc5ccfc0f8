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

//! The reconciliation controller for the iptables loadbalancer.
//!
//! The controller never owns the kernel state it manipulates: every sync
//! re-reads the live tables through the netfilter driver, diffs them against
//! the desired-state registry and issues the minimal set of primitive rule
//! mutations required to converge. All of the metadata the controller needs
//! about one of its chains (protocol, input endpoint, generation, lifecycle
//! state, content hash) travels inside the chain's name, so the kernel table
//! itself is the persistent record.

pub mod chain_id;
pub mod consts;
pub mod content_hash;
pub mod metrics;
pub mod netfilter;
pub mod reconciler;
pub mod registry;
pub mod rules;
pub mod scheduler;

use thiserror::Error;

pub use chain_id::{ChainId, ChainIdError, ChainState};
pub use netfilter::{DriverError, ExecDriver, NetfilterDriver, Table};
pub use reconciler::Controller;
pub use registry::Registry;
pub use scheduler::Scheduler;

#[derive(Error, Debug)]
pub enum Error {
    #[error("netfilter driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("invalid chain name: {0}")]
    ChainId(#[from] ChainIdError),
    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
