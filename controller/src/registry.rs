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

//! The desired-state registry: every loadbalancer the controller should
//! realize, keyed by `proto://ip:port` of the input endpoint.
//!
//! The registry stores copies. Producers keep mutating their own records
//! (the health updater does so on every status change) and must not be able
//! to tear a record out from under a running sync.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use common::Loadbalancer;

#[derive(Default)]
pub struct Registry {
    loadbalancers: Mutex<HashMap<String, Loadbalancer>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Insert or update `lb`, bumping its generation so the reconciler
    /// replaces the kernel chain. A loadbalancer without outputs cannot be
    /// realized and is removed instead.
    pub fn upsert(&self, lb: &Loadbalancer) {
        let mut map = self.loadbalancers.lock();

        if lb.outputs.is_empty() {
            debug!(key = %lb.key(), "loadbalancer has no outputs left, dropping it");
            map.remove(&lb.key());
            return;
        }

        let mut copy = lb.clone();
        copy.mark_updated();
        map.insert(lb.key(), copy);
    }

    /// Remove `lb` from the registry. The reconciler tears down its kernel
    /// state on the next tick.
    pub fn delete(&self, lb: &Loadbalancer) {
        self.loadbalancers.lock().remove(&lb.key());
    }

    /// Store `lb` exactly as given, preserving its generation. For seeding a
    /// known state.
    pub fn insert(&self, lb: Loadbalancer) {
        self.loadbalancers.lock().insert(lb.key(), lb);
    }

    pub fn get(&self, key: &str) -> Option<Loadbalancer> {
        self.loadbalancers.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.loadbalancers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loadbalancers.lock().is_empty()
    }

    /// Lock the whole map for the duration of one sync. Upserts and deletes
    /// block until the sync finishes, which is what makes a sync atomic with
    /// respect to registry mutations.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, Loadbalancer>> {
        self.loadbalancers.lock()
    }
}
