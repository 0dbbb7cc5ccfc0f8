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

//! The reconciler: one `sync()` walks a fixed pipeline of tasks, each of
//! which re-observes the live tables and performs one class of mutation.
//!
//! Task order is load-bearing. New chains and their jumps are installed
//! before old jumps and chains are removed, so an input never passes through
//! a window without a working rule. Reordering the pipeline (in particular
//! putting jump removal before jump installation) breaks that guarantee.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, error, info, trace, warn};

use common::Loadbalancer;

use crate::chain_id::{ChainId, ChainState};
use crate::consts::{FORWARD_CHAIN, HAIRPIN_CHAIN, MAIN_CHAIN};
use crate::content_hash::content_hash;
use crate::metrics::Metrics;
use crate::netfilter::{NetfilterDriver, Table};
use crate::registry::Registry;
use crate::rules;
use crate::{Error, Result};

type Loadbalancers = HashMap<String, Loadbalancer>;
type LbChains = HashMap<String, Vec<ChainId>>;

/// One task of the sync pipeline. Every task gets a fresh observation of the
/// nat table (chain listing, parsed chain identities, chains grouped by
/// owning loadbalancer) so that it never acts on state a previous task
/// already changed.
type Task = fn(&Controller, &[String], &[ChainId], &LbChains, &mut Loadbalancers);

pub struct Controller {
    driver: Arc<dyn NetfilterDriver>,
    registry: Registry,
    metrics: Option<Arc<Metrics>>,
    main_chain: String,
    forward_chain: String,
    hairpin_cidr: Option<Ipv4Net>,
}

impl Controller {
    pub fn new(driver: Arc<dyn NetfilterDriver>, metrics: Option<Arc<Metrics>>) -> Controller {
        Controller {
            driver,
            registry: Registry::new(),
            metrics,
            main_chain: MAIN_CHAIN.to_string(),
            forward_chain: FORWARD_CHAIN.to_string(),
            hairpin_cidr: None,
        }
    }

    /// Enable the hairpinning chain hook for a NAT-internal CIDR.
    pub fn with_hairpinning(mut self, cidr: Ipv4Net) -> Controller {
        self.hairpin_cidr = Some(cidr);
        self
    }

    /// Insert or update a loadbalancer; a record without outputs is removed.
    pub fn upsert_loadbalancer(&self, lb: &Loadbalancer) {
        self.registry.upsert(lb);
    }

    /// Remove a loadbalancer; its chains and rules are torn down on the next
    /// sync.
    pub fn delete_loadbalancer(&self, lb: &Loadbalancer) {
        self.registry.delete(lb);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one full reconciliation. Holds the registry lock for the whole
    /// pipeline; concurrent upserts block until it returns.
    pub fn sync(&self) {
        let mut lbs = self.registry.lock();

        let tasks: &[(&str, Task)] = &[
            ("delete_chains_stuck_in_creation", Controller::delete_chains_stuck_in_creation),
            ("refresh_tampered_loadbalancers", Controller::refresh_tampered_loadbalancers),
            ("ensure_forward_chain_exists", Controller::ensure_forward_chain_exists),
            ("ensure_forward_chain_entries", Controller::ensure_forward_chain_entries),
            ("ensure_main_chain_exists", Controller::ensure_main_chain_exists),
            ("ensure_hairpin_chain_exists", Controller::ensure_hairpin_chain_exists),
            ("ensure_chains", Controller::ensure_chains),
            ("ensure_main_chain_entries", Controller::ensure_main_chain_entries),
            ("delete_obsolete_main_chain_entries", Controller::delete_obsolete_main_chain_entries),
            ("delete_obsolete_chains", Controller::delete_obsolete_chains),
            ("delete_obsolete_forward_chain_entries", Controller::delete_obsolete_forward_chain_entries),
        ];

        for (name, task) in tasks {
            trace!(task = name, "starting task");

            // Always observe the live table instead of trusting anything a
            // previous task (or an external actor) left behind.
            let all_chains = match self.driver.list_chains(Table::Nat) {
                Ok(chains) => chains,
                Err(e) => {
                    error!(task = name, error = %e, "couldn't list chains in the nat table");
                    self.count_error();
                    continue;
                }
            };

            let chain_ids = find_chain_ids(&all_chains);
            let lb_to_chains = map_lb_to_chains(&chain_ids, &lbs);

            task(self, &all_chains, &chain_ids, &lb_to_chains, &mut lbs);

            trace!(task = name, "finished task");
        }

        if let Some(metrics) = &self.metrics {
            metrics.lb_healthy.set(lbs.len() as i64);
            for (key, lb) in lbs.iter() {
                metrics
                    .lb_healthy_endpoints
                    .with_label_values(&[key])
                    .set(lb.outputs.len() as i64);
            }
        }
    }

    fn count_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.errors_total.inc();
        }
    }

    /// A chain still in `Creating` is debris from an aborted run; it was
    /// never referenced by the main chain and can go away immediately.
    fn delete_chains_stuck_in_creation(
        &self,
        _all_chains: &[String],
        chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        for chain in chain_ids {
            if chain.state != ChainState::Creating {
                continue;
            }

            warn!(chain = %chain, lb = %chain.loadbalancer_key(), "chain stuck in creation, deleting it");
            if let Err(e) = self.delete_chain(chain) {
                error!(error = %e, "couldn't clean up chain stuck in creation");
                self.count_error();
            }
        }
    }

    /// Re-hash every live loadbalancer's chains and compare against the hash
    /// embedded in the name. A mismatch means somebody edited the chain;
    /// bumping the generation makes `ensure_chains` build a replacement in
    /// this same sync.
    fn refresh_tampered_loadbalancers(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        lb_to_chains: &LbChains,
        lbs: &mut Loadbalancers,
    ) {
        for (key, chains) in lb_to_chains {
            if !lbs.contains_key(key) {
                trace!(lb = %key, "skipping content hash validation, loadbalancer is deleted anyways");
                continue;
            }

            for chain in chains {
                let rules = match self.driver.list_rules(Table::Nat, &chain.to_string()) {
                    Ok(rules) => rules,
                    Err(e) => {
                        error!(chain = %chain, error = %e, "couldn't retrieve rules");
                        self.count_error();
                        continue;
                    }
                };

                if content_hash(&rules) != chain.content_hash {
                    warn!(
                        chain = %chain,
                        lb = %key,
                        "chain got manipulated, content hash doesn't match anymore, marking loadbalancer updated so it gets recreated"
                    );
                    if let Some(lb) = lbs.get_mut(key) {
                        lb.mark_updated();
                    }
                }
            }
        }
    }

    fn ensure_forward_chain_exists(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        let chains = match self.driver.list_chains(Table::Filter) {
            Ok(chains) => chains,
            Err(e) => {
                error!(error = %e, "couldn't list chains in the filter table");
                self.count_error();
                return;
            }
        };

        if chains.iter().any(|c| *c == self.forward_chain) {
            debug!("forward chain already exists");
            return;
        }

        if let Err(e) = self.driver.new_chain(Table::Filter, &self.forward_chain) {
            error!(error = %e, "couldn't create the forward chain");
            self.count_error();
            return;
        }
        info!(chain = %self.forward_chain, "created forward chain");
    }

    /// Every backend needs a pair of ACCEPT entries in the forward chain,
    /// one per traffic direction. Existing entries are left alone.
    fn ensure_forward_chain_entries(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        lbs: &mut Loadbalancers,
    ) {
        let listed = match self.driver.list_rules(Table::Filter, &self.forward_chain) {
            Ok(rules) => rules,
            Err(e) => {
                error!(chain = %self.forward_chain, error = %e, "couldn't retrieve forward chain rules");
                self.count_error();
                return;
            }
        };

        for (key, lb) in lbs.iter() {
            for output in &lb.outputs {
                for rule in [
                    rules::forward_src_rule(lb.protocol, output),
                    rules::forward_dst_rule(lb.protocol, output),
                ] {
                    if rules::rules_contain_rule(&listed, &rule) {
                        continue;
                    }

                    match self.driver.append_rule(Table::Filter, &self.forward_chain, &rule) {
                        Ok(()) => info!(lb = %key, output = %output, rule = %rule, "added forward rule"),
                        Err(e) => {
                            error!(lb = %key, output = %output, error = %e, "couldn't create forward rule");
                            self.count_error();
                        }
                    }
                }
            }
        }
    }

    fn ensure_main_chain_exists(
        &self,
        all_chains: &[String],
        _chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        if all_chains.iter().any(|c| *c == self.main_chain) {
            debug!("main chain already exists");
            return;
        }

        if let Err(e) = self.driver.new_chain(Table::Nat, &self.main_chain) {
            error!(error = %e, "couldn't create the main chain");
            self.count_error();
            return;
        }
        info!(chain = %self.main_chain, "created main chain");
    }

    /// Hairpinning hook: with a NAT-internal CIDR configured, the well-known
    /// hairpinning chain has to exist so the operator can jump into it. Its
    /// rules are not managed here.
    fn ensure_hairpin_chain_exists(
        &self,
        all_chains: &[String],
        _chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        let Some(cidr) = self.hairpin_cidr else {
            return;
        };

        if all_chains.iter().any(|c| c == HAIRPIN_CHAIN) {
            debug!("hairpin chain already exists");
            return;
        }

        if let Err(e) = self.driver.new_chain(Table::Nat, HAIRPIN_CHAIN) {
            error!(error = %e, "couldn't create the hairpin chain");
            self.count_error();
            return;
        }
        info!(chain = HAIRPIN_CHAIN, cidr = %cidr, "created hairpin chain");
    }

    /// Make sure every loadbalancer has a `Created` chain at its current
    /// generation, building one where it is missing.
    fn ensure_chains(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        lb_to_chains: &LbChains,
        lbs: &mut Loadbalancers,
    ) {
        for (key, chains) in lb_to_chains {
            let Some(lb) = lbs.get(key) else {
                debug!(lb = %key, "skipping chain creation, loadbalancer is in the kernel but not in our configuration");
                continue;
            };

            let existing = chains
                .iter()
                .find(|c| c.state == ChainState::Created && c.last_update == lb.generation);
            if let Some(chain) = existing {
                trace!(lb = %key, chain = %chain, "chain for the current generation already exists");
                continue;
            }

            if let Err(e) = self.create_chain_for_lb(lb) {
                error!(lb = %key, error = %e, "couldn't create chain");
                self.count_error();
            }
        }
    }

    /// Build a chain for `lb`: create it under its `Creating` name, append
    /// the DNAT fan-out, then re-list what the kernel actually stored, hash
    /// that, and rename to the final `Created` name in one step. The rename
    /// publishes the chain atomically under a name whose hash matches its
    /// payload, which is what tamper detection later relies on.
    fn create_chain_for_lb(&self, lb: &Loadbalancer) -> Result<ChainId> {
        if lb.outputs.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "zero outputs defined for loadbalancer `{}`, not creating a chain",
                lb.key()
            )));
        }

        let creating = ChainId::for_loadbalancer(lb, ChainState::Creating, 0);
        let name = creating.to_string();
        self.driver.new_chain(Table::Nat, &name)?;
        info!(chain = %name, lb = %lb.key(), "created chain");

        // Backends N..2 each take every nth connection not already matched;
        // the first backend gets the terminal catch-all.
        for i in (2..=lb.outputs.len()).rev() {
            let output = &lb.outputs[i - 1];
            let rule = rules::dnat_fanout_rule(lb.protocol, &lb.input, i, output);
            self.driver.append_rule(Table::Nat, &name, &rule)?;
        }
        let rule = rules::dnat_default_rule(lb.protocol, &lb.input, &lb.outputs[0]);
        self.driver.append_rule(Table::Nat, &name, &rule)?;

        // Hash what the kernel stored, not what we sent: listing reorders
        // arguments and adds match annotations.
        let listed = self.driver.list_rules(Table::Nat, &name)?;
        let created = ChainId::for_loadbalancer(lb, ChainState::Created, content_hash(&listed));

        self.driver.rename_chain(Table::Nat, &name, &created.to_string())?;

        Ok(created)
    }

    /// Point the main chain at the newest `Created` chain of every live
    /// loadbalancer. Old jumps are left in place here; removal happens in
    /// the following task, so a newer jump is always installed before the
    /// older one disappears.
    fn ensure_main_chain_entries(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        lb_to_chains: &LbChains,
        lbs: &mut Loadbalancers,
    ) {
        let listed = match self.driver.list_rules(Table::Nat, &self.main_chain) {
            Ok(rules) => rules,
            Err(e) => {
                error!(chain = %self.main_chain, error = %e, "couldn't retrieve main chain rules");
                self.count_error();
                return;
            }
        };

        for (key, chains) in lb_to_chains {
            if !lbs.contains_key(key) {
                debug!(lb = %key, "skipping main chain entry, loadbalancer is in the kernel but not in our configuration");
                continue;
            }

            let created: Vec<&ChainId> = chains
                .iter()
                .filter(|c| c.state == ChainState::Created)
                .collect();
            let Some(mut latest) = created.first().copied() else {
                debug!(lb = %key, "skipping main chain entry, no chain has been created yet");
                continue;
            };
            for chain in &created[1..] {
                if chain.last_update > latest.last_update {
                    latest = *chain;
                }
            }

            let rule = rules::jump_rule(latest);
            if rules::rules_contain_rule(&listed, &rule) {
                trace!(lb = %key, chain = %latest, "main chain entry already exists");
                continue;
            }

            match self.driver.append_rule(Table::Nat, &self.main_chain, &rule) {
                Ok(()) => info!(lb = %key, chain = %latest, "added main chain entry"),
                Err(e) => {
                    error!(lb = %key, chain = %latest, error = %e, "couldn't create main chain entry");
                    self.count_error();
                }
            }
        }
    }

    /// Drop main-chain jumps that are no longer wanted: all of them for
    /// deleted loadbalancers, everything but the newest for live ones.
    fn delete_obsolete_main_chain_entries(
        &self,
        _all_chains: &[String],
        _chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        lbs: &mut Loadbalancers,
    ) {
        let listed = match self.driver.list_rules(Table::Nat, &self.main_chain) {
            Ok(rules) => rules,
            Err(e) => {
                error!(chain = %self.main_chain, error = %e, "couldn't retrieve main chain rules");
                self.count_error();
                return;
            }
        };

        // Group the actual jump targets by owning loadbalancer; the grouping
        // handed to the task reflects chains, not main-chain entries.
        let mut referenced: LbChains = HashMap::new();
        for rule in &listed {
            if *rule == format!("-N {}", self.main_chain) {
                continue;
            }

            match rules::jump_target_from_rule(rule) {
                Ok(chain) => referenced.entry(chain.loadbalancer_key()).or_default().push(chain),
                Err(e) => {
                    error!(rule = %rule, error = %e, "couldn't parse jump target of main chain rule");
                    self.count_error();
                }
            }
        }

        for (key, chains) in &referenced {
            if !lbs.contains_key(key) {
                // Deleted from the configuration but still wired up.
                for chain in chains {
                    match self.remove_main_chain_entry(chain) {
                        Ok(()) => info!(lb = %key, chain = %chain, "removed main chain entry of deleted loadbalancer"),
                        Err(e) => {
                            error!(lb = %key, chain = %chain, error = %e, "couldn't remove main chain entry of deleted loadbalancer");
                            self.count_error();
                        }
                    }
                }
                continue;
            }

            if chains.len() == 1 {
                continue;
            }

            let mut newest = &chains[0];
            for chain in chains {
                if chain.last_update > newest.last_update {
                    newest = chain;
                }
            }

            for chain in chains {
                if chain == newest {
                    continue;
                }
                match self.remove_main_chain_entry(chain) {
                    Ok(()) => info!(lb = %key, chain = %chain, "removed outdated main chain entry"),
                    Err(e) => {
                        error!(lb = %key, chain = %chain, error = %e, "couldn't remove outdated main chain entry");
                        self.count_error();
                    }
                }
            }
        }
    }

    /// Flush and delete every one of our chains the main chain no longer
    /// references.
    fn delete_obsolete_chains(
        &self,
        _all_chains: &[String],
        chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        let listed = match self.driver.list_rules(Table::Nat, &self.main_chain) {
            Ok(rules) => rules,
            Err(e) => {
                error!(chain = %self.main_chain, error = %e, "couldn't retrieve main chain rules");
                self.count_error();
                return;
            }
        };

        let mut referenced: Vec<ChainId> = Vec::new();
        for rule in &listed {
            if *rule == format!("-N {}", self.main_chain) {
                continue;
            }

            match rules::jump_target_from_rule(rule) {
                Ok(chain) => referenced.push(chain),
                Err(e) => {
                    error!(rule = %rule, error = %e, "couldn't parse jump target of main chain rule");
                    self.count_error();
                }
            }
        }

        for chain in chain_ids {
            if referenced.contains(chain) {
                continue;
            }

            match self.delete_chain(chain) {
                Ok(()) => info!(chain = %chain, lb = %chain.loadbalancer_key(), "removed orphaned chain"),
                Err(e) => {
                    error!(chain = %chain, error = %e, "couldn't delete orphaned chain");
                    self.count_error();
                }
            }
        }
    }

    /// Drop forward-chain ACCEPT entries whose endpoint no DNAT rule of ours
    /// references anymore. If the reference set cannot be assembled
    /// completely, nothing is deleted: a stale ACCEPT is harmless, deleting
    /// an entry that still routes live traffic is not.
    fn delete_obsolete_forward_chain_entries(
        &self,
        _all_chains: &[String],
        chain_ids: &[ChainId],
        _lb_to_chains: &LbChains,
        _lbs: &mut Loadbalancers,
    ) {
        let forward_rules = match self.driver.list_rules(Table::Filter, &self.forward_chain) {
            Ok(rules) => rules,
            Err(e) => {
                error!(chain = %self.forward_chain, error = %e, "couldn't retrieve forward chain rules");
                self.count_error();
                return;
            }
        };

        let mut referenced: HashSet<String> = HashSet::new();
        for chain in chain_ids {
            let rules_in_chain = match self.driver.list_rules(Table::Nat, &chain.to_string()) {
                Ok(rules) => rules,
                Err(e) => {
                    error!(chain = %chain, error = %e, "not deleting any forward chain entries, couldn't retrieve rules");
                    self.count_error();
                    return;
                }
            };

            for rule in &rules_in_chain {
                if *rule == format!("-N {}", chain) {
                    continue;
                }

                let dest = match rules::destination_from_rule(rule) {
                    Ok(dest) => dest,
                    Err(e) => {
                        error!(rule = %rule, error = %e, "not deleting any forward chain entries, couldn't find endpoint");
                        self.count_error();
                        return;
                    }
                };
                referenced.insert(dest.to_string());
            }
        }

        for rule in &forward_rules {
            let stripped = rules::strip_chain_tokens(rule);
            if stripped.is_empty() {
                continue;
            }

            let dest = match rules::endpoint_from_forward_rule(&stripped) {
                Ok(dest) => dest,
                Err(e) => {
                    error!(rule = %rule, error = %e, "can't judge potentially obsolete forward rule");
                    self.count_error();
                    continue;
                }
            };

            if referenced.contains(&dest.to_string()) {
                continue;
            }

            // The listing carries the /32 mask, the delete call rejects it.
            let delete_text = stripped.replace(&format!("{}/32", dest.ip), &dest.ip.to_string());
            match self.driver.delete_rule(Table::Filter, &self.forward_chain, &delete_text) {
                Ok(()) => debug!(rule = %delete_text, "deleted obsolete forward rule"),
                Err(e) => {
                    error!(rule = %delete_text, error = %e, "couldn't delete obsolete forward rule");
                    self.count_error();
                }
            }
        }
    }

    fn remove_main_chain_entry(&self, chain: &ChainId) -> Result<()> {
        let rule = rules::jump_rule(chain);
        self.driver.delete_rule(Table::Nat, &self.main_chain, &rule)?;
        Ok(())
    }

    fn delete_chain(&self, chain: &ChainId) -> Result<()> {
        let name = chain.to_string();
        self.driver.clear_chain(Table::Nat, &name)?;
        self.driver.delete_chain(Table::Nat, &name)?;
        Ok(())
    }
}

/// Parse every chain name we can claim as ours; everything else is foreign
/// and ignored.
fn find_chain_ids(chains: &[String]) -> Vec<ChainId> {
    chains
        .iter()
        .filter_map(|chain| match ChainId::parse(chain) {
            Ok(id) => Some(id),
            Err(e) => {
                trace!(chain = %chain, reason = %e, "skipping foreign chain");
                None
            }
        })
        .collect()
}

/// Group observed chains by owning loadbalancer, and make sure every
/// configured loadbalancer has an entry even when it has no chains yet.
fn map_lb_to_chains(chain_ids: &[ChainId], lbs: &Loadbalancers) -> LbChains {
    let mut map: LbChains = HashMap::new();

    for chain in chain_ids {
        map.entry(chain.loadbalancer_key()).or_default().push(*chain);
    }

    for key in lbs.keys() {
        map.entry(key.clone()).or_default();
    }

    map
}
