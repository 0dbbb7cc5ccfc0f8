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

//! An in-memory netfilter driver for exercising the reconciler.
//!
//! Listings reproduce the canonical rule text the real tool prints
//! (`-d 10.0.0.1/32 -p tcp -m tcp --dport 80 …`), so chain names derived
//! from listed content come out byte-identical to a kernel-backed run.

use std::collections::HashSet;

use parking_lot::Mutex;

use controller::{DriverError, NetfilterDriver, Table};

const NAT_BUILTINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];
const FILTER_BUILTINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];

#[derive(Default)]
struct TableState {
    builtins: Vec<String>,
    chains: Vec<(String, Vec<String>)>,
}

impl TableState {
    fn with_builtins(builtins: &[&str]) -> TableState {
        TableState {
            builtins: builtins.iter().map(|s| s.to_string()).collect(),
            chains: Vec::new(),
        }
    }

    fn position(&self, chain: &str) -> Option<usize> {
        self.chains.iter().position(|(name, _)| name == chain)
    }
}

pub struct MemoryDriver {
    nat: Mutex<TableState>,
    filter: Mutex<TableState>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        MemoryDriver::new()
    }
}

impl MemoryDriver {
    pub fn new() -> MemoryDriver {
        MemoryDriver {
            nat: Mutex::new(TableState::with_builtins(NAT_BUILTINS)),
            filter: Mutex::new(TableState::with_builtins(FILTER_BUILTINS)),
        }
    }

    fn table(&self, table: Table) -> &Mutex<TableState> {
        match table {
            Table::Nat => &self.nat,
            Table::Filter => &self.filter,
        }
    }

    /// The user-defined chains of a table, in creation order.
    pub fn user_chains(&self, table: Table) -> Vec<String> {
        self.table(table)
            .lock()
            .chains
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The canonical `-A` lines of a chain, without the leading `-N` line.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<String> {
        let state = self.table(table).lock();
        state
            .position(chain)
            .map(|idx| state.chains[idx].1.clone())
            .unwrap_or_default()
    }

    fn err(command: String, stderr: &str) -> DriverError {
        DriverError::CommandFailed {
            command,
            status: 1,
            stderr: stderr.to_string(),
        }
    }
}

impl NetfilterDriver for MemoryDriver {
    fn list_chains(&self, table: Table) -> Result<Vec<String>, DriverError> {
        let state = self.table(table).lock();
        let mut chains = state.builtins.clone();
        chains.extend(state.chains.iter().map(|(name, _)| name.clone()));
        Ok(chains)
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        let mut state = self.table(table).lock();
        if state.position(chain).is_some() || state.builtins.iter().any(|b| b == chain) {
            return Err(Self::err(
                format!("iptables -t {} -N {}", table, chain),
                "iptables: Chain already exists.",
            ));
        }
        state.chains.push((chain.to_string(), Vec::new()));
        Ok(())
    }

    fn rename_chain(&self, table: Table, from: &str, to: &str) -> Result<(), DriverError> {
        let mut state = self.table(table).lock();
        if state.position(to).is_some() {
            return Err(Self::err(
                format!("iptables -t {} -E {} {}", table, from, to),
                "iptables: File exists.",
            ));
        }
        let Some(idx) = state.position(from) else {
            return Err(Self::err(
                format!("iptables -t {} -E {} {}", table, from, to),
                "iptables: No chain/target/match by that name.",
            ));
        };

        state.chains[idx].0 = to.to_string();
        let from_prefix = format!("-A {} ", from);
        let to_prefix = format!("-A {} ", to);
        let from_jump = format!("-j {}", from);
        let to_jump = format!("-j {}", to);
        for (_, rules) in state.chains.iter_mut() {
            for rule in rules.iter_mut() {
                if let Some(rest) = rule.strip_prefix(&from_prefix) {
                    *rule = format!("{}{}", to_prefix, rest);
                }
                if rule.ends_with(&from_jump) || rule.contains(&format!("{} ", from_jump)) {
                    *rule = rule.replace(&from_jump, &to_jump);
                }
            }
        }
        Ok(())
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        let mut state = self.table(table).lock();
        let Some(idx) = state.position(chain) else {
            return Err(Self::err(
                format!("iptables -t {} -X {}", table, chain),
                "iptables: No chain/target/match by that name.",
            ));
        };
        if !state.chains[idx].1.is_empty() {
            return Err(Self::err(
                format!("iptables -t {} -X {}", table, chain),
                "iptables: Directory not empty.",
            ));
        }
        let jump = format!("-j {}", chain);
        if state
            .chains
            .iter()
            .any(|(_, rules)| rules.iter().any(|r| r.ends_with(&jump)))
        {
            return Err(Self::err(
                format!("iptables -t {} -X {}", table, chain),
                "iptables: Too many links.",
            ));
        }
        state.chains.remove(idx);
        Ok(())
    }

    fn clear_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        let mut state = self.table(table).lock();
        let Some(idx) = state.position(chain) else {
            return Err(Self::err(
                format!("iptables -t {} -F {}", table, chain),
                "iptables: No chain/target/match by that name.",
            ));
        };
        state.chains[idx].1.clear();
        Ok(())
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<String>, DriverError> {
        let state = self.table(table).lock();
        if state.builtins.iter().any(|b| b == chain) {
            return Ok(vec![format!("-P {} ACCEPT", chain)]);
        }
        let Some(idx) = state.position(chain) else {
            return Err(Self::err(
                format!("iptables -t {} -S {}", table, chain),
                "iptables: No chain/target/match by that name.",
            ));
        };

        let mut rules = vec![format!("-N {}", chain)];
        rules.extend(state.chains[idx].1.iter().cloned());
        Ok(rules)
    }

    fn append_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        let canonical = canonicalize(chain, rule);
        let mut state = self.table(table).lock();
        let Some(idx) = state.position(chain) else {
            return Err(Self::err(
                format!("iptables -t {} -A {} {}", table, chain, rule),
                "iptables: No chain/target/match by that name.",
            ));
        };
        state.chains[idx].1.push(canonical);
        Ok(())
    }

    fn delete_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        let canonical = canonicalize(chain, rule);
        let mut state = self.table(table).lock();
        let Some(idx) = state.position(chain) else {
            return Err(Self::err(
                format!("iptables -t {} -D {} {}", table, chain, rule),
                "iptables: No chain/target/match by that name.",
            ));
        };
        let Some(pos) = state.chains[idx].1.iter().position(|r| *r == canonical) else {
            return Err(Self::err(
                format!("iptables -t {} -D {} {}", table, chain, rule),
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            ));
        };
        state.chains[idx].1.remove(pos);
        Ok(())
    }
}

/// Rewrite an argument-form rule into the canonical text `iptables -S`
/// prints: addresses gain their `/32`, the address goes in front of the
/// protocol, port matches get their `-m <proto>` annotation and statistic
/// arguments are normalized.
fn canonicalize(chain: &str, rule: &str) -> String {
    let tokens: Vec<&str> = rule.split_whitespace().collect();

    let mut proto = None;
    let mut src = None;
    let mut dst = None;
    let mut sport = None;
    let mut dport = None;
    let mut every = None;
    let mut target = None;
    let mut to_destination = None;

    let mut i = 0;
    while i < tokens.len() {
        let value = tokens.get(i + 1).copied();
        match tokens[i] {
            "-p" => proto = value,
            "-s" => src = value.map(|v| v.trim_end_matches("/32")),
            "-d" => dst = value.map(|v| v.trim_end_matches("/32")),
            "--sport" => sport = value,
            "--dport" => dport = value,
            "--every" => every = value,
            "-j" => target = value,
            "--to-destination" => to_destination = value,
            "-m" | "--mode" | "--packet" => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let mut out = format!("-A {}", chain);
    if let Some(ip) = src {
        out.push_str(&format!(" -s {}/32", ip));
    }
    if let Some(ip) = dst {
        out.push_str(&format!(" -d {}/32", ip));
    }
    if let Some(p) = proto {
        out.push_str(&format!(" -p {}", p));
        if let Some(port) = sport {
            out.push_str(&format!(" -m {} --sport {}", p, port));
        }
        if let Some(port) = dport {
            out.push_str(&format!(" -m {} --dport {}", p, port));
        }
    }
    if let Some(n) = every {
        out.push_str(&format!(" -m statistic --mode nth --every {} --packet 0", n));
    }
    if let Some(t) = target {
        out.push_str(&format!(" -j {}", t));
    }
    if let Some(dest) = to_destination {
        out.push_str(&format!(" --to-destination {}", dest));
    }
    out
}

/// Wraps [`MemoryDriver`] and fails rule listings for selected chains, for
/// exercising the paths that must refuse to act on partial observations.
pub struct FailingDriver {
    pub inner: MemoryDriver,
    fail_listing_for: Mutex<HashSet<String>>,
}

impl FailingDriver {
    pub fn new(inner: MemoryDriver) -> FailingDriver {
        FailingDriver {
            inner,
            fail_listing_for: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_listing_for(&self, chain: &str) {
        self.fail_listing_for.lock().insert(chain.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_listing_for.lock().clear();
    }
}

impl NetfilterDriver for FailingDriver {
    fn list_chains(&self, table: Table) -> Result<Vec<String>, DriverError> {
        self.inner.list_chains(table)
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.inner.new_chain(table, chain)
    }

    fn rename_chain(&self, table: Table, from: &str, to: &str) -> Result<(), DriverError> {
        self.inner.rename_chain(table, from, to)
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.inner.delete_chain(table, chain)
    }

    fn clear_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.inner.clear_chain(table, chain)
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<String>, DriverError> {
        if self.fail_listing_for.lock().contains(chain) {
            return Err(DriverError::CommandFailed {
                command: format!("iptables -t {} -S {}", table, chain),
                status: 1,
                stderr: "iptables: Resource temporarily unavailable.".to_string(),
            });
        }
        self.inner.list_rules(table, chain)
    }

    fn append_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        self.inner.append_rule(table, chain, rule)
    }

    fn delete_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        self.inner.delete_rule(table, chain, rule)
    }
}
