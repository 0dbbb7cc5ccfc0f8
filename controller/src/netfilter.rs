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

//! The low-level netfilter adapter.
//!
//! The reconciler talks to the kernel exclusively through the
//! [`NetfilterDriver`] trait, a thin seam over the eight primitive chain and
//! rule operations. The production implementation shells out to the
//! `iptables` binary; tests substitute an in-memory fake.

use std::fmt::{self, Display, Formatter};
use std::process::Command;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("couldn't execute `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("`{command}` produced non-utf8 output")]
    InvalidOutput { command: String },
}

/// The two netfilter tables the controller programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive chain and rule operations against one host's tables.
///
/// Rules are passed and returned in the whitespace-separated argument form;
/// listings return the `-N <chain>` line followed by one `-A <chain> …` line
/// per rule, the way the kernel tool prints them. Implementations serialize
/// mutations; the controller never issues concurrent calls.
pub trait NetfilterDriver: Send + Sync {
    fn list_chains(&self, table: Table) -> Result<Vec<String>, DriverError>;
    fn new_chain(&self, table: Table, chain: &str) -> Result<(), DriverError>;
    fn rename_chain(&self, table: Table, from: &str, to: &str) -> Result<(), DriverError>;
    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError>;
    fn clear_chain(&self, table: Table, chain: &str) -> Result<(), DriverError>;
    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<String>, DriverError>;
    fn append_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError>;
    fn delete_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError>;
}

/// Driver executing the `iptables` binary. `--wait` serializes against other
/// holders of the xtables lock.
pub struct ExecDriver {
    program: String,
}

impl ExecDriver {
    /// Probe the `iptables` binary; fails when it is missing or unusable,
    /// which should abort startup.
    pub fn new() -> Result<ExecDriver, DriverError> {
        let driver = ExecDriver {
            program: "iptables".to_string(),
        };
        driver.run(&["--version"])?;
        Ok(driver)
    }

    fn run(&self, args: &[&str]) -> Result<String, DriverError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| DriverError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let command = format!("{} {}", self.program, args.join(" "));

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                command,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| DriverError::InvalidOutput { command })
    }

    fn modify(&self, table: Table, args: &[&str]) -> Result<(), DriverError> {
        let mut full = vec!["--wait", "-t", table.as_str()];
        full.extend_from_slice(args);
        self.run(&full)?;
        Ok(())
    }
}

impl NetfilterDriver for ExecDriver {
    fn list_chains(&self, table: Table) -> Result<Vec<String>, DriverError> {
        let out = self.run(&["--wait", "-t", table.as_str(), "-S"])?;

        // `-P <chain> <policy>` lines name the builtin chains, `-N <chain>`
        // lines the user-defined ones.
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split(' ');
                match tokens.next() {
                    Some("-P") | Some("-N") => tokens.next().map(str::to_string),
                    _ => None,
                }
            })
            .collect())
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.modify(table, &["-N", chain])
    }

    fn rename_chain(&self, table: Table, from: &str, to: &str) -> Result<(), DriverError> {
        self.modify(table, &["-E", from, to])
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.modify(table, &["-X", chain])
    }

    fn clear_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.modify(table, &["-F", chain])
    }

    fn list_rules(&self, table: Table, chain: &str) -> Result<Vec<String>, DriverError> {
        let out = self.run(&["--wait", "-t", table.as_str(), "-S", chain])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn append_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        let mut args = vec!["-A", chain];
        args.extend(rule.split(' '));
        self.modify(table, &args)
    }

    fn delete_rule(&self, table: Table, chain: &str, rule: &str) -> Result<(), DriverError> {
        let mut args = vec!["-D", chain];
        args.extend(rule.split(' '));
        self.modify(table, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert_eq!(Table::Nat.to_string(), "nat");
        assert_eq!(Table::Filter.to_string(), "filter");
    }
}
