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

//! Rule-text production and interpretation.
//!
//! Rules are written in the classic whitespace-separated argument form. The
//! kernel tool reorders arguments and adds annotations when listing, so
//! observed rules are never compared byte-for-byte; see
//! [`rules_contain_rule`].

use common::{parse_endpoint, Endpoint, Protocol};

use crate::chain_id::ChainId;
use crate::{Error, Result};

/// The statistic-match rule steering every `every`-th connection for the
/// input to one backend. Used for all backends except the first.
pub fn dnat_fanout_rule(
    protocol: Protocol,
    input: &Endpoint,
    every: usize,
    output: &Endpoint,
) -> String {
    format!(
        "-p {} -d {} --dport {} -m statistic --mode nth --every {} --packet 0 -j DNAT --to-destination {}",
        protocol, input.ip, input.port, every, output
    )
}

/// The terminal catch-all DNAT rule for the first backend.
pub fn dnat_default_rule(protocol: Protocol, input: &Endpoint, output: &Endpoint) -> String {
    format!(
        "-p {} -d {} --dport {} -j DNAT --to-destination {}",
        protocol, input.ip, input.port, output
    )
}

/// The main-chain entry routing an input's traffic into its chain.
pub fn jump_rule(chain: &ChainId) -> String {
    format!(
        "-p {} -d {} --dport {} -j {}",
        chain.protocol, chain.ip, chain.port, chain
    )
}

/// Forward-chain ACCEPT for traffic coming back from a backend.
pub fn forward_src_rule(protocol: Protocol, endpoint: &Endpoint) -> String {
    format!(
        "-p {} -s {} --sport {} -j ACCEPT",
        protocol, endpoint.ip, endpoint.port
    )
}

/// Forward-chain ACCEPT for traffic going to a backend.
pub fn forward_dst_rule(protocol: Protocol, endpoint: &Endpoint) -> String {
    format!(
        "-p {} -d {} --dport {} -j ACCEPT",
        protocol, endpoint.ip, endpoint.port
    )
}

/// Check whether `rule` is semantically present in `rules`.
///
/// The candidate is split into adjacent flag/value pairs and is considered
/// present if some listed rule contains every pair as a substring. This
/// tolerates the argument reordering and extra match annotations the kernel
/// tool applies when echoing rules back.
pub fn rules_contain_rule(rules: &[String], rule: &str) -> bool {
    let tokens: Vec<&str> = rule.split(' ').collect();
    let pairs: Vec<String> = tokens
        .chunks_exact(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect();

    rules
        .iter()
        .any(|existing| pairs.iter().all(|pair| existing.contains(pair.as_str())))
}

/// Drop `-A <chain>` / `-N <chain>` token pairs from a listed rule. The
/// chain name must not participate in content hashing or endpoint
/// extraction, since the name itself carries the content hash.
pub fn strip_chain_tokens(rule: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut skip_value = false;

    for token in rule.split(' ') {
        if token == "-A" || token == "-N" {
            skip_value = true;
            continue;
        }
        if skip_value {
            skip_value = false;
            continue;
        }
        out.push(token);
    }

    out.join(" ")
}

/// Extract the backend endpoint of a DNAT rule.
pub fn destination_from_rule(rule: &str) -> Result<Endpoint> {
    let tokens: Vec<&str> = rule.split(' ').collect();

    for pair in tokens.windows(2) {
        if pair[0] == "--to-destination" {
            return parse_endpoint(pair[1]).map_err(|e| Error::InvalidRule {
                rule: rule.to_string(),
                reason: e.to_string(),
            });
        }
    }

    Err(Error::InvalidRule {
        rule: rule.to_string(),
        reason: "no --to-destination argument".to_string(),
    })
}

/// Extract the backend endpoint of a forward-chain ACCEPT rule, which names
/// it either as source (`-s`/`--sport`) or destination (`-d`/`--dport`).
/// A rule carrying both addresses or both ports is malformed.
pub fn endpoint_from_forward_rule(rule: &str) -> Result<Endpoint> {
    let malformed = |reason: &str| Error::InvalidRule {
        rule: rule.to_string(),
        reason: reason.to_string(),
    };

    let mut src_ip: Option<&str> = None;
    let mut dst_ip: Option<&str> = None;
    let mut src_port: Option<u16> = None;
    let mut dst_port: Option<u16> = None;

    let tokens: Vec<&str> = rule.split(' ').collect();
    for pair in tokens.windows(2) {
        match pair[0] {
            "-s" => src_ip = Some(pair[1]),
            "-d" => dst_ip = Some(pair[1]),
            "--sport" => {
                src_port = Some(
                    pair[1]
                        .parse()
                        .map_err(|_| malformed("unparseable source port"))?,
                )
            }
            "--dport" => {
                dst_port = Some(
                    pair[1]
                        .parse()
                        .map_err(|_| malformed("unparseable destination port"))?,
                )
            }
            _ => {}
        }
    }

    if src_ip.is_some() && dst_ip.is_some() {
        return Err(malformed("both source and destination address set"));
    }
    if src_port.is_some() && dst_port.is_some() {
        return Err(malformed("both source and destination port set"));
    }

    let (ip, port) = match (src_ip, src_port, dst_ip, dst_port) {
        (Some(ip), Some(port), None, None) => (ip, port),
        (None, None, Some(ip), Some(port)) => (ip, port),
        _ => return Err(malformed("need source address+port or destination address+port")),
    };

    // Listings carry the netmask; a /32 is implied for our endpoints.
    let ip = ip.split('/').next().unwrap_or(ip);
    let ip = ip
        .parse()
        .map_err(|_| malformed("unparseable IPv4 address"))?;

    Ok(Endpoint::new(ip, port))
}

/// Parse the jump target of a main-chain rule as a chain identity.
pub fn jump_target_from_rule(rule: &str) -> Result<ChainId> {
    let tokens: Vec<&str> = rule.split(' ').collect();

    for pair in tokens.windows(2) {
        if pair[0] == "-j" {
            return Ok(ChainId::parse(pair[1])?);
        }
    }

    Err(Error::InvalidRule {
        rule: rule.to_string(),
        reason: "no jump target".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_id::ChainState;
    use std::net::Ipv4Addr;

    fn ep(s: &str) -> Endpoint {
        parse_endpoint(s).unwrap()
    }

    #[test]
    fn formats_the_three_nat_rule_kinds() {
        let input = ep("10.50.1.1:1234");
        assert_eq!(
            dnat_fanout_rule(Protocol::Tcp, &input, 3, &ep("10.100.0.3:1003")),
            "-p tcp -d 10.50.1.1 --dport 1234 -m statistic --mode nth --every 3 --packet 0 -j DNAT --to-destination 10.100.0.3:1003"
        );
        assert_eq!(
            dnat_default_rule(Protocol::Tcp, &input, &ep("10.100.0.1:1001")),
            "-p tcp -d 10.50.1.1 --dport 1234 -j DNAT --to-destination 10.100.0.1:1001"
        );

        let chain = ChainId::new(
            Protocol::Tcp,
            Ipv4Addr::new(10, 50, 1, 1),
            1234,
            12345,
            ChainState::Created,
            0xE4971B45,
        );
        assert_eq!(
            jump_rule(&chain),
            "-p tcp -d 10.50.1.1 --dport 1234 -j LB$-CgEKMgEBBNIAADA5AeSXG0U="
        );
    }

    #[test]
    fn formats_forward_rules() {
        let backend = ep("10.100.0.1:1001");
        assert_eq!(
            forward_src_rule(Protocol::Tcp, &backend),
            "-p tcp -s 10.100.0.1 --sport 1001 -j ACCEPT"
        );
        assert_eq!(
            forward_dst_rule(Protocol::Udp, &backend),
            "-p udp -d 10.100.0.1 --dport 1001 -j ACCEPT"
        );
    }

    #[test]
    fn containment_tolerates_reordering_and_annotations() {
        let listed = vec![
            "-A CH -d 10.50.1.1/32 -p tcp -m tcp --dport 1234 -j DNAT --to-destination 10.100.0.1:1001"
                .to_string(),
        ];
        let written = "-p tcp -d 10.50.1.1 --dport 1234 -j DNAT --to-destination 10.100.0.1:1001";
        assert!(rules_contain_rule(&listed, written));

        let other = "-p tcp -d 10.50.1.1 --dport 1234 -j DNAT --to-destination 10.100.0.2:1002";
        assert!(!rules_contain_rule(&listed, other));
    }

    #[test]
    fn strips_append_and_new_tokens() {
        assert_eq!(strip_chain_tokens("-N CH"), "");
        assert_eq!(
            strip_chain_tokens("-A CH -p tcp -j ACCEPT"),
            "-p tcp -j ACCEPT"
        );
        assert_eq!(strip_chain_tokens("-p tcp -j ACCEPT"), "-p tcp -j ACCEPT");
    }

    #[test]
    fn extracts_dnat_destination() {
        let rule =
            "-A CH -d 10.50.1.1/32 -p tcp -m tcp --dport 1234 -j DNAT --to-destination 10.100.0.1:1001";
        assert_eq!(destination_from_rule(rule).unwrap(), ep("10.100.0.1:1001"));
        assert!(destination_from_rule("-p tcp -j ACCEPT").is_err());
    }

    #[test]
    fn extracts_forward_endpoint_from_either_direction() {
        let src = "-s 10.100.0.1/32 -p tcp -m tcp --sport 1001 -j ACCEPT";
        assert_eq!(endpoint_from_forward_rule(src).unwrap(), ep("10.100.0.1:1001"));

        let dst = "-d 10.100.0.1/32 -p tcp -m tcp --dport 1001 -j ACCEPT";
        assert_eq!(endpoint_from_forward_rule(dst).unwrap(), ep("10.100.0.1:1001"));
    }

    #[test]
    fn rejects_malformed_forward_rules() {
        let both_addrs = "-s 10.0.0.1 -d 10.0.0.2 --sport 80 -j ACCEPT";
        assert!(endpoint_from_forward_rule(both_addrs).is_err());

        let both_ports = "-s 10.0.0.1 --sport 80 --dport 81 -j ACCEPT";
        assert!(endpoint_from_forward_rule(both_ports).is_err());

        let mixed = "-s 10.0.0.1 --dport 80 -j ACCEPT";
        assert!(endpoint_from_forward_rule(mixed).is_err());
    }

    #[test]
    fn parses_jump_targets() {
        let chain = ChainId::new(
            Protocol::Tcp,
            Ipv4Addr::new(10, 50, 1, 1),
            1234,
            12345,
            ChainState::Created,
            7,
        );
        let rule = format!(
            "-A MAIN -d 10.50.1.1/32 -p tcp -m tcp --dport 1234 -j {}",
            chain
        );
        assert_eq!(jump_target_from_rule(&rule).unwrap(), chain);

        assert!(jump_target_from_rule("-p tcp -d 10.50.1.1 --dport 1234").is_err());
        assert!(jump_target_from_rule("-p tcp -j PREROUTING").is_err());
    }
}
