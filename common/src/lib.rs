/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Network types shared between the controller and the health-check
//! subsystem: protocols, endpoints, endpoint parsing (including the
//! `A.B.C.X-Y:P` range syntax) and the loadbalancer desired-state record.

use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected format `proto://ip:port` but got `{0}`")]
    InvalidProtocolEndpoint(String),
    #[error("unknown protocol `{0}`, expected \"tcp\" or \"udp\"")]
    UnknownProtocol(String),
    #[error("expected `ip:port` but got `{0}`")]
    InvalidEndpoint(String),
    #[error("couldn't parse `{0}` as an IPv4 address")]
    InvalidAddress(String),
    #[error("couldn't parse port in `{0}`")]
    InvalidPort(String),
    #[error("expected `ip:port` or `ip-max:port` but got `{0}`")]
    InvalidRange(String),
    #[error("couldn't parse the upper bound of range `{0}`")]
    InvalidRangeBound(String),
    #[error("lower address in range `{0}` is bigger than the upper bound")]
    RangeOutOfOrder(String),
    #[error("upper bound of range `{0}` exceeds 255")]
    RangeBoundTooBig(String),
}

/// A network protocol as carried in an encoded chain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Unknown = 0x00,
    Tcp = 0x01,
    Udp = 0x02,
}

impl Protocol {
    pub fn from_byte(b: u8) -> Protocol {
        match b {
            0x01 => Protocol::Tcp,
            0x02 => Protocol::Udp,
            _ => Protocol::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Unknown => f.write_str("unknown"),
        }
    }
}

/// An IPv4 address and port tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { ip, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a protocol-qualified endpoint such as `tcp://192.168.0.1:80`.
pub fn parse_protocol_endpoint(s: &str) -> Result<(Protocol, Endpoint), ParseError> {
    let (scheme, rest) = s
        .split_once("://")
        .ok_or_else(|| ParseError::InvalidProtocolEndpoint(s.to_string()))?;

    let protocol = match scheme {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => return Err(ParseError::UnknownProtocol(other.to_string())),
    };

    Ok((protocol, parse_endpoint(rest)?))
}

/// Parse an `ip:port` pair.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, ParseError> {
    let (ip_part, port_part) = s
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidEndpoint(s.to_string()))?;

    let ip: Ipv4Addr = ip_part
        .parse()
        .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
    let port: u16 = port_part
        .parse()
        .map_err(|_| ParseError::InvalidPort(s.to_string()))?;

    Ok(Endpoint::new(ip, port))
}

/// Parse a comma-separated list of endpoints where each entry is either
/// `ip:port` or an inclusive last-octet range `ip-max:port`, e.g.
/// `192.168.0.1:50,192.168.0.5-9:50`.
pub fn parse_endpoints(s: &str) -> Result<Vec<Endpoint>, ParseError> {
    let mut endpoints = Vec::new();

    for part in s.split(',') {
        let (ip_part, port_part) = part
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidRange(part.to_string()))?;

        let port: u16 = port_part
            .parse()
            .map_err(|_| ParseError::InvalidPort(part.to_string()))?;

        let mut range = ip_part.split('-');
        let base = range.next().unwrap_or_default();
        let upper = range.next();
        if range.next().is_some() {
            return Err(ParseError::InvalidRange(part.to_string()));
        }

        let ip: Ipv4Addr = base
            .parse()
            .map_err(|_| ParseError::InvalidAddress(part.to_string()))?;
        endpoints.push(Endpoint::new(ip, port));

        let Some(upper) = upper else {
            continue;
        };

        let min = u32::from(ip.octets()[3]);
        let max: u32 = upper
            .parse()
            .map_err(|_| ParseError::InvalidRangeBound(part.to_string()))?;

        if min > max {
            return Err(ParseError::RangeOutOfOrder(part.to_string()));
        }
        if max > 255 {
            return Err(ParseError::RangeBoundTooBig(part.to_string()));
        }

        let [a, b, c, _] = ip.octets();
        for octet in (min + 1)..=max {
            endpoints.push(Endpoint::new(Ipv4Addr::new(a, b, c, octet as u8), port));
        }
    }

    Ok(endpoints)
}

/// The desired state of one loadbalancer: the virtual input endpoint clients
/// target and the ordered set of backends considered healthy.
///
/// `generation` is an opaque monotonic id (unix seconds at rest); the
/// controller replaces the kernel chain for this record whenever the
/// generation embedded in the chain name falls behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loadbalancer {
    pub protocol: Protocol,
    pub input: Endpoint,
    pub outputs: Vec<Endpoint>,
    pub generation: u32,
}

impl Loadbalancer {
    pub fn new(protocol: Protocol, input: Endpoint, outputs: Vec<Endpoint>) -> Loadbalancer {
        let mut lb = Loadbalancer {
            protocol,
            input,
            outputs,
            generation: 0,
        };
        lb.mark_updated();
        lb
    }

    /// The registry key identifying this loadbalancer: `proto://ip:port`.
    pub fn key(&self) -> String {
        loadbalancer_key(self.protocol, &self.input)
    }

    /// Bump the generation. Strictly monotonic even for updates within the
    /// same second, while staying close to wall-clock unix seconds.
    pub fn mark_updated(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.generation = now.max(self.generation.saturating_add(1));
    }

    /// Append `endpoint` to the outputs unless it is already present.
    pub fn add_output(&mut self, endpoint: Endpoint) {
        if !self.outputs.contains(&endpoint) {
            self.outputs.push(endpoint);
        }
    }

    /// Remove every occurrence of `endpoint` from the outputs.
    pub fn remove_output(&mut self, endpoint: Endpoint) {
        self.outputs.retain(|e| *e != endpoint);
    }
}

/// Build the registry key for a loadbalancer input without constructing the
/// full record.
pub fn loadbalancer_key(protocol: Protocol, input: &Endpoint) -> String {
    format!("{}://{}", protocol, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        parse_endpoint(s).unwrap()
    }

    #[test]
    fn protocol_strings() {
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert_eq!(Protocol::Unknown.to_string(), "unknown");
        assert_eq!(Protocol::from_byte(0x01), Protocol::Tcp);
        assert_eq!(Protocol::from_byte(0x02), Protocol::Udp);
        assert_eq!(Protocol::from_byte(0x7F), Protocol::Unknown);
    }

    #[test]
    fn parse_single_endpoint() {
        let endpoints = parse_endpoints("192.168.0.5:80").unwrap();
        assert_eq!(endpoints, vec![ep("192.168.0.5:80")]);
    }

    #[test]
    fn parse_endpoint_rejects_bad_address() {
        let err = parse_endpoints("192.168.0.:80").unwrap_err();
        assert_eq!(err, ParseError::InvalidAddress("192.168.0.:80".to_string()));
    }

    #[test]
    fn parse_multiple_endpoints() {
        let endpoints = parse_endpoints("192.168.0.5:80,192.168.14.7:81").unwrap();
        assert_eq!(endpoints, vec![ep("192.168.0.5:80"), ep("192.168.14.7:81")]);
    }

    #[test]
    fn parse_rejects_trailing_comma() {
        let err = parse_endpoints("192.168.0.2:80,").unwrap_err();
        assert_eq!(err, ParseError::InvalidRange("".to_string()));
    }

    #[test]
    fn parse_range_expands_in_order() {
        let endpoints = parse_endpoints("192.168.0.5-9:80").unwrap();
        assert_eq!(
            endpoints,
            vec![
                ep("192.168.0.5:80"),
                ep("192.168.0.6:80"),
                ep("192.168.0.7:80"),
                ep("192.168.0.8:80"),
                ep("192.168.0.9:80"),
            ]
        );
    }

    #[test]
    fn parse_range_single_element() {
        let endpoints = parse_endpoints("192.168.0.5-5:80").unwrap();
        assert_eq!(endpoints, vec![ep("192.168.0.5:80")]);
    }

    #[test]
    fn parse_range_rejects_descending_bounds() {
        let err = parse_endpoints("192.168.0.5-3:80").unwrap_err();
        assert_eq!(
            err,
            ParseError::RangeOutOfOrder("192.168.0.5-3:80".to_string())
        );
    }

    #[test]
    fn parse_range_rejects_missing_bound() {
        let err = parse_endpoints("192.168.0.5-:80").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidRangeBound("192.168.0.5-:80".to_string())
        );
    }

    #[test]
    fn parse_range_rejects_bound_over_255() {
        let err = parse_endpoints("192.168.0.5-300:80").unwrap_err();
        assert_eq!(
            err,
            ParseError::RangeBoundTooBig("192.168.0.5-300:80".to_string())
        );
    }

    #[test]
    fn parse_protocol_endpoints() {
        let (proto, endpoint) = parse_protocol_endpoint("tcp://192.168.0.1:80").unwrap();
        assert_eq!(proto, Protocol::Tcp);
        assert_eq!(endpoint, ep("192.168.0.1:80"));

        let (proto, _) = parse_protocol_endpoint("udp://10.0.0.1:53").unwrap();
        assert_eq!(proto, Protocol::Udp);

        assert!(matches!(
            parse_protocol_endpoint("icmp://10.0.0.1:1"),
            Err(ParseError::UnknownProtocol(_))
        ));
        assert!(matches!(
            parse_protocol_endpoint("10.0.0.1:1"),
            Err(ParseError::InvalidProtocolEndpoint(_))
        ));
    }

    #[test]
    fn loadbalancer_key_format() {
        let lb = Loadbalancer::new(Protocol::Tcp, ep("10.50.1.1:1234"), vec![ep("10.100.0.1:1001")]);
        assert_eq!(lb.key(), "tcp://10.50.1.1:1234");
    }

    #[test]
    fn mark_updated_is_strictly_monotonic() {
        let mut lb = Loadbalancer::new(Protocol::Tcp, ep("10.0.0.1:80"), vec![ep("10.0.0.2:80")]);
        let mut last = lb.generation;
        for _ in 0..3 {
            lb.mark_updated();
            assert!(lb.generation > last);
            last = lb.generation;
        }
    }

    #[test]
    fn outputs_add_and_remove() {
        let mut lb = Loadbalancer::new(Protocol::Tcp, ep("10.0.0.1:80"), vec![ep("10.0.0.2:80")]);
        lb.add_output(ep("10.0.0.2:80"));
        assert_eq!(lb.outputs.len(), 1);
        lb.add_output(ep("10.0.0.3:80"));
        assert_eq!(lb.outputs.len(), 2);
        lb.remove_output(ep("10.0.0.2:80"));
        assert_eq!(lb.outputs, vec![ep("10.0.0.3:80")]);
    }
}
