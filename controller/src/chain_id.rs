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

//! Chain identity encoded into the chain name.
//!
//! The kernel cannot attach metadata to a chain, so everything the
//! controller needs to know about one of its chains is packed into a
//! fixed-layout 17-byte record and carried as `"LB$-" + base64` in the name
//! itself:
//!
//! ```text
//!  00 01 02 03 04 05 06 07 08 09 10 11 12 13 14 15 16
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |CR|PR|    IPv4   | Port|Last Update|St|ContentHash|
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     \_____________________/
//!            hashed as CR
//! ```
//!
//! The one-byte Pearson checksum over protocol, address and port keeps the
//! controller from adopting unrelated chains that merely share the prefix.

use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use common::{loadbalancer_key, Endpoint, Loadbalancer, Protocol};

use crate::consts::{CHAIN_ID_PREFIX, CHAIN_NAME_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainIdError {
    #[error("chain `{chain}` has invalid length, got {got} expected {expected}")]
    InvalidLength {
        chain: String,
        got: usize,
        expected: usize,
    },
    #[error("chain `{chain}` doesn't start with prefix `{prefix}`")]
    InvalidPrefix { chain: String, prefix: &'static str },
    #[error("chain `{chain}` isn't valid base64")]
    InvalidBase64 { chain: String },
    #[error("chain `{chain}` has invalid CRC, got {got} expected {expected}")]
    CrcMismatch { chain: String, got: u8, expected: u8 },
}

/// Lifecycle state of a chain. A chain is born `Creating`, gets populated,
/// and is then renamed to its `Created` name in a single step so it becomes
/// visible atomically under a name whose hash matches its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChainState {
    Creating = 0x00,
    Created = 0x01,
}

impl ChainState {
    fn from_byte(b: u8) -> ChainState {
        match b {
            0x01 => ChainState::Created,
            _ => ChainState::Creating,
        }
    }
}

impl Display for ChainState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainState::Creating => f.write_str("creating"),
            ChainState::Created => f.write_str("created"),
        }
    }
}

/// The full identity of one of our chains, as embedded in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainId {
    pub crc: u8,
    pub protocol: Protocol,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub last_update: u32,
    pub state: ChainState,
    pub content_hash: u32,
}

impl ChainId {
    pub fn new(
        protocol: Protocol,
        ip: Ipv4Addr,
        port: u16,
        last_update: u32,
        state: ChainState,
        content_hash: u32,
    ) -> ChainId {
        ChainId {
            crc: pearson(&crc_input(protocol, ip, port)),
            protocol,
            ip,
            port,
            last_update,
            state,
            content_hash,
        }
    }

    /// The identity a chain for `lb` would carry at the loadbalancer's
    /// current generation.
    pub fn for_loadbalancer(lb: &Loadbalancer, state: ChainState, content_hash: u32) -> ChainId {
        ChainId::new(
            lb.protocol,
            lb.input.ip,
            lb.input.port,
            lb.generation,
            state,
            content_hash,
        )
    }

    /// Try to interpret a chain name as one of ours. Anything that fails
    /// here is a foreign chain and must be left alone.
    pub fn parse(chain: &str) -> Result<ChainId, ChainIdError> {
        if chain.len() != CHAIN_NAME_LEN {
            return Err(ChainIdError::InvalidLength {
                chain: chain.to_string(),
                got: chain.len(),
                expected: CHAIN_NAME_LEN,
            });
        }

        let Some(encoded) = chain.strip_prefix(CHAIN_ID_PREFIX) else {
            return Err(ChainIdError::InvalidPrefix {
                chain: chain.to_string(),
                prefix: CHAIN_ID_PREFIX,
            });
        };

        let data = BASE64.decode(encoded).map_err(|_| ChainIdError::InvalidBase64 {
            chain: chain.to_string(),
        })?;
        if data.len() != 17 {
            return Err(ChainIdError::InvalidBase64 {
                chain: chain.to_string(),
            });
        }

        let protocol = Protocol::from_byte(data[1]);
        let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);

        let expected = pearson(&data[1..8]);
        if data[0] != expected {
            return Err(ChainIdError::CrcMismatch {
                chain: chain.to_string(),
                got: data[0],
                expected,
            });
        }

        Ok(ChainId {
            crc: data[0],
            protocol,
            ip,
            port,
            last_update: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            state: ChainState::from_byte(data[12]),
            content_hash: u32::from_be_bytes([data[13], data[14], data[15], data[16]]),
        })
    }

    /// The registry key of the loadbalancer owning this chain. This is what
    /// lets the controller reattribute observed chains without a sidecar
    /// database.
    pub fn loadbalancer_key(&self) -> String {
        loadbalancer_key(self.protocol, &Endpoint::new(self.ip, self.port))
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let o = self.ip.octets();
        let mut buf = [0u8; 17];
        buf[0] = self.crc;
        buf[1] = self.protocol.as_byte();
        buf[2..6].copy_from_slice(&o);
        buf[6..8].copy_from_slice(&self.port.to_be_bytes());
        buf[8..12].copy_from_slice(&self.last_update.to_be_bytes());
        buf[12] = self.state as u8;
        buf[13..17].copy_from_slice(&self.content_hash.to_be_bytes());

        write!(f, "{}{}", CHAIN_ID_PREFIX, BASE64.encode(buf))
    }
}

fn crc_input(protocol: Protocol, ip: Ipv4Addr, port: u16) -> [u8; 7] {
    let o = ip.octets();
    let p = port.to_be_bytes();
    [protocol.as_byte(), o[0], o[1], o[2], o[3], p[0], p[1]]
}

/// Pearson's byte-at-a-time permutation-table hash, using the table from the
/// original paper.
fn pearson(data: &[u8]) -> u8 {
    let mut h: u8 = 0;
    for b in data {
        h = PEARSON_TABLE[(h ^ b) as usize];
    }
    h
}

#[rustfmt::skip]
const PEARSON_TABLE: [u8; 256] = [
     98,   6,  85, 150,  36,  23, 112, 164, 135, 207, 169,   5,  26,  64, 165, 219,
     61,  20,  68,  89, 130,  63,  52, 102,  24, 229, 132, 245,  80, 216, 195, 115,
     90, 168, 156, 203, 177, 120,   2, 190, 188,   7, 100, 185, 174, 243, 162,  10,
    237,  18, 253, 225,   8, 208, 172, 244, 255, 126, 101,  79, 145, 235, 228, 121,
    123, 251,  67, 250, 161,   0, 107,  97, 241, 111, 181,  82, 249,  33,  69,  55,
     59, 153,  29,   9, 213, 167,  84,  93,  30,  46,  94,  75, 151, 114,  73, 222,
    197,  96, 210,  45,  16, 227, 248, 202,  51, 152, 252, 125,  81, 206, 215, 186,
     39, 158, 178, 187, 131, 136,   1,  49,  50,  17, 141,  91,  47, 129,  60,  99,
    154,  35,  86, 171, 105,  34,  38, 200, 147,  58,  77, 118, 173, 246,  76, 254,
    133, 232, 196, 144, 198, 124,  53,   4, 108,  74, 223, 234, 134, 230, 157, 139,
    189, 205, 199, 128, 176,  19, 211, 236, 127, 192, 231,  70, 233,  88, 146,  44,
    183, 201,  22,  83,  13, 214, 116, 109, 159,  32,  95, 226, 140, 220,  57,  12,
    221,  31, 209, 182, 143,  92, 149, 184, 148,  62, 113,  65,  37,  27, 106, 166,
      3,  14, 204,  72,  21,  41,  56,  66,  28, 193,  40, 217,  25,  54, 179, 117,
    238,  87, 240, 155, 180, 170, 242, 212, 191, 163,  78, 218, 137, 194, 175, 110,
     43, 119, 224,  71, 122, 142,  42, 160, 104,  48, 247, 103,  15,  11, 138, 239,
];
