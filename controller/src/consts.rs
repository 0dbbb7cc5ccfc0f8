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

// The main chain in the nat table, holding one jump rule per active
// loadbalancer. The operator is expected to jump here from PREROUTING.
pub const MAIN_CHAIN: &str = "iptableslb-prerouting";

// The chain in the filter table holding ACCEPT rules for backend endpoints.
// The operator is expected to jump here from FORWARD.
pub const FORWARD_CHAIN: &str = "iptableslb-forward";

// The nat chain used for hairpinning when a NAT-internal CIDR is configured.
pub const HAIRPIN_CHAIN: &str = "iptableslb-hairpinning";

// Prefix marking a chain name as one of ours.
pub const CHAIN_ID_PREFIX: &str = "LB$-";

// Total length of an encoded chain name: prefix plus base64 of 17 bytes.
pub const CHAIN_NAME_LEN: usize = 28;

// Seed for the rule-content hash embedded in chain names.
pub const CONTENT_HASH_SEED: u32 = 0xDEAD;
