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

//! Fingerprinting of a chain's rule list.
//!
//! The digest of the listed rule text goes into the chain name, which is
//! what lets a later sync detect that somebody edited the chain behind our
//! back: re-listing and re-hashing yields the embedded value iff the payload
//! is untouched.

use xxhash_rust::xxh32::Xxh32;

use crate::consts::CONTENT_HASH_SEED;
use crate::rules::strip_chain_tokens;

/// Hash a chain's rule listing as returned by the driver.
///
/// `-A <chain>` and `-N <chain>` token pairs are stripped first: they embed
/// the chain name, and the name in turn embeds this hash.
pub fn content_hash(rules: &[String]) -> u32 {
    let mut hasher = Xxh32::new(CONTENT_HASH_SEED);
    for rule in rules {
        hasher.update(strip_chain_tokens(rule).as_bytes());
    }
    hasher.digest()
}
