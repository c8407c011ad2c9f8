// Copyright 2026 The Weisyn Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chain identity and local tip, the two small immutable-ish facts the rest
//! of the sync core is built around.

use serde_derive::{Deserialize, Serialize};

/// Identifies a chain so two peers can tell whether they're even talking
/// about the same network before exchanging blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIdentity {
	pub chain_id: u64,
	pub network_id: String,
	pub genesis_hash: [u8; 32],
}

impl ChainIdentity {
	pub fn new(chain_id: u64, network_id: impl Into<String>, genesis_hash: [u8; 32]) -> Self {
		ChainIdentity {
			chain_id,
			network_id: network_id.into(),
			genesis_hash,
		}
	}

	/// Identities with an empty network id or an all-zero genesis hash
	/// disqualify any handshake.
	pub fn is_valid(&self) -> bool {
		!self.network_id.is_empty() && self.genesis_hash != [0u8; 32]
	}

	pub fn compatible_with(&self, other: &ChainIdentity) -> bool {
		self == other
	}
}

/// The locally known head of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LocalTip {
	pub height: u64,
	pub hash: [u8; 32],
}

impl LocalTip {
	pub fn new(height: u64, hash: [u8; 32]) -> Self {
		LocalTip { height, hash }
	}
}
