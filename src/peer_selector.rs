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

//! Ranks a candidate peer list for a sync attempt out of the routing
//! table, with a three-tier fallback when the primary selection comes up
//! empty, grounded on `p2p::Peers::most_work_peers`/`connected_peers`'s
//! filter-then-select shape.

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::config::KbucketSelectionStrategy;
use crate::external::{ChainInfo, ConnectionState, PeerId, RoutingTable};
use crate::peer_health::PeerHealthRegistry;

const HELLO_V2_PROTOCOL: &str = crate::PROTOCOL_HELLO_V2;

/// Selects and ranks candidates for a sync attempt.
pub struct PeerSelector<'a> {
	pub routing: &'a dyn RoutingTable,
	pub health: &'a PeerHealthRegistry,
	pub selection_count: usize,
	pub strategy: KbucketSelectionStrategy,
	pub protocol: &'a str,
}

impl<'a> PeerSelector<'a> {
	fn routing_key(&self, chain_info: &ChainInfo) -> Vec<u8> {
		if chain_info.best_block_hash != [0u8; 32] {
			chain_info.best_block_hash.to_vec()
		} else {
			format!("height-{}", chain_info.height).into_bytes()
		}
	}

	fn pool_size(&self) -> usize {
		(self.selection_count.saturating_mul(4)).max(16).min(64)
	}

	fn is_candidate(&self, peer: &PeerId, self_id: &PeerId, urgent: bool) -> bool {
		if peer == self_id {
			return false;
		}
		if self.health.is_bad(peer) {
			if !(urgent && self.health.is_bad_peer_near_expiry(peer)) {
				return false;
			}
		}
		if !self.health.is_healthy(peer) {
			return false;
		}
		true
	}

	/// Primary K-bucket selection, filtered and narrowed by strategy.
	pub fn select_candidates(&self, chain_info: &ChainInfo) -> Vec<PeerId> {
		self.select_candidates_urgent(chain_info, false)
	}

	fn select_candidates_urgent(&self, chain_info: &ChainInfo, urgent: bool) -> Vec<PeerId> {
		let self_id = self.routing.local_peer_id();
		let key = self.routing_key(chain_info);
		let pool = self
			.routing
			.find_closest_peers(&key, self.pool_size(), Some(self.protocol));

		let filtered: Vec<PeerId> = pool
			.into_iter()
			.filter(|p| self.is_candidate(p, &self_id, urgent))
			.collect();

		let n = self.selection_count.min(32).max(1);
		match self.strategy {
			KbucketSelectionStrategy::Distance => filtered.into_iter().take(n).collect(),
			KbucketSelectionStrategy::Random => {
				let mut v = filtered;
				v.shuffle(&mut thread_rng());
				v.into_iter().take(n).collect()
			}
			KbucketSelectionStrategy::Mixed => {
				let half = n / 2;
				let mut closest: Vec<PeerId> = filtered.iter().take(half).cloned().collect();
				let mut rest: Vec<PeerId> = filtered.into_iter().skip(half).collect();
				rest.shuffle(&mut thread_rng());
				closest.extend(rest.into_iter().take(n - closest.len()));
				closest
			}
		}
	}

	fn connected_tier(&self, self_id: &PeerId) -> Vec<PeerId> {
		self.routing
			.connected_peers()
			.into_iter()
			.filter(|(p, state)| {
				*state == ConnectionState::Connected
					&& p != self_id
					&& !self.health.is_bad(p)
					&& self.routing.supports_protocol(p, self.protocol)
			})
			.map(|(p, _)| p)
			.collect()
	}

	/// Three-tier fallback: K-bucket (with health filter) -> connected
	/// peers declaring hello-v2 support -> configured bootstrap peers.
	/// Also applies the last-good-upstream short-circuit when the
	/// K-bucket result is empty.
	pub fn select_with_fallback(&self, chain_info: &ChainInfo, urgent: bool) -> Vec<PeerId> {
		let primary = self.select_candidates_urgent(chain_info, urgent);
		if !primary.is_empty() {
			return primary;
		}

		if let Some(last_good) = self.health.last_good_upstream() {
			let self_id = self.routing.local_peer_id();
			if last_good != self_id && !self.health.is_bad(&last_good) {
				let connected = self.routing.connected_peers();
				if connected
					.iter()
					.any(|(p, s)| *p == last_good && *s == ConnectionState::Connected)
				{
					debug!("peer selection falling back to last-good-upstream {}", last_good);
					return vec![last_good];
				}
			}
		}

		let self_id = self.routing.local_peer_id();
		let connected = self.connected_tier(&self_id);
		if !connected.is_empty() {
			debug!("peer selection falling back to connected-peer tier ({} candidates)", connected.len());
			return connected;
		}

		let bootstrap: Vec<PeerId> = self
			.routing
			.bootstrap_peers()
			.into_iter()
			.filter(|p| *p != self_id && !self.health.is_bad(p))
			.collect();
		if !bootstrap.is_empty() {
			debug!("peer selection falling back to bootstrap tier ({} candidates)", bootstrap.len());
		}
		bootstrap
	}
}
