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

//! Per-peer reputation: consecutive-failure circuit breaker, the longer-TTL
//! bad-peer set for semantic incompatibility, the low-height set for peers
//! observed behind the local tip, and the last-good-upstream memory that
//! stabilizes selection when the routing table briefly returns nothing.
//!
//! Every registry here is a process-wide singleton guarded by its own
//! `parking_lot::RwLock`, the same ownership shape as `p2p::Peers`'s
//! internal `Arc<RwLock<HashMap<...>>>`. Operations are infallible: they
//! always succeed, matching the spec's "failure is impossible" note.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{classify_failure, FailureKind};
use crate::external::PeerId;

const DEFAULT_CIRCUIT_THRESHOLD: u32 = 3;
const DEFAULT_CIRCUIT_RECOVERY: Duration = Duration::from_secs(5 * 60);
const DEFAULT_BAD_PEER_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_LOW_HEIGHT_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_UPSTREAM_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_UPSTREAM_MAX_FAILURES: u32 = 3;
/// Window within which a bad peer is considered "near expiry" and thus
/// admissible under emergency/urgent selection.
const BAD_PEER_NEAR_EXPIRY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Stage at which a failure was recorded, used to label Diagnostics
/// failure history accurately at each call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStage {
	HeightQuery,
	Hello,
	Blocks,
	Paginated,
	Reorg,
}

impl SyncStage {
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncStage::HeightQuery => "height_query",
			SyncStage::Hello => "hello",
			SyncStage::Blocks => "blocks",
			SyncStage::Paginated => "paginated",
			SyncStage::Reorg => "reorg",
		}
	}
}

#[derive(Clone, Debug)]
struct PeerHealth {
	consecutive_failures: u32,
	last_failure_reason: Option<FailureKind>,
	circuit_broken: bool,
	circuit_recovery_deadline: Option<Instant>,
}

impl Default for PeerHealth {
	fn default() -> Self {
		PeerHealth {
			consecutive_failures: 0,
			last_failure_reason: None,
			circuit_broken: false,
			circuit_recovery_deadline: None,
		}
	}
}

#[derive(Clone, Copy, Debug)]
struct UpstreamMemory {
	peer_index: usize,
	recorded_at: Instant,
	consecutive_failures: u32,
}

/// Tunable thresholds, configurable at startup; defaults mirror
/// `AdvancedSyncConfig`'s `circuit_breaker_*` and TTL fields.
#[derive(Clone, Copy, Debug)]
pub struct PeerHealthThresholds {
	pub circuit_threshold: u32,
	pub circuit_recovery: Duration,
	pub bad_peer_ttl: Duration,
	pub low_height_ttl: Duration,
	pub upstream_ttl: Duration,
	pub upstream_max_failures: u32,
}

impl Default for PeerHealthThresholds {
	fn default() -> Self {
		PeerHealthThresholds {
			circuit_threshold: DEFAULT_CIRCUIT_THRESHOLD,
			circuit_recovery: DEFAULT_CIRCUIT_RECOVERY,
			bad_peer_ttl: DEFAULT_BAD_PEER_TTL,
			low_height_ttl: DEFAULT_LOW_HEIGHT_TTL,
			upstream_ttl: DEFAULT_UPSTREAM_TTL,
			upstream_max_failures: DEFAULT_UPSTREAM_MAX_FAILURES,
		}
	}
}

/// Process-wide peer reputation registry.
pub struct PeerHealthRegistry {
	thresholds: PeerHealthThresholds,
	health: RwLock<HashMap<PeerId, PeerHealth>>,
	bad: RwLock<HashMap<PeerId, Instant>>,
	low_height: RwLock<HashMap<PeerId, (u64, Instant)>>,
	// The upstream peer id is stored alongside an index generation so
	// `PeerId` itself doesn't need to implement Copy.
	last_good_upstream: RwLock<Option<(PeerId, UpstreamMemory)>>,
}

impl Default for PeerHealthRegistry {
	fn default() -> Self {
		PeerHealthRegistry::new(PeerHealthThresholds::default())
	}
}

impl PeerHealthRegistry {
	pub fn new(thresholds: PeerHealthThresholds) -> Self {
		PeerHealthRegistry {
			thresholds,
			health: RwLock::new(HashMap::new()),
			bad: RwLock::new(HashMap::new()),
			low_height: RwLock::new(HashMap::new()),
			last_good_upstream: RwLock::new(None),
		}
	}

	/// Clears all process state. Tests reset singletons through this.
	pub fn reset(&self) {
		self.health.write().clear();
		self.bad.write().clear();
		self.low_height.write().clear();
		*self.last_good_upstream.write() = None;
	}

	pub fn record_failure(&self, peer: &PeerId, stage: SyncStage, message: &str) -> FailureKind {
		let kind = classify_failure(message);
		let mut map = self.health.write();
		let entry = map.entry(peer.clone()).or_default();
		entry.consecutive_failures += 1;
		entry.last_failure_reason = Some(kind);
		if entry.consecutive_failures >= self.thresholds.circuit_threshold {
			entry.circuit_broken = true;
			entry.circuit_recovery_deadline = Some(Instant::now() + self.thresholds.circuit_recovery);
			warn!(
				"peer {} tripped circuit breaker after {} consecutive {} failures at stage {}: {}",
				peer,
				entry.consecutive_failures,
				kind,
				stage.as_str(),
				message
			);
		} else {
			debug!(
				"peer {} failure #{} at stage {} ({}): {}",
				peer,
				entry.consecutive_failures,
				stage.as_str(),
				kind,
				message
			);
		}
		kind
	}

	pub fn record_success(&self, peer: &PeerId) {
		let mut map = self.health.write();
		let entry = map.entry(peer.clone()).or_default();
		entry.consecutive_failures = 0;
		entry.last_failure_reason = None;
		entry.circuit_broken = false;
		entry.circuit_recovery_deadline = None;
	}

	/// `true` unless the peer is currently circuit-broken. A broken flag
	/// whose recovery deadline has passed is lazily cleared here.
	pub fn is_healthy(&self, peer: &PeerId) -> bool {
		let mut map = self.health.write();
		match map.get_mut(peer) {
			None => true,
			Some(entry) => {
				if entry.circuit_broken {
					if let Some(deadline) = entry.circuit_recovery_deadline {
						if Instant::now() >= deadline {
							entry.circuit_broken = false;
							entry.circuit_recovery_deadline = None;
							entry.consecutive_failures = 0;
							return true;
						}
					}
					false
				} else {
					true
				}
			}
		}
	}

	pub fn clear_all_circuit_breakers(&self) {
		let mut map = self.health.write();
		for entry in map.values_mut() {
			entry.circuit_broken = false;
			entry.circuit_recovery_deadline = None;
			entry.consecutive_failures = 0;
		}
	}

	/// Marks a peer bad: used on chain-identity mismatches and other
	/// unrecoverable semantic violations. Longer TTL than the circuit
	/// breaker because it reflects incompatibility, not transience.
	pub fn mark_bad(&self, peer: &PeerId) {
		self.bad.write().insert(peer.clone(), Instant::now());
	}

	pub fn is_bad(&self, peer: &PeerId) -> bool {
		let mut bad = self.bad.write();
		match bad.get(peer) {
			None => false,
			Some(marked_at) => {
				if marked_at.elapsed() >= self.thresholds.bad_peer_ttl {
					bad.remove(peer);
					false
				} else {
					true
				}
			}
		}
	}

	/// Emergency-mode predicate: a bad peer whose TTL will expire within
	/// [`BAD_PEER_NEAR_EXPIRY_WINDOW`] is admissible in urgent context
	/// when no healthy peers remain.
	pub fn is_bad_peer_near_expiry(&self, peer: &PeerId) -> bool {
		let bad = self.bad.read();
		match bad.get(peer) {
			None => false,
			Some(marked_at) => {
				let elapsed = marked_at.elapsed();
				elapsed < self.thresholds.bad_peer_ttl
					&& self.thresholds.bad_peer_ttl - elapsed <= BAD_PEER_NEAR_EXPIRY_WINDOW
			}
		}
	}

	pub fn record_low_height(&self, peer: &PeerId, height: u64) {
		self.low_height.write().insert(peer.clone(), (height, Instant::now()));
	}

	pub fn is_low_height(&self, peer: &PeerId) -> bool {
		let mut map = self.low_height.write();
		match map.get(peer) {
			None => false,
			Some((_, recorded_at)) => {
				if recorded_at.elapsed() >= self.thresholds.low_height_ttl {
					map.remove(peer);
					false
				} else {
					true
				}
			}
		}
	}

	pub fn last_good_upstream(&self) -> Option<PeerId> {
		let guard = self.last_good_upstream.read();
		match guard.as_ref() {
			Some((peer, mem)) if mem.recorded_at.elapsed() < self.thresholds.upstream_ttl => {
				Some(peer.clone())
			}
			_ => None,
		}
	}

	pub fn set_last_good_upstream(&self, peer: &PeerId) {
		*self.last_good_upstream.write() = Some((
			peer.clone(),
			UpstreamMemory {
				peer_index: 0,
				recorded_at: Instant::now(),
				consecutive_failures: 0,
			},
		));
	}

	/// Records an upstream failure against whichever peer currently holds
	/// the last-good-upstream slot; once the consecutive-failure budget
	/// is exhausted the memory is cleared.
	pub fn record_upstream_failure(&self, peer: &PeerId) {
		let mut guard = self.last_good_upstream.write();
		let clear = match guard.as_mut() {
			Some((p, mem)) if p == peer => {
				mem.consecutive_failures += 1;
				mem.consecutive_failures >= self.thresholds.upstream_max_failures
			}
			_ => false,
		};
		if clear {
			*guard = None;
		}
	}
}
