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

//! Trait-object collaborators the sync core is built against but does not
//! own: routing table, transport, storage, validation, and the event bus.
//! Concrete implementations live in the embedding node; this crate only
//! depends on these interfaces, the same way `grin::sync` depends on
//! `chain::Chain` and `p2p::Peers` rather than owning storage or networking.

use std::fmt;

use crate::identity::ChainIdentity;
use crate::wire::WireBlock;

/// Opaque peer identifier. The sync core never interprets peer ids beyond
/// equality/ordering/hashing; the transport and routing table assign them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub Vec<u8>);

impl PeerId {
	pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
		PeerId(bytes.into())
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for b in self.0.iter().take(8) {
			write!(f, "{:02x}", b)?;
		}
		Ok(())
	}
}

/// Connection state of a peer as known to the transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Connected,
	Disconnected,
}

/// A chain-summary fact, equivalent to `ChainQuery::get_chain_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ChainInfo {
	pub height: u64,
	pub best_block_hash: [u8; 32],
}

/// The Kademlia-style routing table. Out of scope per the specification;
/// this crate only calls through it.
pub trait RoutingTable: Send + Sync {
	/// Returns up to `n` peers closest to `key`, optionally filtering by
	/// declared support for `protocol` when the implementation can do so
	/// more cheaply than a post-hoc filter.
	fn find_closest_peers(&self, key: &[u8], n: usize, protocol: Option<&str>) -> Vec<PeerId>;

	/// Peers the process currently holds a live connection to.
	fn connected_peers(&self) -> Vec<(PeerId, ConnectionState)>;

	/// Whether `peer` has `protocol` cached in the local peerstore (may be
	/// true even if not currently connected).
	fn supports_protocol(&self, peer: &PeerId, protocol: &str) -> bool;

	/// Statically configured bootstrap peers, excluding any well-known
	/// public discovery-only bootstraps.
	fn bootstrap_peers(&self) -> Vec<PeerId>;

	/// This process's own peer id, so it can be excluded from candidacy.
	fn local_peer_id(&self) -> PeerId;
}

/// The P2P transport: a blocking request/response call plus a registration
/// point for inbound stream handlers (the registration side is exercised
/// by the embedding binary, not this crate).
pub trait Transport: Send + Sync {
	/// Issues `protocol` against `peer` with `request`, returning the raw
	/// response bytes or an error whose message is used for failure
	/// classification (see [`crate::error::classify_failure`]).
	fn call(
		&self,
		peer: &PeerId,
		protocol: &str,
		request: Vec<u8>,
		timeout: std::time::Duration,
	) -> Result<Vec<u8>, String>;
}

/// Read-only chain summary queries.
pub trait ChainQuery: Send + Sync {
	fn get_chain_info(&self) -> Result<ChainInfo, String>;
}

/// Read-only block lookups by height.
pub trait QueryService: Send + Sync {
	fn get_block_by_height(&self, height: u64) -> Result<Option<WireBlock>, String>;
}

/// Deterministic block hashing, kept external so the sync core never
/// depends on the concrete block format.
pub trait BlockHasher: Send + Sync {
	fn hash_block(&self, block: &WireBlock) -> [u8; 32];
}

/// Stateless structural validation of an inbound block.
pub trait BlockValidator: Send + Sync {
	fn validate_block(&self, block: &WireBlock) -> Result<(), String>;
}

/// Marker returned by [`BlockProcessor::process_block`] when another
/// subsystem has already applied this exact block; the sync loop treats
/// this as success, not failure.
pub const ERR_BLOCK_ALREADY_PROCESSED: &str = "block already processed";

/// Applies a validated block to local storage.
pub trait BlockProcessor: Send + Sync {
	/// Returns `Err(ERR_BLOCK_ALREADY_PROCESSED)` when the block has
	/// already been applied by a racing subsystem; any other `Err` aborts
	/// the batch.
	fn process_block(&self, block: &WireBlock) -> Result<(), String>;
}

/// Handles an automatic reorg once the sync client has assembled the
/// fork's blocks. Implemented by chain storage, external to this crate.
pub trait ForkHandler: Send + Sync {
	fn handle_fork_with_external_blocks(
		&self,
		ancestor_height: u64,
		fork_tip: &WireBlock,
		blocks: &[WireBlock],
	) -> Result<(), String>;
}

/// Idempotent key/value staging area for out-of-order blocks, keyed
/// `sync_pending_<10-digit-height>_<8-char-prefix>`.
pub trait TempStore: Send + Sync {
	fn put(&self, key: &str, value: Vec<u8>);
	fn get(&self, key: &str) -> Option<Vec<u8>>;
	fn delete(&self, key: &str);
}

/// Severity of a published corruption event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionSeverity {
	Warning,
	Critical,
}

/// Phase in which a corruption event was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionPhase {
	Apply,
	Reorg,
}

/// A `corruption.detected` event published to the pub/sub event bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptionEvent {
	pub kind: &'static str,
	pub phase: CorruptionPhase,
	pub severity: CorruptionSeverity,
	pub message: String,
}

/// The pub/sub event bus. Out of scope; this crate only publishes to it.
pub trait EventBus: Send + Sync {
	fn publish_corruption(&self, event: CorruptionEvent);
}
