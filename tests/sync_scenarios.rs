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

//! End-to-end scenario tests driving [`weisyn_sync::api::SyncEngine`]
//! against an in-memory peer network. Each peer is served by
//! [`weisyn_sync::protocol_handlers::ProtocolHandlers`] the same way an
//! embedding node would wire its own inbound stream handlers, so these
//! exercise the real request/response wire path rather than stubbing it out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weisyn_sync::diagnostics::StageLabel;
use weisyn_sync::error::FailureKind;
use weisyn_sync::external::{
	BlockHasher, BlockProcessor, BlockValidator, ChainInfo, ChainQuery, ConnectionState,
	CorruptionEvent, EventBus, ForkHandler, PeerId, QueryService, RoutingTable, TempStore,
	Transport, ERR_BLOCK_ALREADY_PROCESSED,
};
use weisyn_sync::protocol_handlers::ProtocolHandlers;
use weisyn_sync::wire::{decode_request, encode_response, SyncRequest, WireBlock};
use weisyn_sync::{
	ChainIdentity, SyncCollaborators, SyncConfig, SyncContext, PROTOCOL_BLOCKS_V2,
	PROTOCOL_HELLO_V2, PROTOCOL_KBUCKET_V1,
};

// ---- Shared in-memory chain, reused as the local node's storage and as
// every peer's served chain. ---------------------------------------------

struct Ledger {
	info: Mutex<ChainInfo>,
	blocks: Mutex<HashMap<u64, WireBlock>>,
}

impl Ledger {
	fn new(blocks: Vec<WireBlock>) -> Arc<Ledger> {
		let top = blocks.iter().max_by_key(|b| b.height).cloned().expect("at least one block");
		let mut map = HashMap::new();
		for b in blocks {
			map.insert(b.height, b);
		}
		Arc::new(Ledger {
			info: Mutex::new(ChainInfo { height: top.height, best_block_hash: top.hash }),
			blocks: Mutex::new(map),
		})
	}

	fn height(&self) -> u64 {
		self.info.lock().unwrap().height
	}

	fn tip_hash(&self, height: u64) -> Option<[u8; 32]> {
		self.blocks.lock().unwrap().get(&height).map(|b| b.hash)
	}
}

impl ChainQuery for Ledger {
	fn get_chain_info(&self) -> Result<ChainInfo, String> {
		Ok(*self.info.lock().unwrap())
	}
}

impl QueryService for Ledger {
	fn get_block_by_height(&self, height: u64) -> Result<Option<WireBlock>, String> {
		Ok(self.blocks.lock().unwrap().get(&height).cloned())
	}
}

fn tag_hash(height: u64, tag: u8) -> [u8; 32] {
	let mut h = [0u8; 32];
	h[0..8].copy_from_slice(&height.to_be_bytes());
	h[31] = tag;
	h
}

fn tag_block(height: u64, tag: u8) -> WireBlock {
	WireBlock { height, hash: tag_hash(height, tag), payload: vec![0u8; 4] }
}

/// A chain from genesis to `up_to`, every block on the same `tag` branch.
fn chain(up_to: u64, tag: u8) -> Vec<WireBlock> {
	(0..=up_to).map(|h| tag_block(h, tag)).collect()
}

/// A chain that shares `genesis_tag` at height 0 but diverges onto
/// `branch_tag` from height 1 onward -- two peers built from this with
/// different `branch_tag`s share a common ancestor only at the genesis.
fn chain_with_fork(up_to: u64, genesis_tag: u8, branch_tag: u8) -> Vec<WireBlock> {
	(0..=up_to)
		.map(|h| if h == 0 { tag_block(0, genesis_tag) } else { tag_block(h, branch_tag) })
		.collect()
}

// ---- Collaborators shared by the local node and every peer. -------------

struct SimpleHasher;
impl BlockHasher for SimpleHasher {
	fn hash_block(&self, block: &WireBlock) -> [u8; 32] {
		block.hash
	}
}

struct AlwaysValid;
impl BlockValidator for AlwaysValid {
	fn validate_block(&self, _block: &WireBlock) -> Result<(), String> {
		Ok(())
	}
}

/// Applies blocks to the local ledger, treating a re-applied height as the
/// idempotent-success case the sync loop expects from a real processor.
struct LocalProcessor(Arc<Ledger>);
impl BlockProcessor for LocalProcessor {
	fn process_block(&self, block: &WireBlock) -> Result<(), String> {
		let mut info = self.0.info.lock().unwrap();
		if block.height <= info.height {
			return Err(ERR_BLOCK_ALREADY_PROCESSED.to_string());
		}
		if block.height != info.height + 1 {
			return Err("non-contiguous apply".to_string());
		}
		self.0.blocks.lock().unwrap().insert(block.height, block.clone());
		info.height = block.height;
		info.best_block_hash = block.hash;
		Ok(())
	}
}

struct LocalForkHandler(Arc<Ledger>);
impl ForkHandler for LocalForkHandler {
	fn handle_fork_with_external_blocks(
		&self,
		ancestor_height: u64,
		fork_tip: &WireBlock,
		blocks: &[WireBlock],
	) -> Result<(), String> {
		{
			let mut stored = self.0.blocks.lock().unwrap();
			stored.retain(|h, _| *h <= ancestor_height);
			for b in blocks {
				stored.insert(b.height, b.clone());
			}
		}
		let mut info = self.0.info.lock().unwrap();
		info.height = fork_tip.height;
		info.best_block_hash = fork_tip.hash;
		Ok(())
	}
}

#[derive(Default)]
struct MemTempStore(Mutex<HashMap<String, Vec<u8>>>);
impl TempStore for MemTempStore {
	fn put(&self, key: &str, value: Vec<u8>) {
		self.0.lock().unwrap().insert(key.to_string(), value);
	}
	fn get(&self, key: &str) -> Option<Vec<u8>> {
		self.0.lock().unwrap().get(key).cloned()
	}
	fn delete(&self, key: &str) {
		self.0.lock().unwrap().remove(key);
	}
}

#[derive(Default)]
struct RecordingEventBus(Mutex<Vec<CorruptionEvent>>);
impl EventBus for RecordingEventBus {
	fn publish_corruption(&self, event: CorruptionEvent) {
		self.0.lock().unwrap().push(event);
	}
}
impl RecordingEventBus {
	fn count(&self) -> usize {
		self.0.lock().unwrap().len()
	}
}

struct FixedRouting {
	local: PeerId,
	peers: Vec<PeerId>,
}
impl RoutingTable for FixedRouting {
	fn find_closest_peers(&self, _key: &[u8], _n: usize, _protocol: Option<&str>) -> Vec<PeerId> {
		self.peers.clone()
	}
	fn connected_peers(&self) -> Vec<(PeerId, ConnectionState)> {
		self.peers.iter().cloned().map(|p| (p, ConnectionState::Connected)).collect()
	}
	fn supports_protocol(&self, _peer: &PeerId, _protocol: &str) -> bool {
		true
	}
	fn bootstrap_peers(&self) -> Vec<PeerId> {
		Vec::new()
	}
	fn local_peer_id(&self) -> PeerId {
		self.local.clone()
	}
}

/// What a peer does when called: serve real protocol responses off its own
/// ledger and identity, or fail outright to simulate an unreachable/timed
/// out remote.
enum PeerBehavior {
	Node(Arc<Ledger>, ChainIdentity),
	Fail(&'static str),
}

/// Dispatches an inbound request the same way an embedding node's stream
/// handler registration would: decode, route by protocol id to the right
/// [`ProtocolHandlers`] method, encode the response.
struct Network(HashMap<PeerId, PeerBehavior>);
impl Transport for Network {
	fn call(&self, peer: &PeerId, protocol: &str, request: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, String> {
		let behavior = self.0.get(peer).ok_or_else(|| "no route to peer".to_string())?;
		let (ledger, identity) = match behavior {
			PeerBehavior::Fail(message) => return Err((*message).to_string()),
			PeerBehavior::Node(ledger, identity) => (ledger, identity),
		};
		let req: SyncRequest = decode_request(&request).map_err(|e| e.to_string())?;
		let hasher = SimpleHasher;
		let handlers = ProtocolHandlers {
			chain: ledger.as_ref(),
			query: ledger.as_ref(),
			hasher: &hasher,
			local_identity: Some(identity.clone()),
		};

		let resp = if protocol == PROTOCOL_HELLO_V2 {
			let locator = weisyn_sync::locator::decode_locator(&req.routing_key);
			let remote_tip_hash = locator.first().map(|e| e.hash).unwrap_or([0u8; 32]);
			handlers.handle_hello_v2(&req, req.local_height, remote_tip_hash)
		} else if protocol == PROTOCOL_BLOCKS_V2 {
			handlers.handle_blocks_v2(&req)
		} else if protocol == PROTOCOL_KBUCKET_V1 {
			if req.routing_key == b"height-query" && req.local_height == 0 {
				handlers.handle_height_query(&req)
			} else {
				handlers.handle_kbucket_sync(&req)
			}
		} else {
			return Err("protocol not supported by remote".to_string());
		};

		encode_response(&resp).map_err(|e| e.to_string())
	}
}

fn build_engine(
	local_ledger: Arc<Ledger>,
	identity: ChainIdentity,
	peers: Vec<PeerId>,
	network: HashMap<PeerId, PeerBehavior>,
	event_bus: Arc<RecordingEventBus>,
) -> Arc<weisyn_sync::api::SyncEngine> {
	let collab = SyncCollaborators {
		transport: Arc::new(Network(network)),
		routing: Arc::new(FixedRouting { local: PeerId::new(vec![0]), peers }),
		chain: Arc::clone(&local_ledger),
		query: Arc::clone(&local_ledger),
		hasher: Arc::new(SimpleHasher),
		validator: Arc::new(AlwaysValid),
		processor: Arc::new(LocalProcessor(Arc::clone(&local_ledger))),
		fork_handler: Arc::new(LocalForkHandler(Arc::clone(&local_ledger))),
		temp_store: Arc::new(MemTempStore::default()),
		event_bus,
	};
	weisyn_sync::api::SyncEngine::start(collab, identity, SyncConfig::default(), None)
}

// ---- Scenarios ------------------------------------------------------------

#[test]
fn catch_up_from_behind_selects_median_height_peer() {
	let local_ledger = Ledger::new(vec![tag_block(0, 0)]);
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);

	let peer_a = PeerId::new(vec![1]);
	let peer_b = PeerId::new(vec![2]);
	let peer_c = PeerId::new(vec![3]);

	let ledger_10 = Ledger::new(chain(10, 0));
	let ledger_9 = Ledger::new(chain(9, 0));

	let mut network = HashMap::new();
	network.insert(peer_a.clone(), PeerBehavior::Node(Arc::clone(&ledger_10), identity.clone()));
	network.insert(peer_b.clone(), PeerBehavior::Node(Arc::clone(&ledger_10), identity.clone()));
	network.insert(peer_c.clone(), PeerBehavior::Node(ledger_9, identity.clone()));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(
		Arc::clone(&local_ledger),
		identity,
		vec![peer_a, peer_b, peer_c],
		network,
		Arc::clone(&event_bus),
	);

	let result = engine.trigger_sync(SyncContext::new());
	assert!(result.is_ok());
	assert_eq!(local_ledger.height(), 10);
	assert_eq!(event_bus.count(), 0);
	engine.shutdown();
}

#[test]
fn transient_timeout_falls_back_to_the_next_peer() {
	let local_ledger = Ledger::new(chain(3, 0));
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);

	let peer_a = PeerId::new(vec![1]);
	let peer_b = PeerId::new(vec![2]);
	let ledger_b = Ledger::new(chain(10, 0));

	let mut network = HashMap::new();
	network.insert(peer_a.clone(), PeerBehavior::Fail("i/o timeout"));
	network.insert(peer_b.clone(), PeerBehavior::Node(ledger_b, identity.clone()));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(
		Arc::clone(&local_ledger),
		identity,
		vec![peer_a.clone(), peer_b],
		network,
		Arc::clone(&event_bus),
	);

	let result = engine.trigger_sync(SyncContext::new());
	assert!(result.is_ok());
	assert_eq!(local_ledger.height(), 10);

	let failures = engine.sync_failure_history();
	assert!(failures.iter().any(|f| f.peer == peer_a && f.kind == FailureKind::Timeout));
	engine.shutdown();
}

#[test]
fn fork_detected_triggers_a_single_automatic_reorg() {
	// Both chains share only the genesis block; the local node sits on the
	// wrong branch (tag 1) while the peer holds the branch that should win
	// (tag 2).
	let local_ledger = Ledger::new(chain_with_fork(5, 9, 1));
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);

	let peer = PeerId::new(vec![1]);
	let peer_ledger = Ledger::new(chain_with_fork(5, 9, 2));

	let mut network = HashMap::new();
	network.insert(peer.clone(), PeerBehavior::Node(Arc::clone(&peer_ledger), identity.clone()));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(Arc::clone(&local_ledger), identity, vec![peer], network, Arc::clone(&event_bus));

	let result = engine.trigger_sync(SyncContext::new());
	assert!(result.is_ok());
	assert_eq!(local_ledger.height(), 5);
	assert_eq!(local_ledger.tip_hash(5), peer_ledger.tip_hash(5));
	assert_eq!(event_bus.count(), 0, "a successful reorg publishes no corruption event");
	engine.shutdown();
}

#[test]
fn fork_with_no_common_ancestor_aborts_with_missing_ancestor_error() {
	// No height, including genesis, agrees between the two chains.
	let local_ledger = Ledger::new(chain(5, 1));
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);

	let peer = PeerId::new(vec![1]);
	let peer_ledger = Ledger::new(chain(5, 2));

	let mut network = HashMap::new();
	network.insert(peer.clone(), PeerBehavior::Node(peer_ledger, identity.clone()));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(Arc::clone(&local_ledger), identity, vec![peer], network, Arc::clone(&event_bus));

	match engine.trigger_sync(SyncContext::new()) {
		Err(err) => assert!(err.to_string().contains("missing common ancestor"), "got: {}", err),
		Ok(()) => panic!("expected the reorg to abort"),
	}
	assert_eq!(local_ledger.height(), 5);
	assert_eq!(event_bus.count(), 1);
	engine.shutdown();
}

#[test]
fn incompatible_peer_is_marked_bad_on_identity_mismatch() {
	let local_ledger = Ledger::new(chain(2, 0));
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);
	let other_identity = ChainIdentity::new(1, "test", [0x22u8; 32]);

	let peer = PeerId::new(vec![1]);
	let peer_ledger = Ledger::new(chain(5, 0));

	let mut network = HashMap::new();
	network.insert(peer.clone(), PeerBehavior::Node(peer_ledger, other_identity));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(Arc::clone(&local_ledger), identity, vec![peer.clone()], network, Arc::clone(&event_bus));

	let result = engine.trigger_sync(SyncContext::new());
	assert!(result.is_ok());
	assert!(engine.peer_health_status(&peer).bad);

	let failures = engine.sync_failure_history();
	assert!(failures.iter().any(|f| f.peer == peer && f.kind == FailureKind::ChainIdentityMismatch));
	assert_eq!(local_ledger.height(), 2, "nothing should have been fetched from a rejected peer");
	engine.shutdown();
}

#[test]
fn all_peers_behind_local_is_a_successful_no_op() {
	let local_ledger = Ledger::new(chain(10, 0));
	let identity = ChainIdentity::new(1, "test", [0x11u8; 32]);

	let peer = PeerId::new(vec![1]);
	let peer_ledger = Ledger::new(chain(3, 0));

	let mut network = HashMap::new();
	network.insert(peer.clone(), PeerBehavior::Node(peer_ledger, identity.clone()));

	let event_bus = Arc::new(RecordingEventBus::default());
	let engine = build_engine(Arc::clone(&local_ledger), identity, vec![peer], network, Arc::clone(&event_bus));

	let result = engine.trigger_sync(SyncContext::new());
	assert!(result.is_ok());
	assert_eq!(local_ledger.height(), 10, "a node ahead of every peer never rewinds");

	let snapshot = engine.sync_diagnostics();
	assert_eq!(snapshot.stage, StageLabel::Completed);
	engine.shutdown();
}
