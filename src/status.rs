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

//! Status machine and lightweight probe (C8). `check_sync` is the
//! non-blocking status query the embedding node polls; `probe_sync` is the
//! serial, bounded-sample hello-v2 dispatch the periodic scheduler uses to
//! decide whether a full sync is warranted without paying for one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::client::{parse_hello_tag, SyncClient};
use crate::config::{NodeRole, StartupMode, SyncConfig};
use crate::external::PeerId;
use crate::protocol_handlers::HelloRelation;
use crate::sync_state::ActiveSyncTask;
use crate::wire::SyncRequest;

/// Coarse-grained sync status computed on demand from local/network
/// height and the active-task state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatusLabel {
	Bootstrapping,
	Degraded,
	Synced,
	Syncing,
	Error,
}

/// A point-in-time status snapshot returned by [`StatusApi::check_sync`].
#[derive(Clone, Debug)]
pub struct SystemSyncStatus {
	pub label: SyncStatusLabel,
	pub local_height: u64,
	pub network_height: u64,
	pub progress_percent: f64,
	pub error_message: Option<String>,
}

/// Outcome of the lightweight probe.
#[derive(Clone, Debug, Default)]
pub struct ProbeOutcome {
	pub should_full_sync: bool,
	pub reason: &'static str,
	pub network_tip: u64,
	pub hint_peer: Option<PeerId>,
	pub fork_detected: bool,
	pub sampled_peers: usize,
	pub hello_success: usize,
}

struct UpToDateCache {
	observed_at: Instant,
	local_height: u64,
	network_height: u64,
}

/// Status and probe surface, built on top of the same collaborators and
/// registries the sync client uses, so an operator can query status
/// without contending with an in-flight trigger.
pub struct StatusApi {
	client: Arc<SyncClient>,
	up_to_date_cache: RwLock<Option<UpToDateCache>>,
}

impl StatusApi {
	pub fn new(client: Arc<SyncClient>) -> Self {
		StatusApi {
			client,
			up_to_date_cache: RwLock::new(None),
		}
	}

	/// Computes the current status. Configuration errors observed by the
	/// last `trigger_sync` take priority over the height-derived machine.
	pub fn check_sync(&self) -> SystemSyncStatus {
		if let Some(err) = self.client.config_error() {
			return SystemSyncStatus {
				label: SyncStatusLabel::Error,
				local_height: 0,
				network_height: 0,
				progress_percent: 0.0,
				error_message: Some(err),
			};
		}

		let cfg = self.client.config();
		let window_mins = cfg.advanced.up_to_date_silence_window_mins.max(0) as u64;
		let window = Duration::from_secs(window_mins * 60);
		if let Some(cached) = self.up_to_date_cache.read().as_ref() {
			if cached.observed_at.elapsed() < window {
				return SystemSyncStatus {
					label: SyncStatusLabel::Synced,
					local_height: cached.local_height,
					network_height: cached.network_height,
					progress_percent: 100.0,
					error_message: None,
				};
			}
		}

		let local_height = self.client.chain().get_chain_info().map(|i| i.height).unwrap_or(0);
		let network_height = self.client.diagnostics.snapshot().network_height;
		let active = self.client.sync_state.snapshot();

		let status = self.classify(&cfg, local_height, network_height, active.as_ref());
		if status.label == SyncStatusLabel::Synced {
			*self.up_to_date_cache.write() = Some(UpToDateCache {
				observed_at: Instant::now(),
				local_height,
				network_height,
			});
		}
		status
	}

	fn classify(
		&self,
		cfg: &SyncConfig,
		local_height: u64,
		network_height: u64,
		active: Option<&ActiveSyncTask>,
	) -> SystemSyncStatus {
		if cfg.startup_mode == StartupMode::FromNetwork && cfg.require_trusted_checkpoint {
			let incomplete = !matches!(&cfg.trusted_checkpoint, Some(c) if !c.block_hash.is_empty());
			if incomplete {
				return SystemSyncStatus {
					label: SyncStatusLabel::Error,
					local_height,
					network_height,
					progress_percent: 0.0,
					error_message: Some(
						"require_trusted_checkpoint is set but trusted_checkpoint is incomplete".to_string(),
					),
				};
			}
		}

		if cfg.startup_mode == StartupMode::FromGenesis
			&& cfg.node_role == NodeRole::Consensus
			&& local_height == 0
			&& network_height == 0
			&& !cfg.require_trusted_checkpoint
		{
			return SystemSyncStatus {
				label: SyncStatusLabel::Synced,
				local_height,
				network_height,
				progress_percent: 100.0,
				error_message: None,
			};
		}

		if network_height == 0 && local_height == 0 {
			return no_error(SyncStatusLabel::Bootstrapping, local_height, network_height, 0.0);
		}
		if network_height == 0 && local_height > 0 {
			return no_error(SyncStatusLabel::Degraded, local_height, network_height, 100.0);
		}
		if local_height >= network_height {
			return no_error(SyncStatusLabel::Synced, local_height, network_height, 100.0);
		}
		if let Some(task) = active {
			let progress = if task.target_height == 0 {
				0.0
			} else {
				(local_height as f64 / task.target_height as f64 * 100.0).min(100.0)
			};
			return no_error(SyncStatusLabel::Syncing, local_height, network_height, progress);
		}
		if local_height == 0 {
			return no_error(SyncStatusLabel::Bootstrapping, local_height, network_height, 0.0);
		}
		let progress = (local_height as f64 / network_height as f64 * 100.0).min(100.0);
		no_error(SyncStatusLabel::Degraded, local_height, network_height, progress)
	}

	/// Serially dispatches hello-v2 to a bounded candidate sample and
	/// decides whether a full sync is warranted. Skips entirely while a
	/// sync is already active; decision priority is remote-ahead over
	/// fork-detected over no-action.
	pub fn probe_sync(&self) -> ProbeOutcome {
		if self.client.sync_state.has_active() {
			return ProbeOutcome {
				reason: "sync already active",
				..Default::default()
			};
		}

		let chain_info = match self.client.chain().get_chain_info() {
			Ok(info) => info,
			Err(_) => {
				return ProbeOutcome {
					reason: "chain query failed",
					..Default::default()
				}
			}
		};

		let candidates = self.client.selector().select_with_fallback(&chain_info, false);
		if candidates.is_empty() {
			return ProbeOutcome {
				reason: "no candidates",
				network_tip: chain_info.height,
				..Default::default()
			};
		}

		let cfg = self.client.config();
		let sample_size = cfg.advanced.max_concurrent_requests.clamp(1, 5);
		let timeout = Duration::from_millis((cfg.advanced.read_timeout_ms / 2).max(1));
		let protocol = self.client.protocol(crate::PROTOCOL_HELLO_V2);

		let locator = crate::locator::build_locator(chain_info.height, |h| {
			self.client
				.chain()
				.get_chain_info()
				.ok()
				.filter(|_| h == chain_info.height)
				.map(|i| i.best_block_hash)
		});
		let locator_bytes = crate::locator::encode_locator(&locator);

		let mut ahead_hint: Option<(PeerId, u64)> = None;
		let mut fork_hint: Option<PeerId> = None;
		let mut fork_detected = false;
		let mut hello_success = 0usize;
		let mut network_tip = chain_info.height;
		let mut sampled = 0usize;

		for peer in candidates.iter().take(sample_size) {
			sampled += 1;
			let req = SyncRequest::hello_v2(
				self.client.next_request_id(),
				Vec::new(),
				locator_bytes.clone(),
				chain_info.height,
				self.client.identity().clone(),
			);
			let resp = match self.client.call(peer, &protocol, &req, timeout) {
				Ok(r) if r.success => r,
				_ => continue,
			};
			hello_success += 1;
			let (relation, remote_tip, _ancestor) = parse_hello_tag(&resp.pagination_reason);
			network_tip = network_tip.max(remote_tip);
			match relation {
				HelloRelation::RemoteAheadSameChain => {
					if ahead_hint.as_ref().map(|(_, h)| remote_tip > *h).unwrap_or(true) {
						ahead_hint = Some((peer.clone(), remote_tip));
					}
				}
				HelloRelation::ForkDetected => {
					fork_detected = true;
					if fork_hint.is_none() {
						fork_hint = Some(peer.clone());
					}
				}
				_ => {}
			}
		}

		if let Some((peer, _)) = ahead_hint {
			return ProbeOutcome {
				should_full_sync: true,
				reason: "remote ahead on the same chain",
				network_tip,
				hint_peer: Some(peer),
				fork_detected,
				sampled_peers: sampled,
				hello_success,
			};
		}
		if fork_detected {
			return ProbeOutcome {
				should_full_sync: true,
				reason: "fork detected against sampled peer",
				network_tip,
				hint_peer: fork_hint,
				fork_detected,
				sampled_peers: sampled,
				hello_success,
			};
		}
		ProbeOutcome {
			should_full_sync: false,
			reason: "no action: peers up to date or behind",
			network_tip,
			hint_peer: None,
			fork_detected: false,
			sampled_peers: sampled,
			hello_success,
		}
	}
}

fn no_error(label: SyncStatusLabel, local_height: u64, network_height: u64, progress_percent: f64) -> SystemSyncStatus {
	SystemSyncStatus {
		label,
		local_height,
		network_height,
		progress_percent,
		error_message: None,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::client::{SyncClient, SyncCollaborators};
	use crate::config::AdvancedSyncConfig;
	use crate::diagnostics::Diagnostics;
	use crate::external::{
		BlockHasher, BlockProcessor, BlockValidator, ChainInfo, ChainQuery, ConnectionState,
		CorruptionEvent, EventBus, ForkHandler, QueryService, RoutingTable, TempStore, Transport,
	};
	use crate::identity::ChainIdentity;
	use crate::peer_health::PeerHealthRegistry;
	use crate::sync_state::{PeerSyncCache, SyncState};
	use crate::wire::WireBlock;
	use std::sync::Mutex;

	struct FakeChain(Mutex<ChainInfo>);
	impl ChainQuery for FakeChain {
		fn get_chain_info(&self) -> Result<ChainInfo, String> {
			Ok(*self.0.lock().unwrap())
		}
	}
	struct FakeQuery;
	impl QueryService for FakeQuery {
		fn get_block_by_height(&self, _h: u64) -> Result<Option<WireBlock>, String> {
			Ok(None)
		}
	}
	struct FakeHasher;
	impl BlockHasher for FakeHasher {
		fn hash_block(&self, b: &WireBlock) -> [u8; 32] {
			b.hash
		}
	}
	struct FakeValidator;
	impl BlockValidator for FakeValidator {
		fn validate_block(&self, _b: &WireBlock) -> Result<(), String> {
			Ok(())
		}
	}
	struct FakeProcessor;
	impl BlockProcessor for FakeProcessor {
		fn process_block(&self, _b: &WireBlock) -> Result<(), String> {
			Ok(())
		}
	}
	struct FakeForkHandler;
	impl ForkHandler for FakeForkHandler {
		fn handle_fork_with_external_blocks(&self, _a: u64, _t: &WireBlock, _b: &[WireBlock]) -> Result<(), String> {
			Ok(())
		}
	}
	struct FakeTempStore;
	impl TempStore for FakeTempStore {
		fn put(&self, _k: &str, _v: Vec<u8>) {}
		fn get(&self, _k: &str) -> Option<Vec<u8>> {
			None
		}
		fn delete(&self, _k: &str) {}
	}
	struct FakeEventBus;
	impl EventBus for FakeEventBus {
		fn publish_corruption(&self, _e: CorruptionEvent) {}
	}
	struct FakeRouting;
	impl RoutingTable for FakeRouting {
		fn find_closest_peers(&self, _k: &[u8], _n: usize, _p: Option<&str>) -> Vec<PeerId> {
			Vec::new()
		}
		fn connected_peers(&self) -> Vec<(PeerId, ConnectionState)> {
			Vec::new()
		}
		fn supports_protocol(&self, _p: &PeerId, _proto: &str) -> bool {
			false
		}
		fn bootstrap_peers(&self) -> Vec<PeerId> {
			Vec::new()
		}
		fn local_peer_id(&self) -> PeerId {
			PeerId::new(vec![0])
		}
	}
	struct FakeTransport;
	impl Transport for FakeTransport {
		fn call(&self, _p: &PeerId, _proto: &str, _req: Vec<u8>, _t: std::time::Duration) -> Result<Vec<u8>, String> {
			Err("no route to peer".to_string())
		}
	}

	fn make_client(height: u64) -> Arc<SyncClient> {
		let collab = SyncCollaborators {
			transport: Arc::new(FakeTransport),
			routing: Arc::new(FakeRouting),
			chain: Arc::new(FakeChain(Mutex::new(ChainInfo { height, best_block_hash: [1u8; 32] }))),
			query: Arc::new(FakeQuery),
			hasher: Arc::new(FakeHasher),
			validator: Arc::new(FakeValidator),
			processor: Arc::new(FakeProcessor),
			fork_handler: Arc::new(FakeForkHandler),
			temp_store: Arc::new(FakeTempStore),
			event_bus: Arc::new(FakeEventBus),
		};
		Arc::new(SyncClient::new(
			collab,
			ChainIdentity::new(1, "main", [9u8; 32]),
			SyncConfig {
				advanced: AdvancedSyncConfig::default(),
				..SyncConfig::default()
			},
			None,
			Arc::new(PeerHealthRegistry::default()),
			Arc::new(SyncState::default()),
			Arc::new(PeerSyncCache::default()),
			Arc::new(Diagnostics::default()),
		))
	}

	#[test]
	fn bootstrapping_when_both_heights_zero() {
		let client = make_client(0);
		let status = StatusApi::new(client).check_sync();
		assert_eq!(status.label, SyncStatusLabel::Bootstrapping);
	}

	#[test]
	fn degraded_when_local_ahead_of_unknown_network() {
		let client = make_client(5);
		let status = StatusApi::new(client).check_sync();
		assert_eq!(status.label, SyncStatusLabel::Degraded);
		assert_eq!(status.progress_percent, 100.0);
	}

	#[test]
	fn synced_when_local_meets_network() {
		let client = make_client(5);
		client.diagnostics.set_heights(5, 5, None);
		let status = StatusApi::new(client).check_sync();
		assert_eq!(status.label, SyncStatusLabel::Synced);
	}

	#[test]
	fn error_when_checkpoint_required_but_missing() {
		let client = make_client(0);
		client.set_config(SyncConfig {
			startup_mode: StartupMode::FromNetwork,
			require_trusted_checkpoint: true,
			trusted_checkpoint: None,
			..SyncConfig::default()
		});
		let status = StatusApi::new(client).check_sync();
		assert_eq!(status.label, SyncStatusLabel::Error);
	}

	#[test]
	fn consensus_dev_node_is_synced_at_genesis() {
		let client = make_client(0);
		client.set_config(SyncConfig {
			startup_mode: StartupMode::FromGenesis,
			node_role: NodeRole::Consensus,
			..SyncConfig::default()
		});
		let status = StatusApi::new(client).check_sync();
		assert_eq!(status.label, SyncStatusLabel::Synced);
	}

	#[test]
	fn probe_skips_when_sync_already_active() {
		let client = make_client(5);
		client.sync_state.try_acquire("sync-1");
		let outcome = StatusApi::new(client).probe_sync();
		assert!(!outcome.should_full_sync);
		assert_eq!(outcome.reason, "sync already active");
	}

	#[test]
	fn probe_reports_no_candidates() {
		let client = make_client(5);
		let outcome = StatusApi::new(client).probe_sync();
		assert!(!outcome.should_full_sync);
		assert_eq!(outcome.reason, "no candidates");
	}
}
