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

//! Periodic Scheduler (C6): a low-frequency ticker that notices a stalled
//! tip and escalates to an urgent full sync via the lightweight probe,
//! running on its own dedicated named OS thread the same way
//! `grin::sync::syncer::run_sync` spawns the sync loop itself.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::client::SyncClient;
use crate::context::SyncContext;
use crate::status::StatusApi;
use crate::stop_state::StopState;

/// Tick-to-tick state: local/network height plus the time the tip was
/// last observed to advance. Blocks on the wire carry an opaque payload
/// (see [`crate::wire::WireBlock`]) with no structured timestamp field,
/// so staleness is measured against wall-clock time since the last height
/// advance rather than a parsed block timestamp.
struct RuntimeState {
	local_height: u64,
	network_height: u64,
	last_block_time: Instant,
}

impl Default for RuntimeState {
	fn default() -> Self {
		RuntimeState {
			local_height: 0,
			network_height: 0,
			last_block_time: Instant::now(),
		}
	}
}

/// Drives the periodic probe/escalate loop. One instance per process,
/// spawned once at startup via [`Scheduler::spawn`].
pub struct Scheduler {
	client: Arc<SyncClient>,
	status: Arc<StatusApi>,
	state: RwLock<RuntimeState>,
	stop: StopState,
}

impl Scheduler {
	pub fn new(client: Arc<SyncClient>, status: Arc<StatusApi>) -> Arc<Self> {
		Arc::new(Scheduler {
			client,
			status,
			state: RwLock::new(RuntimeState::default()),
			stop: StopState::new(),
		})
	}

	/// The cancellation handle shared with the spawned thread; dropping
	/// this `Scheduler` does not stop the thread, calling `stop()` does.
	pub fn stop_handle(&self) -> StopState {
		self.stop.clone()
	}

	/// Spawns the scheduler loop on a dedicated `"sync-scheduler"` thread.
	pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
		let this = Arc::clone(self);
		thread::Builder::new()
			.name("sync-scheduler".to_string())
			.spawn(move || this.run())
			.expect("failed to spawn sync-scheduler thread")
	}

	fn run(&self) {
		loop {
			if self.stop.is_stopped() {
				return;
			}
			self.tick();
			let interval_secs = self.client.config().advanced.effective_time_check_interval_secs().max(0);
			let sleep_for = Duration::from_secs(interval_secs as u64).max(Duration::from_secs(5));
			if self.sleep_cancellable(sleep_for) {
				return;
			}
		}
	}

	/// Sleeps in short steps so a `stop()` during a long interval is
	/// observed promptly. Returns `true` if cancellation interrupted it.
	fn sleep_cancellable(&self, total: Duration) -> bool {
		let step = Duration::from_millis(200);
		let mut waited = Duration::from_millis(0);
		while waited < total {
			if self.stop.is_stopped() {
				return true;
			}
			let this_step = step.min(total - waited);
			thread::sleep(this_step);
			waited += this_step;
		}
		false
	}

	fn tick(&self) {
		let cfg = self.client.config();

		let expiry_mins = cfg.advanced.peer_sync_cache_expiry_mins.max(0) as u64;
		self.client.peer_cache.cleanup_expired(Duration::from_secs(expiry_mins * 60));

		if !cfg.advanced.time_check_enabled {
			return;
		}

		let chain_info = match self.client.chain().get_chain_info() {
			Ok(info) => info,
			Err(e) => {
				warn!("periodic scheduler: chain query failed, skipping tick: {}", e);
				return;
			}
		};

		let advanced = {
			let mut state = self.state.write();
			let advanced = chain_info.height > state.local_height;
			state.local_height = chain_info.height;
			state.network_height = state.network_height.max(chain_info.height);
			if advanced {
				state.last_block_time = Instant::now();
			}
			advanced
		};
		if advanced {
			return;
		}

		let threshold_secs = cfg.advanced.effective_time_check_threshold_secs().max(0);
		let threshold = Duration::from_secs((threshold_secs as u64).max(30));
		let stale = self.state.read().last_block_time.elapsed() > threshold;
		if !stale {
			return;
		}

		if self.client.sync_state.has_active() {
			debug!("periodic scheduler: tip stale but a sync is already active, skipping probe");
			return;
		}

		let probe = self.status.probe_sync();
		if probe.should_full_sync {
			info!(
				"periodic scheduler: stale tip (no height advance for {:?}), probe recommends full sync: {}",
				threshold, probe.reason
			);
			let mut ctx = SyncContext::new().urgent("scheduler_stale_tip");
			if let Some(peer) = probe.hint_peer {
				ctx = ctx.with_peer_hint(peer);
			}
			if let Err(e) = self.client.trigger_sync(ctx) {
				warn!("periodic scheduler: urgent trigger failed: {}", e);
			}
		} else {
			debug!(
				"periodic scheduler: stale tip but probe found nothing actionable ({}), suppressing repeat no-op sync",
				probe.reason
			);
			self.state.write().last_block_time = Instant::now();
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::client::SyncCollaborators;
	use crate::config::{AdvancedSyncConfig, SyncConfig};
	use crate::diagnostics::Diagnostics;
	use crate::external::{
		BlockHasher, BlockProcessor, BlockValidator, ChainInfo, ChainQuery, ConnectionState,
		CorruptionEvent, EventBus, ForkHandler, PeerId, QueryService, RoutingTable, TempStore,
		Transport,
	};
	use crate::identity::ChainIdentity;
	use crate::peer_health::PeerHealthRegistry;
	use crate::sync_state::{PeerSyncCache, SyncState};
	use crate::wire::WireBlock;
	use std::sync::Mutex;

	struct FakeChain(Mutex<u64>);
	impl ChainQuery for FakeChain {
		fn get_chain_info(&self) -> Result<ChainInfo, String> {
			Ok(ChainInfo { height: *self.0.lock().unwrap(), best_block_hash: [1u8; 32] })
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
		fn call(&self, _p: &PeerId, _proto: &str, _req: Vec<u8>, _t: Duration) -> Result<Vec<u8>, String> {
			Err("no route to peer".to_string())
		}
	}

	fn make_scheduler(height: u64) -> Arc<Scheduler> {
		let collab = SyncCollaborators {
			transport: Arc::new(FakeTransport),
			routing: Arc::new(FakeRouting),
			chain: Arc::new(FakeChain(Mutex::new(height))),
			query: Arc::new(FakeQuery),
			hasher: Arc::new(FakeHasher),
			validator: Arc::new(FakeValidator),
			processor: Arc::new(FakeProcessor),
			fork_handler: Arc::new(FakeForkHandler),
			temp_store: Arc::new(FakeTempStore),
			event_bus: Arc::new(FakeEventBus),
		};
		let client = Arc::new(SyncClient::new(
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
		));
		let status = Arc::new(StatusApi::new(Arc::clone(&client)));
		Scheduler::new(client, status)
	}

	#[test]
	fn first_tick_records_height_without_acting() {
		let scheduler = make_scheduler(10);
		scheduler.tick();
		let state = scheduler.state.read();
		assert_eq!(state.local_height, 10);
	}

	#[test]
	fn repeated_tick_at_same_height_does_not_refresh_last_block_time() {
		let scheduler = make_scheduler(10);
		scheduler.tick();
		let first = scheduler.state.read().last_block_time;
		std::thread::sleep(Duration::from_millis(5));
		scheduler.tick();
		let second = scheduler.state.read().last_block_time;
		assert_eq!(first, second);
	}

	#[test]
	fn time_check_disabled_skips_tick_entirely() {
		let scheduler = make_scheduler(10);
		scheduler.client.set_config(SyncConfig {
			advanced: AdvancedSyncConfig {
				time_check_enabled: false,
				..AdvancedSyncConfig::default()
			},
			..SyncConfig::default()
		});
		scheduler.tick();
		assert_eq!(scheduler.state.read().local_height, 0);
	}
}
