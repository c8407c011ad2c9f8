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

//! The sync client: the three-stage pull pipeline (height sampling ->
//! fork-aware hello -> paginated catch-up) behind four trigger gates,
//! with automatic reorg on fork detection and bounded retry. Runs on one
//! dedicated OS thread per active task, the same blocking style as
//! `grin::sync::syncer::run_sync`.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::{StartupMode, SyncConfig};
use crate::context::SyncContext;
use crate::diagnostics::{Diagnostics, StageLabel};
use crate::error::{GateOutcome, SyncError};
use crate::external::{
	BlockHasher, BlockProcessor, BlockValidator, ChainInfo, ChainQuery, ConnectionState,
	CorruptionEvent, CorruptionPhase, CorruptionSeverity, EventBus, ForkHandler, PeerId,
	QueryService, RoutingTable, TempStore, Transport, ERR_BLOCK_ALREADY_PROCESSED,
};
use crate::identity::ChainIdentity;
use crate::locator::build_locator;
use crate::peer_health::{PeerHealthRegistry, SyncStage};
use crate::peer_selector::PeerSelector;
use crate::protocol_handlers::HelloRelation;
use crate::stop_state::StopState;
use crate::sync_state::{ActiveSyncTask, PeerSyncCache, SyncState};
use crate::wire::{decode_response, encode_request, SyncRequest, SyncResponse, WireBlock};

const MAX_REORG_RETRIES: u32 = 3;
const MAX_HEIGHT_SAMPLE_PEERS: usize = 5;
const NO_UPSTREAM_BACKOFF_START: Duration = Duration::from_secs(30);
const NO_UPSTREAM_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct NoUpstreamBackoff {
	consecutive_failures: u32,
	until: Option<Instant>,
}

/// All the collaborators the sync client calls through but does not own.
pub struct SyncCollaborators {
	pub transport: Arc<dyn Transport>,
	pub routing: Arc<dyn RoutingTable>,
	pub chain: Arc<dyn ChainQuery>,
	pub query: Arc<dyn QueryService>,
	pub hasher: Arc<dyn BlockHasher>,
	pub validator: Arc<dyn BlockValidator>,
	pub processor: Arc<dyn BlockProcessor>,
	pub fork_handler: Arc<dyn ForkHandler>,
	pub temp_store: Arc<dyn TempStore>,
	pub event_bus: Arc<dyn EventBus>,
}

/// The client-side pipeline driving the four sync RPCs against selected
/// peers. One instance per process; `trigger_sync` is safe to call from
/// multiple threads (the single-flight guard serializes actual work).
pub struct SyncClient {
	collab: SyncCollaborators,
	identity: ChainIdentity,
	config: RwLock<SyncConfig>,
	protocol_namespace: Option<String>,

	pub health: Arc<PeerHealthRegistry>,
	pub sync_state: Arc<SyncState>,
	pub peer_cache: Arc<PeerSyncCache>,
	pub diagnostics: Arc<Diagnostics>,

	last_trigger_at: RwLock<Option<Instant>>,
	no_upstream_backoff: RwLock<NoUpstreamBackoff>,
	config_error: RwLock<Option<String>>,
	request_counter: std::sync::atomic::AtomicU64,
}

enum Stage1Outcome {
	Candidates { candidates: Vec<PeerId>, chain_info: ChainInfo },
	ConfigError(String),
	NoUpstream,
}

struct HeightSample {
	peer: PeerId,
	height: u64,
}

enum Stage2Outcome {
	/// A fork was resolved; restart the whole pipeline from Stage 1.
	Restart,
	Done {
		authoritative_height: u64,
		source_peer: Option<PeerId>,
		initial_blocks: Vec<WireBlock>,
	},
	/// Nothing to sync: every peer reported behind local.
	NothingToSync,
	NoEligiblePeer,
	Error(SyncError),
}

pub enum TriggerOutcome {
	Done,
	NoEligiblePeer,
	Error(SyncError),
}

impl SyncClient {
	pub fn new(
		collab: SyncCollaborators,
		identity: ChainIdentity,
		config: SyncConfig,
		protocol_namespace: Option<String>,
		health: Arc<PeerHealthRegistry>,
		sync_state: Arc<SyncState>,
		peer_cache: Arc<PeerSyncCache>,
		diagnostics: Arc<Diagnostics>,
	) -> Self {
		SyncClient {
			collab,
			identity,
			config: RwLock::new(config),
			protocol_namespace,
			health,
			sync_state,
			peer_cache,
			diagnostics,
			last_trigger_at: RwLock::new(None),
			no_upstream_backoff: RwLock::new(NoUpstreamBackoff::default()),
			config_error: RwLock::new(None),
			request_counter: std::sync::atomic::AtomicU64::new(0),
		}
	}

	pub fn config(&self) -> SyncConfig {
		self.config.read().clone()
	}

	pub fn set_config(&self, config: SyncConfig) {
		*self.config.write() = config;
	}

	/// Present only while `trigger_sync` has observed a configuration
	/// error (e.g. a missing trusted checkpoint); the status API surfaces
	/// this as `SyncStatusError` even though `trigger_sync` itself
	/// returned `Ok(())`.
	pub fn config_error(&self) -> Option<String> {
		self.config_error.read().clone()
	}

	pub(crate) fn chain(&self) -> &Arc<dyn ChainQuery> {
		&self.collab.chain
	}

	pub(crate) fn routing(&self) -> &Arc<dyn RoutingTable> {
		&self.collab.routing
	}

	pub(crate) fn identity(&self) -> &ChainIdentity {
		&self.identity
	}

	pub(crate) fn protocol(&self, base: &str) -> String {
		crate::qualify_protocol(self.protocol_namespace.as_deref(), base)
	}

	pub(crate) fn next_request_id(&self) -> String {
		let n = self.request_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		format!("sync-{}-{}", std::process::id(), n)
	}

	// ---- Gates -----------------------------------------------------

	fn wait_for_readiness(&self) -> bool {
		let timeout = Duration::from_secs(self.config().advanced.sync_trigger_timeout_secs);
		let protocol = self.protocol(crate::PROTOCOL_HELLO_V2);
		let deadline = Instant::now() + timeout;
		loop {
			let connected = self.collab.routing.connected_peers();
			let ready = connected.iter().any(|(p, s)| {
				*s == ConnectionState::Connected || self.collab.routing.supports_protocol(p, &protocol)
			});
			if ready {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			thread::sleep(Duration::from_millis(200));
		}
	}

	/// Public entry point. Gate rejections return `Ok(())` (no-op); only
	/// genuine failures after exhausting the bounded retry are `Err`.
	pub fn trigger_sync(&self, ctx: SyncContext) -> Result<(), SyncError> {
		if self.gate_single_flight().is_rejected() {
			return Ok(());
		}
		if self.gate_min_interval(&ctx).is_rejected() {
			return Ok(());
		}
		if self.gate_upstream_backoff(&ctx).is_rejected() {
			return Ok(());
		}
		if self.gate_readiness().is_rejected() {
			return Ok(());
		}

		let request_id = self.next_request_id();
		if !self.sync_state.try_acquire(request_id.clone()) {
			return Ok(());
		}
		*self.last_trigger_at.write() = Some(Instant::now());

		let stop = StopState::new();
		let result = self.run_with_retry(ctx, &stop, &request_id);
		self.sync_state.release();

		match result {
			TriggerOutcome::Done => Ok(()),
			TriggerOutcome::NoEligiblePeer => Ok(()),
			TriggerOutcome::Error(e) => Err(e),
		}
	}

	/// Gate 1: refuses a second concurrent sync attempt.
	fn gate_single_flight(&self) -> GateOutcome {
		if self.sync_state.has_active() {
			GateOutcome::Rejected("a sync is already active")
		} else {
			GateOutcome::Proceed
		}
	}

	/// Gate 2: refuses a non-urgent trigger inside the global min interval.
	fn gate_min_interval(&self, ctx: &SyncContext) -> GateOutcome {
		if ctx.is_urgent() {
			return GateOutcome::Proceed;
		}
		let interval = self.config().advanced.global_min_trigger_interval_ms;
		if interval > 0 {
			if let Some(last) = *self.last_trigger_at.read() {
				if last.elapsed() < Duration::from_millis(interval) {
					return GateOutcome::Rejected("global min trigger interval not elapsed");
				}
			}
		}
		GateOutcome::Proceed
	}

	/// Gate 3: refuses a non-urgent trigger while no usable upstream is in backoff.
	fn gate_upstream_backoff(&self, ctx: &SyncContext) -> GateOutcome {
		if ctx.is_urgent() {
			return GateOutcome::Proceed;
		}
		if let Some(until) = self.no_upstream_backoff.read().until {
			if Instant::now() < until {
				return GateOutcome::Rejected("no usable upstream, backing off");
			}
		}
		GateOutcome::Proceed
	}

	/// Gate 4: refuses to start before collaborators report ready.
	fn gate_readiness(&self) -> GateOutcome {
		if self.wait_for_readiness() {
			GateOutcome::Proceed
		} else {
			GateOutcome::Rejected("collaborators not ready")
		}
	}

	fn run_with_retry(&self, mut ctx: SyncContext, stop: &StopState, request_id: &str) -> TriggerOutcome {
		loop {
			match self.run_pipeline(&ctx, stop, request_id) {
				TriggerOutcome::NoEligiblePeer => {
					if stop.is_stopped() {
						return TriggerOutcome::Error(SyncError::Cancelled);
					}
					if ctx.retry_count() >= MAX_REORG_RETRIES {
						self.publish_corruption(
							CorruptionPhase::Apply,
							CorruptionSeverity::Critical,
							"sync retries exhausted with no eligible peer",
						);
						return TriggerOutcome::Error(SyncError::NoUsableUpstream);
					}
					let wait = Duration::from_secs((ctx.retry_count() as u64 + 1) * 5);
					thread::sleep(wait);
					if stop.is_stopped() {
						return TriggerOutcome::Error(SyncError::Cancelled);
					}
					ctx = ctx.next_retry();
				}
				other => return other,
			}
		}
	}

	/// Runs Stage 1 -> Stage 1.5 -> Stage 2 -> Stage 3, looping back to
	/// Stage 1 whenever Stage 2 resolves a fork (reorg restart).
	fn run_pipeline(&self, ctx: &SyncContext, stop: &StopState, request_id: &str) -> TriggerOutcome {
		let mut reorg_attempted = false;
		loop {
			if stop.is_stopped() {
				return TriggerOutcome::Error(SyncError::Cancelled);
			}
			self.diagnostics.set_stage(StageLabel::Stage1);
			let (candidates, chain_info) = match self.stage1(ctx) {
				Stage1Outcome::ConfigError(msg) => {
					*self.config_error.write() = Some(msg);
					return TriggerOutcome::Done;
				}
				Stage1Outcome::NoUpstream => {
					self.enter_no_upstream_backoff();
					return TriggerOutcome::NoEligiblePeer;
				}
				Stage1Outcome::Candidates { candidates, chain_info } => {
					*self.config_error.write() = None;
					(candidates, chain_info)
				}
			};

			self.diagnostics.set_stage(StageLabel::Stage1_5);
			let sample = match self.stage1_5(&candidates, chain_info.height, stop) {
				Some(s) => s,
				None => {
					self.enter_no_upstream_backoff();
					return TriggerOutcome::NoEligiblePeer;
				}
			};

			self.diagnostics.set_stage(StageLabel::Stage2);
			match self.stage2(ctx, &candidates, &sample, chain_info, stop, &mut reorg_attempted, request_id) {
				Stage2Outcome::Restart => continue,
				Stage2Outcome::NothingToSync => {
					self.reset_no_upstream_backoff();
					self.diagnostics.set_stage(StageLabel::Completed);
					return TriggerOutcome::Done;
				}
				Stage2Outcome::NoEligiblePeer => return TriggerOutcome::NoEligiblePeer,
				Stage2Outcome::Error(e) => return TriggerOutcome::Error(e),
				Stage2Outcome::Done { authoritative_height, source_peer, initial_blocks } => {
					self.reset_no_upstream_backoff();
					self.diagnostics.set_stage(StageLabel::Stage3);
					let final_height = authoritative_height.max(sample.height);
					self.sync_state.set_active(ActiveSyncTask {
						request_id: request_id.to_string(),
						start_time: Instant::now(),
						target_height: final_height,
						source_peer: source_peer.clone(),
						cancel_handle: stop.clone(),
						processed_blocks: 0,
					});
					return self.stage3(chain_info, final_height, source_peer, initial_blocks, &candidates, stop);
				}
			}
		}
	}

	fn enter_no_upstream_backoff(&self) {
		let mut backoff = self.no_upstream_backoff.write();
		let exp = backoff.consecutive_failures.min(16);
		let window = NO_UPSTREAM_BACKOFF_START
			.checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
			.unwrap_or(NO_UPSTREAM_BACKOFF_CAP)
			.min(NO_UPSTREAM_BACKOFF_CAP);
		backoff.consecutive_failures += 1;
		backoff.until = Some(Instant::now() + window);
	}

	fn reset_no_upstream_backoff(&self) {
		let mut backoff = self.no_upstream_backoff.write();
		backoff.consecutive_failures = 0;
		backoff.until = None;
	}

	fn publish_corruption(&self, phase: CorruptionPhase, severity: CorruptionSeverity, message: impl Into<String>) {
		self.collab.event_bus.publish_corruption(CorruptionEvent {
			kind: "sync",
			phase,
			severity,
			message: message.into(),
		});
	}

	pub(crate) fn selector<'a>(&'a self) -> PeerSelector<'a> {
		let cfg = self.config();
		PeerSelector {
			routing: self.collab.routing.as_ref(),
			health: self.health.as_ref(),
			selection_count: cfg.advanced.kbucket_selection_count,
			strategy: cfg.advanced.kbucket_selection_strategy,
			protocol: crate::PROTOCOL_HELLO_V2,
		}
	}

	// ---- Stage 1: readiness + candidate set -------------------------

	fn resolve_startup_mode(&self) -> StartupMode {
		match std::env::var("WEISYN_ENV") {
			Ok(v) if v == "dev" => StartupMode::FromGenesis,
			_ => self.config().startup_mode,
		}
	}

	fn stage1(&self, ctx: &SyncContext) -> Stage1Outcome {
		let chain_info = match self.collab.chain.get_chain_info() {
			Ok(info) => info,
			Err(e) => return Stage1Outcome::ConfigError(format!("chain query failed: {}", e)),
		};

		let cfg = self.config();
		let startup_mode = self.resolve_startup_mode();
		if startup_mode == StartupMode::FromNetwork && cfg.require_trusted_checkpoint {
			match &cfg.trusted_checkpoint {
				Some(checkpoint) if !checkpoint.block_hash.is_empty() => {}
				_ => {
					return Stage1Outcome::ConfigError(
						"require_trusted_checkpoint is set but trusted_checkpoint is incomplete".to_string(),
					);
				}
			}
		}

		let selector = self.selector();
		let mut candidates = selector.select_with_fallback(&chain_info, ctx.is_urgent());
		if let Some(hint) = ctx.peer_hint() {
			if let Some(pos) = candidates.iter().position(|p| p == hint) {
				let hinted = candidates.remove(pos);
				candidates.insert(0, hinted);
			} else {
				candidates.insert(0, hint.clone());
			}
		}
		if candidates.is_empty() {
			return Stage1Outcome::NoUpstream;
		}

		if !ctx.is_urgent() {
			let expiry_mins = cfg.advanced.peer_sync_cache_expiry_mins.max(0) as u64;
			let expiry = Duration::from_secs(60 * expiry_mins);
			candidates.retain(|p| !self.peer_cache.is_recently_synced(p, chain_info.height, expiry));
			if candidates.is_empty() {
				return Stage1Outcome::NoUpstream;
			}
		}

		self.diagnostics.set_heights(chain_info.height, chain_info.height, None);
		self.diagnostics.set_peer_counts(candidates.len(), 0, 0);
		Stage1Outcome::Candidates { candidates, chain_info }
	}

	// ---- Stage 1.5: network height sampling -------------------------

	fn stage1_5(&self, candidates: &[PeerId], local_height: u64, stop: &StopState) -> Option<HeightSample> {
		let cfg = self.config();
		let cap = cfg.advanced.height_probe_cap_bytes();
		let timeout = Duration::from_millis(cfg.advanced.read_timeout_ms / 2);
		let protocol = self.protocol(crate::PROTOCOL_KBUCKET_V1);

		let mut samples: Vec<HeightSample> = Vec::new();
		for peer in candidates.iter().take(MAX_HEIGHT_SAMPLE_PEERS) {
			if stop.is_stopped() {
				return None;
			}
			let req = SyncRequest::height_query(self.next_request_id(), Vec::new(), cap);
			match self.call(peer, &protocol, &req, timeout) {
				Ok(resp) => {
					if let Some(identity) = &resp.chain_identity {
						if !self.identity.compatible_with(identity) {
							self.health.mark_bad(peer);
							self.health.record_upstream_failure(peer);
							self.record_failure(peer, SyncStage::HeightQuery, "chain identity mismatch");
							continue;
						}
					}
					self.health.record_success(peer);
					self.diagnostics.record_height_observation(peer.clone(), resp.next_height, "height_query");
					samples.push(HeightSample { peer: peer.clone(), height: resp.next_height });
				}
				Err(message) => {
					self.record_failure(peer, SyncStage::HeightQuery, &message);
				}
			}
		}

		if samples.is_empty() {
			return None;
		}

		let heights: Vec<u64> = {
			let mut h: Vec<u64> = samples.iter().map(|s| s.height).collect();
			h.sort_unstable();
			h
		};
		let median = heights[heights.len() / 2];

		let chosen = samples
			.iter()
			.filter(|s| s.height >= median && s.height <= median + 10)
			.max_by_key(|s| s.height)
			.cloned_sample()
			.or_else(|| samples.iter().find(|s| s.height == median).cloned_sample());

		let chosen = chosen?;
		self.peer_cache.record(&chosen.peer, local_height, chosen.height);
		self.diagnostics.set_heights(local_height, chosen.height, Some(chosen.peer.clone()));
		Some(chosen)
	}

	// ---- Stage 2: fork-aware hello + initial fetch ------------------

	fn stage2(
		&self,
		ctx: &SyncContext,
		candidates: &[PeerId],
		sample: &HeightSample,
		chain_info: ChainInfo,
		stop: &StopState,
		reorg_attempted: &mut bool,
		request_id: &str,
	) -> Stage2Outcome {
		let cfg = self.config();
		let timeout = Duration::from_millis(cfg.advanced.read_timeout_ms);
		let protocol = self.protocol(crate::PROTOCOL_HELLO_V2);
		let blocks_protocol = self.protocol(crate::PROTOCOL_BLOCKS_V2);

		let local_height = chain_info.height;
		let local_hash = match self.collab.query.get_block_by_height(local_height) {
			Ok(Some(block)) => self.collab.hasher.hash_block(&block),
			_ => chain_info.best_block_hash,
		};
		if local_hash != chain_info.best_block_hash && chain_info.best_block_hash != [0u8; 32] {
			error!("tip-index corruption detected at height {}: stored hash disagrees with computed hash", local_height);
		}

		let locator = build_locator(local_height, |h| {
			self.collab.query.get_block_by_height(h).ok().flatten().map(|b| self.collab.hasher.hash_block(&b))
		});
		let locator_bytes = crate::locator::encode_locator(&locator);

		let mut ordered: Vec<PeerId> = Vec::with_capacity(candidates.len());
		ordered.push(sample.peer.clone());
		for p in candidates {
			if *p != sample.peer {
				ordered.push(p.clone());
			}
		}
		ordered.retain(|p| {
			if self.health.is_low_height(p) {
				return false;
			}
			if self.health.is_bad(p) {
				return ctx.is_urgent() && self.health.is_bad_peer_near_expiry(p);
			}
			true
		});

		let mut max_observed_network_height = sample.height;
		let mut any_hello_succeeded = false;
		let mut source_peer: Option<PeerId> = None;
		let mut initial_blocks: Vec<WireBlock> = Vec::new();

		for peer in &ordered {
			if stop.is_stopped() {
				return Stage2Outcome::Error(SyncError::Cancelled);
			}
			let req = SyncRequest::hello_v2(
				self.next_request_id(),
				Vec::new(),
				locator_bytes.clone(),
				local_height,
				self.identity.clone(),
			);
			let resp = match self.call(peer, &protocol, &req, timeout) {
				Ok(r) => r,
				Err(message) => {
					self.record_failure(peer, SyncStage::Hello, &message);
					continue;
				}
			};
			if let Some(identity) = &resp.chain_identity {
				if !self.identity.compatible_with(identity) {
					self.health.mark_bad(peer);
					self.record_failure(peer, SyncStage::Hello, "chain identity mismatch");
					continue;
				}
			} else if !resp.success {
				self.health.mark_bad(peer);
				self.record_failure(peer, SyncStage::Hello, "chain identity mismatch");
				continue;
			}
			if !resp.success {
				self.record_failure(peer, SyncStage::Hello, resp.error_message.as_deref().unwrap_or("hello failed"));
				continue;
			}

			any_hello_succeeded = true;
			let (relation, remote_tip_height, ancestor) = parse_hello_tag(&resp.pagination_reason);
			max_observed_network_height = max_observed_network_height.max(remote_tip_height);

			match relation {
				HelloRelation::UpToDate => {
					source_peer = Some(peer.clone());
					break;
				}
				HelloRelation::RemoteAheadSameChain => {
					let fetch_req = SyncRequest::blocks_v2(
						self.next_request_id(),
						Vec::new(),
						local_height + 1,
						max_observed_network_height,
						cfg.advanced.max_response_size_bytes,
						self.identity.clone(),
					);
					match self.call(peer, &blocks_protocol, &fetch_req, timeout) {
						Ok(blocks_resp) if blocks_resp.success => {
							source_peer = Some(peer.clone());
							initial_blocks = blocks_resp.blocks;
							break;
						}
						Ok(blocks_resp) => {
							self.record_failure(peer, SyncStage::Blocks, blocks_resp.error_message.as_deref().unwrap_or("fetch failed"));
							source_peer = None;
							continue;
						}
						Err(message) => {
							self.record_failure(peer, SyncStage::Blocks, &message);
							source_peer = None;
							continue;
						}
					}
				}
				HelloRelation::RemoteBehind => {
					self.health.record_low_height(peer, remote_tip_height);
					continue;
				}
				HelloRelation::Unknown => continue,
				HelloRelation::ForkDetected => {
					if *reorg_attempted {
						continue;
					}
					*reorg_attempted = true;
					match self.attempt_reorg(peer, &blocks_protocol, remote_tip_height, ancestor, cfg.advanced.auto_reorg_max_depth, timeout) {
						Ok(true) => return Stage2Outcome::Restart,
						Ok(false) => {
							self.publish_corruption(CorruptionPhase::Reorg, CorruptionSeverity::Critical, "automatic reorg aborted");
							return Stage2Outcome::Error(SyncError::Reorg("missing common ancestor".to_string()));
						}
						Err(e) => {
							self.publish_corruption(CorruptionPhase::Reorg, CorruptionSeverity::Critical, e.to_string());
							return Stage2Outcome::Error(e);
						}
					}
				}
			}
		}

		if !any_hello_succeeded {
			return Stage2Outcome::NoEligiblePeer;
		}
		if max_observed_network_height <= local_height {
			return Stage2Outcome::NothingToSync;
		}

		self.diagnostics.set_heights(local_height, max_observed_network_height, source_peer.clone());

		Stage2Outcome::Done {
			authoritative_height: max_observed_network_height,
			source_peer,
			initial_blocks,
		}
	}

	fn attempt_reorg(
		&self,
		peer: &PeerId,
		blocks_protocol: &str,
		remote_tip_height: u64,
		ancestor: Option<(u64, [u8; 32])>,
		max_depth: u64,
		timeout: Duration,
	) -> Result<bool, SyncError> {
		let (ancestor_height, ancestor_hash) = match ancestor {
			Some(pair) => pair,
			None => return Ok(false),
		};

		match self.collab.query.get_block_by_height(ancestor_height) {
			Ok(Some(block)) if self.collab.hasher.hash_block(&block) == ancestor_hash => {}
			Ok(Some(_)) => return Err(SyncError::Reorg("ancestor hash mismatch".to_string())),
			_ if ancestor_height == 0 => {}
			_ => return Err(SyncError::Reorg("ancestor not found locally".to_string())),
		}

		if remote_tip_height.saturating_sub(ancestor_height) > max_depth {
			return Err(SyncError::Reorg("fork depth exceeds auto_reorg_max_depth".to_string()));
		}

		let mut blocks: HashMap<u64, WireBlock> = HashMap::new();
		let mut cursor = ancestor_height + 1;
		while cursor <= remote_tip_height {
			let req = SyncRequest::blocks_v2(
				self.next_request_id(),
				Vec::new(),
				cursor,
				remote_tip_height,
				self.config().advanced.max_response_size_bytes,
				self.identity.clone(),
			);
			let resp = self
				.call(peer, blocks_protocol, &req, timeout)
				.map_err(SyncError::Fetch)?;
			if !resp.success || resp.blocks.is_empty() {
				return Err(SyncError::Reorg("peer returned no fork blocks".to_string()));
			}
			for block in resp.blocks {
				cursor = cursor.max(block.height + 1);
				blocks.insert(block.height, block);
			}
			if resp.next_height <= cursor.saturating_sub(1) && !resp.has_more {
				break;
			}
			cursor = resp.next_height.max(cursor);
		}

		let fork_tip = blocks
			.get(&remote_tip_height)
			.cloned()
			.ok_or_else(|| SyncError::Reorg("fork tip block missing from downloaded set".to_string()))?;
		let mut ordered: Vec<WireBlock> = blocks.into_iter().map(|(_, v)| v).collect();
		ordered.sort_by_key(|b| b.height);

		self.collab
			.fork_handler
			.handle_fork_with_external_blocks(ancestor_height, &fork_tip, &ordered)
			.map_err(SyncError::Reorg)?;
		Ok(true)
	}

	// ---- Stage 3: paginated catch-up --------------------------------

	fn stage3(
		&self,
		chain_info: ChainInfo,
		target_height: u64,
		source_peer: Option<PeerId>,
		initial_blocks: Vec<WireBlock>,
		candidates: &[PeerId],
		stop: &StopState,
	) -> TriggerOutcome {
		let cfg = self.config();
		let protocol = self.protocol(crate::PROTOCOL_BLOCKS_V2);
		let timeout = Duration::from_millis(cfg.advanced.read_timeout_ms);

		let mut peers: Vec<PeerId> = Vec::new();
		if let Some(p) = &source_peer {
			peers.push(p.clone());
		}
		for p in candidates {
			if Some(p) != source_peer.as_ref() && !peers.contains(p) {
				peers.push(p.clone());
			}
		}
		peers.truncate(cfg.advanced.failover_node_count.max(1));
		if peers.is_empty() {
			return TriggerOutcome::NoEligiblePeer;
		}

		let mut current_height = chain_info.height;
		if !initial_blocks.is_empty() {
			match self.process_block_batch(&initial_blocks, current_height) {
				Ok(applied) => {
					current_height += applied;
					self.sync_state.update_progress(applied);
					self.diagnostics.record_batch(initial_blocks.len() as u64, applied);
					self.diagnostics.set_heights(current_height, target_height, source_peer.clone());
				}
				Err(e) => {
					self.publish_corruption(CorruptionPhase::Apply, CorruptionSeverity::Critical, e.to_string());
					return TriggerOutcome::Error(e);
				}
			}
		}

		let batch_size = cfg.advanced.batch_size.min(cfg.advanced.max_batch_size).max(1) as u64;
		let mut peer_idx = 0usize;
		let mut failure_budget = cfg.advanced.max_retry_attempts;
		let mut blocks_since_gc = 0u64;

		while current_height < target_height {
			if stop.is_stopped() {
				return TriggerOutcome::Error(SyncError::Cancelled);
			}
			if peer_idx >= peers.len() {
				return TriggerOutcome::NoEligiblePeer;
			}
			let peer = &peers[peer_idx];
			let to = (current_height + batch_size).min(target_height);
			let req = SyncRequest::blocks_v2(
				self.next_request_id(),
				Vec::new(),
				current_height + 1,
				to,
				cfg.advanced.max_response_size_bytes,
				self.identity.clone(),
			);

			let resp = match self.call(peer, &protocol, &req, timeout) {
				Ok(r) => r,
				Err(message) => {
					self.record_failure(peer, SyncStage::Paginated, &message);
					failure_budget = failure_budget.saturating_sub(1);
					if failure_budget == 0 {
						peer_idx += 1;
						failure_budget = cfg.advanced.max_retry_attempts;
					}
					continue;
				}
			};
			if !resp.success {
				self.record_failure(peer, SyncStage::Paginated, resp.error_message.as_deref().unwrap_or("fetch failed"));
				failure_budget = failure_budget.saturating_sub(1);
				if failure_budget == 0 {
					peer_idx += 1;
					failure_budget = cfg.advanced.max_retry_attempts;
				}
				continue;
			}

			if resp.blocks.is_empty() {
				if resp.next_height > current_height + 1 {
					current_height = resp.next_height - 1;
					self.health.record_success(peer);
					continue;
				} else {
					self.record_failure(peer, SyncStage::Paginated, "empty batch with no forward progress");
					failure_budget = failure_budget.saturating_sub(1);
					if failure_budget == 0 {
						peer_idx += 1;
						failure_budget = cfg.advanced.max_retry_attempts;
					}
					continue;
				}
			}

			if !sequence_is_contiguous(&resp.blocks) {
				self.record_failure(peer, SyncStage::Paginated, "non-contiguous block sequence");
				failure_budget = failure_budget.saturating_sub(1);
				if failure_budget == 0 {
					peer_idx += 1;
					failure_budget = cfg.advanced.max_retry_attempts;
				}
				continue;
			}

			self.health.record_success(peer);
			failure_budget = cfg.advanced.max_retry_attempts;

			let first_height = resp.blocks[0].height;
			if first_height > current_height + 1 {
				self.stage_out_of_order(&resp.blocks, first_height);
				if let Some((applied_height, applied_count)) = self.drain_contiguous_temp(current_height) {
					current_height = applied_height;
					self.sync_state.update_progress(applied_count);
					self.diagnostics.record_batch(applied_count, applied_count);
					self.diagnostics.set_heights(current_height, target_height, Some(peer.clone()));
				}
				continue;
			}

			match self.process_block_batch(&resp.blocks, current_height) {
				Ok(applied) => {
					current_height += applied;
					self.sync_state.update_progress(applied);
					self.diagnostics.record_batch(resp.blocks.len() as u64, applied);
					self.diagnostics.set_heights(current_height, target_height, Some(peer.clone()));
					blocks_since_gc += applied;
					if blocks_since_gc >= 100 {
						blocks_since_gc = 0;
						debug!("sync: triggering GC/compaction hint after 100 applied blocks");
					}
				}
				Err(e) => {
					self.publish_corruption(CorruptionPhase::Apply, CorruptionSeverity::Critical, e.to_string());
					return TriggerOutcome::Error(e);
				}
			}
		}

		self.diagnostics.set_stage(StageLabel::Completed);
		TriggerOutcome::Done
	}

	fn stage_out_of_order(&self, blocks: &[WireBlock], first_height: u64) {
		let key = format!("sync_pending_{:010}_{:08x}", first_height.saturating_sub(10), first_height);
		if let Ok(encoded) = bincode::serialize(blocks) {
			self.collab.temp_store.put(&key, encoded);
		}
	}

	fn drain_contiguous_temp(&self, current_height: u64) -> Option<(u64, u64)> {
		let mut next = current_height + 1;
		let mut applied = 0u64;
		loop {
			let prefix = format!("sync_pending_{:010}_", next.saturating_sub(10));
			let key = format!("{}{:08x}", prefix, next);
			match self.collab.temp_store.get(&key) {
				Some(bytes) => {
					let blocks: Vec<WireBlock> = match bincode::deserialize(&bytes) {
						Ok(b) => b,
						Err(_) => break,
					};
					match self.process_block_batch(&blocks, next - 1) {
						Ok(count) => {
							applied += count;
							next += count;
							self.collab.temp_store.delete(&key);
						}
						Err(_) => break,
					}
				}
				None => break,
			}
		}
		if applied > 0 {
			Some((current_height + applied, applied))
		} else {
			None
		}
	}

	/// Validates then applies each block in order, treating
	/// `ERR_BLOCK_ALREADY_PROCESSED` as idempotent success. Returns the
	/// number of blocks applied, stopping (without erroring) if it
	/// encounters a gap -- callers are expected to have already checked
	/// `sequence_is_contiguous`.
	fn process_block_batch(&self, blocks: &[WireBlock], expected_prior_height: u64) -> Result<u64, SyncError> {
		let mut applied = 0u64;
		let mut expected = expected_prior_height + 1;
		for block in blocks {
			if block.height != expected {
				break;
			}
			self.collab.validator.validate_block(block).map_err(SyncError::Fetch)?;
			match self.collab.processor.process_block(block) {
				Ok(()) => {}
				Err(e) if e == ERR_BLOCK_ALREADY_PROCESSED => {}
				Err(e) => return Err(SyncError::Fetch(e)),
			}
			applied += 1;
			expected += 1;
		}
		Ok(applied)
	}

	fn record_failure(&self, peer: &PeerId, stage: SyncStage, message: &str) {
		let kind = self.health.record_failure(peer, stage, message);
		self.diagnostics.record_failure(peer.clone(), stage, kind, message.to_string());
	}

	pub(crate) fn call(&self, peer: &PeerId, protocol: &str, req: &SyncRequest, timeout: Duration) -> Result<SyncResponse, String> {
		let bytes = encode_request(req).map_err(|e| e.to_string())?;
		let response_bytes = self.collab.transport.call(peer, protocol, bytes, timeout)?;
		decode_response(&response_bytes).map_err(|e| format!("message decode error: {}", e))
	}
}

fn sequence_is_contiguous(blocks: &[WireBlock]) -> bool {
	blocks.windows(2).all(|w| w[1].height == w[0].height + 1)
}

/// Parses the `SYNCV2_HELLO:<REL> remote_tip=... local_tip=... [ancestor=h:hex ...]`
/// tag produced by [`crate::protocol_handlers::ProtocolHandlers::handle_hello_v2`].
pub(crate) fn parse_hello_tag(tag: &str) -> (HelloRelation, u64, Option<(u64, [u8; 32])>) {
	let mut relation = HelloRelation::Unknown;
	let mut remote_tip = 0u64;
	let mut ancestor = None;

	for token in tag.split_whitespace() {
		if let Some(rel) = token.strip_prefix("SYNCV2_HELLO:") {
			relation = match rel {
				"UP_TO_DATE" => HelloRelation::UpToDate,
				"REMOTE_BEHIND" => HelloRelation::RemoteBehind,
				"REMOTE_AHEAD_SAME_CHAIN" => HelloRelation::RemoteAheadSameChain,
				"FORK_DETECTED" => HelloRelation::ForkDetected,
				_ => HelloRelation::Unknown,
			};
		} else if let Some(v) = token.strip_prefix("remote_tip=") {
			remote_tip = v.parse().unwrap_or(0);
		} else if let Some(v) = token.strip_prefix("ancestor=") {
			if let Some((h, hex)) = v.split_once(':') {
				if !hex.is_empty() {
					if let Ok(height) = h.parse::<u64>() {
						if let Some(hash) = parse_hex_32(hex) {
							ancestor = Some((height, hash));
						}
					}
				}
			}
		}
	}
	(relation, remote_tip, ancestor)
}

fn parse_hex_32(hex: &str) -> Option<[u8; 32]> {
	if hex.len() != 64 {
		return None;
	}
	let mut out = [0u8; 32];
	for i in 0..32 {
		out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
	}
	Some(out)
}

trait ClonedSample {
	fn cloned_sample(self) -> Option<HeightSample>;
}

impl ClonedSample for Option<&HeightSample> {
	fn cloned_sample(self) -> Option<HeightSample> {
		self.map(|s| HeightSample { peer: s.peer.clone(), height: s.height })
	}
}
