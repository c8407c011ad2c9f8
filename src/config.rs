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

//! Configuration surface for the sync core, following the same
//! `#[derive(Serialize, Deserialize)]` + `impl Default` shape used
//! throughout this codebase's own configuration structs.

use serde_derive::{Deserialize, Serialize};

/// Where the node starts from on a fresh chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
	FromGenesis,
	FromNetwork,
}

impl Default for StartupMode {
	fn default() -> Self {
		StartupMode::FromNetwork
	}
}

/// How [`crate::peer_selector`] narrows a K-bucket result down to the
/// final candidate list.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbucketSelectionStrategy {
	Distance,
	Random,
	Mixed,
}

impl Default for KbucketSelectionStrategy {
	fn default() -> Self {
		KbucketSelectionStrategy::Mixed
	}
}

/// The role this node plays, consulted by the status machine's startup
/// overrides: a lone consensus/dev node is allowed to consider itself
/// synced at genesis so it can start producing blocks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
	Consensus,
	FullNode,
	Observer,
}

impl Default for NodeRole {
	fn default() -> Self {
		NodeRole::FullNode
	}
}

/// A height/hash pair the operator trusts, used to gate startup when
/// `require_trusted_checkpoint` is set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedCheckpoint {
	pub height: u64,
	pub block_hash: Vec<u8>,
}

/// Top-level sync configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncConfig {
	pub startup_mode: StartupMode,
	pub node_role: NodeRole,
	pub require_trusted_checkpoint: bool,
	pub trusted_checkpoint: Option<TrustedCheckpoint>,
	pub advanced: AdvancedSyncConfig,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			startup_mode: StartupMode::default(),
			node_role: NodeRole::default(),
			require_trusted_checkpoint: false,
			trusted_checkpoint: None,
			advanced: AdvancedSyncConfig::default(),
		}
	}
}

/// Tunable knobs for the sync pipeline. Every field has a production
/// default; operators only need to set what they want to change.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdvancedSyncConfig {
	pub max_response_size_bytes: u32,
	pub intelligent_paging_threshold: u32,
	pub batch_size: u32,
	pub max_batch_size: u32,
	pub max_retry_attempts: u32,
	pub retry_delay_ms: u64,
	pub connect_timeout_ms: u64,
	pub write_timeout_ms: u64,
	pub read_timeout_ms: u64,
	pub failover_node_count: usize,
	pub peer_sync_cache_expiry_mins: i64,
	pub time_check_enabled: bool,
	pub time_check_interval_mins: Option<i64>,
	pub time_check_threshold_mins: Option<i64>,
	pub network_latency_buffer_secs: i64,
	pub up_to_date_silence_window_mins: i64,
	pub sync_trigger_timeout_secs: u64,
	pub global_min_trigger_interval_ms: u64,
	pub upstream_memory_ttl_secs: i64,
	pub upstream_max_consecutive_failures: u32,
	pub max_concurrent_requests: usize,
	pub kbucket_selection_count: usize,
	pub kbucket_selection_strategy: KbucketSelectionStrategy,
	pub circuit_breaker_failure_threshold: u32,
	pub circuit_breaker_recovery_secs: i64,
	pub auto_reorg_max_depth: u64,
	pub block_time_target_secs: i64,
}

impl Default for AdvancedSyncConfig {
	fn default() -> Self {
		AdvancedSyncConfig {
			max_response_size_bytes: 5 * 1024 * 1024,
			intelligent_paging_threshold: 2 * 1024 * 1024,
			batch_size: 50,
			max_batch_size: 200,
			max_retry_attempts: 3,
			retry_delay_ms: 5_000,
			connect_timeout_ms: 5_000,
			write_timeout_ms: 10_000,
			read_timeout_ms: 15_000,
			failover_node_count: 5,
			peer_sync_cache_expiry_mins: 10,
			time_check_enabled: true,
			time_check_interval_mins: Some(10),
			time_check_threshold_mins: Some(15),
			network_latency_buffer_secs: 5,
			up_to_date_silence_window_mins: 5,
			sync_trigger_timeout_secs: 20,
			global_min_trigger_interval_ms: 0,
			upstream_memory_ttl_secs: 600,
			upstream_max_consecutive_failures: 3,
			max_concurrent_requests: 3,
			kbucket_selection_count: 8,
			kbucket_selection_strategy: KbucketSelectionStrategy::default(),
			circuit_breaker_failure_threshold: 3,
			circuit_breaker_recovery_secs: 300,
			auto_reorg_max_depth: 1000,
			block_time_target_secs: 30,
		}
	}
}

impl AdvancedSyncConfig {
	/// Derived cap for Stage 1.5's height-sampling response, clamped to
	/// `[512, 4096]` bytes so a slow/adversarial peer cannot stall the
	/// cheap height probe with a large reply.
	pub fn height_probe_cap_bytes(&self) -> u32 {
		(self.max_response_size_bytes / 1000).clamp(512, 4096)
	}

	/// Ticker interval for the periodic scheduler, in seconds:
	/// `time_check_interval_mins` (10 by default) converted to seconds
	/// unless an operator clears it to `None`, in which case it's derived
	/// as half the target block time, clamped to `[5s, 60s]`.
	pub fn effective_time_check_interval_secs(&self) -> i64 {
		match self.time_check_interval_mins {
			Some(v) => v * 60,
			None => (self.block_time_target_secs / 2).clamp(5, 60),
		}
	}

	/// Staleness threshold, in seconds: `time_check_threshold_mins` (15 by
	/// default) converted to seconds unless an operator clears it to
	/// `None`, in which case it's derived as 3x the target block time plus
	/// the network latency buffer, floored at 30s.
	pub fn effective_time_check_threshold_secs(&self) -> i64 {
		match self.time_check_threshold_mins {
			Some(v) => v * 60,
			None => (3 * self.block_time_target_secs + self.network_latency_buffer_secs).max(30),
		}
	}
}
