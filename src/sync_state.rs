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

//! The single-active-task guard plus the per-peer sync cache used to skip
//! recently-synced peers in Stage 1. Both are process-wide singletons
//! behind a dedicated `parking_lot::RwLock`, mirroring the "one struct,
//! one lock, handed out as `Arc<...>`" shape used throughout this corpus.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::external::PeerId;
use crate::stop_state::StopState;

/// The process-wide at-most-one active sync task.
#[derive(Clone)]
pub struct ActiveSyncTask {
	pub request_id: String,
	pub start_time: Instant,
	pub target_height: u64,
	pub source_peer: Option<PeerId>,
	pub cancel_handle: StopState,
	pub processed_blocks: u64,
}

impl ActiveSyncTask {
	fn placeholder(request_id: String) -> Self {
		ActiveSyncTask {
			request_id,
			start_time: Instant::now(),
			target_height: 0,
			source_peer: None,
			cancel_handle: StopState::new(),
			processed_blocks: 0,
		}
	}
}

/// Guards the single-flight invariant: at most one active task exists at
/// any time across the whole process.
#[derive(Default)]
pub struct SyncState {
	active: RwLock<Option<ActiveSyncTask>>,
}

impl SyncState {
	pub fn new() -> Self {
		SyncState::default()
	}

	pub fn reset(&self) {
		*self.active.write() = None;
	}

	/// Installs a placeholder task under `request_id`, closing the race
	/// window before `set_active` finalizes the record. Returns `false`
	/// (no-op) if a task is already active.
	pub fn try_acquire(&self, request_id: impl Into<String>) -> bool {
		let mut guard = self.active.write();
		if guard.is_some() {
			return false;
		}
		*guard = Some(ActiveSyncTask::placeholder(request_id.into()));
		true
	}

	/// Replaces the active task's details, preserving the placeholder's
	/// `request_id`/`start_time` when they match what's already installed.
	pub fn set_active(&self, task: ActiveSyncTask) {
		let mut guard = self.active.write();
		match guard.as_ref() {
			Some(existing) if existing.request_id == task.request_id => {
				let mut merged = task;
				merged.start_time = existing.start_time;
				*guard = Some(merged);
			}
			_ => *guard = Some(task),
		}
	}

	pub fn update_progress(&self, delta: u64) {
		if let Some(task) = self.active.write().as_mut() {
			task.processed_blocks += delta;
		}
	}

	pub fn has_active(&self) -> bool {
		self.active.read().is_some()
	}

	pub fn snapshot(&self) -> Option<ActiveSyncTask> {
		self.active.read().clone()
	}

	pub fn release(&self) {
		*self.active.write() = None;
	}
}

/// Per-peer cache of the last sync outcome, used to skip peers the sync
/// client already confirmed consistent with recently.
#[derive(Clone, Copy, Debug)]
struct CacheEntry {
	recorded_at: Instant,
	synced_height: u64,
	consistent: bool,
}

#[derive(Default)]
pub struct PeerSyncCache {
	entries: RwLock<HashMap<PeerId, CacheEntry>>,
}

impl PeerSyncCache {
	pub fn new() -> Self {
		PeerSyncCache::default()
	}

	pub fn reset(&self) {
		self.entries.write().clear();
	}

	/// A hit requires: same peer, entry younger than `expiry`, consistent
	/// flag set, and the cached height unchanged from `current_height`.
	pub fn is_recently_synced(&self, peer: &PeerId, current_height: u64, expiry: Duration) -> bool {
		let map = self.entries.read();
		match map.get(peer) {
			Some(entry) => {
				entry.recorded_at.elapsed() < expiry
					&& entry.consistent
					&& entry.synced_height == current_height
			}
			None => false,
		}
	}

	pub fn record(&self, peer: &PeerId, local: u64, remote: u64) {
		self.entries.write().insert(
			peer.clone(),
			CacheEntry {
				recorded_at: Instant::now(),
				synced_height: local,
				consistent: local == remote,
			},
		);
	}

	pub fn cleanup_expired(&self, age: Duration) {
		self.entries.write().retain(|_, entry| entry.recorded_at.elapsed() < age);
	}
}
