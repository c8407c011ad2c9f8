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

//! Public sync API surface: the one entry point the embedding node talks
//! to. Wires together the sync client (C5), the periodic scheduler (C6),
//! and the status/probe API (C8) behind the process-wide singleton
//! registries (C1, C3, C7) they all share.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::client::SyncClient;
pub use crate::client::SyncCollaborators;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot, FailureRecord, HeightObservation, StageLabel};
use crate::error::SyncError;
use crate::external::PeerId;
use crate::identity::ChainIdentity;
use crate::peer_health::PeerHealthRegistry;
use crate::scheduler::Scheduler;
use crate::status::{StatusApi, SystemSyncStatus};
use crate::sync_state::{PeerSyncCache, SyncState};

/// Operator-grade summary of a peer's reputation, read straight through
/// the infallible [`PeerHealthRegistry`] predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerHealthStatus {
	pub healthy: bool,
	pub bad: bool,
	pub low_height: bool,
}

/// Snapshot of the active task's cancellation surface, returned by
/// [`SyncEngine::cancel_progress`].
#[derive(Clone, Debug)]
pub struct CancelProgress {
	pub has_active_task: bool,
	pub request_id: Option<String>,
	pub target_height: Option<u64>,
	pub has_cancel_fn: bool,
	pub stage: StageLabel,
}

/// Top-level handle the embedding node holds: one per process, constructed
/// once at startup via [`SyncEngine::start`] and torn down via
/// [`SyncEngine::shutdown`].
pub struct SyncEngine {
	client: Arc<SyncClient>,
	status: Arc<StatusApi>,
	scheduler: Arc<Scheduler>,
	scheduler_thread: Mutex<Option<JoinHandle<()>>>,
	cancel_callbacks: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl SyncEngine {
	/// Builds the full sync core -- client, scheduler, status/probe -- and
	/// spawns the periodic scheduler on its dedicated `"sync-scheduler"`
	/// thread. The sync client itself only occupies an OS thread while a
	/// task is active; `trigger_sync` runs synchronously on the caller's
	/// thread (mirroring `run_sync`'s blocking style), so callers that want
	/// sync to run in the background should spawn their own thread around
	/// `trigger_sync`.
	pub fn start(
		collab: SyncCollaborators,
		identity: ChainIdentity,
		config: SyncConfig,
		protocol_namespace: Option<String>,
	) -> Arc<Self> {
		let health = Arc::new(PeerHealthRegistry::default());
		let sync_state = Arc::new(SyncState::default());
		let peer_cache = Arc::new(PeerSyncCache::default());
		let diagnostics = Arc::new(Diagnostics::default());

		let client = Arc::new(SyncClient::new(
			collab,
			identity,
			config,
			protocol_namespace,
			health,
			sync_state,
			peer_cache,
			diagnostics,
		));
		let status = Arc::new(StatusApi::new(Arc::clone(&client)));
		let scheduler = Scheduler::new(Arc::clone(&client), Arc::clone(&status));
		let handle = scheduler.spawn();

		Arc::new(SyncEngine {
			client,
			status,
			scheduler,
			scheduler_thread: Mutex::new(Some(handle)),
			cancel_callbacks: RwLock::new(Vec::new()),
		})
	}

	pub fn config(&self) -> SyncConfig {
		self.client.config()
	}

	pub fn set_config(&self, config: SyncConfig) {
		self.client.set_config(config);
	}

	/// Manual trigger; obeys the four gates described for the sync client.
	/// Gate rejections are silent no-ops (`Ok(())`).
	pub fn trigger_sync(&self, ctx: SyncContext) -> Result<(), SyncError> {
		self.client.trigger_sync(ctx)
	}

	/// Cancels the active task's `StopState`, if any. Returns immediately;
	/// the sync thread observes the cancellation at its next suspension
	/// point (the next RPC call, storage read, or batch boundary).
	pub fn cancel_sync(&self, _ctx: SyncContext) -> Result<(), SyncError> {
		if let Some(task) = self.client.sync_state.snapshot() {
			task.cancel_handle.stop();
		}
		Ok(())
	}

	/// Cancels, then polls `has_active()` every 50ms until the task clears
	/// or `timeout` expires. Registered cancel callbacks fire once the
	/// active task has actually vanished; they do not fire on a timeout,
	/// since the task never cleared.
	pub fn cancel_sync_with_timeout(&self, ctx: SyncContext, timeout: Duration) -> Result<(), SyncError> {
		self.cancel_sync(ctx)?;
		let deadline = Instant::now() + timeout;
		loop {
			if !self.client.sync_state.has_active() {
				self.fire_cancel_callbacks();
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(SyncError::Cancelled);
			}
			std::thread::sleep(Duration::from_millis(50));
		}
	}

	/// Nullifies the active task immediately, for deadlock recovery. Does
	/// not wait for the sync thread to observe the cancellation and does
	/// not fire cancel callbacks (the thread may still be running).
	pub fn force_stop_sync(&self) {
		if let Some(task) = self.client.sync_state.snapshot() {
			task.cancel_handle.stop();
		}
		self.client.sync_state.release();
	}

	/// Non-blocking status snapshot.
	pub fn check_sync(&self, _ctx: SyncContext) -> SystemSyncStatus {
		self.status.check_sync()
	}

	pub fn cancel_progress(&self) -> CancelProgress {
		let stage = self.client.diagnostics.snapshot().stage;
		match self.client.sync_state.snapshot() {
			Some(task) => CancelProgress {
				has_active_task: true,
				request_id: Some(task.request_id),
				target_height: Some(task.target_height),
				has_cancel_fn: true,
				stage,
			},
			None => CancelProgress {
				has_active_task: false,
				request_id: None,
				target_height: None,
				has_cancel_fn: false,
				stage,
			},
		}
	}

	/// Registers a callback invoked after a cancel completes (the active
	/// task vanishes). A panicking callback is caught and logged; it does
	/// not prevent the remaining callbacks from running.
	pub fn register_cancel_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
		self.cancel_callbacks.write().push(Box::new(callback));
	}

	fn fire_cancel_callbacks(&self) {
		let callbacks = self.cancel_callbacks.read();
		for callback in callbacks.iter() {
			if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
				error!("sync cancel callback panicked; continuing with remaining callbacks");
			}
		}
	}

	pub fn sync_diagnostics(&self) -> DiagnosticsSnapshot {
		self.client.diagnostics.snapshot()
	}

	pub fn sync_failure_history(&self) -> Vec<FailureRecord> {
		self.client.diagnostics.failure_history()
	}

	pub fn network_height_history(&self) -> Vec<HeightObservation> {
		self.client.diagnostics.network_height_history()
	}

	pub fn peer_health_status(&self, peer: &PeerId) -> PeerHealthStatus {
		PeerHealthStatus {
			healthy: self.client.health.is_healthy(peer),
			bad: self.client.health.is_bad(peer),
			low_height: self.client.health.is_low_height(peer),
		}
	}

	/// Stops the periodic scheduler and joins its thread. Does not cancel
	/// an in-flight sync task; call `cancel_sync_with_timeout` first if a
	/// clean shutdown requires that.
	pub fn shutdown(&self) {
		self.scheduler.stop_handle().stop();
		if let Some(handle) = self.scheduler_thread.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}
