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

//! Observational snapshots: failure history, network-height history, and
//! the ambient metrics block computed on the status-query slow path.
//! Diagnostics are process-wide and must never be used for
//! correctness-critical decisions outside sync -- they are observational.

use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::error::FailureKind;
use crate::external::PeerId;
use crate::peer_health::SyncStage;

const MAX_FAILURE_HISTORY: usize = 100;
const MAX_HEIGHT_HISTORY: usize = 50;
/// Smoothing factor for the blocks-per-second EMA.
const BLOCKS_PER_SECOND_ALPHA: f64 = 0.3;

/// Label for the sync client's current pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageLabel {
	Idle,
	Stage1,
	Stage1_5,
	Stage2,
	Stage3,
	Completed,
}

impl StageLabel {
	pub fn as_str(&self) -> &'static str {
		match self {
			StageLabel::Idle => "idle",
			StageLabel::Stage1 => "stage1",
			StageLabel::Stage1_5 => "stage1.5",
			StageLabel::Stage2 => "stage2",
			StageLabel::Stage3 => "stage3",
			StageLabel::Completed => "completed",
		}
	}
}

#[derive(Clone, Debug)]
pub struct FailureRecord {
	pub peer: PeerId,
	pub stage: SyncStage,
	pub kind: FailureKind,
	pub message: String,
	pub timestamp: Instant,
}

#[derive(Clone, Debug)]
pub struct HeightObservation {
	pub peer: PeerId,
	pub height: u64,
	pub tag: &'static str,
	pub timestamp: Instant,
}

/// A point-in-time readout, returned by [`Diagnostics::snapshot`].
#[derive(Clone, Debug)]
pub struct DiagnosticsSnapshot {
	pub local_height: u64,
	pub network_height: u64,
	pub source_peer: Option<PeerId>,
	pub stage: StageLabel,
	pub blocks_fetched: u64,
	pub blocks_processed: u64,
	pub progress_ratio: f64,
	pub available_peers: usize,
	pub bad_peers: usize,
	pub low_height_peers: usize,
	pub last_updated: Option<Instant>,
	pub blocks_per_second: f64,
}

struct Inner {
	local_height: u64,
	network_height: u64,
	source_peer: Option<PeerId>,
	stage: StageLabel,
	blocks_fetched: u64,
	blocks_processed: u64,
	available_peers: usize,
	bad_peers: usize,
	low_height_peers: usize,
	last_updated: Option<Instant>,
	last_success_unix: Option<u64>,
	blocks_per_second_ema: f64,
	last_batch_at: Option<Instant>,
}

impl Default for Inner {
	fn default() -> Self {
		Inner {
			local_height: 0,
			network_height: 0,
			source_peer: None,
			stage: StageLabel::Idle,
			blocks_fetched: 0,
			blocks_processed: 0,
			available_peers: 0,
			bad_peers: 0,
			low_height_peers: 0,
			last_updated: None,
			last_success_unix: None,
			blocks_per_second_ema: 0.0,
			last_batch_at: None,
		}
	}
}

/// Process-wide, independently-locked observational state.
#[derive(Default)]
pub struct Diagnostics {
	inner: RwLock<Inner>,
	failures: RwLock<VecDeque<FailureRecord>>,
	heights: RwLock<VecDeque<HeightObservation>>,
}

impl Diagnostics {
	pub fn new() -> Self {
		Diagnostics::default()
	}

	pub fn reset(&self) {
		*self.inner.write() = Inner::default();
		self.failures.write().clear();
		self.heights.write().clear();
	}

	pub fn set_stage(&self, stage: StageLabel) {
		let mut inner = self.inner.write();
		inner.stage = stage;
		inner.last_updated = Some(Instant::now());
	}

	pub fn set_heights(&self, local: u64, network: u64, source: Option<PeerId>) {
		let mut inner = self.inner.write();
		inner.local_height = local;
		inner.network_height = network;
		if source.is_some() {
			inner.source_peer = source;
		}
		inner.last_updated = Some(Instant::now());
	}

	pub fn set_peer_counts(&self, available: usize, bad: usize, low_height: usize) {
		let mut inner = self.inner.write();
		inner.available_peers = available;
		inner.bad_peers = bad;
		inner.low_height_peers = low_height;
	}

	/// Records a completed batch: advances `blocks_fetched`/`processed`
	/// and updates the blocks-per-second EMA (alpha = 0.3).
	pub fn record_batch(&self, fetched: u64, processed: u64) {
		let mut inner = self.inner.write();
		inner.blocks_fetched += fetched;
		inner.blocks_processed += processed;
		let now = Instant::now();
		if let Some(last) = inner.last_batch_at {
			let secs = now.duration_since(last).as_secs_f64().max(0.001);
			let instantaneous = processed as f64 / secs;
			inner.blocks_per_second_ema = BLOCKS_PER_SECOND_ALPHA * instantaneous
				+ (1.0 - BLOCKS_PER_SECOND_ALPHA) * inner.blocks_per_second_ema;
		}
		inner.last_batch_at = Some(now);
		inner.last_updated = Some(now);
		if processed > 0 {
			inner.last_success_unix = Some(
				SystemTime::now()
					.duration_since(UNIX_EPOCH)
					.map(|d| d.as_secs())
					.unwrap_or(0),
			);
		}
	}

	pub fn record_failure(&self, peer: PeerId, stage: SyncStage, kind: FailureKind, message: impl Into<String>) {
		let mut q = self.failures.write();
		if q.len() >= MAX_FAILURE_HISTORY {
			q.pop_front();
		}
		q.push_back(FailureRecord {
			peer,
			stage,
			kind,
			message: message.into(),
			timestamp: Instant::now(),
		});
	}

	pub fn record_height_observation(&self, peer: PeerId, height: u64, tag: &'static str) {
		let mut q = self.heights.write();
		if q.len() >= MAX_HEIGHT_HISTORY {
			q.pop_front();
		}
		q.push_back(HeightObservation {
			peer,
			height,
			tag,
			timestamp: Instant::now(),
		});
	}

	pub fn failure_history(&self) -> Vec<FailureRecord> {
		self.failures.read().iter().cloned().collect()
	}

	pub fn network_height_history(&self) -> Vec<HeightObservation> {
		self.heights.read().iter().cloned().collect()
	}

	pub fn snapshot(&self) -> DiagnosticsSnapshot {
		let inner = self.inner.read();
		let progress_ratio = if inner.network_height == 0 {
			0.0
		} else {
			(inner.local_height as f64 / inner.network_height as f64).min(1.0)
		};
		DiagnosticsSnapshot {
			local_height: inner.local_height,
			network_height: inner.network_height,
			source_peer: inner.source_peer.clone(),
			stage: inner.stage,
			blocks_fetched: inner.blocks_fetched,
			blocks_processed: inner.blocks_processed,
			progress_ratio,
			available_peers: inner.available_peers,
			bad_peers: inner.bad_peers,
			low_height_peers: inner.low_height_peers,
			last_updated: inner.last_updated,
			blocks_per_second: inner.blocks_per_second_ema,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn peer(n: u8) -> PeerId {
		PeerId::new(vec![n])
	}

	#[test]
	fn failure_history_is_capped() {
		let diag = Diagnostics::new();
		for i in 0..150 {
			diag.record_failure(peer(1), SyncStage::Hello, FailureKind::Timeout, format!("err {}", i));
		}
		assert_eq!(diag.failure_history().len(), MAX_FAILURE_HISTORY);
	}

	#[test]
	fn height_history_is_capped() {
		let diag = Diagnostics::new();
		for i in 0..80 {
			diag.record_height_observation(peer(1), i, "height_query");
		}
		assert_eq!(diag.network_height_history().len(), MAX_HEIGHT_HISTORY);
	}

	#[test]
	fn progress_ratio_caps_at_one() {
		let diag = Diagnostics::new();
		diag.set_heights(120, 100, None);
		assert_eq!(diag.snapshot().progress_ratio, 1.0);
	}

	#[test]
	fn stage_label_round_trips() {
		let diag = Diagnostics::new();
		diag.set_stage(StageLabel::Stage2);
		assert_eq!(diag.snapshot().stage, StageLabel::Stage2);
	}
}
