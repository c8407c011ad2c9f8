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

//! Cooperative cancellation, the same `Arc<AtomicBool>` shape
//! `grin::sync::syncer::run_sync` threads through its sync loop as a
//! `stop: Arc<AtomicBool>` parameter, wrapped in a small named type so
//! call sites read as `stop_state.is_stopped()` rather than a bare flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token shared between the thread driving a sync task and
/// whatever wants to cancel it (`cancel_sync`, `force_stop_sync`).
#[derive(Clone, Default)]
pub struct StopState {
	stop: Arc<AtomicBool>,
}

impl StopState {
	pub fn new() -> Self {
		StopState {
			stop: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn stop(&self) {
		self.stop.store(true, Ordering::SeqCst);
	}

	pub fn is_stopped(&self) -> bool {
		self.stop.load(Ordering::SeqCst)
	}
}
