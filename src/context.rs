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

//! Context-carried flags threaded through a trigger: peer hint, urgency,
//! and retry count. Modeled as an explicit typed wrapper rather than
//! stringly-typed context values, per the design note on context-carried
//! flags: consumers read through dedicated accessors and never mutate in
//! place, they derive a new `SyncContext`.

use crate::external::PeerId;

/// Per-trigger context. Cheap to clone; each stage that wants to narrow
/// or tag the context derives a new value with `with_*`.
#[derive(Clone, Debug, Default)]
pub struct SyncContext {
	peer_hint: Option<PeerId>,
	urgent_reason: Option<&'static str>,
	retry_count: u32,
}

impl SyncContext {
	pub fn new() -> Self {
		SyncContext::default()
	}

	/// Attaches a peer hint, e.g. from the periodic scheduler's probe or
	/// from a reorg-retry that wants to go straight back to the same peer.
	pub fn with_peer_hint(mut self, peer: PeerId) -> Self {
		self.peer_hint = Some(peer);
		self
	}

	pub fn peer_hint(&self) -> Option<&PeerId> {
		self.peer_hint.as_ref()
	}

	/// Marks this trigger urgent: bypasses the min-interval and
	/// no-upstream-backoff gates and admits near-expiry bad peers.
	pub fn urgent(mut self, reason: &'static str) -> Self {
		self.urgent_reason = Some(reason);
		self
	}

	pub fn is_urgent(&self) -> bool {
		self.urgent_reason.is_some()
	}

	pub fn urgent_reason(&self) -> Option<&'static str> {
		self.urgent_reason
	}

	pub fn with_retry_count(mut self, count: u32) -> Self {
		self.retry_count = count;
		self
	}

	pub fn retry_count(&self) -> u32 {
		self.retry_count
	}

	pub fn next_retry(&self) -> Self {
		self.clone().with_retry_count(self.retry_count + 1)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_context_is_not_urgent() {
		let ctx = SyncContext::new();
		assert!(!ctx.is_urgent());
		assert!(ctx.peer_hint().is_none());
		assert_eq!(ctx.retry_count(), 0);
	}

	#[test]
	fn urgent_carries_reason() {
		let ctx = SyncContext::new().urgent("stale tip");
		assert!(ctx.is_urgent());
		assert_eq!(ctx.urgent_reason(), Some("stale tip"));
	}

	#[test]
	fn next_retry_increments() {
		let ctx = SyncContext::new().next_retry().next_retry();
		assert_eq!(ctx.retry_count(), 2);
	}
}
