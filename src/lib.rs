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

//! Block synchronization core for a Weisyn node.
//!
//! This crate pulls missing blocks from peers, converges the local chain
//! with the network, detects and recovers from forks, and tracks peer
//! reputation so that misbehaving or stale peers stop being selected. It
//! does not own chain storage, validation, or networking itself -- those
//! are modeled as the external traits in [`external`] and supplied by the
//! embedding node.

#[macro_use]
extern crate log;

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod external;
pub mod identity;
pub mod locator;
pub mod peer_health;
pub mod peer_selector;
pub mod protocol_handlers;
pub mod stop_state;
pub mod sync_state;
pub mod wire;

mod client;
mod scheduler;
mod status;

pub mod api;

pub use api::SyncCollaborators;
pub use config::{AdvancedSyncConfig, KbucketSelectionStrategy, NodeRole, StartupMode, SyncConfig};
pub use context::SyncContext;
pub use error::SyncError;
pub use identity::ChainIdentity;
pub use status::SystemSyncStatus;

/// Protocol id for the legacy K-bucket height/range sync.
pub const PROTOCOL_KBUCKET_V1: &str = "/weisyn/sync/kbucket/v1";
/// Protocol id for the legacy paginated range sync.
pub const PROTOCOL_RANGE_PAGINATED_V1: &str = "/weisyn/sync/range_paginated/v1";
/// Protocol id for the fork-aware handshake.
pub const PROTOCOL_HELLO_V2: &str = "/weisyn/sync/hello/v2";
/// Protocol id for the v2 paginated range sync (carries chain identity).
pub const PROTOCOL_BLOCKS_V2: &str = "/weisyn/sync/blocks/v2";

/// Qualifies a protocol id with a network namespace, e.g. `testnet` turns
/// `/weisyn/sync/hello/v2` into `/weisyn/testnet/sync/hello/v2`.
pub fn qualify_protocol(namespace: Option<&str>, protocol: &str) -> String {
	match namespace {
		Some(ns) if !ns.is_empty() => {
			let mut parts = protocol.splitn(2, "/sync/");
			let prefix = parts.next().unwrap_or("/weisyn");
			let rest = parts.next().unwrap_or("");
			format!("{}/{}/sync/{}", prefix, ns, rest)
		}
		_ => protocol.to_string(),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn qualifies_with_namespace() {
		assert_eq!(
			qualify_protocol(Some("testnet"), PROTOCOL_HELLO_V2),
			"/weisyn/testnet/sync/hello/v2"
		);
	}

	#[test]
	fn unqualified_without_namespace() {
		assert_eq!(qualify_protocol(None, PROTOCOL_HELLO_V2), PROTOCOL_HELLO_V2);
	}
}
