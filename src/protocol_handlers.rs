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

//! Server side of the four sync RPCs, all served read-only through
//! [`ChainQuery`]/[`QueryService`] and never mutating chain state. The
//! intelligent pagination builder in [`paginate_blocks`] is shared between
//! the v2 and legacy K-bucket range responses.

use crate::external::{BlockHasher, ChainQuery, QueryService};
use crate::identity::{ChainIdentity, LocalTip};
use crate::locator::{decode_locator, find_common_ancestor};
use crate::wire::{SyncRequest, SyncResponse, WireBlock};

const DEFAULT_KBUCKET_MAX_RESPONSE: u32 = 2 * 1024 * 1024;
const DEFAULT_RANGE_MAX_RESPONSE: u32 = 5 * 1024 * 1024;

/// The relationship between a remote tip and the local tip, as classified
/// by the fork-aware handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloRelation {
	UpToDate,
	RemoteBehind,
	RemoteAheadSameChain,
	ForkDetected,
	Unknown,
}

impl HelloRelation {
	pub fn as_tag(&self) -> &'static str {
		match self {
			HelloRelation::UpToDate => "UP_TO_DATE",
			HelloRelation::RemoteBehind => "REMOTE_BEHIND",
			HelloRelation::RemoteAheadSameChain => "REMOTE_AHEAD_SAME_CHAIN",
			HelloRelation::ForkDetected => "FORK_DETECTED",
			HelloRelation::Unknown => "UNKNOWN",
		}
	}
}

/// Server side of the four sync stream protocols.
pub struct ProtocolHandlers<'a> {
	pub chain: &'a dyn ChainQuery,
	pub query: &'a dyn QueryService,
	pub hasher: &'a dyn BlockHasher,
	pub local_identity: Option<ChainIdentity>,
}

impl<'a> ProtocolHandlers<'a> {
	fn local_tip(&self) -> Result<LocalTip, String> {
		let info = self.chain.get_chain_info()?;
		let hash = match self.query.get_block_by_height(info.height)? {
			Some(block) => self.hasher.hash_block(&block),
			None => info.best_block_hash,
		};
		if hash != info.best_block_hash && info.best_block_hash != [0u8; 32] {
			error!(
				"tip-index corruption: stored best hash disagrees with computed hash at height {}",
				info.height
			);
		}
		Ok(LocalTip::new(info.height, hash))
	}

	/// Decodes a request; on failure, builds the `message decode error`
	/// response shared by all four handlers.
	pub fn decode(request_id: &str, buf: &[u8]) -> Result<SyncRequest, SyncResponse> {
		crate::wire::decode_request(buf)
			.map_err(|e| SyncResponse::error(request_id.to_string(), format!("message decode error: {}", e)))
	}

	fn identity_check(&self, req: &SyncRequest, require_local_identity: bool) -> Option<SyncResponse> {
		match &self.local_identity {
			None if require_local_identity => {
				return Some(SyncResponse::error(
					req.request_id.clone(),
					"local chain identity unavailable: incompatible peer",
				));
			}
			None => {}
			Some(local) => {
				if let Some(remote) = &req.chain_identity {
					if !local.compatible_with(remote) {
						return Some(SyncResponse::error(
							req.request_id.clone(),
							"chain identity mismatch",
						));
					}
				}
			}
		}
		None
	}

	/// 4.4.1 Height Query -- legacy K-bucket sync with
	/// `routing_key = "height-query"`, `local_height = 0`.
	pub fn handle_height_query(&self, req: &SyncRequest) -> SyncResponse {
		let info = match self.chain.get_chain_info() {
			Ok(i) => i,
			Err(e) => return SyncResponse::error(req.request_id.clone(), e),
		};
		SyncResponse {
			request_id: req.request_id.clone(),
			blocks: Vec::new(),
			next_height: info.height,
			has_more: false,
			actual_size: 0,
			pagination_reason: "HEIGHT_QUERY".to_string(),
			success: true,
			error_message: None,
			chain_identity: self.local_identity.clone(),
		}
	}

	/// 4.4.2 Fork-Aware Hello V2.
	pub fn handle_hello_v2(
		&self,
		req: &SyncRequest,
		remote_tip_height: u64,
		remote_tip_hash: [u8; 32],
	) -> SyncResponse {
		if let Some(resp) = self.identity_check(req, true) {
			return resp;
		}

		let local_tip = match self.local_tip() {
			Ok(t) => t,
			Err(e) => return SyncResponse::error(req.request_id.clone(), e),
		};

		let relation = if remote_tip_height > local_tip.height {
			HelloRelation::RemoteBehind
		} else if remote_tip_height == local_tip.height {
			if remote_tip_hash == local_tip.hash {
				HelloRelation::UpToDate
			} else {
				HelloRelation::ForkDetected
			}
		} else if remote_tip_height == 0 {
			HelloRelation::RemoteAheadSameChain
		} else {
			match self.query.get_block_by_height(remote_tip_height) {
				Ok(Some(block)) => {
					if self.hasher.hash_block(&block) == remote_tip_hash {
						HelloRelation::RemoteAheadSameChain
					} else {
						HelloRelation::ForkDetected
					}
				}
				Ok(None) => HelloRelation::Unknown,
				Err(_) => HelloRelation::Unknown,
			}
		};

		let reason = if relation == HelloRelation::ForkDetected {
			let locator = decode_locator(&req.routing_key);
			let locator_valid = !locator.is_empty();
			let ancestor = find_common_ancestor(&locator, local_tip.height, |h| {
				self.query.get_block_by_height(h).ok().flatten().map(|b| self.hasher.hash_block(&b))
			});
			match ancestor {
				Some(a) => format!(
					"SYNCV2_HELLO:{} remote_tip={} local_tip={} ancestor={}:{} locator_len={} locator_valid={}",
					relation.as_tag(),
					remote_tip_height,
					local_tip.height,
					a.height,
					hex(&a.hash),
					locator.len(),
					locator_valid
				),
				None => format!(
					"SYNCV2_HELLO:{} remote_tip={} local_tip={} ancestor=0: locator_len={} locator_valid=false",
					relation.as_tag(),
					remote_tip_height,
					local_tip.height,
					locator.len()
				),
			}
		} else {
			format!(
				"SYNCV2_HELLO:{} remote_tip={} local_tip={}",
				relation.as_tag(),
				remote_tip_height,
				local_tip.height
			)
		};

		SyncResponse {
			request_id: req.request_id.clone(),
			blocks: Vec::new(),
			next_height: local_tip.height,
			has_more: false,
			actual_size: 0,
			pagination_reason: reason,
			success: true,
			error_message: None,
			chain_identity: self.local_identity.clone(),
		}
	}

	/// 4.4.3 Sync Blocks V2 (paginated range).
	pub fn handle_blocks_v2(&self, req: &SyncRequest) -> SyncResponse {
		if let Some(resp) = self.identity_check(req, true) {
			return resp;
		}
		self.handle_range(req, DEFAULT_RANGE_MAX_RESPONSE, "")
	}

	/// 4.4.4 Legacy K-Bucket Sync: same shape as Blocks V2 but every
	/// pagination tag is prefixed `KBUCKET_SYNC_`.
	pub fn handle_kbucket_sync(&self, req: &SyncRequest) -> SyncResponse {
		if let Some(resp) = self.identity_check(req, false) {
			return resp;
		}
		self.handle_range(req, DEFAULT_KBUCKET_MAX_RESPONSE, "KBUCKET_SYNC_")
	}

	fn handle_range(&self, req: &SyncRequest, default_cap: u32, tag_prefix: &str) -> SyncResponse {
		let info = match self.chain.get_chain_info() {
			Ok(i) => i,
			Err(e) => return SyncResponse::error(req.request_id.clone(), e),
		};

		let start_height = req.local_height + 1;
		let target_height = info.height.min(req.target_height.unwrap_or(info.height));
		let max_response_size = if req.max_response_size > 0 {
			req.max_response_size
		} else {
			default_cap
		};

		if start_height > target_height {
			return SyncResponse {
				request_id: req.request_id.clone(),
				blocks: Vec::new(),
				next_height: start_height,
				has_more: false,
				actual_size: 0,
				pagination_reason: format!("{}NO_NEW_BLOCKS", tag_prefix),
				success: true,
				error_message: None,
				chain_identity: self.local_identity.clone(),
			};
		}

		let page = paginate_blocks(self.query, start_height, target_height, max_response_size);
		SyncResponse {
			request_id: req.request_id.clone(),
			blocks: page.blocks,
			next_height: page.next_height,
			has_more: page.next_height <= target_height,
			actual_size: page.actual_size,
			pagination_reason: format!("{}{}", tag_prefix, page.reason),
			success: true,
			error_message: None,
			chain_identity: self.local_identity.clone(),
		}
	}
}

struct Page {
	blocks: Vec<WireBlock>,
	next_height: u64,
	actual_size: u32,
	reason: &'static str,
}

/// Intelligent pagination: appends blocks while under `max_response_size`,
/// always returning at least one block (`LARGE_BLOCK_FORCED`) so progress
/// is guaranteed even against an oversized first block.
fn paginate_blocks(query: &dyn QueryService, start_height: u64, target_height: u64, max_response_size: u32) -> Page {
	let mut blocks = Vec::new();
	let mut actual_size: u64 = 0;
	let mut height = start_height;
	let mut reason = "NORMAL_BATCH";

	while height <= target_height {
		let block = match query.get_block_by_height(height) {
			Ok(Some(b)) => b,
			Ok(None) | Err(_) => {
				reason = "NO_BLOCKS_AVAILABLE";
				break;
			}
		};
		let encoded_len = block.encoded_len() as u64;

		if !blocks.is_empty() && actual_size + encoded_len > max_response_size as u64 {
			reason = "SIZE_LIMIT_REACHED";
			break;
		}

		let forced = blocks.is_empty() && encoded_len > max_response_size as u64;
		actual_size += encoded_len;
		blocks.push(block);
		height += 1;
		if forced {
			reason = "LARGE_BLOCK_FORCED";
			break;
		}
	}

	Page {
		blocks,
		next_height: height,
		actual_size: actual_size.min(u32::MAX as u64) as u32,
		reason,
	}
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
