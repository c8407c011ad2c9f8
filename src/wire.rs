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

//! On-wire messages for the four sync protocols, encoded with `bincode`
//! the same way this corpus's other production node frames its p2p state.

use serde_derive::{Deserialize, Serialize};

use crate::identity::ChainIdentity;

/// Opaque block payload as carried on the wire. The sync core never
/// interprets block contents itself -- it only counts bytes, validates
/// height continuity, and hands bytes to [`crate::external::BlockValidator`]
/// and [`crate::external::BlockProcessor`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBlock {
	pub height: u64,
	pub hash: [u8; 32],
	pub payload: Vec<u8>,
}

impl WireBlock {
	pub fn encoded_len(&self) -> usize {
		bincode::serialized_size(self).unwrap_or(0) as usize
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
	pub request_id: String,
	pub local_height: u64,
	pub routing_key: Vec<u8>,
	pub max_response_size: u32,
	pub requester_peer_id: Vec<u8>,
	pub target_height: Option<u64>,
	pub chain_identity: Option<ChainIdentity>,
}

impl SyncRequest {
	pub fn height_query(request_id: String, requester_peer_id: Vec<u8>, max_response_size: u32) -> Self {
		SyncRequest {
			request_id,
			local_height: 0,
			routing_key: b"height-query".to_vec(),
			max_response_size,
			requester_peer_id,
			target_height: None,
			chain_identity: None,
		}
	}

	pub fn hello_v2(
		request_id: String,
		requester_peer_id: Vec<u8>,
		locator_bytes: Vec<u8>,
		local_height: u64,
		chain_identity: ChainIdentity,
	) -> Self {
		SyncRequest {
			request_id,
			local_height,
			routing_key: locator_bytes,
			max_response_size: 0,
			requester_peer_id,
			target_height: None,
			chain_identity: Some(chain_identity),
		}
	}

	pub fn blocks_v2(
		request_id: String,
		requester_peer_id: Vec<u8>,
		from_height: u64,
		to_height: u64,
		max_response_size: u32,
		chain_identity: ChainIdentity,
	) -> Self {
		SyncRequest {
			request_id,
			local_height: from_height.saturating_sub(1),
			routing_key: Vec::new(),
			max_response_size,
			requester_peer_id,
			target_height: Some(to_height),
			chain_identity: Some(chain_identity),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
	pub request_id: String,
	pub blocks: Vec<WireBlock>,
	pub next_height: u64,
	pub has_more: bool,
	pub actual_size: u32,
	pub pagination_reason: String,
	pub success: bool,
	pub error_message: Option<String>,
	pub chain_identity: Option<ChainIdentity>,
}

impl SyncResponse {
	pub fn error(request_id: String, message: impl Into<String>) -> Self {
		SyncResponse {
			request_id,
			blocks: Vec::new(),
			next_height: 0,
			has_more: false,
			actual_size: 0,
			pagination_reason: String::new(),
			success: false,
			error_message: Some(message.into()),
			chain_identity: None,
		}
	}
}

pub fn encode_request(req: &SyncRequest) -> Result<Vec<u8>, bincode::Error> {
	bincode::serialize(req)
}

pub fn decode_request(buf: &[u8]) -> Result<SyncRequest, bincode::Error> {
	bincode::deserialize(buf)
}

pub fn encode_response(resp: &SyncResponse) -> Result<Vec<u8>, bincode::Error> {
	bincode::serialize(resp)
}

pub fn decode_response(buf: &[u8]) -> Result<SyncResponse, bincode::Error> {
	bincode::deserialize(buf)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn request_roundtrips() {
		let req = SyncRequest::height_query("r1".into(), vec![1, 2, 3], 1024);
		let buf = encode_request(&req).unwrap();
		let back = decode_request(&buf).unwrap();
		assert_eq!(back.request_id, "r1");
		assert_eq!(back.routing_key, b"height-query");
	}

	#[test]
	fn response_roundtrips_with_blocks() {
		let resp = SyncResponse {
			request_id: "r2".into(),
			blocks: vec![WireBlock {
				height: 5,
				hash: [1u8; 32],
				payload: vec![9, 9, 9],
			}],
			next_height: 6,
			has_more: true,
			actual_size: 3,
			pagination_reason: "NORMAL_BATCH".into(),
			success: true,
			error_message: None,
			chain_identity: None,
		};
		let buf = encode_response(&resp).unwrap();
		let back = decode_response(&buf).unwrap();
		assert_eq!(back.blocks.len(), 1);
		assert_eq!(back.blocks[0].height, 5);
		assert!(back.has_more);
	}
}
