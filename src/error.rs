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

//! Error taxonomy for the sync core.

use std::fmt;

/// Classification of a failed peer interaction, used to drive peer-health
/// bookkeeping and retry policy. Derived from error message contents when
/// the underlying transport does not carry a typed error (see
/// [`classify_failure`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
	Timeout,
	NetworkError,
	ProtocolNotSupported,
	ChainIdentityMismatch,
	InvalidResponse,
	Internal,
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			FailureKind::Timeout => "timeout",
			FailureKind::NetworkError => "network_error",
			FailureKind::ProtocolNotSupported => "protocol_not_supported",
			FailureKind::ChainIdentityMismatch => "chain_identity_mismatch",
			FailureKind::InvalidResponse => "invalid_response",
			FailureKind::Internal => "internal_error",
		};
		write!(f, "{}", s)
	}
}

/// Classifies a failure by substring matching against its message, the same
/// approach used throughout this codebase's peer error handling before a
/// typed error reaches the call site.
pub fn classify_failure(message: &str) -> FailureKind {
	let m = message.to_ascii_lowercase();
	if m.contains("timeout") || m.contains("deadline exceeded") {
		FailureKind::Timeout
	} else if m.contains("protocol not supported") || m.contains("no protocol handler") {
		FailureKind::ProtocolNotSupported
	} else if m.contains("chain identity mismatch") || m.contains("genesis mismatch") {
		FailureKind::ChainIdentityMismatch
	} else if m.contains("decode") || m.contains("unmarshal") || m.contains("deserialize") {
		FailureKind::InvalidResponse
	} else if m.contains("stream reset") || m.contains("connection reset") || m.contains("connection refused") {
		FailureKind::NetworkError
	} else {
		FailureKind::NetworkError
	}
}

/// The crate's single public error type. Each variant maps to one of the
/// propagation paths described for the sync client and protocol handlers.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
	#[error("no usable upstream peer found")]
	NoUsableUpstream,

	#[error("handshake failed: {0}")]
	Handshake(String),

	#[error("block fetch failed: {0}")]
	Fetch(String),

	#[error("reorg failed: {0}")]
	Reorg(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("sync cancelled")]
	Cancelled,

	#[error("wire codec error: {0}")]
	Codec(#[from] bincode::Error),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// Outcome of one of the four trigger gates. Gate rejections are not errors:
/// the caller observes a silent no-op and the next trigger retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
	Proceed,
	Rejected(&'static str),
}

impl GateOutcome {
	pub fn is_rejected(&self) -> bool {
		matches!(self, GateOutcome::Rejected(_))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn classifies_timeout() {
		assert_eq!(classify_failure("i/o timeout"), FailureKind::Timeout);
	}

	#[test]
	fn classifies_reset_as_network_not_protocol() {
		assert_eq!(
			classify_failure("connection reset by peer"),
			FailureKind::NetworkError
		);
	}

	#[test]
	fn classifies_protocol_not_supported() {
		assert_eq!(
			classify_failure("protocol not supported by remote"),
			FailureKind::ProtocolNotSupported
		);
	}

	#[test]
	fn classifies_identity_mismatch() {
		assert_eq!(
			classify_failure("chain identity mismatch: genesis differs"),
			FailureKind::ChainIdentityMismatch
		);
	}
}
