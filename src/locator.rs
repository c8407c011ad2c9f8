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

//! Block locators: a compact way for a peer to describe "here's roughly
//! where my chain is" without requiring the other side to maintain a
//! hash-to-height index.

/// Hard cap on the number of entries in a locator, mirrored on the wire.
pub const MAX_LOCATORS: usize = 32;

/// A single (height, hash) entry in a locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocatorEntry {
	pub height: u64,
	pub hash: [u8; 32],
}

/// Computes which heights should go into a locator built from `height`:
/// the most recent 10 heights densely, then exponentially spaced (the
/// stride doubles each step) down to 0, capped at [`MAX_LOCATORS`] entries.
pub fn get_locator_heights(height: u64) -> Vec<u64> {
	let mut heights = Vec::new();
	let mut h = height;

	let dense_count = 10usize.min(height as usize + 1);
	for _ in 0..dense_count {
		heights.push(h);
		if h == 0 {
			break;
		}
		h -= 1;
	}

	if h == 0 && heights.last() == Some(&0) {
		heights.dedup();
		return heights;
	}

	let mut step = 1u64;
	loop {
		if heights.len() >= MAX_LOCATORS - 1 {
			break;
		}
		step = step.saturating_mul(2);
		if h <= step {
			break;
		}
		h -= step;
		heights.push(h);
	}
	heights.push(0);
	heights.dedup();
	heights
}

/// Builds the wire-ready locator entries given a height-to-hash lookup.
/// `lookup` typically goes through `QueryService::get_block_by_height`
/// plus the block-hash service; it returns `None` for heights that are
/// not (or no longer) available locally, which are simply skipped.
pub fn build_locator<F>(height: u64, mut lookup: F) -> Vec<LocatorEntry>
where
	F: FnMut(u64) -> Option<[u8; 32]>,
{
	get_locator_heights(height)
		.into_iter()
		.filter_map(|h| lookup(h).map(|hash| LocatorEntry { height: h, hash }))
		.take(MAX_LOCATORS)
		.collect()
}

/// Encodes locator entries into the wire's flat byte representation: each
/// entry is an 8-byte big-endian height followed by a 32-byte hash.
pub fn encode_locator(entries: &[LocatorEntry]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(entries.len() * 40);
	for e in entries {
		buf.extend_from_slice(&e.height.to_be_bytes());
		buf.extend_from_slice(&e.hash);
	}
	buf
}

/// Decodes a flat locator byte buffer back into entries. A length not
/// divisible by 40, or more than [`MAX_LOCATORS`] entries, yields an empty
/// (invalid) locator rather than a partial one.
pub fn decode_locator(buf: &[u8]) -> Vec<LocatorEntry> {
	if buf.is_empty() || buf.len() % 40 != 0 {
		return Vec::new();
	}
	let count = buf.len() / 40;
	if count > MAX_LOCATORS {
		return Vec::new();
	}
	let mut out = Vec::with_capacity(count);
	for chunk in buf.chunks_exact(40) {
		let mut height_bytes = [0u8; 8];
		height_bytes.copy_from_slice(&chunk[0..8]);
		let mut hash = [0u8; 32];
		hash.copy_from_slice(&chunk[8..40]);
		out.push(LocatorEntry {
			height: u64::from_be_bytes(height_bytes),
			hash,
		});
	}
	out
}

/// Finds the deepest entry in `locator` whose hash matches the local
/// chain at that height, via `lookup`. Used by the fork-aware handshake
/// to pick a common ancestor.
pub fn find_common_ancestor<F>(locator: &[LocatorEntry], local_tip_height: u64, mut lookup: F) -> Option<LocatorEntry>
where
	F: FnMut(u64) -> Option<[u8; 32]>,
{
	let mut candidates: Vec<&LocatorEntry> = locator
		.iter()
		.filter(|e| e.height <= local_tip_height)
		.collect();
	candidates.sort_by(|a, b| b.height.cmp(&a.height));
	for entry in candidates {
		if let Some(local_hash) = lookup(entry.height) {
			if local_hash == entry.hash {
				return Some(*entry);
			}
		}
	}
	None
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_get_locator_heights() {
		assert_eq!(get_locator_heights(0), vec![0]);
		assert_eq!(get_locator_heights(1), vec![1, 0]);
		assert_eq!(get_locator_heights(2), vec![2, 1, 0]);
		assert_eq!(get_locator_heights(3), vec![3, 2, 1, 0]);
		assert_eq!(
			get_locator_heights(10),
			vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0]
		);
	}

	#[test]
	fn locator_heights_never_exceed_cap() {
		assert!(get_locator_heights(10_000_000).len() <= MAX_LOCATORS);
	}

	#[test]
	fn locator_heights_always_end_at_genesis() {
		for h in [0u64, 1, 9, 10, 11, 1000, 999_999] {
			assert_eq!(get_locator_heights(h).last(), Some(&0));
		}
	}

	#[test]
	fn encode_decode_roundtrip() {
		let entries = vec![
			LocatorEntry { height: 10, hash: [1u8; 32] },
			LocatorEntry { height: 0, hash: [0u8; 32] },
		];
		let buf = encode_locator(&entries);
		assert_eq!(buf.len(), 80);
		assert_eq!(decode_locator(&buf), entries);
	}

	#[test]
	fn decode_rejects_misaligned_length() {
		assert!(decode_locator(&[0u8; 39]).is_empty());
	}

	#[test]
	fn finds_deepest_matching_ancestor() {
		let locator = vec![
			LocatorEntry { height: 10, hash: [9u8; 32] },
			LocatorEntry { height: 5, hash: [5u8; 32] },
			LocatorEntry { height: 0, hash: [0u8; 32] },
		];
		let ancestor = find_common_ancestor(&locator, 100, |h| {
			if h == 5 {
				Some([5u8; 32])
			} else if h == 0 {
				Some([0u8; 32])
			} else {
				Some([0xffu8; 32])
			}
		});
		assert_eq!(ancestor.unwrap().height, 5);
	}
}
