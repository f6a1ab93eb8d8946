// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Hash128, SignedOperation};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A mined block. The block's identity is the hex MD5 of its canonical
/// byte encoding (`Block::hash`), which is also the value the proof of
/// work predicate runs over.
#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct Block {
    /// Hash of the parent block, or the genesis hash.
    pub prev_hash: Hash128,

    /// Operations committed by this block, in validation order. Empty for
    /// a no-op block.
    pub ops: Vec<SignedOperation>,

    /// Public identity of the miner that solved this block; earns the
    /// block reward.
    pub miner_pub_key: String,

    /// Proof of work solution.
    pub nonce: u32,
}

impl Block {
    /// Hashes the canonical encoding of the block.
    ///
    /// Panics only if the block exceeds the codec byte limit, which the
    /// op channel sizing makes unreachable.
    #[must_use]
    pub fn hash(&self) -> Hash128 {
        let bytes = crate::codec::encode_to_vec(self)
            .expect("block exceeds canonical encoding limit");
        Hash128::hash_bytes(&bytes)
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Store record: a block plus the indices of its children in the
/// append-only node array.
#[derive(Debug, Clone, Default)]
pub struct BlockNode {
    pub block: Block,
    pub children: Vec<usize>,
}

/// Returns true iff the hex form of `hash` has *exactly* `difficulty`
/// trailing `'0'` characters. This is the wire-level proof of work
/// predicate; difficulty 0 accepts any hash.
#[must_use]
pub fn pow_verify(hash: &Hash128, difficulty: u8) -> bool {
    if difficulty == 0 {
        return true;
    }

    let hex = hash.to_hex();
    let tail = hex.len().saturating_sub(difficulty as usize);
    if hex.len() < difficulty as usize + 1 {
        return false;
    }

    hex[tail..].bytes().all(|c| c == b'0') && hex.as_bytes()[tail - 1] != b'0'
}
