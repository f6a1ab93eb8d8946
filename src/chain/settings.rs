// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Block, Hash128};
use serde::{Deserialize, Serialize};

/// Network-wide parameters, handed out by the directory service when a
/// miner registers. Immutable for the lifetime of a run; every miner on a
/// canvas must hold identical values or consensus splits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Hash every first-generation block uses as its parent.
    pub genesis_block_hash: Hash128,

    /// Canvas dimensions; coordinates run over `[0, max]` inclusive.
    pub canvas_x_max: u32,
    pub canvas_y_max: u32,

    /// Ink rewards per mined block class.
    pub ink_per_op_block: u32,
    pub ink_per_noop_block: u32,

    /// Exact count of trailing zero hex characters required of a block
    /// hash, per block class.
    pub pow_difficulty_op_block: u8,
    pub pow_difficulty_noop_block: u8,

    /// The connection manager dials new peers below this count.
    pub min_peer_connections: u8,

    /// Peer/directory liveness interval in milliseconds.
    pub heartbeat_millis: u64,
}

impl ChainSettings {
    #[must_use]
    pub fn difficulty_for(&self, block: &Block) -> u8 {
        if block.is_noop() {
            self.pow_difficulty_noop_block
        } else {
            self.pow_difficulty_op_block
        }
    }

    #[must_use]
    pub fn reward_for(&self, block: &Block) -> u32 {
        if block.is_noop() {
            self.ink_per_noop_block
        } else {
            self.ink_per_op_block
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            genesis_block_hash: Hash128::hash_bytes(b"inkchain genesis"),
            canvas_x_max: 1023,
            canvas_y_max: 1023,
            ink_per_op_block: 50,
            ink_per_noop_block: 25,
            pow_difficulty_op_block: 5,
            pow_difficulty_noop_block: 6,
            min_peer_connections: 3,
            heartbeat_millis: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{OpKind, ShapeOperation, SignedOperation};

    #[test]
    fn class_selection() {
        let settings = ChainSettings::default();
        let noop = Block::default();
        assert_eq!(settings.difficulty_for(&noop), settings.pow_difficulty_noop_block);
        assert_eq!(settings.reward_for(&noop), settings.ink_per_noop_block);

        let op_block = Block {
            ops: vec![SignedOperation {
                op: ShapeOperation {
                    kind: OpKind::Add,
                    svg: "M 0 0 L 0 5".to_owned(),
                    fill: "transparent".to_owned(),
                    stroke: "red".to_owned(),
                    op_num: 0,
                },
                pub_key: "key".to_owned(),
                op_sig: "sig".to_owned(),
                add_sig: String::new(),
            }],
            ..Block::default()
        };
        assert_eq!(settings.difficulty_for(&op_block), settings.pow_difficulty_op_block);
        assert_eq!(settings.reward_for(&op_block), settings.ink_per_op_block);
    }
}
