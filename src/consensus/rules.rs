// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Admissibility rules for operations and blocks. Every check replays a
//! chain snapshot: ink is earned by mining and spent by adds, refunded by
//! deletes; live shapes of different owners may never overlap; only the
//! owner of an add may delete it.

use crate::chain::{ChainSettings, ChainStore};
use crate::primitives::{pow_verify, Block, Hash128, OpKind, ShapeOperation, SignedOperation};
use crate::raster::{shape_from_op, PixelArray, PixelSubArray, RasterErr};
use log::error;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use triomphe::Arc;

/// Marker miner key for the scratch block used while validating an op
/// sequence. Never a real identity: real keys are hex SPKI documents.
const SCRATCH_MINER_KEY: &str = "~validation-scratch~";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateErr {
    SvgTooLong(String),
    InvalidSvg(String),
    OutOfBounds,

    /// The key's replayed ink balance cannot cover the shape. Carries the
    /// required amount.
    InsufficientInk(u32),

    /// The shape's cells intersect a live shape of another key. Carries
    /// the offending svg string.
    ShapeOverlap(String),

    /// The delete target does not exist under this key, or was already
    /// deleted. Carries the target shape hash.
    ShapeOwner(String),

    /// Internal sentinel: this op signature is already on the snapshot.
    /// Client handlers read it as "the operation landed"; it is never
    /// surfaced on the wire.
    Duplicate(String),
}

impl From<RasterErr> for ValidateErr {
    fn from(err: RasterErr) -> Self {
        match err {
            RasterErr::SvgTooLong(svg) => ValidateErr::SvgTooLong(svg),
            RasterErr::InvalidSvg(svg) => ValidateErr::InvalidSvg(svg),
            RasterErr::OutOfBounds => ValidateErr::OutOfBounds,
        }
    }
}

impl fmt::Display for ValidateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidateErr::SvgTooLong(svg) => write!(f, "svg string too long: {svg}"),
            ValidateErr::InvalidSvg(svg) => write!(f, "invalid svg string: {svg}"),
            ValidateErr::OutOfBounds => write!(f, "shape is out of canvas bounds"),
            ValidateErr::InsufficientInk(needed) => {
                write!(f, "insufficient ink: {needed} needed")
            }
            ValidateErr::ShapeOverlap(svg) => write!(f, "shape overlaps another owner: {svg}"),
            ValidateErr::ShapeOwner(hash) => write!(f, "shape not owned or already deleted: {hash}"),
            ValidateErr::Duplicate(sig) => write!(f, "duplicate shape hash: {sig}"),
        }
    }
}

impl std::error::Error for ValidateErr {}

pub struct Validator {
    store: Arc<ChainStore>,

    /// Serializes validate-then-insert pairs so the snapshot a check ran
    /// against is the one the store then commits. Reads skip this.
    validate_lock: Mutex<()>,
}

impl Validator {
    #[must_use]
    pub fn new(store: Arc<ChainStore>) -> Self {
        Self {
            store,
            validate_lock: Mutex::new(()),
        }
    }

    fn settings(&self) -> &ChainSettings {
        self.store.settings()
    }

    /// Takes the validate-and-insert lock. Held by gossip handlers across
    /// their validate + insert pair.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.validate_lock.lock()
    }

    /// Admissibility of an add against `chain`: rasterizes the shape, then
    /// checks ink and overlaps. `Duplicate` signals the op already landed.
    pub fn check_add(
        &self,
        op: &ShapeOperation,
        pub_key: &str,
        op_sig: &str,
        chain: &[Block],
    ) -> Result<(), ValidateErr> {
        let settings = self.settings();
        let shape = shape_from_op(op, settings.canvas_x_max, settings.canvas_y_max)?;
        let (sub, ink_required) = shape.sub_array_and_cost();
        self.check_ink_and_conflicts(&sub, ink_required, pub_key, op_sig, &op.svg, chain)
    }

    /// The ink-and-overlap replay backing [`Self::check_add`], for callers
    /// that already rasterized the shape.
    pub fn check_ink_and_conflicts(
        &self,
        sub: &PixelSubArray,
        ink_required: u32,
        pub_key: &str,
        op_sig: &str,
        svg: &str,
        chain: &[Block],
    ) -> Result<(), ValidateErr> {
        let settings = self.settings();
        let mut ink: i64 = 0;

        // Live adds by other keys, by op signature.
        let mut shapes_existing: HashMap<&str, &SignedOperation> = HashMap::new();

        for block in chain {
            if block.miner_pub_key == pub_key {
                ink += i64::from(settings.reward_for(block));
            }

            for opinfo in &block.ops {
                if opinfo.pub_key == pub_key {
                    if opinfo.op_sig == op_sig {
                        return Err(ValidateErr::Duplicate(op_sig.to_owned()));
                    }

                    let cost = match self.op_cost(&opinfo.op) {
                        Some(cost) => i64::from(cost),
                        None => continue,
                    };
                    match opinfo.op.kind {
                        OpKind::Add => ink -= cost,
                        OpKind::Delete => ink += cost,
                    }
                } else {
                    match opinfo.op.kind {
                        OpKind::Add => {
                            shapes_existing.insert(&opinfo.op_sig, opinfo);
                        }
                        OpKind::Delete => {
                            shapes_existing.remove(opinfo.add_sig.as_str());
                        }
                    }
                }
            }
        }

        if i64::from(ink_required) > ink {
            return Err(ValidateErr::InsufficientInk(ink_required));
        }

        let mut canvas = PixelArray::new(settings.canvas_x_max, settings.canvas_y_max);
        for opinfo in shapes_existing.values() {
            match shape_from_op(&opinfo.op, settings.canvas_x_max, settings.canvas_y_max) {
                Ok(shape) => {
                    let (other_sub, _) = shape.sub_array_and_cost();
                    canvas.merge_sub_array(&other_sub);
                }
                Err(err) => {
                    error!("unrasterizable shape on committed chain: {err}");
                }
            }
        }

        if canvas.has_conflict(sub) {
            return Err(ValidateErr::ShapeOverlap(svg.to_owned()));
        }

        Ok(())
    }

    /// A delete is allowed iff `chain` holds an add by `pub_key` with this
    /// signature and no delete by the same key has consumed it yet.
    pub fn check_delete(
        &self,
        target_shape_hash: &str,
        pub_key: &str,
        chain: &[Block],
    ) -> Result<(), ValidateErr> {
        let mut allowed = false;

        'outer: for block in chain {
            for opinfo in &block.ops {
                if opinfo.pub_key != pub_key {
                    continue;
                }
                if opinfo.op_sig == target_shape_hash {
                    allowed = true;
                } else if opinfo.add_sig == target_shape_hash {
                    allowed = false;
                    break 'outer;
                }
            }
        }

        if allowed {
            Ok(())
        } else {
            Err(ValidateErr::ShapeOwner(target_shape_hash.to_owned()))
        }
    }

    /// Validates one signed operation against the current longest chain,
    /// under the validate lock. The gossip ingest path and the client
    /// wait loops both funnel through here.
    pub fn validate_op_against_longest(
        &self,
        opinfo: &SignedOperation,
    ) -> Result<(), ValidateErr> {
        let settings = self.settings();
        match opinfo.op.kind {
            OpKind::Add => {
                let shape =
                    shape_from_op(&opinfo.op, settings.canvas_x_max, settings.canvas_y_max)?;
                let (sub, ink_required) = shape.sub_array_and_cost();

                let _guard = self.lock();
                let chain = self.store.longest_path(&self.store.genesis_hash());
                self.check_ink_and_conflicts(
                    &sub,
                    ink_required,
                    &opinfo.pub_key,
                    &opinfo.op_sig,
                    &opinfo.op.svg,
                    &chain,
                )
            }
            OpKind::Delete => {
                let _guard = self.lock();
                let chain = self.store.longest_path(&self.store.genesis_hash());
                self.check_delete(&opinfo.add_sig, &opinfo.pub_key, &chain)
            }
        }
    }

    /// Filters `ops` down to the subset admissible in order against
    /// `chain`, validating each op as if the ones before it were already
    /// committed in a block on top of the chain. Order is preserved.
    #[must_use]
    pub fn validate_ops(
        &self,
        ops: Vec<SignedOperation>,
        chain: &[Block],
    ) -> Vec<SignedOperation> {
        let mut test_chain: Vec<Block> = chain.to_vec();
        test_chain.push(Block {
            prev_hash: Hash128::zero(),
            ops: vec![],
            miner_pub_key: SCRATCH_MINER_KEY.to_owned(),
            nonce: 0,
        });

        for opinfo in ops {
            let admissible = match opinfo.op.kind {
                OpKind::Add => self
                    .check_add(&opinfo.op, &opinfo.pub_key, &opinfo.op_sig, &test_chain)
                    .is_ok(),
                OpKind::Delete => self
                    .check_delete(&opinfo.add_sig, &opinfo.pub_key, &test_chain)
                    .is_ok(),
            };

            if admissible {
                test_chain
                    .last_mut()
                    .expect("scratch block present")
                    .ops
                    .push(opinfo);
            }
        }

        test_chain.pop().expect("scratch block present").ops
    }

    /// Full block admissibility: proof of work for the block's class, and
    /// every operation admissible in order against `chain`.
    #[must_use]
    pub fn validate_block(&self, block: &Block, chain: &[Block]) -> bool {
        if !pow_verify(&block.hash(), self.settings().difficulty_for(block)) {
            return false;
        }

        let accepted = self.validate_ops(block.ops.clone(), chain);
        accepted.len() == block.ops.len()
    }

    /// The replayed ink balance of a key along `chain`. Unrasterizable
    /// committed shapes are skipped with an error log, undercounting
    /// spends rather than crashing the miner.
    #[must_use]
    pub fn ink_balance(&self, pub_key: &str, chain: &[Block]) -> i64 {
        let settings = self.settings();
        let mut ink: i64 = 0;

        for block in chain {
            if block.miner_pub_key == pub_key {
                ink += i64::from(settings.reward_for(block));
            }

            for opinfo in &block.ops {
                if opinfo.pub_key != pub_key {
                    continue;
                }
                let cost = match self.op_cost(&opinfo.op) {
                    Some(cost) => i64::from(cost),
                    None => continue,
                };
                match opinfo.op.kind {
                    OpKind::Add => ink -= cost,
                    OpKind::Delete => ink += cost,
                }
            }
        }

        ink
    }

    /// Ink balance of a key on the current longest chain, clamped for the
    /// wire.
    #[must_use]
    pub fn ink_remaining(&self, pub_key: &str) -> u32 {
        let chain = self.store.longest_path(&self.store.genesis_hash());
        self.ink_balance(pub_key, &chain).max(0) as u32
    }

    fn op_cost(&self, op: &ShapeOperation) -> Option<u32> {
        let settings = self.settings();
        match shape_from_op(op, settings.canvas_x_max, settings.canvas_y_max) {
            Ok(shape) => Some(shape.sub_array_and_cost().1),
            Err(err) => {
                error!("unrasterizable shape on committed chain: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSettings;
    use crate::primitives::TRANSPARENT;

    fn test_validator() -> Validator {
        let settings = ChainSettings {
            pow_difficulty_op_block: 0,
            pow_difficulty_noop_block: 0,
            ink_per_noop_block: 10,
            ink_per_op_block: 20,
            canvas_x_max: 100,
            canvas_y_max: 100,
            ..ChainSettings::default()
        };
        Validator::new(Arc::new(ChainStore::new(settings)))
    }

    fn add_op(svg: &str, key: &str, sig: &str, op_num: u64) -> SignedOperation {
        SignedOperation {
            op: ShapeOperation {
                kind: OpKind::Add,
                svg: svg.to_owned(),
                fill: TRANSPARENT.to_owned(),
                stroke: "red".to_owned(),
                op_num,
            },
            pub_key: key.to_owned(),
            op_sig: sig.to_owned(),
            add_sig: String::new(),
        }
    }

    fn delete_op(target: &SignedOperation, sig: &str, op_num: u64) -> SignedOperation {
        SignedOperation {
            op: ShapeOperation {
                kind: OpKind::Delete,
                op_num,
                ..target.op.clone()
            },
            pub_key: target.pub_key.clone(),
            op_sig: sig.to_owned(),
            add_sig: target.op_sig.clone(),
        }
    }

    fn noop_block(miner: &str, nonce: u32) -> Block {
        Block {
            prev_hash: Hash128::zero(),
            ops: vec![],
            miner_pub_key: miner.to_owned(),
            nonce,
        }
    }

    fn op_block(miner: &str, ops: Vec<SignedOperation>, nonce: u32) -> Block {
        Block {
            prev_hash: Hash128::zero(),
            ops,
            miner_pub_key: miner.to_owned(),
            nonce,
        }
    }

    #[test]
    fn fresh_key_has_no_ink() {
        let validator = test_validator();
        let op = add_op("M 0 0 L 0 5", "k1", "sig1", 0);

        let err = validator
            .check_add(&op.op, &op.pub_key, &op.op_sig, &[])
            .unwrap_err();
        assert_eq!(err, ValidateErr::InsufficientInk(5));
    }

    #[test]
    fn mining_earns_spendable_ink() {
        let validator = test_validator();
        let chain = vec![noop_block("k1", 1)];
        let op = add_op("M 0 0 L 0 5", "k1", "sig1", 0);

        validator
            .check_add(&op.op, &op.pub_key, &op.op_sig, &chain)
            .unwrap();

        // Cost 15 exceeds the 10 earned from one no-op block.
        let too_big = add_op("M 0 0 L 0 15", "k1", "sig2", 1);
        let err = validator
            .check_add(&too_big.op, &too_big.pub_key, &too_big.op_sig, &chain)
            .unwrap_err();
        assert_eq!(err, ValidateErr::InsufficientInk(15));
    }

    #[test]
    fn committed_op_reports_duplicate() {
        let validator = test_validator();
        let op = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let chain = vec![noop_block("k1", 1), op_block("k1", vec![op.clone()], 2)];

        let err = validator
            .check_add(&op.op, &op.pub_key, &op.op_sig, &chain)
            .unwrap_err();
        assert_eq!(err, ValidateErr::Duplicate("sig1".to_owned()));
    }

    #[test]
    fn overlap_is_per_owner() {
        let validator = test_validator();
        let k1_add = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let chain = vec![
            noop_block("k1", 1),
            noop_block("k2", 2),
            op_block("k1", vec![k1_add], 3),
        ];

        // Same owner may overlap their own shape.
        let same_owner = add_op("M 0 1 L 0 4", "k1", "sig2", 1);
        validator
            .check_add(&same_owner.op, "k1", &same_owner.op_sig, &chain)
            .unwrap();

        // A different owner on the same cells is rejected.
        let other_owner = add_op("M 0 1 L 0 4", "k2", "sig3", 0);
        let err = validator
            .check_add(&other_owner.op, "k2", &other_owner.op_sig, &chain)
            .unwrap_err();
        assert_eq!(err, ValidateErr::ShapeOverlap("M 0 1 L 0 4".to_owned()));

        // Disjoint cells are fine.
        let disjoint = add_op("M 5 0 L 5 5", "k2", "sig4", 0);
        validator
            .check_add(&disjoint.op, "k2", &disjoint.op_sig, &chain)
            .unwrap();
    }

    #[test]
    fn deleting_frees_the_cells() {
        let validator = test_validator();
        let k1_add = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let k1_del = delete_op(&k1_add, "sig2", 1);
        let chain = vec![
            noop_block("k1", 1),
            noop_block("k2", 2),
            op_block("k1", vec![k1_add], 3),
            op_block("k1", vec![k1_del], 4),
        ];

        let other_owner = add_op("M 0 1 L 0 4", "k2", "sig3", 0);
        validator
            .check_add(&other_owner.op, "k2", &other_owner.op_sig, &chain)
            .unwrap();
    }

    #[test]
    fn delete_requires_ownership() {
        let validator = test_validator();
        let k1_add = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let chain = vec![noop_block("k1", 1), op_block("k1", vec![k1_add.clone()], 2)];

        validator.check_delete("sig1", "k1", &chain).unwrap();

        let err = validator.check_delete("sig1", "k2", &chain).unwrap_err();
        assert_eq!(err, ValidateErr::ShapeOwner("sig1".to_owned()));
    }

    #[test]
    fn delete_cannot_run_twice() {
        let validator = test_validator();
        let k1_add = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let k1_del = delete_op(&k1_add, "sig2", 1);
        let chain = vec![
            noop_block("k1", 1),
            op_block("k1", vec![k1_add], 2),
            op_block("k1", vec![k1_del], 3),
        ];

        let err = validator.check_delete("sig1", "k1", &chain).unwrap_err();
        assert_eq!(err, ValidateErr::ShapeOwner("sig1".to_owned()));
    }

    #[test]
    fn validate_ops_commits_sequentially() {
        let validator = test_validator();
        // One no-op block: 10 ink for k1.
        let chain = vec![noop_block("k1", 1)];

        // First op spends 6, leaving 4; the second needs 6 and drops out;
        // the third needs 4 and fits.
        let ops = vec![
            add_op("M 0 0 L 0 6", "k1", "sig1", 0),
            add_op("M 5 0 L 5 6", "k1", "sig2", 1),
            add_op("M 10 0 L 10 4", "k1", "sig3", 2),
        ];

        let accepted = validator.validate_ops(ops, &chain);
        let sigs: Vec<&str> = accepted.iter().map(|o| o.op_sig.as_str()).collect();
        assert_eq!(sigs, vec!["sig1", "sig3"]);
    }

    #[test]
    fn validate_block_checks_every_op() {
        let validator = test_validator();
        let chain = vec![noop_block("k1", 1)];

        let good = op_block("k2", vec![add_op("M 0 0 L 0 6", "k1", "sig1", 0)], 5);
        assert!(validator.validate_block(&good, &chain));

        let bad = op_block(
            "k2",
            vec![
                add_op("M 0 0 L 0 6", "k1", "sig1", 0),
                add_op("M 5 0 L 5 6", "k1", "sig2", 1),
            ],
            5,
        );
        assert!(!validator.validate_block(&bad, &chain));
    }

    #[test]
    fn ink_balance_replays_rewards_and_costs() {
        let validator = test_validator();
        let k1_add = add_op("M 0 0 L 0 5", "k1", "sig1", 0);
        let k1_del = delete_op(&k1_add, "sig2", 1);

        let chain = vec![noop_block("k1", 1)];
        assert_eq!(validator.ink_balance("k1", &chain), 10);

        let chain = vec![noop_block("k1", 1), op_block("k1", vec![k1_add], 2)];
        // +10 noop, +20 op block reward, -5 line.
        assert_eq!(validator.ink_balance("k1", &chain), 25);

        let chain = {
            let mut c = chain;
            c.push(op_block("k2", vec![k1_del], 3));
            c
        };
        // Refund restores the 5; the op block was mined by k2.
        assert_eq!(validator.ink_balance("k1", &chain), 30);
        assert_eq!(validator.ink_balance("k2", &chain), 20);
    }
}
