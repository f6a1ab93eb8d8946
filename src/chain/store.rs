// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Hash-indexed block DAG. Blocks arrive in any order; children whose
//! parent has not arrived yet sit in the orphan map until it does. The
//! path cache keeps, for every block, the chain prefix ending at it, so
//! the globally longest chain is a scan over cache entries instead of a
//! walk over the whole tree.

use crate::chain::ChainSettings;
use crate::primitives::{pow_verify, Block, BlockNode, Hash128, SignedOperation};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErr {
    /// The block's hash does not satisfy the proof of work predicate for
    /// its class.
    BadBlock,
}

impl fmt::Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErr::BadBlock => write!(f, "block fails proof of work"),
        }
    }
}

impl std::error::Error for StoreErr {}

/// Longest chain prefix ending at a block. `rooted` is true iff the path
/// is anchored at the genesis hash; unrooted entries belong to orphan
/// subtrees and are excluded from longest-chain selection until their
/// ancestry arrives.
#[derive(Debug, Clone)]
struct PathInfo {
    len: usize,
    path: Vec<Block>,
    rooted: bool,
}

/// Shared block store.
///
/// Lock acquisition order when several are held:
/// `hash_map -> nodes -> orphans -> path_cache`. No lock is held across a
/// channel send.
pub struct ChainStore {
    settings: ChainSettings,

    /// Block hash -> index into `nodes`.
    hash_map: RwLock<HashMap<Hash128, usize>>,

    /// Append-only node array. Index 0 is a dummy entry standing in for
    /// the genesis hash, which has no block body.
    nodes: Mutex<Vec<BlockNode>>,

    /// Missing parent hash -> indices of waiting children.
    orphans: RwLock<HashMap<Hash128, Vec<usize>>>,

    path_cache: RwLock<HashMap<Hash128, PathInfo>>,

    /// Bumped on every successful insert; client rpc handlers block on it
    /// while waiting for their operation to land.
    insert_seq: Mutex<u64>,
    inserted: Condvar,
}

impl ChainStore {
    #[must_use]
    pub fn new(settings: ChainSettings) -> Self {
        let genesis = settings.genesis_block_hash;

        let mut hash_map = HashMap::new();
        hash_map.insert(genesis, 0);

        let mut path_cache = HashMap::new();
        path_cache.insert(
            genesis,
            PathInfo {
                len: 0,
                path: vec![],
                rooted: true,
            },
        );

        Self {
            settings,
            hash_map: RwLock::new(hash_map),
            nodes: Mutex::new(vec![BlockNode::default()]),
            orphans: RwLock::new(HashMap::new()),
            path_cache: RwLock::new(path_cache),
            insert_seq: Mutex::new(0),
            inserted: Condvar::new(),
        }
    }

    #[must_use]
    pub fn genesis_hash(&self) -> Hash128 {
        self.settings.genesis_block_hash
    }

    #[must_use]
    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Inserts a block. Verifies proof of work for the block's class,
    /// deduplicates by hash, links the block to its parent (or queues it
    /// as an orphan), adopts any orphans waiting on it, and patches the
    /// path cache. Broadcasts the insert condvar on success.
    pub fn insert(&self, block: &Block) -> Result<(), StoreErr> {
        let hash = block.hash();
        if !pow_verify(&hash, self.settings.difficulty_for(block)) {
            return Err(StoreErr::BadBlock);
        }

        {
            let mut map = self.hash_map.write();
            if map.contains_key(&hash) {
                // Gossip duplicates blocks liberally; a re-insert is success.
                return Ok(());
            }

            let mut nodes = self.nodes.lock();
            let mut orphans = self.orphans.write();
            let mut cache = self.path_cache.write();

            let idx = nodes.len();
            let adopted = orphans.remove(&hash).unwrap_or_default();
            nodes.push(BlockNode {
                block: block.clone(),
                children: adopted.clone(),
            });
            map.insert(hash, idx);

            match map.get(&block.prev_hash) {
                Some(&parent_idx) => nodes[parent_idx].children.push(idx),
                None => orphans.entry(block.prev_hash).or_default().push(idx),
            }

            let entry = match cache.get(&block.prev_hash) {
                Some(parent) => {
                    let mut path = parent.path.clone();
                    path.push(block.clone());
                    PathInfo {
                        len: parent.len + 1,
                        path,
                        rooted: parent.rooted,
                    }
                }
                None => PathInfo {
                    len: 1,
                    path: vec![block.clone()],
                    rooted: false,
                },
            };
            cache.insert(hash, entry);

            // Rebuild the cache entries of every descendant of the adopted
            // orphans, so the cache stays equal to a fresh recursive walk.
            let mut queue: VecDeque<usize> = adopted.into();
            while let Some(child_idx) = queue.pop_front() {
                let child = &nodes[child_idx];
                let child_hash = child.block.hash();
                if let Some(parent_info) = cache.get(&child.block.prev_hash).cloned() {
                    let mut path = parent_info.path.clone();
                    path.push(child.block.clone());
                    cache.insert(
                        child_hash,
                        PathInfo {
                            len: parent_info.len + 1,
                            path,
                            rooted: parent_info.rooted,
                        },
                    );
                }
                queue.extend(child.children.iter().copied());
            }
        }

        let mut seq = self.insert_seq.lock();
        *seq += 1;
        self.inserted.notify_all();
        Ok(())
    }

    #[must_use]
    pub fn get(&self, hash: &Hash128) -> Option<Block> {
        let idx = *self.hash_map.read().get(hash)?;
        Some(self.nodes.lock()[idx].block.clone())
    }

    /// Direct children of a block, in insertion order. `None` when the
    /// hash itself is unknown.
    #[must_use]
    pub fn children(&self, hash: &Hash128) -> Option<Vec<Block>> {
        let idx = *self.hash_map.read().get(hash)?;
        let nodes = self.nodes.lock();
        Some(
            nodes[idx]
                .children
                .iter()
                .map(|&c| nodes[c].block.clone())
                .collect(),
        )
    }

    /// Every stored block, excluding the dummy genesis entry. This is the
    /// bootstrap payload peers exchange; insertion order puts parents
    /// before their (non-orphaned) children.
    #[must_use]
    pub fn all_blocks(&self) -> Vec<Block> {
        self.nodes
            .lock()
            .iter()
            .skip(1)
            .map(|n| n.block.clone())
            .collect()
    }

    /// The deterministically-chosen longest chain rooted at `from`.
    ///
    /// For the genesis hash this is the globally longest chain, answered
    /// from the path cache. For any other known hash the subtree below it
    /// is walked iteratively. Ties are broken at every step towards the
    /// lexicographically greater tip hash, so all miners converge on the
    /// same chain regardless of arrival order.
    #[must_use]
    pub fn longest_path(&self, from: &Hash128) -> Vec<Block> {
        if *from == self.settings.genesis_block_hash {
            let cache = self.path_cache.read();
            let mut best: Option<(&Hash128, &PathInfo)> = None;
            for (hash, info) in cache.iter().filter(|(_, info)| info.rooted) {
                best = match best {
                    None => Some((hash, info)),
                    Some((best_hash, best_info)) => {
                        if info.len > best_info.len
                            || (info.len == best_info.len && hash > best_hash)
                        {
                            Some((hash, info))
                        } else {
                            Some((best_hash, best_info))
                        }
                    }
                };
            }
            return best.map(|(_, info)| info.path.clone()).unwrap_or_default();
        }

        let Some(start) = self.hash_map.read().get(from).copied() else {
            return vec![];
        };

        let nodes = self.nodes.lock();

        // Post-order over the subtree: children are resolved before their
        // parent, so the walk is iterative regardless of depth.
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(nodes[idx].children.iter().copied());
        }

        let mut memo: HashMap<usize, (usize, Vec<Block>, Hash128)> = HashMap::new();
        for &idx in order.iter().rev() {
            let node = &nodes[idx];

            let mut best: Option<(usize, Vec<Block>, Hash128)> = None;
            for child in &node.children {
                let cand = memo
                    .get(child)
                    .cloned()
                    .unwrap_or((0, vec![], Hash128::zero()));
                best = match best {
                    None => Some(cand),
                    Some(cur) => {
                        if cand.0 > cur.0 || (cand.0 == cur.0 && cand.2 > cur.2) {
                            Some(cand)
                        } else {
                            Some(cur)
                        }
                    }
                };
            }

            let own_hash = node.block.hash();
            let entry = match best {
                Some((len, suffix, tip)) => {
                    let mut path = vec![node.block.clone()];
                    path.extend(suffix);
                    (len + 1, path, tip)
                }
                None => (1, vec![node.block.clone()], own_hash),
            };
            memo.insert(idx, entry);
        }

        memo.remove(&start).map(|(_, path, _)| path).unwrap_or_default()
    }

    /// The cached chain prefix ending at `hash`, empty when unknown. This
    /// is the path a gossiped block is validated against before insert.
    #[must_use]
    pub fn cached_path(&self, hash: &Hash128) -> Vec<Block> {
        self.path_cache
            .read()
            .get(hash)
            .map(|info| info.path.clone())
            .unwrap_or_default()
    }

    /// Hash of the longest-chain block containing the operation with this
    /// signature, if it has landed.
    #[must_use]
    pub fn block_containing_sig(&self, op_sig: &str) -> Option<Hash128> {
        let chain = self.longest_path(&self.settings.genesis_block_hash);
        for block in &chain {
            if block.ops.iter().any(|op| op.op_sig == op_sig) {
                return Some(block.hash());
            }
        }
        None
    }

    /// The operation with this signature on the current longest chain.
    #[must_use]
    pub fn find_op(&self, op_sig: &str) -> Option<SignedOperation> {
        let chain = self.longest_path(&self.settings.genesis_block_hash);
        for block in &chain {
            if let Some(op) = block.ops.iter().find(|op| op.op_sig == op_sig) {
                return Some(op.clone());
            }
        }
        None
    }

    /// Monotonic insert counter, paired with [`Self::wait_for_insert`].
    #[must_use]
    pub fn insert_seq(&self) -> u64 {
        *self.insert_seq.lock()
    }

    /// Blocks the calling thread until a block lands after `last_seen`.
    /// Returns the new counter value.
    pub fn wait_for_insert(&self, last_seen: u64) -> u64 {
        let mut seq = self.insert_seq.lock();
        while *seq <= last_seen {
            self.inserted.wait(&mut seq);
        }
        *seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Settings with difficulty zero so arbitrary blocks insert.
    fn test_settings() -> ChainSettings {
        ChainSettings {
            pow_difficulty_op_block: 0,
            pow_difficulty_noop_block: 0,
            ..ChainSettings::default()
        }
    }

    fn block(prev: Hash128, nonce: u32) -> Block {
        Block {
            prev_hash: prev,
            ops: vec![],
            miner_pub_key: "miner".to_owned(),
            nonce,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let store = ChainStore::new(test_settings());
        let b = block(store.genesis_hash(), 7);

        store.insert(&b).unwrap();
        store.insert(&b).unwrap();

        assert_eq!(store.all_blocks().len(), 1);
        assert_eq!(store.insert_seq(), 1);
    }

    #[test]
    fn pow_is_checked_on_insert() {
        let mut settings = test_settings();
        settings.pow_difficulty_noop_block = 30;
        let store = ChainStore::new(settings);
        let b = block(store.genesis_hash(), 7);

        assert_eq!(store.insert(&b), Err(StoreErr::BadBlock));
    }

    #[test]
    fn chain_links_consecutively() {
        let store = ChainStore::new(test_settings());
        let b1 = block(store.genesis_hash(), 1);
        let b2 = block(b1.hash(), 2);
        let b3 = block(b2.hash(), 3);
        for b in [&b1, &b2, &b3] {
            store.insert(b).unwrap();
        }

        let chain = store.longest_path(&store.genesis_hash());
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].prev_hash, store.genesis_hash());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash());
        }
    }

    #[test]
    fn orphan_waits_for_its_parent() {
        let store = ChainStore::new(test_settings());
        let parent = block(store.genesis_hash(), 1);
        let child = block(parent.hash(), 2);
        let grandchild = block(child.hash(), 3);

        store.insert(&grandchild).unwrap();
        store.insert(&child).unwrap();
        assert!(store.longest_path(&store.genesis_hash()).is_empty());

        store.insert(&parent).unwrap();
        let chain = store.longest_path(&store.genesis_hash());
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2].hash(), grandchild.hash());
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let settings = test_settings();
        let genesis = settings.genesis_block_hash;
        let b1 = block(genesis, 1);
        let b2 = block(b1.hash(), 2);
        let b3a = block(b2.hash(), 3);
        let b3b = block(b2.hash(), 4);
        let blocks = [b1, b2, b3a, b3b];

        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3],
            vec![3, 2, 1, 0],
            vec![1, 3, 0, 2],
            vec![2, 0, 3, 1],
        ];

        let mut tips = Vec::new();
        for order in orders {
            let store = ChainStore::new(settings.clone());
            for &i in &order {
                store.insert(&blocks[i]).unwrap();
            }
            let chain = store.longest_path(&store.genesis_hash());
            assert_eq!(chain.len(), 3);
            tips.push(chain.last().unwrap().hash());
        }
        assert!(tips.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn equal_length_tie_breaks_to_greater_hash() {
        let store = ChainStore::new(test_settings());
        let parent = block(store.genesis_hash(), 1);
        let sib_a = block(parent.hash(), 100);
        let sib_b = block(parent.hash(), 200);

        store.insert(&parent).unwrap();
        store.insert(&sib_a).unwrap();
        store.insert(&sib_b).unwrap();

        let expected = std::cmp::max(sib_a.hash(), sib_b.hash());
        let chain = store.longest_path(&store.genesis_hash());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].hash(), expected);

        // The subtree walk from the parent agrees with the cache scan.
        let sub = store.longest_path(&parent.hash());
        assert_eq!(sub.last().unwrap().hash(), expected);
    }

    #[test]
    fn children_in_insertion_order() {
        let store = ChainStore::new(test_settings());
        let parent = block(store.genesis_hash(), 1);
        let c1 = block(parent.hash(), 2);
        let c2 = block(parent.hash(), 3);

        store.insert(&parent).unwrap();
        store.insert(&c1).unwrap();
        store.insert(&c2).unwrap();

        let children = store.children(&parent.hash()).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].hash(), c1.hash());
        assert_eq!(children[1].hash(), c2.hash());

        assert!(store.children(&Hash128::hash_bytes(b"nope")).is_none());
    }

    #[test]
    fn genesis_children_are_reachable() {
        let store = ChainStore::new(test_settings());
        let b = block(store.genesis_hash(), 1);
        store.insert(&b).unwrap();

        let children = store.children(&store.genesis_hash()).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].hash(), b.hash());
        assert_eq!(store.get(&b.hash()).unwrap(), b);
    }

    #[test]
    fn insert_wakes_condvar_waiters() {
        let store = std::sync::Arc::new(ChainStore::new(test_settings()));
        let seen = store.insert_seq();

        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || store.wait_for_insert(seen))
        };

        store.insert(&block(store.genesis_hash(), 1)).unwrap();
        assert_eq!(waiter.join().unwrap(), seen + 1);
    }

    #[test]
    fn bootstrap_payload_excludes_dummy_genesis() {
        let store = ChainStore::new(test_settings());
        assert!(store.all_blocks().is_empty());

        let b = block(store.genesis_hash(), 1);
        store.insert(&b).unwrap();
        assert_eq!(store.all_blocks(), vec![b]);
    }
}
