// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Miner-to-miner gossip rpcs. Validation failures on this surface are
//! silently dropped: a peer relaying a stale or conflicting operation is
//! not an error worth reporting back.

use crate::chain::ChainStore;
use crate::consensus::Validator;
use crate::miner::MinerChannels;
use crate::node::{PropagateBlockMsg, PropagateOpMsg};
use crate::primitives::{Block, Hash128};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use triomphe::Arc;

#[tarpc::service]
pub trait PeerService {
    /// Registers the caller as a peer (through the connection manager)
    /// and returns every stored block as a bootstrap payload.
    async fn connect(addr: String) -> Vec<Block>;

    /// Liveness no-op; the caller refreshes its timestamp for us when the
    /// response returns.
    async fn heartbeat();

    /// Hands an operation to this miner. Validated, then forwarded to the
    /// local mining loop and, while ttl allows, to our own peers.
    async fn propagate_op(msg: PropagateOpMsg);

    /// Hands a block to this miner. Deduplicated by hash, re-propagated,
    /// validated on the path it claims to extend, and inserted.
    async fn propagate_block(msg: PropagateBlockMsg);

    /// Full-store payload for periodic sync, same format as `connect`.
    async fn get_block_chain() -> Vec<Block>;
}

/// Shared state behind the peer rpc surface.
#[derive(Clone)]
pub struct PeerServer {
    pub store: Arc<ChainStore>,
    pub validator: Arc<Validator>,
    pub miner: MinerChannels,
    pub pop_tx: mpsc::Sender<PropagateOpMsg>,
    pub pblock_tx: mpsc::Sender<PropagateBlockMsg>,
    pub connect_tx: mpsc::Sender<String>,

    /// Block hashes already handled once; the loop suppressor for block
    /// gossip. Unbounded by design for now.
    pub seen_blocks: Arc<Mutex<HashSet<Hash128>>>,
}

#[tarpc::server]
impl PeerService for PeerServer {
    async fn connect(self, _: tarpc::context::Context, addr: String) -> Vec<Block> {
        debug!("connect called by {addr}");
        if self.connect_tx.send(addr).await.is_err() {
            warn!("connection manager is gone; peer not recorded");
        }
        self.store.all_blocks()
    }

    async fn heartbeat(self, _: tarpc::context::Context) {}

    async fn propagate_op(self, _: tarpc::context::Context, msg: PropagateOpMsg) {
        match self.validator.validate_op_against_longest(&msg.op) {
            Ok(()) => {
                if self.miner.sop_tx.try_send(msg.op.clone()).is_err() {
                    warn!("op ingest channel full, dropping {}", msg.op.op_sig);
                    return;
                }

                if msg.ttl > 1 {
                    let forward = PropagateOpMsg {
                        op: msg.op,
                        ttl: msg.ttl - 1,
                    };
                    let _ = self.pop_tx.send(forward).await;
                }
            }
            Err(err) => {
                // Includes the duplicate sentinel: an op we already hold.
                debug!("dropping gossiped op: {err}");
            }
        }
    }

    async fn propagate_block(self, _: tarpc::context::Context, msg: PropagateBlockMsg) {
        let hash = msg.block.hash();

        {
            let mut seen = self.seen_blocks.lock();
            if !seen.insert(hash) {
                return;
            }
        }

        // Re-propagate first; the seen set keeps the flood loop-free.
        if msg.ttl > 0 {
            let _ = self.pblock_tx.send(msg.clone()).await;
        }

        // Validate on the path the block claims to extend; this is not
        // necessarily the longest chain.
        let path = self.store.cached_path(&msg.block.prev_hash);

        let tip_changed = {
            let _guard = self.validator.lock();
            if !self.validator.validate_block(&msg.block, &path) {
                debug!("dropping invalid gossiped block {hash}");
                return;
            }

            let genesis = self.store.genesis_hash();
            let tip_before = self.store.longest_path(&genesis).last().map(Block::hash);
            if let Err(err) = self.store.insert(&msg.block) {
                debug!("dropping gossiped block {hash}: {err}");
                return;
            }
            let tip_after = self.store.longest_path(&genesis).last().map(Block::hash);
            tip_before != tip_after
        };

        // A new tip means the miner should restart on top of it.
        if tip_changed && self.miner.sblock_tx.try_send(msg.block).is_err() {
            warn!("block ingest channel full, miner keeps its old tip");
        }
    }

    async fn get_block_chain(self, _: tarpc::context::Context) -> Vec<Block> {
        self.store.all_blocks()
    }
}
