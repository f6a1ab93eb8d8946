// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Proof of work workers and the mining orchestrator.
//!
//! The orchestrator owns the working set of pending operations and keeps
//! exactly one job outstanding. Any state change (a new operation, a
//! better chain, a solution) cancels the job and starts a fresh one on
//! the current longest tip. Workers grind random nonces and poll their
//! cancel channel once per hash, so a retarget takes effect within one
//! iteration.

use crate::chain::ChainStore;
use crate::consensus::Validator;
use crate::node::{PropagateBlockMsg, TTL};
use crate::primitives::{pow_verify, Block, Hash128, SignedOperation};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use rand::Rng;
use std::thread;
use std::thread::JoinHandle;
use triomphe::Arc;

/// Buffer sizing for the op/block ingest channels; bursts beyond this
/// apply backpressure to the rpc handlers.
pub const INGEST_CHANNEL_CAP: usize = 1024;

/// Senders feeding the orchestrator: `sop_tx` for fresh operations (local
/// or gossiped), `sblock_tx` for externally received blocks that became
/// the new tip.
#[derive(Clone)]
pub struct MinerChannels {
    pub sop_tx: Sender<SignedOperation>,
    pub sblock_tx: Sender<Block>,
}

/// A running job. Dropping it disconnects the cancel channel, which every
/// worker polls before each hash attempt.
struct Job {
    id: u64,
    _cancel_tx: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Nonce search. Exits after sending one solution or as soon as the
/// cancel channel disconnects.
fn solve(
    mut block: Block,
    difficulty: u8,
    job_id: u64,
    cancel_rx: Receiver<()>,
    solved_tx: Sender<(u64, Block)>,
) {
    let mut rng = rand::thread_rng();

    loop {
        match cancel_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return,
        }

        block.nonce = rng.gen();
        if pow_verify(&block.hash(), difficulty) {
            let _ = solved_tx.send((job_id, block));
            return;
        }
    }
}

fn start_job(
    id: u64,
    template: Block,
    difficulty: u8,
    threads: usize,
    solved_tx: &Sender<(u64, Block)>,
) -> Job {
    debug!("starting job {id} at difficulty {difficulty}");
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    let workers = (0..threads)
        .map(|_| {
            let template = template.clone();
            let cancel_rx = cancel_rx.clone();
            let solved_tx = solved_tx.clone();
            thread::spawn(move || solve(template, difficulty, id, cancel_rx, solved_tx))
        })
        .collect();

    Job {
        id,
        _cancel_tx: cancel_tx,
        workers,
    }
}

pub struct Miner {
    store: Arc<ChainStore>,
    validator: Arc<Validator>,
    pub_key: String,
    threads: usize,
    pblock_tx: tokio::sync::mpsc::Sender<PropagateBlockMsg>,
}

impl Miner {
    #[must_use]
    pub fn new(
        store: Arc<ChainStore>,
        validator: Arc<Validator>,
        pub_key: String,
        threads: usize,
        pblock_tx: tokio::sync::mpsc::Sender<PropagateBlockMsg>,
    ) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        Self {
            store,
            validator,
            pub_key,
            threads,
            pblock_tx,
        }
    }

    /// Spawns the orchestrator thread. The returned channels are the only
    /// way into the mining loop; it runs for the lifetime of the process.
    pub fn spawn(self) -> (MinerChannels, JoinHandle<()>) {
        let (sop_tx, sop_rx) = bounded(INGEST_CHANNEL_CAP);
        let (sblock_tx, sblock_rx) = bounded(INGEST_CHANNEL_CAP);

        let handle = thread::spawn(move || self.run(&sop_rx, &sblock_rx));

        (MinerChannels { sop_tx, sblock_tx }, handle)
    }

    fn run(&self, sop_rx: &Receiver<SignedOperation>, sblock_rx: &Receiver<Block>) {
        let (solved_tx, solved_rx) = unbounded::<(u64, Block)>();
        let mut working: Vec<SignedOperation> = Vec::new();
        let mut job_seq: u64 = 0;

        // Idle bootstrap: before anything happens, mine a no-op block on
        // the genesis hash.
        info!("starting the first job on the genesis hash");
        let mut current = self.next_job(
            &mut job_seq,
            self.store.genesis_hash(),
            vec![],
            &solved_tx,
        );

        loop {
            select! {
                recv(sop_rx) -> msg => {
                    let Ok(op) = msg else { return };
                    debug!("retargeting on new operation {}", op.op_sig);

                    self.cancel(current);
                    working.push(op);

                    let chain = self.store.longest_path(&self.store.genesis_hash());
                    working = self.validator.validate_ops(std::mem::take(&mut working), &chain);
                    let parent = chain.last().map_or(self.store.genesis_hash(), Block::hash);
                    current = self.next_job(&mut job_seq, parent, working.clone(), &solved_tx);
                }
                recv(sblock_rx) -> msg => {
                    let Ok(block) = msg else { return };
                    debug!("retargeting on received block {}", block.hash());

                    self.cancel(current);

                    // The sender guarantees this block is the current tip.
                    let parent = block.hash();
                    let chain = self.store.longest_path(&self.store.genesis_hash());
                    working = self.validator.validate_ops(std::mem::take(&mut working), &chain);
                    current = self.next_job(&mut job_seq, parent, working.clone(), &solved_tx);
                }
                recv(solved_rx) -> msg => {
                    let Ok((id, block)) = msg else { return };
                    if id != current.id {
                        // A worker of an already-cancelled job raced its
                        // cancel signal.
                        continue;
                    }

                    info!("solved block {} on job {id}", block.hash());
                    self.cancel(current);

                    if let Err(err) = self.store.insert(&block) {
                        error!("could not insert own solved block: {err}");
                    }
                    if self
                        .pblock_tx
                        .blocking_send(PropagateBlockMsg { block, ttl: TTL })
                        .is_err()
                    {
                        warn!("block propagation channel closed");
                    }

                    let chain = self.store.longest_path(&self.store.genesis_hash());
                    working = self.validator.validate_ops(std::mem::take(&mut working), &chain);
                    let parent = chain.last().map_or(self.store.genesis_hash(), Block::hash);
                    current = self.next_job(&mut job_seq, parent, vec![], &solved_tx);
                }
            }
        }
    }

    /// Cancels a job and reaps its workers.
    fn cancel(&self, job: Job) {
        let Job { workers, .. } = job;
        // The cancel sender drops here; workers observe the disconnect on
        // their next poll.
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn next_job(
        &self,
        job_seq: &mut u64,
        parent: Hash128,
        ops: Vec<SignedOperation>,
        solved_tx: &Sender<(u64, Block)>,
    ) -> Job {
        *job_seq += 1;
        let template = build_template(parent, ops, &self.pub_key);
        let difficulty = self.store.settings().difficulty_for(&template);
        start_job(*job_seq, template, difficulty, self.threads, solved_tx)
    }
}

/// The block a job mines on: an op block when the working set is
/// non-empty, otherwise a no-op block.
#[must_use]
pub fn build_template(parent: Hash128, ops: Vec<SignedOperation>, pub_key: &str) -> Block {
    Block {
        prev_hash: parent,
        ops,
        miner_pub_key: pub_key.to_owned(),
        nonce: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{OpKind, ShapeOperation};
    use std::time::Duration;

    fn sample_op() -> SignedOperation {
        SignedOperation {
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
        }
    }

    #[test]
    fn empty_working_set_builds_noop_template() {
        let parent = Hash128::hash_bytes(b"parent");
        let template = build_template(parent, vec![], "miner");
        assert!(template.is_noop());
        assert_eq!(template.prev_hash, parent);

        let template = build_template(parent, vec![sample_op()], "miner");
        assert!(!template.is_noop());
    }

    #[test]
    fn solver_finds_trivial_difficulty_instantly() {
        let (solved_tx, solved_rx) = unbounded();
        let (_cancel_tx, cancel_rx) = bounded::<()>(0);
        let template = build_template(Hash128::hash_bytes(b"parent"), vec![], "miner");

        let worker = thread::spawn(move || solve(template, 0, 7, cancel_rx, solved_tx));

        let (id, block) = solved_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("difficulty 0 must solve immediately");
        assert_eq!(id, 7);
        assert!(pow_verify(&block.hash(), 0));
        worker.join().unwrap();
    }

    #[test]
    fn solver_exits_on_cancel() {
        let (solved_tx, solved_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        // Difficulty 28 is unreachable in test time; only the cancel can
        // end the worker.
        let template = build_template(Hash128::hash_bytes(b"parent"), vec![], "miner");
        let worker = thread::spawn(move || solve(template, 28, 1, cancel_rx, solved_tx));

        drop(cancel_tx);
        worker.join().unwrap();
        assert!(solved_rx.try_recv().is_err());
    }

    #[test]
    fn solved_block_satisfies_its_difficulty() {
        let (solved_tx, solved_rx) = unbounded();
        let (_cancel_tx, cancel_rx) = bounded::<()>(0);
        let template = build_template(Hash128::hash_bytes(b"parent"), vec![], "miner");

        let worker = thread::spawn(move || solve(template, 1, 1, cancel_rx, solved_tx));
        let (_, block) = solved_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("difficulty 1 solves quickly");
        assert!(pow_verify(&block.hash(), 1));
        assert!(block.hash().to_hex().ends_with('0'));
        worker.join().unwrap();
    }
}
