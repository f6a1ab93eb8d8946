// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Peer-set maintenance and gossip fan-out. The connection manager is the
//! single task that dials peers, heartbeats them and the directory,
//! drains the outgoing propagation channels, and keeps the peer count
//! above the configured minimum.

use crate::chain::ChainStore;
use crate::primitives::{Block, SignedOperation};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tarpc::context;
use tarpc::tokio_serde::formats::Json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use triomphe::Arc;

mod client_rpc;
mod directory;
mod peer_rpc;

pub use client_rpc::*;
pub use directory::*;
pub use peer_rpc::*;

/// Hop budget for operation gossip; sized to cover typical peer-graph
/// diameters.
pub const TTL: u8 = 2;

/// Ticks between full chain syncs with every peer.
const FULL_SYNC_TICKS: u32 = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropagateOpMsg {
    pub op: SignedOperation,
    pub ttl: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropagateBlockMsg {
    pub block: Block,
    pub ttl: u8,
}

/// An outbound peer connection.
struct Peer {
    client: PeerServiceClient,
    last_heartbeat: Instant,
}

pub struct ConnectionManager {
    store: Arc<ChainStore>,
    directory: DirectoryServiceClient,
    self_addr: String,
    pub_key: String,
    peers: HashMap<String, Peer>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        store: Arc<ChainStore>,
        directory: DirectoryServiceClient,
        self_addr: String,
        pub_key: String,
    ) -> Self {
        Self {
            store,
            directory,
            self_addr,
            pub_key,
            peers: HashMap::new(),
        }
    }

    /// Runs for the lifetime of the process. Ticks at a fifth of the
    /// heartbeat interval; in between, drains peer-connect requests and
    /// the op/block propagation channels.
    pub async fn run(
        mut self,
        mut pop_rx: mpsc::Receiver<PropagateOpMsg>,
        mut pblock_rx: mpsc::Receiver<PropagateBlockMsg>,
        mut connect_rx: mpsc::Receiver<String>,
    ) {
        let settings = self.store.settings().clone();
        let tick_period = Duration::from_millis((settings.heartbeat_millis / 5).max(1));
        let liveness_window = Duration::from_millis(settings.heartbeat_millis);

        let mut tick = tokio::time::interval(tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks_since_sync = 0u32;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.server_heartbeat().await;

                    if ticks_since_sync >= FULL_SYNC_TICKS {
                        self.peer_sync().await;
                        ticks_since_sync = 0;
                    } else {
                        ticks_since_sync += 1;
                        self.peer_heartbeats().await;
                    }

                    self.evict_stale_peers(liveness_window);
                    if self.peers.len() < usize::from(settings.min_peer_connections) {
                        self.request_more_peers().await;
                    }
                }
                Some(addr) = connect_rx.recv() => {
                    // A peer called `connect` on us; dial it back so the
                    // link is symmetric.
                    self.dial_peers(vec![addr]).await;
                }
                Some(msg) = pop_rx.recv() => {
                    self.server_heartbeat().await;
                    self.broadcast_op(msg).await;
                }
                Some(msg) = pblock_rx.recv() => {
                    self.server_heartbeat().await;
                    self.broadcast_block(msg).await;
                }
            }
        }
    }

    /// Directory liveness ping; a failure triggers a re-registration
    /// attempt, since the directory forgets silent miners.
    async fn server_heartbeat(&mut self) {
        if self
            .directory
            .heartbeat(context::current(), self.pub_key.clone())
            .await
            .is_ok()
        {
            return;
        }

        warn!("directory heartbeat failed, re-registering");
        if let Err(err) = self
            .directory
            .register(
                context::current(),
                self.self_addr.clone(),
                self.pub_key.clone(),
            )
            .await
        {
            warn!("directory re-registration failed: {err}");
        }
    }

    /// Dials every address we are not yet connected to, records the peer,
    /// and inserts its bootstrap chain.
    async fn dial_peers(&mut self, addrs: Vec<String>) {
        for addr in addrs {
            if addr == self.self_addr || self.peers.contains_key(&addr) {
                continue;
            }

            let transport = match tarpc::serde_transport::tcp::connect(&addr, Json::default).await
            {
                Ok(transport) => transport,
                Err(err) => {
                    debug!("could not dial peer {addr}: {err}");
                    continue;
                }
            };
            let client =
                PeerServiceClient::new(tarpc::client::Config::default(), transport).spawn();

            match client
                .connect(context::current(), self.self_addr.clone())
                .await
            {
                Ok(blocks) => {
                    info!("connected to peer {addr} ({} bootstrap blocks)", blocks.len());
                    self.insert_bootstrap(&blocks);
                    self.peers.insert(
                        addr,
                        Peer {
                            client,
                            last_heartbeat: Instant::now(),
                        },
                    );
                }
                Err(err) => debug!("peer connect rpc failed for {addr}: {err}"),
            }
        }
    }

    /// Periodic full sync: pull every peer's store and insert what we are
    /// missing. Parents arrive before children in the payload, so orphan
    /// adoption stays rare.
    async fn peer_sync(&mut self) {
        debug!("performing a full peer sync");
        let mut synced: Vec<(String, Vec<Block>)> = Vec::new();

        for (addr, peer) in &self.peers {
            match peer.client.get_block_chain(context::current()).await {
                Ok(blocks) => synced.push((addr.clone(), blocks)),
                Err(err) => debug!("sync with {addr} failed: {err}"),
            }
        }

        for (addr, blocks) in synced {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.last_heartbeat = Instant::now();
            }
            self.insert_bootstrap(&blocks);
        }
    }

    fn insert_bootstrap(&self, blocks: &[Block]) {
        for block in blocks {
            if let Err(err) = self.store.insert(block) {
                debug!("dropping bootstrap block: {err}");
            }
        }
    }

    async fn peer_heartbeats(&mut self) {
        for (addr, peer) in &mut self.peers {
            match peer.client.heartbeat(context::current()).await {
                Ok(()) => peer.last_heartbeat = Instant::now(),
                Err(err) => debug!("heartbeat to {addr} failed: {err}"),
            }
        }
    }

    fn evict_stale_peers(&mut self, window: Duration) {
        self.peers.retain(|addr, peer| {
            let live = peer.last_heartbeat.elapsed() <= window;
            if !live {
                info!("dropping stale peer {addr}");
            }
            live
        });
    }

    async fn request_more_peers(&mut self) {
        match self
            .directory
            .get_nodes(context::current(), self.pub_key.clone())
            .await
        {
            Ok(addrs) => self.dial_peers(addrs).await,
            Err(err) => debug!("directory get_nodes failed: {err}"),
        }
    }

    /// Network errors during propagation are logged and ignored; peers
    /// that keep failing age out via the liveness sweep.
    async fn broadcast_op(&self, msg: PropagateOpMsg) {
        for (addr, peer) in &self.peers {
            if let Err(err) = peer
                .client
                .propagate_op(context::current(), msg.clone())
                .await
            {
                debug!("op propagation to {addr} failed: {err}");
            }
        }
    }

    async fn broadcast_block(&self, msg: PropagateBlockMsg) {
        for (addr, peer) in &self.peers {
            if let Err(err) = peer
                .client
                .propagate_block(context::current(), msg.clone())
                .await
            {
                debug!("block propagation to {addr} failed: {err}");
            }
        }
    }
}
