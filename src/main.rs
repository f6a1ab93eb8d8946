// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use futures::{future, StreamExt};
use inkchain::chain::ChainStore;
use inkchain::consensus::Validator;
use inkchain::miner::Miner;
use inkchain::node::{
    connect_directory, ClientServer, ClientService, ConnectionManager, PeerServer, PeerService,
};
use inkchain::primitives::Identity;
use inkchain::settings::SETTINGS;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use triomphe::Arc;

/// Concurrent in-flight rpc channels per listener.
const MAX_PARALLEL_CHANNELS: usize = 32;

fn main() -> anyhow::Result<()> {
    init_tracing()?;

    // Positional overrides matching the classic launch line:
    // `inkchain <directory_addr> <private_key_hex>`.
    let mut args = std::env::args().skip(1);
    let directory_addr = args
        .next()
        .unwrap_or_else(|| SETTINGS.network.directory_addr.clone());
    let private_key_hex = args
        .next()
        .unwrap_or_else(|| SETTINGS.node.private_key_hex.clone());

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(directory_addr, private_key_hex))
}

async fn run(directory_addr: String, private_key_hex: String) -> anyhow::Result<()> {
    let identity = if private_key_hex.is_empty() {
        warn!("no private key configured; generating an ephemeral identity");
        Identity::generate()?
    } else {
        Identity::from_private_key_hex(&private_key_hex)?
    };
    let pub_key = identity.public_key_hex().to_owned();

    // Bind both listeners up front so their real ports are known before
    // we register anywhere.
    let mut peer_listener =
        tarpc::serde_transport::tcp::listen(&SETTINGS.network.peer_listen_addr, Json::default)
            .await?;
    peer_listener.config_mut().max_frame_length(usize::MAX);
    let peer_addr = advertised(peer_listener.local_addr());

    let mut client_listener =
        tarpc::serde_transport::tcp::listen(&SETTINGS.network.client_listen_addr, Json::default)
            .await?;
    client_listener.config_mut().max_frame_length(usize::MAX);
    let client_addr = client_listener.local_addr();

    // Co-located client applications find us through this file.
    std::fs::write(&SETTINGS.node.ip_ports_file, format!("{client_addr}\n"))?;
    info!("client rpc listening on {client_addr} (written to {})", SETTINGS.node.ip_ports_file);

    // Register with the directory and adopt the canvas settings. The
    // advertised difficulties are incremented by one network-wide.
    let directory = connect_directory(&directory_addr).await?;
    let mut chain_settings = directory
        .register(tarpc::context::current(), peer_addr.clone(), pub_key.clone())
        .await?;
    chain_settings.pow_difficulty_op_block += 1;
    chain_settings.pow_difficulty_noop_block += 1;
    info!(
        "registered with directory {directory_addr}; canvas {}x{}, difficulty {}/{}",
        chain_settings.canvas_x_max,
        chain_settings.canvas_y_max,
        chain_settings.pow_difficulty_op_block,
        chain_settings.pow_difficulty_noop_block,
    );

    let store = Arc::new(ChainStore::new(chain_settings));
    let validator = Arc::new(Validator::new(store.clone()));

    // Propagation plumbing: rpc handlers produce, the connection manager
    // consumes and fans out to peers.
    let (pop_tx, pop_rx) = mpsc::channel(1024);
    let (pblock_tx, pblock_rx) = mpsc::channel(1024);
    let (connect_tx, connect_rx) = mpsc::channel(64);

    let miner = Miner::new(
        store.clone(),
        validator.clone(),
        pub_key.clone(),
        usize::from(SETTINGS.miner.solver_threads),
        pblock_tx.clone(),
    );
    let (miner_channels, _miner_thread) = miner.spawn();

    let peer_server = PeerServer {
        store: store.clone(),
        validator: validator.clone(),
        miner: miner_channels.clone(),
        pop_tx: pop_tx.clone(),
        pblock_tx: pblock_tx.clone(),
        connect_tx,
        seen_blocks: Arc::new(Mutex::new(HashSet::new())),
    };
    tokio::spawn(async move {
        peer_listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(|channel| {
                let server = peer_server.clone();
                channel.execute(server.serve())
            })
            .buffer_unordered(MAX_PARALLEL_CHANNELS)
            .for_each(|()| async {})
            .await;
    });

    let client_server = ClientServer::new(
        store.clone(),
        validator.clone(),
        identity,
        miner_channels,
        pop_tx.clone(),
    );
    tokio::spawn(async move {
        client_listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(|channel| {
                let server = client_server.clone();
                channel.execute(server.serve())
            })
            .buffer_unordered(MAX_PARALLEL_CHANNELS)
            .for_each(|()| async {})
            .await;
    });

    let manager = ConnectionManager::new(store, directory, peer_addr.clone(), pub_key);
    tokio::spawn(manager.run(pop_rx, pblock_rx, connect_rx));

    info!(
        "Inkchain Core v{} mining as {peer_addr}",
        env!("CARGO_PKG_VERSION")
    );

    tokio::signal::ctrl_c().await?;
    info!(
        "Inkchain Core v{} shutting down...",
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

/// The peer address other miners should dial: the bound listener address,
/// with its ip swapped for the configured one when set.
fn advertised(local: SocketAddr) -> String {
    if SETTINGS.network.advertise_ip.is_empty() {
        local.to_string()
    } else {
        format!("{}:{}", SETTINGS.network.advertise_ip, local.port())
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
