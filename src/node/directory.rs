// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Client surface of the directory service. The directory hands out the
//! chain settings and peer addresses; it does not take part in consensus.

use crate::chain::ChainSettings;
use tarpc::tokio_serde::formats::Json;

#[tarpc::service]
pub trait DirectoryService {
    /// Registers a miner under its public key and listening address.
    /// The returned settings are immutable for the run.
    async fn register(addr: String, pub_key: String) -> ChainSettings;

    /// Liveness ping; the directory drops miners that stop sending these.
    async fn heartbeat(pub_key: String) -> bool;

    /// Addresses of other registered miners to dial.
    async fn get_nodes(pub_key: String) -> Vec<String>;
}

/// Dials the directory over tcp.
pub async fn connect_directory(addr: &str) -> anyhow::Result<DirectoryServiceClient> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Json::default).await?;
    Ok(DirectoryServiceClient::new(tarpc::client::Config::default(), transport).spawn())
}
