// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Node-local settings. Chain-wide parameters come from the directory at
//! registration time ([`crate::chain::ChainSettings`]); everything here
//! only concerns this process.

use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use log::error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::new().unwrap();
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Network settings.
    pub network: Network,

    /// Node settings.
    pub node: Node,

    /// Miner settings.
    pub miner: Miner,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Network {
    /// Directory service address.
    pub directory_addr: String,

    /// Listen address for miner-to-miner rpc; port 0 picks a free port.
    pub peer_listen_addr: String,

    /// Listen address for client application rpc.
    pub client_listen_addr: String,

    /// Ip to advertise to the directory and peers instead of the bound
    /// one; empty uses the listener address as-is.
    pub advertise_ip: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            directory_addr: "127.0.0.1:12890".to_owned(),
            peer_listen_addr: "127.0.0.1:0".to_owned(),
            client_listen_addr: "127.0.0.1:0".to_owned(),
            advertise_ip: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    /// Hex-encoded DER private key. Empty generates an ephemeral identity
    /// on startup, which earns ink nobody can ever spend again.
    pub private_key_hex: String,

    /// Where the client listener's `ip:port` is written for co-located
    /// client applications.
    pub ip_ports_file: String,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            private_key_hex: String::new(),
            ip_ports_file: "./ip-ports.txt".to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Miner {
    /// Proof of work worker threads per job; 0 uses every core.
    pub solver_threads: u16,
}

impl Default for Miner {
    fn default() -> Self {
        Self { solver_threads: 2 }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let mut config_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_path.push("Inkchain");
        let config_dir = config_path.clone();
        config_path.push("config.toml");

        // Write a default configuration on first run so there is a file
        // to edit. If this fails we fall back to defaults + env.
        if fs::metadata(&config_path).is_err() {
            let defaults = toml::ser::to_string_pretty(&Settings::default())
                .expect("default settings serialize");
            if let Err(err) =
                fs::create_dir_all(&config_dir).and_then(|()| fs::write(&config_path, defaults))
            {
                error!("failed to create configuration! Reason: {err:#?}");
            }
        }

        let defaults = Settings::default();
        let s = Config::builder()
            .set_default("network.directory_addr", defaults.network.directory_addr)?
            .set_default("network.peer_listen_addr", defaults.network.peer_listen_addr)?
            .set_default(
                "network.client_listen_addr",
                defaults.network.client_listen_addr,
            )?
            .set_default("network.advertise_ip", defaults.network.advertise_ip)?
            .set_default("node.private_key_hex", defaults.node.private_key_hex)?
            .set_default("node.ip_ports_file", defaults.node.ip_ports_file)?
            .set_default(
                "miner.solver_threads",
                i64::from(defaults.miner.solver_threads),
            )?
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix("inkchain").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::default();
        assert!(!settings.network.directory_addr.is_empty());
        assert!(settings.network.peer_listen_addr.ends_with(":0"));
        assert!(settings.node.ip_ports_file.ends_with("ip-ports.txt"));
    }
}
