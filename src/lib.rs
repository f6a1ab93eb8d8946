// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Inkchain
//! Official implementation of Inkchain, a peer-to-peer collaborative
//! canvas replicated over a proof-of-work blockchain.
//!
//! Every miner holds an ECDSA P-384 identity, mines blocks of drawing
//! operations submitted by client applications, and gossips blocks and
//! operations with its peers. Ink is the per-key drawing quota: earned by
//! mining, spent by adding shapes, refunded by deleting them. Shapes of
//! different keys may never overlap on the canvas; the deterministic
//! rasterizer in [`raster`] is what makes that rule converge across
//! independent miners.

pub mod chain;
pub mod codec;
pub mod consensus;
pub mod miner;
pub mod node;
pub mod primitives;
pub mod raster;
pub mod settings;
