// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Paint value meaning "no paint" for fill or stroke.
pub const TRANSPARENT: &str = "transparent";

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Encode, Decode)]
pub enum OpKind {
    Add,
    Delete,
}

/// A drawing operation as issued by a client. For a delete, the svg, fill
/// and stroke fields are copied verbatim from the targeted add.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct ShapeOperation {
    pub kind: OpKind,

    /// Path string (`M ...`) or circle descriptor (`circle x:_ y:_ r:_`).
    pub svg: String,

    /// Colour name or `"transparent"`.
    pub fill: String,

    /// Colour name or `"transparent"`.
    pub stroke: String,

    /// Strictly increasing per miner; distinguishes otherwise identical
    /// operations so their signatures differ.
    pub op_num: u64,
}

impl ShapeOperation {
    #[must_use]
    pub fn filled(&self) -> bool {
        self.fill != TRANSPARENT
    }

    #[must_use]
    pub fn stroked(&self) -> bool {
        self.stroke != TRANSPARENT
    }
}

/// An operation together with its provenance. `op_sig` is the owner's hex
/// DER signature over the operation's canonical bytes and serves as the
/// operation's stable identity (the "shape hash" shown to clients).
/// `add_sig` is empty on adds; on deletes it is the `op_sig` of the add
/// being reverted.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct SignedOperation {
    pub op: ShapeOperation,
    pub pub_key: String,
    pub op_sig: String,
    pub add_sig: String,
}
