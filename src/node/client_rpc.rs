// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Rpc surface for client applications. Every request is signed with the
//! miner's own keypair: clients must be launched with the same private
//! key the miner holds, and anything else is rejected as `InvalidUser`.
//!
//! The drawing calls block until the submitted operation is buried
//! `validate_num` blocks deep on the longest chain, waking on the store's
//! block-inserted condvar.

use crate::chain::ChainStore;
use crate::consensus::{ValidateErr, Validator};
use crate::miner::MinerChannels;
use crate::node::{PropagateOpMsg, TTL};
use crate::primitives::{Block, Hash128, Identity, OpKind, ShapeOperation, SignedOperation};
use bincode::{Decode, Encode};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use triomphe::Arc;

/// Number of block events without the op landing before the propagation
/// request is re-emitted.
const BLOCKS_BEFORE_REPROPAGATE: u32 = 10;

/// Signed request envelope. `msg` carries the call parameters as
/// canonical bincode so the signature covers them; `hashed_msg` is the
/// MD5 of `msg` and `(r, s)` an ECDSA P-384 signature over that hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedRequest {
    pub msg: Vec<u8>,
    pub hashed_msg: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

/// Shape kind declared by the client. Parsing is authoritative (a path
/// string never rasterizes as a circle), so this is carried for wire
/// compatibility rather than branched on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ShapeType {
    Path,
    Circle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DrawParams {
    pub validate_num: u8,
    pub shape_type: ShapeType,
    pub svg: String,
    pub fill: String,
    pub stroke: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DeleteParams {
    pub validate_num: u8,
    pub shape_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct BlockParams {
    pub block_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct OpParams {
    pub shape_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasInfo {
    pub client_id: u32,
    pub canvas_x_max: u32,
    pub canvas_y_max: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawOutcome {
    pub shape_hash: String,
    pub block_hash: String,
    pub ink_remaining: u32,
}

/// Client-facing error taxonomy. The numeric tags are part of the wire
/// contract with the reference client applications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientErr {
    /// Request authentication failed. Deliberately non-specific.
    InvalidUser,
    SvgTooLong(String),
    InvalidSvg(String),
    InsufficientInk(u32),
    ShapeOverlap(String),
    OutOfBounds,
    InvalidBlockHash(String),
    ShapeOwner(String),
    InvalidShapeHash(String),
    Other,
}

impl ClientErr {
    #[must_use]
    pub fn status_code(&self) -> u8 {
        match self {
            ClientErr::SvgTooLong(_) => 1,
            ClientErr::InvalidSvg(_) => 2,
            ClientErr::InsufficientInk(_) => 3,
            ClientErr::ShapeOverlap(_) => 4,
            ClientErr::OutOfBounds => 5,
            ClientErr::InvalidBlockHash(_) => 6,
            ClientErr::ShapeOwner(_) => 7,
            ClientErr::InvalidShapeHash(_) => 8,
            ClientErr::InvalidUser | ClientErr::Other => 9,
        }
    }
}

impl fmt::Display for ClientErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErr::InvalidUser => write!(f, "invalid user"),
            ClientErr::SvgTooLong(svg) => write!(f, "1 svg string too long: {svg}"),
            ClientErr::InvalidSvg(svg) => write!(f, "2 invalid svg string: {svg}"),
            ClientErr::InsufficientInk(needed) => write!(f, "3 insufficient ink: {needed} needed"),
            ClientErr::ShapeOverlap(svg) => write!(f, "4 shape overlap: {svg}"),
            ClientErr::OutOfBounds => write!(f, "5 out of bounds"),
            ClientErr::InvalidBlockHash(hash) => write!(f, "6 invalid block hash: {hash}"),
            ClientErr::ShapeOwner(hash) => write!(f, "7 shape not owned: {hash}"),
            ClientErr::InvalidShapeHash(hash) => write!(f, "8 invalid shape hash: {hash}"),
            ClientErr::Other => write!(f, "9 internal error"),
        }
    }
}

impl std::error::Error for ClientErr {}

impl From<ValidateErr> for ClientErr {
    fn from(err: ValidateErr) -> Self {
        match err {
            ValidateErr::SvgTooLong(svg) => ClientErr::SvgTooLong(svg),
            ValidateErr::InvalidSvg(svg) => ClientErr::InvalidSvg(svg),
            ValidateErr::OutOfBounds => ClientErr::OutOfBounds,
            ValidateErr::InsufficientInk(needed) => ClientErr::InsufficientInk(needed),
            ValidateErr::ShapeOverlap(svg) => ClientErr::ShapeOverlap(svg),
            ValidateErr::ShapeOwner(hash) => ClientErr::ShapeOwner(hash),
            // The duplicate sentinel never crosses the wire.
            ValidateErr::Duplicate(_) => ClientErr::Other,
        }
    }
}

#[tarpc::service]
pub trait ClientService {
    /// Opens a canvas session, assigning the smallest unused client id.
    async fn open_canvas(req: SignedRequest) -> Result<CanvasInfo, ClientErr>;

    /// Ink balance of the miner's key on the current longest chain.
    async fn get_ink(req: SignedRequest) -> Result<u32, ClientErr>;

    /// Submits an add and blocks until it is `validate_num` blocks deep.
    async fn add_shape(req: SignedRequest) -> Result<DrawOutcome, ClientErr>;

    /// Submits a delete and blocks until it is `validate_num` blocks deep.
    async fn delete_shape(req: SignedRequest) -> Result<u32, ClientErr>;

    async fn get_genesis_block(req: SignedRequest) -> Result<String, ClientErr>;

    async fn get_children(req: SignedRequest) -> Result<Vec<Block>, ClientErr>;

    async fn get_block(req: SignedRequest) -> Result<Block, ClientErr>;

    /// The operation with the given shape hash on the longest chain.
    async fn get_op(req: SignedRequest) -> Result<ShapeOperation, ClientErr>;
}

pub struct ClientState {
    store: Arc<ChainStore>,
    validator: Arc<Validator>,
    identity: Identity,
    miner: MinerChannels,
    pop_tx: mpsc::Sender<PropagateOpMsg>,

    /// Client ids handed out by `open_canvas`.
    canvas_ids: Mutex<BTreeSet<u32>>,

    /// Monotonic per-miner operation counter.
    op_num: Mutex<u64>,
}

#[derive(Clone)]
pub struct ClientServer {
    state: Arc<ClientState>,
}

impl ClientServer {
    #[must_use]
    pub fn new(
        store: Arc<ChainStore>,
        validator: Arc<Validator>,
        identity: Identity,
        miner: MinerChannels,
        pop_tx: mpsc::Sender<PropagateOpMsg>,
    ) -> Self {
        Self {
            state: Arc::new(ClientState {
                store,
                validator,
                identity,
                miner,
                pop_tx,
                canvas_ids: Mutex::new(BTreeSet::new()),
                op_num: Mutex::new(0),
            }),
        }
    }

    fn authenticate(&self, req: &SignedRequest) -> Result<(), ClientErr> {
        if self
            .state
            .identity
            .verify_request(&req.msg, &req.hashed_msg, &req.r, &req.s)
        {
            Ok(())
        } else {
            debug!("rejecting unauthenticated client request");
            Err(ClientErr::InvalidUser)
        }
    }
}

fn decode_params<T: bincode::Decode<()>>(msg: &[u8]) -> Result<T, ClientErr> {
    crate::codec::decode(msg).map_err(|_| ClientErr::Other)
}

fn parse_block_hash(hash: &str) -> Result<Hash128, ClientErr> {
    Hash128::from_hex(hash).map_err(|_| ClientErr::InvalidBlockHash(hash.to_owned()))
}

#[tarpc::server]
impl ClientService for ClientServer {
    async fn open_canvas(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<CanvasInfo, ClientErr> {
        self.authenticate(&req)?;
        let settings = self.state.store.settings();

        let mut ids = self.state.canvas_ids.lock();
        let mut id = 0u32;
        while ids.contains(&id) {
            id += 1;
        }
        ids.insert(id);

        info!("opened canvas for client {id}");
        Ok(CanvasInfo {
            client_id: id,
            canvas_x_max: settings.canvas_x_max,
            canvas_y_max: settings.canvas_y_max,
        })
    }

    async fn get_ink(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<u32, ClientErr> {
        self.authenticate(&req)?;
        let state = self.state;
        tokio::task::spawn_blocking(move || {
            state
                .validator
                .ink_remaining(state.identity.public_key_hex())
        })
        .await
        .map_err(|_| ClientErr::Other)
    }

    async fn add_shape(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<DrawOutcome, ClientErr> {
        self.authenticate(&req)?;
        let params: DrawParams = decode_params(&req.msg)?;
        let state = self.state;
        tokio::task::spawn_blocking(move || add_shape_blocking(&state, &params))
            .await
            .map_err(|_| ClientErr::Other)?
    }

    async fn delete_shape(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<u32, ClientErr> {
        self.authenticate(&req)?;
        let params: DeleteParams = decode_params(&req.msg)?;
        let state = self.state;
        tokio::task::spawn_blocking(move || delete_shape_blocking(&state, &params))
            .await
            .map_err(|_| ClientErr::Other)?
    }

    async fn get_genesis_block(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<String, ClientErr> {
        self.authenticate(&req)?;
        Ok(self.state.store.genesis_hash().to_hex())
    }

    async fn get_children(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<Vec<Block>, ClientErr> {
        self.authenticate(&req)?;
        let params: BlockParams = decode_params(&req.msg)?;
        let hash = parse_block_hash(&params.block_hash)?;
        self.state
            .store
            .children(&hash)
            .ok_or(ClientErr::InvalidBlockHash(params.block_hash))
    }

    async fn get_block(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<Block, ClientErr> {
        self.authenticate(&req)?;
        let params: BlockParams = decode_params(&req.msg)?;
        let hash = parse_block_hash(&params.block_hash)?;
        self.state
            .store
            .get(&hash)
            .ok_or(ClientErr::InvalidBlockHash(params.block_hash))
    }

    async fn get_op(
        self,
        _: tarpc::context::Context,
        req: SignedRequest,
    ) -> Result<ShapeOperation, ClientErr> {
        self.authenticate(&req)?;
        let params: OpParams = decode_params(&req.msg)?;
        self.state
            .store
            .find_op(&params.shape_hash)
            .map(|opinfo| opinfo.op)
            .ok_or(ClientErr::InvalidShapeHash(params.shape_hash))
    }
}

/// Builds, signs and numbers an operation under the miner's identity.
fn sign_operation(
    state: &ClientState,
    kind: OpKind,
    svg: String,
    fill: String,
    stroke: String,
    add_sig: String,
) -> Result<SignedOperation, ClientErr> {
    let op = {
        let mut op_num = state.op_num.lock();
        let op = ShapeOperation {
            kind,
            svg,
            fill,
            stroke,
            op_num: *op_num,
        };
        *op_num += 1;
        op
    };

    let op_bytes = crate::codec::encode_to_vec(&op).map_err(|_| ClientErr::Other)?;
    let op_sig = state
        .identity
        .sign_op_bytes(&op_bytes)
        .map_err(|_| ClientErr::Other)?;

    Ok(SignedOperation {
        op,
        pub_key: state.identity.public_key_hex().to_owned(),
        op_sig,
        add_sig,
    })
}

/// Emits an operation to the gossip layer and the local mining loop.
fn emit_operation(state: &ClientState, opinfo: &SignedOperation) -> Result<(), ClientErr> {
    state
        .pop_tx
        .blocking_send(PropagateOpMsg {
            op: opinfo.clone(),
            ttl: TTL,
        })
        .map_err(|_| ClientErr::Other)?;
    state
        .miner
        .sop_tx
        .send(opinfo.clone())
        .map_err(|_| ClientErr::Other)
}

/// Blocks after `block_hash` on the current longest chain.
fn blocks_following(state: &ClientState, block_hash: Hash128) -> usize {
    let chain = state.store.longest_path(&state.store.genesis_hash());
    let mut following = 0;
    for block in chain.iter().rev() {
        if block.hash() == block_hash {
            break;
        }
        following += 1;
    }
    following
}

fn add_shape_blocking(state: &ClientState, params: &DrawParams) -> Result<DrawOutcome, ClientErr> {
    let opinfo = sign_operation(
        state,
        OpKind::Add,
        params.svg.clone(),
        params.fill.clone(),
        params.stroke.clone(),
        String::new(),
    )?;
    emit_operation(state, &opinfo)?;

    let mut seq = state.store.insert_seq();
    let mut events_without_landing = 0;

    loop {
        seq = state.store.wait_for_insert(seq);

        match state.validator.validate_op_against_longest(&opinfo) {
            // The sentinel: our signature is on the longest chain.
            Err(ValidateErr::Duplicate(_)) => {
                let Some(block_hash) = state.store.block_containing_sig(&opinfo.op_sig) else {
                    // Landed between the check and the scan, then reorged
                    // away; give the chain a moment and re-check.
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                };

                let following = blocks_following(state, block_hash);
                if following >= usize::from(params.validate_num) {
                    let ink_remaining = state
                        .validator
                        .ink_remaining(state.identity.public_key_hex());
                    return Ok(DrawOutcome {
                        shape_hash: opinfo.op_sig,
                        block_hash: block_hash.to_hex(),
                        ink_remaining,
                    });
                }
                debug!("add landed, {following}/{} confirmations", params.validate_num);
            }
            Err(err) => return Err(err.into()),
            Ok(()) => {
                events_without_landing += 1;
                if events_without_landing > BLOCKS_BEFORE_REPROPAGATE {
                    info!("operation {} has not landed, re-emitting", opinfo.op_sig);
                    emit_operation(state, &opinfo)?;
                    events_without_landing = 0;
                }
            }
        }
    }
}

fn delete_shape_blocking(state: &ClientState, params: &DeleteParams) -> Result<u32, ClientErr> {
    let pub_key = state.identity.public_key_hex().to_owned();

    // Reject obviously-invalid requests before emitting anything.
    let chain = state.store.longest_path(&state.store.genesis_hash());
    state
        .validator
        .check_delete(&params.shape_hash, &pub_key, &chain)?;

    // The delete copies its metadata from the targeted add.
    let add_info = state
        .store
        .find_op(&params.shape_hash)
        .filter(|info| info.op.kind == OpKind::Add)
        .ok_or_else(|| ClientErr::ShapeOwner(params.shape_hash.clone()))?;

    let opinfo = sign_operation(
        state,
        OpKind::Delete,
        add_info.op.svg,
        add_info.op.fill,
        add_info.op.stroke,
        params.shape_hash.clone(),
    )?;
    emit_operation(state, &opinfo)?;

    let mut seq = state.store.insert_seq();
    let mut events_without_landing = 0;

    loop {
        seq = state.store.wait_for_insert(seq);

        let Some(block_hash) = state.store.block_containing_sig(&opinfo.op_sig) else {
            events_without_landing += 1;
            if events_without_landing > BLOCKS_BEFORE_REPROPAGATE {
                info!("delete {} has not landed, re-emitting", opinfo.op_sig);
                emit_operation(state, &opinfo)?;
                events_without_landing = 0;
            }
            continue;
        };

        let following = blocks_following(state, block_hash);
        if following >= usize::from(params.validate_num) {
            return Ok(state.validator.ink_remaining(&pub_key));
        }
        debug!(
            "delete landed, {following}/{} confirmations",
            params.validate_num
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_wire_contract() {
        assert_eq!(ClientErr::SvgTooLong(String::new()).status_code(), 1);
        assert_eq!(ClientErr::InvalidSvg(String::new()).status_code(), 2);
        assert_eq!(ClientErr::InsufficientInk(5).status_code(), 3);
        assert_eq!(ClientErr::ShapeOverlap(String::new()).status_code(), 4);
        assert_eq!(ClientErr::OutOfBounds.status_code(), 5);
        assert_eq!(ClientErr::InvalidBlockHash(String::new()).status_code(), 6);
        assert_eq!(ClientErr::ShapeOwner(String::new()).status_code(), 7);
        assert_eq!(ClientErr::InvalidShapeHash(String::new()).status_code(), 8);
        assert_eq!(ClientErr::Other.status_code(), 9);
        assert_eq!(ClientErr::InvalidUser.status_code(), 9);
    }

    #[test]
    fn duplicate_never_surfaces() {
        let err: ClientErr = ValidateErr::Duplicate("sig".to_owned()).into();
        assert_eq!(err, ClientErr::Other);
    }

    #[test]
    fn params_roundtrip_through_canonical_bytes() {
        let params = DrawParams {
            validate_num: 3,
            shape_type: ShapeType::Path,
            svg: "M 0 0 L 0 5".to_owned(),
            fill: "transparent".to_owned(),
            stroke: "red".to_owned(),
        };
        let bytes = crate::codec::encode_to_vec(&params).unwrap();
        let decoded: DrawParams = decode_params(&bytes).unwrap();
        assert_eq!(decoded, params);
    }
}
