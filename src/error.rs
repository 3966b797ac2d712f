// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Error taxonomy for the public coordinator surface and the wire codec
//! (§7 "Error Handling Design").
//!
//! Per-peer RPC failures are never threaded through these types directly —
//! they are folded into the iterative lookup (see [`crate::query`]) and
//! surface here only as the terminal [`QueryError::NoPeersAvailable`] /
//! [`QueryError::Timeout`] a public operation can return.

use std::io;

use libp2p_identity::PeerId;
use thiserror::Error;

/// Failure of a `put_value`/`provide` style operation driven by the
/// iterative lookup engine.
#[derive(Debug, Error)]
pub enum PutRecordError {
    #[error("no peers available to start the lookup")]
    NoPeersAvailable,
    #[error("the local validator rejected the record before any RPC was sent")]
    InvalidRecord,
    #[error("the lookup was cancelled before completion")]
    Cancelled,
    #[error("the lookup exceeded its deadline")]
    Timeout,
    #[error("no peer accepted the record")]
    QuorumFailed,
}

/// Failure of a `get_value` style operation.
#[derive(Debug, Error)]
pub enum GetRecordError {
    #[error("no record found for this key")]
    NotFound,
    #[error("no peers available to start the lookup")]
    NoPeersAvailable,
    #[error("the lookup was cancelled before completion")]
    Cancelled,
    #[error("the lookup exceeded its deadline")]
    Timeout,
}

/// General failure of an iterative lookup (`find_peer`, `find_providers`).
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("routing table is empty; no peers available to start the lookup")]
    NoPeersAvailable,
    #[error("lookup terminated without locating the target")]
    NotFound,
    #[error("the lookup was cancelled before completion")]
    Cancelled,
    #[error("the lookup exceeded its deadline")]
    Timeout,
}

/// Per-RPC transport failure (§7 "Transport"). Never fatal to a lookup —
/// the offending peer is simply recorded as unresponsive and the lookup
/// continues with the remaining shortlist.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("failed to open stream to {peer}: {reason}")]
    ConnectFailed { peer: PeerId, reason: String },
    #[error("stream to {peer} reset")]
    StreamReset { peer: PeerId },
    #[error("request to {peer} timed out")]
    Timeout { peer: PeerId },
    #[error("peer {peer} does not support the protocol")]
    NotSupported { peer: PeerId },
}

/// Malformed frame or out-of-range field (§7 "Protocol / Codec").
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown message type tag: {0}")]
    UnknownMessageType(i32),
    #[error("protobuf decode error: {0}")]
    Decode(String),
    #[error("protobuf encode error: {0}")]
    Encode(String),
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}

/// Validation-layer failure (§4.3.3).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no validator registered for this key's namespace")]
    UnknownNamespace,
    #[error("the value failed namespace-specific validation")]
    Malformed,
}

/// What a remote peer's `ADD_PROVIDER` was rejected for — the sender's
/// claimed `PeerID` did not match the stream-authenticated remote peer.
#[derive(Debug, Error)]
#[error("add_provider sender {claimed} does not match authenticated remote peer {actual}")]
pub struct ProviderMismatch {
    pub claimed: PeerId,
    pub actual: PeerId,
}

/// Mode-gating refusal (§4.4.3): an inbound stream arrived while the
/// local node is in client mode.
#[derive(Debug, Error)]
#[error("refusing inbound request: local node is in client mode")]
pub struct ClientModeRefusal;
