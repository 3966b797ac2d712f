// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! A Kademlia distributed hash table core: routing table, iterative
//! α-parallel lookups, an RPC protocol over authenticated streams, and
//! in-memory value/provider record stores with a validator framework.
//!
//! This crate implements the core only. It cooperates with an external host
//! runtime that supplies the secure stream transport ([`libp2p_swarm`]), a
//! peer-identity service ([`libp2p_identity`]), and address/envelope
//! handling. Host boot/shutdown, transport negotiation, and CLI/example
//! applications are out of scope.

mod behaviour;
mod bucket;
mod codec;
mod distance;
mod error;
mod handler;
mod jobs;
mod proto;
mod query;
mod record;
pub mod store;
mod validator;

pub use behaviour::{Behaviour, Config, EnvelopeConsumer, Event, Mode, ModeOracle, RoutingUpdate, Stats};
pub use distance::{Distance, Key};
pub use error::{GetRecordError, PutRecordError, QueryError};
pub use query::QueryId;
pub use record::{PeerRecord, ProviderRecord, Record};
pub use validator::{ValidationError, Validator, ValidatorRegistry};

/// The protocol identifier advertised to peers, e.g. `/ipfs/kad/1.0.0`.
///
/// The `/ipfs` prefix is preserved for wire compatibility with existing
/// Kademlia deployments even though this crate has no IPFS-specific
/// behaviour.
pub const PROTOCOL_NAME: &str = "/ipfs/kad/1.0.0";

/// Number of peers kept per k-bucket, and the default replication factor
/// used by lookups and record/provider publication.
pub const K_VALUE: usize = 20;

/// Default per-lookup query parallelism (`α`).
pub const ALPHA_VALUE: usize = 3;

/// Size of the key space in bits; also the number of k-buckets.
pub const MAX_BUCKETS: usize = 256;
