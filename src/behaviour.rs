// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The DHT coordinator (component C6): the [`libp2p_swarm::NetworkBehaviour`]
//! that owns the routing table, the record stores, every in-flight
//! [`crate::query::Query`], and the background [`crate::jobs::Jobs`].
//!
//! Every public operation (`find_peer`, `put_record`, `get_record`,
//! `start_providing`, `get_providers`) is asynchronous by construction: it
//! registers a [`QueryId`] and returns immediately, with the outcome
//! delivered later through [`Event::OutboundQueryCompleted`] — the natural
//! translation of §4.6's synchronous-looking contract into the
//! `NetworkBehaviour::poll` idiom, exactly as the teacher's own
//! `tests/client_mode.rs` already assumes (`Event::RoutingUpdated`,
//! `Event::ModeChanged` arrive the same way).

use std::collections::{HashMap, HashSet, VecDeque};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use libp2p_core::{Endpoint, Multiaddr};
use libp2p_identity::PeerId;
use libp2p_swarm::behaviour::{ConnectionClosed, ConnectionEstablished};
use libp2p_swarm::{
    ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, NotifyHandler, StreamProtocol,
    THandler, THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use tracing::{debug, trace, warn};

use crate::bucket::{InsertOutcome, RoutingTable};
use crate::distance::Key;
use crate::error::{GetRecordError, ProviderMismatch, PutRecordError, QueryError};
use crate::handler::{Handler, HandlerEvent, HandlerIn, OutboundRequestId};
use crate::jobs::{JobEvent, Jobs};
use crate::proto;
use crate::query::{QueryConfig, QueryId, QueryInfo, QueryPool, StopReason};
use crate::record::{PeerRecord, Record};
use crate::store::{ProviderInfo, PutOutcome, RecordStore};
use crate::validator::{Validator, ValidatorRegistry};

/// Whether this node currently speaks the protocol to the outside world
/// (§4.4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Consulted before a remote peer is admitted to the routing table (§4.6
/// "Remote-mode detection", SPEC_FULL Open Question Resolution #2).
/// Defaults to admitting everyone; a host that has a real way to learn a
/// peer's advertised mode (e.g. via `libp2p-identify`) can supply its own.
pub trait ModeOracle: Send + 'static {
    fn admits(&self, peer: &PeerId) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
struct AdmitAll;

impl ModeOracle for AdmitAll {
    fn admits(&self, _peer: &PeerId) -> bool {
        true
    }
}

/// The host's signed-envelope facility (§6.2): verifies that a
/// `signed_peer_record`/`sender_record` byte field was actually signed by
/// the peer it claims to speak for, returning the addresses it certifies.
///
/// This crate has no cryptographic primitives of its own (§1 Non-goal
/// (b)), so the default [`RejectAllEnvelopes`] never certifies anything;
/// a host wires in its real envelope facility (e.g.
/// `libp2p_core::PeerRecord::from_signed_envelope`) via
/// [`Behaviour::set_envelope_consumer`]. Per §4.4.2/§7, a verification
/// failure is silently dropped — it never affects the RPC outcome, it
/// just means the peer store isn't updated with certified addresses.
pub trait EnvelopeConsumer: Send + 'static {
    fn consume(&self, envelope: &[u8], expected_peer: PeerId) -> Option<Vec<Multiaddr>>;
}

#[derive(Debug, Default, Clone, Copy)]
struct RejectAllEnvelopes;

impl EnvelopeConsumer for RejectAllEnvelopes {
    fn consume(&self, _envelope: &[u8], _expected_peer: PeerId) -> Option<Vec<Multiaddr>> {
        None
    }
}

/// What happened to a peer's routing-table entry, carried on
/// [`Event::RoutingUpdated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingUpdate {
    Added,
    Refreshed,
    ReplacedStale,
    Rejected,
}

/// A peer and the addresses it was last seen at.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// Terminal outcome of a [`QueryId`], delivered via
/// [`Event::OutboundQueryCompleted`].
#[derive(Debug)]
pub enum QueryOutcome {
    FindPeer(Result<PeerInfo, QueryError>),
    GetRecord(Result<Record, GetRecordError>),
    PutRecord(Result<(), PutRecordError>),
    GetProviders(Result<Vec<ProviderInfo>, QueryError>),
    AddProvider(Result<(), PutRecordError>),
}

/// Events emitted up to the host swarm.
#[derive(Debug)]
pub enum Event {
    RoutingUpdated {
        peer: PeerId,
        update: RoutingUpdate,
        addresses: Vec<Multiaddr>,
    },
    ModeChanged {
        new_mode: Mode,
    },
    OutboundQueryCompleted {
        id: QueryId,
        result: QueryOutcome,
    },
    /// An inbound `ADD_PROVIDER` was rejected because the claimed sender did
    /// not match the stream-authenticated remote peer (§4.4.2).
    InboundProviderMismatch(ProviderMismatch),
}

/// Builder-style configuration, mirroring every §6.3 default.
#[derive(Debug, Clone)]
pub struct Config {
    protocol_name: StreamProtocol,
    k_value: usize,
    alpha_value: usize,
    max_rounds: usize,
    query_timeout: Duration,
    routing_table_refresh_interval: Duration,
    stale_peer_threshold: Duration,
    mode: Option<Mode>,
}

impl Config {
    pub fn new(protocol_name: &'static str) -> Self {
        Self {
            protocol_name: StreamProtocol::new(protocol_name),
            k_value: crate::K_VALUE,
            alpha_value: crate::ALPHA_VALUE,
            max_rounds: 20,
            query_timeout: Duration::from_secs(10),
            // §9/SPEC_FULL Open Question Resolution #1: 10 minutes, not the
            // ~1 minute value the original implementation used "for testing".
            routing_table_refresh_interval: Duration::from_secs(10 * 60),
            stale_peer_threshold: Duration::from_secs(15 * 60),
            mode: None,
        }
    }

    pub fn with_k_value(mut self, k: usize) -> Self {
        self.k_value = k;
        self
    }

    pub fn with_alpha_value(mut self, alpha: usize) -> Self {
        self.alpha_value = alpha;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_routing_table_refresh_interval(mut self, interval: Duration) -> Self {
        self.routing_table_refresh_interval = interval;
        self
    }

    pub fn with_stale_peer_threshold(mut self, threshold: Duration) -> Self {
        self.stale_peer_threshold = threshold;
        self
    }

    /// `None` (the default) runs in automatic mode: server once the host
    /// confirms at least one external address, client otherwise. `Some`
    /// pins the mode regardless of external address state.
    pub fn with_mode(mut self, mode: Option<Mode>) -> Self {
        self.mode = mode;
        self
    }
}

/// Where an outbound request's response should be routed back to.
#[derive(Debug, Clone, Copy)]
enum OutboundPurpose {
    Lookup { query_id: QueryId },
    FinishingWave { query_id: QueryId },
    StaleProbe,
    /// A send whose outcome nobody is watching: entry-correction PUTs
    /// (§4.5.3 "Correction") and provider republish announcements
    /// (§4.3.2). Failures here are silently dropped rather than folded
    /// into routing-table liveness bookkeeping, which is exactly what
    /// [`OutboundPurpose::StaleProbe`] would otherwise do.
    FireAndForget,
}

struct PendingSend {
    message: proto::Message,
    purpose: OutboundPurpose,
}

/// The Kademlia DHT coordinator, generic over the storage backend so a host
/// can supply its own [`RecordStore`] (§1 Non-goal (d): no persistence
/// shipped by this crate).
pub struct Behaviour<TStore> {
    local_peer_id: PeerId,
    local_key: Key,
    protocol_name: StreamProtocol,
    k_value: usize,
    query_timeout: Duration,

    store: TStore,
    validators: ValidatorRegistry,
    routing_table: RoutingTable,
    queries: QueryPool,
    query_config: QueryConfig,
    jobs: Jobs,

    mode_config: Option<Mode>,
    mode: Mode,
    mode_oracle: Box<dyn ModeOracle>,
    envelope_consumer: Box<dyn EnvelopeConsumer>,
    confirmed_external_addrs: HashSet<Multiaddr>,

    connections: HashMap<PeerId, Vec<ConnectionId>>,
    peer_of_connection: HashMap<ConnectionId, PeerId>,
    known_addresses: HashMap<PeerId, Vec<Multiaddr>>,
    awaiting_connection: HashMap<PeerId, Vec<PendingSend>>,
    dialing: HashSet<PeerId>,

    next_request_id: u64,
    outbound_context: HashMap<OutboundRequestId, (PeerId, OutboundPurpose)>,
    stale_probes: HashMap<PeerId, OutboundRequestId>,

    running: bool,
    pending_events: VecDeque<ToSwarm<Event, HandlerIn>>,
}

impl<TStore: RecordStore> Behaviour<TStore> {
    pub fn new(local_peer_id: PeerId, store: TStore) -> Self {
        Self::with_config(local_peer_id, store, Config::new(crate::PROTOCOL_NAME))
    }

    pub fn with_config(local_peer_id: PeerId, store: TStore, config: Config) -> Self {
        let local_key = Key::new(local_peer_id.to_bytes());
        let initial_mode = config.mode.unwrap_or(Mode::Client);
        Self {
            local_peer_id,
            local_key,
            protocol_name: config.protocol_name,
            k_value: config.k_value,
            query_timeout: config.query_timeout,
            store,
            validators: ValidatorRegistry::new(),
            routing_table: RoutingTable::new(local_peer_id, config.k_value),
            queries: QueryPool::new(),
            query_config: QueryConfig {
                alpha: config.alpha_value,
                k: config.k_value,
                max_rounds: config.max_rounds,
            },
            jobs: Jobs::new(
                config.routing_table_refresh_interval,
                config.stale_peer_threshold,
                Duration::from_secs(22 * 60 * 60),
                Duration::from_secs(60 * 60),
            ),
            mode_config: config.mode,
            mode: initial_mode,
            mode_oracle: Box::new(AdmitAll),
            envelope_consumer: Box::new(RejectAllEnvelopes),
            confirmed_external_addrs: HashSet::new(),
            connections: HashMap::new(),
            peer_of_connection: HashMap::new(),
            known_addresses: HashMap::new(),
            awaiting_connection: HashMap::new(),
            dialing: HashSet::new(),
            next_request_id: 0,
            outbound_context: HashMap::new(),
            stale_probes: HashMap::new(),
            running: true,
            pending_events: VecDeque::new(),
        }
    }

    pub fn set_mode_oracle(&mut self, oracle: Box<dyn ModeOracle>) {
        self.mode_oracle = oracle;
    }

    /// Replace the validator registry wholesale, e.g. with one pre-populated
    /// via [`ValidatorRegistry::register`] for namespaces beyond the
    /// mandatory built-in `/pk/` validator (§4.3.3, §6.2).
    pub fn set_validator_registry(&mut self, registry: ValidatorRegistry) {
        self.validators = registry;
    }

    /// Register an additional namespace validator without replacing the
    /// rest of the registry. Shorthand for
    /// `set_validator_registry`-then-`register` when the caller only wants
    /// to add one namespace.
    pub fn register_validator(&mut self, namespace: impl Into<Vec<u8>>, validator: Box<dyn Validator>) {
        self.validators.register(namespace, validator);
    }

    /// Wire in the host's real signed-envelope facility (§6.2). Without
    /// this, every carried `signed_record`/`sender_record` field is
    /// ignored rather than certifying any addresses.
    pub fn set_envelope_consumer(&mut self, consumer: Box<dyn EnvelopeConsumer>) {
        self.envelope_consumer = consumer;
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Pin the mode, or pass `None` to return to automatic detection based
    /// on confirmed external addresses.
    pub fn set_mode(&mut self, mode: Option<Mode>) {
        self.mode_config = mode;
        self.recompute_mode();
    }

    pub fn run(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn add_address(&mut self, peer: &PeerId, address: Multiaddr) {
        self.known_addresses.entry(*peer).or_default().push(address);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            routing_table_size: self.routing_table.size(),
            active_queries: self.queries.len(),
            values_stored: self.store.value_count(),
            providers_stored: self.store.provider_count(),
        }
    }

    /// §4.6 `find_peer`: local lookup first, §4.5 `FIND_NODE` otherwise.
    pub fn find_peer(&mut self, peer: PeerId) -> QueryId {
        let target = Key::new(peer.to_bytes());
        let seeds = self.seed_peers(&target);
        self.queries.add_query(
            target,
            QueryInfo::FindNode { target_peer: peer, found: None },
            self.query_config,
            seeds,
        )
    }

    /// §4.6 `put_value`: validates and stores locally before starting the
    /// network-wide `PUT_VALUE`.
    pub fn put_record(&mut self, record: Record, now: Instant) -> Result<QueryId, PutRecordError> {
        match self.store.put_value(record.clone(), &self.validators, now) {
            PutOutcome::InvalidRecord => Err(PutRecordError::InvalidRecord),
            PutOutcome::Ok | PutOutcome::NotBetter => {
                let target = Key::new(&record.key);
                let seeds = self.seed_peers(&target);
                let id = self.queries.add_query(
                    target,
                    QueryInfo::PutRecord { key: record.key.clone(), record, finishing: false, accepted: 0 },
                    self.query_config,
                    seeds,
                );
                Ok(id)
            }
        }
    }

    /// §4.6 `get_value`: local record short-circuits only when it alone can
    /// satisfy `quorum`; otherwise the network lookup still runs so
    /// `quorum` can be met from remote responses as well.
    pub fn get_record(&mut self, key: Vec<u8>, quorum: usize, now: Instant) -> QueryId {
        let target = Key::new(&key);
        let seeds = self.seed_peers(&target);
        let mut records = Vec::new();
        if let Some(local) = self.store.get_value(&key, now) {
            records.push(PeerRecord { record: local, peer: Some(self.local_peer_id) });
        }
        self.queries.add_query(
            target,
            QueryInfo::GetRecord { key, quorum: quorum.max(1), records },
            self.query_config,
            seeds,
        )
    }

    /// §4.6 `provide`: adds self to the local provider store before the
    /// network-wide `ADD_PROVIDER` fan-out.
    pub fn start_providing(&mut self, key: Vec<u8>, now: Instant) -> QueryId {
        let target = Key::new(&key);
        self.store.add_provider(target, self.local_peer_id, self.external_addresses(), true, now);
        let seeds = self.seed_peers(&target);
        self.queries.add_query(
            target,
            QueryInfo::AddProvider { key, finishing: false, accepted: 0 },
            self.query_config,
            seeds,
        )
    }

    /// §4.6 `find_providers`: local providers are seeded into the result
    /// accumulator so they are present even if the lookup finds nothing new.
    pub fn get_providers(&mut self, key: Vec<u8>, now: Instant) -> QueryId {
        let target = Key::new(&key);
        let local = self.store.get_providers(&target, now);
        let seeds = self.seed_peers(&target);
        self.queries.add_query(
            target,
            QueryInfo::GetProviders { key, providers: local, found_at_round: None },
            self.query_config,
            seeds,
        )
    }

    fn external_addresses(&self) -> Vec<Multiaddr> {
        self.confirmed_external_addrs.iter().cloned().collect()
    }

    fn seed_peers(&self, target: &Key) -> Vec<(PeerId, Key)> {
        self.routing_table
            .find_local_closest(target, self.k_value)
            .into_iter()
            .map(|peer| (peer, Key::new(peer.to_bytes())))
            .collect()
    }

    fn recompute_mode(&mut self) {
        let new_mode = match self.mode_config {
            Some(mode) => mode,
            None => {
                if self.confirmed_external_addrs.is_empty() {
                    Mode::Client
                } else {
                    Mode::Server
                }
            }
        };
        if new_mode == self.mode {
            return;
        }
        self.mode = new_mode;
        let accept = new_mode == Mode::Server;
        for connections in self.connections.values() {
            for connection_id in connections {
                self.pending_events.push_back(ToSwarm::NotifyHandler {
                    peer_id: self.peer_of_connection[connection_id],
                    handler: NotifyHandler::One(*connection_id),
                    event: HandlerIn::SetAcceptInbound(accept),
                });
            }
        }
        self.pending_events
            .push_back(ToSwarm::GenerateEvent(Event::ModeChanged { new_mode }));
    }

    fn note_routing_update(&mut self, peer: PeerId, now: Instant) {
        if !self.mode_oracle.admits(&peer) {
            trace!(%peer, "mode oracle refused routing-table admission");
            return;
        }
        let addresses = self.known_addresses.get(&peer).cloned().unwrap_or_default();
        let update = match self.routing_table.add_peer(peer, now) {
            InsertOutcome::Added => RoutingUpdate::Added,
            InsertOutcome::ReplacedOldest(evicted) => {
                debug!(%peer, %evicted, "replaced stale routing-table entry");
                RoutingUpdate::ReplacedStale
            }
            InsertOutcome::Rejected => {
                if let Some(candidate) = self.routing_table.begin_probe(peer) {
                    self.start_stale_probe(candidate);
                }
                RoutingUpdate::Rejected
            }
        };
        self.pending_events
            .push_back(ToSwarm::GenerateEvent(Event::RoutingUpdated { peer, update, addresses }));
    }

    fn start_stale_probe(&mut self, peer: PeerId) {
        if self.stale_probes.contains_key(&peer) {
            return;
        }
        let message = proto::Message { msg_type: proto::MessageType::Ping as i32, ..Default::default() };
        if let Some(request_id) = self.send_request(peer, message, OutboundPurpose::StaleProbe) {
            self.stale_probes.insert(peer, request_id);
        }
    }

    fn next_request_id(&mut self) -> OutboundRequestId {
        let id = OutboundRequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    /// Dispatch `message` to `peer`, dialing first if there is no open
    /// connection yet. Returns the id the eventual response/failure will be
    /// correlated with.
    fn send_request(&mut self, peer: PeerId, message: proto::Message, purpose: OutboundPurpose) -> Option<OutboundRequestId> {
        let request_id = self.next_request_id();
        self.outbound_context.insert(request_id, (peer, purpose));

        if let Some(connection_id) = self.connections.get(&peer).and_then(|c| c.first()).copied() {
            self.pending_events.push_back(ToSwarm::NotifyHandler {
                peer_id: peer,
                handler: NotifyHandler::One(connection_id),
                event: HandlerIn::SendRequest { request_id, message },
            });
            return Some(request_id);
        }

        self.awaiting_connection.entry(peer).or_default().push(PendingSend { message, purpose });
        self.outbound_context.remove(&request_id);
        if self.dialing.insert(peer) {
            let opts = match self.known_addresses.get(&peer) {
                Some(addresses) => libp2p_swarm::dial_opts::DialOpts::peer_id(peer)
                    .addresses(addresses.clone())
                    .build(),
                None => libp2p_swarm::dial_opts::DialOpts::peer_id(peer).build(),
            };
            self.pending_events.push_back(ToSwarm::Dial { opts });
        }
        None
    }

    fn flush_awaiting(&mut self, peer: PeerId, connection_id: ConnectionId) {
        let Some(queued) = self.awaiting_connection.remove(&peer) else { return };
        for PendingSend { message, purpose } in queued {
            let request_id = self.next_request_id();
            self.outbound_context.insert(request_id, (peer, purpose));
            self.pending_events.push_back(ToSwarm::NotifyHandler {
                peer_id: peer,
                handler: NotifyHandler::One(connection_id),
                event: HandlerIn::SendRequest { request_id, message },
            });
        }
    }

    fn respond(&mut self, peer: PeerId, connection_id: ConnectionId, message: proto::Message) {
        self.pending_events.push_back(ToSwarm::NotifyHandler {
            peer_id: peer,
            handler: NotifyHandler::One(connection_id),
            event: HandlerIn::Respond { message },
        });
    }

    /// §4.4.2 server-side dispatch for a fully-read inbound request.
    fn handle_inbound_request(&mut self, peer: PeerId, connection_id: ConnectionId, request: proto::Message, now: Instant) {
        self.note_routing_update(peer, now);
        if let Some(envelope) = &request.sender_record {
            if let Some(addrs) = self.envelope_consumer.consume(envelope, peer) {
                self.known_addresses.entry(peer).or_default().extend(addrs);
            }
        }
        let Ok(kind) = request.message_type() else {
            warn!(%peer, "inbound message with unknown type");
            return;
        };
        let response = match kind {
            proto::MessageType::Ping => proto::Message { msg_type: proto::MessageType::Ping as i32, ..Default::default() },
            proto::MessageType::FindNode => {
                let target = Key::from_raw_digest(digest_of(&request.key));
                let closer = self.closer_peers_excluding(&target, peer);
                proto::Message {
                    msg_type: proto::MessageType::FindNode as i32,
                    key: request.key,
                    closer_peers: closer,
                    ..Default::default()
                }
            }
            proto::MessageType::GetValue => {
                let record = self.store.get_value(&request.key, now).map(record_to_wire);
                let target = Key::from_raw_digest(digest_of(&request.key));
                let closer = self.closer_peers_excluding(&target, peer);
                proto::Message {
                    msg_type: proto::MessageType::GetValue as i32,
                    key: request.key,
                    record,
                    closer_peers: closer,
                    ..Default::default()
                }
            }
            proto::MessageType::PutValue => {
                if let Some(wire_record) = request.record.clone() {
                    let record = record_from_wire(wire_record);
                    let _ = self.store.put_value(record, &self.validators, now);
                }
                let echoed = self.store.get_value(&request.key, now).map(record_to_wire);
                proto::Message {
                    msg_type: proto::MessageType::PutValue as i32,
                    key: request.key,
                    record: echoed,
                    ..Default::default()
                }
            }
            proto::MessageType::GetProviders => {
                let target = Key::from_raw_digest(digest_of(&request.key));
                let providers = self.store.get_providers(&target, now);
                let provider_peers = providers.iter().map(|p| proto_peer(p.provider, &p.addresses)).collect();
                let closer = self.closer_peers_excluding(&target, peer);
                proto::Message {
                    msg_type: proto::MessageType::GetProviders as i32,
                    key: request.key,
                    provider_peers,
                    closer_peers: closer,
                    ..Default::default()
                }
            }
            proto::MessageType::AddProvider => {
                let target = Key::from_raw_digest(digest_of(&request.key));
                for wire_peer in &request.provider_peers {
                    match PeerId::from_bytes(&wire_peer.id) {
                        Ok(claimed) if claimed == peer => {
                            let addrs = parse_addresses(&wire_peer.addrs);
                            self.store.add_provider(target, peer, addrs, false, now);
                        }
                        Ok(claimed) => {
                            self.pending_events.push_back(ToSwarm::GenerateEvent(Event::InboundProviderMismatch(
                                ProviderMismatch { claimed, actual: peer },
                            )));
                        }
                        Err(_) => warn!(%peer, "ADD_PROVIDER carried an unparseable PeerID"),
                    }
                }
                proto::Message { msg_type: proto::MessageType::AddProvider as i32, ..Default::default() }
            }
        };
        self.respond(peer, connection_id, response);
    }

    fn closer_peers_excluding(&self, target: &Key, exclude: PeerId) -> Vec<proto::Peer> {
        self.routing_table
            .find_local_closest(target, self.k_value)
            .into_iter()
            .filter(|p| *p != exclude)
            .map(|p| proto_peer(p, self.known_addresses.get(&p).map(Vec::as_slice).unwrap_or_default()))
            .collect()
    }

    /// §4.4.2 client-side handling for a response to one of our own
    /// outbound requests.
    fn handle_response(&mut self, peer: PeerId, purpose: OutboundPurpose, response: proto::Message, now: Instant) {
        self.note_routing_update(peer, now);

        if self.stale_probes.get(&peer).is_some() {
            if let OutboundPurpose::StaleProbe = purpose {
                self.stale_probes.remove(&peer);
                self.finish_stale_probe(peer, true, now);
                return;
            }
        }

        let closer: Vec<(PeerId, Key)> = response
            .closer_peers
            .iter()
            .filter_map(|p| parse_peer(p).map(|(id, addrs)| (id, addrs, p.signed_record.as_ref())))
            .filter(|(id, _, _)| *id != self.local_peer_id)
            .map(|(id, addrs, signed_record)| {
                self.known_addresses.entry(id).or_default().extend(addrs);
                if let Some(envelope) = signed_record {
                    if let Some(certified) = self.envelope_consumer.consume(envelope, id) {
                        self.known_addresses.entry(id).or_default().extend(certified);
                    }
                }
                (id, Key::new(id.to_bytes()))
            })
            .collect();

        match purpose {
            OutboundPurpose::Lookup { query_id } => {
                self.accumulate_lookup_response(query_id, peer, response, closer);
            }
            OutboundPurpose::FinishingWave { query_id } => {
                self.accumulate_finishing_response(query_id, true);
            }
            OutboundPurpose::StaleProbe | OutboundPurpose::FireAndForget => {}
        }
    }

    fn handle_outbound_failure(&mut self, peer: PeerId, purpose: OutboundPurpose) {
        match purpose {
            OutboundPurpose::StaleProbe => {
                self.stale_probes.remove(&peer);
                self.finish_stale_probe(peer, false, Instant::now());
            }
            OutboundPurpose::Lookup { query_id } => {
                if let Some(query) = self.queries.get_mut(query_id) {
                    query.on_rpc_failure(peer);
                }
            }
            OutboundPurpose::FinishingWave { query_id } => {
                self.accumulate_finishing_response(query_id, false);
            }
            OutboundPurpose::FireAndForget => {}
        }
    }

    fn finish_stale_probe(&mut self, peer: PeerId, succeeded: bool, now: Instant) {
        for (probed, outcome) in self.routing_table.resolve_probe(peer, succeeded, now) {
            let update = match outcome {
                InsertOutcome::ReplacedOldest(_) => RoutingUpdate::ReplacedStale,
                InsertOutcome::Added => RoutingUpdate::Added,
                InsertOutcome::Rejected => RoutingUpdate::Rejected,
            };
            let addresses = self.known_addresses.get(&probed).cloned().unwrap_or_default();
            self.pending_events
                .push_back(ToSwarm::GenerateEvent(Event::RoutingUpdated { peer: probed, update, addresses }));
        }
    }

    fn accumulate_lookup_response(&mut self, query_id: QueryId, peer: PeerId, response: proto::Message, closer: Vec<(PeerId, Key)>) {
        let Some(query) = self.queries.get_mut(query_id) else { return };
        match query.info_mut() {
            QueryInfo::FindNode { target_peer, found } => {
                if let Some(wire_peer) = response.closer_peers.iter().find(|p| p.id == target_peer.to_bytes()) {
                    *found = Some(parse_addresses(&wire_peer.addrs));
                }
                let early_exit = found.is_some();
                query.on_rpc_success(peer, closer);
                if early_exit {
                    query.force_stop(StopReason::EarlyExit);
                }
            }
            QueryInfo::GetRecord { records, .. } => {
                if let Some(wire_record) = response.record {
                    let record = record_from_wire(wire_record);
                    if self.validators.validate(&record.key, &record.value).is_ok() {
                        records.push(PeerRecord { record, peer: Some(peer) });
                    }
                }
                query.on_rpc_success(peer, closer);
            }
            QueryInfo::GetProviders { providers, found_at_round, .. } => {
                for wire_peer in &response.provider_peers {
                    if let Some((id, addrs)) = parse_peer(wire_peer) {
                        if !providers.iter().any(|p| p.provider == id) {
                            providers.push(ProviderInfo { provider: id, addresses: addrs });
                        }
                    }
                }
                let just_found = found_at_round.is_none() && !providers.is_empty();
                query.on_rpc_success(peer, closer);
                if just_found {
                    let round = query.rounds_completed();
                    if let QueryInfo::GetProviders { found_at_round, .. } = query.info_mut() {
                        *found_at_round = Some(round);
                    }
                }
                // §4.5.3: once at least one full α-wave has completed since
                // the first non-empty response, recall is satisfied and the
                // lookup MAY return early instead of running to convergence.
                if query.providers_recall_satisfied() {
                    query.force_stop(StopReason::EarlyExit);
                }
            }
            QueryInfo::PutRecord { .. } | QueryInfo::AddProvider { .. } | QueryInfo::Bootstrap => {
                query.on_rpc_success(peer, closer);
            }
        }
    }

    fn accumulate_finishing_response(&mut self, query_id: QueryId, accepted: bool) {
        let Some(query) = self.queries.get_mut(query_id) else { return };
        match query.info_mut() {
            QueryInfo::PutRecord { accepted: acc, .. } | QueryInfo::AddProvider { accepted: acc, .. } => {
                if accepted {
                    *acc += 1;
                }
            }
            _ => {}
        }
    }

    /// Drains completed queries, drives finishing fan-outs, and returns the
    /// swarm-facing events produced this tick.
    fn drive_queries(&mut self, now: Instant) {
        let ready: Vec<QueryId> = self.queries.ready_ids().into_iter().collect();
        for query_id in ready {
            let Some(query) = self.queries.get_mut(query_id) else { continue };
            let peers = query.next_peers_to_query();
            if peers.is_empty() {
                continue;
            }
            let requests: Vec<(PeerId, proto::Message)> = peers
                .into_iter()
                .map(|peer| (peer, self.build_lookup_request(query_id, peer)))
                .collect();
            for (peer, message) in requests {
                self.send_request(peer, message, OutboundPurpose::Lookup { query_id });
            }
        }

        let finished: Vec<QueryId> = self
            .queries
            .iter_mut()
            .filter(|q| q.is_done())
            .map(|q| q.id())
            .collect();
        for query_id in finished {
            self.finalize_or_advance(query_id, now);
        }
    }

    fn build_lookup_request(&self, query_id: QueryId, peer: PeerId) -> proto::Message {
        let Some(query) = self.queries.get(query_id) else {
            return proto::Message { msg_type: proto::MessageType::FindNode as i32, key: peer.to_bytes(), ..Default::default() };
        };
        match query.info() {
            QueryInfo::FindNode { target_peer, .. } => proto::Message {
                msg_type: proto::MessageType::FindNode as i32,
                key: target_peer.to_bytes(),
                ..Default::default()
            },
            QueryInfo::GetRecord { key, .. } => {
                proto::Message { msg_type: proto::MessageType::GetValue as i32, key: key.clone(), ..Default::default() }
            }
            QueryInfo::PutRecord { key, .. } | QueryInfo::AddProvider { key, .. } => proto::Message {
                msg_type: proto::MessageType::FindNode as i32,
                key: key.clone(),
                ..Default::default()
            },
            QueryInfo::GetProviders { key, .. } => {
                proto::Message { msg_type: proto::MessageType::GetProviders as i32, key: key.clone(), ..Default::default() }
            }
            QueryInfo::Bootstrap => proto::Message {
                msg_type: proto::MessageType::FindNode as i32,
                key: peer.to_bytes(),
                ..Default::default()
            },
        }
    }

    fn finalize_or_advance(&mut self, query_id: QueryId, now: Instant) {
        enum Action {
            PutFinish(Record),
            AddProviderFinish(Vec<u8>),
            Terminal,
        }

        let Some(query) = self.queries.get_mut(query_id) else { return };
        let action = match query.info_mut() {
            QueryInfo::PutRecord { finishing, record, .. } if !*finishing => {
                *finishing = true;
                Action::PutFinish(record.clone())
            }
            QueryInfo::AddProvider { finishing, key, .. } if !*finishing => {
                *finishing = true;
                Action::AddProviderFinish(key.clone())
            }
            _ => Action::Terminal,
        };

        match action {
            Action::PutFinish(record) => {
                let closest = self
                    .queries
                    .get(query_id)
                    .map(|q| q.closest_queried(self.k_value))
                    .unwrap_or_default();
                if closest.is_empty() {
                    self.emit_put_record_result(query_id, PutRecordError::NoPeersAvailable);
                    return;
                }
                for peer in closest {
                    let message = proto::Message {
                        msg_type: proto::MessageType::PutValue as i32,
                        key: record.key.clone(),
                        record: Some(record_to_wire(record.clone())),
                        ..Default::default()
                    };
                    self.send_request(peer, message, OutboundPurpose::FinishingWave { query_id });
                }
            }
            Action::AddProviderFinish(key) => {
                let closest = self
                    .queries
                    .get(query_id)
                    .map(|q| q.closest_queried(self.k_value))
                    .unwrap_or_default();
                if closest.is_empty() {
                    self.emit_add_provider_result(query_id, PutRecordError::NoPeersAvailable);
                    return;
                }
                let self_peer = proto_peer(self.local_peer_id, &self.external_addresses());
                for peer in closest {
                    let message = proto::Message {
                        msg_type: proto::MessageType::AddProvider as i32,
                        key: key.clone(),
                        provider_peers: vec![self_peer.clone()],
                        ..Default::default()
                    };
                    self.send_request(peer, message, OutboundPurpose::FinishingWave { query_id });
                }
            }
            Action::Terminal => self.emit_terminal_result(query_id, now),
        }
    }

    fn emit_put_record_result(&mut self, query_id: QueryId, err: PutRecordError) {
        self.queries.remove(query_id);
        self.pending_events.push_back(ToSwarm::GenerateEvent(Event::OutboundQueryCompleted {
            id: query_id,
            result: QueryOutcome::PutRecord(Err(err)),
        }));
    }

    fn emit_add_provider_result(&mut self, query_id: QueryId, err: PutRecordError) {
        self.queries.remove(query_id);
        self.pending_events.push_back(ToSwarm::GenerateEvent(Event::OutboundQueryCompleted {
            id: query_id,
            result: QueryOutcome::AddProvider(Err(err)),
        }));
    }

    fn emit_terminal_result(&mut self, query_id: QueryId, now: Instant) {
        let Some(query) = self.queries.remove(query_id) else { return };
        let outcome = match query.info() {
            QueryInfo::FindNode { target_peer, found } => QueryOutcome::FindPeer(match found {
                Some(addresses) => Ok(PeerInfo { peer: *target_peer, addresses: addresses.clone() }),
                None => Err(QueryError::NotFound),
            }),
            QueryInfo::GetRecord { records, .. } => {
                if records.is_empty() {
                    QueryOutcome::GetRecord(Err(GetRecordError::NotFound))
                } else {
                    let values: Vec<&[u8]> = records.iter().map(|r| r.record.value.as_slice()).collect();
                    let winner_idx = self
                        .validators
                        .select(&records[0].record.key, &values)
                        .unwrap_or(0);
                    let winner = records[winner_idx].record.clone();
                    // §4.5.3 "Correction": fire-and-forget re-PUT to every
                    // peer that returned something worse. Failures are
                    // never surfaced (SPEC_FULL Open Question Resolution #4).
                    for worse in records.iter().filter(|r| r.record.value != winner.value) {
                        if let Some(peer) = worse.peer {
                            debug!(%peer, "sending entry-correction PUT_VALUE");
                            let message = proto::Message {
                                msg_type: proto::MessageType::PutValue as i32,
                                key: winner.key.clone(),
                                record: Some(record_to_wire(winner.clone())),
                                ..Default::default()
                            };
                            self.send_request(peer, message, OutboundPurpose::FireAndForget);
                        }
                    }
                    if self.store.get_value(&winner.key, now).is_none() {
                        let _ = self.store.put_value(winner.clone(), &self.validators, now);
                    }
                    QueryOutcome::GetRecord(Ok(winner))
                }
            }
            QueryInfo::GetProviders { providers, .. } => QueryOutcome::GetProviders(Ok(providers.clone())),
            QueryInfo::PutRecord { accepted, .. } => QueryOutcome::PutRecord(if *accepted > 0 {
                Ok(())
            } else {
                Err(PutRecordError::NoPeersAvailable)
            }),
            QueryInfo::AddProvider { accepted, .. } => QueryOutcome::AddProvider(if *accepted > 0 {
                Ok(())
            } else {
                Err(PutRecordError::NoPeersAvailable)
            }),
            QueryInfo::Bootstrap => return,
        };
        self.pending_events
            .push_back(ToSwarm::GenerateEvent(Event::OutboundQueryCompleted { id: query_id, result: outcome }));
    }

    fn run_job(&mut self, event: JobEvent, now: Instant) {
        match event {
            JobEvent::Bootstrap | JobEvent::RefreshBuckets => {
                let seeds = self.seed_peers(&self.local_key.clone());
                self.queries.add_query(self.local_key, QueryInfo::Bootstrap, self.query_config, seeds);
                for bucket in self.routing_table.non_empty_buckets() {
                    let target = self.routing_table.random_key_in_bucket(bucket);
                    let seeds = self.seed_peers(&target);
                    self.queries.add_query(target, QueryInfo::Bootstrap, self.query_config, seeds);
                }
            }
            JobEvent::CheckStalePeers => {
                let stale = self.routing_table.get_stale_peers(Duration::from_secs(15 * 60), now);
                for peer in stale {
                    self.start_stale_probe(peer);
                }
            }
            JobEvent::RepublishProviders => {
                let due = self.store.due_for_republish(now);
                for (key, addresses) in due {
                    self.store.mark_republished(&key, &self.local_peer_id, now);
                    // Republish is itself best-effort fan-out, not a full
                    // iterative ADD_PROVIDER (§4.3.2): send directly to the
                    // locally-closest peers rather than driving a [`Query`].
                    let self_peer = proto_peer(self.local_peer_id, &addresses);
                    for peer in self.seed_peers(&key).into_iter().map(|(peer, _)| peer) {
                        let message = proto::Message {
                            msg_type: proto::MessageType::AddProvider as i32,
                            key: key.as_bytes().to_vec(),
                            provider_peers: vec![self_peer.clone()],
                            ..Default::default()
                        };
                        self.send_request(peer, message, OutboundPurpose::FireAndForget);
                    }
                }
            }
            JobEvent::SweepExpired => {
                let removed_values = self.store.sweep_expired_values(now);
                let removed_providers = self.store.sweep_expired_providers(now);
                if removed_values > 0 || removed_providers > 0 {
                    trace!(removed_values, removed_providers, "swept expired records");
                }
            }
        }
    }
}

/// Operational introspection (SPEC_FULL "SUPPLEMENTED FEATURES").
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub routing_table_size: usize,
    pub active_queries: usize,
    pub values_stored: usize,
    pub providers_stored: usize,
}

fn digest_of(key_bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(key_bytes));
    out
}

fn proto_peer(peer: PeerId, addresses: &[Multiaddr]) -> proto::Peer {
    proto::Peer {
        id: peer.to_bytes(),
        addrs: addresses.iter().map(|a| a.to_vec()).collect(),
        signed_record: None,
    }
}

fn parse_peer(peer: &proto::Peer) -> Option<(PeerId, Vec<Multiaddr>)> {
    let id = PeerId::from_bytes(&peer.id).ok()?;
    Some((id, parse_addresses(&peer.addrs)))
}

fn parse_addresses(raw: &[Vec<u8>]) -> Vec<Multiaddr> {
    raw.iter().filter_map(|bytes| Multiaddr::try_from(bytes.clone()).ok()).collect()
}

fn record_to_wire(record: Record) -> proto::Record {
    proto::Record {
        key: record.key,
        value: record.value,
        time_received: record.time_received.map(format_rfc3339).unwrap_or_default(),
    }
}

fn record_from_wire(wire: proto::Record) -> Record {
    Record {
        key: wire.key,
        value: wire.value,
        time_received: parse_rfc3339(&wire.time_received),
        publisher: None,
    }
}

/// §6.1 `Record.time_received`: an RFC3339 timestamp string.
fn format_rfc3339(time: web_time::SystemTime) -> String {
    let std_time = std::time::UNIX_EPOCH + time.duration_since(web_time::UNIX_EPOCH).unwrap_or_default();
    humantime::format_rfc3339(std_time).to_string()
}

fn parse_rfc3339(s: &str) -> Option<web_time::SystemTime> {
    let std_time = humantime::parse_rfc3339(s).ok()?;
    let since_epoch = std_time.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(web_time::UNIX_EPOCH + since_epoch)
}

impl<TStore: RecordStore + 'static> NetworkBehaviour for Behaviour<TStore> {
    type ConnectionHandler = Handler;
    type ToSwarm = Event;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        let mut handler = Handler::new(peer, self.protocol_name.clone(), self.query_timeout);
        if self.mode != Mode::Server {
            handler.set_accept_inbound(false);
        }
        Ok(handler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _addr: &Multiaddr,
        _role_override: Endpoint,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        let mut handler = Handler::new(peer, self.protocol_name.clone(), self.query_timeout);
        if self.mode != Mode::Server {
            handler.set_accept_inbound(false);
        }
        Ok(handler)
    }

    fn on_swarm_event(&mut self, event: FromSwarm) {
        match event {
            FromSwarm::ConnectionEstablished(ConnectionEstablished { peer_id, connection_id, .. }) => {
                self.connections.entry(peer_id).or_default().push(connection_id);
                self.peer_of_connection.insert(connection_id, peer_id);
                self.dialing.remove(&peer_id);
                self.flush_awaiting(peer_id, connection_id);
                self.note_routing_update(peer_id, Instant::now());
            }
            FromSwarm::ConnectionClosed(ConnectionClosed { peer_id, connection_id, remaining_established, .. }) => {
                self.peer_of_connection.remove(&connection_id);
                if remaining_established == 0 {
                    self.connections.remove(&peer_id);
                } else if let Some(list) = self.connections.get_mut(&peer_id) {
                    list.retain(|c| *c != connection_id);
                }
            }
            FromSwarm::ExternalAddrConfirmed(confirmed) => {
                self.confirmed_external_addrs.insert(confirmed.addr.clone());
                self.recompute_mode();
            }
            FromSwarm::ExternalAddrExpired(expired) => {
                self.confirmed_external_addrs.remove(expired.addr);
                self.recompute_mode();
            }
            FromSwarm::NewExternalAddrOfPeer(candidate) => {
                self.known_addresses.entry(candidate.peer_id).or_default().push(candidate.addr.clone());
            }
            _ => {}
        }
    }

    fn on_connection_handler_event(&mut self, peer_id: PeerId, connection_id: ConnectionId, event: THandlerOutEvent<Self>) {
        let now = Instant::now();
        match event {
            HandlerEvent::Request { message } => self.handle_inbound_request(peer_id, connection_id, message, now),
            HandlerEvent::Response { request_id, message } => {
                if let Some((peer, purpose)) = self.outbound_context.remove(&request_id) {
                    self.handle_response(peer, purpose, message, now);
                }
            }
            HandlerEvent::OutboundFailure { request_id, error } => {
                warn!(%peer_id, %error, "outbound request failed");
                if let Some((peer, purpose)) = self.outbound_context.remove(&request_id) {
                    self.handle_outbound_failure(peer, purpose);
                }
            }
            HandlerEvent::InboundRefused => {
                trace!(%peer_id, "refused inbound stream while in client mode");
            }
        }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        if let Some(event) = self.pending_events.pop_front() {
            return Poll::Ready(event);
        }

        let now = Instant::now();

        if self.running {
            if let Poll::Ready(job) = self.jobs.poll(cx) {
                self.run_job(job, now);
            }
        }

        self.drive_queries(now);

        if let Some(event) = self.pending_events.pop_front() {
            return Poll::Ready(event);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn behaviour() -> Behaviour<MemoryStore> {
        let peer = PeerId::random();
        Behaviour::with_config(peer, MemoryStore::new(peer), Config::new(crate::PROTOCOL_NAME))
    }

    #[test]
    fn starts_in_client_mode_by_default() {
        let b = behaviour();
        assert_eq!(b.mode(), Mode::Client);
    }

    #[test]
    fn set_mode_overrides_auto_detection() {
        let mut b = behaviour();
        b.set_mode(Some(Mode::Server));
        assert_eq!(b.mode(), Mode::Server);
    }

    #[test]
    fn stats_reflect_empty_routing_table_initially() {
        let b = behaviour();
        let stats = b.stats();
        assert_eq!(stats.routing_table_size, 0);
        assert_eq!(stats.active_queries, 0);
    }

    #[test]
    fn find_peer_registers_a_query() {
        let mut b = behaviour();
        let target = PeerId::random();
        let _id = b.find_peer(target);
        // With an empty routing table the query starts already stopped
        // (§4.5.2 step 2: empty shortlist), but it is still tracked until
        // the next `poll` finalizes it.
        assert_eq!(b.queries.len(), 1);
    }
}
