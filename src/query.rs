// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The iterative lookup engine (component C5, §4.5): α-parallel
//! closest-peer traversal shared by `FIND_NODE`, `GET_VALUE`, `PUT_VALUE`,
//! `ADD_PROVIDER`, and `GET_PROVIDERS`.
//!
//! This module is deliberately synchronous and network-agnostic: a [`Query`]
//! is a pure state machine advanced by [`crate::behaviour::Behaviour::poll`]
//! feeding in RPC outcomes as they arrive from [`crate::handler`]. This
//! mirrors the teacher's own `query.rs`: lookup state is owned by one place
//! (here, the behaviour's [`QueryPool`]) and the RPC layer never holds a
//! back-pointer into it (§9 "Cyclic references...").

use std::collections::{HashSet, VecDeque};

use libp2p_identity::PeerId;
use smallvec::SmallVec;

use crate::distance::{Distance, Key};
use crate::record::{PeerRecord, Record};
use crate::store::ProviderInfo;

/// Identifies one in-flight iterative lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

/// A candidate in the shortlist: its id, key, and distance to the target,
/// cached so repeated comparisons don't re-hash.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    peer: PeerId,
    key: Key,
    distance: Distance,
}

/// What kind of lookup a [`Query`] is driving, and its kind-specific
/// accumulator (§4.5.3).
#[derive(Debug)]
pub enum QueryInfo {
    FindNode {
        target_peer: PeerId,
        found: Option<Vec<libp2p_core::Multiaddr>>,
    },
    GetRecord {
        key: Vec<u8>,
        quorum: usize,
        records: Vec<PeerRecord>,
    },
    PutRecord {
        key: Vec<u8>,
        record: Record,
        /// Populated once the base lookup converges; these are the peers
        /// the finishing `PUT_VALUE` fan-out targets.
        finishing: bool,
        accepted: usize,
    },
    GetProviders {
        key: Vec<u8>,
        providers: Vec<ProviderInfo>,
        /// Set on the wave after the first non-empty response, so the
        /// lookup runs at least one more full α-wave before stopping
        /// (§4.5.3 recall requirement).
        found_at_round: Option<usize>,
    },
    AddProvider {
        key: Vec<u8>,
        finishing: bool,
        accepted: usize,
    },
    /// Used by bootstrap/refresh: a bare FIND_NODE whose only purpose is
    /// to populate the routing table with what the lookup discovers.
    Bootstrap,
}

impl QueryInfo {
    pub fn target_key(&self, target_peer_key: impl Fn(&PeerId) -> Key, key_of: impl Fn(&[u8]) -> Key) -> Key {
        match self {
            QueryInfo::FindNode { target_peer, .. } => target_peer_key(target_peer),
            QueryInfo::GetRecord { key, .. } | QueryInfo::PutRecord { key, .. } => key_of(key),
            QueryInfo::GetProviders { key, .. } | QueryInfo::AddProvider { key, .. } => key_of(key),
            QueryInfo::Bootstrap => unreachable!("Bootstrap queries carry their target separately"),
        }
    }
}

/// Why a [`Query`] stopped issuing new RPCs (§4.5.2 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    AllCandidatesQueried,
    RoundCapReached,
    EarlyExit,
}

/// Tunables for the lookup engine (§6.3).
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    pub alpha: usize,
    pub k: usize,
    pub max_rounds: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: crate::ALPHA_VALUE,
            k: crate::K_VALUE,
            max_rounds: 20,
        }
    }
}

/// One iterative lookup's shortlist/queried/pending bookkeeping (§4.5.1),
/// independent of what kind of RPC it is driving.
#[derive(Debug)]
struct Shortlist {
    target: Key,
    config: QueryConfig,
    /// Ascending by distance to `target`.
    candidates: Vec<Candidate>,
    queried: HashSet<PeerId>,
    pending: HashSet<PeerId>,
    rounds_completed: usize,
    /// The k-th best distance known at the end of the previous full wave,
    /// used for the convergence stop condition.
    last_wave_kth_best: Option<Distance>,
    stopped: Option<StopReason>,
}

impl Shortlist {
    fn new(target: Key, config: QueryConfig, seeds: Vec<(PeerId, Key)>) -> Self {
        let mut candidates: Vec<Candidate> = seeds
            .into_iter()
            .map(|(peer, key)| Candidate { peer, key, distance: key.distance(&target) })
            .collect();
        candidates.sort_by_key(|c| c.distance);
        candidates.truncate(config.k);
        let stopped = candidates.is_empty().then_some(StopReason::AllCandidatesQueried);
        Self {
            target,
            config,
            candidates,
            queried: HashSet::new(),
            pending: HashSet::new(),
            rounds_completed: 0,
            last_wave_kth_best: None,
            stopped,
        }
    }

    fn kth_best(&self) -> Option<Distance> {
        self.candidates.get(self.config.k.saturating_sub(1)).map(|c| c.distance)
    }

    /// §4.5.2 step 3a: up to α peers from shortlist \ (queried ∪ pending),
    /// closest first, PeerID byte-order tie-break (§4.5.4) for determinism.
    fn select_next(&mut self) -> Vec<PeerId> {
        if self.stopped.is_some() {
            return Vec::new();
        }
        let slots = self.config.alpha.saturating_sub(self.pending.len());
        let mut picked = Vec::new();
        for candidate in &self.candidates {
            if picked.len() >= slots {
                break;
            }
            if self.queried.contains(&candidate.peer) || self.pending.contains(&candidate.peer) {
                continue;
            }
            picked.push(candidate.peer);
        }
        for peer in &picked {
            self.pending.insert(*peer);
        }
        picked
    }

    fn insert_candidates(&mut self, new_peers: Vec<(PeerId, Key)>) {
        // Self-filtering happens at the behaviour layer, which knows the
        // local peer id; this module only dedups against what it already has.
        for (peer, key) in new_peers {
            if self.candidates.iter().any(|c| c.peer == peer) {
                continue;
            }
            if self.queried.contains(&peer) {
                continue;
            }
            self.candidates.push(Candidate { peer, key, distance: key.distance(&self.target) });
        }
        self.candidates.sort_by_key(|c| c.distance);
        self.candidates.dedup_by_key(|c| c.peer);
        self.candidates.truncate(self.config.k.max(self.queried.len() + self.config.alpha));
    }

    fn on_response(&mut self, peer: PeerId, closer_peers: Vec<(PeerId, Key)>) {
        self.pending.remove(&peer);
        self.queried.insert(peer);
        self.insert_candidates(closer_peers);
        self.maybe_complete_wave();
    }

    fn on_failure(&mut self, peer: PeerId) {
        self.pending.remove(&peer);
        self.queried.insert(peer);
        self.maybe_complete_wave();
    }

    fn maybe_complete_wave(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        self.rounds_completed += 1;

        if self.candidates.iter().all(|c| self.queried.contains(&c.peer)) {
            self.stopped = Some(StopReason::AllCandidatesQueried);
            return;
        }
        if self.rounds_completed >= self.config.max_rounds {
            self.stopped = Some(StopReason::RoundCapReached);
            return;
        }
        let kth = self.kth_best();
        if let (Some(prev), Some(now)) = (self.last_wave_kth_best, kth) {
            if now >= prev {
                self.stopped = Some(StopReason::Converged);
                return;
            }
        }
        self.last_wave_kth_best = kth;
    }

    fn is_done(&self) -> bool {
        self.stopped.is_some()
    }

    fn closest_queried(&self, count: usize) -> Vec<PeerId> {
        self.candidates
            .iter()
            .filter(|c| self.queried.contains(&c.peer))
            .take(count)
            .map(|c| c.peer)
            .collect()
    }
}

/// A single in-progress (or just-finished) iterative lookup.
#[derive(Debug)]
pub struct Query {
    id: QueryId,
    shortlist: Shortlist,
    info: QueryInfo,
}

impl Query {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn info(&self) -> &QueryInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut QueryInfo {
        &mut self.info
    }

    /// Peers to send the kind-specific RPC to right now, honouring the α
    /// bound (§4.5.2 step 3a/b).
    pub fn next_peers_to_query(&mut self) -> Vec<PeerId> {
        self.shortlist.select_next()
    }

    pub fn on_rpc_success(&mut self, peer: PeerId, closer_peers: Vec<(PeerId, Key)>) {
        self.shortlist.on_response(peer, closer_peers);
    }

    pub fn on_rpc_failure(&mut self, peer: PeerId) {
        self.shortlist.on_failure(peer);
    }

    /// Force immediate termination (§4.5.3's per-kind early exits).
    pub fn force_stop(&mut self, reason: StopReason) {
        self.shortlist.stopped = Some(reason);
    }

    pub fn is_done(&self) -> bool {
        self.shortlist.is_done()
    }

    pub fn closest_queried(&self, count: usize) -> Vec<PeerId> {
        self.shortlist.closest_queried(count)
    }

    /// Number of full α-waves completed so far (§4.5.2 step 3d). Used by
    /// the GET_PROVIDERS early-exit bookkeeping to record the wave a
    /// result was first seen on, rather than assuming wave 0.
    pub fn rounds_completed(&self) -> usize {
        self.shortlist.rounds_completed
    }

    /// §4.5.3 GET_PROVIDERS early-exit bookkeeping: may return immediately
    /// only after at least one more full wave past the first non-empty
    /// response.
    pub fn providers_recall_satisfied(&self) -> bool {
        if let QueryInfo::GetProviders { found_at_round, .. } = &self.info {
            match found_at_round {
                Some(round) => self.shortlist.rounds_completed > *round,
                None => false,
            }
        } else {
            false
        }
    }
}

/// Owns every in-flight [`Query`]; the only mutator of lookup state, per
/// §5's "lookup state is owned by one task" discipline.
#[derive(Debug, Default)]
pub struct QueryPool {
    next_id: VecDeque<u64>,
    counter: u64,
    queries: std::collections::HashMap<QueryId, Query>,
}

impl QueryPool {
    pub fn new() -> Self {
        Self {
            next_id: VecDeque::new(),
            counter: 0,
            queries: std::collections::HashMap::new(),
        }
    }

    fn fresh_id(&mut self) -> QueryId {
        let id = QueryId(self.counter);
        self.counter += 1;
        id
    }

    /// §4.5.2 step 1-2: seed the shortlist; the caller (behaviour) is
    /// responsible for checking `seeds` non-empty beforehand and surfacing
    /// `NoPeersAvailable` rather than registering an unservable query.
    pub fn add_query(
        &mut self,
        target: Key,
        info: QueryInfo,
        config: QueryConfig,
        seeds: Vec<(PeerId, Key)>,
    ) -> QueryId {
        let id = self.fresh_id();
        let shortlist = Shortlist::new(target, config, seeds);
        self.queries.insert(id, Query { id, shortlist, info });
        id
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Query> {
        self.queries.get_mut(&id)
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn remove(&mut self, id: QueryId) -> Option<Query> {
        self.queries.remove(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Query> {
        self.queries.values_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Ids of every query that has a free α slot and is not finished;
    /// used by the behaviour's poll loop to decide whom to dial next.
    pub fn ready_ids(&self) -> SmallVec<[QueryId; 8]> {
        self.queries
            .iter()
            .filter(|(_, q)| !q.is_done())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_and_key(tag: u8) -> (PeerId, Key) {
        let peer = PeerId::random();
        let key = Key::new([tag; 4]);
        (peer, key)
    }

    #[test]
    fn alpha_bound_is_respected() {
        let target = Key::new(b"target");
        let config = QueryConfig { alpha: 2, k: 20, max_rounds: 20 };
        let seeds: Vec<_> = (0..10u8).map(peer_and_key).collect();
        let mut pool = QueryPool::new();
        let id = pool.add_query(target, QueryInfo::Bootstrap, config, seeds);
        let query = pool.get_mut(id).unwrap();
        let batch = query.next_peers_to_query();
        assert!(batch.len() <= 2);
    }

    #[test]
    fn peer_is_never_queried_twice() {
        let target = Key::new(b"target");
        let config = QueryConfig { alpha: 3, k: 20, max_rounds: 20 };
        let seeds: Vec<_> = (0..5u8).map(peer_and_key).collect();
        let mut pool = QueryPool::new();
        let id = pool.add_query(target, QueryInfo::Bootstrap, config, seeds.clone());
        let mut all_queried = HashSet::new();
        loop {
            let query = pool.get_mut(id).unwrap();
            if query.is_done() {
                break;
            }
            let batch = query.next_peers_to_query();
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                assert!(!all_queried.contains(peer), "peer queried twice");
                all_queried.insert(*peer);
            }
            for peer in batch {
                query.on_rpc_success(peer, Vec::new());
            }
        }
    }

    #[test]
    fn terminates_when_all_candidates_queried() {
        let target = Key::new(b"target");
        let config = QueryConfig { alpha: 3, k: 20, max_rounds: 20 };
        let seeds: Vec<_> = (0..4u8).map(peer_and_key).collect();
        let mut pool = QueryPool::new();
        let id = pool.add_query(target, QueryInfo::Bootstrap, config, seeds);
        let mut rounds = 0;
        loop {
            let query = pool.get_mut(id).unwrap();
            if query.is_done() {
                break;
            }
            let batch = query.next_peers_to_query();
            for peer in batch {
                query.on_rpc_failure(peer);
            }
            rounds += 1;
            assert!(rounds < 1000, "lookup failed to terminate");
        }
        let query = pool.get(id).unwrap();
        assert!(query.is_done());
    }

    #[test]
    fn empty_seed_list_starts_already_stopped() {
        let target = Key::new(b"target");
        let config = QueryConfig::default();
        let mut pool = QueryPool::new();
        let id = pool.add_query(target, QueryInfo::Bootstrap, config, Vec::new());
        assert!(pool.get(id).unwrap().is_done());
    }

    #[test]
    fn round_cap_is_honoured_even_without_convergence() {
        let target = Key::new(b"target");
        let config = QueryConfig { alpha: 1, k: 20, max_rounds: 3 };
        // Every response discovers one brand-new, ever-closer peer so the
        // lookup would never naturally converge.
        let mut pool = QueryPool::new();
        let seed = peer_and_key(0);
        let id = pool.add_query(target, QueryInfo::Bootstrap, config, vec![seed]);
        let mut iterations = 0;
        loop {
            let query = pool.get_mut(id).unwrap();
            if query.is_done() {
                break;
            }
            let batch = query.next_peers_to_query();
            for peer in batch {
                let fresh = peer_and_key(iterations as u8 + 1);
                query.on_rpc_success(peer, vec![fresh]);
            }
            iterations += 1;
            assert!(iterations < 100, "round cap not enforced");
        }
        assert!(iterations <= config.max_rounds + 1);
    }
}
