// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Routing table: k-bucket organization, liveness tracking, and the
//! split/eviction discipline of component C2.
//!
//! Buckets are a fixed array of [`crate::MAX_BUCKETS`] slots indexed by
//! common-prefix-length with the local key. This is the standard Kademlia
//! realization of "splitting": every bucket's range is precomputed and never
//! changes, so a peer always lands in exactly one bucket and no runtime
//! merge/split step is needed (see `SPEC_FULL.md`, Open Question 5).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use libp2p_identity::PeerId;
use smallvec::SmallVec;

use crate::distance::Key;
use crate::K_VALUE;

/// What happened when a peer was offered to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Newly admitted, or an existing entry was refreshed.
    Added,
    /// The bucket was full; the stalest occupant was evicted to make room.
    ReplacedOldest(PeerId),
    /// The bucket was full and its oldest occupant is still considered
    /// live (or a liveness probe is already in flight); the new peer was
    /// not admitted.
    Rejected,
}

/// Policy for what happens when a full bucket's oldest peer has a probe
/// already in flight and a second admission attempt arrives concurrently.
/// Fixed at construction time per §4.2's determinism requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentProbePolicy {
    /// Reject the new peer immediately; do not wait for the in-flight probe.
    AlwaysReject,
    /// Wait for the in-flight probe's outcome before deciding.
    AlwaysWait,
}

impl Default for ConcurrentProbePolicy {
    fn default() -> Self {
        ConcurrentProbePolicy::AlwaysReject
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub peer: PeerId,
    pub key: Key,
    pub last_seen: Instant,
}

/// Whether a bucket's oldest peer currently has a liveness probe in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Idle,
    InFlight,
}

/// A single k-bucket: up to [`K_VALUE`] peers, ordered oldest-first (head)
/// to most-recently-seen (tail).
#[derive(Debug, Clone)]
pub(crate) struct KBucket {
    nodes: VecDeque<Node>,
    capacity: usize,
    probe: ProbeState,
    /// Candidates waiting on the in-flight probe's outcome, oldest request
    /// first. Only populated under [`ConcurrentProbePolicy::AlwaysWait`].
    pending: VecDeque<PeerId>,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity,
            probe: ProbeState::Idle,
            pending: VecDeque::new(),
        }
    }

    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.peer == peer)
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    fn oldest(&self) -> Option<&Node> {
        self.nodes.front()
    }
}

/// The routing table: a fixed set of k-buckets plus a liveness clock per
/// peer, keyed by distance to the local id.
pub struct RoutingTable {
    local_key: Key,
    buckets: Vec<KBucket>,
    probe_policy: ConcurrentProbePolicy,
}

impl RoutingTable {
    pub fn new(local_peer: PeerId, k_value: usize) -> Self {
        let local_key = Key::new(local_peer.to_bytes());
        let buckets = (0..crate::MAX_BUCKETS).map(|_| KBucket::new(k_value)).collect();
        Self {
            local_key,
            buckets,
            probe_policy: ConcurrentProbePolicy::default(),
        }
    }

    pub fn with_probe_policy(mut self, policy: ConcurrentProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    fn bucket_index(&self, peer: &PeerId) -> Option<usize> {
        Key::new(peer.to_bytes()).bucket_index(&self.local_key)
    }

    /// Attempt to admit `peer` into the table. `now` is the observation
    /// time (kept as a parameter so behaviour above can pass a consistent
    /// clock reading rather than each layer calling `Instant::now()`
    /// independently).
    ///
    /// Returns [`InsertOutcome::ReplacedOldest`] only after the caller has
    /// already determined (via an out-of-band liveness probe, see
    /// [`RoutingTable::begin_probe`]/[`RoutingTable::resolve_probe`]) that the
    /// bucket's oldest occupant is dead; this function itself never blocks
    /// on network I/O.
    pub fn add_peer(&mut self, peer: PeerId, now: Instant) -> InsertOutcome {
        // `bucket_index` returns `None` when `peer`'s key coincides exactly
        // with the local key (distance 0, cpl 256) — i.e. the local peer
        // itself, which the table never stores.
        let Some(idx) = self.bucket_index(&peer) else {
            return InsertOutcome::Rejected;
        };
        let key = Key::new(peer.to_bytes());
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&peer) {
            if let Some(mut node) = bucket.nodes.remove(pos) {
                node.last_seen = now;
                bucket.nodes.push_back(node);
            }
            return InsertOutcome::Added;
        }

        if !bucket.is_full() {
            bucket.nodes.push_back(Node { peer, key, last_seen: now });
            return InsertOutcome::Added;
        }

        // Bucket full. Under `AlwaysWait`, queue behind whichever probe is
        // already running (or about to be started by the caller via
        // `begin_probe`) so this candidate shares that probe's outcome
        // instead of being dropped outright.
        if self.probe_policy == ConcurrentProbePolicy::AlwaysWait
            && bucket.probe == ProbeState::InFlight
            && !bucket.pending.contains(&peer)
        {
            bucket.pending.push_back(peer);
        }
        InsertOutcome::Rejected
    }

    /// Begin a liveness probe against the oldest peer in the bucket that
    /// would currently reject `candidate`. Returns the peer to probe, if
    /// any, and records that a probe is now in flight for that bucket.
    ///
    /// Returns `None` if the bucket has room, or a probe is already running
    /// (the candidate has already been queued by [`RoutingTable::add_peer`]
    /// under [`ConcurrentProbePolicy::AlwaysWait`], and is simply dropped
    /// under [`ConcurrentProbePolicy::AlwaysReject`]).
    pub fn begin_probe(&mut self, candidate: PeerId) -> Option<PeerId> {
        let idx = self.bucket_index(&candidate)?;
        let bucket = &mut self.buckets[idx];
        if !bucket.is_full() {
            return None;
        }
        if bucket.probe == ProbeState::InFlight {
            if self.probe_policy == ConcurrentProbePolicy::AlwaysWait && !bucket.pending.contains(&candidate) {
                bucket.pending.push_back(candidate);
            }
            return None;
        }
        bucket.probe = ProbeState::InFlight;
        bucket.pending.push_back(candidate);
        bucket.oldest().map(|n| n.peer)
    }

    /// Resolve a previously-started probe against `probed`, the bucket's
    /// former oldest occupant. Returns the outcome for every candidate that
    /// queued behind this probe (just one, under `AlwaysReject`): if the
    /// probe succeeded every queued candidate is rejected and `probed`'s
    /// liveness clock is refreshed; if it failed, the first-queued
    /// candidate replaces `probed` and the rest remain rejected.
    pub fn resolve_probe(
        &mut self,
        probed: PeerId,
        probe_succeeded: bool,
        now: Instant,
    ) -> Vec<(PeerId, InsertOutcome)> {
        let Some(idx) = self.bucket_index(&probed) else {
            return Vec::new();
        };
        let bucket = &mut self.buckets[idx];
        bucket.probe = ProbeState::Idle;
        let waiting: Vec<PeerId> = bucket.pending.drain(..).collect();

        if probe_succeeded {
            if let Some(pos) = bucket.position(&probed) {
                if let Some(mut node) = bucket.nodes.remove(pos) {
                    node.last_seen = now;
                    bucket.nodes.push_back(node);
                }
            }
            return waiting.into_iter().map(|p| (p, InsertOutcome::Rejected)).collect();
        }

        if let Some(pos) = bucket.position(&probed) {
            bucket.nodes.remove(pos);
        }

        let mut results = Vec::with_capacity(waiting.len());
        let mut admitted = false;
        for candidate in waiting {
            if !admitted {
                let key = Key::new(candidate.to_bytes());
                bucket.nodes.push_back(Node { peer: candidate, key, last_seen: now });
                results.push((candidate, InsertOutcome::ReplacedOldest(probed)));
                admitted = true;
            } else {
                results.push((candidate, InsertOutcome::Rejected));
            }
        }
        results
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let Some(idx) = self.bucket_index(peer) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(peer) {
            bucket.nodes.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.bucket_index(peer)
            .map(|idx| self.buckets[idx].position(peer).is_some())
            .unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// Peers with minimum XOR distance to `key`, ascending, across *all*
    /// buckets (not just the one `key` would occupy — a target bucket may
    /// hold fewer than `k` peers).
    pub fn find_local_closest(&self, key: &Key, count: usize) -> Vec<PeerId> {
        let mut all: SmallVec<[(Key, PeerId); 64]> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().map(|n| (n.key, n.peer)))
            .collect();
        all.sort_by_key(|(k, _)| k.distance(key));
        all.into_iter().take(count).map(|(_, p)| p).collect()
    }

    /// Peers whose `last_seen` predates `now - threshold`.
    pub fn get_stale_peers(&self, threshold: Duration, now: Instant) -> Vec<PeerId> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| now.saturating_duration_since(n.last_seen) > threshold)
            .map(|n| n.peer)
            .collect()
    }

    /// A random key whose bucket index is `bucket` — used by the
    /// routing-table refresh job to pick a FIND_NODE target per non-empty
    /// bucket (§4.6).
    pub fn random_key_in_bucket(&self, bucket: usize) -> Key {
        use rand::RngCore;
        let mut digest = *self.local_key.as_bytes();
        let mut rng = rand::thread_rng();
        // Flip the bit at position `bucket` (0 = most significant) and
        // randomize everything after it; this keeps the common-prefix
        // length with `local_key` exactly `bucket`.
        let byte = bucket / 8;
        let bit = 7 - (bucket % 8);
        digest[byte] ^= 1 << bit;
        if byte + 1 < digest.len() {
            rng.fill_bytes(&mut digest[byte + 1..]);
        }
        Key::from_raw_digest(digest)
    }

    /// Indices of buckets holding at least one peer.
    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.nodes.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn local_key(&self) -> &Key {
        &self.local_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn add_peer_then_contains() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, K_VALUE);
        let peer = PeerId::random();
        let outcome = table.add_peer(peer, now());
        assert_eq!(outcome, InsertOutcome::Added);
        assert!(table.contains(&peer));
    }

    #[test]
    fn bucket_never_exceeds_k() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 2);
        // Insert many peers; whichever bucket each lands in must cap at k=2.
        for _ in 0..200 {
            let peer = PeerId::random();
            table.add_peer(peer, now());
        }
        for bucket in &table.buckets {
            assert!(bucket.nodes.len() <= 2);
        }
    }

    #[test]
    fn find_local_closest_is_sorted_ascending() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, K_VALUE);
        for _ in 0..10 {
            table.add_peer(PeerId::random(), now());
        }
        let target = Key::new(PeerId::random().to_bytes());
        let closest = table.find_local_closest(&target, 5);
        let mut prev = None;
        for peer in &closest {
            let d = Key::new(peer.to_bytes()).distance(&target);
            if let Some(p) = prev {
                assert!(p <= d);
            }
            prev = Some(d);
        }
    }

    #[test]
    fn full_bucket_rejects_until_probe_resolves_with_failure() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 1);
        let first = PeerId::random();
        table.add_peer(first, now());

        let idx = Key::new(first.to_bytes())
            .bucket_index(&Key::new(local.to_bytes()))
            .unwrap();
        // Only proceed if we find a second peer landing in the same bucket
        // as `first` (bucket index determined by common-prefix length, so
        // this is found quickly for low bucket indices and this test is
        // tolerant of never finding one for very high indices).
        for _ in 0..1000 {
            let second = PeerId::random();
            if Key::new(second.to_bytes()).bucket_index(&Key::new(local.to_bytes())) != Some(idx) {
                continue;
            }
            assert_eq!(table.add_peer(second, now()), InsertOutcome::Rejected);
            let probed = table.begin_probe(second);
            assert_eq!(probed, Some(first));
            let outcomes = table.resolve_probe(first, false, now());
            assert_eq!(outcomes, vec![(second, InsertOutcome::ReplacedOldest(first))]);
            assert!(table.contains(&second));
            assert!(!table.contains(&first));
            return;
        }
    }

    #[test]
    fn stale_peers_reported_after_threshold() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, K_VALUE);
        let peer = PeerId::random();
        let seen_at = now() - Duration::from_secs(3600);
        table.add_peer(peer, seen_at);
        let stale = table.get_stale_peers(Duration::from_secs(60), now());
        assert!(stale.contains(&peer));
    }
}
