// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The provider store (§4.3.2): per-content-key map of providers, with
//! independent expiration, republish, and remote-address-TTL lifecycles.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p_core::Multiaddr;
use libp2p_identity::PeerId;

use crate::distance::Key;

#[derive(Debug, Clone)]
struct ProviderEntry {
    addresses: Vec<Multiaddr>,
    received_at: Instant,
    is_local: bool,
    /// Local entries only: when this record is next due for re-advertisement.
    republish_at: Option<Instant>,
}

/// Configuration for provider expiry, remote-address trust window, and the
/// local republish cadence (§6.3).
#[derive(Debug, Clone)]
pub struct ProviderStoreConfig {
    pub provider_expiration: Duration,
    pub provider_republish_interval: Duration,
    pub provider_address_ttl: Duration,
    /// Cap on distinct providers tracked per content key.
    pub max_providers_per_key: usize,
}

impl Default for ProviderStoreConfig {
    fn default() -> Self {
        Self {
            provider_expiration: Duration::from_secs(48 * 60 * 60),
            provider_republish_interval: Duration::from_secs(22 * 60 * 60),
            provider_address_ttl: Duration::from_secs(30 * 60),
            max_providers_per_key: 20,
        }
    }
}

/// A provider returned from [`ProviderStore::get_providers`], with remote
/// addresses already filtered by [`ProviderStoreConfig::provider_address_ttl`].
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub provider: PeerId,
    pub addresses: Vec<Multiaddr>,
}

#[derive(Debug)]
pub struct ProviderStore {
    config: ProviderStoreConfig,
    providers: HashMap<Key, HashMap<PeerId, ProviderEntry>>,
}

impl ProviderStore {
    pub fn new(config: ProviderStoreConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
        }
    }

    /// §4.3.2 `add_provider`. Replaces any existing entry for the same
    /// `(content_key, provider)` pair and resets its `received_at`; when
    /// `is_local`, also (re)schedules the republish deadline without
    /// touching the expiration clock remote peers track independently.
    pub fn add_provider(
        &mut self,
        content_key: Key,
        provider: PeerId,
        addresses: Vec<Multiaddr>,
        is_local: bool,
        now: Instant,
    ) {
        let bucket = self.providers.entry(content_key).or_default();
        if !bucket.contains_key(&provider) && bucket.len() >= self.config.max_providers_per_key {
            // Evict the entry with the oldest `received_at` to make room;
            // the new announcement is always preferred over a stale one.
            if let Some(oldest) = bucket
                .iter()
                .min_by_key(|(_, e)| e.received_at)
                .map(|(p, _)| *p)
            {
                bucket.remove(&oldest);
            }
        }
        let republish_at = is_local.then(|| now + self.config.provider_republish_interval);
        bucket.insert(
            provider,
            ProviderEntry {
                addresses,
                received_at: now,
                is_local,
                republish_at,
            },
        );
    }

    fn is_expired(entry: &ProviderEntry, expiration: Duration, now: Instant) -> bool {
        // Local records never expire from this node's own perspective;
        // only remote peers age them out on their own clock (§4.3.2).
        !entry.is_local && now.saturating_duration_since(entry.received_at) >= expiration
    }

    /// §4.3.2 `get_providers`: all non-expired providers for `content_key`.
    /// Remote addresses older than `provider_address_ttl` are omitted
    /// (though the provider entry itself is retained until full expiry).
    pub fn get_providers(&self, content_key: &Key, now: Instant) -> Vec<ProviderInfo> {
        let Some(bucket) = self.providers.get(content_key) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|(_, e)| !Self::is_expired(e, self.config.provider_expiration, now))
            .map(|(peer, e)| {
                let addresses = if e.is_local
                    || now.saturating_duration_since(e.received_at) < self.config.provider_address_ttl
                {
                    e.addresses.clone()
                } else {
                    Vec::new()
                };
                ProviderInfo {
                    provider: *peer,
                    addresses,
                }
            })
            .collect()
    }

    /// Content keys with a local provider entry due for republish at or
    /// before `now`, alongside the addresses to re-announce.
    pub fn due_for_republish(&self, now: Instant) -> Vec<(Key, Vec<Multiaddr>)> {
        let mut due = Vec::new();
        for (key, bucket) in &self.providers {
            for entry in bucket.values() {
                if entry.is_local && entry.republish_at.is_some_and(|t| t <= now) {
                    due.push((*key, entry.addresses.clone()));
                }
            }
        }
        due
    }

    /// Reset the republish deadline for a local provider entry after a
    /// successful (or attempted, per the fire-and-forget policy) republish.
    /// Does not touch `received_at`/expiration.
    pub fn mark_republished(&mut self, content_key: &Key, provider: &PeerId, now: Instant) {
        if let Some(entry) = self
            .providers
            .get_mut(content_key)
            .and_then(|b| b.get_mut(provider))
        {
            if entry.is_local {
                entry.republish_at = Some(now + self.config.provider_republish_interval);
            }
        }
    }

    /// Periodic sweep of fully expired (non-local) entries.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let expiration = self.config.provider_expiration;
        let mut removed = 0;
        self.providers.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|_, e| !Self::is_expired(e, expiration, now));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }

    /// Total `(content_key, provider)` pairs tracked, expired or not.
    pub fn count(&self) -> usize {
        self.providers.values().map(|bucket| bucket.len()).sum()
    }

    pub fn local_provided_keys(&self) -> Vec<Key> {
        self.providers
            .iter()
            .filter(|(_, bucket)| bucket.values().any(|e| e.is_local))
            .map(|(k, _)| *k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Multiaddr {
        "/memory/1".parse().unwrap()
    }

    #[test]
    fn add_then_get_providers_contains_it() {
        let mut store = ProviderStore::new(ProviderStoreConfig::default());
        let key = Key::new(b"content");
        let peer = PeerId::random();
        let now = Instant::now();
        store.add_provider(key, peer, vec![addr()], false, now);
        let providers = store.get_providers(&key, now);
        assert!(providers.iter().any(|p| p.provider == peer));
    }

    #[test]
    fn remote_provider_expires_after_provider_expiration() {
        let mut store = ProviderStore::new(ProviderStoreConfig {
            provider_expiration: Duration::from_millis(1),
            ..Default::default()
        });
        let key = Key::new(b"content");
        let peer = PeerId::random();
        let t0 = Instant::now();
        store.add_provider(key, peer, vec![addr()], false, t0);
        let later = t0 + Duration::from_secs(1);
        assert!(store.get_providers(&key, later).is_empty());
    }

    #[test]
    fn local_provider_never_expires_but_is_due_for_republish() {
        let mut store = ProviderStore::new(ProviderStoreConfig {
            provider_republish_interval: Duration::from_millis(1),
            provider_expiration: Duration::from_millis(1),
            ..Default::default()
        });
        let key = Key::new(b"content");
        let peer = PeerId::random();
        let t0 = Instant::now();
        store.add_provider(key, peer, vec![addr()], true, t0);
        let later = t0 + Duration::from_secs(1);
        // Still returned: local records don't expire from this node's view.
        assert!(!store.get_providers(&key, later).is_empty());
        let due = store.due_for_republish(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, key);
    }

    #[test]
    fn republish_resets_deadline_not_expiration() {
        let mut store = ProviderStore::new(ProviderStoreConfig::default());
        let key = Key::new(b"content");
        let peer = PeerId::random();
        let t0 = Instant::now();
        store.add_provider(key, peer, vec![addr()], true, t0);
        assert!(store.due_for_republish(t0).is_empty());
        let near_deadline = t0 + store.config.provider_republish_interval;
        store.mark_republished(&key, &peer, near_deadline);
        assert!(store.due_for_republish(near_deadline).is_empty());
    }

    #[test]
    fn remote_address_is_omitted_after_address_ttl_but_provider_remains() {
        let mut store = ProviderStore::new(ProviderStoreConfig {
            provider_address_ttl: Duration::from_millis(1),
            ..Default::default()
        });
        let key = Key::new(b"content");
        let peer = PeerId::random();
        let t0 = Instant::now();
        store.add_provider(key, peer, vec![addr()], false, t0);
        let later = t0 + Duration::from_secs(1);
        let providers = store.get_providers(&key, later);
        assert_eq!(providers.len(), 1);
        assert!(providers[0].addresses.is_empty());
    }
}
