// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The value store (§4.3.1): a map from key to `(record, received_at)` with
//! validator-gated writes and lazy TTL expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::record::Record;
use crate::validator::ValidatorRegistry;

/// Outcome of a `put`, mirroring §4.3.1's three-way result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Ok,
    InvalidRecord,
    /// A prior record exists and the validator's `select` did not prefer
    /// the new one; the store is unchanged.
    NotBetter,
}

#[derive(Clone, Debug)]
struct Entry {
    record: Record,
    received_at: Instant,
}

/// Configuration for the value store's capacity and expiry policy.
#[derive(Debug, Clone)]
pub struct ValueStoreConfig {
    /// §6.3 `value_ttl`, default 24h.
    pub value_ttl: Duration,
    /// Upper bound on distinct keys held at once; oldest-received entries
    /// are evicted first when exceeded by an accepted write.
    pub max_records: usize,
}

impl Default for ValueStoreConfig {
    fn default() -> Self {
        Self {
            value_ttl: Duration::from_secs(24 * 60 * 60),
            max_records: 1024,
        }
    }
}

/// In-memory value store, keyed by exact byte equality on [`Record::key`].
#[derive(Debug)]
pub struct ValueStore {
    config: ValueStoreConfig,
    entries: HashMap<Vec<u8>, Entry>,
}

impl ValueStore {
    pub fn new(config: ValueStoreConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    fn is_expired(entry: &Entry, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.received_at) >= ttl
    }

    /// §4.3.1 `put`: validate, compare against any existing record via the
    /// namespace validator's `select`, and store only if strictly better.
    pub fn put(&mut self, mut record: Record, validators: &ValidatorRegistry, now: Instant) -> PutOutcome {
        if validators.validate(&record.key, &record.value).is_err() {
            return PutOutcome::InvalidRecord;
        }

        if let Some(existing) = self.entries.get(&record.key) {
            if !Self::is_expired(existing, self.config.value_ttl, now) {
                let candidates: [&[u8]; 2] = [existing.record.value.as_slice(), record.value.as_slice()];
                let winner = validators
                    .select(&record.key, &candidates)
                    .unwrap_or(0);
                if winner != 1 {
                    return PutOutcome::NotBetter;
                }
            }
        } else if self.entries.len() >= self.config.max_records {
            self.evict_oldest();
        }

        record.time_received.get_or_insert_with(web_time::SystemTime::now);
        self.entries.insert(
            record.key.clone(),
            Entry { record, received_at: now },
        );
        PutOutcome::Ok
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.received_at)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }

    /// §4.3.1 `get`: present and not expired, else `None`. Expired entries
    /// are swept lazily on access.
    pub fn get(&mut self, key: &[u8], now: Instant) -> Option<Record> {
        let expired = matches!(
            self.entries.get(key),
            Some(entry) if Self::is_expired(entry, self.config.value_ttl, now)
        );
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.record.clone())
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    pub fn has(&self, key: &[u8], now: Instant) -> bool {
        matches!(
            self.entries.get(key),
            Some(entry) if !Self::is_expired(entry, self.config.value_ttl, now)
        )
    }

    /// Periodic sweep of expired entries; `get`/`has` already do this
    /// lazily, this is for callers (the stale-sweep background job) that
    /// want expiry to free memory even for keys nobody reads again.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let ttl = self.config.value_ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| !Self::is_expired(e, ttl, now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ValidatorRegistry {
        ValidatorRegistry::new()
    }

    fn pk_record(value: &[u8]) -> Record {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(value);
        let mut key = b"/pk/".to_vec();
        key.extend_from_slice(&digest);
        Record::new(key, value.to_vec())
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut store = ValueStore::new(ValueStoreConfig::default());
        let validators = registry();
        let record = pk_record(b"hello");
        let now = Instant::now();
        assert_eq!(store.put(record.clone(), &validators, now), PutOutcome::Ok);
        let got = store.get(&record.key, now).unwrap();
        assert_eq!(got.value, record.value);
    }

    #[test]
    fn invalid_record_rejected() {
        let mut store = ValueStore::new(ValueStoreConfig::default());
        let validators = registry();
        let bad = Record::new(b"/pk/not-a-digest".to_vec(), b"value".to_vec());
        assert_eq!(
            store.put(bad, &validators, Instant::now()),
            PutOutcome::InvalidRecord
        );
    }

    #[test]
    fn expired_record_is_not_returned() {
        let mut store = ValueStore::new(ValueStoreConfig {
            value_ttl: Duration::from_millis(1),
            ..Default::default()
        });
        let validators = registry();
        let record = pk_record(b"soon-gone");
        let t0 = Instant::now();
        store.put(record.clone(), &validators, t0);
        let later = t0 + Duration::from_secs(1);
        assert_eq!(store.get(&record.key, later), None);
    }

    #[test]
    fn not_better_preserves_existing_record() {
        // `select` defaults to index 0 (existing) unless a validator says
        // otherwise; the built-in pk validator only ever accepts one value
        // per key so a second distinct value for the same key is simply
        // invalid, not "not better". Use a custom always-keep-first
        // validator namespace to exercise the NotBetter path directly via
        // the registry's default behaviour on unknown validators is not
        // reachable here, so this test targets ValueStore::put logic using
        // the pk validator's single-valid-value property instead.
        let mut store = ValueStore::new(ValueStoreConfig::default());
        let validators = registry();
        let record = pk_record(b"value");
        let now = Instant::now();
        assert_eq!(store.put(record.clone(), &validators, now), PutOutcome::Ok);
        // Re-putting the identical record is selected as not strictly better
        // (select([existing, new]) picks index 0 for identical values).
        assert_eq!(store.put(record, &validators, now), PutOutcome::NotBetter);
    }
}
