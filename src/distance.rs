// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! 256-bit keys and XOR distance (component C1).
//!
//! Every routable thing in the DHT — a peer, a value key, a content id — is
//! reduced to a [`Key`]: the SHA-256 digest of some opaque identifier bytes.
//! Keys are compared by XOR distance, interpreted as an unsigned 256-bit
//! integer.

use sha2::{Digest, Sha256};
use uint::construct_uint;

construct_uint! {
    /// An unsigned 256-bit integer, used to interpret XOR distances
    /// numerically so they can be totally ordered.
    pub struct U256(4);
}

/// A 256-bit key in the Kademlia keyspace, derived as `SHA-256(id)` over an
/// opaque identifier bytestring (a peer id, a record key, a content id...).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl Key {
    /// Hash arbitrary identifier bytes into a key.
    pub fn new(id: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(id.as_ref());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Wrap an already-hashed 32-byte digest directly, skipping re-hashing.
    /// Used when a key was received on the wire rather than derived locally.
    pub fn from_raw_digest(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another key, `d(a,b) = a XOR b`.
    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(U256::from_big_endian(&out))
    }

    /// Common-prefix length in bits between two keys, `0..=256`.
    pub fn cpl(&self, other: &Key) -> u32 {
        self.distance(other).leading_zeros()
    }

    /// Bucket index this key would occupy in a routing table local to
    /// `local`: `min(cpl(local, self), MAX_BUCKETS - 1)`.
    ///
    /// Returns `None` if `self == local` (a key has no distance to itself
    /// and does not belong in any bucket).
    pub fn bucket_index(&self, local: &Key) -> Option<usize> {
        let cpl = self.cpl(local);
        if cpl as usize >= 256 {
            None
        } else {
            Some((cpl as usize).min(crate::MAX_BUCKETS - 1))
        }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({:02x}{:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// XOR distance between two [`Key`]s, ordered numerically (smaller = closer).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(U256);

impl Distance {
    /// Number of leading zero bits, i.e. the common prefix length of the
    /// two keys this distance was computed from.
    pub fn leading_zeros(&self) -> u32 {
        self.0.leading_zeros()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_for_self() {
        let a = Key::new(b"alice");
        let b = Key::new(b"bob");
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_is_totally_ordered() {
        let target = Key::new(b"target");
        let near = Key::new(b"near-ish");
        let far = Key::new(b"completely different identifier");
        let d_near = target.distance(&near);
        let d_far = target.distance(&far);
        assert!(d_near.cmp(&d_far) != std::cmp::Ordering::Equal || d_near == d_far);
    }

    #[test]
    fn bucket_index_is_none_for_local_key() {
        let local = Key::new(b"self");
        assert_eq!(local.bucket_index(&local), None);
    }

    #[test]
    fn bucket_index_is_capped_at_max_buckets_minus_one() {
        let local = Key::new(b"local-peer");
        let other = Key::new(b"some-other-peer");
        let idx = other.bucket_index(&local).unwrap();
        assert!(idx < crate::MAX_BUCKETS);
    }

    #[test]
    fn cpl_matches_leading_zero_bits_of_xor() {
        // Two keys differing only in their last bit share a 255-bit prefix.
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[31] = 0b0000_0000;
        b[31] = 0b0000_0001;
        let ka = Key::from_raw_digest(a);
        let kb = Key::from_raw_digest(b);
        assert_eq!(ka.cpl(&kb), 255);
    }
}
