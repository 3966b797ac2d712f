// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Record types shared by the value store, provider store, and wire
//! protocol (§3 "Data Model").

use std::time::Instant;

use libp2p_core::Multiaddr;
use libp2p_identity::PeerId;
use web_time::SystemTime;

/// A value record: `(key, value, time_received)`. The key's leading
/// `/<namespace>/` segment selects a [`crate::Validator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Wall-clock time the record was received, carried on the wire as an
    /// RFC3339 string (see `proto::Record`). `None` for a record that has
    /// not yet been sent or stored (e.g. freshly constructed by a caller
    /// about to `put_value`).
    pub time_received: Option<SystemTime>,
    /// The peer that published this record, when known (the local peer for
    /// locally-originated writes, the RPC sender for entry-correction
    /// rewrites). Not part of the wire schema; tracked locally for
    /// diagnostics only.
    pub publisher: Option<PeerId>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: None,
            publisher: None,
        }
    }

    /// The `/<namespace>/` prefix of this record's key, if any.
    pub fn namespace(&self) -> Option<&[u8]> {
        if self.key.first() != Some(&b'/') {
            return None;
        }
        let rest = &self.key[1..];
        let end = rest.iter().position(|b| *b == b'/')?;
        Some(&rest[..end])
    }
}

/// A [`Record`] together with the peer that returned it during a lookup —
/// used by `GET_VALUE` to accumulate candidate records before the
/// namespace validator picks the winner.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub record: Record,
    pub peer: Option<PeerId>,
}

/// A provider advertisement: a peer claiming to hold content addressed by
/// `content_key`, plus the addresses it can be reached on and when this
/// record was received.
#[derive(Clone, Debug)]
pub struct ProviderRecord {
    pub provider: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub received_at: Instant,
    /// `true` for providers advertised by this node itself; local records
    /// are republished on a schedule rather than expiring from this node's
    /// own perspective (remote peers still expire them on their own clock).
    pub is_local: bool,
}
