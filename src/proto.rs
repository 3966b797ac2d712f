// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Hand-written `quick-protobuf` bindings for the wire schema in §6.1.
//!
//! These mirror what `pb-rs` would generate from a `dht.proto` carrying
//! exactly the fields §6.1 lists, including the stable field numbers
//! (1/2/3/8/9/10) and the two extension fields for signed peer records.
//! Unknown fields are skipped via `read_unknown` per §6.1's "ignore
//! unrecognised fields" rule.

use quick_protobuf::sizeofs::{sizeof_len, sizeof_varint};
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Result as QpResult, Writer, WriterBackend};

use crate::error::CodecError;

/// Field number carrying the sender's own signed peer record on a
/// [`Message`] (the "(ext) sender_record" field in §6.1).
const FIELD_SENDER_RECORD: u32 = 20;
/// Field number carrying a [`Peer`]'s signed peer record.
const FIELD_PEER_SIGNED_RECORD: u32 = 4;

/// The five RPC kinds plus `PING`, tagged exactly as §3 "RPC Message"
/// specifies — these numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

impl MessageType {
    fn from_i32(v: i32) -> Result<Self, CodecError> {
        match v {
            0 => Ok(Self::PutValue),
            1 => Ok(Self::GetValue),
            2 => Ok(Self::AddProvider),
            3 => Ok(Self::GetProviders),
            4 => Ok(Self::FindNode),
            5 => Ok(Self::Ping),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Ping
    }
}

/// A stored value record on the wire: `(key, value, time_received)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// RFC3339 timestamp string, empty if not yet set.
    pub time_received: String,
}

impl<'a> MessageRead<'a> for Record {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> QpResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.key = r.read_bytes(bytes)?.to_vec(),
                Ok(18) => msg.value = r.read_bytes(bytes)?.to_vec(),
                Ok(42) => msg.time_received = r.read_string(bytes)?.to_string(),
                Ok(tag) => r.read_unknown(bytes, tag)?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Record {
    fn get_size(&self) -> usize {
        let mut size = 0;
        if !self.key.is_empty() {
            size += 1 + sizeof_len(self.key.len());
        }
        if !self.value.is_empty() {
            size += 1 + sizeof_len(self.value.len());
        }
        if !self.time_received.is_empty() {
            size += 1 + sizeof_len(self.time_received.len());
        }
        size
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> QpResult<()> {
        if !self.key.is_empty() {
            w.write_with_tag(10, |w| w.write_bytes(&self.key))?;
        }
        if !self.value.is_empty() {
            w.write_with_tag(18, |w| w.write_bytes(&self.value))?;
        }
        if !self.time_received.is_empty() {
            w.write_with_tag(42, |w| w.write_string(&self.time_received))?;
        }
        Ok(())
    }
}

/// A peer carried inside `closer_peers`/`provider_peers`: id, addresses in
/// their raw multiaddr byte form, and an optional signed peer record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Vec<u8>,
    pub addrs: Vec<Vec<u8>>,
    pub signed_record: Option<Vec<u8>>,
}

impl<'a> MessageRead<'a> for Peer {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> QpResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            let tag = r.next_tag(bytes);
            match tag {
                Ok(10) => msg.id = r.read_bytes(bytes)?.to_vec(),
                Ok(18) => msg.addrs.push(r.read_bytes(bytes)?.to_vec()),
                Ok(t) if t == (FIELD_PEER_SIGNED_RECORD << 3 | 2) => {
                    msg.signed_record = Some(r.read_bytes(bytes)?.to_vec());
                }
                Ok(t) => r.read_unknown(bytes, t)?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Peer {
    fn get_size(&self) -> usize {
        let mut size = 0;
        if !self.id.is_empty() {
            size += 1 + sizeof_len(self.id.len());
        }
        size += self.addrs.iter().map(|a| 1 + sizeof_len(a.len())).sum::<usize>();
        if let Some(sr) = &self.signed_record {
            size += sizeof_varint((FIELD_PEER_SIGNED_RECORD << 3 | 2) as u64) + sizeof_len(sr.len());
        }
        size
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> QpResult<()> {
        if !self.id.is_empty() {
            w.write_with_tag(10, |w| w.write_bytes(&self.id))?;
        }
        for addr in &self.addrs {
            w.write_with_tag(18, |w| w.write_bytes(addr))?;
        }
        if let Some(sr) = &self.signed_record {
            w.write_with_tag(FIELD_PEER_SIGNED_RECORD << 3 | 2, |w| w.write_bytes(sr))?;
        }
        Ok(())
    }
}

/// The top-level RPC message of §3/§6.1: a tagged union carrying only the
/// fields relevant to its `msg_type`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: i32,
    pub key: Vec<u8>,
    pub record: Option<Record>,
    pub closer_peers: Vec<Peer>,
    pub provider_peers: Vec<Peer>,
    /// Sent as 0, ignored on receive, per §6.1.
    pub cluster_level: i32,
    pub sender_record: Option<Vec<u8>>,
}

impl Message {
    pub fn message_type(&self) -> Result<MessageType, CodecError> {
        MessageType::from_i32(self.msg_type)
    }
}

impl<'a> MessageRead<'a> for Message {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> QpResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.msg_type = r.read_int32(bytes)?,
                Ok(18) => msg.key = r.read_bytes(bytes)?.to_vec(),
                Ok(26) => msg.record = Some(r.read_message::<Record>(bytes)?),
                Ok(66) => msg.closer_peers.push(r.read_message::<Peer>(bytes)?),
                Ok(74) => msg.provider_peers.push(r.read_message::<Peer>(bytes)?),
                Ok(80) => msg.cluster_level = r.read_int32(bytes)?,
                Ok(t) if t == (FIELD_SENDER_RECORD << 3 | 2) => {
                    msg.sender_record = Some(r.read_bytes(bytes)?.to_vec());
                }
                Ok(t) => r.read_unknown(bytes, t)?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Message {
    fn get_size(&self) -> usize {
        let mut size = 0;
        if self.msg_type != 0 {
            size += 1 + sizeof_varint(self.msg_type as u64);
        }
        if !self.key.is_empty() {
            size += 1 + sizeof_len(self.key.len());
        }
        if let Some(record) = &self.record {
            size += 1 + sizeof_len(record.get_size());
        }
        size += self
            .closer_peers
            .iter()
            .map(|p| 2 + sizeof_len(p.get_size()))
            .sum::<usize>();
        size += self
            .provider_peers
            .iter()
            .map(|p| 2 + sizeof_len(p.get_size()))
            .sum::<usize>();
        if self.cluster_level != 0 {
            size += 1 + sizeof_varint(self.cluster_level as u64);
        }
        if let Some(sr) = &self.sender_record {
            size += sizeof_varint((FIELD_SENDER_RECORD << 3 | 2) as u64) + sizeof_len(sr.len());
        }
        size
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> QpResult<()> {
        if self.msg_type != 0 {
            w.write_with_tag(8, |w| w.write_int32(self.msg_type))?;
        }
        if !self.key.is_empty() {
            w.write_with_tag(18, |w| w.write_bytes(&self.key))?;
        }
        if let Some(record) = &self.record {
            w.write_with_tag(26, |w| w.write_message(record))?;
        }
        for peer in &self.closer_peers {
            w.write_with_tag(66, |w| w.write_message(peer))?;
        }
        for peer in &self.provider_peers {
            w.write_with_tag(74, |w| w.write_message(peer))?;
        }
        if self.cluster_level != 0 {
            w.write_with_tag(80, |w| w.write_int32(self.cluster_level))?;
        }
        if let Some(sr) = &self.sender_record {
            w.write_with_tag(FIELD_SENDER_RECORD << 3 | 2, |w| w.write_bytes(sr))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_protobuf::{BytesReader, Writer};

    fn round_trip(msg: &Message) -> Message {
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            msg.write_message(&mut writer).unwrap();
        }
        let mut reader = BytesReader::from_bytes(&buf);
        Message::from_reader(&mut reader, &buf).unwrap()
    }

    #[test]
    fn find_node_round_trips() {
        let msg = Message {
            msg_type: MessageType::FindNode as i32,
            key: b"target-key".to_vec(),
            closer_peers: vec![Peer {
                id: b"peer-id".to_vec(),
                addrs: vec![b"/ip4/127.0.0.1/tcp/4001".to_vec()],
                signed_record: Some(b"envelope".to_vec()),
            }],
            ..Default::default()
        };
        let decoded = round_trip(&msg);
        assert_eq!(decoded, msg);
        assert_eq!(decoded.message_type().unwrap(), MessageType::FindNode);
    }

    #[test]
    fn put_value_with_record_round_trips() {
        let msg = Message {
            msg_type: MessageType::PutValue as i32,
            key: b"/pk/abc".to_vec(),
            record: Some(Record {
                key: b"/pk/abc".to_vec(),
                value: b"payload".to_vec(),
                time_received: "2026-01-01T00:00:00Z".to_string(),
            }),
            sender_record: Some(b"my-envelope".to_vec()),
            ..Default::default()
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn unknown_fields_are_ignored_not_fatal() {
        // A message with an appended unknown varint field (tag 200, wire
        // type 0) must still decode the known fields.
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            writer.write_with_tag(8, |w| w.write_int32(MessageType::Ping as i32)).unwrap();
            writer.write_with_tag(200 << 3, |w| w.write_int32(42)).unwrap();
        }
        let mut reader = BytesReader::from_bytes(&buf);
        let decoded = Message::from_reader(&mut reader, &buf).unwrap();
        assert_eq!(decoded.message_type().unwrap(), MessageType::Ping);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let msg = Message {
            msg_type: 99,
            ..Default::default()
        };
        assert!(msg.message_type().is_err());
    }
}
