// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Stream framing (§4.4.1): `<uvarint length><message bytes>` over an
//! [`asynchronous_codec::Framed`] stream.
//!
//! [`quick_protobuf_codec::Codec`] already implements exactly this framing
//! for any `quick_protobuf` message type, so there is no framing logic to
//! re-derive here — this module just fixes the message type and the
//! maximum frame size.

use libp2p_core::upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade};
use libp2p_swarm::StreamProtocol;

use crate::proto;

/// Upper bound on a single encoded [`proto::Message`]. Generous enough for
/// a `FIND_NODE` response carrying a full k=20 `closer_peers` list with
/// addresses and signed records, while still bounding per-message memory.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub(crate) type Codec = quick_protobuf_codec::Codec<proto::Message>;

pub(crate) fn codec() -> Codec {
    quick_protobuf_codec::Codec::new(MAX_MESSAGE_SIZE)
}

/// The negotiated substream protocol: a single `/ipfs/kad/1.0.0`-labelled
/// stream framed with [`codec`]. Inbound and outbound upgrades are
/// identical — the request/response discipline lives in
/// [`crate::handler`], not in the upgrade itself.
///
/// `enabled` gates whether this upgrade advertises the protocol at all
/// (§4.4.3): a client-mode node's [`crate::handler::Handler`] hands out a
/// disabled upgrade, so identify-style protocol introspection never sees
/// `/ipfs/kad/1.0.0` listed for that connection, matching a real peer that
/// has simply chosen not to speak the protocol rather than one that speaks
/// it and then refuses.
#[derive(Debug, Clone)]
pub(crate) struct Protocol {
    pub(crate) protocol_name: StreamProtocol,
    pub(crate) enabled: bool,
}

impl Protocol {
    pub(crate) fn new(protocol_name: StreamProtocol, enabled: bool) -> Self {
        Self { protocol_name, enabled }
    }
}

impl libp2p_core::UpgradeInfo for Protocol {
    type Info = StreamProtocol;
    type InfoIter = either::Either<std::iter::Once<Self::Info>, std::iter::Empty<Self::Info>>;

    fn protocol_info(&self) -> Self::InfoIter {
        if self.enabled {
            either::Either::Left(std::iter::once(self.protocol_name.clone()))
        } else {
            either::Either::Right(std::iter::empty())
        }
    }
}

pub(crate) type NegotiatedFramed<S> = asynchronous_codec::Framed<S, Codec>;

impl<S> InboundConnectionUpgrade<S> for Protocol
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    type Output = NegotiatedFramed<S>;
    type Error = std::io::Error;
    type Future = futures::future::Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_inbound(self, socket: S, _info: Self::Info) -> Self::Future {
        futures::future::ready(Ok(asynchronous_codec::Framed::new(socket, codec())))
    }
}

impl<S> OutboundConnectionUpgrade<S> for Protocol
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    type Output = NegotiatedFramed<S>;
    type Error = std::io::Error;
    type Future = futures::future::Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_outbound(self, socket: S, _info: Self::Info) -> Self::Future {
        futures::future::ready(Ok(asynchronous_codec::Framed::new(socket, codec())))
    }
}
