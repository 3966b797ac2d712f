// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-connection protocol driver (component C4, client/server RPC
//! dispatch). Implements [`libp2p_swarm::ConnectionHandler`]: each inbound
//! stream is read once and handed to the coordinator for a single
//! response (§4.4.1: one request, one response per stream); outbound
//! requests run concurrently, bounded by [`MAX_CONCURRENT_STREAMS`] (the
//! α bound itself is enforced one layer up, by [`crate::query`]). Mode
//! gating (§4.4.3) refuses inbound streams outright while the local node
//! is in client mode, without reading them.

use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use futures_bounded::FuturesTupleSet;
use libp2p_identity::PeerId;
use libp2p_swarm::handler::{
    ConnectionEvent, ConnectionHandler, ConnectionHandlerEvent, FullyNegotiatedInbound,
    FullyNegotiatedOutbound,
};
use libp2p_swarm::{StreamProtocol, SubstreamProtocol};

use crate::codec::{NegotiatedFramed, Protocol};
use crate::error::TransportError;
use crate::proto;

/// Correlates an outbound request with the response/error the behaviour
/// eventually receives for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutboundRequestId(pub(crate) u64);

/// Commands the coordinator sends down to a single connection.
#[derive(Debug)]
pub enum HandlerIn {
    /// Open a new stream and send `message`, expecting exactly one response.
    SendRequest { request_id: OutboundRequestId, message: proto::Message },
    /// The answer to the oldest still-open inbound request on this
    /// connection (§4.4.1: at most one request per stream, so FIFO order
    /// is sufficient to pair responses with the stream that asked).
    Respond { message: proto::Message },
    /// Whether this connection should currently accept inbound streams
    /// (§4.4.3: client mode refuses without processing).
    SetAcceptInbound(bool),
}

/// Events the handler reports up to the coordinator.
#[derive(Debug)]
pub enum HandlerEvent {
    /// An inbound request has been fully read; the behaviour must answer
    /// with `HandlerIn::Respond` (dispatch logic — §4.4.2's table — lives
    /// in [`crate::behaviour`], not here).
    Request { message: proto::Message },
    Response { request_id: OutboundRequestId, message: proto::Message },
    OutboundFailure { request_id: OutboundRequestId, error: TransportError },
    /// An inbound stream arrived while not accepting inbound; closed
    /// without processing per §4.4.3.
    InboundRefused,
}

const MAX_CONCURRENT_STREAMS: usize = 32;

type Stream = libp2p_swarm::Stream;

pub(crate) struct Handler {
    remote_peer: PeerId,
    protocol_name: StreamProtocol,
    query_timeout: Duration,
    accept_inbound: bool,
    pending_events: Vec<ConnectionHandlerEvent<Protocol, OutboundRequestId, HandlerEvent>>,
    /// Messages waiting for their negotiated outbound stream to arrive.
    outbound_pending: Vec<(OutboundRequestId, proto::Message)>,
    outbound: FuturesTupleSet<Result<proto::Message, TransportError>, OutboundRequestId>,
    /// Reads the request off a freshly negotiated inbound stream and hands
    /// the still-open stream back, so it can be written to once the
    /// coordinator produces a response.
    inbound_reads: FuturesTupleSet<Result<(NegotiatedFramed<Stream>, proto::Message), TransportError>, ()>,
    /// Inbound streams whose request has been read and forwarded to the
    /// coordinator, awaiting `HandlerIn::Respond`. FIFO: §4.4.1 never
    /// interleaves messages on a stream, so pairing by arrival order is
    /// sufficient for the "at most a few concurrent inbound RPCs per
    /// connection" case this handler is built for.
    open_inbound: Vec<NegotiatedFramed<Stream>>,
    /// Fire-and-forget writers for responses already handed off; failures
    /// here never surface anywhere (the requester simply times out).
    inbound_writes: FuturesTupleSet<(), ()>,
}

impl Handler {
    pub(crate) fn new(remote_peer: PeerId, protocol_name: StreamProtocol, query_timeout: Duration) -> Self {
        Self {
            remote_peer,
            protocol_name,
            query_timeout,
            accept_inbound: true,
            pending_events: Vec::new(),
            outbound_pending: Vec::new(),
            outbound: FuturesTupleSet::new(query_timeout, MAX_CONCURRENT_STREAMS),
            inbound_reads: FuturesTupleSet::new(Duration::from_secs(60), MAX_CONCURRENT_STREAMS),
            open_inbound: Vec::new(),
            inbound_writes: FuturesTupleSet::new(Duration::from_secs(10), MAX_CONCURRENT_STREAMS),
        }
    }

    /// Set the initial inbound-acceptance state for a freshly created
    /// handler, before it is handed to `libp2p_swarm` (§4.4.3). Connections
    /// that change mode afterwards are updated via `HandlerIn::SetAcceptInbound`.
    pub(crate) fn set_accept_inbound(&mut self, accept: bool) {
        self.accept_inbound = accept;
    }
}

impl ConnectionHandler for Handler {
    type FromBehaviour = HandlerIn;
    type ToBehaviour = HandlerEvent;
    type InboundProtocol = Protocol;
    type OutboundProtocol = Protocol;
    type InboundOpenInfo = ();
    type OutboundOpenInfo = OutboundRequestId;

    fn listen_protocol(&self) -> SubstreamProtocol<Self::InboundProtocol, Self::InboundOpenInfo> {
        SubstreamProtocol::new(Protocol::new(self.protocol_name.clone(), self.accept_inbound), ())
    }

    fn on_behaviour_event(&mut self, event: Self::FromBehaviour) {
        match event {
            HandlerIn::SendRequest { request_id, message } => {
                self.outbound_pending.push((request_id, message));
                self.pending_events.push(ConnectionHandlerEvent::OutboundSubstreamRequest {
                    protocol: SubstreamProtocol::new(Protocol::new(self.protocol_name.clone(), true), request_id),
                });
            }
            HandlerIn::Respond { message } => {
                if !self.open_inbound.is_empty() {
                    let mut stream = self.open_inbound.remove(0);
                    let fut = async move {
                        let _ = stream.send(message).await;
                        let _ = stream.close().await;
                    };
                    let _ = self.inbound_writes.try_push(fut, ());
                }
            }
            HandlerIn::SetAcceptInbound(accept) => {
                self.accept_inbound = accept;
            }
        }
    }

    fn poll(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<ConnectionHandlerEvent<Self::OutboundProtocol, Self::OutboundOpenInfo, Self::ToBehaviour>> {
        if let Some(ev) = self.pending_events.pop() {
            return Poll::Ready(ev);
        }

        if let Poll::Ready((request_id, result)) = self.outbound.poll_unpin(cx) {
            let event = match result {
                Ok(Ok(message)) => HandlerEvent::Response { request_id, message },
                Ok(Err(error)) => HandlerEvent::OutboundFailure { request_id, error },
                Err(_timeout) => HandlerEvent::OutboundFailure {
                    request_id,
                    error: TransportError::Timeout { peer: self.remote_peer },
                },
            };
            return Poll::Ready(ConnectionHandlerEvent::NotifyBehaviour(event));
        }

        if let Poll::Ready((_, result)) = self.inbound_reads.poll_unpin(cx) {
            match result {
                Ok(Ok((stream, message))) => {
                    self.open_inbound.push(stream);
                    return Poll::Ready(ConnectionHandlerEvent::NotifyBehaviour(HandlerEvent::Request { message }));
                }
                _ => return Poll::Pending,
            }
        }

        let _ = self.inbound_writes.poll_unpin(cx);

        Poll::Pending
    }

    fn on_connection_event(
        &mut self,
        event: ConnectionEvent<
            '_,
            Self::InboundProtocol,
            Self::OutboundProtocol,
            Self::InboundOpenInfo,
            Self::OutboundOpenInfo,
        >,
    ) {
        match event {
            ConnectionEvent::FullyNegotiatedInbound(FullyNegotiatedInbound { protocol, .. }) => {
                if !self.accept_inbound {
                    // §4.4.3: close without processing, no peer is recorded.
                    drop(protocol);
                    self.pending_events
                        .push(ConnectionHandlerEvent::NotifyBehaviour(HandlerEvent::InboundRefused));
                    return;
                }
                let peer = self.remote_peer;
                let fut = async move {
                    let mut stream = protocol;
                    match stream.next().await {
                        Some(Ok(request)) => Ok((stream, request)),
                        _ => Err(TransportError::StreamReset { peer }),
                    }
                };
                let _ = self.inbound_reads.try_push(fut, ());
            }
            ConnectionEvent::FullyNegotiatedOutbound(FullyNegotiatedOutbound { protocol, info }) => {
                let Some(idx) = self.outbound_pending.iter().position(|(id, _)| *id == info) else {
                    return;
                };
                let (_, message) = self.outbound_pending.remove(idx);
                let peer = self.remote_peer;
                let fut = async move {
                    let mut stream = protocol;
                    if stream.send(message).await.is_err() {
                        return Err(TransportError::StreamReset { peer });
                    }
                    match stream.next().await {
                        Some(Ok(response)) => Ok(response),
                        _ => Err(TransportError::StreamReset { peer }),
                    }
                };
                let _ = self.outbound.try_push(fut, info);
            }
            _ => {}
        }
    }
}
