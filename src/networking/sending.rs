//! Functions and types for sending messages into the P2P network.

use std::sync::mpsc::Sender;

use crate::messages::{Message, ProtocolMessage};
use crate::requests::messages::RequestMessage;
use crate::types::basic::PrincipalId;
use crate::types::principals::Principal;

use super::network::Network;
use super::receiving::Inbound;

/// A sending end for messages, wrapping the user-provided [`Network`].
///
/// `SenderHandle` is where self-sends short-circuit: a broadcast is handed to the network for the
/// peers and simultaneously pushed onto the local dispatch channel, and a unicast addressed to this
/// very principal never touches the network at all. Handlers therefore treat their own messages
/// exactly like everyone else's, without the network having to loop anything back.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    me: PrincipalId,
    network: N,
    loopback: Sender<(PrincipalId, Inbound)>,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(
        me: PrincipalId,
        network: N,
        loopback: Sender<(PrincipalId, Inbound)>,
    ) -> SenderHandle<N> {
        SenderHandle {
            me,
            network,
            loopback,
        }
    }

    /// Broadcast a protocol message to all replicas, this one included.
    pub(crate) fn broadcast_protocol(&mut self, msg: impl Into<ProtocolMessage>) {
        let msg = msg.into();
        self.network
            .broadcast(Message::ProtocolMessage(msg.clone()));
        let _ = self.loopback.send((self.me, Inbound::Protocol(msg)));
    }

    /// Send a protocol message to one replica. A message to self bypasses the network.
    pub(crate) fn send_protocol(&mut self, peer: PrincipalId, msg: impl Into<ProtocolMessage>) {
        let msg = msg.into();
        if peer == self.me {
            let _ = self.loopback.send((self.me, Inbound::Protocol(msg)));
        } else {
            self.network.send(peer, Message::ProtocolMessage(msg));
        }
    }

    /// Broadcast request traffic (requests being forwarded, fetches) to all replicas. Not looped
    /// back: a replica never needs to serve its own fetch.
    pub(crate) fn broadcast_request(&mut self, msg: impl Into<RequestMessage>) {
        self.network.broadcast(Message::RequestMessage(msg.into()));
    }

    /// Send any message to one principal. A message to self bypasses the network where the
    /// dispatch loop consumes it, and is dropped otherwise (a replica never consumes e.g. its own
    /// replies).
    pub(crate) fn send_message(&mut self, peer: PrincipalId, msg: Message) {
        if peer == self.me {
            match msg {
                Message::ProtocolMessage(p_msg) => {
                    let _ = self.loopback.send((self.me, Inbound::Protocol(p_msg)));
                }
                Message::RequestMessage(r_msg) => {
                    let _ = self.loopback.send((self.me, Inbound::Request(r_msg)));
                }
                Message::ReplyMessage(_) | Message::LogSyncMessage(_) => (),
            }
        } else {
            self.network.send(peer, msg);
        }
    }

    /// Inform the network provider of a principal admitted by reconfiguration.
    pub(crate) fn add_principal(&mut self, principal: Principal) {
        self.network.add_principal(principal);
    }
}
