//! Trait for pluggable peer-to-peer (P2P) networking.
//!
//! Main trait: [`Network`].

use crate::messages::Message;
use crate::types::basic::PrincipalId;
use crate::types::principals::Principal;

/// Trait for pluggable peer-to-peer (P2P) networking.
///
/// Implementations carry typed [`Message`]s between principals. An implementation that puts
/// messages on an actual wire should serialize them with [`encode`](crate::messages::encode) and
/// parse received buffers with [`decode`](crate::messages::decode), which enforces the maximum
/// message size before reading any field.
///
/// Self-delivery is not the network's job: the library short-circuits messages a replica addresses
/// to itself directly into its inbound path, bypassing serialization entirely.
pub trait Network: Clone + Send {
    /// Inform the network provider of the full principal set on wake-up.
    fn init_principals(&mut self, principals: Vec<Principal>);

    /// Inform the network provider of a principal admitted by a reconfiguration request. The
    /// provider may want to establish a connection to the new principal.
    fn add_principal(&mut self, principal: Principal);

    /// Send a message to all replicas without blocking. Delivery to the sending replica itself is
    /// not required.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified principal (replica or client) without blocking.
    fn send(&mut self, peer: PrincipalId, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available
    /// now.
    fn recv(&mut self) -> Option<(PrincipalId, Message)>;
}
