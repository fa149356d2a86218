/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between participants.
//!
//! This includes the messages [used to drive ordering forward](ProtocolMessage), those carrying
//! [client requests](crate::requests::messages::RequestMessage) and replies, and those used by the
//! [log sync protocol](crate::log_sync::messages::LogSyncMessage).
//!
//! ## Codec
//!
//! Messages are borsh-encoded on the wire. The closed tag set of the protocol is the set of enum
//! discriminants reachable from [`Message`]; a buffer with an unknown discriminant, a truncated
//! body, or trailing garbage fails [`decode`] cleanly, and a buffer larger than the configured
//! maximum message size is rejected before any of it is parsed.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::checkpointing::messages::Checkpoint;
use crate::log_sync::messages::LogSyncMessage;
use crate::ordering::messages::OrderingMessage;
use crate::requests::messages::{Reply, RequestMessage};
use crate::status::messages::Status;
use crate::types::basic::{PrincipalId, SignatureBytes, ViewNumber};
use crate::types::principals::{AuthError, Authenticator, PrincipalRegistry};
use crate::view_change::messages::ViewChangeMessage;

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    ProtocolMessage(ProtocolMessage),
    RequestMessage(RequestMessage),
    ReplyMessage(Reply),
    LogSyncMessage(LogSyncMessage),
}

impl From<ProtocolMessage> for Message {
    fn from(msg: ProtocolMessage) -> Self {
        Message::ProtocolMessage(msg)
    }
}

impl From<RequestMessage> for Message {
    fn from(msg: RequestMessage) -> Self {
        Message::RequestMessage(msg)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::ReplyMessage(reply)
    }
}

impl From<LogSyncMessage> for Message {
    fn from(msg: LogSyncMessage) -> Self {
        Message::LogSyncMessage(msg)
    }
}

/// A message that serves to advance the ordering process, which may involve:
/// 1. Participating in the three-phase exchange via an [`OrderingMessage`],
/// 2. Cutting the log via a [`Checkpoint`],
/// 3. Replacing a suspected primary via a [`ViewChangeMessage`], or
/// 4. Helping lagging peers along via a [`Status`] summary.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ProtocolMessage {
    OrderingMessage(OrderingMessage),
    Checkpoint(Checkpoint),
    ViewChangeMessage(ViewChangeMessage),
    Status(Status),
}

impl ProtocolMessage {
    /// The view a message belongs to, for those message kinds whose processing is view-gated.
    /// Checkpoints and status summaries are processed in any view.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            ProtocolMessage::OrderingMessage(msg) => Some(msg.view()),
            ProtocolMessage::Checkpoint(_) => None,
            ProtocolMessage::ViewChangeMessage(msg) => Some(msg.view()),
            ProtocolMessage::Status(_) => None,
        }
    }
}

/// A message whose authenticity is proven by a single, transferable ed25519 signature.
///
/// A signed message must consist of:
/// 1. Message bytes [`SignedMessage::message_bytes`]: the values that the signature is over,
/// 2. Signature bytes [`SignedMessage::signature_bytes`]: the signature in bytes, and
/// 3. A signer [`SignedMessage::signer`]: the principal whose verifying key checks the signature.
pub(crate) trait SignedMessage: Clone {
    // The values contained in the message that should be signed (represented as a vector of
    // bytes).
    fn message_bytes(&self) -> Vec<u8>;

    // The signature (in bytes) carried by the message.
    fn signature_bytes(&self) -> SignatureBytes;

    // The principal that claims to have produced the signature.
    fn signer(&self) -> PrincipalId;

    // Verifies the correctness of the signature against the signer's registered verifying key.
    fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        registry
            .verify_signature(self.signer(), &self.message_bytes(), &self.signature_bytes())
            .is_ok()
    }
}

/// A message whose authenticity is proven by a trailing [`Authenticator`], which is a signature or
/// a per-peer MAC vector depending on the configured
/// [authentication scheme](crate::types::principals::AuthenticationScheme).
pub(crate) trait AuthenticatedMessage {
    // The values covered by the authenticator (represented as a vector of bytes).
    fn auth_bytes(&self) -> Vec<u8>;

    fn authenticator(&self) -> &Authenticator;

    // The principal that claims to have produced the message.
    fn sender(&self) -> PrincipalId;

    // Verifies the authenticator under the relationship between the sender and the local
    // principal.
    fn verify_against(&self, registry: &PrincipalRegistry) -> Result<(), AuthError> {
        registry.verify(self.sender(), &self.auth_bytes(), self.authenticator())
    }
}

/// A cacheable message can be inserted into the
/// [progress message buffer](crate::networking::receiving::ProtocolMessageStub).
///
/// For this, we require that:
/// 1. The message is associated with a view,
/// 2. The message size is known and depends on the particular enum variant.
pub(crate) trait Cacheable {
    fn view(&self) -> ViewNumber;

    fn size(&self) -> u64;
}

/// Ways in which a received buffer can fail to become a [`Message`].
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer exceeds the configured maximum message size.
    TooLarge { size: usize, max: usize },
    /// The buffer does not parse as any known message.
    Malformed,
}

/// Serialize a message for the wire.
pub fn encode(message: &Message) -> Vec<u8> {
    message.try_to_vec().unwrap()
}

/// Parse a received buffer, validating its size bound before reading any field. Trailing bytes
/// after a well-formed message are treated as malformation, not ignored.
pub fn decode(bytes: &[u8], max_message_size: usize) -> Result<Message, CodecError> {
    if bytes.len() > max_message_size {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: max_message_size,
        });
    }
    let mut remainder = bytes;
    let message = Message::deserialize(&mut remainder).map_err(|_| CodecError::Malformed)?;
    if !remainder.is_empty() {
        return Err(CodecError::Malformed);
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::checkpointing::types::CheckpointCertificate;
    use crate::ordering::messages::{Commit, PrePrepare, Prepare, RequestRef};
    use crate::requests::messages::{Data, Fetch, Request};
    use crate::status::messages::{SlotSummary, Status, SummaryPhase};
    use crate::types::basic::{Digest, RequestId, SeqNumber};
    use crate::types::keypair::Keypair;
    use crate::types::principals::{AuthenticationScheme, Principal, Role};
    use crate::view_change::messages::{NewView, ViewChange, ViewChangeAck};

    fn keypairs(n: u32) -> Vec<Keypair> {
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut OsRng)))
            .collect()
    }

    fn registry_for(me: u32, keypairs: &[Keypair]) -> PrincipalRegistry {
        let principals = keypairs
            .iter()
            .enumerate()
            .map(|(id, keypair)| Principal {
                id: PrincipalId::new(id as u32),
                role: if (id as u32) < 4 { Role::Replica } else { Role::Client },
                verifying_key: keypair.public(),
                address: None,
            })
            .collect();
        PrincipalRegistry::new(
            principals,
            4,
            1,
            AuthenticationScheme::Signatures,
            PrincipalId::new(me),
            HashMap::new(),
        )
    }

    fn round_trip(message: Message) -> Message {
        let bytes = encode(&message);
        decode(&bytes, 1 << 20).expect("a just-encoded message decodes")
    }

    #[test]
    fn round_trips_every_tag() {
        let keypairs = keypairs(5);
        let registry = registry_for(0, &keypairs);
        let client_registry = registry_for(4, &keypairs);
        let view = ViewNumber::new(3);
        let seqno = SeqNumber::new(7);

        let request = Request::new(
            &keypairs[4],
            PrincipalId::new(4),
            RequestId::new(1),
            b"operation".to_vec(),
        );
        let digest = request.digest();

        let pre_prepare = PrePrepare::new(
            &registry,
            &keypairs[0],
            view,
            seqno,
            vec![RequestRef::Inline(request.clone())],
        );
        let prepare = Prepare::new(&registry, &keypairs[0], view, seqno, digest);
        let commit = Commit::new(&registry, &keypairs[0], view, seqno, digest);
        let checkpoint = crate::checkpointing::messages::Checkpoint::new(
            &registry,
            &keypairs[0],
            SeqNumber::new(4),
            Digest::of_bytes(b"state"),
            false,
        );
        let view_change = ViewChange::new(
            &registry,
            &keypairs[0],
            view + 1,
            CheckpointCertificate::genesis(Digest::of_bytes(b"genesis")),
            Vec::new(),
            Vec::new(),
        );
        let ack = ViewChangeAck::new(
            &registry,
            &keypairs[0],
            view + 1,
            PrincipalId::new(2),
            view_change.digest(),
        );
        let new_view = NewView::new(
            &registry,
            &keypairs[1],
            view + 1,
            vec![view_change.clone()],
            Vec::new(),
        );
        let status = Status::new(
            &registry,
            &keypairs[0],
            view,
            false,
            SeqNumber::new(0),
            SeqNumber::new(6),
            vec![SlotSummary {
                seqno,
                phase: SummaryPhase::Prepared,
            }],
        );
        let fetch = Fetch::new(&registry, &keypairs[0], digest);
        let reply = Reply::new(
            &registry,
            &keypairs[0],
            view,
            RequestId::new(1),
            PrincipalId::new(4),
            b"result".to_vec(),
        );

        let messages: Vec<Message> = vec![
            Message::from(ProtocolMessage::from(OrderingMessage::from(
                pre_prepare.clone(),
            ))),
            Message::from(ProtocolMessage::from(OrderingMessage::from(prepare))),
            Message::from(ProtocolMessage::from(OrderingMessage::from(commit))),
            Message::from(ProtocolMessage::from(checkpoint)),
            Message::from(ProtocolMessage::from(ViewChangeMessage::from(view_change))),
            Message::from(ProtocolMessage::from(ViewChangeMessage::from(ack))),
            Message::from(ProtocolMessage::from(ViewChangeMessage::from(new_view))),
            Message::from(ProtocolMessage::from(status)),
            Message::from(RequestMessage::from(request.clone())),
            Message::from(RequestMessage::from(fetch)),
            Message::from(RequestMessage::from(Data { request })),
            Message::from(reply),
        ];

        for message in messages {
            let decoded = round_trip(message.clone());
            assert_eq!(encode(&message), encode(&decoded));
        }

        // The embedded signatures and authenticators survive the round trip and still verify.
        let decoded = round_trip(Message::from(ProtocolMessage::from(OrderingMessage::from(
            pre_prepare,
        ))));
        if let Message::ProtocolMessage(ProtocolMessage::OrderingMessage(
            OrderingMessage::PrePrepare(pp),
        )) = decoded
        {
            assert!(pp.is_well_formed(&client_registry, PrincipalId::new(0)).is_ok());
            assert!(AuthenticatedMessage::verify_against(&pp, &registry_for(1, &keypairs)).is_ok());
        } else {
            panic!("decoded into a different variant");
        }
    }

    #[test]
    fn rejects_oversized_and_malformed_buffers() {
        let keypairs = keypairs(1);
        let request = Request::new(
            &keypairs[0],
            PrincipalId::new(4),
            RequestId::new(1),
            vec![0u8; 256],
        );
        let message = Message::from(RequestMessage::from(request));
        let bytes = encode(&message);

        assert_eq!(
            decode(&bytes, 64),
            Err(CodecError::TooLarge {
                size: bytes.len(),
                max: 64
            })
        );

        let mut truncated = bytes.clone();
        truncated.truncate(truncated.len() - 1);
        assert_eq!(decode(&truncated, 1 << 20), Err(CodecError::Malformed));

        let mut padded = bytes;
        padded.push(0);
        assert_eq!(decode(&padded, 1 << 20), Err(CodecError::Malformed));

        assert_eq!(decode(&[200, 1, 2], 1 << 20), Err(CodecError::Malformed));
    }
}
