/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas as part of the log sync protocol.
//!
//! ## Messages
//!
//! The log sync protocol defines two categories of messages:
//!
//! 1. Log Sync Protocol messages ([`AppendEntriesRequest`] and [`AppendEntriesResponse`]):
//!    exchanged between a sync client and sync server when the client is catching up on executed
//!    batches it missed.
//! 2. Log Sync Server Advertisements ([`MetaDataDigest`]): periodically broadcasted (and sent in
//!    response to lagging status broadcasts) by sync servers to let clients know a newer stable
//!    checkpoint exists, which is the evidence that makes a lagging client trigger the sync
//!    process.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::checkpointing::types::CheckpointCertificate;
use crate::messages::{AuthenticatedMessage, Message};
use crate::requests::messages::Request;
use crate::types::basic::{Digest, PrincipalId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Authenticator, PrincipalRegistry};

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum LogSyncMessage {
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    MetaDataDigest(MetaDataDigest),
}

impl From<AppendEntriesRequest> for Message {
    fn from(request: AppendEntriesRequest) -> Self {
        Message::LogSyncMessage(LogSyncMessage::AppendEntriesRequest(request))
    }
}

impl From<AppendEntriesResponse> for Message {
    fn from(response: AppendEntriesResponse) -> Self {
        Message::LogSyncMessage(LogSyncMessage::AppendEntriesResponse(response))
    }
}

impl From<MetaDataDigest> for Message {
    fn from(advertisement: MetaDataDigest) -> Self {
        Message::LogSyncMessage(LogSyncMessage::MetaDataDigest(advertisement))
    }
}

/// One executed batch, as stored in the [`Ledger`](crate::ledger::Ledger) and shipped during
/// catch-up.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct LedgerEntry {
    pub seqno: SeqNumber,
    pub requests: Vec<Request>,
}

/// Sync request sent by a sync client to a sync server. `from_seqno` is the first sequence number
/// the client wants, i.e., one past the last entry it acknowledges holding; the server uses it as
/// the per-peer resumption index. `limit` bounds the batch size of the response.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct AppendEntriesRequest {
    pub from: PrincipalId,
    pub from_seqno: SeqNumber,
    pub limit: u32,
    pub authenticator: Authenticator,
}

impl AppendEntriesRequest {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        peer: PrincipalId,
        from_seqno: SeqNumber,
        limit: u32,
    ) -> AppendEntriesRequest {
        let from = registry.me();
        let auth_bytes = (from, from_seqno, limit).try_to_vec().unwrap();
        let authenticator = registry.authenticate_to(peer, keypair, &auth_bytes);
        AppendEntriesRequest {
            from,
            from_seqno,
            limit,
            authenticator,
        }
    }
}

impl AuthenticatedMessage for AppendEntriesRequest {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.from, self.from_seqno, self.limit).try_to_vec().unwrap()
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}

/// The checkpoint metadata attached to an [`AppendEntriesResponse`]: the server's latest stable
/// checkpoint certificate. The certificate is what lets the client trust the shipped entries up to
/// the certified seqno without replaying the three-phase protocol for them.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MetaData {
    pub stable_checkpoint: CheckpointCertificate,
}

/// Sync response sent by a sync server to a sync client requesting entries. The response includes:
/// 1. Entries: consecutive executed batches starting at the requested seqno, and
/// 2. MetaData: the server's latest stable checkpoint certificate, which certifies the shipped
///    prefix.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct AppendEntriesResponse {
    pub from: PrincipalId,
    pub entries: Vec<LedgerEntry>,
    pub meta_data: MetaData,
    pub authenticator: Authenticator,
}

impl AppendEntriesResponse {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        peer: PrincipalId,
        entries: Vec<LedgerEntry>,
        meta_data: MetaData,
    ) -> AppendEntriesResponse {
        let from = registry.me();
        let auth_bytes = Self::bytes_to_authenticate(from, &entries, &meta_data);
        let authenticator = registry.authenticate_to(peer, keypair, &auth_bytes);
        AppendEntriesResponse {
            from,
            entries,
            meta_data,
            authenticator,
        }
    }

    fn bytes_to_authenticate(
        from: PrincipalId,
        entries: &Vec<LedgerEntry>,
        meta_data: &MetaData,
    ) -> Vec<u8> {
        (from, entries, meta_data).try_to_vec().unwrap()
    }
}

impl AuthenticatedMessage for AppendEntriesResponse {
    fn auth_bytes(&self) -> Vec<u8> {
        Self::bytes_to_authenticate(self.from, &self.entries, &self.meta_data)
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}

/// Advertisement of the sender's latest stable checkpoint. A receiver whose own stable checkpoint
/// is older knows it is lagging and may start syncing.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MetaDataDigest {
    pub from: PrincipalId,
    pub seqno: SeqNumber,
    pub state_digest: Digest,
    pub authenticator: Authenticator,
}

impl MetaDataDigest {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        seqno: SeqNumber,
        state_digest: Digest,
    ) -> MetaDataDigest {
        let from = registry.me();
        let auth_bytes = (from, seqno, state_digest).try_to_vec().unwrap();
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        MetaDataDigest {
            from,
            seqno,
            state_digest,
            authenticator,
        }
    }
}

impl AuthenticatedMessage for MetaDataDigest {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.from, self.seqno, self.state_digest).try_to_vec().unwrap()
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}
