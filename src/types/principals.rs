/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Identities of the participants of the protocol and the authenticators that prove a message came
//! from one of them.
//!
//! ## Principals
//!
//! Every participant, whether a replica or a client, is a [`Principal`]: an id, a role, an ed25519
//! verifying key, and an opaque network address. The [`PrincipalRegistry`] maps ids to principals
//! and is the single place where inbound authenticators are checked and outbound authenticators are
//! produced.
//!
//! The registry is read-mostly. It grows append-only within a configuration; adding or removing a
//! principal requires an externally-ordered reconfiguration request, and mutation happens only on
//! the dispatch thread at configuration boundaries.
//!
//! ## Authentication schemes
//!
//! Two schemes are supported, selected at construction via [`AuthenticationScheme`]:
//!
//! 1. [`Signatures`](AuthenticationScheme::Signatures): every message carries a single ed25519
//!    signature.
//! 2. [`SessionMacs`](AuthenticationScheme::SessionMacs): messages carry a per-peer vector of
//!    HMAC-SHA256 tags computed with pairwise session keys, one entry per potential receiver. MACs
//!    are much cheaper than signatures but are not transferable: a receiver can check its own entry
//!    and nothing else.
//!
//! Messages that serve as transferable proofs (requests, checkpoints, and all view-change traffic)
//! carry signatures regardless of the scheme; see the respective message definitions.

use std::collections::{BTreeMap, HashMap};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::basic::{MacBytes, PrincipalId, SignatureBytes, ViewNumber};
use super::keypair::Keypair;

/// Internal type used for computing HMAC-SHA256 tags over pairwise session keys.
type HmacSha256 = Hmac<Sha256>;

/// A pairwise symmetric session key, established out-of-band by the session layer.
pub type SessionKey = [u8; 32];

/// What part a [`Principal`] plays in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Replica,
    Client,
}

/// A participant of the protocol.
#[derive(Clone)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
    pub verifying_key: VerifyingKey,
    /// Opaque address, interpreted only by the [`Network`](crate::networking::network::Network)
    /// implementation.
    pub address: Option<String>,
}

/// How outbound messages are authenticated and inbound authenticators are verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthenticationScheme {
    Signatures,
    SessionMacs,
}

/// The trailing authenticator of a wire message: either a single signature, or a MAC vector with
/// one entry per potential receiver.
///
/// A [`MacVector`](Authenticator::MacVector) produced for a broadcast holds one entry per replica
/// other than the sender, in ascending id order. A vector produced for a unicast holds exactly one
/// entry.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Authenticator {
    Signature(SignatureBytes),
    MacVector(Vec<MacBytes>),
}

/// Ways in which verifying an inbound message against the registry can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The claimed sender id is not registered.
    UnknownPrincipal(PrincipalId),
    /// The authenticator did not verify under the claimed sender's keys.
    BadAuth,
}

/// Maps principal ids to [`Principal`]s, and produces and checks [`Authenticator`]s on their
/// behalf.
///
/// One instance exists per replica (and per client proxy); there is no global registry.
pub struct PrincipalRegistry {
    principals: BTreeMap<PrincipalId, Principal>,
    num_replicas: u32,
    max_faulty: u32,
    scheme: AuthenticationScheme,
    me: PrincipalId,
    // This principal's pairwise session keys, keyed by peer id. Only consulted in the
    // `SessionMacs` scheme.
    session_keys: HashMap<PrincipalId, SessionKey>,
}

impl PrincipalRegistry {
    /// Create a registry for the participant `me`.
    ///
    /// `principals` must contain every replica (ids `0..num_replicas`) and every known client.
    /// `session_keys` maps each peer to the symmetric key this participant shares with it; it may
    /// be empty in the [`Signatures`](AuthenticationScheme::Signatures) scheme.
    ///
    /// # Panics
    ///
    /// Panics unless `num_replicas >= 3 * max_faulty + 1`.
    pub fn new(
        principals: Vec<Principal>,
        num_replicas: u32,
        max_faulty: u32,
        scheme: AuthenticationScheme,
        me: PrincipalId,
        session_keys: HashMap<PrincipalId, SessionKey>,
    ) -> PrincipalRegistry {
        assert!(
            num_replicas >= 3 * max_faulty + 1,
            "a replica group of {} cannot tolerate {} faults",
            num_replicas,
            max_faulty
        );

        PrincipalRegistry {
            principals: principals.into_iter().map(|p| (p.id, p)).collect(),
            num_replicas,
            max_faulty,
            scheme,
            me,
            session_keys,
        }
    }

    pub fn principal(&self, id: PrincipalId) -> Option<&Principal> {
        self.principals.get(&id)
    }

    /// Register a new principal. Only called while applying an externally-ordered reconfiguration
    /// request; the registry is otherwise immutable for the lifetime of a configuration.
    pub fn add_principal(&mut self, principal: Principal, session_key: Option<SessionKey>) {
        if let Some(key) = session_key {
            self.session_keys.insert(principal.id, key);
        }
        self.principals.insert(principal.id, principal);
    }

    pub fn me(&self) -> PrincipalId {
        self.me
    }

    /// The number of replicas, n.
    pub fn num_replicas(&self) -> u32 {
        self.num_replicas
    }

    /// The maximum number of faulty replicas tolerated, f.
    pub fn max_faulty(&self) -> u32 {
        self.max_faulty
    }

    /// The size of a full quorum: 2f + 1.
    pub fn quorum(&self) -> u32 {
        2 * self.max_faulty + 1
    }

    /// The primary of the given view: the replica with id `view mod n`.
    pub fn primary(&self, view: ViewNumber) -> PrincipalId {
        PrincipalId::new((view.int() % self.num_replicas as u64) as u32)
    }

    pub fn is_replica(&self, id: PrincipalId) -> bool {
        id.int() < self.num_replicas
    }

    /// Iterate over the ids of all replicas, in ascending order.
    pub fn replicas(&self) -> impl Iterator<Item = PrincipalId> {
        (0..self.num_replicas).map(PrincipalId::new)
    }

    pub fn scheme(&self) -> AuthenticationScheme {
        self.scheme
    }

    /// Produce the authenticator for a message broadcast by `me` to all replicas.
    pub(crate) fn authenticate(&self, keypair: &Keypair, bytes: &[u8]) -> Authenticator {
        match self.scheme {
            AuthenticationScheme::Signatures => Authenticator::Signature(keypair.sign(bytes)),
            AuthenticationScheme::SessionMacs => {
                let macs = self
                    .replicas()
                    .filter(|id| *id != self.me)
                    .map(|id| self.compute_mac(id, bytes))
                    .collect();
                Authenticator::MacVector(macs)
            }
        }
    }

    /// Produce the authenticator for a message sent by `me` to the single receiver `peer`.
    pub(crate) fn authenticate_to(
        &self,
        peer: PrincipalId,
        keypair: &Keypair,
        bytes: &[u8],
    ) -> Authenticator {
        match self.scheme {
            AuthenticationScheme::Signatures => Authenticator::Signature(keypair.sign(bytes)),
            AuthenticationScheme::SessionMacs => {
                Authenticator::MacVector(vec![self.compute_mac(peer, bytes)])
            }
        }
    }

    /// Verify that `authenticator` proves `bytes` was produced by `from`.
    pub(crate) fn verify(
        &self,
        from: PrincipalId,
        bytes: &[u8],
        authenticator: &Authenticator,
    ) -> Result<(), AuthError> {
        match authenticator {
            Authenticator::Signature(signature) => self.verify_signature(from, bytes, signature),
            Authenticator::MacVector(macs) => {
                // A looped-back broadcast of this principal's own carries no entry for itself;
                // check the entry of the first other replica instead, which only the holder of
                // this principal's session keys could have produced.
                let (receiver, key_peer) = if from == self.me {
                    let Some(peer) = self.replicas().find(|id| *id != self.me) else {
                        return Err(AuthError::BadAuth);
                    };
                    (peer, peer)
                } else {
                    (self.me, from)
                };

                let index = if macs.len() == 1 {
                    // Unicast vector.
                    0
                } else if self.is_replica(receiver) {
                    // Broadcast vector: one entry per replica other than the sender, in ascending
                    // id order.
                    if receiver < from {
                        receiver.int() as usize
                    } else {
                        receiver.int() as usize - 1
                    }
                } else {
                    return Err(AuthError::BadAuth);
                };

                let expected = macs.get(index).ok_or(AuthError::BadAuth)?;
                let mut mac = self.keyed_mac(key_peer)?;
                mac.update(bytes);
                mac.verify_slice(&expected.bytes())
                    .map_err(|_| AuthError::BadAuth)
            }
        }
    }

    /// Verify a bare ed25519 signature made by `from` over `bytes`. Used for the embedded,
    /// transferable signatures that survive view changes.
    pub(crate) fn verify_signature(
        &self,
        from: PrincipalId,
        bytes: &[u8],
        signature: &SignatureBytes,
    ) -> Result<(), AuthError> {
        let principal = self
            .principals
            .get(&from)
            .ok_or(AuthError::UnknownPrincipal(from))?;
        let signature = Signature::from_bytes(&signature.bytes());
        principal
            .verifying_key
            .verify(bytes, &signature)
            .map_err(|_| AuthError::BadAuth)
    }

    fn compute_mac(&self, peer: PrincipalId, bytes: &[u8]) -> MacBytes {
        let mut mac = self
            .keyed_mac(peer)
            .expect("session key missing for a registered peer");
        mac.update(bytes);
        MacBytes::new(mac.finalize().into_bytes().into())
    }

    fn keyed_mac(&self, peer: PrincipalId) -> Result<HmacSha256, AuthError> {
        let key = self
            .session_keys
            .get(&peer)
            .ok_or(AuthError::UnknownPrincipal(peer))?;
        Ok(HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length"))
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    fn registry_for(
        me: u32,
        scheme: AuthenticationScheme,
        keypairs: &[SigningKey],
    ) -> PrincipalRegistry {
        let principals = keypairs
            .iter()
            .enumerate()
            .map(|(id, keypair)| Principal {
                id: PrincipalId::new(id as u32),
                role: Role::Replica,
                verifying_key: keypair.verifying_key(),
                address: None,
            })
            .collect();
        let session_keys = (0..keypairs.len() as u32)
            .map(|peer| {
                let mut key = [0u8; 32];
                let (a, b) = (me.min(peer), me.max(peer));
                key[0] = a as u8;
                key[1] = b as u8;
                (PrincipalId::new(peer), key)
            })
            .collect();
        PrincipalRegistry::new(
            principals,
            keypairs.len() as u32,
            (keypairs.len() as u32 - 1) / 3,
            scheme,
            PrincipalId::new(me),
            session_keys,
        )
    }

    #[test]
    fn signature_authenticator_round_trip() {
        let keypairs: Vec<SigningKey> =
            (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let sender = registry_for(0, AuthenticationScheme::Signatures, &keypairs);
        let receiver = registry_for(2, AuthenticationScheme::Signatures, &keypairs);

        let auth = sender.authenticate(&Keypair::new(keypairs[0].clone()), b"hello");
        assert!(receiver
            .verify(PrincipalId::new(0), b"hello", &auth)
            .is_ok());
        assert_eq!(
            receiver.verify(PrincipalId::new(0), b"tampered", &auth),
            Err(AuthError::BadAuth)
        );
        // A signature by replica 0 does not verify as replica 1's.
        assert_eq!(
            receiver.verify(PrincipalId::new(1), b"hello", &auth),
            Err(AuthError::BadAuth)
        );
    }

    #[test]
    fn mac_vector_round_trip() {
        let keypairs: Vec<SigningKey> =
            (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let sender = registry_for(1, AuthenticationScheme::SessionMacs, &keypairs);

        let auth = sender.authenticate(&Keypair::new(keypairs[1].clone()), b"hello");
        match &auth {
            Authenticator::MacVector(macs) => assert_eq!(macs.len(), 3),
            Authenticator::Signature(_) => panic!("expected a MAC vector"),
        }

        // Every other replica finds and verifies its own entry.
        for me in [0, 2, 3] {
            let receiver = registry_for(me, AuthenticationScheme::SessionMacs, &keypairs);
            assert!(receiver
                .verify(PrincipalId::new(1), b"hello", &auth)
                .is_ok());
            assert_eq!(
                receiver.verify(PrincipalId::new(1), b"tampered", &auth),
                Err(AuthError::BadAuth)
            );
        }
    }

    #[test]
    fn own_loopback_mac_vector_verifies() {
        let keypairs: Vec<SigningKey> =
            (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let sender = registry_for(2, AuthenticationScheme::SessionMacs, &keypairs);

        // A replica's own broadcast comes back through the loopback and must verify even though
        // the vector has no entry for the sender itself.
        let auth = sender.authenticate(&Keypair::new(keypairs[2].clone()), b"hello");
        assert!(sender
            .verify(PrincipalId::new(2), b"hello", &auth)
            .is_ok());
        assert_eq!(
            sender.verify(PrincipalId::new(2), b"tampered", &auth),
            Err(AuthError::BadAuth)
        );
    }

    #[test]
    fn primary_rotates_round_robin() {
        let keypairs: Vec<SigningKey> =
            (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let registry = registry_for(0, AuthenticationScheme::Signatures, &keypairs);

        assert_eq!(registry.primary(ViewNumber::new(0)), PrincipalId::new(0));
        assert_eq!(registry.primary(ViewNumber::new(1)), PrincipalId::new(1));
        assert_eq!(registry.primary(ViewNumber::new(5)), PrincipalId::new(1));
        assert_eq!(registry.quorum(), 3);
    }

    #[test]
    #[should_panic]
    fn rejects_insufficient_replica_count() {
        PrincipalRegistry::new(
            Vec::new(),
            3,
            1,
            AuthenticationScheme::Signatures,
            PrincipalId::new(0),
            HashMap::new(),
        );
    }
}
