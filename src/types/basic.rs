/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected but have no active behavior. These types follow
//! the newtype pattern, and the API for using them is defined in this module.
//!
//! Types and traits specific to the subprotocols of PBFT-rs can be found in the respective modules.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as Sha2Digest, Sha256};

/// Identifier of a [principal](crate::types::principals::Principal), i.e., a replica or a client.
///
/// Replicas occupy the ids `0..n`, clients the ids from `n` upwards. The id of the primary of a
/// given view is computed by [`primary`](crate::types::principals::PrincipalRegistry::primary).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct PrincipalId(u32);

impl PrincipalId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// PBFT view number. Monotonically increasing within a run; the replica with id `view mod n` is the
/// primary of the view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, )]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.add(rhs))
    }
}

impl Sub<ViewNumber> for ViewNumber {
    type Output = u64;

    fn sub(self, rhs: ViewNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Sequence number of an ordering slot. Issued densely by the primary, starting from 1; seqno 0 is
/// reserved for the genesis checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, )]
pub struct SeqNumber(u64);

impl SeqNumber {
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SeqNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u64) -> Self::Output {
        SeqNumber(self.0.add(rhs))
    }
}

impl AddAssign<u64> for SeqNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<SeqNumber> for SeqNumber {
    type Output = u64;

    fn sub(self, rhs: SeqNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Per-client monotonic identifier of a [request](crate::requests::messages::Request). The pair
/// (client id, request id) identifies a request uniquely across the replica group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, )]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<u64> for RequestId {
    type Output = RequestId;

    fn add(self, rhs: u64) -> Self::Output {
        RequestId(self.0.add(rhs))
    }
}

/// A content-addressed SHA-256 hash, used as a compact identifier of requests, request batches, and
/// observable state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash an arbitrary bytesequence.
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Hash the ordered concatenation of a set of member digests. This is how the digest of a
    /// request batch is derived from the digests of its requests.
    pub fn of_batch(members: &[Digest]) -> Digest {
        let mut hasher = Sha256::new();
        for member in members {
            hasher.update(member.bytes());
        }
        Digest(hasher.finalize().into())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An ed25519 signature represented in bytes.
#[derive(Clone, Debug, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

/// An HMAC-SHA256 authentication tag represented in bytes.
#[derive(Clone, Debug, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MacBytes([u8; 32]);

impl MacBytes {
    pub(crate) fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Size of a buffer (in bytes).
#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, BorshDeserialize, BorshSerialize)]
pub struct BufferSize(u64);

impl BufferSize {
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl AddAssign<u64> for BufferSize {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl SubAssign<u64> for BufferSize {
    fn sub_assign(&mut self, rhs: u64) {
        self.0.sub_assign(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_digest_is_order_sensitive() {
        let d1 = Digest::of_bytes(b"first");
        let d2 = Digest::of_bytes(b"second");

        assert_eq!(Digest::of_batch(&[d1, d2]), Digest::of_batch(&[d1, d2]));
        assert_ne!(Digest::of_batch(&[d1, d2]), Digest::of_batch(&[d2, d1]));
        assert_ne!(Digest::of_batch(&[]), Digest::of_batch(&[d1]));
    }

    #[test]
    fn seqno_arithmetic() {
        let low = SeqNumber::new(8);
        let high = low + 128;
        assert_eq!(high - low, 128);
        assert!(high > low);
    }
}
