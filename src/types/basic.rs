/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" newtypes shared by every subsystem of the library: identifiers for nodes, views,
//! subgroups and shards, per-sender message sequence numbers, the version numbers assigned to
//! stable messages, and the hybrid logical clock readings attached to them.
//!
//! These types follow the newtype pattern and are sent around and inspected but have no active
//! behavior. Every one of them crosses a process boundary at some point, so every one of them
//! is Borsh-serializable.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

/// Identifier of a process in the group. Opaque, and globally unique across the lifetime of the
/// cluster: a process that leaves and returns comes back under a fresh `NodeId`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifier of an installed membership view. Strictly increasing at every replica: each
/// installed view's id is greater than the id of every view installed before it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewId(u64);

impl ViewId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewId {
    type Output = ViewId;

    fn add(self, rhs: u64) -> Self::Output {
        ViewId(self.0 + rhs)
    }
}

/// Identifier of a subgroup, assigned by the view manager from the subgroup layout during view
/// install. Stable across views for as long as the layout keeps producing the subgroup.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SubgroupId(u32);

impl SubgroupId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub(crate) const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a replicated-object type within the group's registry, in registration order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SubgroupTypeId(u32);

impl SubgroupTypeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Index of a shard within a subgroup. A `(SubgroupId, ShardId)` pair names an ordered list of
/// member `NodeId`s.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ShardId(u32);

impl ShardId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Sequence number of a message from one sender within one (subgroup, view), starting at 0 for
/// the sender's first message of the view. [`MessageId::NONE`] (−1) means "no message yet".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct MessageId(i32);

impl MessageId {
    pub const NONE: MessageId = MessageId(-1);

    pub const fn new(int: i32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i32 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 < 0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number of bits of a [`Version`] occupied by the stable-message counter. The high bits hold
/// the id of the view the message was delivered in.
const VERSION_COUNTER_BITS: u32 = 48;
const VERSION_COUNTER_MASK: i64 = (1 << VERSION_COUNTER_BITS) - 1;

/// Monotone identifier assigned to each stable message within a subgroup: the id of the view the
/// message became stable in occupies the high bits, and the subgroup's running count of stable
/// messages occupies the low 48 bits. Versions are totally ordered and unique per subgroup for
/// all time, and are the unit of persistence, signing, and verification.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Version(i64);

impl Version {
    /// The version "before every version": no message has reached stability yet.
    pub const NONE: Version = Version(-1);

    pub const fn new(view_id: ViewId, index: u64) -> Self {
        Version(
            ((view_id.int() as i64) << VERSION_COUNTER_BITS)
                | (index as i64 & VERSION_COUNTER_MASK),
        )
    }

    pub const fn from_int(int: i64) -> Self {
        Version(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 < 0
    }

    /// The view the versioned message was delivered in.
    pub const fn view_id(&self) -> ViewId {
        ViewId::new((self.0 >> VERSION_COUNTER_BITS) as u64)
    }

    /// The subgroup's stable-message count at the time this version was assigned.
    pub const fn index(&self) -> u64 {
        (self.0 & VERSION_COUNTER_MASK) as u64
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}:{}", self.view_id(), self.index())
        }
    }
}

/// A hybrid logical clock reading: a wall-clock component in microseconds since the Unix epoch,
/// and a logical counter that breaks ties between readings taken within the same microsecond.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub struct Hlc {
    pub wall: u64,
    pub logical: u64,
}

impl Hlc {
    pub const fn new(wall: u64, logical: u64) -> Self {
        Self { wall, logical }
    }

    /// Take a new reading that is strictly greater than `self`: the wall component advances to
    /// the current wall clock when the wall clock has moved, and the logical component breaks
    /// the tie otherwise.
    pub fn advance(&self) -> Hlc {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(self.wall);
        if now > self.wall {
            Hlc::new(now, 0)
        } else {
            Hlc::new(self.wall, self.logical + 1)
        }
    }
}

/// An Ed25519 signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    // A readable identity for a signature: the first seven characters of its base64 encoding.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
        let encoded = STANDARD_NO_PAD.encode(self.0);
        write!(f, "sig:{}", &encoded[..7])
    }
}

/// Number of messages a sender may have outstanding (sent but not yet received by every shard
/// member) before further sends fail with backpressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WindowSize(u32);

impl WindowSize {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Upper bound on the payload of a single multicast message, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PayloadSize(u32);

impl PayloadSize {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Correlates a point-to-point or ordered query with its replies. Unique per issuing process.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl AddAssign<u64> for RequestId {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<RequestId> for RequestId {
    type Output = u64;

    fn sub(self, rhs: RequestId) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_encoding_round_trips_view_and_index() {
        let version = Version::new(ViewId::new(7), 123_456);
        assert_eq!(version.view_id(), ViewId::new(7));
        assert_eq!(version.index(), 123_456);
    }

    #[test]
    fn versions_order_by_view_then_index() {
        let early = Version::new(ViewId::new(1), 1u64 << 40);
        let late = Version::new(ViewId::new(2), 0);
        assert!(early < late);
        assert!(Version::NONE < early);
    }

    #[test]
    fn hlc_readings_strictly_increase() {
        let mut hlc = Hlc::default();
        for _ in 0..100 {
            let next = hlc.advance();
            assert!(next > hlc);
            hlc = next;
        }
    }
}
