//! # tessera-types: Core types for `Tessera`
//!
//! This crate contains the shared vocabulary of the validation core:
//! - Ledger time ([`Epoch`])
//! - Native value ([`Amount`], [`ResourceAddr`])
//! - Substate addressing ([`SubstateId`], [`TypeTag`])
//! - Authority ([`PermissionLevel`], [`SignerKey`])
//! - Transactions ([`Txn`], [`struct@Hash`])

use std::{
    fmt::{Debug, Display},
    ops::Add,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Epoch - Copy (8-byte ledger time unit)
// ============================================================================

/// The ledger's coarse-grained time unit.
///
/// Validator sets and active forks may only change on epoch boundaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);
    pub const MAX: Epoch = Epoch(u64::MAX);

    pub const fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following epoch, saturating at [`Epoch::MAX`].
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn saturating_sub(self, epochs: u64) -> Self {
        Self(self.0.saturating_sub(epochs))
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for Epoch {
    type Output = Epoch;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

// ============================================================================
// Amount - Copy (native resource quantity)
// ============================================================================

/// A quantity of a fungible resource, in its smallest subunit.
///
/// Arithmetic is checked: value never silently wraps. Callers decide whether
/// an overflow or shortfall is an error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(subunits: u128) -> Self {
        Self(subunits)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn checked_mul(self, factor: u128) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl From<Amount> for u128 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

// ============================================================================
// Type Tag - Copy (substate variant discriminant)
// ============================================================================

/// Single-byte discriminant of a substate's state-object variant.
///
/// Procedures are keyed by this tag rather than by runtime type, and indexed
/// scans select substates by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeTag(u8);

impl TypeTag {
    pub const fn new(tag: u8) -> Self {
        Self(tag)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl From<u8> for TypeTag {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

// ============================================================================
// Cryptographic Hash - Copy (fixed 32-byte value)
// ============================================================================

/// Length of hashes in bytes.
pub const HASH_LENGTH: usize = 32;

/// A 32-byte digest: transaction ids, candidate fork ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 bytes in hex for debugging without exposing full hash
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Substate Addressing
// ============================================================================

/// Identifier of an addressable unit of ledger state.
///
/// - `Stored`: a substate persisted by a committed transaction (or the id an
///   `up` instruction assigns to a substate it creates).
/// - `Local`: a substate created earlier in the same transaction, referenced
///   by its boot-up sequence number.
/// - `Virtual`: a substate synthesized from a parent substate plus a key. The
///   parent is either `Stored` (remote virtual) or `Local` (local virtual).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubstateId {
    Stored(Bytes),
    Local(u32),
    Virtual {
        parent: Box<SubstateId>,
        key: Bytes,
    },
}

impl SubstateId {
    pub fn stored(bytes: impl Into<Bytes>) -> Self {
        Self::Stored(bytes.into())
    }

    pub fn local(index: u32) -> Self {
        Self::Local(index)
    }

    pub fn virtual_of(parent: SubstateId, key: impl Into<Bytes>) -> Self {
        Self::Virtual {
            parent: Box::new(parent),
            key: key.into(),
        }
    }

    /// Boot-up index of a local substate.
    pub fn local_index(&self) -> Option<u32> {
        match self {
            Self::Local(index) => Some(*index),
            _ => None,
        }
    }

    pub fn virtual_parent(&self) -> Option<&SubstateId> {
        match self {
            Self::Virtual { parent, .. } => Some(parent),
            _ => None,
        }
    }

    pub fn virtual_key(&self) -> Option<&Bytes> {
        match self {
            Self::Virtual { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }
}

impl Display for SubstateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stored(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Local(index) => write!(f, "local#{index}"),
            Self::Virtual { parent, key } => {
                write!(f, "{parent}/")?;
                for byte in key {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Address of a fungible resource definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceAddr(Bytes);

impl ResourceAddr {
    const NATIVE: &'static [u8] = &[0x01];

    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Address of the native resource that pays fees.
    pub fn native() -> Self {
        Self(Bytes::from_static(Self::NATIVE))
    }

    pub fn is_native(&self) -> bool {
        self.0.as_ref() == Self::NATIVE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for ResourceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Authority
// ============================================================================

/// Privilege under which a transaction (or a single procedure) runs.
///
/// Ordered: `User < SuperUser < System`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    User,
    SuperUser,
    System,
}

impl Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::SuperUser => write!(f, "super_user"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Public key that signed a transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignerKey(Bytes);

impl SignerKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// A serialized transaction as seen by the validation core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    pub id: Hash,
    pub payload: Bytes,
}

impl Txn {
    pub fn new(id: Hash, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
