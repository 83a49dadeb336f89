//! Decoded transaction instructions.
//!
//! A transaction is a flat list of instructions. `End` splits it into
//! particle groups; everything between two `End`s is reduced by one chain of
//! procedure calls.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::{SubstateId, TypeTag};

// ============================================================================
// Instruction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// System call with opaque call data.
    Syscall(CallData),
    /// Read a committed substate.
    Read(SubstateId),
    /// Read a substate synthesized from a committed virtual parent.
    VirtualRead(SubstateId),
    /// Read a substate created earlier in this transaction.
    LocalRead(u32),
    /// Read a substate synthesized from a local virtual parent.
    LocalVirtualRead(SubstateId),
    /// Scan substates matching an index without consuming them.
    ReadIndex(SubstateIndex),
    /// Scan substates matching an index, consuming each one the procedure
    /// pulls from the scan.
    DownIndex(SubstateIndex),
    /// Create a substate.
    Up(UpSubstate),
    /// Consume a committed substate.
    Down(SubstateId),
    /// Consume a substate synthesized from a committed virtual parent.
    VirtualDown(SubstateId),
    /// Consume a substate created earlier in this transaction.
    LocalDown(u32),
    /// Consume a substate synthesized from a local virtual parent.
    LocalVirtualDown(SubstateId),
    /// Close the current particle group.
    End,
    /// Signature marker.
    Sig,
    /// Attached message. Not interpreted.
    Msg(Bytes),
    /// Transaction header. Not interpreted.
    Header { version: u8, flags: u8 },
    /// An opcode the decoder did not recognize.
    Unknown { opcode: u8 },
}

// ============================================================================
// Operands
// ============================================================================

/// Opaque system-call payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallData(Bytes);

impl CallData {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn get(&self, offset: usize) -> Option<u8> {
        self.0.get(offset).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A substate to create: its id and serialized encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpSubstate {
    pub id: SubstateId,
    pub data: Bytes,
}

impl UpSubstate {
    pub fn new(id: SubstateId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

/// Selects substates whose encoding starts with `prefix`.
///
/// The first prefix byte is the type tag of the selected substates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubstateIndex {
    prefix: Bytes,
    type_tag: TypeTag,
}

impl SubstateIndex {
    /// Builds an index from a raw prefix. Returns `None` for an empty prefix.
    pub fn from_prefix(prefix: impl Into<Bytes>) -> Option<Self> {
        let prefix = prefix.into();
        let type_tag = TypeTag::new(*prefix.first()?);
        Some(Self { prefix, type_tag })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn matches(&self, raw: &[u8]) -> bool {
        raw.starts_with(&self.prefix)
    }
}

// ============================================================================
// Operation Signatures
// ============================================================================

/// The operation half of a procedure key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Op {
    Up,
    Down,
    Read,
    ReadIndex,
    DownIndex,
    End,
    Syscall,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Read => "read",
            Self::ReadIndex => "read_index",
            Self::DownIndex => "down_index",
            Self::End => "end",
            Self::Syscall => "syscall",
        };
        f.write_str(name)
    }
}

/// An operation together with the type tag of its substate operand.
///
/// `Syscall` and `End` carry no operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpSignature {
    pub op: Op,
    pub target: Option<TypeTag>,
}

impl OpSignature {
    pub const fn syscall() -> Self {
        Self {
            op: Op::Syscall,
            target: None,
        }
    }

    pub const fn end() -> Self {
        Self {
            op: Op::End,
            target: None,
        }
    }

    pub const fn substate(op: Op, target: TypeTag) -> Self {
        Self {
            op,
            target: Some(target),
        }
    }
}

impl fmt::Display for OpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(tag) => write!(f, "{}({tag})", self.op),
            None => write!(f, "{}", self.op),
        }
    }
}
