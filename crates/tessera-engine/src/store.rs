//! Collaborators the interpreter reads committed state through.
//!
//! The interpreter never writes to storage: it reads committed substates via
//! [`CmStore`], decodes them with a [`SubstateDeserializer`], and hands the
//! decoded [`StateObject`]s to procedures.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::{ResourceAddr, SignerKey, SubstateId, TypeTag};

use crate::error::{DeserializeError, ExecutionError};
use crate::instruction::SubstateIndex;
use crate::procedure::ReducerKind;

// ============================================================================
// Decoded State
// ============================================================================

/// A decoded substate.
pub trait StateObject: Clone + fmt::Debug + Send + Sync + 'static {
    fn type_tag(&self) -> TypeTag;

    /// The resource definition this substate carries, if any.
    fn as_resource(&self) -> Option<&ResourceDefinition> {
        None
    }

    /// Data of a virtual parent. Its first byte is the type tag of the
    /// substates synthesized from it.
    fn virtual_parent_data(&self) -> Option<&[u8]> {
        None
    }
}

/// State accumulated by procedures across one particle group.
pub trait ReducerState: Clone + fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> ReducerKind;
}

/// Definition of a fungible resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub addr: ResourceAddr,
    pub mutable: bool,
    pub owner: Option<SignerKey>,
}

impl ResourceDefinition {
    pub fn new(addr: ResourceAddr) -> Self {
        Self {
            addr,
            mutable: false,
            owner: None,
        }
    }
}

/// Resource lookup available to procedures and authorizers.
pub trait Resources {
    fn load_resource(&self, addr: &ResourceAddr) -> Result<ResourceDefinition, ExecutionError>;
}

// ============================================================================
// Committed Store
// ============================================================================

/// A committed substate as returned by an index scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSubstate {
    pub id: SubstateId,
    pub data: Bytes,
}

/// Read-only view of committed ledger state.
pub trait CmStore {
    /// Encoding of a committed, not yet consumed substate.
    fn load_substate(&self, id: &SubstateId) -> Option<Bytes>;

    /// Encoding of the substate holding a resource definition.
    fn load_resource(&self, addr: &ResourceAddr) -> Option<Bytes>;

    /// Checks that the virtual substate `id` has not been consumed and
    /// returns the encoding of its committed parent.
    fn verify_virtual_substate(&self, id: &SubstateId) -> Result<Bytes, ExecutionError>;

    /// Opens a scan over committed substates matching `index`.
    ///
    /// The scan is closed when the returned iterator is dropped.
    fn open_indexed_cursor<'a>(
        &'a self,
        index: &SubstateIndex,
    ) -> Box<dyn Iterator<Item = RawSubstate> + 'a>;
}

// ============================================================================
// Deserialization
// ============================================================================

pub trait SubstateDeserializer<P>: Send + Sync {
    /// Decodes one state object from the front of `buf`.
    ///
    /// Returns the object and the number of bytes consumed.
    fn deserialize(&self, buf: &[u8]) -> Result<(P, usize), DeserializeError>;

    /// Whether a state object type is registered for `tag`.
    fn contains_tag(&self, tag: TypeTag) -> bool;
}

/// Synthesizes virtual substates from a parent's type byte and a key.
pub trait VirtualSubstateDeserializer<P>: Send + Sync {
    fn key_to_substate(&self, type_byte: u8, key: &[u8]) -> Result<P, DeserializeError>;
}
