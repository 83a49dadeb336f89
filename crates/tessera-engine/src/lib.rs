//! # tessera-engine: Transaction verification core of `Tessera`
//!
//! The engine decides whether a decoded transaction is a valid state
//! transition. It reads committed state, never writes it, and produces the
//! ordered list of substates each particle group creates and consumes.
//!
//! ## Key Principles
//!
//! - **Deterministic**: the same store, context and instructions always give
//!   the same result
//! - **Pure**: committed state is only read; the caller applies the returned
//!   state updates
//! - **Table-driven**: ledger rules live in a [`Procedures`] table keyed by
//!   reducer kind and operation signature
//!
//! ## Architecture
//!
//! - [`instruction`]: decoded instructions and procedure operation signatures
//! - [`procedure`]: the [`Procedure`] trait and the procedure table
//! - [`store`]: collaborators for reading and decoding committed state
//! - [`context`]: fee reserve, system loan, signature budget and authority
//! - [`meter`]: fee metering hooks
//! - [`machine`]: the [`ConstraintMachine`] that ties it all together
//!
//! ## Example
//!
//! ```ignore
//! let machine = ConstraintMachine::new(procedures, deserializer, virtual_deserializer, NoopMeter);
//! let mut ctx = ExecutionContext::new(txn, PermissionLevel::User, max_signatures);
//!
//! match machine.verify(&store, &mut ctx, &instructions) {
//!     Ok(groups) => {
//!         // Apply state updates...
//!     }
//!     Err(e) => {
//!         // e.index is the failing instruction...
//!     }
//! }
//! ```

pub mod context;
pub mod error;
pub mod instruction;
pub mod machine;
pub mod meter;
pub mod procedure;
pub mod store;

#[cfg(test)]
mod tests;

pub use context::ExecutionContext;
pub use error::{
    AuthorizationError, ConstraintMachineError, DeserializeError, ErrorCategory, ExecutionError,
};
pub use instruction::{CallData, Instruction, Op, OpSignature, SubstateIndex, UpSubstate};
pub use machine::{ConstraintMachine, StateUpdate};
pub use meter::{FixedFeeMeter, Meter, NoopMeter, TxnSizeFeeMeter};
pub use procedure::{
    FnProcedure, IndexedSubstates, Procedure, ProcedureInput, ProcedureKey, Procedures,
    ProceduresBuilder, ReducerKind,
};
pub use store::{
    CmStore, RawSubstate, ReducerState, ResourceDefinition, Resources, StateObject,
    SubstateDeserializer, VirtualSubstateDeserializer,
};
