//! Rejection reasons for transaction verification.
//!
//! Every failure the interpreter or a procedure can raise is an
//! [`ExecutionError`]. The interpreter wraps the first one it hits in a
//! [`ConstraintMachineError`] carrying the failing instruction index, the full
//! instruction list, and the reducer state at the time of failure.

use std::fmt;

use tessera_types::{Amount, PermissionLevel, ResourceAddr, SubstateId, TypeTag};

use crate::instruction::Instruction;
use crate::procedure::{ProcedureKey, ReducerKind};

/// Broad classification of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed instruction or substate encoding.
    Parse,
    /// References to state that does not exist, was already consumed, or
    /// groups that were not closed correctly.
    StateConsistency,
    /// Permission, signature or authorizer rejections.
    Authorization,
    /// Fee reserve and system loan accounting.
    Economic,
    /// Raised by the fee meter.
    Metering,
    /// Raised by a procedure's own validation.
    Procedure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::StateConsistency => "state_consistency",
            Self::Authorization => "authorization",
            Self::Economic => "economic",
            Self::Metering => "metering",
            Self::Procedure => "procedure",
        };
        f.write_str(name)
    }
}

/// A substate encoding that could not be decoded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot decode substate: {0}")]
pub struct DeserializeError(pub String);

/// Returned by a procedure's authorizer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct AuthorizationError(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    // Parse errors
    #[error("unknown instruction opcode 0x{0:02x}")]
    UnknownOp(u8),

    #[error("substate encoding has {remaining} trailing bytes")]
    TrailingBytes { remaining: usize },

    #[error("no substate type registered for tag {0}")]
    UnknownSubstateType(TypeTag),

    #[error(transparent)]
    Deserialize(#[from] DeserializeError),

    // State consistency errors
    #[error("substate {0} not found")]
    SubstateNotFound(SubstateId),

    #[error("substate {0} was already shut down")]
    SubstateAlreadyDown(SubstateId),

    #[error("local substate #{0} not found")]
    LocalSubstateNotFound(u32),

    #[error("virtual substate {0} was already shut down")]
    VirtualSubstateAlreadyDown(SubstateId),

    #[error("virtual parent of {0} does not exist")]
    VirtualParentStateDoesNotExist(SubstateId),

    #[error("{0} is not a resource")]
    NotAResource(ResourceAddr),

    #[error("no procedure registered for {0}")]
    MissingProcedure(ProcedureKey),

    #[error("reducer state is void, expected end of group")]
    MissingExpectedEnd,

    #[error("group closed with pending reducer state {0}")]
    UnclosedGroup(ReducerKind),

    #[error("instruction stream ended inside an open group")]
    UnterminatedGroup,

    // Authorization errors
    #[error("procedure requires {required} permission, transaction has {actual}")]
    InvalidPermission {
        required: PermissionLevel,
        actual: PermissionLevel,
    },

    #[error("privileged procedure invoked by a signed transaction")]
    SignedSystem,

    #[error("signature budget exhausted")]
    SignatureBudgetExhausted,

    #[error("authorization failed: {0}")]
    Unauthorized(AuthorizationError),

    // Economic errors
    #[error("fee reserve depleted: requested {requested}, available {available}")]
    DepletedFeeReserve { requested: Amount, available: Amount },

    #[error("fee reserve may only be deposited once per transaction")]
    MultipleFeeReserveDeposit,

    #[error("fee reserve only accepts the native resource, got {0}")]
    InvalidFeeResource(ResourceAddr),

    #[error("system loan defaulted: shortfall {shortfall}, fee deposit {fee_deposit}")]
    DefaultedSystemLoan { shortfall: Amount, fee_deposit: Amount },

    #[error("fee reserve not empty at end of transaction: {0} remaining")]
    ReserveNotEmpty(Amount),

    #[error("resource allocation and destruction are disabled for this transaction")]
    ResourceAllocationDisabled,

    #[error("amount overflow")]
    AmountOverflow,

    // Metering errors
    #[error("fee meter rejected transaction: {0}")]
    Meter(Box<ExecutionError>),

    // Procedure errors
    #[error("{0}")]
    Procedure(String),
}

impl ExecutionError {
    pub fn procedure(reason: impl Into<String>) -> Self {
        Self::Procedure(reason.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownOp(_)
            | Self::TrailingBytes { .. }
            | Self::UnknownSubstateType(_)
            | Self::Deserialize(_) => ErrorCategory::Parse,
            Self::SubstateNotFound(_)
            | Self::SubstateAlreadyDown(_)
            | Self::LocalSubstateNotFound(_)
            | Self::VirtualSubstateAlreadyDown(_)
            | Self::VirtualParentStateDoesNotExist(_)
            | Self::NotAResource(_)
            | Self::MissingProcedure(_)
            | Self::MissingExpectedEnd
            | Self::UnclosedGroup(_)
            | Self::UnterminatedGroup => ErrorCategory::StateConsistency,
            Self::InvalidPermission { .. }
            | Self::SignedSystem
            | Self::SignatureBudgetExhausted
            | Self::Unauthorized(_) => ErrorCategory::Authorization,
            Self::DepletedFeeReserve { .. }
            | Self::MultipleFeeReserveDeposit
            | Self::InvalidFeeResource(_)
            | Self::DefaultedSystemLoan { .. }
            | Self::ReserveNotEmpty(_)
            | Self::ResourceAllocationDisabled
            | Self::AmountOverflow => ErrorCategory::Economic,
            Self::Meter(_) => ErrorCategory::Metering,
            Self::Procedure(_) => ErrorCategory::Procedure,
        }
    }
}

/// A rejected transaction.
#[derive(thiserror::Error, Debug)]
#[error("instruction {index} rejected: {cause}")]
pub struct ConstraintMachineError<R: fmt::Debug> {
    /// Index of the failing instruction. For failures raised after the last
    /// instruction (open group, fee reserve settlement) this is the index of
    /// the last instruction.
    pub index: usize,
    pub instructions: Vec<Instruction>,
    /// Reducer state before the failing instruction was applied.
    pub reducer_state: Option<R>,
    #[source]
    pub cause: ExecutionError,
}

impl<R: fmt::Debug> ConstraintMachineError<R> {
    pub fn category(&self) -> ErrorCategory {
        self.cause.category()
    }

    pub fn failed_instruction(&self) -> Option<&Instruction> {
        self.instructions.get(self.index)
    }
}
