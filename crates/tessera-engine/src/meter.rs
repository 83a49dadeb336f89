//! Fee metering hooks.
//!
//! The interpreter calls into a [`Meter`] before every non-system procedure
//! and on every signature marker. Errors raised here are reported as
//! [`ExecutionError::Meter`].

use tessera_types::{Amount, Txn};

use crate::context::ExecutionContext;
use crate::error::ExecutionError;
use crate::instruction::Op;
use crate::procedure::ProcedureKey;

pub trait Meter: Send + Sync {
    /// Called once before the first instruction.
    fn on_start(&self, _ctx: &mut ExecutionContext) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn on_user_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError>;

    fn on_super_user_procedure(
        &self,
        _key: &ProcedureKey,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn on_sig_instruction(&self, _ctx: &mut ExecutionContext) -> Result<(), ExecutionError> {
        Ok(())
    }
}

impl<M: Meter + ?Sized> Meter for Box<M> {
    fn on_start(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionError> {
        (**self).on_start(ctx)
    }

    fn on_user_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        (**self).on_user_procedure(key, ctx)
    }

    fn on_super_user_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        (**self).on_super_user_procedure(key, ctx)
    }

    fn on_sig_instruction(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionError> {
        (**self).on_sig_instruction(ctx)
    }
}

/// Charges nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn on_user_procedure(
        &self,
        _key: &ProcedureKey,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Charges a flat fee once per transaction, on the first user procedure that
/// is not a system call.
///
/// System calls are exempt so a transaction can fund its fee reserve before
/// being charged.
#[derive(Debug, Clone, Copy)]
pub struct FixedFeeMeter {
    fee: Amount,
}

impl FixedFeeMeter {
    pub fn new(fee: Amount) -> Self {
        Self { fee }
    }
}

impl Meter for FixedFeeMeter {
    fn on_user_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if key.op.op == Op::Syscall {
            return Ok(());
        }
        let fee = self.fee;
        ctx.charge_one_time_fee(|_| Ok(fee))
    }
}

/// Charges once per transaction in proportion to its serialized size.
#[derive(Debug, Clone, Copy)]
pub struct TxnSizeFeeMeter {
    fee_per_byte: Amount,
}

impl TxnSizeFeeMeter {
    pub fn new(fee_per_byte: Amount) -> Self {
        Self { fee_per_byte }
    }

    pub fn fee_for(&self, txn: &Txn) -> Result<Amount, ExecutionError> {
        self.fee_per_byte
            .checked_mul(txn.size() as u128)
            .ok_or(ExecutionError::AmountOverflow)
    }
}

impl Meter for TxnSizeFeeMeter {
    fn on_user_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if key.op.op == Op::Syscall {
            return Ok(());
        }
        ctx.charge_one_time_fee(|txn| self.fee_for(txn))
    }
}
