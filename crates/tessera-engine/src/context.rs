//! Per-transaction execution context.
//!
//! Tracks the fee reserve, an optional system loan that pre-funds it, the
//! signature budget, the permission level and signer key, and events emitted
//! by procedures. [`ExecutionContext::destroy`] settles the reserve after the
//! last instruction: the loan is repaid out of the reserve and the reserve
//! must end up exactly empty.

use bytes::Bytes;
use tessera_types::{Amount, PermissionLevel, ResourceAddr, SignerKey, Txn};

use crate::error::ExecutionError;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    txn: Txn,
    level: PermissionLevel,
    skip_authorization: bool,
    key: Option<SignerKey>,
    fee_resource: ResourceAddr,
    reserve: Amount,
    fee_deposit: Option<Amount>,
    system_loan: Amount,
    charged_one_time_fee: bool,
    sigs_left: u32,
    disable_resource_alloc_and_destroy: bool,
    events: Vec<Bytes>,
}

impl ExecutionContext {
    pub fn new(txn: Txn, level: PermissionLevel, sigs_left: u32) -> Self {
        Self {
            txn,
            level,
            skip_authorization: false,
            key: None,
            fee_resource: ResourceAddr::native(),
            reserve: Amount::ZERO,
            fee_deposit: None,
            system_loan: Amount::ZERO,
            charged_one_time_fee: false,
            sigs_left,
            disable_resource_alloc_and_destroy: false,
            events: Vec::new(),
        }
    }

    pub fn with_skip_authorization(mut self, skip: bool) -> Self {
        self.skip_authorization = skip;
        self
    }

    /// Overrides the resource the fee reserve accepts. Defaults to
    /// [`ResourceAddr::native`].
    pub fn with_fee_resource(mut self, resource: ResourceAddr) -> Self {
        self.fee_resource = resource;
        self
    }

    // ========================================================================
    // Fee reserve
    // ========================================================================

    /// Lends `amount` to the transaction, crediting the fee reserve.
    ///
    /// The loan is repaid from the reserve when the context is destroyed.
    pub fn add_system_loan(&mut self, amount: Amount) -> Result<(), ExecutionError> {
        self.system_loan = self
            .system_loan
            .checked_add(amount)
            .ok_or(ExecutionError::AmountOverflow)?;
        self.reserve = self
            .reserve
            .checked_add(amount)
            .ok_or(ExecutionError::AmountOverflow)?;
        Ok(())
    }

    /// Deposits into the fee reserve. Allowed once per transaction and only
    /// in the fee resource.
    pub fn deposit_fee_reserve(
        &mut self,
        resource: &ResourceAddr,
        amount: Amount,
    ) -> Result<(), ExecutionError> {
        if self.fee_deposit.is_some() {
            return Err(ExecutionError::MultipleFeeReserveDeposit);
        }
        if *resource != self.fee_resource {
            return Err(ExecutionError::InvalidFeeResource(resource.clone()));
        }

        self.reserve = self
            .reserve
            .checked_add(amount)
            .ok_or(ExecutionError::AmountOverflow)?;
        self.fee_deposit = Some(amount);
        Ok(())
    }

    /// Withdraws from the fee reserve, e.g. to refund an overpayment.
    pub fn withdraw_fee_reserve(&mut self, amount: Amount) -> Result<Amount, ExecutionError> {
        self.debit(amount)?;
        Ok(amount)
    }

    /// Charges `amount` against the fee reserve.
    pub fn charge(&mut self, amount: Amount) -> Result<(), ExecutionError> {
        self.debit(amount)
    }

    /// Charges a fee computed from the transaction, at most once.
    ///
    /// Once a charge succeeds, later calls are no-ops.
    pub fn charge_one_time_fee(
        &mut self,
        fee: impl FnOnce(&Txn) -> Result<Amount, ExecutionError>,
    ) -> Result<(), ExecutionError> {
        if self.charged_one_time_fee {
            return Ok(());
        }
        let amount = fee(&self.txn)?;
        self.debit(amount)?;
        self.charged_one_time_fee = true;
        Ok(())
    }

    /// Repays the outstanding system loan from the fee reserve.
    pub fn pay_off_loan(&mut self) -> Result<(), ExecutionError> {
        if self.system_loan.is_zero() {
            return Ok(());
        }
        if self.reserve < self.system_loan {
            return Err(ExecutionError::DefaultedSystemLoan {
                shortfall: self.system_loan.saturating_sub(self.reserve),
                fee_deposit: self.fee_deposit.unwrap_or(Amount::ZERO),
            });
        }

        self.reserve = self.reserve.saturating_sub(self.system_loan);
        self.system_loan = Amount::ZERO;
        Ok(())
    }

    /// Settles the transaction: repays the loan and requires the fee
    /// reserve to be exactly empty.
    pub fn destroy(&mut self) -> Result<(), ExecutionError> {
        self.pay_off_loan()?;
        if !self.reserve.is_zero() {
            return Err(ExecutionError::ReserveNotEmpty(self.reserve));
        }
        Ok(())
    }

    fn debit(&mut self, amount: Amount) -> Result<(), ExecutionError> {
        self.reserve = self
            .reserve
            .checked_sub(amount)
            .ok_or(ExecutionError::DepletedFeeReserve {
                requested: amount,
                available: self.reserve,
            })?;
        Ok(())
    }

    pub fn reserve(&self) -> Amount {
        self.reserve
    }

    pub fn system_loan(&self) -> Amount {
        self.system_loan
    }

    pub fn fee_deposit(&self) -> Option<Amount> {
        self.fee_deposit
    }

    // ========================================================================
    // Authority
    // ========================================================================

    pub fn permission_level(&self) -> PermissionLevel {
        self.level
    }

    pub fn skip_authorization(&self) -> bool {
        self.skip_authorization
    }

    /// Checks the transaction may run a procedure requiring `required`.
    ///
    /// Privileged procedures additionally must not run in a signed
    /// transaction.
    pub fn verify_permission_level(&self, required: PermissionLevel) -> Result<(), ExecutionError> {
        if self.level < required {
            return Err(ExecutionError::InvalidPermission {
                required,
                actual: self.level,
            });
        }
        if required >= PermissionLevel::SuperUser && self.key.is_some() {
            return Err(ExecutionError::SignedSystem);
        }
        Ok(())
    }

    pub fn key(&self) -> Option<&SignerKey> {
        self.key.as_ref()
    }

    pub fn set_key(&mut self, key: SignerKey) {
        self.key = Some(key);
    }

    /// Consumes one unit of the signature budget.
    pub fn sig(&mut self) -> Result<(), ExecutionError> {
        self.sigs_left = self
            .sigs_left
            .checked_sub(1)
            .ok_or(ExecutionError::SignatureBudgetExhausted)?;
        Ok(())
    }

    pub fn sigs_left(&self) -> u32 {
        self.sigs_left
    }

    // ========================================================================
    // Resources and events
    // ========================================================================

    pub fn set_disable_resource_alloc_and_destroy(&mut self, disable: bool) {
        self.disable_resource_alloc_and_destroy = disable;
    }

    pub fn verify_can_alloc_and_destroy_resources(&self) -> Result<(), ExecutionError> {
        if self.disable_resource_alloc_and_destroy {
            return Err(ExecutionError::ResourceAllocationDisabled);
        }
        Ok(())
    }

    pub fn emit_event(&mut self, event: impl Into<Bytes>) {
        self.events.push(event.into());
    }

    pub fn events(&self) -> &[Bytes] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.events)
    }

    pub fn txn(&self) -> &Txn {
        &self.txn
    }
}
