//! The constraint machine.
//!
//! Walks a transaction's instructions in order, resolving every substate
//! operand, dispatching it to the procedure registered for the current reducer
//! state, and recording the resulting state updates per particle group. The
//! walk is pure: committed state is only read, and the same store, context
//! and instructions always produce the same result.
//!
//! Within one transaction the machine tracks:
//! - substates created so far (addressable by boot-up index),
//! - committed and virtual substates already shut down,
//! - resource definitions created so far.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tessera_types::{PermissionLevel, ResourceAddr, SubstateId, TypeTag};
use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::error::{ConstraintMachineError, ExecutionError};
use crate::instruction::{Instruction, Op, OpSignature, SubstateIndex};
use crate::meter::Meter;
use crate::procedure::{
    IndexedSubstates, Procedure, ProcedureInput, ProcedureKey, Procedures, ReducerKind,
};
use crate::store::{
    CmStore, ReducerState, ResourceDefinition, Resources, StateObject, SubstateDeserializer,
    VirtualSubstateDeserializer,
};

// ============================================================================
// State Updates
// ============================================================================

/// A substate created or consumed by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate<P> {
    /// `Up` or `Down`.
    pub op: Op,
    pub instruction_index: usize,
    pub substate_id: SubstateId,
    pub type_tag: TypeTag,
    pub state: P,
    /// Encoding of the substate. `None` for virtual substates, which only
    /// exist as a parent plus a key.
    pub raw: Option<Bytes>,
}

impl<P> StateUpdate<P> {
    pub fn is_up(&self) -> bool {
        self.op == Op::Up
    }
}

// ============================================================================
// Validation State
// ============================================================================

#[derive(Debug, Clone)]
struct LocalSubstate<P> {
    id: SubstateId,
    state: P,
    raw: Bytes,
}

enum Origin {
    Local(u32),
    Remote(SubstateId),
}

struct IndexedEntry<P> {
    origin: Origin,
    id: SubstateId,
    state: P,
    raw: Bytes,
}

/// Per-transaction view of ledger state: committed state overlaid with what
/// the transaction has created and consumed so far.
struct ValidationState<'a, P> {
    store: &'a dyn CmStore,
    deserialization: &'a dyn SubstateDeserializer<P>,
    virtual_deserialization: &'a dyn VirtualSubstateDeserializer<P>,
    local_resources: HashMap<ResourceAddr, ResourceDefinition>,
    local_up: BTreeMap<u32, LocalSubstate<P>>,
    down: HashSet<SubstateId>,
    bootup_count: u32,
}

impl<'a, P: StateObject> ValidationState<'a, P> {
    fn new(
        store: &'a dyn CmStore,
        deserialization: &'a dyn SubstateDeserializer<P>,
        virtual_deserialization: &'a dyn VirtualSubstateDeserializer<P>,
    ) -> Self {
        Self {
            store,
            deserialization,
            virtual_deserialization,
            local_resources: HashMap::new(),
            local_up: BTreeMap::new(),
            down: HashSet::new(),
            bootup_count: 0,
        }
    }

    fn decode_stored(&self, raw: &[u8]) -> Result<P, ExecutionError> {
        let (state, _) = self.deserialization.deserialize(raw)?;
        Ok(state)
    }

    /// Decodes the encoding of a substate being created. The encoding must
    /// be consumed entirely.
    fn decode_up(&self, raw: &[u8]) -> Result<P, ExecutionError> {
        let (state, consumed) = self.deserialization.deserialize(raw)?;
        if consumed < raw.len() {
            return Err(ExecutionError::TrailingBytes {
                remaining: raw.len() - consumed,
            });
        }
        Ok(state)
    }

    fn boot_up(&mut self, id: SubstateId, state: P, raw: Bytes) {
        if let Some(resource) = state.as_resource() {
            self.local_resources
                .insert(resource.addr.clone(), resource.clone());
        }
        self.local_up
            .insert(self.bootup_count, LocalSubstate { id, state, raw });
        self.bootup_count += 1;
    }

    // ------------------------------------------------------------------------
    // Committed substates
    // ------------------------------------------------------------------------

    fn read(&self, id: &SubstateId) -> Result<(P, Bytes), ExecutionError> {
        if self.down.contains(id) {
            return Err(ExecutionError::SubstateAlreadyDown(id.clone()));
        }
        let raw = self
            .store
            .load_substate(id)
            .ok_or_else(|| ExecutionError::SubstateNotFound(id.clone()))?;
        Ok((self.decode_stored(&raw)?, raw))
    }

    fn shutdown(&mut self, id: &SubstateId) -> Result<(P, Bytes), ExecutionError> {
        let substate = self.read(id)?;
        self.down.insert(id.clone());
        Ok(substate)
    }

    fn virtual_read(&self, id: &SubstateId) -> Result<P, ExecutionError> {
        if self.down.contains(id) {
            return Err(ExecutionError::VirtualSubstateAlreadyDown(id.clone()));
        }
        let key = id
            .virtual_key()
            .ok_or_else(|| ExecutionError::VirtualParentStateDoesNotExist(id.clone()))?;
        let parent_raw = self.store.verify_virtual_substate(id)?;
        let parent = self.decode_stored(&parent_raw)?;
        self.synthesize(id, &parent, key)
    }

    fn virtual_shutdown(&mut self, id: &SubstateId) -> Result<P, ExecutionError> {
        let state = self.virtual_read(id)?;
        self.down.insert(id.clone());
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Local substates
    // ------------------------------------------------------------------------

    fn local_read(&self, index: u32) -> Result<LocalSubstate<P>, ExecutionError> {
        self.local_up
            .get(&index)
            .cloned()
            .ok_or(ExecutionError::LocalSubstateNotFound(index))
    }

    fn local_shutdown(&mut self, index: u32) -> Result<LocalSubstate<P>, ExecutionError> {
        self.local_up
            .remove(&index)
            .ok_or(ExecutionError::LocalSubstateNotFound(index))
    }

    fn local_virtual_read(&self, id: &SubstateId) -> Result<P, ExecutionError> {
        if self.down.contains(id) {
            return Err(ExecutionError::VirtualSubstateAlreadyDown(id.clone()));
        }
        let missing_parent = || ExecutionError::VirtualParentStateDoesNotExist(id.clone());
        let parent_index = id
            .virtual_parent()
            .and_then(SubstateId::local_index)
            .ok_or_else(missing_parent)?;
        let key = id.virtual_key().ok_or_else(missing_parent)?;
        let parent = self.local_up.get(&parent_index).ok_or_else(missing_parent)?;
        self.synthesize(id, &parent.state, key)
    }

    fn local_virtual_shutdown(&mut self, id: &SubstateId) -> Result<P, ExecutionError> {
        let state = self.local_virtual_read(id)?;
        self.down.insert(id.clone());
        Ok(state)
    }

    fn synthesize(&self, id: &SubstateId, parent: &P, key: &[u8]) -> Result<P, ExecutionError> {
        let type_byte = parent
            .virtual_parent_data()
            .and_then(|data| data.first().copied())
            .ok_or_else(|| ExecutionError::VirtualParentStateDoesNotExist(id.clone()))?;
        Ok(self.virtual_deserialization.key_to_substate(type_byte, key)?)
    }

    // ------------------------------------------------------------------------
    // Index scans
    // ------------------------------------------------------------------------

    /// Local substates matching `index` in boot-up order, then committed
    /// substates matching `index` that were not shut down.
    ///
    /// The store cursor is opened here and closed when the iterator drops.
    fn indexed_cursor<'s>(
        &'s self,
        index: &'s SubstateIndex,
    ) -> impl Iterator<Item = Result<IndexedEntry<P>, ExecutionError>> + 's {
        let local = self
            .local_up
            .iter()
            .filter(move |(_, local)| index.matches(&local.raw))
            .map(|(bootup, local)| {
                Ok(IndexedEntry {
                    origin: Origin::Local(*bootup),
                    id: local.id.clone(),
                    state: local.state.clone(),
                    raw: local.raw.clone(),
                })
            });

        let remote = self
            .store
            .open_indexed_cursor(index)
            .filter(move |raw| !self.down.contains(&raw.id))
            .map(move |raw| -> Result<IndexedEntry<P>, ExecutionError> {
                let state = self.decode_stored(&raw.data)?;
                Ok(IndexedEntry {
                    origin: Origin::Remote(raw.id.clone()),
                    id: raw.id,
                    state,
                    raw: raw.data,
                })
            });

        local.chain(remote)
    }

    fn consume(&mut self, origin: Origin) {
        match origin {
            Origin::Local(bootup) => {
                self.local_up.remove(&bootup);
            }
            Origin::Remote(id) => {
                self.down.insert(id);
            }
        }
    }
}

impl<P: StateObject> Resources for ValidationState<'_, P> {
    fn load_resource(&self, addr: &ResourceAddr) -> Result<ResourceDefinition, ExecutionError> {
        if let Some(resource) = self.local_resources.get(addr) {
            return Ok(resource.clone());
        }
        let raw = self
            .store
            .load_resource(addr)
            .ok_or_else(|| ExecutionError::NotAResource(addr.clone()))?;
        self.decode_stored(&raw)?
            .as_resource()
            .cloned()
            .ok_or_else(|| ExecutionError::NotAResource(addr.clone()))
    }
}

// ============================================================================
// Reduction
// ============================================================================

struct Reduction<P, R> {
    state: Option<R>,
    expect_end: bool,
    group: Vec<StateUpdate<P>>,
    groups: Vec<Vec<StateUpdate<P>>>,
}

impl<P, R: ReducerState> Reduction<P, R> {
    fn new() -> Self {
        Self {
            state: None,
            expect_end: false,
            group: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn kind(&self) -> ReducerKind {
        self.state
            .as_ref()
            .map_or(ReducerKind::VOID, ReducerState::kind)
    }

    fn is_open(&self) -> bool {
        self.state.is_some() || !self.group.is_empty()
    }
}

fn metered(cause: ExecutionError) -> ExecutionError {
    ExecutionError::Meter(Box::new(cause))
}

// ============================================================================
// Constraint Machine
// ============================================================================

/// Verifies transactions against a procedure table.
pub struct ConstraintMachine<P, R> {
    procedures: Arc<Procedures<P, R>>,
    deserialization: Arc<dyn SubstateDeserializer<P>>,
    virtual_deserialization: Arc<dyn VirtualSubstateDeserializer<P>>,
    meter: Arc<dyn Meter>,
}

impl<P, R> Clone for ConstraintMachine<P, R> {
    fn clone(&self) -> Self {
        Self {
            procedures: Arc::clone(&self.procedures),
            deserialization: Arc::clone(&self.deserialization),
            virtual_deserialization: Arc::clone(&self.virtual_deserialization),
            meter: Arc::clone(&self.meter),
        }
    }
}

impl<P: StateObject, R: ReducerState> ConstraintMachine<P, R> {
    pub fn new(
        procedures: Procedures<P, R>,
        deserialization: impl SubstateDeserializer<P> + 'static,
        virtual_deserialization: impl VirtualSubstateDeserializer<P> + 'static,
        meter: impl Meter + 'static,
    ) -> Self {
        Self {
            procedures: Arc::new(procedures),
            deserialization: Arc::new(deserialization),
            virtual_deserialization: Arc::new(virtual_deserialization),
            meter: Arc::new(meter),
        }
    }

    /// Same rules and decoding with a different fee meter.
    pub fn with_meter(&self, meter: impl Meter + 'static) -> Self {
        Self {
            meter: Arc::new(meter),
            ..self.clone()
        }
    }

    pub fn procedures(&self) -> &Procedures<P, R> {
        &self.procedures
    }

    /// Verifies `instructions`, returning the state updates of each particle
    /// group in order.
    ///
    /// Stops at the first failing instruction. After the last instruction
    /// the context is destroyed, which fails unless the fee reserve settles
    /// to exactly zero.
    pub fn verify(
        &self,
        store: &dyn CmStore,
        ctx: &mut ExecutionContext,
        instructions: &[Instruction],
    ) -> Result<Vec<Vec<StateUpdate<P>>>, ConstraintMachineError<R>> {
        let mut validation = ValidationState::new(
            store,
            self.deserialization.as_ref(),
            self.virtual_deserialization.as_ref(),
        );
        let mut reduction = Reduction::new();
        let last = instructions.len().saturating_sub(1);

        if let Err(cause) = self.meter.on_start(ctx) {
            return Err(reject(instructions, 0, None, metered(cause)));
        }

        for (index, instruction) in instructions.iter().enumerate() {
            if let Err(cause) = self.apply(index, instruction, &mut validation, &mut reduction, ctx) {
                return Err(reject(instructions, index, reduction.state, cause));
            }
        }

        if reduction.is_open() {
            return Err(reject(
                instructions,
                last,
                reduction.state,
                ExecutionError::UnterminatedGroup,
            ));
        }

        if let Err(cause) = ctx.destroy() {
            return Err(reject(instructions, last, None, cause));
        }

        trace!(
            instructions = instructions.len(),
            groups = reduction.groups.len(),
            "transaction verified"
        );
        Ok(reduction.groups)
    }

    fn apply(
        &self,
        index: usize,
        instruction: &Instruction,
        validation: &mut ValidationState<'_, P>,
        reduction: &mut Reduction<P, R>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if reduction.expect_end && *instruction != Instruction::End {
            return Err(ExecutionError::MissingExpectedEnd);
        }

        match instruction {
            Instruction::Syscall(call) => {
                self.reduce(
                    OpSignature::syscall(),
                    ProcedureInput::Call(call),
                    reduction,
                    &*validation,
                    ctx,
                )?;
            }

            // ================================================================
            // Reads
            // ================================================================
            Instruction::Read(id) => {
                let (state, _) = validation.read(id)?;
                self.reduce_read(&state, reduction, &*validation, ctx)?;
            }
            Instruction::VirtualRead(id) => {
                let state = validation.virtual_read(id)?;
                self.reduce_read(&state, reduction, &*validation, ctx)?;
            }
            Instruction::LocalRead(bootup) => {
                let local = validation.local_read(*bootup)?;
                self.reduce_read(&local.state, reduction, &*validation, ctx)?;
            }
            Instruction::LocalVirtualRead(id) => {
                let state = validation.local_virtual_read(id)?;
                self.reduce_read(&state, reduction, &*validation, ctx)?;
            }
            Instruction::ReadIndex(substate_index) => {
                self.scan(index, substate_index, Op::ReadIndex, validation, reduction, ctx)?;
            }
            Instruction::DownIndex(substate_index) => {
                self.scan(index, substate_index, Op::DownIndex, validation, reduction, ctx)?;
            }

            // ================================================================
            // State updates
            // ================================================================
            Instruction::Up(up) => {
                let state = validation.decode_up(&up.data)?;
                validation.boot_up(up.id.clone(), state.clone(), up.data.clone());
                let update = StateUpdate {
                    op: Op::Up,
                    instruction_index: index,
                    substate_id: up.id.clone(),
                    type_tag: state.type_tag(),
                    state,
                    raw: Some(up.data.clone()),
                };
                self.reduce_update(update, reduction, &*validation, ctx)?;
            }
            Instruction::Down(id) => {
                let (state, raw) = validation.shutdown(id)?;
                let update = down_update(index, id.clone(), state, Some(raw));
                self.reduce_update(update, reduction, &*validation, ctx)?;
            }
            Instruction::VirtualDown(id) => {
                let state = validation.virtual_shutdown(id)?;
                let update = down_update(index, id.clone(), state, None);
                self.reduce_update(update, reduction, &*validation, ctx)?;
            }
            Instruction::LocalDown(bootup) => {
                let local = validation.local_shutdown(*bootup)?;
                let update = down_update(index, local.id, local.state, Some(local.raw));
                self.reduce_update(update, reduction, &*validation, ctx)?;
            }
            Instruction::LocalVirtualDown(id) => {
                let state = validation.local_virtual_shutdown(id)?;
                let update = down_update(index, id.clone(), state, None);
                self.reduce_update(update, reduction, &*validation, ctx)?;
            }

            // ================================================================
            // Group boundaries and markers
            // ================================================================
            Instruction::End => self.end_group(reduction, &*validation, ctx)?,
            Instruction::Sig => {
                if ctx.permission_level() != PermissionLevel::System {
                    self.meter.on_sig_instruction(ctx).map_err(metered)?;
                    ctx.sig()?;
                }
            }
            Instruction::Msg(_) | Instruction::Header { .. } => {}
            Instruction::Unknown { opcode } => return Err(ExecutionError::UnknownOp(*opcode)),
        }

        Ok(())
    }

    fn reduce_read(
        &self,
        state: &P,
        reduction: &mut Reduction<P, R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let op = OpSignature::substate(Op::Read, state.type_tag());
        self.reduce(op, ProcedureInput::Substate(state), reduction, resources, ctx)?;
        reduction.expect_end = reduction.state.is_none();
        Ok(())
    }

    fn reduce_update(
        &self,
        update: StateUpdate<P>,
        reduction: &mut Reduction<P, R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let op = OpSignature::substate(update.op, update.type_tag);
        let state = update.state.clone();
        reduction.group.push(update);
        self.reduce(op, ProcedureInput::Substate(&state), reduction, resources, ctx)?;
        reduction.expect_end = reduction.state.is_none();
        Ok(())
    }

    /// Runs an index scan. For `DownIndex`, every substate the procedure
    /// pulls from the scan is shut down once the procedure returns.
    fn scan(
        &self,
        instruction_index: usize,
        index: &SubstateIndex,
        op: Op,
        validation: &mut ValidationState<'_, P>,
        reduction: &mut Reduction<P, R>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if !validation.deserialization.contains_tag(index.type_tag()) {
            return Err(ExecutionError::UnknownSubstateType(index.type_tag()));
        }
        let consuming = op == Op::DownIndex;
        let mut scanned = Vec::new();
        let mut consumed = Vec::new();

        {
            let view: &ValidationState<'_, P> = validation;
            let mut substates = view
                .indexed_cursor(index)
                .map(|entry| -> Result<P, ExecutionError> {
                    let entry = entry?;
                    if consuming {
                        scanned.push(down_update(
                            instruction_index,
                            entry.id,
                            entry.state.clone(),
                            Some(entry.raw),
                        ));
                        consumed.push(entry.origin);
                    }
                    Ok(entry.state)
                });
            let input = ProcedureInput::Index(IndexedSubstates::new(index, &mut substates));
            self.reduce(
                OpSignature::substate(op, index.type_tag()),
                input,
                reduction,
                view,
                ctx,
            )?;
        }

        for origin in consumed {
            validation.consume(origin);
        }
        reduction.group.extend(scanned);
        Ok(())
    }

    fn end_group(
        &self,
        reduction: &mut Reduction<P, R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if reduction.state.is_some() {
            let kind = reduction.kind();
            self.reduce(OpSignature::end(), ProcedureInput::End, reduction, resources, ctx)?;
            if reduction.state.is_some() {
                return Err(ExecutionError::UnclosedGroup(kind));
            }
        }
        reduction.groups.push(std::mem::take(&mut reduction.group));
        reduction.expect_end = false;
        Ok(())
    }

    /// Looks up the procedure for the current reducer state and `op`, and
    /// folds `input` into the reducer state.
    ///
    /// On failure the reducer state is left as it was.
    fn reduce(
        &self,
        op: OpSignature,
        input: ProcedureInput<'_, P>,
        reduction: &mut Reduction<P, R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let key = ProcedureKey::new(reduction.kind(), op);
        let procedure = self.procedures.get(&key)?;
        trace!(%key, "calling procedure");
        let next = self.call_procedure(&key, procedure, input, reduction.state.clone(), resources, ctx)?;
        reduction.state = next;
        Ok(())
    }

    fn call_procedure(
        &self,
        key: &ProcedureKey,
        procedure: &dyn Procedure<P, R>,
        input: ProcedureInput<'_, P>,
        state: Option<R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<R>, ExecutionError> {
        let required = procedure.required_level(&input);
        ctx.verify_permission_level(required)?;

        if ctx.permission_level() != PermissionLevel::System {
            let metering = match required {
                PermissionLevel::User => self.meter.on_user_procedure(key, ctx),
                PermissionLevel::SuperUser => self.meter.on_super_user_procedure(key, ctx),
                PermissionLevel::System => Ok(()),
            };
            metering.map_err(metered)?;

            if !ctx.skip_authorization() {
                procedure
                    .authorize(&input, resources, ctx)
                    .map_err(ExecutionError::Unauthorized)?;
            }
        }

        procedure.call(input, state, resources, ctx)
    }
}

fn down_update<P: StateObject>(
    instruction_index: usize,
    substate_id: SubstateId,
    state: P,
    raw: Option<Bytes>,
) -> StateUpdate<P> {
    StateUpdate {
        op: Op::Down,
        instruction_index,
        substate_id,
        type_tag: state.type_tag(),
        state,
        raw,
    }
}

fn reject<R: ReducerState>(
    instructions: &[Instruction],
    index: usize,
    reducer_state: Option<R>,
    cause: ExecutionError,
) -> ConstraintMachineError<R> {
    debug!(
        index,
        category = %cause.category(),
        error = %cause,
        "transaction rejected"
    );
    ConstraintMachineError {
        index,
        instructions: instructions.to_vec(),
        reducer_state,
        cause,
    }
}
