//! Procedures: the ledger's state-transition rules.
//!
//! A procedure is looked up by the kind of the current reducer state and the
//! signature of the operation being applied. It declares the permission level
//! it requires, may authorize the caller, and folds its input into the next
//! reducer state. Returning `None` (void) marks the end of a reduction.

use std::collections::HashMap;
use std::fmt;

use tessera_types::PermissionLevel;

use crate::context::ExecutionContext;
use crate::error::{AuthorizationError, ExecutionError};
use crate::instruction::{CallData, OpSignature, SubstateIndex};
use crate::store::Resources;

// ============================================================================
// Procedure Keys
// ============================================================================

/// Name of a reducer state variant. [`ReducerKind::VOID`] stands for the
/// absence of reducer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReducerKind(&'static str);

impl ReducerKind {
    pub const VOID: ReducerKind = ReducerKind("void");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }

    pub fn is_void(&self) -> bool {
        *self == Self::VOID
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcedureKey {
    pub reducer: ReducerKind,
    pub op: OpSignature,
}

impl ProcedureKey {
    pub const fn new(reducer: ReducerKind, op: OpSignature) -> Self {
        Self { reducer, op }
    }
}

impl fmt::Display for ProcedureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.reducer, self.op)
    }
}

// ============================================================================
// Procedure Input
// ============================================================================

/// What a procedure is applied to.
pub enum ProcedureInput<'a, P> {
    Call(&'a CallData),
    Substate(&'a P),
    Index(IndexedSubstates<'a, P>),
    /// The group is being closed.
    End,
}

impl<P: fmt::Debug> fmt::Debug for ProcedureInput<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(call) => f.debug_tuple("Call").field(call).finish(),
            Self::Substate(substate) => f.debug_tuple("Substate").field(substate).finish(),
            Self::Index(scan) => f.debug_tuple("Index").field(scan.index()).finish(),
            Self::End => f.write_str("End"),
        }
    }
}

/// Substates produced by an index scan, local substates first.
///
/// For a consuming scan, each substate pulled from this iterator is shut
/// down; substates the procedure never pulls are left untouched.
pub struct IndexedSubstates<'a, P> {
    index: &'a SubstateIndex,
    substates: &'a mut dyn Iterator<Item = Result<P, ExecutionError>>,
}

impl<'a, P> IndexedSubstates<'a, P> {
    pub fn new(
        index: &'a SubstateIndex,
        substates: &'a mut dyn Iterator<Item = Result<P, ExecutionError>>,
    ) -> Self {
        Self { index, substates }
    }

    pub fn index(&self) -> &SubstateIndex {
        self.index
    }
}

impl<P> Iterator for IndexedSubstates<'_, P> {
    type Item = Result<P, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.substates.next()
    }
}

// ============================================================================
// Procedure Trait
// ============================================================================

pub trait Procedure<P, R>: Send + Sync {
    fn required_level(&self, input: &ProcedureInput<'_, P>) -> PermissionLevel;

    /// Skipped for system transactions and when the context skips
    /// authorization.
    fn authorize(
        &self,
        _input: &ProcedureInput<'_, P>,
        _resources: &dyn Resources,
        _ctx: &ExecutionContext,
    ) -> Result<(), AuthorizationError> {
        Ok(())
    }

    fn call(
        &self,
        input: ProcedureInput<'_, P>,
        state: Option<R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<R>, ExecutionError>;
}

type AuthorizeFn<P> = dyn Fn(&ProcedureInput<'_, P>, &dyn Resources, &ExecutionContext) -> Result<(), AuthorizationError>
    + Send
    + Sync;

type CallFn<P, R> = dyn Fn(
        ProcedureInput<'_, P>,
        Option<R>,
        &dyn Resources,
        &mut ExecutionContext,
    ) -> Result<Option<R>, ExecutionError>
    + Send
    + Sync;

/// A procedure built from closures.
pub struct FnProcedure<P, R> {
    level: PermissionLevel,
    authorize: Option<Box<AuthorizeFn<P>>>,
    call: Box<CallFn<P, R>>,
}

impl<P, R> FnProcedure<P, R> {
    pub fn new<F>(level: PermissionLevel, call: F) -> Self
    where
        F: Fn(
                ProcedureInput<'_, P>,
                Option<R>,
                &dyn Resources,
                &mut ExecutionContext,
            ) -> Result<Option<R>, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            level,
            authorize: None,
            call: Box::new(call),
        }
    }

    pub fn with_authorizer<A>(mut self, authorize: A) -> Self
    where
        A: Fn(&ProcedureInput<'_, P>, &dyn Resources, &ExecutionContext) -> Result<(), AuthorizationError>
            + Send
            + Sync
            + 'static,
    {
        self.authorize = Some(Box::new(authorize));
        self
    }
}

impl<P, R> Procedure<P, R> for FnProcedure<P, R> {
    fn required_level(&self, _input: &ProcedureInput<'_, P>) -> PermissionLevel {
        self.level
    }

    fn authorize(
        &self,
        input: &ProcedureInput<'_, P>,
        resources: &dyn Resources,
        ctx: &ExecutionContext,
    ) -> Result<(), AuthorizationError> {
        match &self.authorize {
            Some(authorize) => authorize(input, resources, ctx),
            None => Ok(()),
        }
    }

    fn call(
        &self,
        input: ProcedureInput<'_, P>,
        state: Option<R>,
        resources: &dyn Resources,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<R>, ExecutionError> {
        (self.call)(input, state, resources, ctx)
    }
}

// ============================================================================
// Procedure Table
// ============================================================================

/// Procedures keyed by (reducer kind, operation signature).
pub struct Procedures<P, R> {
    procedures: HashMap<ProcedureKey, Box<dyn Procedure<P, R>>>,
}

impl<P, R> Procedures<P, R> {
    pub fn builder() -> ProceduresBuilder<P, R> {
        ProceduresBuilder {
            procedures: HashMap::new(),
        }
    }

    pub fn get(&self, key: &ProcedureKey) -> Result<&dyn Procedure<P, R>, ExecutionError> {
        self.procedures
            .get(key)
            .map(|procedure| procedure.as_ref())
            .ok_or(ExecutionError::MissingProcedure(*key))
    }

    pub fn contains(&self, key: &ProcedureKey) -> bool {
        self.procedures.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl<P, R> fmt::Debug for Procedures<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.procedures.keys().collect();
        keys.sort();
        f.debug_struct("Procedures").field("keys", &keys).finish()
    }
}

pub struct ProceduresBuilder<P, R> {
    procedures: HashMap<ProcedureKey, Box<dyn Procedure<P, R>>>,
}

impl<P, R> ProceduresBuilder<P, R> {
    /// Registers a procedure. A later registration under the same key
    /// replaces the earlier one.
    pub fn add(mut self, key: ProcedureKey, procedure: impl Procedure<P, R> + 'static) -> Self {
        self.procedures.insert(key, Box::new(procedure));
        self
    }

    pub fn build(self) -> Procedures<P, R> {
        Procedures {
            procedures: self.procedures,
        }
    }
}
