//! Unit tests for tessera-engine
//!
//! The machine is exercised against an in-memory store and a small token
//! rule set: tokens are consumed into a transfer and recreated for other
//! owners, and every transfer must balance before its group ends.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use bytes::Bytes;
use test_case::test_case;
use tessera_types::{Amount, Hash, PermissionLevel, ResourceAddr, SignerKey, SubstateId, Txn, TypeTag};

use crate::context::ExecutionContext;
use crate::error::{AuthorizationError, DeserializeError, ErrorCategory, ExecutionError};
use crate::instruction::{CallData, Instruction, Op, OpSignature, SubstateIndex, UpSubstate};
use crate::machine::ConstraintMachine;
use crate::meter::{FixedFeeMeter, NoopMeter};
use crate::procedure::{FnProcedure, ProcedureInput, ProcedureKey, Procedures, ReducerKind};
use crate::store::{
    CmStore, RawSubstate, ReducerState, ResourceDefinition, StateObject, SubstateDeserializer,
    VirtualSubstateDeserializer,
};

// ============================================================================
// Test Substates
// ============================================================================

const TOKENS: TypeTag = TypeTag::new(0x02);
const RESOURCE: TypeTag = TypeTag::new(0x03);
const VIRTUAL_PARENT: TypeTag = TypeTag::new(0x04);
const VALIDATOR: TypeTag = TypeTag::new(0x05);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Substate {
    Tokens { owner: u8, amount: u64 },
    Resource(ResourceDefinition),
    VirtualParent { child: u8 },
    Validator { key: u8 },
}

impl StateObject for Substate {
    fn type_tag(&self) -> TypeTag {
        match self {
            Self::Tokens { .. } => TOKENS,
            Self::Resource(_) => RESOURCE,
            Self::VirtualParent { .. } => VIRTUAL_PARENT,
            Self::Validator { .. } => VALIDATOR,
        }
    }

    fn as_resource(&self) -> Option<&ResourceDefinition> {
        match self {
            Self::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    fn virtual_parent_data(&self) -> Option<&[u8]> {
        match self {
            Self::VirtualParent { child } => Some(std::slice::from_ref(child)),
            _ => None,
        }
    }
}

fn tokens(owner: u8, amount: u64) -> Bytes {
    let mut buf = vec![TOKENS.as_byte(), owner];
    buf.extend_from_slice(&amount.to_be_bytes());
    Bytes::from(buf)
}

fn resource(addr: &[u8]) -> Bytes {
    let mut buf = vec![RESOURCE.as_byte(), addr.len() as u8];
    buf.extend_from_slice(addr);
    Bytes::from(buf)
}

fn virtual_parent(child: TypeTag) -> Bytes {
    Bytes::from(vec![VIRTUAL_PARENT.as_byte(), child.as_byte()])
}

struct TestDeserializer;

impl SubstateDeserializer<Substate> for TestDeserializer {
    fn deserialize(&self, buf: &[u8]) -> Result<(Substate, usize), DeserializeError> {
        let truncated = || DeserializeError("truncated substate".to_string());
        let tag = TypeTag::new(*buf.first().ok_or_else(truncated)?);
        match tag {
            TOKENS => {
                let owner = *buf.get(1).ok_or_else(truncated)?;
                let amount: [u8; 8] = buf
                    .get(2..10)
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(truncated)?;
                let amount = u64::from_be_bytes(amount);
                Ok((Substate::Tokens { owner, amount }, 10))
            }
            RESOURCE => {
                let len = usize::from(*buf.get(1).ok_or_else(truncated)?);
                let addr = buf.get(2..2 + len).ok_or_else(truncated)?;
                let definition = ResourceDefinition::new(ResourceAddr::new(addr.to_vec()));
                Ok((Substate::Resource(definition), 2 + len))
            }
            VIRTUAL_PARENT => {
                let child = *buf.get(1).ok_or_else(truncated)?;
                Ok((Substate::VirtualParent { child }, 2))
            }
            VALIDATOR => {
                let key = *buf.get(1).ok_or_else(truncated)?;
                Ok((Substate::Validator { key }, 2))
            }
            other => Err(DeserializeError(format!("unknown tag {other}"))),
        }
    }

    fn contains_tag(&self, tag: TypeTag) -> bool {
        [TOKENS, RESOURCE, VIRTUAL_PARENT, VALIDATOR].contains(&tag)
    }
}

struct TestVirtualDeserializer;

impl VirtualSubstateDeserializer<Substate> for TestVirtualDeserializer {
    fn key_to_substate(&self, type_byte: u8, key: &[u8]) -> Result<Substate, DeserializeError> {
        match (TypeTag::new(type_byte), key) {
            (VALIDATOR, [key]) => Ok(Substate::Validator { key: *key }),
            _ => Err(DeserializeError("not a virtual substate".to_string())),
        }
    }
}

// ============================================================================
// Test Store
// ============================================================================

#[derive(Default)]
struct TestStore {
    substates: BTreeMap<SubstateId, Bytes>,
    resources: HashMap<ResourceAddr, Bytes>,
    virtual_parents: HashMap<SubstateId, Bytes>,
    spent_virtual: HashSet<SubstateId>,
    cursors_opened: Cell<usize>,
    cursors_closed: Rc<Cell<usize>>,
}

impl TestStore {
    fn with_substate(mut self, id: &SubstateId, data: Bytes) -> Self {
        self.substates.insert(id.clone(), data);
        self
    }

    fn with_resource(mut self, addr: &[u8]) -> Self {
        self.resources
            .insert(ResourceAddr::new(addr.to_vec()), resource(addr));
        self
    }

    fn with_virtual_parent(mut self, id: &SubstateId, child: TypeTag) -> Self {
        self.virtual_parents.insert(id.clone(), virtual_parent(child));
        self
    }
}

/// Counts closes so tests can check scans release their cursor.
struct TrackedCursor {
    inner: std::vec::IntoIter<RawSubstate>,
    closed: Rc<Cell<usize>>,
}

impl Iterator for TrackedCursor {
    type Item = RawSubstate;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for TrackedCursor {
    fn drop(&mut self) {
        self.closed.set(self.closed.get() + 1);
    }
}

impl CmStore for TestStore {
    fn load_substate(&self, id: &SubstateId) -> Option<Bytes> {
        self.substates.get(id).cloned()
    }

    fn load_resource(&self, addr: &ResourceAddr) -> Option<Bytes> {
        self.resources.get(addr).cloned()
    }

    fn verify_virtual_substate(&self, id: &SubstateId) -> Result<Bytes, ExecutionError> {
        if self.spent_virtual.contains(id) {
            return Err(ExecutionError::VirtualSubstateAlreadyDown(id.clone()));
        }
        id.virtual_parent()
            .and_then(|parent| self.virtual_parents.get(parent))
            .cloned()
            .ok_or_else(|| ExecutionError::VirtualParentStateDoesNotExist(id.clone()))
    }

    fn open_indexed_cursor<'a>(
        &'a self,
        index: &SubstateIndex,
    ) -> Box<dyn Iterator<Item = RawSubstate> + 'a> {
        self.cursors_opened.set(self.cursors_opened.get() + 1);
        let matching: Vec<_> = self
            .substates
            .iter()
            .filter(|(_, data)| index.matches(data))
            .map(|(id, data)| RawSubstate {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        Box::new(TrackedCursor {
            inner: matching.into_iter(),
            closed: Rc::clone(&self.cursors_closed),
        })
    }
}

// ============================================================================
// Token Rules
// ============================================================================

const TRANSFER: ReducerKind = ReducerKind::new("transfer");
const COUNT: ReducerKind = ReducerKind::new("count");

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reducer {
    Transfer { owner: u8, remaining: u64 },
    Count(usize),
}

impl ReducerState for Reducer {
    fn kind(&self) -> ReducerKind {
        match self {
            Self::Transfer { .. } => TRANSFER,
            Self::Count(_) => COUNT,
        }
    }
}

type Rule = FnProcedure<Substate, Reducer>;

const DEPOSIT_FEE: u8 = 0x00;
const LOOKUP_RESOURCE: u8 = 0x01;

fn key(reducer: ReducerKind, op: Op, tag: TypeTag) -> ProcedureKey {
    ProcedureKey::new(reducer, OpSignature::substate(op, tag))
}

fn token_rules() -> Procedures<Substate, Reducer> {
    let void = ReducerKind::VOID;

    Procedures::builder()
        .add(
            ProcedureKey::new(void, OpSignature::syscall()),
            Rule::new(PermissionLevel::User, |input, _, resources, ctx| {
                let ProcedureInput::Call(call) = input else {
                    return Err(ExecutionError::procedure("expected call data"));
                };
                match call.get(0) {
                    Some(DEPOSIT_FEE) => {
                        let amount: [u8; 8] = call
                            .as_bytes()
                            .get(1..9)
                            .and_then(|bytes| bytes.try_into().ok())
                            .ok_or_else(|| ExecutionError::procedure("bad deposit"))?;
                        ctx.deposit_fee_reserve(
                            &ResourceAddr::native(),
                            Amount::from(u64::from_be_bytes(amount)),
                        )?;
                    }
                    Some(LOOKUP_RESOURCE) => {
                        let addr = ResourceAddr::new(call.as_bytes()[1..].to_vec());
                        let definition = resources.load_resource(&addr)?;
                        ctx.emit_event(definition.addr.as_bytes().to_vec());
                    }
                    _ => return Err(ExecutionError::procedure("unknown syscall")),
                }
                Ok(None)
            }),
        )
        .add(
            key(void, Op::Down, TOKENS),
            Rule::new(PermissionLevel::User, |input, _, _, _| match input {
                ProcedureInput::Substate(Substate::Tokens { owner, amount }) => {
                    Ok(Some(Reducer::Transfer {
                        owner: *owner,
                        remaining: *amount,
                    }))
                }
                _ => Err(ExecutionError::procedure("expected tokens")),
            })
            .with_authorizer(|input, _, ctx| match input {
                ProcedureInput::Substate(Substate::Tokens { owner, .. })
                    if ctx.key() == Some(&SignerKey::new(vec![*owner])) =>
                {
                    Ok(())
                }
                _ => Err(AuthorizationError("tokens not signed by owner".to_string())),
            }),
        )
        .add(
            key(TRANSFER, Op::Up, TOKENS),
            Rule::new(PermissionLevel::User, |input, state, _, _| {
                let (
                    ProcedureInput::Substate(Substate::Tokens { amount, .. }),
                    Some(Reducer::Transfer { owner, remaining }),
                ) = (input, state)
                else {
                    return Err(ExecutionError::procedure("expected tokens"));
                };
                let remaining = remaining
                    .checked_sub(*amount)
                    .ok_or_else(|| ExecutionError::procedure("transfer overspends input"))?;
                Ok((remaining > 0).then_some(Reducer::Transfer { owner, remaining }))
            }),
        )
        .add(
            ProcedureKey::new(TRANSFER, OpSignature::end()),
            Rule::new(PermissionLevel::User, |_, state, _, _| Ok(state)),
        )
        .add(
            key(void, Op::Up, TOKENS),
            Rule::new(PermissionLevel::SuperUser, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::Read, TOKENS),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::Up, RESOURCE),
            Rule::new(PermissionLevel::User, |_, _, _, ctx| {
                ctx.verify_can_alloc_and_destroy_resources()?;
                Ok(None)
            }),
        )
        .add(
            key(void, Op::Read, RESOURCE),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::Up, VIRTUAL_PARENT),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::Down, VALIDATOR),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::Read, VALIDATOR),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .add(
            key(void, Op::DownIndex, TOKENS),
            Rule::new(PermissionLevel::User, |input, _, _, _| {
                let ProcedureInput::Index(substates) = input else {
                    return Err(ExecutionError::procedure("expected index scan"));
                };
                let mut owner = None;
                let mut total: u64 = 0;
                for substate in substates {
                    if let Substate::Tokens { owner: o, amount } = substate? {
                        owner.get_or_insert(o);
                        total = total
                            .checked_add(amount)
                            .ok_or_else(|| ExecutionError::procedure("amount overflow"))?;
                    }
                }
                Ok(owner
                    .filter(|_| total > 0)
                    .map(|owner| Reducer::Transfer {
                        owner,
                        remaining: total,
                    }))
            }),
        )
        .add(
            key(void, Op::ReadIndex, TOKENS),
            Rule::new(PermissionLevel::User, |input, _, _, _| {
                let ProcedureInput::Index(substates) = input else {
                    return Err(ExecutionError::procedure("expected index scan"));
                };
                let mut count = 0;
                for substate in substates {
                    substate?;
                    count += 1;
                }
                Ok(Some(Reducer::Count(count)))
            }),
        )
        .add(
            ProcedureKey::new(COUNT, OpSignature::end()),
            Rule::new(PermissionLevel::User, |_, _, _, _| Ok(None)),
        )
        .build()
}

// ============================================================================
// Test Helpers
// ============================================================================

fn machine() -> ConstraintMachine<Substate, Reducer> {
    ConstraintMachine::new(token_rules(), TestDeserializer, TestVirtualDeserializer, NoopMeter)
}

fn id(name: &str) -> SubstateId {
    SubstateId::stored(name.as_bytes().to_vec())
}

fn txn() -> Txn {
    Txn::new(Hash::ZERO, vec![0u8; 16])
}

fn user_ctx(owner: u8) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(txn(), PermissionLevel::User, 4);
    ctx.set_key(SignerKey::new(vec![owner]));
    ctx
}

fn system_ctx() -> ExecutionContext {
    ExecutionContext::new(txn(), PermissionLevel::System, 0)
}

fn up(name: &str, data: Bytes) -> Instruction {
    Instruction::Up(UpSubstate::new(id(name), data))
}

fn deposit_fee(amount: u64) -> Instruction {
    let mut call = vec![DEPOSIT_FEE];
    call.extend_from_slice(&amount.to_be_bytes());
    Instruction::Syscall(CallData::new(call))
}

fn lookup_resource(addr: &[u8]) -> Instruction {
    let mut call = vec![LOOKUP_RESOURCE];
    call.extend_from_slice(addr);
    Instruction::Syscall(CallData::new(call))
}

fn tokens_index() -> SubstateIndex {
    SubstateIndex::from_prefix(vec![TOKENS.as_byte()]).expect("non-empty prefix")
}

/// Store holding 10 tokens owned by 1 under `s1`.
fn funded_store() -> TestStore {
    TestStore::default().with_substate(&id("s1"), tokens(1, 10))
}

fn transfer_s1() -> Vec<Instruction> {
    vec![
        Instruction::Down(id("s1")),
        up("o1", tokens(2, 10)),
        Instruction::End,
    ]
}

// ============================================================================
// Transfers and Groups
// ============================================================================

#[test]
fn balanced_transfer_produces_one_group() {
    let store = funded_store();
    let mut ctx = user_ctx(1);

    let groups = machine()
        .verify(&store, &mut ctx, &transfer_s1())
        .expect("transfer should verify");

    assert_eq!(groups.len(), 1);
    let updates = &groups[0];
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].op, Op::Down);
    assert_eq!(updates[0].substate_id, id("s1"));
    assert_eq!(updates[0].raw, Some(tokens(1, 10)));
    assert!(updates[1].is_up());
    assert_eq!(updates[1].instruction_index, 1);
    assert_eq!(updates[1].state, Substate::Tokens { owner: 2, amount: 10 });
}

#[test]
fn split_transfer_keeps_instruction_order() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let instructions = vec![
        Instruction::Down(id("s1")),
        up("o1", tokens(2, 4)),
        up("o2", tokens(3, 6)),
        Instruction::End,
    ];

    let groups = machine().verify(&store, &mut ctx, &instructions).unwrap();

    let ids: Vec<_> = groups[0].iter().map(|u| u.substate_id.clone()).collect();
    assert_eq!(ids, vec![id("s1"), id("o1"), id("o2")]);
}

#[test]
fn consumed_substate_cannot_be_spent_again() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let mut instructions = transfer_s1();
    instructions.extend(transfer_s1());

    let err = machine()
        .verify(&store, &mut ctx, &instructions)
        .expect_err("double spend");

    assert_eq!(err.index, 3);
    assert_eq!(err.cause, ExecutionError::SubstateAlreadyDown(id("s1")));
    assert_eq!(err.category(), ErrorCategory::StateConsistency);
    assert_eq!(err.failed_instruction(), Some(&Instruction::Down(id("s1"))));
    assert_eq!(err.instructions.len(), 6);
}

#[test_case(
    user_ctx(1),
    TestStore::default().with_substate(&id("s1"), tokens(1, 10)),
    transfer_s1(),
    Instruction::Read(id("s1"))
    => ExecutionError::SubstateAlreadyDown(id("s1"));
    "committed"
)]
#[test_case(
    system_ctx(),
    TestStore::default(),
    vec![
        up("m0", tokens(1, 5)),
        Instruction::End,
        Instruction::LocalDown(0),
        up("o1", tokens(2, 5)),
        Instruction::End,
    ],
    Instruction::LocalRead(0)
    => ExecutionError::LocalSubstateNotFound(0);
    "local"
)]
fn consumed_substate_cannot_be_read(
    mut ctx: ExecutionContext,
    store: TestStore,
    mut instructions: Vec<Instruction>,
    read: Instruction,
) -> ExecutionError {
    instructions.push(read);
    let last = instructions.len() - 1;

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, last);
    err.cause
}

#[test]
fn unknown_substate_is_not_found() {
    let store = funded_store();
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::Down(id("nope"))])
        .unwrap_err();

    assert_eq!(err.index, 0);
    assert_eq!(err.cause, ExecutionError::SubstateNotFound(id("nope")));
}

#[test]
fn unbalanced_group_is_not_closed() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let instructions = vec![
        Instruction::Down(id("s1")),
        up("o1", tokens(2, 4)),
        Instruction::End,
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 2);
    assert_eq!(err.cause, ExecutionError::UnclosedGroup(TRANSFER));
    assert_eq!(
        err.reducer_state,
        Some(Reducer::Transfer { owner: 1, remaining: 6 })
    );
}

#[test]
fn failed_procedure_reports_prior_reducer_state() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let instructions = vec![Instruction::Down(id("s1")), up("o1", tokens(2, 11))];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 1);
    assert_eq!(err.category(), ErrorCategory::Procedure);
    assert_eq!(
        err.reducer_state,
        Some(Reducer::Transfer { owner: 1, remaining: 10 })
    );
}

#[test]
fn stream_ending_inside_group_is_rejected() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let instructions = vec![Instruction::Down(id("s1")), up("o1", tokens(2, 10))];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 1);
    assert_eq!(err.cause, ExecutionError::UnterminatedGroup);
}

#[test]
fn void_reducer_requires_end() {
    let store = TestStore::default().with_substate(&id("r1"), resource(&[0x01]));
    let mut ctx = user_ctx(1);
    let instructions = vec![Instruction::Read(id("r1")), deposit_fee(0)];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 1);
    assert_eq!(err.cause, ExecutionError::MissingExpectedEnd);
}

#[test]
fn missing_procedure_names_key() {
    let store = TestStore::default().with_substate(&id("vp"), virtual_parent(VALIDATOR));
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::Read(id("vp"))])
        .unwrap_err();

    assert_eq!(
        err.cause,
        ExecutionError::MissingProcedure(key(ReducerKind::VOID, Op::Read, VIRTUAL_PARENT))
    );
}

#[test]
fn empty_transaction_verifies() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);

    let groups = machine().verify(&store, &mut ctx, &[]).unwrap();
    assert!(groups.is_empty());
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn trailing_bytes_in_up_are_rejected() {
    let store = TestStore::default();
    let mut ctx = system_ctx();
    let mut data = tokens(1, 5).to_vec();
    data.push(0xff);

    let err = machine()
        .verify(&store, &mut ctx, &[up("m0", Bytes::from(data))])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::TrailingBytes { remaining: 1 });
    assert_eq!(err.category(), ErrorCategory::Parse);
}

#[test]
fn metadata_is_ignored_but_unknown_ops_fail() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);
    let instructions = vec![
        Instruction::Header { version: 0, flags: 0 },
        Instruction::Msg(Bytes::from_static(b"hello")),
        Instruction::Unknown { opcode: 0x7f },
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 2);
    assert_eq!(err.cause, ExecutionError::UnknownOp(0x7f));
}

// ============================================================================
// Local Substates
// ============================================================================

#[test]
fn local_substate_can_be_consumed_once() {
    let store = TestStore::default();
    let mut ctx = system_ctx();
    let instructions = vec![
        up("m0", tokens(1, 5)),
        Instruction::End,
        Instruction::LocalDown(0),
        up("o1", tokens(2, 5)),
        Instruction::End,
        Instruction::LocalDown(0),
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 5);
    assert_eq!(err.cause, ExecutionError::LocalSubstateNotFound(0));
}

#[test]
fn local_down_records_original_id() {
    let store = TestStore::default();
    let mut ctx = system_ctx();
    let instructions = vec![
        up("m0", tokens(1, 5)),
        Instruction::End,
        Instruction::LocalDown(0),
        up("o1", tokens(2, 5)),
        Instruction::End,
    ];

    let groups = machine().verify(&store, &mut ctx, &instructions).unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1][0].op, Op::Down);
    assert_eq!(groups[1][0].substate_id, id("m0"));
    assert_eq!(groups[1][0].raw, Some(tokens(1, 5)));
}

// ============================================================================
// Virtual Substates
// ============================================================================

#[test]
fn virtual_substate_is_synthesized_from_parent() {
    let parent = id("vp");
    let child = SubstateId::virtual_of(parent.clone(), vec![7]);
    let store = TestStore::default().with_virtual_parent(&parent, VALIDATOR);
    let mut ctx = user_ctx(1);

    let groups = machine()
        .verify(
            &store,
            &mut ctx,
            &[Instruction::VirtualDown(child.clone()), Instruction::End],
        )
        .unwrap();

    let update = &groups[0][0];
    assert_eq!(update.substate_id, child);
    assert_eq!(update.state, Substate::Validator { key: 7 });
    assert_eq!(update.raw, None);
}

#[test]
fn virtual_substate_cannot_be_consumed_twice() {
    let parent = id("vp");
    let child = SubstateId::virtual_of(parent.clone(), vec![7]);
    let store = TestStore::default().with_virtual_parent(&parent, VALIDATOR);
    let mut ctx = user_ctx(1);
    let instructions = vec![
        Instruction::VirtualDown(child.clone()),
        Instruction::End,
        Instruction::VirtualRead(child.clone()),
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 2);
    assert_eq!(err.cause, ExecutionError::VirtualSubstateAlreadyDown(child));
}

#[test]
fn committed_spent_virtual_substate_is_rejected() {
    let parent = id("vp");
    let child = SubstateId::virtual_of(parent.clone(), vec![7]);
    let mut store = TestStore::default().with_virtual_parent(&parent, VALIDATOR);
    store.spent_virtual.insert(child.clone());
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::VirtualDown(child.clone())])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::VirtualSubstateAlreadyDown(child));
}

#[test]
fn missing_virtual_parent_is_rejected() {
    let child = SubstateId::virtual_of(id("nope"), vec![1]);
    let store = TestStore::default();
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::VirtualDown(child.clone())])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::VirtualParentStateDoesNotExist(child));
}

#[test]
fn local_virtual_substates_come_from_local_parent() {
    let child = SubstateId::virtual_of(SubstateId::local(0), vec![9]);
    let store = TestStore::default();
    let mut ctx = user_ctx(1);
    let instructions = vec![
        up("vp", virtual_parent(VALIDATOR)),
        Instruction::End,
        Instruction::LocalVirtualDown(child.clone()),
        Instruction::End,
        Instruction::LocalVirtualRead(child.clone()),
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.index, 4);
    assert_eq!(err.cause, ExecutionError::VirtualSubstateAlreadyDown(child));
}

#[test]
fn local_virtual_parent_must_be_virtual_parent() {
    let child = SubstateId::virtual_of(SubstateId::local(0), vec![9]);
    let store = TestStore::default();
    let mut ctx = system_ctx();
    let instructions = vec![
        up("m0", tokens(1, 1)),
        Instruction::End,
        Instruction::LocalVirtualDown(child.clone()),
    ];

    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();

    assert_eq!(err.cause, ExecutionError::VirtualParentStateDoesNotExist(child));
}

// ============================================================================
// Index Scans
// ============================================================================

/// System transaction that mints 3 tokens locally, transfers `s1` (10) to a
/// new local substate, then sweeps every token substate with a consuming
/// scan.
fn sweep_instructions() -> Vec<Instruction> {
    vec![
        up("m0", tokens(1, 3)),
        Instruction::End,
        Instruction::Down(id("s1")),
        up("o1", tokens(2, 10)),
        Instruction::End,
        Instruction::DownIndex(tokens_index()),
        up("o2", tokens(2, 20)),
        Instruction::End,
    ]
}

fn sweep_store() -> TestStore {
    TestStore::default()
        .with_substate(&id("s1"), tokens(1, 10))
        .with_substate(&id("s2"), tokens(1, 7))
        .with_substate(&id("r1"), resource(&[0x01]))
}

#[test]
fn consuming_scan_visits_local_then_remote() {
    let store = sweep_store();
    let mut ctx = system_ctx();

    let groups = machine()
        .verify(&store, &mut ctx, &sweep_instructions())
        .unwrap();

    let swept: Vec<_> = groups[2]
        .iter()
        .map(|u| (u.op, u.substate_id.clone()))
        .collect();
    assert_eq!(
        swept,
        vec![
            (Op::Down, id("m0")),
            (Op::Down, id("o1")),
            (Op::Down, id("s2")),
            (Op::Up, id("o2")),
        ]
    );
    assert!(groups[2][..3].iter().all(|u| u.instruction_index == 5));
    assert_eq!(store.cursors_opened.get(), 1);
    assert_eq!(store.cursors_closed.get(), 1);
}

#[test]
fn consuming_scan_shuts_down_what_it_visits() {
    let store = sweep_store();

    let mut remote = sweep_instructions();
    remote.push(Instruction::Down(id("s2")));
    let err = machine()
        .verify(&store, &mut system_ctx(), &remote)
        .unwrap_err();
    assert_eq!(err.cause, ExecutionError::SubstateAlreadyDown(id("s2")));

    let mut local = sweep_instructions();
    local.push(Instruction::LocalDown(1));
    let err = machine()
        .verify(&store, &mut system_ctx(), &local)
        .unwrap_err();
    assert_eq!(err.cause, ExecutionError::LocalSubstateNotFound(1));
}

#[test]
fn read_scan_leaves_substates_in_place() {
    let store = sweep_store();
    let mut ctx = user_ctx(1);
    let mut instructions = vec![Instruction::ReadIndex(tokens_index()), Instruction::End];
    instructions.extend(transfer_s1());

    let groups = machine().verify(&store, &mut ctx, &instructions).unwrap();

    assert_eq!(groups.len(), 2);
    assert!(groups[0].is_empty());
    assert_eq!(groups[1][0].substate_id, id("s1"));
}

#[test_case(lookup_resource(&[0x01]); "syscall")]
#[test_case(up("m0", tokens(1, 1)); "up")]
fn void_scan_does_not_force_end(next: Instruction) {
    let store = TestStore::default().with_resource(&[0x01]);
    let mut ctx = system_ctx();
    let instructions = vec![Instruction::DownIndex(tokens_index()), next, Instruction::End];

    let groups = machine().verify(&store, &mut ctx, &instructions).unwrap();

    assert_eq!(groups.len(), 1);
    assert_eq!(store.cursors_closed.get(), 1);
}

#[test]
fn scan_cursor_is_closed_when_procedure_fails() {
    let store = TestStore::default()
        .with_substate(&id("big"), tokens(1, u64::MAX))
        .with_substate(&id("one"), tokens(1, 1));
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::DownIndex(tokens_index())])
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Procedure);
    assert_eq!(store.cursors_opened.get(), 1);
    assert_eq!(store.cursors_closed.get(), 1);
}

#[test]
fn scan_of_unregistered_type_is_rejected() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);
    let index = SubstateIndex::from_prefix(vec![0x66]).unwrap();

    let err = machine()
        .verify(&store, &mut ctx, &[Instruction::ReadIndex(index)])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::UnknownSubstateType(TypeTag::new(0x66)));
    assert_eq!(store.cursors_opened.get(), 0);
}

// ============================================================================
// Authority
// ============================================================================

#[test]
fn user_cannot_run_privileged_procedure() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[up("m0", tokens(1, 5))])
        .unwrap_err();

    assert_eq!(
        err.cause,
        ExecutionError::InvalidPermission {
            required: PermissionLevel::SuperUser,
            actual: PermissionLevel::User,
        }
    );
    assert_eq!(err.category(), ErrorCategory::Authorization);
}

#[test]
fn signed_system_transaction_cannot_mint() {
    let store = TestStore::default();
    let mut ctx = system_ctx();
    ctx.set_key(SignerKey::new(vec![1]));

    let err = machine()
        .verify(&store, &mut ctx, &[up("m0", tokens(1, 5))])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::SignedSystem);
}

#[test]
fn authorizer_rejects_foreign_signer() {
    let store = funded_store();
    let mut ctx = user_ctx(2);

    let err = machine()
        .verify(&store, &mut ctx, &transfer_s1())
        .unwrap_err();

    assert_eq!(err.index, 0);
    assert!(matches!(err.cause, ExecutionError::Unauthorized(_)));
}

#[test]
fn skipped_authorization_allows_foreign_signer() {
    let store = funded_store();
    let mut ctx = user_ctx(2).with_skip_authorization(true);

    assert!(machine().verify(&store, &mut ctx, &transfer_s1()).is_ok());
}

#[test]
fn signature_budget_is_enforced_for_users() {
    let store = TestStore::default();
    let instructions = vec![Instruction::Sig, Instruction::Sig];

    let mut ctx = ExecutionContext::new(txn(), PermissionLevel::User, 1);
    let err = machine().verify(&store, &mut ctx, &instructions).unwrap_err();
    assert_eq!(err.index, 1);
    assert_eq!(err.cause, ExecutionError::SignatureBudgetExhausted);

    let mut ctx = system_ctx();
    assert!(machine().verify(&store, &mut ctx, &instructions).is_ok());
}

// ============================================================================
// Resources
// ============================================================================

#[test]
fn resources_resolve_local_then_committed() {
    let store = TestStore::default().with_resource(&[0x01]);
    let mut ctx = user_ctx(1);
    let instructions = vec![
        up("r9", resource(&[0x09])),
        Instruction::End,
        lookup_resource(&[0x09]),
        lookup_resource(&[0x01]),
    ];

    machine().verify(&store, &mut ctx, &instructions).unwrap();

    assert_eq!(
        ctx.events(),
        &[Bytes::from_static(&[0x09]), Bytes::from_static(&[0x01])]
    );
}

#[test]
fn unknown_resource_is_not_a_resource() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);

    let err = machine()
        .verify(&store, &mut ctx, &[lookup_resource(&[0x42])])
        .unwrap_err();

    assert_eq!(
        err.cause,
        ExecutionError::NotAResource(ResourceAddr::new(vec![0x42]))
    );
}

#[test]
fn resource_creation_respects_allocation_switch() {
    let store = TestStore::default();
    let mut ctx = user_ctx(1);
    ctx.set_disable_resource_alloc_and_destroy(true);

    let err = machine()
        .verify(&store, &mut ctx, &[up("r9", resource(&[0x09]))])
        .unwrap_err();

    assert_eq!(err.cause, ExecutionError::ResourceAllocationDisabled);
}

// ============================================================================
// Fees
// ============================================================================

fn fee_machine(fee: u64) -> ConstraintMachine<Substate, Reducer> {
    machine().with_meter(FixedFeeMeter::new(Amount::from(fee)))
}

#[test]
fn exact_fee_deposit_settles() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let mut instructions = vec![deposit_fee(5)];
    instructions.extend(transfer_s1());

    fee_machine(5)
        .verify(&store, &mut ctx, &instructions)
        .expect("fee is covered exactly");
    assert_eq!(ctx.reserve(), Amount::ZERO);
}

#[test]
fn overfunded_reserve_fails_on_last_instruction() {
    let store = funded_store();
    let mut ctx = user_ctx(1);
    let mut instructions = vec![deposit_fee(6)];
    instructions.extend(transfer_s1());

    let err = fee_machine(5)
        .verify(&store, &mut ctx, &instructions)
        .unwrap_err();

    assert_eq!(err.index, 3);
    assert_eq!(err.cause, ExecutionError::ReserveNotEmpty(Amount::new(1)));
    assert_eq!(err.category(), ErrorCategory::Economic);
    assert_eq!(err.reducer_state, None);
}

#[test]
fn unfunded_fee_is_a_meter_error() {
    let store = funded_store();
    let mut ctx = user_ctx(1);

    let err = fee_machine(5)
        .verify(&store, &mut ctx, &transfer_s1())
        .unwrap_err();

    assert_eq!(err.index, 0);
    assert_eq!(err.category(), ErrorCategory::Metering);
    assert!(matches!(
        err.cause,
        ExecutionError::Meter(ref inner) if matches!(**inner, ExecutionError::DepletedFeeReserve { .. })
    ));
}

#[test]
fn system_transactions_are_not_metered() {
    let store = TestStore::default();
    let mut ctx = system_ctx();

    let groups = fee_machine(5)
        .verify(&store, &mut ctx, &[up("m0", tokens(1, 5)), Instruction::End])
        .unwrap();
    assert_eq!(groups.len(), 1);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Verification is a pure function of store, context and instructions.
        #[test]
        fn verification_is_deterministic(parts in prop::collection::vec(1u64..1_000, 1..8)) {
            let total: u64 = parts.iter().sum();
            let store = TestStore::default().with_substate(&id("s1"), tokens(1, total));

            let mut instructions = vec![Instruction::Down(id("s1"))];
            for (i, amount) in parts.iter().enumerate() {
                instructions.push(up(&format!("o{i}"), tokens(2, *amount)));
            }
            instructions.push(Instruction::End);

            let first = machine().verify(&store, &mut user_ctx(1), &instructions).unwrap();
            let second = machine().verify(&store, &mut user_ctx(1), &instructions).unwrap();

            prop_assert_eq!(first.len(), 1);
            prop_assert_eq!(first[0].len(), parts.len() + 1);
            prop_assert_eq!(first, second);
        }

        /// Any shortfall leaves the transfer open at the end of the group.
        #[test]
        fn underspent_transfer_never_closes(
            parts in prop::collection::vec(1u64..1_000, 1..8),
            leftover in 1u64..1_000,
        ) {
            let total: u64 = parts.iter().sum::<u64>() + leftover;
            let store = TestStore::default().with_substate(&id("s1"), tokens(1, total));

            let mut instructions = vec![Instruction::Down(id("s1"))];
            for (i, amount) in parts.iter().enumerate() {
                instructions.push(up(&format!("o{i}"), tokens(2, *amount)));
            }
            instructions.push(Instruction::End);

            let err = machine().verify(&store, &mut user_ctx(1), &instructions).unwrap_err();
            prop_assert_eq!(err.cause, ExecutionError::UnclosedGroup(TRANSFER));
            prop_assert_eq!(err.index, instructions.len() - 1);
        }
    }
}
