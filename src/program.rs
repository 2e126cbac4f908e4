//! The embedded shader-body AST a caller builds a [`crate::transform::CompiledShader`] from.
//!
//! There is no host-language source to rewrite in this crate (no proc-macro
//! stage) — a "shader" is this small expression/statement language instead.
//! Intrinsic calls are statement-level (`let v = subgroupAdd(x);`, never
//! nested inside an expression) so that suspension only ever happens between
//! statements, never mid-expression.

/// A runtime value the interpreter manipulates. A strict subset of
/// [`crate::value::ValueType`] — `f64` is not needed by any built-in
/// intrinsic argument in this embedded language and is omitted here, though
/// the full type set is honoured everywhere else in the crate (collectives,
/// `RawValue`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    F32(f32),
    Bool(bool),
}

impl Value {
    pub fn as_i32(&self) -> i32 {
        match self {
            Value::I32(v) => *v,
            Value::U32(v) => *v as i32,
            Value::Bool(b) => *b as i32,
            Value::F32(v) => *v as i32,
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Value::U32(v) => *v,
            Value::I32(v) => *v as u32,
            Value::Bool(b) => *b as u32,
            Value::F32(v) => *v as u32,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::I32(v) => *v != 0,
            Value::U32(v) => *v != 0,
            Value::F32(v) => *v != 0.0,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match self {
            Value::F32(v) => *v,
            Value::I32(v) => *v as f32,
            Value::U32(v) => *v as f32,
            Value::Bool(b) => *b as u32 as f32,
        }
    }

    pub fn to_raw(&self) -> (crate::value::ValueType, crate::value::RawValue) {
        use crate::value::{RawValue, ValueType};
        match self {
            Value::I32(v) => (ValueType::I32, RawValue::from_i32(*v)),
            Value::U32(v) => (ValueType::U32, RawValue::from_u32(*v)),
            Value::F32(v) => (ValueType::F32, RawValue::from_f32(*v)),
            Value::Bool(v) => (ValueType::Bool, RawValue::from_bool(*v)),
        }
    }

    pub fn from_raw(ty: crate::value::ValueType, raw: crate::value::RawValue) -> Self {
        use crate::value::ValueType;
        match ty {
            ValueType::I32 => Value::I32(raw.as_i32()),
            ValueType::U32 => Value::U32(raw.as_u32()),
            ValueType::F32 => Value::F32(raw.as_f32()),
            ValueType::F64 => Value::F32(raw.as_f64() as f32),
            ValueType::Bool => Value::Bool(raw.as_bool()),
        }
    }
}

/// One of the built-in, read-only invocation IDs (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    GlobalInvocationX,
    GlobalInvocationY,
    GlobalInvocationZ,
    LocalInvocationX,
    LocalInvocationY,
    LocalInvocationZ,
    SubgroupInvocationId,
    WorkGroupIdX,
    WorkGroupIdY,
    WorkGroupIdZ,
    NumWorkGroupsX,
    NumWorkGroupsY,
    NumWorkGroupsZ,
    WorkGroupSizeX,
    WorkGroupSizeY,
    WorkGroupSizeZ,
    NumSubgroups,
    SubgroupId,
    /// `gl_SubgroupEqMask`: bit set only for this invocation's own subgroup lane.
    SubgroupEqMask,
    /// `gl_SubgroupGeMask`: bits set for lanes at or above this invocation's.
    SubgroupGeMask,
    /// `gl_SubgroupGtMask`: bits set for lanes above this invocation's.
    SubgroupGtMask,
    /// `gl_SubgroupLeMask`: bits set for lanes at or below this invocation's.
    SubgroupLeMask,
    /// `gl_SubgroupLtMask`: bits set for lanes below this invocation's.
    SubgroupLtMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitXor,
}

/// Pure functions over an already-computed `subgroupBallot` mask (§6).
/// Unlike the intrinsics in [`Intrinsic`], these never suspend: every lane
/// already holds the full mask locally (ballot already broadcast it to the
/// whole subgroup), so there is nothing left to collect from other lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotFn {
    /// Is *this* lane's bit set in the mask?
    InverseBallot,
    /// Total number of set bits in the mask.
    BitCount,
    /// Set bits at or below this lane's index (inclusive of self).
    InclusiveBitCount,
    /// Set bits strictly below this lane's index.
    ExclusiveBitCount,
    /// Index of the lowest set bit, or `-1` if the mask is zero.
    FindLSB,
    /// Index of the highest set bit, or `-1` if the mask is zero.
    FindMSB,
}

/// Pure expression language. Never suspends; always evaluates synchronously
/// against the current locals/ssbo/shared state.
#[derive(Debug, Clone)]
pub enum Expr {
    ConstI32(i32),
    ConstU32(u32),
    ConstBool(bool),
    Local(String),
    Builtin(Builtin),
    SsboLoad(Box<Expr>),
    SharedLoad(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// `subgroupInverseBallot`/`subgroupBallotBitCount`/.../`FindMSB` (§6):
    /// a pure query over a mask value already held locally.
    Ballot(BallotFn, Box<Expr>),
    /// `subgroupBallotBitExtract(mask, id)`: is bit `id` of the mask set?
    BallotBitExtract(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn local(name: impl Into<String>) -> Self {
        Expr::Local(name.into())
    }
}

/// The subgroup/sync intrinsics from §6, expressed as statement-level calls.
#[derive(Debug, Clone)]
pub enum Intrinsic {
    Broadcast(Expr, Expr),
    BroadcastFirst(Expr),
    Add(Expr),
    Min(Expr),
    Max(Expr),
    InclusiveAdd(Expr),
    ExclusiveAdd(Expr),
    Shuffle(Expr, Expr),
    ShuffleXor(Expr, Expr),
    ShuffleDown(Expr, Expr),
    ShuffleUp(Expr, Expr),
    AllEqual(Expr),
    Ballot(Expr),
    Elect,
    All(Expr),
    Any(Expr),
    SubgroupBarrier,
    SubgroupMemoryBarrier,
    Barrier,
    MemoryBarrier,
    GroupMemoryBarrier,
}

impl Intrinsic {
    pub(crate) fn op(&self) -> crate::value::Op {
        use crate::value::Op;
        match self {
            Intrinsic::Broadcast(..) => Op::Broadcast,
            Intrinsic::BroadcastFirst(..) => Op::BroadcastFirst,
            Intrinsic::Add(..) => Op::Add,
            Intrinsic::Min(..) => Op::Min,
            Intrinsic::Max(..) => Op::Max,
            Intrinsic::InclusiveAdd(..) => Op::InclusiveAdd,
            Intrinsic::ExclusiveAdd(..) => Op::ExclusiveAdd,
            Intrinsic::Shuffle(..) => Op::Shuffle,
            Intrinsic::ShuffleXor(..) => Op::ShuffleXor,
            Intrinsic::ShuffleDown(..) => Op::ShuffleDown,
            Intrinsic::ShuffleUp(..) => Op::ShuffleUp,
            Intrinsic::AllEqual(..) => Op::AllEqual,
            Intrinsic::Ballot(..) => Op::Ballot,
            Intrinsic::Elect => Op::Elect,
            Intrinsic::All(..) => Op::All,
            Intrinsic::Any(..) => Op::Any,
            Intrinsic::SubgroupBarrier => Op::SubgroupBarrier,
            Intrinsic::SubgroupMemoryBarrier => Op::SubgroupMemoryBarrier,
            Intrinsic::Barrier => Op::Barrier,
            Intrinsic::MemoryBarrier => Op::MemoryBarrier,
            Intrinsic::GroupMemoryBarrier => Op::GroupMemoryBarrier,
        }
    }

    /// Workgroup- or subgroup-level synchronization intrinsics (no value
    /// payload): a `Reconverge` immediately before one of these is redundant
    /// (peephole rule 1).
    pub(crate) fn is_barrier_class(&self) -> bool {
        matches!(
            self,
            Intrinsic::SubgroupBarrier
                | Intrinsic::SubgroupMemoryBarrier
                | Intrinsic::Barrier
                | Intrinsic::MemoryBarrier
                | Intrinsic::GroupMemoryBarrier
        )
    }

    pub(crate) fn is_subgroup_memory_barrier(&self) -> bool {
        matches!(self, Intrinsic::SubgroupMemoryBarrier)
    }

    pub(crate) fn is_full_or_subgroup_barrier(&self) -> bool {
        matches!(self, Intrinsic::Barrier | Intrinsic::SubgroupBarrier)
    }

    pub(crate) fn is_weak_memory_barrier(&self) -> bool {
        matches!(self, Intrinsic::MemoryBarrier | Intrinsic::GroupMemoryBarrier)
    }

    pub(crate) fn is_full_barrier(&self) -> bool {
        matches!(self, Intrinsic::Barrier)
    }
}

/// An atomic read-modify-write on one `ssbo` cell. These never suspend —
/// the emulator executes them inline with `std::sync::atomic` seq-cst
/// primitives (§5/§6), since they need no subgroup coordination.
#[derive(Debug, Clone, Copy)]
pub enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
    Exchange,
    CompareExchange,
}

/// One statement in a shader body.
#[derive(Debug, Clone)]
pub enum Stmt {
    Let(String, Expr),
    Assign(String, Expr),
    SsboStore(Expr, Expr),
    SharedStore(Expr, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    /// A counted loop `for var in from..to { body }`. `continue` inside
    /// `body` is only valid here (not inside a nested `If` belonging to a
    /// different loop).
    For(String, Expr, Expr, Vec<Stmt>),
    Continue,
    /// `let <binding> = <intrinsic>(...)`. `binding` is `None` for
    /// void intrinsics (barriers).
    Eval(Option<String>, Intrinsic),
    /// `let <binding> = atomic<op>(ssbo[index], value)`; `binding` receives
    /// the pre-update value, as GLSL atomics return. The trailing `Option<Expr>`
    /// is the `compare` operand of `atomicCompSwap(mem, compare, data)`; it is
    /// only present (and only evaluated) for `AtomicOp::CompareExchange`.
    Atomic(Option<String>, AtomicOp, Expr, Expr, Option<Expr>),
}

/// A complete shader body: the statements every invocation executes.
#[derive(Debug, Clone, Default)]
pub struct ShaderProgram {
    pub body: Vec<Stmt>,
}

impl ShaderProgram {
    pub fn new(body: Vec<Stmt>) -> Self {
        Self { body }
    }
}
