//! Scalar value representation and the tagged command/result channel (C1).

use std::fmt;

/// The closed set of scalar types a collective operation can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    I32,
    U32,
    F32,
    F64,
}

/// 64 bits of type-erased storage, always paired with a [`ValueType`] tag.
///
/// Never read a `RawValue` without its paired tag — the bit pattern alone is
/// ambiguous (e.g. `0` is both `0i32` and `0.0f32`).
#[derive(Clone, Copy)]
pub union RawValue {
    bool_bits: u8,
    i32_bits: i32,
    u32_bits: u32,
    f32_bits: f32,
    f64_bits: f64,
    bits: u64,
}

impl RawValue {
    /// Every constructor zeroes the full 64 bits before writing its narrower
    /// field — `AllEqual` and `Debug` both read the whole `bits()` pattern,
    /// which would otherwise compare/print whatever garbage sat in the
    /// union's unwritten high bytes.
    pub fn from_bool(v: bool) -> Self {
        let mut raw = Self { bits: 0 };
        raw.bool_bits = v as u8;
        raw
    }

    pub fn from_i32(v: i32) -> Self {
        let mut raw = Self { bits: 0 };
        raw.i32_bits = v;
        raw
    }

    pub fn from_u32(v: u32) -> Self {
        let mut raw = Self { bits: 0 };
        raw.u32_bits = v;
        raw
    }

    pub fn from_f32(v: f32) -> Self {
        let mut raw = Self { bits: 0 };
        raw.f32_bits = v;
        raw
    }

    pub fn from_f64(v: f64) -> Self {
        Self { f64_bits: v }
    }

    /// Read this value interpreted as `bool`. Caller must know the paired
    /// `ValueType` was `Bool`.
    pub fn as_bool(&self) -> bool {
        unsafe { self.bool_bits != 0 }
    }

    pub fn as_i32(&self) -> i32 {
        unsafe { self.i32_bits }
    }

    pub fn as_u32(&self) -> u32 {
        unsafe { self.u32_bits }
    }

    pub fn as_f32(&self) -> f32 {
        unsafe { self.f32_bits }
    }

    pub fn as_f64(&self) -> f64 {
        unsafe { self.f64_bits }
    }

    /// Read back according to an explicit [`ValueType`] tag, formatting into
    /// a display-friendly value. Used by the debug-trace path only.
    pub fn describe(&self, ty: ValueType) -> String {
        match ty {
            ValueType::Bool => self.as_bool().to_string(),
            ValueType::I32 => self.as_i32().to_string(),
            ValueType::U32 => self.as_u32().to_string(),
            ValueType::F32 => self.as_f32().to_string(),
            ValueType::F64 => self.as_f64().to_string(),
        }
    }

    pub fn bits(&self) -> u64 {
        unsafe { self.bits }
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawValue(0x{:016x})", self.bits())
    }
}

/// The closed set of operation tags shared by [`Command`] and [`OpResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // control
    Invalid,
    Reconverge,
    // collective scalar
    Broadcast,
    BroadcastFirst,
    Add,
    Min,
    Max,
    InclusiveAdd,
    ExclusiveAdd,
    Shuffle,
    ShuffleXor,
    ShuffleDown,
    ShuffleUp,
    AllEqual,
    // collective boolean
    Ballot,
    All,
    Any,
    Elect,
    // synchronization
    SubgroupBarrier,
    SubgroupMemoryBarrier,
    Barrier,
    MemoryBarrier,
    GroupMemoryBarrier,
}

impl Op {
    /// Synchronization ops that resolve at the subgroup level only (O4): the
    /// thread halts at a subgroup barrier but never waits on the workgroup
    /// latch.
    pub fn is_subgroup_sync(self) -> bool {
        matches!(self, Op::SubgroupBarrier | Op::SubgroupMemoryBarrier)
    }

    /// Workgroup-wide synchronization ops (O3/O5).
    pub fn is_workgroup_sync(self) -> bool {
        matches!(self, Op::Barrier | Op::MemoryBarrier | Op::GroupMemoryBarrier)
    }

    /// Ops that additionally require a process-wide memory fence (O5).
    pub fn is_memory_fence(self) -> bool {
        matches!(
            self,
            Op::SubgroupMemoryBarrier | Op::MemoryBarrier | Op::GroupMemoryBarrier
        )
    }

    pub fn is_sync(self) -> bool {
        self.is_subgroup_sync() || self.is_workgroup_sync()
    }

    pub fn is_control(self) -> bool {
        matches!(self, Op::Invalid | Op::Reconverge)
    }
}

/// Op-specific payload carried by a [`Command`].
#[derive(Debug, Clone, Copy)]
pub enum CommandPayload {
    /// Scalar collectives: value plus the op's second argument (id/mask/delta).
    Scalar { ty: ValueType, val: RawValue, aux: u32 },
    /// Boolean collectives (ballot/all/any).
    Bool(bool),
    /// Control and synchronization ops carry no payload.
    None,
}

/// Op-specific payload carried back by an [`OpResult`].
#[derive(Debug, Clone, Copy)]
pub enum ResultPayload {
    Scalar { ty: ValueType, val: RawValue },
    Bool(bool),
    None,
}

/// Emitted by a cooperative thread at every suspension point (C1).
///
/// Per invariant I1, every `Command`/`OpResult` pair exchanged for a single
/// suspension carries the same `op_id`; the scheduler uses `op_id` as its
/// grouping key.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub op_id: u32,
    pub op: Op,
    pub payload: CommandPayload,
}

impl Command {
    pub fn control(op_id: u32, op: Op) -> Self {
        Self { op_id, op, payload: CommandPayload::None }
    }

    pub fn scalar(op_id: u32, op: Op, ty: ValueType, val: RawValue, aux: u32) -> Self {
        Self { op_id, op, payload: CommandPayload::Scalar { ty, val, aux } }
    }

    pub fn boolean(op_id: u32, op: Op, val: bool) -> Self {
        Self { op_id, op, payload: CommandPayload::Bool(val) }
    }

    /// A placeholder command for a lane that is not scheduled into this
    /// subgroup (the tail subgroup) or has already finished.
    pub fn idle(op_id: u32) -> Self {
        Self::control(op_id, Op::Invalid)
    }
}

/// Written back by the scheduler once a convergence group's collective has
/// been executed (C1).
#[derive(Debug, Clone, Copy)]
pub struct OpResult {
    pub op_id: u32,
    pub op: Op,
    pub payload: ResultPayload,
}

impl OpResult {
    pub fn control(op_id: u32, op: Op) -> Self {
        Self { op_id, op, payload: ResultPayload::None }
    }

    pub fn scalar(op_id: u32, op: Op, ty: ValueType, val: RawValue) -> Self {
        Self { op_id, op, payload: ResultPayload::Scalar { ty, val } }
    }

    pub fn boolean(op_id: u32, op: Op, val: bool) -> Self {
        Self { op_id, op, payload: ResultPayload::Bool(val) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_value_round_trips_each_scalar_type() {
        assert_eq!(RawValue::from_bool(true).as_bool(), true);
        assert_eq!(RawValue::from_i32(-7).as_i32(), -7);
        assert_eq!(RawValue::from_u32(42).as_u32(), 42);
        assert_eq!(RawValue::from_f32(1.5).as_f32(), 1.5);
        assert_eq!(RawValue::from_f64(3.25).as_f64(), 3.25);
    }

    #[test]
    fn op_classification_is_closed_and_disjoint() {
        assert!(Op::SubgroupBarrier.is_subgroup_sync());
        assert!(!Op::SubgroupBarrier.is_workgroup_sync());
        assert!(Op::Barrier.is_workgroup_sync());
        assert!(!Op::Barrier.is_subgroup_sync());
        assert!(Op::MemoryBarrier.is_memory_fence());
        assert!(!Op::Add.is_sync());
        assert!(Op::Reconverge.is_control());
    }
}
