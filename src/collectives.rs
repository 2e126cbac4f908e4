//! Subgroup collective kernels (C2): pure functions that turn one
//! convergence group's commands into its results.
//!
//! Every kernel here is free of side effects and is called once per
//! convergence group per scheduler tick — see [`crate::scheduler`].

use crate::value::{Command, CommandPayload, Op, OpResult, RawValue, ValueType};

/// Identity/reduction behaviour for the four collective-eligible numeric
/// types. Implemented for `i32`, `u32`, `f32`, `f64`; `bool` never reaches
/// these kernels (boolean collectives are handled separately below).
trait ScalarKernel: Copy {
    fn add_identity() -> Self;
    fn min_identity() -> Self;
    fn max_identity() -> Self;
    fn kadd(self, other: Self) -> Self;
    fn kmin(self, other: Self) -> Self;
    fn kmax(self, other: Self) -> Self;
    fn from_raw(v: &RawValue) -> Self;
    fn to_raw(self) -> RawValue;
}

macro_rules! impl_scalar_kernel {
    ($t:ty, $from:ident, $ctor:ident, $add_id:expr, $min_id:expr, $max_id:expr) => {
        impl ScalarKernel for $t {
            fn add_identity() -> Self {
                $add_id
            }
            fn min_identity() -> Self {
                $min_id
            }
            fn max_identity() -> Self {
                $max_id
            }
            fn kadd(self, other: Self) -> Self {
                self + other
            }
            fn kmin(self, other: Self) -> Self {
                if self < other { self } else { other }
            }
            fn kmax(self, other: Self) -> Self {
                if self > other { self } else { other }
            }
            fn from_raw(v: &RawValue) -> Self {
                v.$from()
            }
            fn to_raw(self) -> RawValue {
                RawValue::$ctor(self)
            }
        }
    };
}

impl_scalar_kernel!(i32, as_i32, from_i32, 0, i32::MAX, i32::MIN);
impl_scalar_kernel!(u32, as_u32, from_u32, 0, u32::MAX, 0);
impl_scalar_kernel!(f32, as_f32, from_f32, 0.0, f32::INFINITY, f32::NEG_INFINITY);
impl_scalar_kernel!(f64, as_f64, from_f64, 0.0, f64::INFINITY, f64::NEG_INFINITY);

fn scalar_val(cmd: &Command) -> (ValueType, RawValue, u32) {
    match cmd.payload {
        CommandPayload::Scalar { ty, val, aux } => (ty, val, aux),
        other => panic!("scalar collective kernel received non-scalar payload: {other:?}"),
    }
}

fn bool_val(cmd: &Command) -> bool {
    match cmd.payload {
        CommandPayload::Bool(b) => b,
        other => panic!("boolean collective kernel received non-boolean payload: {other:?}"),
    }
}

/// Run one numeric reduction/prefix kernel over `active_set`, writing into
/// `out[t]` for every `t` in `active_set`. `active_set` must already be in
/// ascending lane order (ordering required for deterministic float sums).
fn reduce<T: ScalarKernel>(
    op: Op,
    ty: ValueType,
    commands: &[Command],
    active_set: &[usize],
    out: &mut [Option<OpResult>],
    op_id: u32,
) {
    let values: Vec<T> = active_set.iter().map(|&t| T::from_raw(&scalar_val(&commands[t]).1)).collect();
    match op {
        Op::Add => {
            let sum = values.iter().fold(T::add_identity(), |a, &b| a.kadd(b));
            for &t in active_set {
                out[t] = Some(OpResult::scalar(op_id, op, ty, sum.to_raw()));
            }
        }
        Op::Min => {
            let m = values.iter().fold(T::min_identity(), |a, &b| a.kmin(b));
            for &t in active_set {
                out[t] = Some(OpResult::scalar(op_id, op, ty, m.to_raw()));
            }
        }
        Op::Max => {
            let m = values.iter().fold(T::max_identity(), |a, &b| a.kmax(b));
            for &t in active_set {
                out[t] = Some(OpResult::scalar(op_id, op, ty, m.to_raw()));
            }
        }
        Op::InclusiveAdd => {
            let mut running = T::add_identity();
            for (i, &t) in active_set.iter().enumerate() {
                running = running.kadd(values[i]);
                out[t] = Some(OpResult::scalar(op_id, op, ty, running.to_raw()));
            }
        }
        Op::ExclusiveAdd => {
            let mut running = T::add_identity();
            for (i, &t) in active_set.iter().enumerate() {
                out[t] = Some(OpResult::scalar(op_id, op, ty, running.to_raw()));
                running = running.kadd(values[i]);
            }
        }
        _ => unreachable!("reduce() called with non-reduction op {op:?}"),
    }
}

/// Execute one convergence group's collective, writing a result for every
/// thread index in `active_set` into `out`.
///
/// `active_set` is ascending-sorted by the scheduler before this is called
/// (I2/ordering guarantee in §4.2). `first_thread_id` is the lowest lane
/// index among the *whole* convergence group as determined by the scheduler
/// (normally `active_set[0]`, but kept as an explicit parameter to mirror
/// the distilled kernel signature).
pub fn execute(
    op: Op,
    commands: &[Command],
    active_set: &[usize],
    first_thread_id: usize,
    op_id: u32,
    out: &mut [Option<OpResult>],
) {
    debug_assert!(active_set.windows(2).all(|w| w[0] < w[1]), "active_set must be ascending");

    match op {
        Op::Reconverge
        | Op::SubgroupBarrier
        | Op::SubgroupMemoryBarrier
        | Op::Barrier
        | Op::MemoryBarrier
        | Op::GroupMemoryBarrier => {
            for &t in active_set {
                out[t] = Some(OpResult::control(op_id, op));
            }
        }

        Op::Add | Op::Min | Op::Max | Op::InclusiveAdd | Op::ExclusiveAdd => {
            let ty = scalar_val(&commands[first_thread_id]).0;
            match ty {
                ValueType::I32 => reduce::<i32>(op, ty, commands, active_set, out, op_id),
                ValueType::U32 => reduce::<u32>(op, ty, commands, active_set, out, op_id),
                ValueType::F32 => reduce::<f32>(op, ty, commands, active_set, out, op_id),
                ValueType::F64 => reduce::<f64>(op, ty, commands, active_set, out, op_id),
                ValueType::Bool => unreachable!("bool has no arithmetic reduction"),
            }
        }

        Op::Broadcast => {
            let (ty, _, _) = scalar_val(&commands[first_thread_id]);
            for &t in active_set {
                let (_, _, id) = scalar_val(&commands[t]);
                let id = id as usize;
                let source = if active_set.contains(&id) { id } else { first_thread_id };
                let (_, val, _) = scalar_val(&commands[source]);
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::BroadcastFirst => {
            let (ty, val, _) = scalar_val(&commands[first_thread_id]);
            for &t in active_set {
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::Shuffle => {
            for &t in active_set {
                let (ty, own, id) = scalar_val(&commands[t]);
                let id = id as usize;
                let val = if active_set.contains(&id) { scalar_val(&commands[id]).1 } else { own };
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::ShuffleXor => {
            for &t in active_set {
                let (ty, own, mask) = scalar_val(&commands[t]);
                let src = t ^ (mask as usize);
                let val = if active_set.contains(&src) { scalar_val(&commands[src]).1 } else { own };
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::ShuffleDown => {
            for &t in active_set {
                let (ty, own, delta) = scalar_val(&commands[t]);
                let src = t + delta as usize;
                let val = if active_set.contains(&src) { scalar_val(&commands[src]).1 } else { own };
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::ShuffleUp => {
            for &t in active_set {
                let (ty, own, delta) = scalar_val(&commands[t]);
                let val = match t.checked_sub(delta as usize) {
                    Some(src) if active_set.contains(&src) => scalar_val(&commands[src]).1,
                    _ => own,
                };
                out[t] = Some(OpResult::scalar(op_id, op, ty, val));
            }
        }

        Op::AllEqual => {
            let (_, first_val, _) = scalar_val(&commands[first_thread_id]);
            let all_equal = active_set.iter().all(|&t| scalar_val(&commands[t]).1.bits() == first_val.bits());
            for &t in active_set {
                out[t] = Some(OpResult::boolean(op_id, op, all_equal));
            }
        }

        Op::Ballot => {
            let mut mask = 0u32;
            for &t in active_set {
                if bool_val(&commands[t]) {
                    mask |= 1 << t;
                }
            }
            for &t in active_set {
                out[t] = Some(OpResult::scalar(op_id, op, ValueType::U32, RawValue::from_u32(mask)));
            }
        }

        Op::Elect => {
            for &t in active_set {
                out[t] = Some(OpResult::boolean(op_id, op, t == first_thread_id));
            }
        }

        Op::All => {
            let all = active_set.iter().all(|&t| bool_val(&commands[t]));
            for &t in active_set {
                out[t] = Some(OpResult::boolean(op_id, op, all));
            }
        }

        Op::Any => {
            let any = active_set.iter().any(|&t| bool_val(&commands[t]));
            for &t in active_set {
                out[t] = Some(OpResult::boolean(op_id, op, any));
            }
        }

        Op::Invalid => unreachable!("Invalid is never dispatched to a kernel"),
    }
}
