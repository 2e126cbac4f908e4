//! The shader transform (C1 / §4.1): takes a [`ShaderProgram`] and produces a
//! [`CompiledShader`] whose closures drive the scheduler.
//!
//! Three passes, in order:
//! 1. [`insert_reconverge`] walks the AST and inserts an explicit
//!    reconvergence point after every divergent construct (`if`, and loops
//!    that contain a `continue`).
//! 2. [`peephole`] drops reconvergence points immediately followed by a
//!    barrier-class intrinsic, and drops a weak memory barrier immediately
//!    followed by a stronger one, within the same statement block.
//! 3. [`lower`] flattens the cleaned tree into an indexed instruction list,
//!    assigning each surviving intrinsic/reconverge a fresh, source-order
//!    static op id (I1/I2).

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::ThreadContext;
use crate::program::{AtomicOp, BallotFn, BinOp, Builtin, Expr, Intrinsic, ShaderProgram, Stmt, Value};
use crate::scheduler::{ClosureStep, ThreadClosure};
use crate::shared::SharedMemory;
use crate::ssbo::Ssbo;
use crate::value::{Command, Op, OpResult, ResultPayload};

// ---------------------------------------------------------------------
// Pass 1: reconvergence insertion
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Marked {
    Let(String, Expr),
    Assign(String, Expr),
    SsboStore(Expr, Expr),
    SharedStore(Expr, Expr),
    If(Expr, Vec<Marked>, Vec<Marked>),
    /// `has_continue` tells the lowering pass whether to wrap the loop body
    /// with the per-iteration convergence point that lets skipped-ahead
    /// threads catch back up with ones that ran the full body.
    For(String, Expr, Expr, Vec<Marked>, bool),
    Continue,
    Intrinsic(Option<String>, Intrinsic),
    Reconverge,
    Atomic(Option<String>, AtomicOp, Expr, Expr, Option<Expr>),
}

fn contains_continue(body: &[Stmt]) -> bool {
    body.iter().any(|s| match s {
        Stmt::Continue => true,
        Stmt::If(_, then, els) => contains_continue(then) || contains_continue(els),
        _ => false,
    })
}

fn insert_reconverge(body: &[Stmt]) -> Vec<Marked> {
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        match stmt {
            Stmt::Let(name, e) => out.push(Marked::Let(name.clone(), e.clone())),
            Stmt::Assign(name, e) => out.push(Marked::Assign(name.clone(), e.clone())),
            Stmt::SsboStore(i, v) => out.push(Marked::SsboStore(i.clone(), v.clone())),
            Stmt::SharedStore(i, v) => out.push(Marked::SharedStore(i.clone(), v.clone())),
            Stmt::Continue => out.push(Marked::Continue),
            Stmt::Eval(dest, intr) => out.push(Marked::Intrinsic(dest.clone(), intr.clone())),
            Stmt::Atomic(dest, op, i, v, cmp) => {
                out.push(Marked::Atomic(dest.clone(), *op, i.clone(), v.clone(), cmp.clone()))
            }
            Stmt::If(cond, then, els) => {
                out.push(Marked::If(cond.clone(), insert_reconverge(then), insert_reconverge(els)));
                out.push(Marked::Reconverge);
            }
            Stmt::For(var, from, to, inner) => {
                let has_continue = contains_continue(inner);
                out.push(Marked::For(var.clone(), from.clone(), to.clone(), insert_reconverge(inner), has_continue));
                if has_continue {
                    out.push(Marked::Reconverge);
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------
// Pass 2: peephole cleanup
// ---------------------------------------------------------------------

fn drops_redundant_sync(cur: &Marked, next: &Marked) -> bool {
    match (cur, next) {
        (Marked::Reconverge, Marked::Intrinsic(_, intr)) => intr.is_barrier_class(),
        (Marked::Intrinsic(_, a), Marked::Intrinsic(_, b)) if a.is_subgroup_memory_barrier() => {
            b.is_full_or_subgroup_barrier()
        }
        (Marked::Intrinsic(_, a), Marked::Intrinsic(_, b)) if a.is_weak_memory_barrier() => b.is_full_barrier(),
        _ => false,
    }
}

fn peephole(stmts: Vec<Marked>) -> Vec<Marked> {
    let recursed: Vec<Marked> = stmts
        .into_iter()
        .map(|s| match s {
            Marked::If(c, t, e) => Marked::If(c, peephole(t), peephole(e)),
            Marked::For(v, f, to, b, hc) => Marked::For(v, f, to, peephole(b), hc),
            other => other,
        })
        .collect();

    let mut out = Vec::with_capacity(recursed.len());
    let mut i = 0;
    while i < recursed.len() {
        if let Some(next) = recursed.get(i + 1) {
            if drops_redundant_sync(&recursed[i], next) {
                i += 1;
                continue;
            }
        }
        out.push(recursed[i].clone());
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------
// Pass 3: lowering to flat, indexed bytecode
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum CStmt {
    Let(String, Expr),
    Assign(String, Expr),
    SsboStore(Expr, Expr),
    SharedStore(Expr, Expr),
    JumpIfFalse(Expr, usize),
    Jump(usize),
    /// A suspension point with no value binding.
    Sync(u32, Op),
    /// A suspension point whose result is bound to a local on resume.
    Emit(u32, Option<String>, Intrinsic),
    Atomic(Option<String>, AtomicOp, Expr, Expr, Option<Expr>),
    Halt,
}

struct Lowering {
    code: Vec<CStmt>,
    next_op_id: u32,
}

impl Lowering {
    fn alloc_op_id(&mut self) -> u32 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    fn emit(&mut self, stmt: CStmt) -> usize {
        self.code.push(stmt);
        self.code.len() - 1
    }

    /// Lower one statement block. `continue_patches` collects the indices of
    /// placeholder jumps emitted for `continue`, to be back-patched once the
    /// enclosing loop knows where its continue point lands; `None` means
    /// this block is not (yet) inside a loop.
    fn lower_block(&mut self, stmts: &[Marked], continue_patches: Option<&mut Vec<usize>>) {
        let mut continue_patches = continue_patches;
        for s in stmts {
            match s {
                Marked::Let(name, e) => {
                    self.emit(CStmt::Let(name.clone(), e.clone()));
                }
                Marked::Assign(name, e) => {
                    self.emit(CStmt::Assign(name.clone(), e.clone()));
                }
                Marked::SsboStore(i, v) => {
                    self.emit(CStmt::SsboStore(i.clone(), v.clone()));
                }
                Marked::SharedStore(i, v) => {
                    self.emit(CStmt::SharedStore(i.clone(), v.clone()));
                }
                Marked::Atomic(dest, op, i, v, cmp) => {
                    self.emit(CStmt::Atomic(dest.clone(), *op, i.clone(), v.clone(), cmp.clone()));
                }
                Marked::Continue => {
                    let patches = continue_patches.as_mut().expect("continue outside of a loop body");
                    let idx = self.emit(CStmt::Jump(0));
                    patches.push(idx);
                }
                Marked::Reconverge => {
                    let id = self.alloc_op_id();
                    self.emit(CStmt::Sync(id, Op::Reconverge));
                }
                Marked::Intrinsic(dest, intr) => {
                    let id = self.alloc_op_id();
                    if intr.is_barrier_class() {
                        self.emit(CStmt::Sync(id, intr.op()));
                    } else {
                        self.emit(CStmt::Emit(id, dest.clone(), intr.clone()));
                    }
                }
                Marked::If(cond, then, els) => {
                    let jf = self.emit(CStmt::JumpIfFalse(cond.clone(), 0));
                    self.lower_block(then, continue_patches.as_mut().map(|p| &mut **p));
                    let jend = self.emit(CStmt::Jump(0));
                    let else_start = self.code.len();
                    self.lower_block(els, continue_patches.as_mut().map(|p| &mut **p));
                    let end = self.code.len();
                    self.code[jf] = CStmt::JumpIfFalse(cond.clone(), else_start);
                    self.code[jend] = CStmt::Jump(end);
                }
                Marked::For(var, from, to, body, has_continue) => {
                    self.emit(CStmt::Let(var.clone(), from.clone()));
                    let loop_top = self.code.len();
                    let cond = Expr::BinOp(BinOp::Lt, Box::new(Expr::local(var.clone())), Box::new(to.clone()));
                    let jf = self.emit(CStmt::JumpIfFalse(cond.clone(), 0));

                    let mut inner_patches: Vec<usize> = Vec::new();
                    self.lower_block(body, Some(&mut inner_patches));

                    // continue_point: where both a normal fall-through and an
                    // explicit `continue` land, before the increment.
                    let continue_point = self.code.len();
                    if *has_continue {
                        let id = self.alloc_op_id();
                        self.emit(CStmt::Sync(id, Op::Reconverge));
                    }
                    for idx in inner_patches {
                        self.code[idx] = CStmt::Jump(continue_point);
                    }

                    self.emit(CStmt::Assign(
                        var.clone(),
                        Expr::BinOp(BinOp::Add, Box::new(Expr::local(var.clone())), Box::new(Expr::ConstI32(1))),
                    ));
                    self.emit(CStmt::Jump(loop_top));
                    let end = self.code.len();
                    self.code[jf] = CStmt::JumpIfFalse(cond, end);
                }
            }
        }
    }
}

/// A compiled shader body, shared read-only across every invocation a
/// dispatch spawns.
#[derive(Debug)]
pub struct CompiledShader {
    code: Vec<CStmt>,
}

/// Lower a [`ShaderProgram`] into its [`CompiledShader`] form, performing
/// reconvergence insertion, peephole cleanup, and static op id assignment.
pub fn compile_shader(program: &ShaderProgram) -> CompiledShader {
    let marked = peephole(insert_reconverge(&program.body));
    let mut lowering = Lowering { code: Vec::new(), next_op_id: 0 };
    lowering.lower_block(&marked, None);
    lowering.emit(CStmt::Halt);
    CompiledShader { code: lowering.code }
}

// ---------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------

fn eval_builtin(b: Builtin, ctx: &ThreadContext) -> Value {
    match b {
        Builtin::GlobalInvocationX => Value::U32(ctx.global_invocation_id.x),
        Builtin::GlobalInvocationY => Value::U32(ctx.global_invocation_id.y),
        Builtin::GlobalInvocationZ => Value::U32(ctx.global_invocation_id.z),
        Builtin::LocalInvocationX => Value::U32(ctx.local_invocation_id.x),
        Builtin::LocalInvocationY => Value::U32(ctx.local_invocation_id.y),
        Builtin::LocalInvocationZ => Value::U32(ctx.local_invocation_id.z),
        Builtin::SubgroupInvocationId => Value::U32(ctx.subgroup_invocation_id),
        Builtin::WorkGroupIdX => Value::U32(ctx.workgroup_id.x),
        Builtin::WorkGroupIdY => Value::U32(ctx.workgroup_id.y),
        Builtin::WorkGroupIdZ => Value::U32(ctx.workgroup_id.z),
        Builtin::NumWorkGroupsX => Value::U32(ctx.num_workgroups.x),
        Builtin::NumWorkGroupsY => Value::U32(ctx.num_workgroups.y),
        Builtin::NumWorkGroupsZ => Value::U32(ctx.num_workgroups.z),
        Builtin::WorkGroupSizeX => Value::U32(ctx.workgroup_size.x),
        Builtin::WorkGroupSizeY => Value::U32(ctx.workgroup_size.y),
        Builtin::WorkGroupSizeZ => Value::U32(ctx.workgroup_size.z),
        Builtin::NumSubgroups => Value::U32(ctx.num_subgroups),
        Builtin::SubgroupId => Value::U32(ctx.subgroup_id),
        // Only the low u32 lane of each mask is meaningful for a
        // SubgroupSize <= 32 (the only size this emulator supports).
        Builtin::SubgroupEqMask => Value::U32(ctx.lane_masks.eq.0[0]),
        Builtin::SubgroupGeMask => Value::U32(ctx.lane_masks.ge.0[0]),
        Builtin::SubgroupGtMask => Value::U32(ctx.lane_masks.gt.0[0]),
        Builtin::SubgroupLeMask => Value::U32(ctx.lane_masks.le.0[0]),
        Builtin::SubgroupLtMask => Value::U32(ctx.lane_masks.lt.0[0]),
    }
}

fn eval_binop(op: BinOp, a: Value, b: Value) -> Value {
    match op {
        BinOp::Add => Value::I32(a.as_i32().wrapping_add(b.as_i32())),
        BinOp::Sub => Value::I32(a.as_i32().wrapping_sub(b.as_i32())),
        BinOp::Mul => Value::I32(a.as_i32().wrapping_mul(b.as_i32())),
        BinOp::Div => Value::I32(a.as_i32().checked_div(b.as_i32()).unwrap_or(0)),
        BinOp::Mod => Value::I32(a.as_i32().checked_rem(b.as_i32()).unwrap_or(0)),
        BinOp::Eq => Value::Bool(a.as_i32() == b.as_i32()),
        BinOp::Ne => Value::Bool(a.as_i32() != b.as_i32()),
        BinOp::Lt => Value::Bool(a.as_i32() < b.as_i32()),
        BinOp::Le => Value::Bool(a.as_i32() <= b.as_i32()),
        BinOp::Gt => Value::Bool(a.as_i32() > b.as_i32()),
        BinOp::Ge => Value::Bool(a.as_i32() >= b.as_i32()),
        BinOp::And => Value::Bool(a.as_bool() && b.as_bool()),
        BinOp::Or => Value::Bool(a.as_bool() || b.as_bool()),
        BinOp::BitXor => Value::I32(a.as_i32() ^ b.as_i32()),
    }
}

struct Env<'a> {
    locals: &'a HashMap<String, Value>,
    ctx: &'a ThreadContext,
    ssbo: &'a Ssbo,
    shared: &'a SharedMemory,
}

/// Evaluate a pure ballot-mask query (§6) against the caller's own lane
/// index — these never suspend, since `subgroupBallot` already broadcast
/// the whole mask to every lane before any of these would be called.
fn eval_ballot_fn(f: BallotFn, mask: u32, lane: u32) -> Value {
    match f {
        BallotFn::InverseBallot => Value::Bool(mask & (1 << lane) != 0),
        BallotFn::BitCount => Value::U32(mask.count_ones()),
        BallotFn::InclusiveBitCount => {
            let below_and_self = if lane == 31 { u32::MAX } else { (1u32 << (lane + 1)) - 1 };
            Value::U32((mask & below_and_self).count_ones())
        }
        BallotFn::ExclusiveBitCount => {
            let below = (1u32 << lane).wrapping_sub(1);
            Value::U32((mask & below).count_ones())
        }
        BallotFn::FindLSB => {
            Value::I32(if mask == 0 { -1 } else { mask.trailing_zeros() as i32 })
        }
        BallotFn::FindMSB => {
            Value::I32(if mask == 0 { -1 } else { 31 - mask.leading_zeros() as i32 })
        }
    }
}

fn eval_expr(e: &Expr, env: &Env) -> Value {
    match e {
        Expr::ConstI32(v) => Value::I32(*v),
        Expr::ConstU32(v) => Value::U32(*v),
        Expr::ConstBool(v) => Value::Bool(*v),
        Expr::Local(name) => *env.locals.get(name).unwrap_or(&Value::I32(0)),
        Expr::Builtin(b) => eval_builtin(*b, env.ctx),
        Expr::SsboLoad(idx) => Value::I32(env.ssbo.load(eval_expr(idx, env).as_i32() as usize)),
        Expr::SharedLoad(idx) => Value::I32(env.shared.load(eval_expr(idx, env).as_i32() as usize)),
        Expr::BinOp(op, a, b) => eval_binop(*op, eval_expr(a, env), eval_expr(b, env)),
        Expr::Not(inner) => Value::Bool(!eval_expr(inner, env).as_bool()),
        Expr::Ballot(f, mask) => {
            eval_ballot_fn(*f, eval_expr(mask, env).as_u32(), env.ctx.subgroup_invocation_id)
        }
        Expr::BallotBitExtract(mask, id) => {
            let mask = eval_expr(mask, env).as_u32();
            let id = eval_expr(id, env).as_u32();
            Value::Bool(mask & (1 << id) != 0)
        }
    }
}

// ---------------------------------------------------------------------
// The cooperative closure
// ---------------------------------------------------------------------

/// One invocation's cooperative interpreter over a [`CompiledShader`].
/// Produced fresh per thread by the dispatcher; cheap to construct since
/// the compiled code is shared behind an [`Arc`].
pub struct ShaderClosure {
    code: Arc<CompiledShader>,
    pc: usize,
    locals: HashMap<String, Value>,
    ctx: ThreadContext,
    ssbo: Arc<Ssbo>,
    shared: Arc<SharedMemory>,
    pending_dest: Option<String>,
}

impl ShaderClosure {
    pub fn new(code: Arc<CompiledShader>, ctx: ThreadContext, ssbo: Arc<Ssbo>, shared: Arc<SharedMemory>) -> Self {
        Self { code, pc: 0, locals: HashMap::new(), ctx, ssbo, shared, pending_dest: None }
    }

    fn env(&self) -> Env {
        Env { locals: &self.locals, ctx: &self.ctx, ssbo: &self.ssbo, shared: &self.shared }
    }

    fn bind_result(&mut self, res: OpResult) {
        let Some(dest) = self.pending_dest.take() else { return };
        let value = match res.payload {
            ResultPayload::Scalar { ty, val } => Value::from_raw(ty, val),
            ResultPayload::Bool(b) => Value::Bool(b),
            ResultPayload::None => Value::Bool(false),
        };
        self.locals.insert(dest, value);
    }

    fn command_for(&self, op_id: u32, intr: &Intrinsic) -> Command {
        let env = self.env();
        match intr {
            Intrinsic::Broadcast(val, id) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::Broadcast, ty, raw, eval_expr(id, &env).as_u32())
            }
            Intrinsic::BroadcastFirst(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::BroadcastFirst, ty, raw, 0)
            }
            Intrinsic::Add(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::Add, ty, raw, 0)
            }
            Intrinsic::Min(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::Min, ty, raw, 0)
            }
            Intrinsic::Max(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::Max, ty, raw, 0)
            }
            Intrinsic::InclusiveAdd(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::InclusiveAdd, ty, raw, 0)
            }
            Intrinsic::ExclusiveAdd(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::ExclusiveAdd, ty, raw, 0)
            }
            Intrinsic::Shuffle(val, idx) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::Shuffle, ty, raw, eval_expr(idx, &env).as_u32())
            }
            Intrinsic::ShuffleXor(val, mask) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::ShuffleXor, ty, raw, eval_expr(mask, &env).as_u32())
            }
            Intrinsic::ShuffleDown(val, delta) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::ShuffleDown, ty, raw, eval_expr(delta, &env).as_u32())
            }
            Intrinsic::ShuffleUp(val, delta) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::ShuffleUp, ty, raw, eval_expr(delta, &env).as_u32())
            }
            Intrinsic::AllEqual(val) => {
                let (ty, raw) = eval_expr(val, &env).to_raw();
                Command::scalar(op_id, Op::AllEqual, ty, raw, 0)
            }
            Intrinsic::Ballot(cond) => Command::boolean(op_id, Op::Ballot, eval_expr(cond, &env).as_bool()),
            Intrinsic::All(cond) => Command::boolean(op_id, Op::All, eval_expr(cond, &env).as_bool()),
            Intrinsic::Any(cond) => Command::boolean(op_id, Op::Any, eval_expr(cond, &env).as_bool()),
            Intrinsic::Elect => Command::control(op_id, Op::Elect),
            Intrinsic::SubgroupBarrier
            | Intrinsic::SubgroupMemoryBarrier
            | Intrinsic::Barrier
            | Intrinsic::MemoryBarrier
            | Intrinsic::GroupMemoryBarrier => Command::control(op_id, intr.op()),
        }
    }

    fn run_atomic(&mut self, dest: &Option<String>, op: AtomicOp, index_e: &Expr, value_e: &Expr, compare_e: &Option<Expr>) {
        let index = eval_expr(index_e, &self.env()).as_i32() as usize;
        let value = eval_expr(value_e, &self.env()).as_i32();
        let prev = match op {
            AtomicOp::Add => self.ssbo.atomic_add(index, value),
            AtomicOp::And => self.ssbo.atomic_and(index, value),
            AtomicOp::Or => self.ssbo.atomic_or(index, value),
            AtomicOp::Xor => self.ssbo.atomic_xor(index, value),
            AtomicOp::Exchange => self.ssbo.atomic_exchange(index, value),
            AtomicOp::CompareExchange => {
                let compare_e = compare_e.as_ref().expect("CompareExchange always carries a compare operand");
                let compare = eval_expr(compare_e, &self.env()).as_i32();
                self.ssbo.atomic_compare_exchange(index, compare, value)
            }
        };
        if let Some(name) = dest {
            self.locals.insert(name.clone(), Value::I32(prev));
        }
    }
}

impl ThreadClosure for ShaderClosure {
    fn resume(&mut self, result: Option<OpResult>) -> ClosureStep {
        if let Some(res) = result {
            self.bind_result(res);
        }

        loop {
            let Some(instr) = self.code.code.get(self.pc) else { return ClosureStep::Finished };
            match instr.clone() {
                CStmt::Let(name, e) | CStmt::Assign(name, e) => {
                    let v = eval_expr(&e, &self.env());
                    self.locals.insert(name, v);
                    self.pc += 1;
                }
                CStmt::SsboStore(idx, val) => {
                    let index = eval_expr(&idx, &self.env()).as_i32() as usize;
                    let value = eval_expr(&val, &self.env()).as_i32();
                    self.ssbo.store(index, value);
                    self.pc += 1;
                }
                CStmt::SharedStore(idx, val) => {
                    let index = eval_expr(&idx, &self.env()).as_i32() as usize;
                    let value = eval_expr(&val, &self.env()).as_i32();
                    self.shared.store(index, value);
                    self.pc += 1;
                }
                CStmt::JumpIfFalse(cond, target) => {
                    self.pc = if eval_expr(&cond, &self.env()).as_bool() { self.pc + 1 } else { target };
                }
                CStmt::Jump(target) => self.pc = target,
                CStmt::Sync(op_id, op) => {
                    self.pc += 1;
                    self.pending_dest = None;
                    return ClosureStep::Yield(Command::control(op_id, op));
                }
                CStmt::Emit(op_id, dest, intr) => {
                    let cmd = self.command_for(op_id, &intr);
                    self.pc += 1;
                    self.pending_dest = dest;
                    return ClosureStep::Yield(cmd);
                }
                CStmt::Atomic(dest, op, idx, val, cmp) => {
                    self.run_atomic(&dest, op, &idx, &val, &cmp);
                    self.pc += 1;
                }
                CStmt::Halt => return ClosureStep::Finished,
            }
        }
    }
}
