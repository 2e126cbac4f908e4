//! End-to-end dispatch scenarios (S1, S3, S4, S5, S6 from the testable
//! properties). S2 is not duplicated here: it exercises the same reduction
//! and shared-memory/barrier primitives S1 and S3 already cover, see
//! `DESIGN.md`.

use std::sync::Arc;

use wavefront_sim::config::DispatcherConfig;
use wavefront_sim::dispatcher::Dispatcher;
use wavefront_sim::error::EmulatorError;
use wavefront_sim::ids::Extent3;
use wavefront_sim::program::{AtomicOp, BinOp, Builtin, Expr, Intrinsic, ShaderProgram, Stmt};
use wavefront_sim::shared::SharedMemory;
use wavefront_sim::ssbo::Ssbo;

/// Runs `f` inside a dedicated `rayon` pool with exactly `threads` workers,
/// so a dispatch's subgroup-count requirement is satisfied regardless of how
/// many cores the machine running the test actually has.
fn run_with_pool<R: Send>(threads: usize, f: impl FnOnce() -> R + Send) -> R {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().expect("build scratch pool");
    pool.install(f)
}

/// S1 — single-pass reduction: `subgroupAdd` over `input[gid]`, with the
/// elected lane of each subgroup atomically folding its partial sum into a
/// shared accumulator. Expects `sum == 1023*1024/2`.
#[test]
fn s1_subgroup_add_then_atomic_accumulate() {
    const N: usize = 1024;
    const SUM_CELL: i32 = N as i32;

    let program = ShaderProgram::new(vec![
        Stmt::Let("gid".into(), Expr::Builtin(Builtin::GlobalInvocationX)),
        Stmt::Let("v".into(), Expr::SsboLoad(Box::new(Expr::local("gid")))),
        Stmt::Eval(Some("sum".into()), Intrinsic::Add(Expr::local("v"))),
        Stmt::Eval(Some("is_elect".into()), Intrinsic::Elect),
        Stmt::If(
            Expr::local("is_elect"),
            vec![Stmt::Atomic(None, AtomicOp::Add, Expr::ConstI32(SUM_CELL), Expr::local("sum"), None)],
            vec![],
        ),
    ]);

    let config = DispatcherConfig::new(8, 1);
    let num_workgroups = Extent3::new(4, 1, 1);
    let workgroup_size = Extent3::new(256, 1, 1);

    // 4 workgroups x (32 subgroups (256/8) + 1 supervisor) each, run one
    // workgroup at a time.
    let sum = run_with_pool(33, || {
        let dispatcher = Dispatcher::new(config.clone(), num_workgroups, workgroup_size).unwrap();
        let mut cells: Vec<i32> = (0..N as i32).collect();
        cells.push(0); // accumulator cell
        let ssbo = Arc::new(Ssbo::new(cells));
        let shared = Arc::new(SharedMemory::zeroed(0));
        dispatcher.dispatch(&program, Arc::clone(&ssbo), shared).unwrap();
        ssbo.load(N)
    });

    assert_eq!(sum, (N as i32 - 1) * N as i32 / 2);
}

/// S3 — a 16-wide workgroup split into two 8-lane subgroups; each lane reads
/// its right neighbor (clamped at the end), then `subgroupBroadcastFirst`s
/// that value to the rest of its subgroup between two barriers.
#[test]
fn s3_broadcast_first_across_two_subgroups() {
    let program = ShaderProgram::new(vec![
        Stmt::Let("gid".into(), Expr::Builtin(Builtin::GlobalInvocationX)),
        Stmt::Eval(None, Intrinsic::Barrier),
        Stmt::Let("nxt".into(), Expr::BinOp(BinOp::Add, Box::new(Expr::local("gid")), Box::new(Expr::ConstI32(1)))),
        Stmt::If(
            Expr::BinOp(BinOp::Lt, Box::new(Expr::local("nxt")), Box::new(Expr::ConstI32(16))),
            vec![Stmt::Let("idx".into(), Expr::local("nxt"))],
            vec![Stmt::Let("idx".into(), Expr::local("gid"))],
        ),
        Stmt::Let("val".into(), Expr::SsboLoad(Box::new(Expr::local("idx")))),
        Stmt::Eval(Some("bc".into()), Intrinsic::BroadcastFirst(Expr::local("val"))),
        Stmt::Eval(None, Intrinsic::Barrier),
        Stmt::SsboStore(Expr::local("gid"), Expr::local("bc")),
    ]);

    let config = DispatcherConfig::new(8, 1);
    let dispatcher = Dispatcher::new(config, Extent3::new(1, 1, 1), Extent3::new(16, 1, 1)).unwrap();
    let ssbo = Arc::new(Ssbo::new((0..16).collect()));
    let shared = Arc::new(SharedMemory::zeroed(0));

    run_with_pool(4, || dispatcher.dispatch(&program, Arc::clone(&ssbo), shared).unwrap());

    let expected = [1, 1, 1, 1, 1, 1, 1, 1, 9, 9, 9, 9, 9, 9, 9, 9];
    assert_eq!(ssbo.to_vec(), expected);
}

/// S4 — continue-aware reconvergence: lane 2 takes a `continue` inside a
/// single-iteration loop and never reaches the `subgroupBroadcastFirst`
/// call; the remaining lanes reconverge on it and all observe lane 0's
/// value, exactly as [`collectives::execute`]'s `BroadcastFirst` contract
/// promises for whichever lane sorts lowest in the convergence group.
#[test]
fn s4_continuing_lane_is_excluded_from_the_reconverged_broadcast() {
    let program = ShaderProgram::new(vec![
        Stmt::Let("tid".into(), Expr::Builtin(Builtin::GlobalInvocationX)),
        Stmt::Let("value".into(), Expr::ConstI32(-1)),
        Stmt::For(
            "i".into(),
            Expr::ConstI32(0),
            Expr::ConstI32(1),
            vec![
                Stmt::If(
                    Expr::BinOp(BinOp::Eq, Box::new(Expr::local("tid")), Box::new(Expr::ConstI32(2))),
                    vec![Stmt::Continue],
                    vec![],
                ),
                Stmt::Eval(Some("value".into()), Intrinsic::BroadcastFirst(Expr::local("tid"))),
            ],
        ),
        Stmt::SsboStore(Expr::local("tid"), Expr::local("value")),
    ]);

    let config = DispatcherConfig::new(8, 1);
    let dispatcher = Dispatcher::new(config, Extent3::new(1, 1, 1), Extent3::new(8, 1, 1)).unwrap();
    let ssbo = Arc::new(Ssbo::zeroed(8));
    let shared = Arc::new(SharedMemory::zeroed(0));

    run_with_pool(2, || dispatcher.dispatch(&program, Arc::clone(&ssbo), shared).unwrap());

    // Lane 2 never executed the intrinsic, so it keeps the sentinel; every
    // other lane reconverges on the same call and all see lane 0's value (0).
    assert_eq!(ssbo.to_vec(), vec![0, 0, -1, 0, 0, 0, 0, 0]);
}

/// S5 — `barrier()` called from inside a branch only one lane takes is
/// unsatisfiable: that lane can never collect `barrier_count == num_active`,
/// and the other lanes' reconverge point has a strictly later static op id
/// than the barrier, so `min_reconv_id < barrier_id` never holds either.
/// No thread ever makes progress again: a `Deadlock`, not a hang.
#[test]
fn s5_barrier_inside_divergent_branch_is_fatal() {
    let program = ShaderProgram::new(vec![
        Stmt::Let("lid".into(), Expr::Builtin(Builtin::LocalInvocationX)),
        Stmt::If(
            Expr::BinOp(BinOp::Eq, Box::new(Expr::local("lid")), Box::new(Expr::ConstI32(1))),
            vec![Stmt::Eval(None, Intrinsic::Barrier)],
            vec![],
        ),
    ]);

    let config = DispatcherConfig::new(4, 1);
    let dispatcher = Dispatcher::new(config, Extent3::new(1, 1, 1), Extent3::new(4, 1, 1)).unwrap();
    let ssbo = Arc::new(Ssbo::zeroed(4));
    let shared = Arc::new(SharedMemory::zeroed(0));

    let result = run_with_pool(2, || dispatcher.dispatch(&program, ssbo, shared));
    assert!(
        matches!(result, Err(EmulatorError::Deadlock { .. }) | Err(EmulatorError::NonUniformBarrier { .. })),
        "expected a fatal scheduler error, got {result:?}"
    );
}

/// S6 — determinism: two dispatches of an atomics-free reduction, same
/// shape and input, produce bit-identical per-cell output.
#[test]
fn s6_repeated_dispatch_is_deterministic() {
    let program = ShaderProgram::new(vec![
        Stmt::Let("gid".into(), Expr::Builtin(Builtin::GlobalInvocationX)),
        Stmt::Let("v".into(), Expr::SsboLoad(Box::new(Expr::local("gid")))),
        Stmt::Eval(Some("sum".into()), Intrinsic::InclusiveAdd(Expr::local("v"))),
        Stmt::SsboStore(Expr::local("gid"), Expr::local("sum")),
    ]);

    let config = DispatcherConfig::new(8, 2);
    let num_workgroups = Extent3::new(2, 1, 1);
    let workgroup_size = Extent3::new(16, 1, 1);

    // 2 concurrent workgroups x (2 subgroups (16/8) + 1 supervisor) each.
    let run_once = || {
        run_with_pool(6, || {
            let dispatcher = Dispatcher::new(config.clone(), num_workgroups, workgroup_size).unwrap();
            let ssbo = Arc::new(Ssbo::new((0..32).collect()));
            let shared = Arc::new(SharedMemory::zeroed(0));
            dispatcher.dispatch(&program, Arc::clone(&ssbo), shared).unwrap();
            ssbo.to_vec()
        })
    };

    assert_eq!(run_once(), run_once());
}

/// `atomicCompSwap` only swaps when the caller's `compare` operand matches
/// the memory cell's current value, even when that value no longer matches
/// what an earlier `load` observed.
#[test]
fn compare_exchange_only_swaps_on_a_matching_compare() {
    let program = ShaderProgram::new(vec![
        Stmt::Atomic(
            Some("r1".into()),
            AtomicOp::CompareExchange,
            Expr::ConstI32(0),
            Expr::ConstI32(99),
            Some(Expr::ConstI32(10)),
        ),
        Stmt::Atomic(
            Some("r2".into()),
            AtomicOp::CompareExchange,
            Expr::ConstI32(0),
            Expr::ConstI32(55),
            Some(Expr::ConstI32(10)),
        ),
        Stmt::SsboStore(Expr::ConstI32(1), Expr::local("r1")),
        Stmt::SsboStore(Expr::ConstI32(2), Expr::local("r2")),
    ]);

    let config = DispatcherConfig::new(1, 1);
    let dispatcher = Dispatcher::new(config, Extent3::new(1, 1, 1), Extent3::new(1, 1, 1)).unwrap();
    let ssbo = Arc::new(Ssbo::new(vec![10, 0, 0]));
    let shared = Arc::new(SharedMemory::zeroed(0));

    run_with_pool(2, || dispatcher.dispatch(&program, Arc::clone(&ssbo), shared).unwrap());

    // First swap matches (compare == 10) and takes effect: cell becomes 99,
    // r1 observes the pre-swap value 10. Second swap still compares against
    // 10, but the cell is now 99, so it must fail: r2 observes 99, unchanged.
    assert_eq!(ssbo.to_vec(), vec![99, 10, 99]);
}
