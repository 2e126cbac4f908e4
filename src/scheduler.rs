//! The lockstep scheduler (C3) — the core of the emulator.
//!
//! Drives one subgroup: tracks per-thread state, groups threads sharing a
//! static op id into convergence groups, invokes the collective kernels
//! (§[`crate::collectives`]), resolves reconvergence and barriers, and
//! raises deadlock / non-uniform-barrier errors.

use std::sync::atomic::{fence, Ordering};

use tracing::{debug, trace, warn};

use crate::collectives;
use crate::error::{EmulatorError, ErrorLocation, Result};
use crate::value::{Command, Op, OpResult};

/// Sentinel used for `min_reconv_id`/`barrier_id` when nothing is pending.
const NONE_PENDING: u32 = u32::MAX;

/// Per-thread lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Halted,
    AtSubBarrier,
    AtBarrier,
    Finished,
}

/// What a cooperative thread closure does when resumed.
pub enum ClosureStep {
    /// Suspend, emitting a command for the scheduler to act on.
    Yield(Command),
    /// The closure's shader body has run to completion.
    Finished,
}

/// A single invocation's cooperative thread, produced by the shader
/// transform (`src/transform.rs`) for one dispatch.
///
/// `resume` is called with `None` exactly once (the first resume, with no
/// prior result) and with `Some(result)` on every subsequent resume.
pub trait ThreadClosure {
    fn resume(&mut self, result: Option<OpResult>) -> ClosureStep;
}

/// The workgroup-wide synchronization primitive a [`Scheduler`] waits on
/// when executing a `Barrier` convergence group (O3). Implemented for
/// `std::sync::Barrier` by [`crate::dispatcher`].
pub trait WorkgroupBarrier: Send + Sync {
    fn wait(&self);
}

fn state_for_op(op: Op) -> ThreadState {
    if op == Op::Reconverge {
        ThreadState::Halted
    } else if op.is_subgroup_sync() {
        ThreadState::AtSubBarrier
    } else if op.is_workgroup_sync() {
        ThreadState::AtBarrier
    } else {
        ThreadState::Running
    }
}

/// Drives one subgroup to completion.
pub struct Scheduler {
    location: ErrorLocation,
    num_active: usize,
    states: Vec<ThreadState>,
    commands: Vec<Option<Command>>,
    results: Vec<Option<OpResult>>,
    min_reconv_id: u32,
    barrier_id: u32,
    barrier_count: usize,
    /// True iff every non-finished, non-`AtBarrier` thread is `Halted` or
    /// `AtSubBarrier` — the first conjunct of `canReconverge` (§4.3): a
    /// halted thread may not resume past its reconverge point while a
    /// sibling is still `Running` inside the divergent region.
    all_halted_or_subbarrier: bool,
}

impl Scheduler {
    /// `num_active` is the number of lanes actually scheduled into this
    /// subgroup (may be less than `SubgroupSize` for the tail subgroup).
    pub fn new(location: ErrorLocation, num_active: usize) -> Self {
        Self {
            location,
            num_active,
            states: vec![ThreadState::Running; num_active],
            commands: vec![None; num_active],
            results: vec![None; num_active],
            min_reconv_id: NONE_PENDING,
            barrier_id: NONE_PENDING,
            barrier_count: 0,
            all_halted_or_subbarrier: false,
        }
    }

    fn can_reconverge(&self, t: usize) -> bool {
        let state = self.states[t];
        if !(state == ThreadState::Halted || state == ThreadState::AtSubBarrier) {
            return false;
        }
        if !self.all_halted_or_subbarrier {
            return false;
        }
        let Some(cmd) = &self.commands[t] else { return false };
        self.min_reconv_id < self.barrier_id && cmd.op_id == self.min_reconv_id
    }

    fn can_pass_barrier(&self, t: usize) -> bool {
        if self.states[t] != ThreadState::AtBarrier {
            return false;
        }
        let Some(cmd) = &self.commands[t] else { return false };
        self.barrier_count == self.num_active && cmd.op_id == self.barrier_id
    }

    /// Run this subgroup's closures to completion, driving the outer tick
    /// loop from §4.3. `closures[t]` must be populated for every `t` in
    /// `0..num_active`. `barrier` is the dispatcher-provided workgroup latch.
    pub fn run(
        &mut self,
        closures: &mut [Box<dyn ThreadClosure>],
        barrier: &dyn WorkgroupBarrier,
    ) -> Result<()> {
        debug_assert_eq!(closures.len(), self.num_active);

        loop {
            let mut made_progress = false;
            let mut resumed = vec![false; self.num_active];

            // --- 1. Resume phase ---
            for t in 0..self.num_active {
                if self.states[t] == ThreadState::Finished {
                    continue;
                }
                let eligible =
                    self.states[t] == ThreadState::Running || self.can_reconverge(t) || self.can_pass_barrier(t);
                if !eligible {
                    continue;
                }

                let incoming = self.results[t].take();
                if let (Some(cmd), Some(res)) = (&self.commands[t], &incoming) {
                    if cmd.op != res.op {
                        return Err(EmulatorError::InvalidOpResult {
                            location: self.location,
                            expected: cmd.op,
                            found: res.op,
                        });
                    }
                }

                match closures[t].resume(incoming) {
                    ClosureStep::Yield(cmd) => {
                        trace!(lane = t, op = ?cmd.op, op_id = cmd.op_id, "thread yielded");
                        self.states[t] = state_for_op(cmd.op);
                        self.commands[t] = Some(cmd);
                    }
                    ClosureStep::Finished => {
                        trace!(lane = t, "thread finished");
                        self.states[t] = ThreadState::Finished;
                        self.commands[t] = None;
                    }
                }
                resumed[t] = true;
                made_progress = true;
            }

            // --- 2. Scan phase ---
            let mut min_reconv_id = NONE_PENDING;
            let mut barrier_id = NONE_PENDING;
            let mut barrier_count = 0usize;
            let mut all_finished = true;
            let mut all_halted_or_subbarrier = true;

            for t in 0..self.num_active {
                match self.states[t] {
                    ThreadState::Finished => continue,
                    ThreadState::Halted | ThreadState::AtSubBarrier => {
                        all_finished = false;
                        if let Some(cmd) = &self.commands[t] {
                            min_reconv_id = min_reconv_id.min(cmd.op_id);
                        }
                    }
                    ThreadState::AtBarrier => {
                        all_finished = false;
                        if let Some(cmd) = &self.commands[t] {
                            if barrier_count == 0 {
                                barrier_id = cmd.op_id;
                            } else if cmd.op_id != barrier_id {
                                return Err(EmulatorError::NonUniformBarrier {
                                    location: self.location,
                                    barrier_count: barrier_count + 1,
                                    num_active: self.num_active,
                                });
                            }
                            barrier_count += 1;
                        }
                    }
                    ThreadState::Running => {
                        all_finished = false;
                        all_halted_or_subbarrier = false;
                    }
                }
            }

            self.min_reconv_id = min_reconv_id;
            self.barrier_id = barrier_id;
            self.barrier_count = barrier_count;
            self.all_halted_or_subbarrier = all_halted_or_subbarrier;

            if all_finished {
                debug!(location = %self.location, "subgroup finished");
                return Ok(());
            }

            if !made_progress {
                warn!(location = %self.location, barrier_count, num_active = self.num_active, "no progress made this tick");
                return Err(EmulatorError::Deadlock {
                    location: self.location,
                    barrier_count,
                    num_active: self.num_active,
                });
            }

            // --- 3. Grouping phase ---
            let mut groups: Vec<(u32, Op, Vec<usize>)> = Vec::new();
            for t in 0..self.num_active {
                if !resumed[t] {
                    continue;
                }
                let Some(cmd) = &self.commands[t] else { continue };
                match groups.iter_mut().find(|(id, _, _)| *id == cmd.op_id) {
                    Some((_, _, members)) => members.push(t),
                    None => groups.push((cmd.op_id, cmd.op, vec![t])),
                }
            }

            // --- 4. Execute phase ---
            for (op_id, op, mut members) in groups {
                members.sort_unstable();
                let first_thread_id = members[0];

                if op.is_workgroup_sync() {
                    barrier.wait();
                }
                if op.is_memory_fence() {
                    fence(Ordering::SeqCst);
                }

                let commands: Vec<Command> =
                    (0..self.num_active).map(|t| self.commands[t].unwrap_or(Command::idle(op_id))).collect();
                let mut out = vec![None; self.num_active];
                collectives::execute(op, &commands, &members, first_thread_id, op_id, &mut out);
                for t in members {
                    self.results[t] = out[t];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{CommandPayload, RawValue, ValueType};

    /// A closure that runs a fixed script of ops, one per resume, then finishes.
    struct ScriptClosure {
        ops: Vec<Command>,
        next: usize,
    }

    impl ThreadClosure for ScriptClosure {
        fn resume(&mut self, _result: Option<OpResult>) -> ClosureStep {
            if self.next >= self.ops.len() {
                return ClosureStep::Finished;
            }
            let cmd = self.ops[self.next];
            self.next += 1;
            ClosureStep::Yield(cmd)
        }
    }

    struct NoopBarrier;
    impl WorkgroupBarrier for NoopBarrier {
        fn wait(&self) {}
    }

    fn add_cmd(op_id: u32, v: i32) -> Command {
        Command::scalar(op_id, Op::Add, ValueType::I32, RawValue::from_i32(v), 0)
    }

    #[test]
    fn uniform_add_resolves_in_one_tick_per_lane() {
        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 4);
        let mut closures: Vec<Box<dyn ThreadClosure>> = (0..4)
            .map(|i| Box::new(ScriptClosure { ops: vec![add_cmd(0, i as i32 + 1)], next: 0 }) as Box<dyn ThreadClosure>)
            .collect();
        sched.run(&mut closures, &NoopBarrier).unwrap();
    }

    #[test]
    fn divergent_then_reconverge_resolves() {
        // lanes 0,1 run op_id 0 then reconverge at op_id 1; lane 2,3 go straight to reconverge at op_id 1.
        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 4);
        let mut closures: Vec<Box<dyn ThreadClosure>> = vec![
            Box::new(ScriptClosure { ops: vec![add_cmd(0, 1), Command::control(1, Op::Reconverge)], next: 0 }),
            Box::new(ScriptClosure { ops: vec![add_cmd(0, 2), Command::control(1, Op::Reconverge)], next: 0 }),
            Box::new(ScriptClosure { ops: vec![Command::control(1, Op::Reconverge)], next: 0 }),
            Box::new(ScriptClosure { ops: vec![Command::control(1, Op::Reconverge)], next: 0 }),
        ];
        sched.run(&mut closures, &NoopBarrier).unwrap();
    }

    #[test]
    fn barrier_inside_divergent_branch_deadlocks() {
        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 2);
        let mut closures: Vec<Box<dyn ThreadClosure>> = vec![
            // lane 0 takes the branch: barrier() at op_id 0, then the shared reconverge at op_id 1
            Box::new(ScriptClosure {
                ops: vec![Command::control(0, Op::Barrier), Command::control(1, Op::Reconverge)],
                next: 0,
            }),
            // lane 1 skips the branch: straight to the shared reconverge at op_id 1
            Box::new(ScriptClosure { ops: vec![Command::control(1, Op::Reconverge)], next: 0 }),
        ];
        let err = sched.run(&mut closures, &NoopBarrier).unwrap_err();
        assert!(matches!(err, EmulatorError::Deadlock { .. }));
    }

    #[test]
    fn mismatched_barrier_op_ids_are_non_uniform() {
        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 2);
        let mut closures: Vec<Box<dyn ThreadClosure>> = vec![
            Box::new(ScriptClosure { ops: vec![Command::control(0, Op::Barrier)], next: 0 }),
            Box::new(ScriptClosure { ops: vec![Command::control(1, Op::Barrier)], next: 0 }),
        ];
        let err = sched.run(&mut closures, &NoopBarrier).unwrap_err();
        assert!(matches!(err, EmulatorError::NonUniformBarrier { .. }));
    }

    #[test]
    fn single_lane_reconverge_round_trip_does_not_misfire_invalid_op_check() {
        // The scheduler always feeds back a result matching the awaited
        // command's op, so InvalidOpResult should never trigger on a
        // correctly-behaved closure; this exercises that the round trip
        // through Halted -> resumed-with-matching-result -> Finished is clean.
        struct OneShotReconverge;
        impl ThreadClosure for OneShotReconverge {
            fn resume(&mut self, result: Option<OpResult>) -> ClosureStep {
                match result {
                    None => ClosureStep::Yield(Command::control(0, Op::Reconverge)),
                    Some(_) => ClosureStep::Finished,
                }
            }
        }
        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 1);
        let mut closures: Vec<Box<dyn ThreadClosure>> = vec![Box::new(OneShotReconverge)];
        sched.run(&mut closures, &NoopBarrier).unwrap();
    }

    #[test]
    fn reconverged_lane_does_not_resume_past_a_still_running_sibling() {
        // lane 0 takes a branch: a collective only it sees (op_id 0), then
        // the shared reconverge (op_id 1), then a shared post-reconverge
        // collective (op_id 2). lane 1 skips the branch and goes straight to
        // the reconverge. If a Halted lane at the reconverge point were
        // allowed to resume merely because its op_id matched the minimum —
        // without checking that no sibling is still Running — lane 1 would
        // race ahead of lane 0 and take op_id 2 alone, splitting what must
        // be a single two-lane collective into two single-lane ones.
        use std::cell::Cell;
        use std::rc::Rc;
        use crate::value::ResultPayload;

        struct TraceClosure {
            ops: Vec<Command>,
            next: usize,
            captured: Rc<Cell<Option<i32>>>,
        }

        impl ThreadClosure for TraceClosure {
            fn resume(&mut self, result: Option<OpResult>) -> ClosureStep {
                if let Some(res) = result {
                    if let ResultPayload::Scalar { val, .. } = res.payload {
                        self.captured.set(Some(val.as_i32()));
                    }
                }
                if self.next >= self.ops.len() {
                    return ClosureStep::Finished;
                }
                let cmd = self.ops[self.next];
                self.next += 1;
                ClosureStep::Yield(cmd)
            }
        }

        let loc = ErrorLocation::default();
        let mut sched = Scheduler::new(loc, 2);

        let lane0_result = Rc::new(Cell::new(None));
        let lane1_result = Rc::new(Cell::new(None));

        let mut closures: Vec<Box<dyn ThreadClosure>> = vec![
            Box::new(TraceClosure {
                ops: vec![add_cmd(0, 10), Command::control(1, Op::Reconverge), add_cmd(2, 1)],
                next: 0,
                captured: lane0_result.clone(),
            }),
            Box::new(TraceClosure {
                ops: vec![Command::control(1, Op::Reconverge), add_cmd(2, 2)],
                next: 0,
                captured: lane1_result.clone(),
            }),
        ];

        sched.run(&mut closures, &NoopBarrier).unwrap();

        // The post-reconverge add must see both lanes (1 + 2 == 3); a lane
        // resuming alone would observe only its own contribution.
        assert_eq!(lane0_result.get(), Some(3));
        assert_eq!(lane1_result.get(), Some(3));
    }
}
