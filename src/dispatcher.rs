//! The dispatcher (C4): computes workgroup/subgroup topology, fans a
//! dispatch out across `rayon`'s thread pool, and wires each subgroup's
//! [`Scheduler`](crate::scheduler::Scheduler) to the workgroup-wide
//! [`std::sync::Barrier`] its sibling subgroups share.

use std::sync::{Arc, Barrier};

use tracing::{info, info_span};

use crate::config::DispatcherConfig;
use crate::error::{EmulatorError, ErrorLocation, Result};
use crate::ids::{lane_masks, Extent3, ThreadContext, WorkGroupContext};
use crate::program::ShaderProgram;
use crate::scheduler::{Scheduler, ThreadClosure, WorkgroupBarrier};
use crate::shared::{DeepClone, SharedMemory};
use crate::ssbo::Ssbo;
use crate::transform::{compile_shader, CompiledShader, ShaderClosure};

struct StdBarrier(Barrier);

impl WorkgroupBarrier for StdBarrier {
    fn wait(&self) {
        self.0.wait();
    }
}

/// Computed, read-only dispatch topology (§4.4).
#[derive(Debug, Clone, Copy)]
struct Topology {
    threads_per_workgroup: u32,
    subgroups_per_workgroup: u32,
    /// Active lane count of every subgroup except the last, and of the last
    /// one too when `threads_per_workgroup` divides evenly.
    full_subgroup_size: usize,
    /// Active lane count of the final, possibly-partial subgroup.
    tail_subgroup_size: usize,
}

fn compute_topology(workgroup_size: Extent3, subgroup_size: usize) -> Topology {
    let threads_per_workgroup = workgroup_size.product();
    let subgroups_per_workgroup = (threads_per_workgroup as usize).div_ceil(subgroup_size) as u32;
    let remainder = threads_per_workgroup as usize % subgroup_size;
    let tail_subgroup_size = if remainder == 0 { subgroup_size } else { remainder };
    Topology {
        threads_per_workgroup,
        subgroups_per_workgroup,
        full_subgroup_size: subgroup_size,
        tail_subgroup_size,
    }
}

/// Drives one compute dispatch end to end: compiles the shader once, then
/// fans every workgroup (up to `max_concurrent_workgroups` concurrently)
/// and every subgroup within a workgroup out across `rayon`'s pool.
pub struct Dispatcher {
    config: DispatcherConfig,
    num_workgroups: Extent3,
    workgroup_size: Extent3,
    topology: Topology,
}

impl Dispatcher {
    /// Validates the config (I4) and checks the thread pool is large enough
    /// to run `max_concurrent_workgroups` workgroups' worth of subgroups
    /// concurrently without a `Barrier::wait` starving a runnable subgroup
    /// of a worker thread. Each concurrent workgroup needs one task for its
    /// supervisor (which blocks on `rx.recv()` for the whole workgroup) plus
    /// one task per subgroup, so the requirement is
    /// `max_concurrent_workgroups * (subgroups_per_workgroup + 1)`, not just
    /// the subgroup count.
    pub fn new(config: DispatcherConfig, num_workgroups: Extent3, workgroup_size: Extent3) -> Result<Self> {
        config.validate()?;
        let topology = compute_topology(workgroup_size, config.subgroup_size);

        let required = config.max_concurrent_workgroups * (topology.subgroups_per_workgroup as usize + 1);
        let available = rayon::current_num_threads();
        if available < required {
            return Err(EmulatorError::Config(format!(
                "thread pool has {available} threads but this dispatch needs {required} \
                 ({} concurrent workgroup(s) x ({} subgroup(s) + 1 supervisor) each) to avoid a starved barrier wait",
                config.max_concurrent_workgroups, topology.subgroups_per_workgroup
            )));
        }

        Ok(Self { config, num_workgroups, workgroup_size, topology })
    }

    /// Whether `workgroup_id` (and, if given, `subgroup_id`) matches this
    /// dispatch's [`crate::config::DebugSelector`].
    fn is_debug_target(&self, workgroup_id: Extent3, subgroup_id: Option<u32>) -> bool {
        let wg_matches = match self.config.debug.workgroup {
            Some(sel) => sel == (workgroup_id.x, workgroup_id.y, workgroup_id.z),
            None => false,
        };
        if !wg_matches {
            return false;
        }
        match (self.config.debug.subgroup_id, subgroup_id) {
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => true,
            (None, _) => true,
        }
    }

    fn thread_context(
        &self,
        global: Extent3,
        local: Extent3,
        subgroup_invocation_id: u32,
        workgroup_id: Extent3,
        subgroup_id: u32,
    ) -> ThreadContext {
        ThreadContext {
            global_invocation_id: global,
            local_invocation_id: local,
            subgroup_invocation_id,
            lane_masks: lane_masks(subgroup_invocation_id, self.config.subgroup_size),
            num_workgroups: self.num_workgroups,
            workgroup_size: self.workgroup_size,
            workgroup_id,
            num_subgroups: self.topology.subgroups_per_workgroup,
            subgroup_id,
        }
    }

    fn run_workgroup(
        &self,
        compiled: &Arc<CompiledShader>,
        ssbo: &Arc<Ssbo>,
        shared_seed: &Arc<SharedMemory>,
        workgroup_id: Extent3,
    ) -> Result<()> {
        let span = info_span!("workgroup", x = workgroup_id.x, y = workgroup_id.y, z = workgroup_id.z);
        let _enter = span.enter();

        let shared = Arc::new(shared_seed.deep_clone());
        let barrier = Arc::new(StdBarrier(Barrier::new(self.topology.subgroups_per_workgroup as usize)));

        if self.is_debug_target(workgroup_id, None) {
            let wg_ctx = WorkGroupContext {
                num_workgroups: self.num_workgroups,
                workgroup_size: self.workgroup_size,
                workgroup_id,
                num_subgroups: self.topology.subgroups_per_workgroup,
                subgroup_id: 0,
            };
            tracing::debug!(?wg_ctx, "selected workgroup entering dispatch");
        }

        // Every subgroup must be live on its own worker thread at the same
        // time, since each one blocks inside `barrier.wait()` until all its
        // siblings arrive — spawn them all within one scope, never one at a
        // time, or the first subgroup's wait would starve forever.
        let results: Vec<Result<()>> = rayon::scope(|s| {
            let mut handles = Vec::with_capacity(self.topology.subgroups_per_workgroup as usize);
            for subgroup_id in 0..self.topology.subgroups_per_workgroup {
                let (tx, rx) = std::sync::mpsc::channel();
                let compiled = Arc::clone(compiled);
                let ssbo = Arc::clone(ssbo);
                let shared = Arc::clone(&shared);
                let barrier = Arc::clone(&barrier);
                s.spawn(move |_| {
                    let r = self.run_subgroup(&compiled, &ssbo, &shared, &barrier, workgroup_id, subgroup_id);
                    let _ = tx.send(r);
                });
                handles.push(rx);
            }
            handles.into_iter().map(|rx| rx.recv().expect("subgroup task dropped its sender")).collect()
        });

        for r in results {
            r?;
        }
        Ok(())
    }

    fn run_subgroup(
        &self,
        compiled: &Arc<CompiledShader>,
        ssbo: &Arc<Ssbo>,
        shared: &Arc<SharedMemory>,
        barrier: &Arc<StdBarrier>,
        workgroup_id: Extent3,
        subgroup_id: u32,
    ) -> Result<()> {
        let num_active = if subgroup_id + 1 == self.topology.subgroups_per_workgroup {
            self.topology.tail_subgroup_size
        } else {
            self.topology.full_subgroup_size
        };

        let base = subgroup_id as usize * self.config.subgroup_size;
        let mut closures: Vec<Box<dyn ThreadClosure>> = Vec::with_capacity(num_active);
        for lane in 0..num_active {
            let local_flat = base + lane;
            let local = Extent3::new(
                local_flat as u32 % self.workgroup_size.x.max(1),
                (local_flat as u32 / self.workgroup_size.x.max(1)) % self.workgroup_size.y.max(1),
                local_flat as u32 / (self.workgroup_size.x.max(1) * self.workgroup_size.y.max(1)),
            );
            let global = Extent3::new(
                workgroup_id.x * self.workgroup_size.x + local.x,
                workgroup_id.y * self.workgroup_size.y + local.y,
                workgroup_id.z * self.workgroup_size.z + local.z,
            );
            let ctx = self.thread_context(global, local, lane as u32, workgroup_id, subgroup_id);
            closures.push(Box::new(ShaderClosure::new(
                Arc::clone(compiled),
                ctx,
                Arc::clone(ssbo),
                Arc::clone(shared),
            )));
        }

        let location = ErrorLocation { workgroup_id: (workgroup_id.x, workgroup_id.y, workgroup_id.z), subgroup_id };
        let mut scheduler = Scheduler::new(location, num_active);
        scheduler.run(&mut closures, barrier.as_ref())
    }

    /// Compile `program` and execute it over the whole `num_workgroups`
    /// grid, honouring `max_concurrent_workgroups`.
    pub fn dispatch(
        &self,
        program: &ShaderProgram,
        ssbo: Arc<Ssbo>,
        shared_seed: Arc<SharedMemory>,
    ) -> Result<()> {
        let compiled = Arc::new(compile_shader(program));
        info!(
            num_workgroups = ?self.num_workgroups,
            workgroup_size = ?self.workgroup_size,
            subgroups_per_workgroup = self.topology.subgroups_per_workgroup,
            "starting dispatch"
        );

        let all_ids: Vec<Extent3> = (0..self.num_workgroups.z)
            .flat_map(|z| {
                (0..self.num_workgroups.y).flat_map(move |y| (0..self.num_workgroups.x).map(move |x| Extent3::new(x, y, z)))
            })
            .collect();

        let chunks: Vec<&[Extent3]> = all_ids.chunks(self.config.max_concurrent_workgroups.max(1)).collect();
        for chunk in chunks {
            let results: Vec<Result<()>> = rayon::scope(|s| {
                let mut handles = Vec::with_capacity(chunk.len());
                for &workgroup_id in chunk {
                    let (tx, rx) = std::sync::mpsc::channel();
                    let compiled = Arc::clone(&compiled);
                    let ssbo = Arc::clone(&ssbo);
                    let shared_seed = Arc::clone(&shared_seed);
                    s.spawn(move |_| {
                        let r = self.run_workgroup(&compiled, &ssbo, &shared_seed, workgroup_id);
                        let _ = tx.send(r);
                    });
                    handles.push(rx);
                }
                handles.into_iter().map(|rx| rx.recv().expect("workgroup task dropped its sender")).collect()
            });
            for r in results {
                r?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_division_gives_uniform_subgroups() {
        let topo = compute_topology(Extent3::new(64, 1, 1), 32);
        assert_eq!(topo.subgroups_per_workgroup, 2);
        assert_eq!(topo.full_subgroup_size, 32);
        assert_eq!(topo.tail_subgroup_size, 32);
    }

    #[test]
    fn uneven_division_shrinks_tail_subgroup() {
        let topo = compute_topology(Extent3::new(40, 1, 1), 32);
        assert_eq!(topo.subgroups_per_workgroup, 2);
        assert_eq!(topo.tail_subgroup_size, 8);
    }

    #[test]
    fn undersized_thread_pool_is_rejected_at_construction() {
        // This dispatch wants 4 workgroups x (3 subgroups + 1 supervisor)
        // each = 16 threads concurrently, far more than any reasonable
        // default test pool.
        let config = DispatcherConfig::new(8, 4);
        let result = Dispatcher::new(config, Extent3::new(4, 1, 1), Extent3::new(24, 1, 1));
        if rayon::current_num_threads() < 16 {
            assert!(matches!(result, Err(EmulatorError::Config(_))));
        }
    }
}
