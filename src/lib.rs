//! # wavefront-sim - CPU-hosted emulator of the GPU compute-shader execution model
//!
//! `wavefront-sim` reproduces the lockstep scheduling a real GPU applies to a
//! compute-shader workgroup on the CPU: a shader body is compiled into a
//! cooperative thread closure per invocation, and a per-subgroup scheduler
//! advances up to `SubgroupSize` of them in parallel, grouping threads by
//! their current operation id, running subgroup collectives across each
//! convergence group, and enforcing uniform-barrier semantics.
//!
//! ## Features
//!
//! - **Shader transform**: an embedded AST (`ShaderProgram`) compiled into a
//!   flat instruction stream, with reconvergence points inserted after every
//!   divergent branch and a peephole pass that drops redundant sync points.
//! - **Lockstep scheduler**: the per-subgroup state machine driving
//!   divergence, reconvergence, and barrier resolution.
//! - **Subgroup collectives**: broadcast, reductions, prefix sums, shuffles,
//!   ballot, and the boolean collectives, over `bool`/`i32`/`u32`/`f32`/`f64`,
//!   plus the pure (non-collective) ballot-mask queries (`inverseBallot`,
//!   bit counts, `findLSB`/`findMSB`).
//! - **Dispatcher**: workgroup/subgroup topology, `rayon`-backed concurrency,
//!   and per-workgroup shared memory with deep-copy-per-slot semantics.
//! - **Comprehensive logging**: `tracing` spans per workgroup/subgroup
//!   dispatch, with optional per-lane collective tracing gated by a
//!   `DebugSelector`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wavefront_sim::config::DispatcherConfig;
//! use wavefront_sim::dispatcher::Dispatcher;
//! use wavefront_sim::ids::Extent3;
//! use wavefront_sim::program::{Expr, Intrinsic, ShaderProgram, Stmt};
//! use wavefront_sim::shared::SharedMemory;
//! use wavefront_sim::ssbo::Ssbo;
//! use std::sync::Arc;
//!
//! // out[gid] = subgroupAdd(in[gid])
//! let program = ShaderProgram::new(vec![
//!     Stmt::Let("gid".into(), Expr::Builtin(wavefront_sim::program::Builtin::GlobalInvocationX)),
//!     Stmt::Let("v".into(), Expr::SsboLoad(Box::new(Expr::local("gid")))),
//!     Stmt::Eval(Some("sum".into()), Intrinsic::Add(Expr::local("v"))),
//!     Stmt::SsboStore(Expr::local("gid"), Expr::local("sum")),
//! ]);
//!
//! let config = DispatcherConfig::new(8, 2);
//! let dispatcher = Dispatcher::new(config, Extent3::new(4, 1, 1), Extent3::new(256, 1, 1))?;
//! let ssbo = Arc::new(Ssbo::new((0..1024).collect()));
//! let shared = Arc::new(SharedMemory::zeroed(0));
//! dispatcher.dispatch(&program, ssbo, shared)?;
//! # Ok::<(), wavefront_sim::error::EmulatorError>(())
//! ```

pub mod collectives;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod program;
pub mod scheduler;
pub mod shared;
pub mod ssbo;
pub mod transform;
pub mod value;

pub use config::{DebugSelector, DispatcherConfig};
pub use dispatcher::Dispatcher;
pub use error::{EmulatorError, ErrorLocation, Result};
pub use ids::{Extent3, ThreadContext, WorkGroupContext};
pub use program::ShaderProgram;
pub use scheduler::{Scheduler, ThreadClosure, ThreadState, WorkgroupBarrier};
pub use shared::SharedMemory;
pub use ssbo::Ssbo;
pub use value::{Command, Op, OpResult, RawValue, ValueType};

/// Convenience re-export so downstream crates can instrument alongside this
/// one without a separate `tracing` dependency declaration.
pub mod tracing {
    pub use tracing::*;
}
