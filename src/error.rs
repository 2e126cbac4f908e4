//! Error types for the emulator.

use std::fmt;

/// The workgroup/subgroup coordinates and scheduler counters every fatal
/// runtime error is tagged with (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorLocation {
    pub workgroup_id: (u32, u32, u32),
    pub subgroup_id: u32,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workgroup ({}, {}, {}), subgroup {}",
            self.workgroup_id.0, self.workgroup_id.1, self.workgroup_id.2, self.subgroup_id
        )
    }
}

/// Main error type for emulator operations.
#[derive(Debug)]
pub enum EmulatorError {
    /// `MaxConcurrentWorkGroups` / thread-pool sizing is inconsistent, or
    /// `SubgroupSize` is out of the `[1, 32]` range.
    Config(String),
    /// A shader's AST is malformed: a nested routine definition, or an
    /// intrinsic called with the wrong arity.
    ShaderStructure(String),
    /// Two or more threads in the same workgroup arrived at a workgroup
    /// `barrier()` with different static op ids (I3).
    NonUniformBarrier { location: ErrorLocation, barrier_count: usize, num_active: usize },
    /// An outer scheduler tick made no progress while threads remained
    /// non-finished.
    Deadlock { location: ErrorLocation, barrier_count: usize, num_active: usize },
    /// A cooperative closure's yielded command and the scheduler's written-back
    /// result disagree in kind — indicates a transform/runtime mismatch.
    InvalidOpResult { location: ErrorLocation, expected: crate::value::Op, found: crate::value::Op },
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::Config(msg) => write!(f, "configuration error: {msg}"),
            EmulatorError::ShaderStructure(msg) => write!(f, "shader structure error: {msg}"),
            EmulatorError::NonUniformBarrier { location, barrier_count, num_active } => {
                write!(
                    f,
                    "non-uniform barrier at {location}: {barrier_count}/{num_active} threads arrived with mismatched op ids"
                )
            }
            EmulatorError::Deadlock { location, barrier_count, num_active } => {
                write!(
                    f,
                    "deadlock at {location}: no thread made progress ({barrier_count}/{num_active} at barrier)"
                )
            }
            EmulatorError::InvalidOpResult { location, expected, found } => {
                write!(f, "invalid subgroup operation at {location}: expected {expected:?}, found {found:?}")
            }
        }
    }
}

impl std::error::Error for EmulatorError {}

/// Result type alias for emulator operations.
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location_and_counts() {
        let err = EmulatorError::Deadlock {
            location: ErrorLocation { workgroup_id: (1, 0, 0), subgroup_id: 2 },
            barrier_count: 3,
            num_active: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("workgroup (1, 0, 0)"));
        assert!(msg.contains("subgroup 2"));
        assert!(msg.contains("3/8"));
    }
}
