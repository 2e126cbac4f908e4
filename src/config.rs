//! Dispatch configuration (§4.4).

use crate::error::{EmulatorError, Result};
use crate::ids::MAX_SUBGROUP_SIZE;

/// Optional trace-filter selectors: when set, only the named workgroup
/// (and, if further narrowed, subgroup) emits `trace!`-level scheduling
/// detail. Leaving a field `None` means "don't narrow on this axis".
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugSelector {
    pub workgroup: Option<(u32, u32, u32)>,
    pub subgroup_id: Option<u32>,
}

/// Tunables for one dispatch (§4.4). Constructed with [`DispatcherConfig::new`]
/// and refined with chained setters.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub subgroup_size: usize,
    pub max_concurrent_workgroups: usize,
    pub debug: DebugSelector,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { subgroup_size: 8, max_concurrent_workgroups: 2, debug: DebugSelector::default() }
    }
}

impl DispatcherConfig {
    pub fn new(subgroup_size: usize, max_concurrent_workgroups: usize) -> Self {
        Self { subgroup_size, max_concurrent_workgroups, debug: DebugSelector::default() }
    }

    pub fn subgroup_size(mut self, size: usize) -> Self {
        self.subgroup_size = size;
        self
    }

    pub fn max_concurrent_workgroups(mut self, max: usize) -> Self {
        self.max_concurrent_workgroups = max;
        self
    }

    pub fn debug_workgroup(mut self, x: u32, y: u32, z: u32) -> Self {
        self.debug.workgroup = Some((x, y, z));
        self
    }

    pub fn debug_subgroup_id(mut self, id: u32) -> Self {
        self.debug.subgroup_id = Some(id);
        self
    }

    /// Validate against I4 and the general shape of a workable config.
    /// Called once at `Dispatcher::new`.
    pub fn validate(&self) -> Result<()> {
        if self.subgroup_size == 0 || self.subgroup_size > MAX_SUBGROUP_SIZE {
            return Err(EmulatorError::Config(format!(
                "subgroup_size must be in [1, {MAX_SUBGROUP_SIZE}], got {}",
                self.subgroup_size
            )));
        }
        if self.max_concurrent_workgroups == 0 {
            return Err(EmulatorError::Config("max_concurrent_workgroups must be at least 1".into()));
        }
        Ok(())
    }
}
