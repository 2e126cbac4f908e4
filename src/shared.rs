//! Per-workgroup shared memory (§3/§6).
//!
//! Every workgroup in a dispatch gets its own independent copy of the
//! shader's declared shared-memory block, seeded from the same initial
//! values. [`DeepClone`] is how the dispatcher produces one seed per
//! concurrently-running workgroup slot without the slots aliasing.

use std::sync::atomic::{AtomicI32, Ordering};

/// Produces an independent copy of `self`. Implemented by hand rather than
/// derived from [`Clone`] because the shared-memory cells use interior
/// mutability (`AtomicI32`, which is not itself `Clone`).
pub trait DeepClone {
    fn deep_clone(&self) -> Self;
}

/// One workgroup's shared-memory block: a flat array of signed 32-bit
/// cells, visible to every invocation in that workgroup and no other.
#[derive(Debug)]
pub struct SharedMemory {
    cells: Vec<AtomicI32>,
}

impl SharedMemory {
    pub fn zeroed(len: usize) -> Self {
        Self { cells: (0..len).map(|_| AtomicI32::new(0)).collect() }
    }

    pub fn seeded(values: Vec<i32>) -> Self {
        Self { cells: values.into_iter().map(AtomicI32::new).collect() }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn load(&self, index: usize) -> i32 {
        self.cells[index].load(Ordering::Relaxed)
    }

    pub fn store(&self, index: usize, value: i32) {
        self.cells[index].store(value, Ordering::Relaxed);
    }
}

impl DeepClone for SharedMemory {
    fn deep_clone(&self) -> Self {
        let values: Vec<i32> = self.cells.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        Self::seeded(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_clone_is_independent_of_the_original() {
        let seed = SharedMemory::seeded(vec![1, 2, 3]);
        let clone = seed.deep_clone();
        clone.store(0, 99);
        assert_eq!(seed.load(0), 1);
        assert_eq!(clone.load(0), 99);
    }
}
