//! Storage-buffer object: the one piece of state every workgroup in a
//! dispatch shares (§6). Reads and writes are plain, unsynchronized loads —
//! a shader racing on them without a barrier gets whatever the hardware
//! would give it. Atomic operations are the one exception: the emulator
//! does not interpose a lock for them, it hands out real
//! `std::sync::atomic` seq-cst read-modify-writes, which need no lockstep
//! coordination at all.

use std::sync::atomic::{AtomicI32, Ordering};

/// A flat buffer of signed 32-bit cells, shared by every invocation in a
/// dispatch. Plain loads/stores use `Relaxed` ordering — callers are
/// expected to order visibility with `barrier()`/`memoryBarrier()`, exactly
/// as a real compute shader must.
#[derive(Debug)]
pub struct Ssbo {
    cells: Vec<AtomicI32>,
}

impl Ssbo {
    pub fn new(initial: Vec<i32>) -> Self {
        Self { cells: initial.into_iter().map(AtomicI32::new).collect() }
    }

    pub fn zeroed(len: usize) -> Self {
        Self { cells: (0..len).map(|_| AtomicI32::new(0)).collect() }
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

    /// Snapshot the whole buffer. Intended for test assertions after a
    /// dispatch has fully completed.
    pub fn to_vec(&self) -> Vec<i32> {
        self.cells.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    pub fn atomic_add(&self, index: usize, value: i32) -> i32 {
        self.cells[index].fetch_add(value, Ordering::SeqCst)
    }

    pub fn atomic_and(&self, index: usize, value: i32) -> i32 {
        self.cells[index].fetch_and(value, Ordering::SeqCst)
    }

    pub fn atomic_or(&self, index: usize, value: i32) -> i32 {
        self.cells[index].fetch_or(value, Ordering::SeqCst)
    }

    pub fn atomic_xor(&self, index: usize, value: i32) -> i32 {
        self.cells[index].fetch_xor(value, Ordering::SeqCst)
    }

    pub fn atomic_exchange(&self, index: usize, value: i32) -> i32 {
        self.cells[index].swap(value, Ordering::SeqCst)
    }

    /// Returns the value observed before the attempted swap, matching GLSL's
    /// `atomicCompSwap` (not Rust's `Result`-returning `compare_exchange`).
    pub fn atomic_compare_exchange(&self, index: usize, compare: i32, new_value: i32) -> i32 {
        match self.cells[index].compare_exchange(compare, new_value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_load_store_round_trips() {
        let ssbo = Ssbo::new(vec![1, 2, 3]);
        ssbo.store(1, 42);
        assert_eq!(ssbo.load(1), 42);
        assert_eq!(ssbo.to_vec(), vec![1, 42, 3]);
    }

    #[test]
    fn atomic_add_returns_previous_value() {
        let ssbo = Ssbo::zeroed(1);
        assert_eq!(ssbo.atomic_add(0, 5), 0);
        assert_eq!(ssbo.atomic_add(0, 7), 5);
        assert_eq!(ssbo.load(0), 12);
    }

    #[test]
    fn compare_exchange_only_swaps_on_match() {
        let ssbo = Ssbo::new(vec![10]);
        assert_eq!(ssbo.atomic_compare_exchange(0, 10, 99), 10);
        assert_eq!(ssbo.load(0), 99);
        assert_eq!(ssbo.atomic_compare_exchange(0, 10, 1), 99);
        assert_eq!(ssbo.load(0), 99);
    }
}
