//! Host/guest call-boundary stack and the reporting guard.
//!
//! Every native dispatch and every script entry pushes a [`CallRecord`] for
//! the duration of the call. The push returns a guard that pops on drop, so
//! early returns and unwinding keep the stack balanced.

use faultline_types::{CallRecord, Cell, VmId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

const INITIAL_CAPACITY: usize = 64;

pub struct CallBoundaryStack {
    records: Mutex<Vec<CallRecord>>,
}

impl Default for CallBoundaryStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CallBoundaryStack {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(INITIAL_CAPACITY)),
        }
    }

    pub fn push(&self, record: CallRecord) -> CallGuard<'_> {
        let mut records = self.records.lock();
        records.push(record);
        CallGuard {
            stack: self,
            depth: records.len(),
        }
    }

    pub fn push_native(&self, vm: VmId, index: Cell) -> CallGuard<'_> {
        self.push(CallRecord::native(vm, index))
    }

    /// `frm` and `cip` are the VM registers at the moment of entry.
    pub fn push_script(&self, vm: VmId, index: Cell, frm: Cell, cip: Cell) -> CallGuard<'_> {
        self.push(CallRecord::script(vm, index, frm, cip))
    }

    /// Removes the innermost record. The guard that pushed it then pops
    /// nothing when dropped.
    pub fn pop(&self) -> Option<CallRecord> {
        self.records.lock().pop()
    }

    pub fn top(&self) -> Option<CallRecord> {
        self.records.lock().last().copied()
    }

    pub fn depth(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Copy of the chain, innermost first. `None` if the stack is being
    /// mutated right now, which only happens when called from a signal handler
    /// that interrupted a push or pop.
    pub fn snapshot(&self) -> Option<Vec<CallRecord>> {
        self.records
            .try_lock()
            .map(|records| records.iter().rev().copied().collect())
    }

    /// Runs `f` on the chain (outermost first) without copying it.
    pub fn with_chain<R>(&self, f: impl FnOnce(&[CallRecord]) -> R) -> Option<R> {
        self.records.try_lock().map(|records| f(&records))
    }
}

/// Pops its record when dropped.
#[must_use = "the record is popped as soon as the guard is dropped"]
pub struct CallGuard<'a> {
    stack: &'a CallBoundaryStack,
    depth: usize,
}

impl CallGuard<'_> {
    /// Stack depth including this guard's record.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn pop(self) {}
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut records = self.stack.records.lock();
        // The record may already be gone through `CallBoundaryStack::pop`.
        if records.len() >= self.depth {
            records.truncate(self.depth - 1);
        }
    }
}

/// Process-wide "a report is being written" flag.
#[derive(Debug, Default)]
pub struct ReportGuard {
    active: AtomicBool,
}

impl ReportGuard {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// Enters the reporting state, or returns `None` if a report is already
    /// in progress.
    pub fn try_enter(&self) -> Option<ReportToken<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReportToken { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct ReportToken<'a> {
    guard: &'a ReportGuard,
}

impl Drop for ReportToken<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}
