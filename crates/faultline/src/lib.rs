//! Crash diagnostics for an embedded script VM.
//!
//! A [`Faultline`] tracks every crossing between host code and guest
//! bytecode, and turns runtime errors, native crashes and operator interrupts
//! into readable reports: the error, what caused it, the guest call chain with
//! source locations, and the native stack.
//!
//! The host wires it in at three points: [`Faultline::on_native_call`] around
//! native dispatch, [`Faultline::on_exec`] around script entry, and
//! [`signals::install`] for crashes and interrupts.

pub mod config;
pub mod guest;
pub mod hooks;
pub mod report;
pub mod script;
#[cfg(unix)]
pub mod signals;
pub mod sink;
pub mod tracker;
pub mod vm;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use faultline_capture::{MemoryReader, NativeContext};
pub use faultline_debuginfo::DebugSymbolTable;
pub use faultline_types::{CallRecord, Cell, ErrorCode, GuestFrame, NativeFrame, VmId, WalkEnd};
pub use report::FaultThread;
pub use script::Script;
pub use sink::{LineSink, StderrSink, TracingSink};
pub use tracker::{CallBoundaryStack, CallGuard, ReportGuard};
pub use vm::{GuestVm, NativeEntry, Opcode, PublicEntry, Registers};

use faultline_capture::ProcessMemory;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub(crate) struct Attached {
    pub(crate) vm: Arc<dyn GuestVm>,
    pub(crate) script: Arc<Script>,
}

/// Diagnostic context shared by the hooks, the reporter and the signal handlers.
pub struct Faultline {
    config: Config,
    calls: CallBoundaryStack,
    guard: ReportGuard,
    scripts: RwLock<BTreeMap<VmId, Attached>>,
    sink: Box<dyn LineSink>,
    native_reader: Box<dyn MemoryReader + Send + Sync>,
}

impl Faultline {
    pub fn new(config: Config, sink: impl LineSink + 'static) -> Self {
        Self {
            config,
            calls: CallBoundaryStack::new(),
            guard: ReportGuard::new(),
            scripts: RwLock::new(BTreeMap::new()),
            sink: Box::new(sink),
            native_reader: Box::new(ProcessMemory),
        }
    }

    /// Replaces how native stack memory is read during a native backtrace.
    pub fn with_native_reader(mut self, reader: impl MemoryReader + Send + Sync + 'static) -> Self {
        self.native_reader = Box::new(reader);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn calls(&self) -> &CallBoundaryStack {
        &self.calls
    }

    pub fn guard(&self) -> &ReportGuard {
        &self.guard
    }

    /// Registers a VM so crash reports can name its module and walk its frames.
    pub fn attach(&self, vm: Arc<dyn GuestVm>, script: Script) {
        let id = vm.id();
        info!(
            vm = %id,
            module = script.display_name(),
            debug_info = script.debug().is_loaded(),
            "attached script"
        );
        self.scripts.write().insert(
            id,
            Attached {
                vm,
                script: Arc::new(script),
            },
        );
    }

    pub fn detach(&self, vm: VmId) -> Option<Arc<Script>> {
        let attached = self.scripts.write().remove(&vm)?;
        info!(vm = %vm, module = attached.script.display_name(), "detached script");
        Some(attached.script)
    }

    pub fn script(&self, vm: VmId) -> Option<Arc<Script>> {
        self.scripts
            .read()
            .get(&vm)
            .map(|attached| Arc::clone(&attached.script))
    }
}
