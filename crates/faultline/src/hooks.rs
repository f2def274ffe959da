//! Entry-point interception.
//!
//! The host routes native dispatch and script entry through
//! [`Faultline::on_native_call`] and [`Faultline::on_exec`], either by
//! calling them from its own wrappers or by patching the VM's entry points
//! with a [`HookSet`] whose interceptors call them.

use crate::Faultline;
use crate::vm::GuestVm;
use faultline_detour::{CodeMemory, Detour, DetourError, target_address};
use faultline_types::{Cell, ErrorCode};
use tracing::{debug, info};

impl Faultline {
    /// Runs a native dispatch with a native crossing recorded for `index`.
    pub fn on_native_call<R>(&self, vm: &dyn GuestVm, index: Cell, dispatch: impl FnOnce() -> R) -> R {
        let _call = self.calls.push_native(vm.id(), index);
        dispatch()
    }

    /// Runs exec of public `index` with a script crossing recorded, and
    /// reports the error it returns, if any.
    pub fn on_exec(&self, vm: &dyn GuestVm, index: Cell, exec: impl FnOnce() -> ErrorCode) -> ErrorCode {
        let registers = vm.registers();
        let _call = self
            .calls
            .push_script(vm.id(), index, registers.frm, registers.cip);
        let code = exec();
        if code.is_error() {
            self.report_exec_error(vm, index, code);
        }
        code
    }
}

/// Code addresses of the VM's two entry points, or of their interceptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookTargets {
    pub dispatch: usize,
    pub exec: usize,
}

/// The dispatcher and exec detours, installed and removed together.
#[derive(Debug, Default)]
pub struct HookSet {
    dispatch: Detour,
    exec: Detour,
    previous: Option<HookTargets>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects `entries` to `interceptors`. An entry that already starts
    /// with a jump belongs to another interceptor; its target is kept in
    /// [`HookSet::previous_dispatch`] / [`HookSet::previous_exec`] so the
    /// interceptors can chain to it.
    ///
    /// Either both detours are installed or neither is.
    pub fn install<M: CodeMemory + ?Sized>(
        &mut self,
        memory: &mut M,
        entries: HookTargets,
        interceptors: HookTargets,
    ) -> Result<(), DetourError> {
        let previous = HookTargets {
            dispatch: target_address(memory, entries.dispatch).unwrap_or(entries.dispatch),
            exec: target_address(memory, entries.exec).unwrap_or(entries.exec),
        };
        self.dispatch
            .install(memory, entries.dispatch, interceptors.dispatch)?;
        if let Err(error) = self.exec.install(memory, entries.exec, interceptors.exec) {
            self.dispatch.remove(memory)?;
            return Err(error);
        }
        if previous.dispatch != entries.dispatch || previous.exec != entries.exec {
            debug!(
                dispatch = format_args!("{:#x}", previous.dispatch),
                exec = format_args!("{:#x}", previous.exec),
                "entry points were already intercepted, chaining"
            );
        }
        self.previous = Some(previous);
        info!("installed dispatch and exec hooks");
        Ok(())
    }

    /// Restores both entry points.
    pub fn remove<M: CodeMemory + ?Sized>(&mut self, memory: &mut M) -> Result<(), DetourError> {
        let exec = self.exec.remove(memory);
        let dispatch = self.dispatch.remove(memory);
        self.previous = None;
        exec.and(dispatch)?;
        info!("removed dispatch and exec hooks");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.dispatch.is_installed() && self.exec.is_installed()
    }

    /// Where dispatch went before it was hooked.
    pub fn previous_dispatch(&self) -> Option<usize> {
        self.previous.map(|previous| previous.dispatch)
    }

    /// Where exec went before it was hooked.
    pub fn previous_exec(&self) -> Option<usize> {
        self.previous.map(|previous| previous.exec)
    }
}
