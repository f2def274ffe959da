//! Report text: runtime errors, native crashes and interrupts.
//!
//! Everything here writes through `fmt::Write`. Runtime errors buffer the
//! guest backtrace in a `String` because it has to be captured before the
//! module's error callback runs. The crash and interrupt paths write straight
//! into a [`SinkWriter`] and only take locks with `try_*`, so they can run
//! inside a signal handler.

use crate::guest::{GuestCursor, GuestFrameRef, SegmentEntry, walk_segment};
use crate::script::Script;
use crate::sink::SinkWriter;
use crate::vm::{GuestVm, Opcode, natives};
use crate::{Attached, Config, Faultline};
use faultline_capture::{CaptureOptions, FrameRef, NativeContext, module_path_for_addr, walk};
use faultline_types::{CELL_SIZE, CallKind, CallRecord, Cell, ErrorCode, WalkEnd};
use std::fmt::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    Crash,
    Interrupt,
}

impl FaultKind {
    fn headline(self) -> &'static str {
        match self {
            Self::Crash => "Server crashed while executing",
            Self::Interrupt => "Server received interrupt signal while executing",
        }
    }

    fn headline_without_module(self) -> &'static str {
        match self {
            Self::Crash => "Server crashed due to an unknown error",
            Self::Interrupt => "Server received interrupt signal",
        }
    }
}

/// Which thread a native fault was raised on, relative to the one that
/// runs scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultThread {
    Scripts,
    Other,
}

fn prints_backtrace(code: ErrorCode) -> bool {
    !matches!(
        code,
        ErrorCode::NOT_FOUND | ErrorCode::INDEX | ErrorCode::CALLBACK | ErrorCode::INIT
    )
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn write_guest_frame(
    out: &mut dyn Write,
    level: usize,
    frame: &GuestFrameRef<'_>,
    script: &Script,
) -> fmt::Result {
    write!(out, "#{level} {:08x} in ", frame.code_address as u32)?;
    if frame.is_public {
        out.write_str("public ")?;
    }
    write!(out, "{} ()", frame.function.unwrap_or("??"))?;
    match (frame.file, frame.line) {
        (Some(file), Some(line)) => write!(out, " at {file}:{line}")?,
        (Some(file), None) => write!(out, " at {file}")?,
        _ => {}
    }
    if !script.debug().is_loaded() {
        if let Some(name) = script.name() {
            write!(out, " from {name}")?;
        }
    }
    out.write_char('\n')
}

fn write_native_call(
    out: &mut dyn Write,
    level: usize,
    name: &str,
    address: u64,
    resolve_module: bool,
) -> fmt::Result {
    write!(out, "#{level} native {name} () [{address:08x}]")?;
    let module = if resolve_module {
        module_path_for_addr(address)
    } else {
        ""
    };
    if !module.is_empty() {
        write!(out, " from {}", file_name(module))?;
    }
    out.write_char('\n')
}

/// Writes the guest chain of `vm`, innermost first, numbering frames across
/// native and script segments. Stops at the first record of another VM.
pub(crate) fn write_guest_backtrace<'r>(
    out: &mut dyn Write,
    vm: &dyn GuestVm,
    script: &Script,
    chain: impl IntoIterator<Item = &'r CallRecord>,
    config: &Config,
) -> Result<WalkEnd, fmt::Error> {
    let max_frames = config.max_guest_frames;
    let mut chain = chain.into_iter().peekable();
    match chain.peek() {
        Some(top) if top.vm == vm.id() => {}
        _ => return Ok(WalkEnd::Complete),
    }
    out.write_str("AMX backtrace:\n")?;

    let registers = vm.registers();
    let mut cursor = GuestCursor {
        cip: registers.cip,
        frm: registers.frm,
    };
    let mut level = 0usize;
    for record in chain {
        if record.vm != vm.id() {
            break;
        }
        if level >= max_frames {
            return Ok(WalkEnd::DepthLimit);
        }
        match record.kind {
            CallKind::Native => {
                // Unresolved natives never ran, so they have no frame to show.
                let native = vm.native(record.index).filter(|native| native.address != 0);
                if let Some(native) = native {
                    write_native_call(
                        out,
                        level,
                        native.name,
                        native.address,
                        config.resolve_native_modules,
                    )?;
                    level += 1;
                }
            }
            CallKind::Script => {
                let entry = vm.public(record.index).map(SegmentEntry::from);
                let mut written = Ok(());
                let end = walk_segment(
                    vm,
                    script.debug(),
                    cursor,
                    entry,
                    max_frames - level,
                    |frame| {
                        if written.is_ok() {
                            written = write_guest_frame(&mut *out, level, &frame, script);
                        }
                        level += 1;
                    },
                );
                written?;
                if !end.is_complete() {
                    return Ok(end);
                }
                cursor = GuestCursor {
                    cip: record.cip,
                    frm: record.frm,
                };
                if cursor.cip == 0 {
                    break;
                }
            }
        }
    }
    Ok(WalkEnd::Complete)
}

/// Explains a runtime error from the VM state it left behind.
pub(crate) fn write_error_detail(out: &mut dyn Write, vm: &dyn GuestVm, code: ErrorCode) -> fmt::Result {
    let registers = vm.registers();
    let cip = registers.cip;
    match code {
        ErrorCode::BOUNDS => {
            if vm.read_code(cip) != Some(vm.opcode(Opcode::Bounds)) {
                return Ok(());
            }
            let Some(bound) = cip.checked_add(CELL_SIZE).and_then(|at| vm.read_code(at)) else {
                return Ok(());
            };
            let index = registers.pri;
            if index < 0 {
                writeln!(out, " Accessing element at negative index {index}")
            } else {
                writeln!(
                    out,
                    " Accessing element at index {index} past array upper bound {bound}"
                )
            }
        }
        ErrorCode::NOT_FOUND => {
            for native in natives(vm).filter(|native| native.address == 0) {
                writeln!(out, " {}", native.name)?;
            }
            Ok(())
        }
        ErrorCode::STACK_ERR => writeln!(
            out,
            " Stack pointer (STK) is 0x{:X}, heap pointer (HEA) is 0x{:X}",
            registers.stk, registers.hea
        ),
        ErrorCode::STACK_LOW => writeln!(
            out,
            " Stack pointer (STK) is 0x{:X}, stack top (STP) is 0x{:X}",
            registers.stk, registers.stp
        ),
        ErrorCode::HEAP_LOW => writeln!(
            out,
            " Heap pointer (HEA) is 0x{:X}, heap bottom (HLW) is 0x{:X}",
            registers.hea, registers.hlw
        ),
        ErrorCode::INV_INSTR => match vm.read_code(cip) {
            Some(opcode) => writeln!(
                out,
                " Unknown opcode 0x{:x} at address 0x{:08X}",
                opcode, cip as u32
            ),
            None => Ok(()),
        },
        ErrorCode::NATIVE => {
            let call_site = cip.checked_sub(2 * CELL_SIZE);
            let is_sysreq =
                call_site.and_then(|at| vm.read_code(at)) == Some(vm.opcode(Opcode::SysreqC));
            if !is_sysreq {
                return Ok(());
            }
            let name = cip
                .checked_sub(CELL_SIZE)
                .and_then(|at| vm.read_code(at))
                .and_then(|index| vm.native(index))
                .map(|native| native.name);
            match name {
                Some(name) => writeln!(out, " {name}"),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

fn write_native_frame(out: &mut dyn Write, index: usize, frame: &FrameRef<'_>) -> fmt::Result {
    write!(out, "#{index} {:016x} in ", frame.ip)?;
    match (frame.symbol, frame.symbol_offset) {
        (Some(symbol), Some(offset)) => write!(out, "{symbol}+0x{offset:x}")?,
        (Some(symbol), None) => out.write_str(symbol)?,
        (None, _) => out.write_str("??")?,
    }
    out.write_str(" ()")?;
    if let Some(path) = frame.module_path.filter(|path| !path.is_empty()) {
        write!(out, " from {path}")?;
    }
    out.write_char('\n')
}

impl Faultline {
    fn is_ignored(&self, index: Cell, code: ErrorCode) -> bool {
        code == ErrorCode::NONE
            || code == ErrorCode::SLEEP
            || (code == ErrorCode::INDEX && index == self.config.compat_exec_index)
    }

    fn emit(&self, write: impl FnOnce(&mut SinkWriter<'_>) -> fmt::Result) {
        let mut out = SinkWriter::new(&*self.sink, &self.config.line_prefix);
        // The sink writer never fails; a partial report is still flushed.
        let _ = write(&mut out);
        out.finish();
    }

    /// Reports a runtime error returned by exec of public `index`.
    ///
    /// The detail line and guest backtrace are captured first, since the
    /// module's error callback runs guest code over the same registers. The
    /// callback may then suppress the report.
    pub fn report_exec_error(&self, vm: &dyn GuestVm, index: Cell, code: ErrorCode) {
        if self.is_ignored(index, code) {
            return;
        }
        let Some(_reporting) = self.guard.try_enter() else {
            debug!(code = code.get(), "runtime error raised while reporting, dropped");
            return;
        };

        let script = self
            .script(vm.id())
            .unwrap_or_else(|| Arc::new(Script::default()));
        let mut detail = String::new();
        let _ = write_error_detail(&mut detail, vm, code);
        let mut backtrace = String::new();
        if let Some(chain) = self.calls.snapshot() {
            let end = write_guest_backtrace(&mut backtrace, vm, &script, &chain, &self.config);
            if let Ok(WalkEnd::Corrupted { address }) = end {
                warn!(vm = %vm.id(), address, "guest frame chain is corrupted, backtrace truncated");
            }
        }

        if let Some(callback) = vm.find_public(&self.config.error_callback) {
            if vm.call_error_callback(callback, code) == Some(true) {
                debug!(vm = %vm.id(), code = code.get(), "runtime error suppressed by module");
                return;
            }
        }

        self.emit(|out| {
            writeln!(out, "Run time error {code}: \"{}\"", code.message())?;
            out.write_str(&detail)?;
            if prints_backtrace(code) {
                out.write_str(&backtrace)?;
            }
            Ok(())
        });
    }

    /// Reports an unhandled native fault. `context` is the faulting register
    /// state; without it the walk starts at the caller.
    pub fn report_native_fault(&self, context: Option<NativeContext>) {
        self.report_fault(FaultKind::Crash, context, FaultThread::Scripts);
    }

    /// Like [`Faultline::report_native_fault`], for a fault that may have
    /// been raised on a thread that does not run scripts. The call-boundary
    /// stack only describes the script thread, so the guest chain is left out
    /// for other threads.
    pub fn report_native_fault_on(&self, context: Option<NativeContext>, thread: FaultThread) {
        self.report_fault(FaultKind::Crash, context, thread);
    }

    /// Reports an operator interrupt.
    pub fn report_interrupt(&self, context: Option<NativeContext>) {
        self.report_fault(FaultKind::Interrupt, context, FaultThread::Scripts);
    }

    fn report_fault(&self, kind: FaultKind, context: Option<NativeContext>, thread: FaultThread) {
        let Some(_reporting) = self.guard.try_enter() else {
            return;
        };
        let context = context.or_else(|| NativeContext::current().ok());
        self.emit(|out| {
            let guest_written = thread == FaultThread::Scripts
                && self
                    .calls
                    .with_chain(|chain| self.write_active_chain(&mut *out, kind, chain))
                    .unwrap_or(Ok(false))?;
            if !guest_written {
                writeln!(out, "{}", kind.headline_without_module())?;
            }
            if let Some(context) = context {
                self.write_native_backtrace(out, context)?;
            }
            Ok(())
        });
    }

    /// Writes the headline and guest chain for the VM that made the innermost
    /// crossing. Returns `false` when no attached VM is active.
    fn write_active_chain(
        &self,
        out: &mut dyn Write,
        kind: FaultKind,
        chain: &[CallRecord],
    ) -> Result<bool, fmt::Error> {
        let Some(top) = chain.last() else {
            return Ok(false);
        };
        let Some(scripts) = self.scripts.try_read() else {
            return Ok(false);
        };
        let Some(Attached { vm, script }) = scripts.get(&top.vm) else {
            return Ok(false);
        };
        writeln!(out, "{} {}", kind.headline(), script.display_name())?;
        write_guest_backtrace(
            out,
            &**vm,
            script,
            chain.iter().rev(),
            &self.config,
        )?;
        Ok(true)
    }

    fn write_native_backtrace(&self, out: &mut dyn Write, context: NativeContext) -> fmt::Result {
        out.write_str("Native backtrace:\n")?;
        let options = CaptureOptions {
            max_frames: self.config.max_native_frames,
            skip_frames: 0,
            resolve_modules: self.config.resolve_native_modules,
        };
        let mut written = Ok(());
        walk(context, &*self.native_reader, options, |index, frame| {
            if written.is_ok() {
                written = write_native_frame(&mut *out, index, &frame);
            }
        });
        written
    }
}
