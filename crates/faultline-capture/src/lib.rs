//! Native frame-pointer stack walking.
//!
//! Walks the caller chain `[fp] -> caller fp`, `[fp + word] -> return address`
//! from a captured context. Reads go through [`MemoryReader`], so a broken chain
//! ends the walk instead of faulting again. The visitor API does not allocate,
//! which keeps it usable from a signal handler.

use faultline_types::{NativeFrame, WalkEnd};
use std::error::Error;
use std::ffi::CStr;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

const WORD: u64 = std::mem::size_of::<usize>() as u64;

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub max_frames: NonZeroUsize,
    pub skip_frames: usize,
    /// Name each frame's module and symbol with `dladdr`. `dladdr` takes the
    /// dynamic loader's lock, so a walk from a fault raised inside `dlopen`
    /// or `dlclose` deadlocks unless this is off.
    pub resolve_modules: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: NonZeroUsize::new(256)
                .expect("invariant violated: default max_frames must be non-zero"),
            skip_frames: 0,
            resolve_modules: true,
        }
    }
}

#[derive(Debug)]
pub enum CaptureError {
    UnsupportedPlatform { target_os: &'static str },
    Unreadable { address: u64 },
    NullContext,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedPlatform { target_os } => write!(
                f,
                "unsupported platform for native stack walking: {target_os}"
            ),
            Self::Unreadable { address } => write!(f, "memory at 0x{address:x} is not readable"),
            Self::NullContext => write!(f, "signal context pointer is null"),
        }
    }
}

impl Error for CaptureError {}

/// Register state the walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeContext {
    pub ip: u64,
    pub fp: u64,
}

impl NativeContext {
    /// Context of the caller of this function.
    #[inline(never)]
    pub fn current() -> Result<Self, CaptureError> {
        let fp = platform::read_frame_pointer()?;
        Ok(Self {
            ip: Self::current as usize as u64,
            fp,
        })
    }

    /// Extracts the faulting context from the third argument of an `SA_SIGINFO` handler.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or point to the `ucontext_t` the kernel passed to
    /// the handler that is currently running.
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Result<Self, CaptureError> {
        if ucontext.is_null() {
            return Err(CaptureError::NullContext);
        }
        unsafe { platform::context_from_ucontext(ucontext) }
    }
}

/// Bounds-checked access to native memory.
pub trait MemoryReader {
    fn read_word(&self, address: u64) -> Result<u64, CaptureError>;
}

/// Reads the current process's memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemoryReader for ProcessMemory {
    fn read_word(&self, address: u64) -> Result<u64, CaptureError> {
        if address == 0 || address % WORD != 0 {
            return Err(CaptureError::Unreadable { address });
        }
        platform::read_word(address)
    }
}

/// A frame as seen during the walk; module names borrow loader memory.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub ip: u64,
    pub fp: u64,
    pub module_path: Option<&'a str>,
    pub symbol: Option<&'a str>,
    pub symbol_offset: Option<u64>,
}

impl FrameRef<'_> {
    pub fn to_owned_frame(&self) -> NativeFrame {
        NativeFrame {
            ip: self.ip,
            fp: self.fp,
            module_path: self.module_path.map(str::to_owned),
            symbol: self.symbol.map(str::to_owned),
            symbol_offset: self.symbol_offset,
        }
    }
}

/// Owning module and nearest symbol of a code address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleInfo<'a> {
    pub base: u64,
    pub path: Option<&'a str>,
    pub symbol: Option<&'a str>,
    pub symbol_offset: Option<u64>,
}

/// Resolves `address` against the loaded modules. Never fails; unknown parts are `None`.
pub fn module_info_for_addr(address: u64) -> ModuleInfo<'static> {
    platform::module_info(address).unwrap_or_default()
}

/// Path of the module containing `address`, or an empty string.
pub fn module_path_for_addr(address: u64) -> &'static str {
    module_info_for_addr(address).path.unwrap_or("")
}

/// Walks from `context`, calling `visit` for each frame innermost first.
///
/// The first frame is the context's own instruction pointer; every further
/// frame is a return address. Stops at the first link that fails validation.
pub fn walk<R, F>(context: NativeContext, reader: &R, options: CaptureOptions, mut visit: F) -> WalkEnd
where
    R: MemoryReader + ?Sized,
    F: FnMut(usize, FrameRef<'static>),
{
    let mut emitted = 0usize;
    let mut skip_remaining = options.skip_frames;
    let mut emit = |ip: u64, fp: u64, emitted: &mut usize| -> bool {
        if skip_remaining > 0 {
            skip_remaining -= 1;
            return true;
        }
        if *emitted >= options.max_frames.get() {
            return false;
        }
        let module = if options.resolve_modules {
            module_info_for_addr(ip)
        } else {
            ModuleInfo::default()
        };
        visit(
            *emitted,
            FrameRef {
                ip,
                fp,
                module_path: module.path,
                symbol: module.symbol,
                symbol_offset: module.symbol_offset,
            },
        );
        *emitted += 1;
        true
    };

    if context.ip != 0 && !emit(context.ip, context.fp, &mut emitted) {
        return WalkEnd::DepthLimit;
    }

    let mut frame_ptr = context.fp;
    loop {
        if frame_ptr == 0 {
            return WalkEnd::Complete;
        }
        if frame_ptr % WORD != 0 {
            return WalkEnd::Corrupted { address: frame_ptr };
        }

        let Ok(next_frame_ptr) = reader.read_word(frame_ptr) else {
            return WalkEnd::Corrupted { address: frame_ptr };
        };
        let Ok(return_ip) = reader.read_word(frame_ptr + WORD) else {
            return WalkEnd::Corrupted {
                address: frame_ptr + WORD,
            };
        };

        if return_ip == 0 {
            return WalkEnd::Complete;
        }
        if !emit(return_ip, next_frame_ptr, &mut emitted) {
            return WalkEnd::DepthLimit;
        }

        if next_frame_ptr == 0 {
            return WalkEnd::Complete;
        }
        if next_frame_ptr <= frame_ptr {
            return WalkEnd::Corrupted {
                address: next_frame_ptr,
            };
        }
        frame_ptr = next_frame_ptr;
    }
}

/// Collects the frames [`walk`] would visit.
pub fn collect<R>(context: NativeContext, reader: &R, options: CaptureOptions) -> (Vec<NativeFrame>, WalkEnd)
where
    R: MemoryReader + ?Sized,
{
    let mut frames = Vec::new();
    let end = walk(context, reader, options, |_, frame| {
        frames.push(frame.to_owned_frame())
    });
    (frames, end)
}

static FRAME_POINTER_VALIDATION: OnceLock<Result<(), String>> = OnceLock::new();

/// Checks that this binary keeps frame pointers; without them native
/// backtraces stop after the first frame. The answer is computed once.
pub fn validate_frame_pointers() -> Result<(), String> {
    FRAME_POINTER_VALIDATION
        .get_or_init(validate_frame_pointer_chain)
        .clone()
}

fn validate_frame_pointer_chain() -> Result<(), String> {
    #[inline(never)]
    fn layer0() -> Result<usize, String> {
        layer1()
    }
    #[inline(never)]
    fn layer1() -> Result<usize, String> {
        layer2()
    }
    #[inline(never)]
    fn layer2() -> Result<usize, String> {
        layer3()
    }
    #[inline(never)]
    fn layer3() -> Result<usize, String> {
        let context = NativeContext::current().map_err(|err| err.to_string())?;
        if context.fp == 0 {
            return Err("current frame pointer is null".to_string());
        }
        let options = CaptureOptions {
            max_frames: NonZeroUsize::new(4096)
                .expect("invariant violated: validation bound must be non-zero"),
            skip_frames: 0,
            resolve_modules: false,
        };
        let mut depth = 0usize;
        match walk(context, &ProcessMemory, options, |_, _| depth += 1) {
            WalkEnd::Corrupted { address } => Err(format!(
                "frame pointer chain broke at 0x{address:x} after {depth} frames"
            )),
            _ => Ok(depth),
        }
    }

    const MIN_DEPTH: usize = 5;
    let depth = layer0()?;
    if depth < MIN_DEPTH {
        return Err(format!(
            "frame pointer chain too shallow: got {depth}, need at least {MIN_DEPTH}. \
recompile with -C force-frame-pointers=yes"
        ));
    }
    Ok(())
}

fn cstr_field<'a>(ptr: *const libc::c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .filter(|s| !s.is_empty())
}

#[cfg(unix)]
mod platform {
    use super::{CaptureError, ModuleInfo, NativeContext, WORD, cstr_field};
    use std::ffi::c_void;

    #[cfg(target_arch = "x86_64")]
    pub fn read_frame_pointer() -> Result<u64, CaptureError> {
        let frame_ptr: usize;
        unsafe {
            core::arch::asm!(
                "mov {}, rbp",
                out(reg) frame_ptr,
                options(nomem, nostack, preserves_flags)
            );
        }
        Ok(frame_ptr as u64)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn read_frame_pointer() -> Result<u64, CaptureError> {
        let frame_ptr: usize;
        unsafe {
            core::arch::asm!(
                "mov {}, x29",
                out(reg) frame_ptr,
                options(nomem, nostack, preserves_flags)
            );
        }
        Ok(frame_ptr as u64)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn read_frame_pointer() -> Result<u64, CaptureError> {
        Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub unsafe fn context_from_ucontext(
        ucontext: *const c_void,
    ) -> Result<NativeContext, CaptureError> {
        let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
        let gregs = &uc.uc_mcontext.gregs;
        Ok(NativeContext {
            ip: gregs[libc::REG_RIP as usize] as u64,
            fp: gregs[libc::REG_RBP as usize] as u64,
        })
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    pub unsafe fn context_from_ucontext(
        ucontext: *const c_void,
    ) -> Result<NativeContext, CaptureError> {
        let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
        Ok(NativeContext {
            ip: uc.uc_mcontext.pc,
            fp: uc.uc_mcontext.regs[29],
        })
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    pub unsafe fn context_from_ucontext(
        _ucontext: *const c_void,
    ) -> Result<NativeContext, CaptureError> {
        Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }

    // process_vm_readv reports EFAULT for unmapped pages instead of raising SIGSEGV.
    #[cfg(target_os = "linux")]
    pub fn read_word(address: u64) -> Result<u64, CaptureError> {
        let mut value = 0u64;
        let local = libc::iovec {
            iov_base: (&mut value as *mut u64).cast::<c_void>(),
            iov_len: WORD as usize,
        };
        let remote = libc::iovec {
            iov_base: address as usize as *mut c_void,
            iov_len: WORD as usize,
        };
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read != WORD as isize {
            return Err(CaptureError::Unreadable { address });
        }
        Ok(value)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read_word(address: u64) -> Result<u64, CaptureError> {
        Ok(unsafe { *(address as usize as *const usize) } as u64)
    }

    pub fn module_info(address: u64) -> Option<ModuleInfo<'static>> {
        if address == 0 {
            return None;
        }
        let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
        let ok = unsafe { libc::dladdr(address as usize as *const c_void, info.as_mut_ptr()) };
        if ok == 0 {
            return None;
        }

        let info = unsafe { info.assume_init() };
        let base = info.dli_fbase as usize as u64;
        let symbol_offset = if info.dli_saddr.is_null() {
            None
        } else {
            address.checked_sub(info.dli_saddr as usize as u64)
        };
        Some(ModuleInfo {
            base,
            path: cstr_field(info.dli_fname),
            symbol: cstr_field(info.dli_sname),
            symbol_offset,
        })
    }
}

#[cfg(not(unix))]
mod platform {
    use super::{CaptureError, ModuleInfo, NativeContext};
    use std::ffi::c_void;

    pub fn read_frame_pointer() -> Result<u64, CaptureError> {
        Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }

    pub unsafe fn context_from_ucontext(
        _ucontext: *const c_void,
    ) -> Result<NativeContext, CaptureError> {
        Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }

    pub fn read_word(address: u64) -> Result<u64, CaptureError> {
        Err(CaptureError::Unreadable { address })
    }

    pub fn module_info(_address: u64) -> Option<ModuleInfo<'static>> {
        None
    }
}
