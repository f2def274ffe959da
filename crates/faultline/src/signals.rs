//! Crash and interrupt handlers.
//!
//! [`install`] points `SIGSEGV`, `SIGBUS`, `SIGILL`, `SIGFPE` and `SIGINT` at
//! one [`Faultline`]. A crash is reported and the default disposition
//! restored, so returning from the handler re-raises the fault and the process
//! dies as it would have. An interrupt is reported, then the previous `SIGINT`
//! handler is restored and the signal raised again.
//!
//! Handlers run on an alternate signal stack so a stack overflow can still be
//! reported. The alternate stack belongs to the installing thread.
//!
//! Only one registration can exist at a time; dropping it uninstalls.

use crate::{FaultThread, Faultline};
use faultline_capture::{NativeContext, validate_frame_pointers};
use parking_lot::Mutex;
use std::error::Error;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::{info, warn};

const FAULT_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];
const ALT_STACK_SIZE: usize = 64 * 1024;

static ACTIVE: AtomicPtr<Faultline> = AtomicPtr::new(ptr::null_mut());
static SCRIPT_THREAD: AtomicUsize = AtomicUsize::new(0);
static PREVIOUS_INTERRUPT: Mutex<Option<libc::sigaction>> = Mutex::new(None);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    AlreadyInstalled,
    Sigaction { signal: c_int, errno: i32 },
    Sigaltstack { errno: i32 },
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "fault handlers are already installed"),
            Self::Sigaction { signal, errno } => {
                write!(f, "sigaction({signal}) failed (errno {errno})")
            }
            Self::Sigaltstack { errno } => write!(f, "sigaltstack failed (errno {errno})"),
        }
    }
}

impl Error for SignalError {}

/// Installed handlers. Dropping restores the previous dispositions.
#[must_use = "the handlers are uninstalled as soon as the registration is dropped"]
pub struct SignalRegistration {
    previous: Vec<(c_int, libc::sigaction)>,
    alt_stack: Option<AltStack>,
}

struct AltStack {
    memory: Vec<u8>,
    previous: libc::stack_t,
    thread: usize,
}

impl AltStack {
    fn install() -> Result<Self, SignalError> {
        let mut memory = vec![0u8; ALT_STACK_SIZE.max(libc::SIGSTKSZ)];
        let stack = libc::stack_t {
            ss_sp: memory.as_mut_ptr().cast::<c_void>(),
            ss_flags: 0,
            ss_size: memory.len(),
        };
        let mut previous: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: `memory` is only freed after `previous` is restored.
        if unsafe { libc::sigaltstack(&stack, &mut previous) } != 0 {
            return Err(SignalError::Sigaltstack {
                errno: last_errno(),
            });
        }
        Ok(Self {
            memory,
            previous,
            thread: current_thread(),
        })
    }

    fn restore(self) {
        if current_thread() != self.thread {
            // The installing thread may still be using it.
            warn!("signal registration dropped on another thread, leaking alternate stack");
            std::mem::forget(self.memory);
            return;
        }
        // SAFETY: `previous` is what sigaltstack reported for this thread.
        if unsafe { libc::sigaltstack(&self.previous, ptr::null_mut()) } != 0 {
            warn!(errno = last_errno(), "failed to restore alternate signal stack");
            std::mem::forget(self.memory);
        }
    }
}

/// Routes crashes and interrupts to `faultline`. The calling thread is taken
/// as the one that runs scripts; crashes on other threads are reported
/// without a guest backtrace.
pub fn install(faultline: Arc<Faultline>) -> Result<SignalRegistration, SignalError> {
    let raw = Arc::into_raw(faultline).cast_mut();
    if ACTIVE
        .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // SAFETY: `raw` came from `Arc::into_raw` above and was not published.
        drop(unsafe { Arc::from_raw(raw) });
        return Err(SignalError::AlreadyInstalled);
    }
    SCRIPT_THREAD.store(current_thread(), Ordering::Release);
    if let Err(reason) = validate_frame_pointers() {
        warn!(%reason, "native backtraces will be incomplete");
    }

    let mut registration = SignalRegistration {
        previous: Vec::with_capacity(FAULT_SIGNALS.len() + 1),
        alt_stack: None,
    };
    registration.alt_stack = Some(AltStack::install()?);
    for signal in FAULT_SIGNALS {
        let previous = set_handler(signal, on_fault as *const () as usize)?;
        registration.previous.push((signal, previous));
    }
    let previous = set_handler(libc::SIGINT, on_interrupt as *const () as usize)?;
    registration.previous.push((libc::SIGINT, previous));
    *PREVIOUS_INTERRUPT.lock() = Some(previous);

    info!("installed crash and interrupt handlers");
    Ok(registration)
}

pub fn is_installed() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: `previous` is the action sigaction reported for `signal`.
            if unsafe { libc::sigaction(signal, &previous, ptr::null_mut()) } != 0 {
                warn!(signal, errno = last_errno(), "failed to restore signal handler");
            }
        }
        *PREVIOUS_INTERRUPT.lock() = None;
        if let Some(alt_stack) = self.alt_stack.take() {
            alt_stack.restore();
        }
        let raw = ACTIVE.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: only `install` publishes into ACTIVE, always from `Arc::into_raw`.
            drop(unsafe { Arc::from_raw(raw) });
        }
        info!("uninstalled crash and interrupt handlers");
    }
}

fn current_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_handler(signal: c_int, handler: usize) -> Result<libc::sigaction, SignalError> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, &action, &mut previous) != 0 {
            return Err(SignalError::Sigaction {
                signal,
                errno: last_errno(),
            });
        }
        Ok(previous)
    }
}

unsafe fn reset_default(signal: c_int) {
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
    }
}

fn active() -> Option<&'static Faultline> {
    let raw = ACTIVE.load(Ordering::Acquire);
    // SAFETY: a published pointer stays valid until the registration is dropped.
    unsafe { raw.as_ref() }
}

extern "C" fn on_fault(signal: c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    if let Some(faultline) = active() {
        let context = unsafe { NativeContext::from_ucontext(ucontext) }.ok();
        let thread = if current_thread() == SCRIPT_THREAD.load(Ordering::Acquire) {
            FaultThread::Scripts
        } else {
            FaultThread::Other
        };
        faultline.report_native_fault_on(context, thread);
    }
    unsafe { reset_default(signal) };
}

extern "C" fn on_interrupt(signal: c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    if let Some(faultline) = active() {
        let context = unsafe { NativeContext::from_ucontext(ucontext) }.ok();
        faultline.report_interrupt(context);
    }
    let previous = PREVIOUS_INTERRUPT.try_lock().and_then(|previous| *previous);
    unsafe {
        match previous {
            Some(previous) => {
                libc::sigaction(signal, &previous, ptr::null_mut());
            }
            None => reset_default(signal),
        }
        libc::raise(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::testing::RecordingSink;

    static INSTALLS: Mutex<()> = Mutex::new(());

    #[test]
    fn second_install_is_rejected_until_dropped() {
        let _serial = INSTALLS.lock();
        let faultline = Arc::new(Faultline::new(Config::default(), RecordingSink::default()));
        let registration = install(Arc::clone(&faultline)).unwrap();
        assert!(is_installed());
        assert!(matches!(
            install(Arc::clone(&faultline)),
            Err(SignalError::AlreadyInstalled)
        ));
        assert_eq!(Arc::strong_count(&faultline), 2);
        assert_eq!(current_thread(), SCRIPT_THREAD.load(Ordering::Acquire));

        drop(registration);
        assert!(!is_installed());
        assert_eq!(Arc::strong_count(&faultline), 1);

        let again = install(Arc::clone(&faultline)).unwrap();
        drop(again);
        assert!(!is_installed());
    }

    fn current_alt_stack() -> libc::stack_t {
        let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
        current
    }

    #[test]
    fn handlers_get_an_alternate_stack() {
        let _serial = INSTALLS.lock();
        let before = current_alt_stack();
        let faultline = Arc::new(Faultline::new(Config::default(), RecordingSink::default()));
        let registration = install(faultline).unwrap();

        let during = current_alt_stack();
        assert_eq!(during.ss_flags & libc::SS_DISABLE, 0);
        assert_eq!(during.ss_size, ALT_STACK_SIZE.max(libc::SIGSTKSZ));

        drop(registration);
        let after = current_alt_stack();
        assert_eq!(after.ss_sp, before.ss_sp);
        assert_eq!(after.ss_flags, before.ss_flags);
    }
}
