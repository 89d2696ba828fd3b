//! The signal handler shim.
//!
//! Protection faults arrive as `SIGSEGV` (or `SIGBUS` on some systems). Our handler asks the
//! global registry; anything it declines is forwarded to the action installed before us, such as
//! the standard library's stack overflow reporting.
use core::ffi::{c_int, c_void};
use std::sync::OnceLock;

use crate::{Error, ErrorKind, FaultRegistry};

static PREVIOUS: OnceLock<Previous> = OnceLock::new();
static INSTALLED: OnceLock<Result<(), c_int>> = OnceLock::new();

struct Previous {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

type Sigaction = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);
type Sighandler = extern "C" fn(c_int);

/// Install the process-wide fault handler.
///
/// Only the first call does anything, later calls report its outcome. Arenas tracked in the
/// global registry call this on creation.
pub fn install() -> Result<(), Error> {
    match INSTALLED.get_or_init(|| unsafe { install_handlers() }) {
        Ok(()) => Ok(()),
        Err(errno) => Err(Error::os(
            ErrorKind::NotSupported,
            "failed to install the fault handler",
            *errno,
        )),
    }
}

unsafe fn install_handlers() -> Result<(), c_int> {
    // Record the previous actions before ours can observe a fault.
    let previous = Previous {
        segv: current_action(libc::SIGSEGV)?,
        bus: current_action(libc::SIGBUS)?,
    };
    let _ = PREVIOUS.set(previous);

    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = on_fault as Sigaction as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);

    for signum in [libc::SIGSEGV, libc::SIGBUS] {
        if -1 == libc::sigaction(signum, &action, core::ptr::null_mut()) {
            return Err(last_errno());
        }
    }

    Ok(())
}

unsafe fn current_action(signum: c_int) -> Result<libc::sigaction, c_int> {
    let mut action: libc::sigaction = core::mem::zeroed();
    if -1 == libc::sigaction(signum, core::ptr::null(), &mut action) {
        return Err(last_errno());
    }

    Ok(action)
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

extern "C" fn on_fault(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let addr = unsafe { fault_address(info) };

    if let Some(registry) = FaultRegistry::installed() {
        if registry.handle_fault(addr) {
            return;
        }
    }

    unsafe { forward(signum, info, context) }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

unsafe fn forward(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let previous = PREVIOUS.get().map(|previous| match signum {
        libc::SIGBUS => &previous.bus,
        _ => &previous.segv,
    });

    match previous {
        Some(action)
            if action.sa_sigaction != libc::SIG_DFL && action.sa_sigaction != libc::SIG_IGN =>
        {
            if action.sa_flags & libc::SA_SIGINFO != 0 {
                let handler: Sigaction = core::mem::transmute(action.sa_sigaction);
                handler(signum, info, context);
            } else {
                let handler: Sighandler = core::mem::transmute(action.sa_sigaction);
                handler(signum);
            }
        }
        _ => {
            // Returning re-executes the faulting access, which now terminates the process.
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signum, &action, core::ptr::null_mut());
        }
    }
}
