//! Interrupt handling.
//!
//! The first Ctrl-C also reaches running child processes, which ought to
//! fail their tasks; the scheduler notices the flag, stops dispatching, and
//! still records the results that arrive.  A second Ctrl-C kills us.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// The flag Ctrl-C sets, for the scheduler to poll.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

#[cfg(unix)]
fn sigint_action(handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
    sigint_action(libc::SIG_DFL);
}

#[cfg(unix)]
pub fn register_sigint() {
    sigint_action(sigint_handler as libc::sighandler_t);
}

#[cfg(windows)]
unsafe extern "system" fn ctrl_handler(ctrl_type: u32) -> windows_sys::Win32::Foundation::BOOL {
    use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, CTRL_C_EVENT};
    if ctrl_type == CTRL_C_EVENT || ctrl_type == CTRL_BREAK_EVENT {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second press: fall through to the default handler.
            return 0;
        }
        return 1;
    }
    0
}

#[cfg(windows)]
pub fn register_sigint() {
    // Safety: installing a console control handler.
    unsafe {
        windows_sys::Win32::System::Console::SetConsoleCtrlHandler(Some(ctrl_handler), 1);
    }
}

#[cfg(not(any(unix, windows)))]
pub fn register_sigint() {}
