//! Signal plumbing for the simulation: the critical-section guard
//! that keeps the tick and listing handlers out of scheduler state,
//! handler installation, and the periodic virtual-time timer.
//!
//! SIGVTALRM carries the tick, SIGABRT the listing request. Both are
//! delivered asynchronously while task code runs and must stay masked
//! whenever scheduler state is being mutated.

use std::io;
use std::time::Duration;

use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

/// Scoped mask of every signal that could re-enter the scheduler.
///
/// Acquisition blocks all signals and remembers the prior mask.
/// `release` restores that mask with the tick and listing signals
/// cleared: the saved mask may have been captured inside a signal
/// handler (where the kernel blocks the delivered signal), and a task
/// returning to its own code must keep taking ticks.
///
/// There is deliberately no `Drop`: an operation that context-switches
/// away abandons its frame without unwinding, and the resumed side of
/// a saved context releases the guard it finds in the restored frame.
pub struct SignalGuard {
    saved: SigSet,
}

impl SignalGuard {
    /// Block every signal, remembering the prior mask. A mask failure
    /// is logged and the guard proceeds best-effort; it is never
    /// fatal by itself.
    pub fn block() -> SignalGuard {
        let mut saved = SigSet::empty();
        if let Err(err) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut saved))
        {
            crate::log_warn!("failed to block scheduler signals: {}", err);
        }
        SignalGuard { saved }
    }

    /// Restore the mask saved at acquisition, minus the tick and
    /// listing signals.
    pub fn release(self) {
        let mut restored = self.saved;
        restored.remove(Signal::SIGVTALRM);
        restored.remove(Signal::SIGABRT);
        if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&restored), None) {
            crate::log_warn!("failed to restore signal mask: {}", err);
        }
    }
}

/// The calling thread's current signal mask, for restoration after
/// the simulation tears down.
pub fn current_mask() -> SigSet {
    let mut mask = SigSet::empty();
    // With no set to apply, sigprocmask only reports the current mask.
    if let Err(err) = sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut mask)) {
        crate::log_warn!("failed to read signal mask: {}", err);
    }
    mask
}

/// Reinstate a mask captured with `current_mask`.
pub fn set_mask(mask: &SigSet) {
    if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(mask), None) {
        crate::log_warn!("failed to restore driver signal mask: {}", err);
    }
}

/// Install the tick and listing handlers. Each handler runs with both
/// signals masked so neither can interrupt the other mid-mutation.
/// On failure the original disposition of any signal already touched
/// is put back.
pub fn install_handlers(
    tick: extern "C" fn(libc::c_int),
    listing: extern "C" fn(libc::c_int),
) -> nix::Result<()> {
    let mut handler_mask = SigSet::empty();
    handler_mask.add(Signal::SIGVTALRM);
    handler_mask.add(Signal::SIGABRT);

    let tick_action = SigAction::new(SigHandler::Handler(tick), SaFlags::SA_RESTART, handler_mask);
    let old_tick = unsafe { sigaction(Signal::SIGVTALRM, &tick_action)? };

    let listing_action =
        SigAction::new(SigHandler::Handler(listing), SaFlags::SA_RESTART, handler_mask);
    if let Err(err) = unsafe { sigaction(Signal::SIGABRT, &listing_action) } {
        if let Err(undo) = unsafe { sigaction(Signal::SIGVTALRM, &old_tick) } {
            crate::log_warn!("failed to undo tick handler installation: {}", undo);
        }
        return Err(err);
    }
    Ok(())
}

/// Arm the periodic virtual-time timer. Each expiry delivers one
/// SIGVTALRM, i.e. one tick, and the timer re-arms indefinitely.
pub fn arm_timer(period: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: period.as_secs() as libc::time_t,
        tv_usec: period.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Stop the virtual-time timer. Handlers stay installed; they do
/// nothing once the scheduler state is gone.
pub fn disarm_timer() {
    let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let timer = libc::itimerval {
        it_interval: zero,
        it_value: zero,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) };
    if rc < 0 {
        crate::log_warn!(
            "failed to disarm virtual timer: {}",
            io::Error::last_os_error()
        );
    }
}
