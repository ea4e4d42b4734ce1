//! Deferred signal handling.
//!
//! Handlers only bump a per-signal counter. The scheduler looks at the
//! counters whenever it is safe to touch the job table, which is after every
//! wait that a signal can interrupt. Handlers are installed without
//! `SA_RESTART` so that `poll` and `waitpid` return early.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::Result;

const SLOTS: usize = 65;

#[allow(clippy::declare_interior_mutable_const)]
const CLEAR: AtomicU32 = AtomicU32::new(0);
static GOT: [AtomicU32; SLOTS] = [CLEAR; SLOTS];

/// Signals that end the build.
pub const TERMINATING: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// Job-control signals, relayed to the jobs' process groups only.
pub const JOB_CONTROL: [Signal; 4] = [
    Signal::SIGTSTP,
    Signal::SIGTTOU,
    Signal::SIGTTIN,
    Signal::SIGWINCH,
];

extern "C" fn catch(signo: c_int) {
    if let Some(slot) = GOT.get(signo as usize) {
        slot.fetch_add(1, Ordering::SeqCst);
    }
}

/// Installs the catcher for the terminating signals and, unless running in
/// compat mode, for job control and `SIGCHLD`. Signals that were ignored
/// when we started stay ignored.
pub fn install(compat: bool) -> Result<()> {
    if !compat {
        let chld = SigAction::new(
            SigHandler::Handler(catch),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics.
        unsafe { signal::sigaction(Signal::SIGCHLD, &chld) }?;
    }
    install_for(&TERMINATING)?;
    if !compat {
        install_for(&JOB_CONTROL)?;
    }
    Ok(())
}

pub(crate) fn install_for(signals: &[Signal]) -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(catch), SaFlags::empty(), SigSet::empty());
    for &sig in signals {
        // SAFETY: the handler only touches atomics.
        let old = unsafe { signal::sigaction(sig, &action) }?;
        if old.handler() == SigHandler::SigIgn {
            unsafe { signal::sigaction(sig, &old) }?;
            debug!("{} stays ignored", sig);
        }
    }
    Ok(())
}

/// Clears and reports whether `sig` arrived since the last call.
pub fn take(sig: Signal) -> bool {
    GOT[sig as usize].swap(0, Ordering::SeqCst) > 0
}

/// Drains every relayed signal, terminating ones first.
pub fn take_pending() -> Vec<Signal> {
    TERMINATING
        .iter()
        .chain(JOB_CONTROL.iter())
        .copied()
        .filter(|&sig| take(sig))
        .collect()
}

/// Restores the default action for `sig` and sends it to ourselves, so the
/// process ends the way it would have without a handler.
pub fn die_by(sig: Signal) -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing the default disposition.
    unsafe { signal::sigaction(sig, &default) }?;
    let mut mask = SigSet::empty();
    mask.add(sig);
    mask.thread_unblock()?;
    signal::raise(sig)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_clears() {
        install_for(&[Signal::SIGWINCH]).unwrap();
        signal::raise(Signal::SIGWINCH).unwrap();
        assert!(take(Signal::SIGWINCH));
        assert!(!take(Signal::SIGWINCH));
    }
}
