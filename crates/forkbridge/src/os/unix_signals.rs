//! Signal handling for unix

use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Error;

/// Turn a raw signal number into a [`Signal`].
pub fn signal_from_raw(signum: i32) -> Result<Signal, Error> {
    Signal::try_from(signum)
        .map_err(|_| Error::illegal_argument(format!("{signum} is not a valid signal number")))
}

/// Raise `signal` against the current process.
///
/// For fatal signals with default disposition this does not return.
pub fn raise_signal(signal: Signal) -> Result<(), Error> {
    raise(signal).map_err(|errno| Error::signal(format!("raise({signal}) failed: {errno}")))
}

/// Stop the current process until someone sends `SIGCONT`.
pub fn stop_self() -> Result<(), Error> {
    raise_signal(Signal::SIGSTOP)
}

/// Temporarily replaces the disposition of one signal.
///
/// The previous disposition is restored either explicitly with
/// [`DispositionGuard::restore`] or, at the latest, when the guard is dropped.
#[derive(Debug)]
pub struct DispositionGuard {
    signal: Signal,
    old: Option<SigAction>,
}

impl DispositionGuard {
    /// Install `handler` for `signal`, remembering what was there before.
    ///
    /// # Safety
    /// Same as [`nix::sys::signal::sigaction`]: `handler` must be async-signal-safe.
    pub unsafe fn install(signal: Signal, handler: SigHandler) -> Result<Self, Error> {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        let old = unsafe { sigaction(signal, &action) }
            .map_err(|errno| Error::os(format!("Failed to swap signal handler for {signal}"), errno))?;
        Ok(Self {
            signal,
            old: Some(old),
        })
    }

    /// Force the default disposition for `signal`.
    pub fn reset_to_default(signal: Signal) -> Result<Self, Error> {
        unsafe { Self::install(signal, SigHandler::SigDfl) }
    }

    /// The signal this guard is responsible for.
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Put the previous disposition back.
    pub fn restore(mut self) -> Result<(), Error> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<(), Error> {
        let Some(old) = self.old.take() else {
            return Ok(());
        };
        unsafe { sigaction(self.signal, &old) }.map_err(|errno| {
            Error::os(
                format!("Failed to restore signal handler for {}", self.signal),
                errno,
            )
        })?;
        Ok(())
    }
}

impl Drop for DispositionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            log::error!("{err}");
        }
    }
}
