//! Operating System specific abstractions
//!

use std::os::fd::RawFd;

use libc::pid_t;
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::Error;

pub mod unix_signals;

/// Child Process Handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildHandle {
    /// The process id
    pub pid: pid_t,
}

impl ChildHandle {
    /// Block until the child changes state and return the raw wait status.
    ///
    /// With `report_stops` the wait also returns when the child was stopped
    /// (`WUNTRACED`), which is how a persistent child reports a finished run.
    pub fn wait_status(&self, report_stops: bool) -> Result<i32, Error> {
        let flags = if report_stops { libc::WUNTRACED } else { 0 };
        let mut status = 0;
        loop {
            let res = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if res >= 0 {
                return Ok(status);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    return Err(Error::os(format!("waitpid({}) failed", self.pid), errno));
                }
            }
        }
    }

    /// Wake a stopped child with `SIGCONT`.
    pub fn resume(&self) -> Result<(), Error> {
        self.send(Signal::SIGCONT)
    }

    /// Send `signal` to the child.
    pub fn send(&self, signal: Signal) -> Result<(), Error> {
        kill(Pid::from_raw(self.pid), signal).map_err(|errno| {
            Error::signal(format!("could not send {signal} to child {}: {errno}", self.pid))
        })
    }
}

/// The `ForkResult` (result of a fork)
#[derive(Debug)]
pub enum ForkResult {
    /// The fork finished, we are the parent process.
    /// The child has the handle `ChildHandle`.
    Parent(ChildHandle),
    /// The fork finished, we are the child process.
    Child,
}

/// Unix has forks.
/// # Safety
/// A Normal fork. Runs on in two processes. Should be memory safe in general,
/// as long as the caller is single-threaded.
pub unsafe fn fork() -> Result<ForkResult, Error> {
    match unsafe { libc::fork() } {
        pid if pid > 0 => Ok(ForkResult::Parent(ChildHandle { pid })),
        pid if pid < 0 => Err(Error::last_os_error("fork failed")),
        _ => Ok(ForkResult::Child),
    }
}

/// Close `fd`, only logging if that fails.
pub fn close_quietly(fd: RawFd) {
    if let Err(errno) = nix::unistd::close(fd) {
        log::warn!("Failed to close descriptor {fd}: {errno}");
    }
}
