//! The target side of the AFL forkserver protocol.
//!
//! The fuzzer talks to us over two descriptors. We announce ourselves with a
//! 4 byte hello on the reply descriptor, then for every run the fuzzer writes
//! a 4 byte kill notice, and we answer with the pid of the run's child and,
//! once it is done, its raw wait status. Every frame is a native endian `u32`.

use core::sync::atomic::{AtomicBool, Ordering};
use std::os::fd::{BorrowedFd, RawFd};

use nix::{
    errno::Errno,
    sys::signal::{SigHandler, Signal},
};

use crate::{
    config::BridgeConfig,
    os::{close_quietly, fork, unix_signals::DispositionGuard, ChildHandle, ForkResult},
    Error,
};

/// The descriptor pair shared with the fuzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkserverChannel {
    control: RawFd,
    status: RawFd,
}

impl ForkserverChannel {
    /// A channel on explicit descriptors: kill notices are read from
    /// `control`, everything else is written to `status`.
    #[must_use]
    pub const fn new(control: RawFd, status: RawFd) -> Self {
        Self { control, status }
    }

    /// The channel on the descriptors named by `config`
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.control_fd(), config.status_fd())
    }

    /// The descriptor the fuzzer writes to
    #[must_use]
    pub const fn control_fd(&self) -> RawFd {
        self.control
    }

    /// The descriptor the fuzzer reads from
    #[must_use]
    pub const fn status_fd(&self) -> RawFd {
        self.status
    }

    fn write_frame(&self, message: &[u8]) -> Result<(), Error> {
        // SAFETY: the descriptor stays open until `close` consumes the channel.
        let fd = unsafe { BorrowedFd::borrow_raw(self.status) };
        let bytes_written = nix::unistd::write(fd, message)
            .map_err(|errno| Error::os("Could not write to the fuzzer", errno))?;
        if bytes_written != message.len() {
            return Err(Error::protocol(format!(
                "Could not write to the fuzzer. Expected {} bytes, wrote {bytes_written} bytes",
                message.len()
            )));
        }
        Ok(())
    }

    /// Write one frame to the fuzzer.
    pub fn write_u32(&self, message: u32) -> Result<(), Error> {
        self.write_frame(&message.to_ne_bytes())
    }

    /// Read one frame from the fuzzer. A closed pipe is a short read.
    pub fn read_u32(&self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        let bytes_read = nix::unistd::read(self.control, &mut buf)
            .map_err(|errno| Error::os("Could not read from the fuzzer", errno))?;
        if bytes_read != buf.len() {
            return Err(Error::protocol(format!(
                "Could not read from the fuzzer. Expected {} bytes, got {bytes_read} bytes",
                buf.len()
            )));
        }
        Ok(u32::from_ne_bytes(buf))
    }

    /// Say hello. Returns `false` if nobody listens on the reply descriptor.
    pub fn probe(&self) -> Result<bool, Error> {
        match self.write_frame(&[0u8; 4]) {
            Ok(()) => Ok(true),
            Err(Error::Os(_, Errno::EBADF, _)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Close both descriptors. Children do not talk to the fuzzer.
    pub fn close(self) {
        close_quietly(self.control);
        close_quietly(self.status);
    }
}

/// Where the supervisor is in its loop, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing happened yet
    NotStarted,
    /// Looking for a fuzzer on the reply descriptor
    Probing,
    /// Waiting for the fuzzer to request the next run
    ForkedParent,
    /// A child is executing a run
    ChildRunning,
    /// A persistent child finished a run and waits to be resumed
    ChildStoppedPersistent,
    /// The loop is over
    Terminated,
}

/// Parent to handle all logics with forkserver children
pub trait ForkserverParent {
    /// Conduct initializing routine before fuzzing loop.
    ///
    /// Usually, several signal handlers are registered in this function.
    fn pre_fuzzing(&mut self) -> Result<(), Error>;

    /// Provide a child for the next run.
    ///
    /// If the fuzzer has killed the previous child, `was_killed` is `true`.
    /// In persistent mode, a stopped child may be resumed instead of forking.
    fn spawn_child(&mut self, was_killed: bool) -> Result<ForkResult, Error>;

    /// Wait until the child has done its part and return its raw wait status.
    fn handle_child_requests(&mut self) -> Result<i32, Error>;

    /// Kill whatever child is still around. Called before the supervisor gives up.
    fn terminate(&mut self) -> Result<(), Error>;
}

/// Whether the forkserver loop is going to stop soon.
///
/// This will be set to true if the fuzzer sends SIGTERM.
static STOP_SOON: AtomicBool = AtomicBool::new(false);

extern "C" fn std_handle_sigterm(_signal: libc::c_int) {
    STOP_SOON.store(true, Ordering::Relaxed);
}

fn stop_requested() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

/// Forkserver parent that can handle both non-persistent and persistent mode
#[derive(Debug, Default)]
pub struct MaybePersistentForkserverParent {
    persistent: bool,
    last_child: Option<ChildHandle>,
    /// Only set in persistent mode, while the last child is stopped rather than dead
    child_stopped: bool,
    sigchld: Option<DispositionGuard>,
    sigterm: Option<DispositionGuard>,
}

impl MaybePersistentForkserverParent {
    /// Create a new forkserver parent.
    #[must_use]
    pub fn new() -> Self {
        MaybePersistentForkserverParent::default()
    }

    /// Expect children to stop themselves after each run, and resume them.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Whether children are resumed rather than forked anew
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Whether the last child is stopped and waits for `SIGCONT`
    #[must_use]
    pub fn child_stopped(&self) -> bool {
        self.child_stopped
    }

    fn restore_dispositions(&mut self) -> Result<(), Error> {
        if let Some(guard) = self.sigchld.take() {
            guard.restore().inspect_err(|_| {
                log::error!("Fail to restore signal handler for SIGCHLD.");
            })?;
        }
        if let Some(guard) = self.sigterm.take() {
            guard.restore().inspect_err(|_| {
                log::error!("Fail to restore signal handler for SIGTERM.");
            })?;
        }
        Ok(())
    }
}

impl ForkserverParent for MaybePersistentForkserverParent {
    fn pre_fuzzing(&mut self) -> Result<(), Error> {
        STOP_SOON.store(false, Ordering::Relaxed);
        self.sigchld = Some(
            DispositionGuard::reset_to_default(Signal::SIGCHLD).inspect_err(|_| {
                log::error!("Fail to swap signal handler for SIGCHLD.");
            })?,
        );
        // SAFETY: the handler only stores to an atomic.
        self.sigterm = Some(
            unsafe {
                DispositionGuard::install(Signal::SIGTERM, SigHandler::Handler(std_handle_sigterm))
            }
            .inspect_err(|_| {
                log::error!("Fail to swap signal handler for SIGTERM.");
            })?,
        );
        Ok(())
    }

    fn spawn_child(&mut self, was_killed: bool) -> Result<ForkResult, Error> {
        if stop_requested() {
            self.terminate()?;
            return Err(Error::shutting_down());
        }

        // If we stopped the child in persistent mode, but the fuzzer already
        // killed it, write off the old process.
        if self.child_stopped && was_killed {
            self.child_stopped = false;
            if let Some(child) = self.last_child.take() {
                child.wait_status(false).inspect_err(|_| {
                    log::error!("Failed to reap the killed child {}", child.pid);
                })?;
                log::debug!("Reaped child {} killed by the fuzzer", child.pid);
            }
        }

        if self.child_stopped {
            if let Some(child) = self.last_child {
                // The child is alive but stopped: simply restart it.
                child.resume()?;
                self.child_stopped = false;
                return Ok(ForkResult::Parent(child));
            }
            self.child_stopped = false;
        }

        // SAFETY: the supervisor runs single threaded.
        let fork_result = (unsafe { fork() }).inspect_err(|_| {
            log::error!("Failed to fork the next child");
        })?;
        match &fork_result {
            ForkResult::Parent(child) => {
                self.last_child = Some(*child);
            }
            ForkResult::Child => {
                self.last_child = None;
                self.restore_dispositions()?;
            }
        }
        Ok(fork_result)
    }

    fn handle_child_requests(&mut self) -> Result<i32, Error> {
        let Some(child) = self.last_child else {
            return Err(Error::illegal_state("no child to wait for"));
        };
        let status = child.wait_status(self.persistent)?;
        if libc::WIFSTOPPED(status) {
            self.child_stopped = true;
        } else {
            self.last_child = None;
        }
        Ok(status)
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.child_stopped = false;
        if let Some(child) = self.last_child.take() {
            child.send(Signal::SIGKILL)?;
            child.wait_status(false)?;
        }
        Ok(())
    }
}

/// Success state when [`start_forkserver`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkserverState {
    /// There is no AFL forkserver responded. In such case,
    /// we should allow user to do a normal execution.
    NoAfl,
    /// Current process is a spawned child.
    Child,
}

fn advance(state: &mut SupervisorState, next: SupervisorState) {
    if *state != next {
        log::debug!("Forkserver {state:?} -> {next:?}");
        *state = next;
    }
}

/// Start a forkserver on `channel`, using `forkserver_parent` to provide the
/// children.
///
/// Returns [`ForkserverState::NoAfl`] right away if no fuzzer answers. Else
/// the calling process becomes the supervisor and only the children return,
/// with [`ForkserverState::Child`] and the channel closed. The supervisor
/// itself only leaves the loop with an error, [`Error::ShuttingDown`] if the
/// fuzzer asked it to terminate.
pub fn start_forkserver<P: ForkserverParent>(
    channel: ForkserverChannel,
    forkserver_parent: &mut P,
) -> Result<ForkserverState, Error> {
    let mut state = SupervisorState::NotStarted;
    let res = run_supervisor(channel, forkserver_parent, &mut state);
    if res.is_err() {
        advance(&mut state, SupervisorState::Terminated);
    }
    res
}

fn shut_down_if_requested<P: ForkserverParent>(forkserver_parent: &mut P) -> Result<(), Error> {
    if stop_requested() {
        log::info!("Got SIGTERM, shutting down the forkserver");
        forkserver_parent.terminate()?;
        return Err(Error::shutting_down());
    }
    Ok(())
}

fn run_supervisor<P: ForkserverParent>(
    channel: ForkserverChannel,
    forkserver_parent: &mut P,
    state: &mut SupervisorState,
) -> Result<ForkserverState, Error> {
    advance(state, SupervisorState::Probing);
    // Phone home and tell the fuzzer that we're OK. If nobody is there, assume
    // we're not running in forkserver mode and just execute the program.
    if !channel.probe()? {
        log::info!("No forkserver on descriptor {}, running directly", channel.status_fd());
        advance(state, SupervisorState::Terminated);
        return Ok(ForkserverState::NoAfl);
    }
    log::info!("Forkserver detected, supervising children");

    forkserver_parent.pre_fuzzing()?;
    advance(state, SupervisorState::ForkedParent);

    loop {
        // A SIGTERM that arrived while we waited on a child interrupts nothing,
        // so look at the flag before blocking again.
        shut_down_if_requested(forkserver_parent)?;

        // Wait for the fuzzer by reading from the pipe. Abort if read fails.
        let was_killed = match channel.read_u32() {
            Ok(was_killed) => was_killed,
            Err(Error::Os(_, Errno::EINTR, _)) => continue,
            Err(err) => {
                log::error!("Lost the fuzzer while waiting for a request: {err}");
                return Err(err);
            }
        };

        match forkserver_parent.spawn_child(was_killed != 0)? {
            ForkResult::Child => {
                // The descriptors are for the supervisor, we don't need them in the child
                channel.close();
                return Ok(ForkserverState::Child);
            }
            ForkResult::Parent(child) => {
                #[expect(clippy::cast_sign_loss)]
                channel.write_u32(child.pid as u32).inspect_err(|_| {
                    log::error!("write to afl-fuzz");
                })?;
                advance(state, SupervisorState::ChildRunning);
            }
        }

        let status = forkserver_parent.handle_child_requests()?;
        // The fuzzer stops reading once it sent SIGTERM, the status is dropped.
        shut_down_if_requested(forkserver_parent)?;
        if libc::WIFSTOPPED(status) {
            advance(state, SupervisorState::ChildStoppedPersistent);
        } else {
            advance(state, SupervisorState::ForkedParent);
        }

        // Relay wait status to AFL pipe, then loop back.
        #[expect(clippy::cast_sign_loss)]
        channel.write_u32(status as u32).inspect_err(|_| {
            log::error!("writing to afl-fuzz");
        })?;
    }
}
