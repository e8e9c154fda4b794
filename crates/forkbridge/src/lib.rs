/*!
 * `forkbridge` connects a traced host program to an AFL-style forkserver and
 * records edge coverage into the fuzzer's shared memory map.
 */
#![doc = include_str!("../README.md")]
/*! */
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
    //unused_results
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

#[cfg(not(unix))]
compile_error!("forkbridge speaks the AFL forkserver protocol, which needs a unix target.");

pub mod config;
pub mod coverage;
pub mod crash;
pub mod forkserver;
pub mod hooks;
pub mod os;
pub mod persistent;
pub mod session;
pub mod shmem;

pub use config::BridgeConfig;
pub use coverage::{edge_bucket, fnv_hash, CoverageMap, CoverageRecorder, MAP_SIZE};
pub use crash::{CrashBridge, CrashPolicy, CrashVerdict, KindOf};
pub use hooks::{EventChannel, NopTraceHook, Subscription, TraceHook};
pub use persistent::LoopLimit;
pub use session::Session;

use core::{
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
};
use std::io;

use nix::errno::Errno;

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// ZST to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace;

#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `forkbridge`
#[derive(Debug)]
pub enum Error {
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The fuzzer and this process disagree about the handshake
    Protocol(String, ErrorBacktrace),
    /// A system call failed
    Os(String, Errno, ErrorBacktrace),
    /// A signal could not be delivered
    Signal(String, ErrorBacktrace),
    /// Shutting down, not really an error.
    ShuttingDown,
}

impl Error {
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::new())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }
    /// Short or failed frame on the forkserver descriptors
    #[must_use]
    pub fn protocol<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Protocol(arg.into(), ErrorBacktrace::new())
    }
    /// A system call failed with `errno`
    #[must_use]
    pub fn os<S>(arg: S, errno: Errno) -> Self
    where
        S: Into<String>,
    {
        Error::Os(arg.into(), errno, ErrorBacktrace::new())
    }
    /// A system call failed, take the current `errno`
    #[must_use]
    pub fn last_os_error<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Os(arg.into(), Errno::last(), ErrorBacktrace::new())
    }
    /// A signal could not be delivered
    #[must_use]
    pub fn signal<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Signal(arg.into(), ErrorBacktrace::new())
    }
    /// Shutting down, not really an error.
    #[must_use]
    pub fn shutting_down() -> Self {
        Error::ShuttingDown
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Protocol(s, b) => {
                write!(f, "Forkserver protocol error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Os(s, errno, b) => {
                write!(f, "{0}: {errno}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Signal(s, b) => {
                write!(f, "Signal delivery failed: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::ShuttingDown => write!(f, "Shutting down!"),
        }
    }
}

impl From<Errno> for Error {
    fn from(err: Errno) -> Self {
        Self::os("Unix error", err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let errno = err.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw);
        Self::os(format!("IO failed: {err}"), errno)
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::illegal_argument(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl std::error::Error for Error {}
