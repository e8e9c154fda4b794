//! Run accounting for persistent mode.
//!
//! In persistent mode one child executes many runs. After each run it stops
//! itself, the supervisor reports the stop to the fuzzer and resumes the same
//! process for the next run, until the run limit is reached.

use core::fmt::{self, Display};

use crate::Error;

/// How many runs one persistent child executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LoopLimit {
    /// Stop after this many runs
    Limited(u64),
    /// Never stop
    #[default]
    Unlimited,
}

impl LoopLimit {
    /// Whether `runs` completed runs exhaust this limit
    #[must_use]
    pub fn is_reached(&self, runs: u64) -> bool {
        match self {
            Self::Limited(max) => runs >= *max,
            Self::Unlimited => false,
        }
    }
}

impl From<u64> for LoopLimit {
    fn from(max: u64) -> Self {
        Self::Limited(max)
    }
}

impl TryFrom<i64> for LoopLimit {
    type Error = Error;

    fn try_from(max: i64) -> Result<Self, Self::Error> {
        u64::try_from(max).map(Self::Limited).map_err(|_| {
            Error::illegal_argument(format!("iteration count must not be negative, got {max}"))
        })
    }
}

impl Display for LoopLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(max) => write!(f, "{max}"),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// What the driver has to do for one call of the persistent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// Asked for zero runs before anything happened: do nothing at all
    Skip,
    /// The first run: initialize in persistent mode
    Start,
    /// Another run in the same process
    Next,
    /// The limit is reached
    Done,
}

/// Counts persistent runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    runs: u64,
    finished: bool,
}

impl PersistentState {
    /// A fresh state, persistent mode off
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the loop was entered
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.runs > 0
    }

    /// Whether the limit was reached
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Runs started so far
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Advance by one loop call.
    ///
    /// The limit is taken from each call, so a caller changing its argument
    /// between calls changes when the loop ends.
    pub fn step(&mut self, limit: LoopLimit) -> LoopStep {
        if self.finished {
            return LoopStep::Done;
        }
        if self.runs == 0 {
            if limit.is_reached(0) {
                return LoopStep::Skip;
            }
            self.runs = 1;
            return LoopStep::Start;
        }
        if limit.is_reached(self.runs) {
            self.finished = true;
            return LoopStep::Done;
        }
        self.runs += 1;
        LoopStep::Next
    }
}
