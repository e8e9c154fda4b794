//! Turns selected host errors into fatal signals.
//!
//! A fuzzer only notices crashes. Host languages with exceptions usually turn
//! a bug into a caught error or a clean exit status, so the bridge lets the
//! harness name error classes that should kill the process with a signal.

use std::borrow::Cow;

use nix::sys::signal::Signal;

use crate::{
    os::unix_signals::{raise_signal, signal_from_raw},
    Error,
};

/// Class membership, as the host language defines it.
///
/// `C` is whatever the host uses to name error classes. Implementations
/// decide what "kind of" means, usually "is an instance of `class` or of one
/// of its subclasses".
pub trait KindOf<C> {
    /// Whether this error belongs to `class`
    fn is_kind_of(&self, class: &C) -> bool;

    /// Name of this error's class, for diagnostics
    fn class_name(&self) -> Cow<'_, str>;
}

/// Which errors crash the process, and with which signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashPolicy<C> {
    triggers: Vec<C>,
    ignores: Vec<C>,
    signal: Option<Signal>,
}

/// What the bridge decided for one raised error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// No policy, or the error matches no trigger class
    Ignored,
    /// The error matches an ignore class
    Exempt,
    /// The error matches a trigger class, the signal is due
    Crash(Signal),
}

impl<C> CrashPolicy<C> {
    /// Build a policy. `signum` may only be `0` if `triggers` is empty.
    pub fn new(triggers: Vec<C>, ignores: Vec<C>, signum: i32) -> Result<Self, Error> {
        let signal = match signum {
            0 if triggers.is_empty() => None,
            0 => {
                return Err(Error::illegal_argument(
                    "signal 0 cannot crash anything, pick a real signal for the trigger classes",
                ));
            }
            signum => Some(signal_from_raw(signum)?),
        };
        Ok(Self {
            triggers,
            ignores,
            signal,
        })
    }

    /// Whether any error can ever trigger this policy
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.triggers.is_empty() && self.signal.is_some()
    }

    /// The signal raised on a match
    #[must_use]
    pub fn signal(&self) -> Option<Signal> {
        self.signal
    }

    /// Decide what to do with `error`. Ignore classes win over trigger classes.
    #[must_use]
    pub fn verdict<E: KindOf<C> + ?Sized>(&self, error: &E) -> CrashVerdict {
        if self.ignores.iter().any(|class| error.is_kind_of(class)) {
            return CrashVerdict::Exempt;
        }
        match self.signal {
            Some(signal) if self.triggers.iter().any(|class| error.is_kind_of(class)) => {
                CrashVerdict::Crash(signal)
            }
            _ => CrashVerdict::Ignored,
        }
    }
}

/// Holds the process' crash policy and enforces when it may change.
#[derive(Debug)]
pub struct CrashBridge<C> {
    policy: Option<CrashPolicy<C>>,
    sealed: bool,
}

impl<C> Default for CrashBridge<C> {
    fn default() -> Self {
        Self {
            policy: None,
            sealed: false,
        }
    }
}

impl<C> CrashBridge<C> {
    /// A disabled bridge
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or reset the policy.
    ///
    /// All arguments `None` resets to the disabled state, which is always
    /// allowed. Anything else is only accepted once, and only before the
    /// bridge was sealed by initialization. A rejected call leaves the current
    /// policy untouched.
    pub fn configure(
        &mut self,
        triggers: Option<Vec<C>>,
        ignores: Option<Vec<C>>,
        signum: Option<i32>,
    ) -> Result<(), Error> {
        let (triggers, signum) = match (triggers, ignores.as_ref(), signum) {
            (None, None, None) => {
                self.policy = None;
                return Ok(());
            }
            (Some(triggers), _, Some(signum)) => (triggers, signum),
            (None, _, _) => {
                return Err(Error::illegal_argument(
                    "a crash policy needs a list of trigger classes",
                ));
            }
            (Some(_), _, None) => {
                return Err(Error::illegal_argument(
                    "a crash policy needs a signal number",
                ));
            }
        };
        if self.sealed {
            return Err(Error::illegal_state(
                "the crash policy must be configured before initialization",
            ));
        }
        if self.policy.is_some() {
            return Err(Error::illegal_state(
                "the crash policy is already configured, reset it first",
            ));
        }
        self.policy = Some(CrashPolicy::new(triggers, ignores.unwrap_or_default(), signum)?);
        Ok(())
    }

    /// Freeze the policy. Called once the session initializes.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// The current policy, if any
    #[must_use]
    pub fn policy(&self) -> Option<&CrashPolicy<C>> {
        self.policy.as_ref()
    }

    /// Whether raised errors need to be delivered at all
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.policy.as_ref().is_some_and(CrashPolicy::is_armed)
    }

    /// Decide about `error` without acting on it.
    #[must_use]
    pub fn verdict<E: KindOf<C> + ?Sized>(&self, error: &E) -> CrashVerdict {
        self.policy
            .as_ref()
            .map_or(CrashVerdict::Ignored, |policy| policy.verdict(error))
    }

    /// Handle a raised error. On a match, the configured signal is raised
    /// against this process, which usually ends it right here.
    pub fn on_raise<E: KindOf<C> + ?Sized>(&self, error: &E) -> Result<CrashVerdict, Error> {
        let verdict = self.verdict(error);
        if let CrashVerdict::Crash(signal) = verdict {
            log::error!(
                "Crashing on {} with {signal} for the fuzzer",
                error.class_name()
            );
            raise_signal(signal)?;
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use nix::sys::signal::Signal;

    use super::{CrashBridge, CrashPolicy, CrashVerdict, KindOf};
    use crate::Error;

    /// A tiny class tree: `Exception > StandardError > {ArgumentError, IOError > EOFError}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Class {
        Exception,
        StandardError,
        ArgumentError,
        IoError,
        EofError,
    }

    impl Class {
        fn parent(self) -> Option<Class> {
            match self {
                Class::Exception => None,
                Class::StandardError => Some(Class::Exception),
                Class::ArgumentError | Class::IoError => Some(Class::StandardError),
                Class::EofError => Some(Class::IoError),
            }
        }
    }

    struct Raised(Class);

    impl KindOf<Class> for Raised {
        fn is_kind_of(&self, class: &Class) -> bool {
            let mut current = Some(self.0);
            while let Some(c) = current {
                if c == *class {
                    return true;
                }
                current = c.parent();
            }
            false
        }

        fn class_name(&self) -> Cow<'_, str> {
            Cow::Owned(format!("{:?}", self.0))
        }
    }

    #[test]
    fn test_policy_matching() {
        let policy = CrashPolicy::new(
            vec![Class::StandardError],
            vec![Class::IoError],
            Signal::SIGUSR1 as i32,
        )
        .unwrap();

        assert_eq!(
            policy.verdict(&Raised(Class::ArgumentError)),
            CrashVerdict::Crash(Signal::SIGUSR1)
        );
        // ignore classes win, also for subclasses
        assert_eq!(policy.verdict(&Raised(Class::IoError)), CrashVerdict::Exempt);
        assert_eq!(policy.verdict(&Raised(Class::EofError)), CrashVerdict::Exempt);
        // neither
        assert_eq!(
            policy.verdict(&Raised(Class::Exception)),
            CrashVerdict::Ignored
        );
    }

    #[test]
    fn test_policy_signal_validation() {
        assert!(CrashPolicy::<Class>::new(vec![], vec![], 0).is_ok());
        assert!(!CrashPolicy::<Class>::new(vec![], vec![], 0).unwrap().is_armed());
        assert!(matches!(
            CrashPolicy::new(vec![Class::Exception], vec![], 0),
            Err(Error::IllegalArgument(..))
        ));
        assert!(CrashPolicy::new(vec![Class::Exception], vec![], -5).is_err());
        assert!(CrashPolicy::new(vec![Class::Exception], vec![], 1 << 12).is_err());
    }

    #[test]
    fn test_configure_once() {
        let mut bridge = CrashBridge::new();
        bridge
            .configure(Some(vec![Class::Exception]), None, Some(Signal::SIGUSR2 as i32))
            .unwrap();
        assert!(bridge.is_armed());

        let again = bridge.configure(
            Some(vec![Class::IoError]),
            Some(vec![]),
            Some(Signal::SIGABRT as i32),
        );
        assert!(matches!(again, Err(Error::IllegalState(..))));
        assert_eq!(
            bridge.policy().unwrap().signal(),
            Some(Signal::SIGUSR2),
            "a rejected configuration must not touch the existing policy"
        );

        bridge.configure(None, None, None).unwrap();
        assert!(bridge.policy().is_none());
        bridge
            .configure(Some(vec![]), Some(vec![]), Some(0))
            .unwrap();
        assert!(!bridge.is_armed());
    }

    #[test]
    fn test_configure_argument_checks() {
        let mut bridge = CrashBridge::<Class>::new();
        assert!(matches!(
            bridge.configure(None, Some(vec![Class::IoError]), Some(10)),
            Err(Error::IllegalArgument(..))
        ));
        assert!(matches!(
            bridge.configure(Some(vec![Class::IoError]), None, None),
            Err(Error::IllegalArgument(..))
        ));
        assert!(bridge.configure(Some(vec![Class::IoError]), None, Some(-1)).is_err());
        assert!(bridge.policy().is_none());
    }

    #[test]
    fn test_sealed_bridge() {
        let mut bridge = CrashBridge::<Class>::new();
        bridge.seal();
        assert!(matches!(
            bridge.configure(Some(vec![Class::Exception]), None, Some(6)),
            Err(Error::IllegalState(..))
        ));
        // resetting stays possible
        bridge.configure(None, None, None).unwrap();
    }

    #[test]
    fn test_on_raise_without_match_returns() {
        let mut bridge = CrashBridge::new();
        bridge
            .configure(
                Some(vec![Class::ArgumentError]),
                Some(vec![Class::EofError]),
                Some(Signal::SIGUSR1 as i32),
            )
            .unwrap();
        assert_eq!(
            bridge.on_raise(&Raised(Class::EofError)).unwrap(),
            CrashVerdict::Exempt
        );
        assert_eq!(
            bridge.on_raise(&Raised(Class::IoError)).unwrap(),
            CrashVerdict::Ignored
        );
        assert_eq!(
            CrashBridge::<Class>::new()
                .on_raise(&Raised(Class::ArgumentError))
                .unwrap(),
            CrashVerdict::Ignored
        );
    }
}
