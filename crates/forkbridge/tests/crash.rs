//! Raised errors that match the crash policy really end the process.

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use forkbridge::{
        shmem::NopShMemProvider, BridgeConfig, CrashVerdict, KindOf, NopTraceHook, Session,
    };
    use nix::{
        sys::{
            signal::Signal,
            wait::{waitpid, WaitStatus},
        },
        unistd::{fork, ForkResult},
    };
    use serial_test::serial;

    /// Host errors named by a plain class string, `::` separating ancestors:
    /// `IOError::EOFError` is kind of `IOError`.
    struct HostError(&'static str);

    impl KindOf<String> for HostError {
        fn is_kind_of(&self, class: &String) -> bool {
            self.0 == class.as_str() || self.0.starts_with(&format!("{class}::"))
        }

        fn class_name(&self) -> Cow<'_, str> {
            Cow::Borrowed(self.0)
        }
    }

    fn armed_session() -> Session<NopTraceHook, String, NopShMemProvider> {
        let config = BridgeConfig::builder()
            .shm_env_var("FORKBRIDGE_IT_UNSET_SHM")
            .forkserver_fd(9_300)
            .build();
        let mut session =
            Session::with_shmem_provider(config, NopTraceHook, NopShMemProvider).unwrap();
        session
            .configure_crash_policy(
                Some(vec!["IOError".to_string()]),
                Some(vec!["IOError::EOFError".to_string()]),
                Some(Signal::SIGUSR1 as i32),
            )
            .unwrap();
        session.init().unwrap();
        session
    }

    /// Run `body` in a child and return how the child ended.
    fn in_child<F: FnOnce() -> i32>(body: F) -> WaitStatus {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = body();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => waitpid(child, None).unwrap(),
        }
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_trigger_class_kills_with_signal() {
        let status = in_child(|| {
            let mut session = armed_session();
            let _ = session.on_raise(&HostError("IOError::ConnectionReset"));
            0
        });
        assert!(
            matches!(status, WaitStatus::Signaled(_, Signal::SIGUSR1, _)),
            "{status:?}"
        );
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_ignored_and_unrelated_classes_survive() {
        let status = in_child(|| {
            let mut session = armed_session();
            let exempt = session.on_raise(&HostError("IOError::EOFError"));
            let unrelated = session.on_raise(&HostError("KeyError"));
            match (exempt, unrelated) {
                (Ok(CrashVerdict::Exempt), Ok(CrashVerdict::Ignored)) => 0,
                _ => 1,
            }
        });
        assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_stopped_tracing_disarms() {
        let status = in_child(|| {
            let mut session = armed_session();
            session.stop_tracing();
            match session.on_raise(&HostError("IOError")) {
                Ok(CrashVerdict::Ignored) => 0,
                _ => 1,
            }
        });
        assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
    }
}
