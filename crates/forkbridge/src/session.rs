//! The per process bridge state, and the operations a host integration calls.

use crate::{
    config::BridgeConfig,
    coverage::CoverageRecorder,
    crash::{CrashBridge, CrashVerdict, KindOf},
    forkserver::{
        start_forkserver, ForkserverChannel, ForkserverState, MaybePersistentForkserverParent,
    },
    hooks::{EventChannel, Subscription, TraceHook},
    os::unix_signals::stop_self,
    persistent::{LoopLimit, LoopStep, PersistentState},
    shmem::{ShMemProvider, UnixShMemProvider},
    Error,
};

/// Everything the bridge knows about this process.
///
/// A host integration keeps exactly one `Session` per process, feeds it the
/// events its runtime produces and calls [`Session::init`] or
/// [`Session::persistent_loop`] once the program is ready to be fuzzed.
///
/// `H` installs the host's event producers, `C` is the host's notion of an
/// error class and `SP` provides the coverage map.
#[derive(Debug)]
pub struct Session<H, C, SP = UnixShMemProvider>
where
    H: TraceHook,
    SP: ShMemProvider,
{
    config: BridgeConfig,
    hook: H,
    shmem_provider: SP,
    recorder: CoverageRecorder,
    crash: CrashBridge<C>,
    scope: Subscription,
    raise: Subscription,
    persistent: PersistentState,
    initialized: bool,
    forkserver: bool,
}

impl<H, C> Session<H, C, UnixShMemProvider>
where
    H: TraceHook,
{
    /// A session attaching to the fuzzer's SysV shared memory.
    pub fn new(config: BridgeConfig, hook: H) -> Result<Self, Error> {
        Self::with_shmem_provider(config, hook, UnixShMemProvider)
    }
}

impl<H, C, SP> Session<H, C, SP>
where
    H: TraceHook,
    SP: ShMemProvider,
    SP::ShMem: 'static,
{
    /// A session taking its coverage map from `shmem_provider`.
    pub fn with_shmem_provider(
        config: BridgeConfig,
        hook: H,
        shmem_provider: SP,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            recorder: CoverageRecorder::new(config.map_size),
            config,
            hook,
            shmem_provider,
            crash: CrashBridge::new(),
            scope: Subscription::new(EventChannel::Scope),
            raise: Subscription::new(EventChannel::Raise),
            persistent: PersistentState::new(),
            initialized: false,
            forkserver: false,
        })
    }

    /// Initialize for one run per process.
    ///
    /// If a fuzzer is listening, this process turns into the forkserver and
    /// only returns in its children. Else it returns right away. Either way,
    /// the coverage map is attached and tracing is on afterwards.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::illegal_state("the bridge is already initialized"));
        }
        self.initialized = true;
        self.crash.seal();

        let mut forkserver_parent =
            MaybePersistentForkserverParent::new().persistent(self.persistent.is_enabled());
        let channel = ForkserverChannel::from_config(&self.config);
        self.forkserver = match start_forkserver(channel, &mut forkserver_parent)? {
            ForkserverState::NoAfl => false,
            ForkserverState::Child => true,
        };

        self.recorder.attach(&mut self.shmem_provider, &self.config)?;
        if self.crash.is_armed() {
            self.raise.enable(&mut self.hook)?;
        }
        self.start_tracing()
    }

    /// Drive persistent mode. Meant as the condition of the host's run loop:
    /// `while session.persistent_loop(limit)? { run_one_input(); }`
    ///
    /// Returns `false` once `limit` runs are done, and forever after. A limit
    /// of zero on the first call returns `false` without initializing.
    pub fn persistent_loop(&mut self, limit: LoopLimit) -> Result<bool, Error> {
        if self.initialized && !self.persistent.is_enabled() {
            return Err(Error::illegal_state(
                "the bridge was initialized for single runs, persistent mode is no longer possible",
            ));
        }
        match self.persistent.step(limit) {
            LoopStep::Skip => Ok(false),
            LoopStep::Start => {
                log::debug!("Entering persistent mode, limit {limit}");
                self.recorder.reset_location();
                self.init()?;
                Ok(true)
            }
            LoopStep::Next => {
                if self.forkserver {
                    // Tell the supervisor this run is over. It resumes us for the next one.
                    stop_self()?;
                }
                self.recorder.reset_location();
                Ok(true)
            }
            LoopStep::Done => {
                self.stop_tracing();
                Ok(false)
            }
        }
    }

    /// Configure which raised errors crash the process.
    ///
    /// See [`CrashBridge::configure`]. A reset also stops delivery of raise events.
    pub fn configure_crash_policy(
        &mut self,
        triggers: Option<Vec<C>>,
        ignores: Option<Vec<C>>,
        signal: Option<i32>,
    ) -> Result<(), Error> {
        let reset = triggers.is_none() && ignores.is_none() && signal.is_none();
        self.crash.configure(triggers, ignores, signal)?;
        if reset {
            self.raise.disable(&mut self.hook);
        }
        Ok(())
    }

    /// The host entered a scope at `path:line`.
    #[inline]
    pub fn on_scope_event(&mut self, path: &[u8], line: u32) {
        if self.scope.is_active() {
            self.recorder.record(path, line);
        }
    }

    /// The host raised `error`. Returns only if the error does not crash the process.
    pub fn on_raise<E: KindOf<C> + ?Sized>(&mut self, error: &E) -> Result<CrashVerdict, Error> {
        if !self.raise.is_active() {
            return Ok(CrashVerdict::Ignored);
        }
        self.crash.on_raise(error)
    }

    /// Start recording scope events.
    pub fn start_tracing(&mut self) -> Result<(), Error> {
        self.scope.enable(&mut self.hook)
    }

    /// Stop recording and stop crashing. Safe to call any number of times.
    pub fn stop_tracing(&mut self) {
        self.scope.disable(&mut self.hook);
        self.raise.disable(&mut self.hook);
    }

    /// The configuration this session runs with
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The coverage recorder
    #[must_use]
    pub fn recorder(&self) -> &CoverageRecorder {
        &self.recorder
    }

    /// The crash bridge
    #[must_use]
    pub fn crash_bridge(&self) -> &CrashBridge<C> {
        &self.crash
    }

    /// The host hook
    #[must_use]
    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// Whether `init` ran
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether this process is a child of a forkserver
    #[must_use]
    pub fn has_forkserver(&self) -> bool {
        self.forkserver
    }

    /// Whether scope events are recorded right now
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.scope.is_active()
    }

    /// Whether raise events reach the crash bridge right now
    #[must_use]
    pub fn is_crash_armed(&self) -> bool {
        self.raise.is_active()
    }

    /// Persistent runs started so far
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.persistent.runs()
    }
}
