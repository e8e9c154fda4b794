//! The seam towards the host program's event producer.
//!
//! The host runtime owns the machinery that notices "a method was entered" or
//! "an exception was raised". We only tell it when to start and stop
//! delivering those events, per [`EventChannel`].

use crate::Error;

/// The kinds of events the bridge listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    /// Execution progress: a call, a block or a class body was entered at `path:line`.
    Scope,
    /// An error object was raised.
    Raise,
}

/// Installs and removes the host's event producers.
pub trait TraceHook {
    /// Start delivering events of `channel`.
    fn install(&mut self, channel: EventChannel) -> Result<(), Error>;

    /// Stop delivering events of `channel`.
    fn uninstall(&mut self, channel: EventChannel);
}

/// A [`TraceHook`] for hosts that always deliver events and let the session filter them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopTraceHook;

impl TraceHook for NopTraceHook {
    fn install(&mut self, _channel: EventChannel) -> Result<(), Error> {
        Ok(())
    }

    fn uninstall(&mut self, _channel: EventChannel) {}
}

/// Whether one channel is currently subscribed.
///
/// Enabling an active subscription and disabling an inactive one are no-ops,
/// so the host hook sees exactly one `install` per `uninstall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    channel: EventChannel,
    active: bool,
}

impl Subscription {
    /// A new, inactive subscription
    #[must_use]
    pub const fn new(channel: EventChannel) -> Self {
        Self {
            channel,
            active: false,
        }
    }

    /// The channel this subscription is for
    #[must_use]
    pub const fn channel(&self) -> EventChannel {
        self.channel
    }

    /// Whether events of this channel are currently delivered
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Subscribe through `hook`, unless already subscribed.
    pub fn enable<H: TraceHook + ?Sized>(&mut self, hook: &mut H) -> Result<(), Error> {
        if !self.active {
            hook.install(self.channel)?;
            self.active = true;
        }
        Ok(())
    }

    /// Unsubscribe through `hook`. Safe to call any number of times.
    pub fn disable<H: TraceHook + ?Sized>(&mut self, hook: &mut H) {
        if self.active {
            hook.uninstall(self.channel);
            self.active = false;
        }
    }
}
