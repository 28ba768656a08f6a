//! Readiness-notification backend.
//!
//! The multiplexer never talks to the OS directly. Production code plugs in an
//! epoll/kqueue poller (see `switchyard-server`), tests plug in a simulated one.
//! Registrations are keyed by an opaque `u64` token chosen by the multiplexer.

use std::{fmt::Debug, hash::Hash, io, sync::Arc, time::Duration};

use crate::readiness::Readiness;

/// One entry of a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// A registered descriptor became ready.
    Channel {
        /// Token the descriptor was registered with
        token: u64,
        /// Observed readiness (`READ`, `WRITE`, `ERROR` only)
        readiness: Readiness,
    },

    /// The poller was woken through its [`Notify`] handle.
    Wake,
}

/// Thread-safe handle that interrupts a blocked [`Poller::poll`].
pub trait Notify: Send + Sync {
    /// Wake the poller. Multiple calls before the next poll may coalesce.
    fn notify(&self) -> io::Result<()>;
}

/// Readiness-polling handle.
///
/// # Invariants
///
/// - A descriptor is added at most once before it is deleted.
/// - `poll` reports at most one event per descriptor per batch.
pub trait Poller {
    /// Native descriptor type (raw fd in production, plain ids in simulation).
    type Descriptor: Copy + Eq + Hash + Debug;

    /// Start watching `descriptor` for `interest`.
    fn add(&mut self, descriptor: Self::Descriptor, token: u64, interest: Readiness)
    -> io::Result<()>;

    /// Replace the interest of an already-added descriptor.
    fn modify(
        &mut self,
        descriptor: Self::Descriptor,
        token: u64,
        interest: Readiness,
    ) -> io::Result<()>;

    /// Stop watching `descriptor`.
    fn delete(&mut self, descriptor: Self::Descriptor) -> io::Result<()>;

    /// Block until at least one event is available or `timeout` elapses.
    ///
    /// `None` waits indefinitely. An elapsed timeout leaves `events` empty.
    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()>;

    /// Handle other threads use to wake this poller.
    fn notifier(&mut self) -> io::Result<Arc<dyn Notify>>;
}
