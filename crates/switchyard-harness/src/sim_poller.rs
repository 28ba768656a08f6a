//! Simulated readiness poller.
//!
//! Level-triggered over [`SimNet`] state. Time is virtual: a poll with a
//! timeout and nothing ready returns immediately as if the timeout elapsed.
//! A poll without a timeout blocks until the network changes (a peer acts or
//! a worker notifies); if nothing changes for [`STALL_AFTER`] the poll fails,
//! so a test that would hang forever fails instead.

use std::{io, sync::Arc, time::Duration};

use switchyard_core::{Notify, PollEvent, Poller, Readiness};

use crate::sim_net::{NetState, Registration, SimDescriptor, SimNet};

/// How long a poll without timeout waits for any change before failing.
pub const STALL_AFTER: Duration = Duration::from_secs(2);

/// [`Poller`] over a [`SimNet`].
pub struct SimPoller {
    net: SimNet,
}

impl SimPoller {
    /// Create a poller watching `net`.
    pub fn new(net: &SimNet) -> Self {
        Self { net: net.clone() }
    }
}

impl Poller for SimPoller {
    type Descriptor = SimDescriptor;

    fn add(
        &mut self,
        descriptor: SimDescriptor,
        token: u64,
        interest: Readiness,
    ) -> io::Result<()> {
        let mut state = self.net.lock();
        if state.registrations.contains_key(&descriptor) {
            state.duplicate_registrations += 1;
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }

        state.registrations.insert(descriptor, Registration { token, interest });
        state.peak_registrations = state.peak_registrations.max(state.registrations.len());
        Ok(())
    }

    fn modify(
        &mut self,
        descriptor: SimDescriptor,
        token: u64,
        interest: Readiness,
    ) -> io::Result<()> {
        let mut state = self.net.lock();
        let registration = state
            .registrations
            .get_mut(&descriptor)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))?;
        *registration = Registration { token, interest };
        Ok(())
    }

    fn delete(&mut self, descriptor: SimDescriptor) -> io::Result<()> {
        self.net
            .lock()
            .registrations
            .remove(&descriptor)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.net.lock();
        state.polls += 1;

        loop {
            collect(&mut state, events);
            if !events.is_empty() {
                return Ok(());
            }

            if let Some(timeout) = timeout {
                state.timed_out_polls.push(timeout);
                return Ok(());
            }

            if self.net.shared.changed.wait_for(&mut state, STALL_AFTER).timed_out() {
                collect(&mut state, events);
                if events.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "simulation stalled: nothing ready and no timeout",
                    ));
                }
                return Ok(());
            }
        }
    }

    fn notifier(&mut self) -> io::Result<Arc<dyn Notify>> {
        Ok(Arc::new(SimNotify { net: self.net.clone() }))
    }
}

/// Append one event per ready registration, wake first.
fn collect(state: &mut NetState, events: &mut Vec<PollEvent>) {
    if std::mem::take(&mut state.wake_pending) {
        events.push(PollEvent::Wake);
    }

    let mut reported = Vec::new();
    for (descriptor, registration) in &state.registrations {
        // Errors are reported whatever the interest, like epoll.
        let readiness =
            state.readiness(*descriptor) & (registration.interest | Readiness::ERROR);
        if !readiness.is_empty() {
            events.push(PollEvent::Channel { token: registration.token, readiness });
            reported.push(*descriptor);
        }
    }

    for descriptor in reported {
        state.forced.remove(&descriptor);
    }
}

struct SimNotify {
    net: SimNet,
}

impl Notify for SimNotify {
    fn notify(&self) -> io::Result<()> {
        self.net.update(|state| state.wake_pending = true);
        Ok(())
    }
}
