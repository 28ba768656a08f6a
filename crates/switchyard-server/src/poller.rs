//! mio-backed [`Poller`].
//!
//! Registrations go through [`SourceFd`] so the multiplexer can address
//! sockets by raw descriptor. mio is edge-triggered; the server loop drains
//! reads and accepts until they would block, and every interest change is a
//! reregistration, which re-arms the edge.

use std::{io, os::fd::RawFd, sync::Arc, time::Duration};

use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use switchyard_core::{DEFAULT_MAX_EVENTS, Notify, PollEvent, Poller, Readiness};

// Channel tokens pack a 32-bit generation above a 32-bit slot index, and mio
// tokens are `usize`.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("switchyard-server needs a 64-bit target to carry channel tokens");

/// Token reserved for the waker. Channel tokens never reach it because the
/// generation half of a channel token would have to be `u32::MAX`.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Poller over `epoll`/`kqueue` via mio.
pub struct MioPoller {
    poll: Poll,
    events: Events,
    notify: Option<Arc<MioNotify>>,
}

impl MioPoller {
    /// Create a poller fetching at most `max_events` events per call.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let capacity = if max_events == 0 { DEFAULT_MAX_EVENTS } else { max_events };
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(capacity), notify: None })
    }
}

impl std::fmt::Debug for MioPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioPoller")
            .field("capacity", &self.events.capacity())
            .field("notifier", &self.notify.is_some())
            .finish_non_exhaustive()
    }
}

/// Map a readiness mask onto mio's interest. mio has no empty interest, so
/// a mask without `READ` or `WRITE` watches for readability, which still
/// reports errors and hang-ups.
fn interest(mask: Readiness) -> Interest {
    match (mask.contains(Readiness::READ), mask.contains(Readiness::WRITE)) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

/// Channel token as a mio token. Lossless on the 64-bit targets this crate
/// builds for.
fn token(token: u64) -> io::Result<Token> {
    let token =
        usize::try_from(token).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if token == WAKE_TOKEN.0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "token reserved for the waker"));
    }
    Ok(Token(token))
}

fn readiness(event: &mio::event::Event) -> Readiness {
    let mut ready = Readiness::empty();
    if event.is_readable() || event.is_read_closed() {
        ready |= Readiness::READ;
    }
    if event.is_writable() || event.is_write_closed() {
        ready |= Readiness::WRITE;
    }
    if event.is_error() {
        ready |= Readiness::ERROR;
    }
    ready
}

impl Poller for MioPoller {
    type Descriptor = RawFd;

    fn add(&mut self, descriptor: RawFd, token_value: u64, mask: Readiness) -> io::Result<()> {
        self.poll.registry().register(
            &mut SourceFd(&descriptor),
            token(token_value)?,
            interest(mask),
        )
    }

    fn modify(&mut self, descriptor: RawFd, token_value: u64, mask: Readiness) -> io::Result<()> {
        self.poll.registry().reregister(
            &mut SourceFd(&descriptor),
            token(token_value)?,
            interest(mask),
        )
    }

    fn delete(&mut self, descriptor: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&descriptor))
    }

    fn poll(&mut self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                out.push(PollEvent::Wake);
                continue;
            }
            let ready = readiness(event);
            if ready.is_empty() {
                continue;
            }
            out.push(PollEvent::Channel { token: event.token().0 as u64, readiness: ready });
        }
        Ok(())
    }

    fn notifier(&mut self) -> io::Result<Arc<dyn Notify>> {
        // mio allows a single waker per poll instance.
        if let Some(notify) = &self.notify {
            return Ok(Arc::clone(notify) as Arc<dyn Notify>);
        }
        let notify = Arc::new(MioNotify { waker: Waker::new(self.poll.registry(), WAKE_TOKEN)? });
        self.notify = Some(Arc::clone(&notify));
        Ok(notify)
    }
}

/// [`Notify`] backed by a mio [`Waker`].
#[derive(Debug)]
pub struct MioNotify {
    waker: Waker,
}

impl Notify for MioNotify {
    fn notify(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
