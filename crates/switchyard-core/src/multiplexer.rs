//! Channel multiplexer.
//!
//! Owns a [`Poller`] and the table of channels registered with it, and hands
//! out ready channels one at a time through [`ChannelMultiplexer::wait`]. It
//! knows nothing about sessions: each channel carries an opaque `owner` value
//! the caller uses to find its own state.
//!
//! # Channel slots
//!
//! Channels live in an index-based slot arena. Retired slots go on a reuse
//! pool and their generation is bumped, so a [`ChannelId`] held across an
//! unregister never resolves to the slot's next occupant. Poll events carry
//! the full id as their token; events for channels retired earlier in the
//! same batch are skipped.
//!
//! # Idle timeouts
//!
//! The poll call is bounded by the smallest idle budget across all channels.
//! That minimum is only recomputed right before a blocking poll, and only if
//! some budget changed since the last recomputation. When a poll returns no
//! events, the first channel carrying the minimum budget is reported with
//! [`Readiness::TIMEOUT`]; the remaining channels with the same budget are
//! queued and handed out by the following `wait` calls without polling again.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::Arc,
    time::Duration,
};

use crate::{
    error::MultiplexerError,
    poller::{Notify, PollEvent, Poller},
    readiness::Readiness,
};

/// Default number of events fetched per poll call.
pub const DEFAULT_MAX_EVENTS: usize = 30;

/// Generation-tagged handle to a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    index: u32,
    generation: u32,
}

impl ChannelId {
    /// Poller token encoding both slot index and generation.
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of [`ChannelId::token`].
    pub fn from_token(token: u64) -> Self {
        Self { index: token as u32, generation: (token >> 32) as u32 }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}.{}", self.index, self.generation)
    }
}

/// A channel reported by [`ChannelMultiplexer::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready<T> {
    /// Channel that became ready
    pub channel: ChannelId,
    /// Observed readiness, possibly only [`Readiness::TIMEOUT`]
    pub readiness: Readiness,
    /// Owner value given at registration
    pub owner: T,
}

/// Result of one [`ChannelMultiplexer::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup<T> {
    /// A channel is ready or its idle budget elapsed.
    Channel(Ready<T>),

    /// Another thread woke the poller through its notifier.
    Notified,
}

#[derive(Debug)]
struct Channel<D, T> {
    descriptor: D,
    interest: Readiness,
    readiness: Readiness,
    idle_budget: Option<Duration>,
    owner: T,
}

#[derive(Debug)]
struct Slot<D, T> {
    generation: u32,
    channel: Option<Channel<D, T>>,
}

/// Readiness multiplexer over a set of channels.
pub struct ChannelMultiplexer<P: Poller, T> {
    poller: P,
    slots: Vec<Slot<P::Descriptor, T>>,
    /// Reuse pool of vacant slot indices
    free: Vec<u32>,
    /// Live descriptor → channel, guards against double registration
    descriptors: HashMap<P::Descriptor, ChannelId>,
    /// Last poll batch and the next event to hand out
    events: Vec<PollEvent>,
    cursor: usize,
    /// Channels known to be due for a timeout delivery
    pending_timeouts: VecDeque<ChannelId>,
    /// Smallest idle budget as of the last recomputation
    min_idle: Option<Duration>,
    rescan: bool,
    active: usize,
}

impl<P: Poller, T: Copy> ChannelMultiplexer<P, T> {
    /// Create a multiplexer fetching up to `max_events` events per poll.
    pub fn new(poller: P, max_events: usize) -> Self {
        Self {
            poller,
            slots: Vec::new(),
            free: Vec::new(),
            descriptors: HashMap::new(),
            events: Vec::with_capacity(max_events.max(1)),
            cursor: 0,
            pending_timeouts: VecDeque::new(),
            min_idle: None,
            rescan: false,
            active: 0,
        }
    }

    /// Register `descriptor` with the poller.
    ///
    /// Reuses a retired slot when one is available.
    ///
    /// # Errors
    ///
    /// - `MultiplexerError::AlreadyRegistered` if the descriptor is live
    /// - `MultiplexerError::Register` if the poller refuses it
    pub fn register(
        &mut self,
        descriptor: P::Descriptor,
        interest: Readiness,
        owner: T,
    ) -> Result<ChannelId, MultiplexerError> {
        if self.descriptors.contains_key(&descriptor) {
            return Err(MultiplexerError::AlreadyRegistered(format!("{descriptor:?}")));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, channel: None });
                (self.slots.len() - 1) as u32
            },
        };
        let generation = self.slots[index as usize].generation;
        let id = ChannelId { index, generation };

        if let Err(e) = self.poller.add(descriptor, id.token(), interest.io_only()) {
            self.free.push(index);
            return Err(MultiplexerError::Register(e));
        }

        self.slots[index as usize].channel = Some(Channel {
            descriptor,
            interest,
            readiness: Readiness::empty(),
            idle_budget: None,
            owner,
        });
        self.descriptors.insert(descriptor, id);
        self.active += 1;

        tracing::trace!(%id, ?descriptor, ?interest, "channel registered");
        Ok(id)
    }

    /// Change a channel's interest mask.
    ///
    /// The poller is only updated if the mask actually changes.
    pub fn set_interest(
        &mut self,
        id: ChannelId,
        interest: Readiness,
    ) -> Result<(), MultiplexerError> {
        let channel = self.slot_mut(id).ok_or(MultiplexerError::UnknownChannel(id))?;
        if channel.interest == interest {
            return Ok(());
        }

        let descriptor = channel.descriptor;
        self.poller
            .modify(descriptor, id.token(), interest.io_only())
            .map_err(|source| MultiplexerError::Update { channel: id, source })?;

        if let Some(channel) = self.slot_mut(id) {
            channel.interest = interest;
        }
        Ok(())
    }

    /// Change a channel's idle budget. `None` disables the timeout.
    pub fn set_idle_budget(
        &mut self,
        id: ChannelId,
        budget: Option<Duration>,
    ) -> Result<(), MultiplexerError> {
        let channel = self.slot_mut(id).ok_or(MultiplexerError::UnknownChannel(id))?;
        if channel.idle_budget != budget {
            channel.idle_budget = budget;
            self.rescan = true;
        }
        Ok(())
    }

    /// Remove a channel from the poller and retire its slot.
    ///
    /// Returns the owner value. A poller error on removal is logged, not
    /// returned: the slot is retired either way.
    pub fn unregister(&mut self, id: ChannelId) -> Result<T, MultiplexerError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(MultiplexerError::UnknownChannel(id))?;
        let channel = slot.channel.take().ok_or(MultiplexerError::UnknownChannel(id))?;
        slot.generation = slot.generation.wrapping_add(1);

        if let Err(e) = self.poller.delete(channel.descriptor) {
            tracing::warn!(%id, descriptor = ?channel.descriptor, "poller delete failed: {}", e);
        }

        self.descriptors.remove(&channel.descriptor);
        self.free.push(id.index);
        self.active -= 1;
        self.rescan = true;

        tracing::trace!(%id, "channel unregistered");
        Ok(channel.owner)
    }

    /// Wait for the next ready channel.
    ///
    /// Hands out one event per call. A blocking poll is only issued once the
    /// previous batch and any queued idle timeouts have been consumed.
    ///
    /// # Errors
    ///
    /// `MultiplexerError::Poll` if the poll call fails. This is terminal.
    pub fn wait(&mut self) -> Result<Wakeup<T>, MultiplexerError> {
        loop {
            if let Some(ready) = self.next_pending_timeout() {
                return Ok(Wakeup::Channel(ready));
            }

            if self.cursor >= self.events.len() {
                self.recompute_min_idle();
                self.events.clear();
                self.cursor = 0;

                match self.poller.poll(&mut self.events, self.min_idle) {
                    Ok(()) => {},
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(MultiplexerError::Poll(e)),
                }

                if self.events.is_empty() {
                    if let Some(ready) = self.expire_idle() {
                        return Ok(Wakeup::Channel(ready));
                    }
                    continue;
                }
            }

            let event = self.events[self.cursor];
            self.cursor += 1;

            match event {
                PollEvent::Wake => return Ok(Wakeup::Notified),
                PollEvent::Channel { token, readiness } => {
                    let id = ChannelId::from_token(token);
                    if let Some(channel) = self.slot_mut(id) {
                        channel.readiness = readiness;
                        return Ok(Wakeup::Channel(Ready {
                            channel: id,
                            readiness,
                            owner: channel.owner,
                        }));
                    }
                    tracing::trace!(%id, "skipping event for retired channel");
                },
            }
        }
    }

    /// Wake-up handle for the underlying poller.
    pub fn notifier(&mut self) -> io::Result<Arc<dyn Notify>> {
        self.poller.notifier()
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.active
    }

    /// True if no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Interest mask of a live channel.
    pub fn interest(&self, id: ChannelId) -> Option<Readiness> {
        self.slot(id).map(|channel| channel.interest)
    }

    /// Last readiness reported for a live channel.
    pub fn readiness(&self, id: ChannelId) -> Option<Readiness> {
        self.slot(id).map(|channel| channel.readiness)
    }

    /// Idle budget of a live channel.
    pub fn idle_budget(&self, id: ChannelId) -> Option<Duration> {
        self.slot(id).and_then(|channel| channel.idle_budget)
    }

    /// Underlying poller.
    pub fn poller(&self) -> &P {
        &self.poller
    }

    fn slot(&self, id: ChannelId) -> Option<&Channel<P::Descriptor, T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.channel.as_ref())
    }

    fn slot_mut(&mut self, id: ChannelId) -> Option<&mut Channel<P::Descriptor, T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.channel.as_mut())
    }

    fn live_ids(&self) -> impl Iterator<Item = (ChannelId, &Channel<P::Descriptor, T>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let id = ChannelId { index: index as u32, generation: slot.generation };
            slot.channel.as_ref().map(|channel| (id, channel))
        })
    }

    fn recompute_min_idle(&mut self) {
        if !self.rescan {
            return;
        }
        self.min_idle = self.live_ids().filter_map(|(_, channel)| channel.idle_budget).min();
        self.rescan = false;
    }

    /// Pop the next queued channel still carrying the current minimum budget.
    fn next_pending_timeout(&mut self) -> Option<Ready<T>> {
        let min = self.min_idle;
        while let Some(id) = self.pending_timeouts.pop_front() {
            if let Some(channel) = self.slot_mut(id) {
                if channel.idle_budget.is_some() && channel.idle_budget == min {
                    channel.readiness = Readiness::TIMEOUT;
                    return Some(Ready {
                        channel: id,
                        readiness: Readiness::TIMEOUT,
                        owner: channel.owner,
                    });
                }
            }
        }
        None
    }

    /// Single scan after an empty poll: report the first channel at the
    /// minimum budget and queue the rest that share it.
    fn expire_idle(&mut self) -> Option<Ready<T>> {
        let min = self.min_idle?;
        let mut due = self
            .live_ids()
            .filter(|(_, channel)| channel.idle_budget == Some(min))
            .map(|(id, _)| id);

        let first = due.next()?;
        let rest: VecDeque<ChannelId> = due.collect();
        self.pending_timeouts = rest;

        let channel = self.slot_mut(first)?;
        channel.readiness = Readiness::TIMEOUT;
        tracing::trace!(id = %first, budget = ?min, "idle budget elapsed");
        Some(Ready { channel: first, readiness: Readiness::TIMEOUT, owner: channel.owner })
    }
}

impl<P: Poller, T> fmt::Debug for ChannelMultiplexer<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelMultiplexer")
            .field("active", &self.active)
            .field("free_slots", &self.free.len())
            .field("min_idle", &self.min_idle)
            .field("pending_timeouts", &self.pending_timeouts.len())
            .finish()
    }
}
