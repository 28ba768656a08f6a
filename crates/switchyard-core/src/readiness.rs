//! Readiness masks.
//!
//! The same bitset is used in both directions: as the *interest* a channel
//! registers with the poller, and as the *readiness* the multiplexer reports
//! back. `TIMEOUT` is synthetic; it never comes from the poller and is only
//! set by the multiplexer when a channel's idle budget elapses.

use bitflags::bitflags;

bitflags! {
    /// Readable / writable / error / idle-timeout conditions on a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Readiness: u8 {
        /// Descriptor has data to read (or a connection to accept).
        const READ    = 0b0001;
        /// Descriptor can accept more outgoing bytes.
        const WRITE   = 0b0010;
        /// Error or hang-up reported by the poller.
        const ERROR   = 0b0100;
        /// Idle budget elapsed without activity.
        const TIMEOUT = 0b1000;
    }
}

impl Readiness {
    /// Interest used for listening sockets.
    pub const LISTEN: Self = Self::READ.union(Self::ERROR);

    /// True if the idle-timeout bit is set.
    pub fn is_timeout(self) -> bool {
        self.contains(Self::TIMEOUT)
    }

    /// Only the bits a poller can be asked to watch.
    pub fn io_only(self) -> Self {
        self & (Self::READ | Self::WRITE | Self::ERROR)
    }
}
