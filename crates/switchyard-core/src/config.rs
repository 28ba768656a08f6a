//! Server configuration.

use std::time::Duration;

use crate::multiplexer::DEFAULT_MAX_EVENTS;

/// Server loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Addresses to bind listeners to, passed verbatim to the bind closure
    pub listen: Vec<String>,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum readiness events fetched per poll call
    pub max_events: usize,
    /// Idle budget while a connection is handshaking (`None` disables)
    pub handshake_timeout: Option<Duration>,
    /// Idle budget while a connection is active (`None` disables)
    pub idle_timeout: Option<Duration>,
    /// Responses queued per session before the session is dropped as too slow
    pub max_outgoing: usize,
    /// Bound on the worker queue; `None` is unbounded
    pub queue_capacity: Option<usize>,
    /// Maximum concurrent connections (listeners not counted)
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:4433".to_string()],
            workers: 20,
            max_events: DEFAULT_MAX_EVENTS,
            handshake_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(60)),
            max_outgoing: 64,
            queue_capacity: None,
            max_sessions: 10_000,
        }
    }
}
