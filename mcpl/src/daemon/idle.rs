//! Connection-count idle tracking.
//!
//! The daemon feeds this from session registration and removal. The
//! configured idle timeouts are informational for now: nothing consumes
//! [`IdleTracker::is_idle`] to trigger shutdown yet.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks whether an entity (the daemon, or one server) has been without
/// connections for longer than its timeout.
///
/// A fresh tracker starts the idle clock immediately: if no connection ever
/// arrives, it reports idle once the timeout elapses.
#[derive(Debug)]
pub struct IdleTracker {
    inner: Mutex<IdleState>,
    timeout: Duration,
}

#[derive(Debug)]
struct IdleState {
    connections: usize,
    idle_since: Option<Instant>,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        IdleTracker {
            timeout,
            inner: Mutex::new(IdleState {
                connections: 0,
                idle_since: Some(Instant::now()),
            }),
        }
    }

    pub fn connection_added(&self) {
        let mut state = self.inner.lock().expect("idle tracker lock poisoned");
        state.connections += 1;
        state.idle_since = None;
    }

    pub fn connection_removed(&self) {
        let mut state = self.inner.lock().expect("idle tracker lock poisoned");
        state.connections = state.connections.saturating_sub(1);
        if state.connections == 0 {
            state.idle_since = Some(Instant::now());
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock().expect("idle tracker lock poisoned");
        match state.idle_since {
            Some(since) if state.connections == 0 => since.elapsed() >= self.timeout,
            _ => false,
        }
    }

    /// How long the entity has been idle; zero while connections exist.
    pub fn idle_duration(&self) -> Duration {
        let state = self.inner.lock().expect("idle tracker lock poisoned");
        match state.idle_since {
            Some(since) if state.connections == 0 => since.elapsed(),
            _ => Duration::ZERO,
        }
    }
}
