//! Per-session message rate limiting.
//!
//! Sliding window: a session may send `max_messages` within `window`. The
//! attempt that would exceed it blocks the session for `block`, and every
//! attempt during the block is refused with the time it ends.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::document::now_ms;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct SessionWindow {
    sent: VecDeque<u64>,
    blocked_until: u64,
}

impl SessionWindow {
    /// Still blocked, or sent something inside the window.
    fn is_live(&self, now: u64, window: u64) -> bool {
        self.blocked_until > now
            || self
                .sent
                .back()
                .is_some_and(|sent| now.saturating_sub(*sent) < window)
    }
}

/// Rate limiter keyed by session id.
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    block: Duration,
    sessions: Mutex<HashMap<String, SessionWindow>>,
}

impl Default for RateLimiter {
    /// 5 messages per minute, then a two minute block.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60), Duration::from_secs(120))
    }
}

impl RateLimiter {
    pub fn new(max_messages: usize, window: Duration, block: Duration) -> Self {
        Self {
            max_messages,
            window,
            block,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message from `session` now.
    pub async fn check(&self, session: &str) -> StoreResult<()> {
        self.check_at(session, now_ms()).await
    }

    /// Record a message from `session` at `now` (ms since epoch).
    pub async fn check_at(&self, session: &str, now: u64) -> StoreResult<()> {
        let window = self.window.as_millis() as u64;
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, state| state.is_live(now, window));
        let state = sessions.entry(session.to_string()).or_default();

        if state.blocked_until > now {
            return Err(StoreError::RateLimited {
                until: state.blocked_until,
            });
        }

        while state
            .sent
            .front()
            .is_some_and(|sent| now.saturating_sub(*sent) >= window)
        {
            state.sent.pop_front();
        }

        if state.sent.len() >= self.max_messages {
            let until = now + self.block.as_millis() as u64;
            state.blocked_until = until;
            log::warn!("Session {session} blocked for spamming until {until}");
            return Err(StoreError::RateLimited { until });
        }

        state.sent.push_back(now);
        Ok(())
    }

    /// Sessions currently remembered.
    pub async fn tracked_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Lift any block and forget the history of `session`.
    pub async fn reset(&self, session: &str) {
        self.sessions.lock().await.remove(session);
    }
}
