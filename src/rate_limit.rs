//! Sliding-window attempt limiting for second-factor checks.

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
use uuid::Uuid;

use crate::identity::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// At most `max` failures inside any `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlidingWindow {
    max: u32,
    window: Duration,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }

    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Drop failures that fell out of the window and decide on what remains.
    pub fn evaluate(&self, failures: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> RateLimitDecision {
        while failures
            .front()
            .is_some_and(|first| now - *first >= self.window)
        {
            failures.pop_front();
        }
        if failures.len() >= self.max as usize {
            RateLimitDecision::Limited
        } else {
            RateLimitDecision::Allowed
        }
    }

    /// Record a failure at `now` and report whether the limit is now reached.
    pub fn record(&self, failures: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> RateLimitDecision {
        failures.push_back(now);
        self.evaluate(failures, now)
    }
}

/// Per-user failure tracking for inline step-up attempts.
pub struct AttemptLimiter {
    window: SlidingWindow,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<Uuid, VecDeque<DateTime<Utc>>>>,
}

impl AttemptLimiter {
    #[must_use]
    pub fn new(window: SlidingWindow, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            failures: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn check(&self, user_id: Uuid) -> RateLimitDecision {
        let now = self.clock.now();
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = failures.get_mut(&user_id) else {
            return RateLimitDecision::Allowed;
        };
        let decision = self.window.evaluate(entries, now);
        if entries.is_empty() {
            failures.remove(&user_id);
        }
        decision
    }

    /// Check the window and count this attempt under one lock. The attempt
    /// stays counted as a failure until `reset` clears it.
    pub fn register_attempt(&self, user_id: Uuid) -> RateLimitDecision {
        let now = self.clock.now();
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = failures.entry(user_id).or_default();
        if self.window.evaluate(entries, now) == RateLimitDecision::Limited {
            return RateLimitDecision::Limited;
        }
        entries.push_back(now);
        RateLimitDecision::Allowed
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn reset(&self, user_id: Uuid) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
    }
}
