//! Per-user turn rate limiter.
//!
//! Fixed one-minute window per user bounding the number of turns, plus a
//! cap on how many conversations a user may have open at once. Each check
//! is an atomic check-and-increment under a `std::sync::Mutex` held briefly;
//! a rejected check does not consume quota.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dialoguard_config::RateLimitConfig;
use dialoguard_core::error::RateLimitError;
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);

/// Evict idle users once the map grows past this size.
const MAX_TRACKED_USERS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    requests: u32,
}

impl Window {
    fn fresh(now: Instant) -> Self {
        Self { started: now, requests: 0 }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u32,
    max_open_conversations: u32,
    users: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// A limit of zero disables that bound.
    pub fn new(requests_per_minute: u32, max_open_conversations: u32) -> Self {
        Self {
            requests_per_minute,
            max_open_conversations,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute, config.max_open_conversations)
    }

    /// Count one turn for `user_id`.
    pub fn check_request(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.check_at(user_id, None, Instant::now())
    }

    /// Count one turn that opens a new conversation while the user already
    /// has `open_now` conversations open.
    pub fn check_new_conversation(&self, user_id: &str, open_now: usize) -> Result<(), RateLimitError> {
        self.check_at(user_id, Some(open_now), Instant::now())
    }

    fn check_at(&self, user_id: &str, open_now: Option<usize>, now: Instant) -> Result<(), RateLimitError> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());

        if users.len() > MAX_TRACKED_USERS {
            users.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }

        let window = users.entry(user_id.to_string()).or_insert_with(|| Window::fresh(now));
        if now.duration_since(window.started) >= WINDOW {
            *window = Window::fresh(now);
        }

        if self.requests_per_minute > 0 && window.requests >= self.requests_per_minute {
            warn!(user_id = %user_id, limit = self.requests_per_minute, "Request rate limit exceeded");
            return Err(RateLimitError::TooManyRequests {
                user_id: user_id.to_string(),
                limit: self.requests_per_minute,
            });
        }
        if let Some(open) = open_now
            && self.max_open_conversations > 0
            && open >= self.max_open_conversations as usize
        {
            warn!(user_id = %user_id, open, limit = self.max_open_conversations, "Open conversation limit reached");
            return Err(RateLimitError::TooManyConversations {
                user_id: user_id.to_string(),
                limit: self.max_open_conversations,
            });
        }

        window.requests += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_bounded_per_window() {
        let limiter = RateLimiter::new(2, 10);
        assert!(limiter.check_request("u1").is_ok());
        assert!(limiter.check_request("u1").is_ok());
        assert_eq!(
            limiter.check_request("u1"),
            Err(RateLimitError::TooManyRequests {
                user_id: "u1".into(),
                limit: 2
            })
        );
        // Other users have their own window
        assert!(limiter.check_request("u2").is_ok());
    }

    #[test]
    fn open_conversations_bounded_separately() {
        let limiter = RateLimiter::new(10, 1);
        assert!(limiter.check_new_conversation("u1", 0).is_ok());
        assert!(matches!(
            limiter.check_new_conversation("u1", 1),
            Err(RateLimitError::TooManyConversations { limit: 1, .. })
        ));
        // Turns in existing conversations still pass
        assert!(limiter.check_request("u1").is_ok());
    }

    #[test]
    fn open_bound_holds_across_windows() {
        let limiter = RateLimiter::new(0, 2);
        let start = Instant::now();
        for minute in 0..5u64 {
            let now = start + Duration::from_secs(61 * minute);
            // Two conversations are still open from earlier minutes
            assert!(matches!(
                limiter.check_at("u1", Some(2), now),
                Err(RateLimitError::TooManyConversations { limit: 2, .. })
            ));
        }
        // Closing one frees a slot
        assert!(limiter.check_at("u1", Some(1), start).is_ok());
    }

    #[test]
    fn rejected_check_consumes_nothing() {
        let limiter = RateLimiter::new(2, 1);
        limiter.check_new_conversation("u1", 0).unwrap();
        assert!(limiter.check_new_conversation("u1", 1).is_err());
        // The rejected conversation did not count as a request
        assert!(limiter.check_request("u1").is_ok());
        assert!(limiter.check_request("u1").is_err());
    }

    #[test]
    fn window_resets_after_a_minute() {
        let limiter = RateLimiter::new(1, 0);
        let start = Instant::now();
        limiter.check_at("u1", Some(0), start).unwrap();
        assert!(limiter.check_at("u1", None, start + Duration::from_secs(59)).is_err());
        assert!(limiter.check_at("u1", Some(1), start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn zero_disables_a_bound() {
        let limiter = RateLimiter::new(0, 0);
        for open in 0..100 {
            limiter.check_new_conversation("u1", open).unwrap();
        }
    }
}
