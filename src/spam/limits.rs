//! Shared state for the reputation path: a TTL cache and a fixed-window
//! call limiter. Both are owned by the spam engine and safe to share across
//! consumer tasks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Caps external lookups at `limit` per window. The window opens on the
/// first acquisition and every acquisition counts, including ones that end
/// up failing.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    opened_at: Option<Instant>,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = state
            .opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.window);
        if expired {
            state.opened_at = Some(now);
            state.count = 0;
        }
        state.count = state.count.saturating_add(1);
        state.count <= self.limit
    }
}

/// Phone → score cache with a fixed time-to-live.
pub struct ReputationCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (f64, Instant)>>,
}

impl ReputationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, phone: &str) -> Option<f64> {
        self.get_at(phone, Instant::now())
    }

    pub fn get_at(&self, phone: &str, now: Instant) -> Option<f64> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(phone) {
            Some(&(score, stored)) if now.saturating_duration_since(stored) < self.ttl => {
                Some(score)
            }
            Some(_) => {
                entries.remove(phone);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, phone: &str, score: f64) {
        self.insert_at(phone, score, Instant::now());
    }

    pub fn insert_at(&self, phone: &str, score: f64, now: Instant) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(phone.to_string(), (score, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_limit_calls_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(2)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(3)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(59)));
        // Window is anchored at the first call, not slid.
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn limiter_is_shared_across_threads() {
        let limiter = std::sync::Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..10).filter(|_| limiter.try_acquire()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
    }

    #[test]
    fn cache_entries_expire() {
        let cache = ReputationCache::new(Duration::from_secs(3600));
        let t0 = Instant::now();
        cache.insert_at("+15550001111", 0.4, t0);
        assert_eq!(cache.get_at("+15550001111", t0 + Duration::from_secs(3599)), Some(0.4));
        assert_eq!(cache.get_at("+15550001111", t0 + Duration::from_secs(3600)), None);
        assert_eq!(cache.get_at("+15550002222", t0), None);
    }
}
