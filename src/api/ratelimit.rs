//! Escalating lockouts for failed authentication.
//!
//! Two layers are consulted before any credential check: a per-source
//! failure counter and a global sliding window of failures. Both only ever
//! escalate; a success clears the caller's own counter and nothing else.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const MINUTE: Duration = Duration::from_secs(60);

/// `(failures, lock duration)`, ascending by failures.
const SOURCE_RULES: [(usize, Duration); 3] = [
    (5, MINUTE),
    (10, Duration::from_secs(5 * 60)),
    (20, Duration::from_secs(15 * 60)),
];

const GLOBAL_RULES: [(usize, Duration); 3] = [
    (100, Duration::from_secs(2 * 60)),
    (200, Duration::from_secs(10 * 60)),
    (500, Duration::from_secs(30 * 60)),
];

/// Failures older than this no longer count toward the global rules.
pub const GLOBAL_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Idle, unlocked sources are forgotten after this long.
pub const RETENTION: Duration = Duration::from_secs(30 * 60);

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Global,
    Source,
}

/// A rejected attempt: who is locked and for how much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lockout {
    pub scope: LockScope,
    pub remaining: Duration,
}

impl Lockout {
    /// `Retry-After` value: remaining seconds rounded up, plus one.
    pub fn retry_after_secs(&self) -> u64 {
        let whole = self.remaining.as_secs();
        let partial = u64::from(self.remaining.subsec_nanos() > 0);
        whole + partial + 1
    }
}

#[derive(Debug)]
struct AttemptInfo {
    fail_count: usize,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

#[derive(Debug, Default)]
struct State {
    sources: HashMap<String, AttemptInfo>,
    global_failures: VecDeque<Instant>,
    global_locked_until: Option<Instant>,
}

impl State {
    fn prune_global(&mut self, now: Instant) {
        while let Some(&oldest) = self.global_failures.front() {
            if now.saturating_duration_since(oldest) >= GLOBAL_WINDOW {
                self.global_failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Apply every satisfied rule in order; the lock only ever moves later.
fn escalate(
    count: usize,
    rules: &[(usize, Duration)],
    now: Instant,
    locked_until: &mut Option<Instant>,
) {
    for &(threshold, duration) in rules {
        if count >= threshold {
            let until = now + duration;
            if locked_until.map_or(true, |current| until > current) {
                *locked_until = Some(until);
            }
        }
    }
}

fn time_left(until: Option<Instant>, now: Instant) -> Option<Duration> {
    until
        .filter(|&until| until > now)
        .map(|until| until - now)
}

/// Shared failure bookkeeping for the auth gate.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `source` if the global lock or its own lock is active.
    /// The global lock is reported first.
    pub fn check(&self, source: &str) -> Result<(), Lockout> {
        self.check_at(source, Instant::now())
    }

    pub fn record_failure(&self, source: &str) {
        self.record_failure_at(source, Instant::now())
    }

    /// Clear `source`'s failure count and lock. The global window is kept.
    pub fn record_success(&self, source: &str) {
        self.state.lock().sources.remove(source);
    }

    /// Prune the global window and forget idle, unlocked sources.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now())
    }

    fn check_at(&self, source: &str, now: Instant) -> Result<(), Lockout> {
        let mut state = self.state.lock();
        state.prune_global(now);

        if let Some(remaining) = time_left(state.global_locked_until, now) {
            return Err(Lockout {
                scope: LockScope::Global,
                remaining,
            });
        }
        if let Some(remaining) = state
            .sources
            .get(source)
            .and_then(|info| time_left(info.locked_until, now))
        {
            return Err(Lockout {
                scope: LockScope::Source,
                remaining,
            });
        }
        Ok(())
    }

    fn record_failure_at(&self, source: &str, now: Instant) {
        let mut state = self.state.lock();

        let info = state
            .sources
            .entry(source.to_string())
            .or_insert_with(|| AttemptInfo {
                fail_count: 0,
                locked_until: None,
                last_failure: now,
            });
        info.fail_count += 1;
        info.last_failure = now;
        escalate(info.fail_count, &SOURCE_RULES, now, &mut info.locked_until);
        let source_failures = info.fail_count;

        state.global_failures.push_back(now);
        state.prune_global(now);
        let global_failures = state.global_failures.len();
        let mut global_locked_until = state.global_locked_until;
        escalate(global_failures, &GLOBAL_RULES, now, &mut global_locked_until);
        state.global_locked_until = global_locked_until;

        tracing::warn!(
            source,
            source_failures,
            global_failures,
            "authentication failure"
        );
    }

    fn cleanup_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.prune_global(now);
        let before = state.sources.len();
        state.sources.retain(|_, info| {
            time_left(info.locked_until, now).is_some()
                || now.saturating_duration_since(info.last_failure) < RETENTION
        });
        let dropped = before - state.sources.len();
        if dropped > 0 {
            tracing::debug!(dropped, "rate limiter dropped idle sources");
        }
    }

    /// Run [`cleanup`](Self::cleanup) every [`CLEANUP_INTERVAL`] until
    /// `shutdown` fires.
    pub fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.cleanup(),
                }
            }
        })
    }

    #[cfg(test)]
    fn source_failures(&self, source: &str) -> usize {
        self.state
            .lock()
            .sources
            .get(source)
            .map_or(0, |info| info.fail_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_n(rl: &RateLimiter, source: &str, n: usize, now: Instant) {
        for _ in 0..n {
            rl.record_failure_at(source, now);
        }
    }

    #[test]
    fn four_failures_do_not_lock() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        fail_n(&rl, "10.0.0.1", 4, now);
        assert!(rl.check_at("10.0.0.1", now).is_ok());
    }

    #[test]
    fn fifth_failure_locks_for_one_minute() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        fail_n(&rl, "10.0.0.1", 5, now);

        let lock = rl.check_at("10.0.0.1", now).unwrap_err();
        assert_eq!(lock.scope, LockScope::Source);
        assert_eq!(lock.remaining, MINUTE);
        assert_eq!(lock.retry_after_secs(), 61);

        let later = rl
            .check_at("10.0.0.1", now + Duration::from_millis(600))
            .unwrap_err();
        assert_eq!(later.remaining, Duration::from_millis(59_400));
        assert_eq!(later.retry_after_secs(), 61);

        assert!(rl.check_at("10.0.0.1", now + Duration::from_secs(59)).is_err());
        assert!(rl.check_at("10.0.0.1", now + MINUTE).is_ok());
        // Other sources are unaffected.
        assert!(rl.check_at("10.0.0.2", now).is_ok());
    }

    #[test]
    fn later_rules_fire_only_at_their_threshold() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        fail_n(&rl, "a", 9, t0);
        assert_eq!(rl.check_at("a", t0).unwrap_err().remaining, MINUTE);

        let t1 = t0 + Duration::from_secs(120);
        rl.record_failure_at("a", t1);
        assert_eq!(
            rl.check_at("a", t1).unwrap_err().remaining,
            Duration::from_secs(5 * 60)
        );

        fail_n(&rl, "a", 9, t1);
        assert_eq!(
            rl.check_at("a", t1).unwrap_err().remaining,
            Duration::from_secs(5 * 60)
        );
        rl.record_failure_at("a", t1);
        assert_eq!(
            rl.check_at("a", t1).unwrap_err().remaining,
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn lock_never_shrinks() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        fail_n(&rl, "a", 10, t0);
        // An 11th failure shortly after re-applies the 1m and 5m rules from
        // a later instant; expiry may move later, never earlier.
        let t1 = t0 + Duration::from_secs(30);
        rl.record_failure_at("a", t1);
        let remaining = rl.check_at("a", t1).unwrap_err().remaining;
        assert_eq!(remaining, Duration::from_secs(5 * 60));
    }

    #[test]
    fn success_resets_source_only() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        fail_n(&rl, "a", 20, now);
        fail_n(&rl, "b", 5, now);
        rl.record_success("a");

        assert_eq!(rl.source_failures("a"), 0);
        assert!(rl.check_at("a", now).is_ok());
        assert!(rl.check_at("b", now).is_err());
        assert_eq!(rl.state.lock().global_failures.len(), 25);
    }

    #[test]
    fn hundred_failures_lock_globally() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        for i in 0..100 {
            rl.record_failure_at(&format!("10.1.{}.{}", i / 250, i % 250), now);
        }
        let lock = rl.check_at("192.0.2.1", now).unwrap_err();
        assert_eq!(lock.scope, LockScope::Global);
        assert_eq!(lock.remaining, Duration::from_secs(2 * 60));
    }

    #[test]
    fn global_lock_is_reported_before_source_lock() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        fail_n(&rl, "noisy", 100, now);
        let lock = rl.check_at("noisy", now).unwrap_err();
        assert_eq!(lock.scope, LockScope::Global);
    }

    #[test]
    fn hundred_and_first_failure_keeps_global_lock() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        for i in 0..100 {
            rl.record_failure_at(&format!("s{i}"), t0);
        }
        let t1 = t0 + Duration::from_secs(10);
        rl.record_failure_at("late", t1);
        let lock = rl.check_at("x", t1).unwrap_err();
        // Still the 2-minute rule, re-applied from t1.
        assert_eq!(lock.remaining, Duration::from_secs(2 * 60));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        for i in 0..60 {
            rl.record_failure_at(&format!("old{i}"), t0);
        }
        let t1 = t0 + GLOBAL_WINDOW + Duration::from_secs(1);
        for i in 0..60 {
            rl.record_failure_at(&format!("new{i}"), t1);
        }
        assert!(rl.check_at("x", t1).is_ok());
        assert_eq!(rl.state.lock().global_failures.len(), 60);
    }

    #[test]
    fn cleanup_drops_idle_unlocked_sources() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        rl.record_failure_at("idle", t0);
        fail_n(&rl, "recent", 2, t0 + Duration::from_secs(20 * 60));

        rl.cleanup_at(t0 + RETENTION + Duration::from_secs(1));
        let state = rl.state.lock();
        assert!(!state.sources.contains_key("idle"));
        assert!(state.sources.contains_key("recent"));
        assert!(state.global_failures.is_empty());
    }

    #[test]
    fn cleanup_keeps_locked_sources() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        fail_n(&rl, "locked", 20, t0);
        rl.cleanup_at(t0 + Duration::from_secs(14 * 60));
        assert_eq!(rl.source_failures("locked"), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_stops_on_shutdown() {
        let rl = Arc::new(RateLimiter::new());
        let shutdown = CancellationToken::new();
        let task = rl.clone().spawn_cleanup(shutdown.clone());
        tokio::time::sleep(CLEANUP_INTERVAL * 2).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
