//! Exponential backoff for failed network calls
//!
//! Find and Fetch failures are tracked separately so a flaky Find endpoint
//! does not hold back list updates and the other way round.

use std::time::{Duration, Instant, SystemTime};
use threatmatch_db::{BackoffInfo, RetryInfo};
use tracing::debug;

/// Base delay before the first retry
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(15 * 60);

/// Upper bound on any backoff delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The network call a backoff applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Full hash lookups
    Find,
    /// Threat list updates
    Update,
}

/// Delay after `retries` consecutive failures.
///
/// `min(2^retries * 15 min * (1 + jitter), 24 h)` with `jitter` in `[0, 1)`.
pub fn backoff_delay(retries: u32, jitter: f64) -> Duration {
    let multiplier = (1u64 << retries.min(16)) as f64;
    let minutes = multiplier * (15.0 * (jitter.clamp(0.0, 1.0) + 1.0));
    let seconds = minutes.min(MAX_RETRY_DELAY.as_secs_f64() / 60.0) * 60.0;
    Duration::from_secs_f64(seconds)
}

#[derive(Debug, Clone, Default)]
struct RetryState {
    retries: u32,
    until: Option<Instant>,
}

impl RetryState {
    fn is_waiting(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    fn enter(&mut self, delay: Duration) -> Instant {
        let until = Instant::now() + delay;
        self.retries = self.retries.saturating_add(1);
        self.until = Some(until);
        until
    }

    /// Returns whether there was anything to clear
    fn reset(&mut self) -> bool {
        let was_set = self.retries > 0 || self.until.is_some();
        self.retries = 0;
        self.until = None;
        was_set
    }

    fn to_info(&self, now: Instant, wall_now: SystemTime) -> RetryInfo {
        RetryInfo {
            retries: self.retries,
            until: self
                .until
                .filter(|until| *until > now)
                .map(|until| wall_now + (until - now)),
        }
    }

    fn from_info(info: RetryInfo, now: Instant, wall_now: SystemTime) -> Self {
        Self {
            retries: info.retries,
            until: info
                .until
                .and_then(|until| until.duration_since(wall_now).ok())
                .map(|remaining| now + remaining),
        }
    }
}

/// Backoff state for both network calls
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    find: RetryState,
    update: RetryState,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild backoff from saved state. Windows that ended while the
    /// client was not running are dropped; retry counts carry over.
    pub fn from_info(info: BackoffInfo) -> Self {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        Self {
            find: RetryState::from_info(info.find, now, wall_now),
            update: RetryState::from_info(info.update, now, wall_now),
        }
    }

    /// Wall clock form of the current state, for saving
    pub fn to_info(&self) -> BackoffInfo {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        BackoffInfo {
            find: self.find.to_info(now, wall_now),
            update: self.update.to_info(now, wall_now),
        }
    }

    fn state(&self, operation: Operation) -> &RetryState {
        match operation {
            Operation::Find => &self.find,
            Operation::Update => &self.update,
        }
    }

    fn state_mut(&mut self, operation: Operation) -> &mut RetryState {
        match operation {
            Operation::Find => &mut self.find,
            Operation::Update => &mut self.update,
        }
    }

    /// Whether a Find call may be made now
    pub fn can_find(&self) -> bool {
        !self.find.is_waiting(Instant::now())
    }

    /// Whether a Fetch call may be made now
    pub fn can_update(&self) -> bool {
        !self.update.is_waiting(Instant::now())
    }

    /// Consecutive failures recorded for `operation`
    pub fn retries(&self, operation: Operation) -> u32 {
        self.state(operation).retries
    }

    /// End of the current backoff window, if any
    pub fn deadline(&self, operation: Operation) -> Option<Instant> {
        let state = self.state(operation);
        state.until.filter(|_| state.is_waiting(Instant::now()))
    }

    /// Record a failure with a random jitter and return the delay applied
    pub fn enter(&mut self, operation: Operation, server_wait: Option<Duration>) -> Duration {
        self.enter_with_jitter(operation, rand::random::<f64>(), server_wait)
    }

    /// Record a failure with an explicit jitter.
    ///
    /// A wait requested by the server (for example a rate limit's retry
    /// delay) is honoured when it is longer than the computed delay.
    pub fn enter_with_jitter(
        &mut self,
        operation: Operation,
        jitter: f64,
        server_wait: Option<Duration>,
    ) -> Duration {
        let state = self.state_mut(operation);
        let mut delay = backoff_delay(state.retries, jitter);
        if let Some(wait) = server_wait {
            delay = delay.max(wait);
        }
        state.enter(delay);
        debug!(
            "{:?} backoff after {} failures: {:?}",
            operation, state.retries, delay
        );
        delay
    }

    /// Hold off `operation` for `wait` without counting a failure
    pub fn defer(&mut self, operation: Operation, wait: Duration) {
        let state = self.state_mut(operation);
        let until = Instant::now() + wait;
        if state.until.is_none_or(|current| current < until) {
            state.until = Some(until);
        }
    }

    /// Clear the failure count after a successful call. Returns whether
    /// `operation` had been failing or deferred.
    pub fn reset(&mut self, operation: Operation) -> bool {
        self.state_mut(operation).reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANDOMS: [f64; 10] = [
        0.6046602879796196,
        0.9405090880450124,
        0.6645600532184904,
        0.4377141871869802,
        0.4246374970712657,
        0.6868230728671094,
        0.06563701921747622,
        0.15651925473279124,
        0.09696951891448456,
        0.30091186058528707,
    ];

    #[test]
    fn test_backoff_delay_first_retry() {
        let expected = [1444, 1746, 1498, 1293, 1282, 1518, 959, 1040, 987, 1170];
        for (jitter, secs) in RANDOMS.iter().zip(expected) {
            assert_eq!(backoff_delay(0, *jitter).as_secs(), secs);
        }
    }

    #[test]
    fn test_backoff_delay_fourth_retry() {
        let expected = [
            11553, 13971, 11984, 10351, 10257, 12145, 7672, 8326, 7898, 9366,
        ];
        for (jitter, secs) in RANDOMS.iter().zip(expected) {
            assert_eq!(backoff_delay(3, *jitter).as_secs(), secs);
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        assert_eq!(backoff_delay(7, 0.5), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(u32::MAX, 0.99), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(0, 0.0), BASE_RETRY_DELAY);
    }

    #[test]
    fn test_find_and_update_are_independent() {
        let mut backoff = Backoff::new();
        assert!(backoff.can_find());
        assert!(backoff.can_update());

        backoff.enter_with_jitter(Operation::Find, 0.0, None);
        assert!(!backoff.can_find());
        assert!(backoff.can_update());
        assert_eq!(backoff.retries(Operation::Find), 1);
        assert_eq!(backoff.retries(Operation::Update), 0);
        assert!(backoff.deadline(Operation::Find).is_some());
        assert!(backoff.deadline(Operation::Update).is_none());
    }

    #[test]
    fn test_retries_grow_delay_and_reset() {
        let mut backoff = Backoff::new();
        let first = backoff.enter_with_jitter(Operation::Update, 0.0, None);
        let second = backoff.enter_with_jitter(Operation::Update, 0.0, None);
        assert_eq!(second, first * 2);

        backoff.reset(Operation::Update);
        assert!(backoff.can_update());
        assert_eq!(backoff.retries(Operation::Update), 0);
    }

    #[test]
    fn test_defer_does_not_count_failure() {
        let mut backoff = Backoff::new();
        backoff.defer(Operation::Find, Duration::from_secs(60));
        assert!(!backoff.can_find());
        assert_eq!(backoff.retries(Operation::Find), 0);

        backoff.defer(Operation::Update, Duration::ZERO);
        assert!(backoff.can_update());
    }

    #[test]
    fn test_reset_reports_cleared_state() {
        let mut backoff = Backoff::new();
        assert!(!backoff.reset(Operation::Find));
        backoff.enter_with_jitter(Operation::Find, 0.0, None);
        assert!(backoff.reset(Operation::Find));
        assert!(!backoff.reset(Operation::Find));
    }

    #[test]
    fn test_saved_state_restores_window_and_retries() {
        let mut backoff = Backoff::new();
        backoff.enter_with_jitter(Operation::Update, 0.0, None);
        backoff.enter_with_jitter(Operation::Update, 0.0, None);

        let info = backoff.to_info();
        assert_eq!(info.update.retries, 2);
        assert!(info.update.until.is_some());
        assert_eq!(info.find, RetryInfo::default());

        let restored = Backoff::from_info(info);
        assert!(!restored.can_update());
        assert!(restored.can_find());
        assert_eq!(restored.retries(Operation::Update), 2);
        let remaining = restored
            .deadline(Operation::Update)
            .unwrap()
            .saturating_duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(29 * 60));
        assert!(remaining <= Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_expired_saved_window_is_dropped() {
        let info = BackoffInfo {
            find: RetryInfo {
                retries: 4,
                until: Some(SystemTime::now() - Duration::from_secs(60)),
            },
            update: RetryInfo::default(),
        };

        let restored = Backoff::from_info(info);
        assert!(restored.can_find());
        assert!(restored.deadline(Operation::Find).is_none());
        assert_eq!(restored.retries(Operation::Find), 4);
    }

    #[test]
    fn test_server_wait_extends_delay() {
        let mut backoff = Backoff::new();
        let delay = backoff.enter_with_jitter(
            Operation::Find,
            0.0,
            Some(Duration::from_secs(3 * 60 * 60)),
        );
        assert_eq!(delay, Duration::from_secs(3 * 60 * 60));
    }
}
