use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Bounded retry schedule applied to a single manifest apply.
///
/// `max_attempts` counts every attempt including the first; a policy with
/// `max_attempts = 3` sleeps at most twice. No single delay, jitter
/// included, ever exceeds `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Upper bound of every delay; zero only pairs with a zero initial delay.
    pub cap: Duration,
    /// Fraction of each delay added as random slack, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            factor: 2.0,
            cap: Duration::from_secs(120),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Policy that retries immediately, used by dry runs and tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            cap: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.max_attempts == 0 {
            return Err(BackoffError::NoAttempts);
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(BackoffError::InvalidFactor(self.factor));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BackoffError::InvalidJitter(self.jitter));
        }
        if self.cap.is_zero() && !self.initial_delay.is_zero() {
            return Err(BackoffError::ZeroCap(self.initial_delay));
        }
        Ok(())
    }

    /// Returns a policy that passes [`validate`](Self::validate).
    ///
    /// Out-of-range fields are pulled back into range. A zero cap paired with
    /// a nonzero initial delay takes the default cap.
    pub fn clamped(&self) -> Self {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        let cap = if self.cap.is_zero() && !self.initial_delay.is_zero() {
            Self::default().cap
        } else {
            self.cap
        };
        Self {
            max_attempts: self.max_attempts.max(1),
            initial_delay: self.initial_delay,
            factor,
            cap,
            jitter,
        }
    }

    /// Delay before retry number `retry` (0 = the sleep after the first failure),
    /// without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(raw)
            .unwrap_or(Duration::MAX)
            .min(self.cap)
    }

    /// Starts a fresh schedule for one apply invocation.
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            policy: *self,
            retries: 0,
        }
    }
}

/// Per-invocation iterator over the sleeps between failed attempts.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    policy: BackoffPolicy,
    retries: u32,
}

impl BackoffSchedule {
    /// Number of sleeps handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.policy.max_attempts {
            return None;
        }
        let base = self.policy.base_delay(self.retries);
        self.retries += 1;
        Some(jittered(base, self.policy.jitter, self.policy.cap))
    }
}

fn jittered(base: Duration, jitter: f64, cap: Duration) -> Duration {
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let slack = rand::thread_rng().gen_range(0.0..=jitter);
    let extra = Duration::try_from_secs_f64(base.as_secs_f64() * slack).unwrap_or(Duration::MAX);
    base.checked_add(extra).unwrap_or(Duration::MAX).min(cap)
}

/// Validation failure for a backoff policy.
#[derive(Debug, Error, PartialEq)]
pub enum BackoffError {
    #[error("backoff must allow at least one attempt")]
    NoAttempts,
    #[error("backoff factor {0} must be >= 1")]
    InvalidFactor(f64),
    #[error("backoff jitter {0} must be within [0, 1]")]
    InvalidJitter(f64),
    #[error("backoff cap must be positive when the initial delay is {0:?}")]
    ZeroCap(Duration),
}
