//! Resilience policies injected into proxy pools: retry with backoff and a
//! count-based circuit breaker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::spec::parse_duration;

/// Kind of a retry policy document.
pub const KIND_RETRY: &str = "Retry";
/// Kind of a circuit breaker policy document.
pub const KIND_CIRCUIT_BREAKER: &str = "CircuitBreaker";

/// A named resilience policy from a pipeline spec.
#[derive(Clone)]
pub enum ResiliencePolicy {
    Retry(std::sync::Arc<RetryPolicy>),
    CircuitBreaker(std::sync::Arc<CircuitBreaker>),
}

/// Build the policy map from the raw `resilience` documents of a pipeline.
pub fn build_policies(raw: &[serde_yaml::Value]) -> Result<HashMap<String, ResiliencePolicy>> {
    let mut policies = HashMap::new();
    for doc in raw {
        let kind = doc
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::spec("resilience policy is missing `kind`"))?;
        match kind {
            KIND_RETRY => {
                let spec: RetryPolicySpec = serde_yaml::from_value(doc.clone())?;
                spec.validate()?;
                let name = spec.name.clone();
                let policy = ResiliencePolicy::Retry(std::sync::Arc::new(RetryPolicy::new(spec)));
                if policies.insert(name.clone(), policy).is_some() {
                    return Err(Error::spec(format!("duplicate resilience policy {:?}", name)));
                }
            }
            KIND_CIRCUIT_BREAKER => {
                let spec: CircuitBreakerPolicySpec = serde_yaml::from_value(doc.clone())?;
                spec.validate()?;
                let name = spec.name.clone();
                let policy =
                    ResiliencePolicy::CircuitBreaker(std::sync::Arc::new(CircuitBreaker::new(spec)));
                if policies.insert(name.clone(), policy).is_some() {
                    return Err(Error::spec(format!("duplicate resilience policy {:?}", name)));
                }
            }
            other => {
                return Err(Error::spec(format!("unknown resilience kind {:?}", other)));
            }
        }
    }
    Ok(policies)
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Spec of a retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryPolicySpec {
    pub kind: String,
    pub name: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_wait_duration")]
    pub wait_duration: String,

    /// `constant` or `exponential`.
    #[serde(default = "default_backoff_policy")]
    pub back_off_policy: String,

    /// Cap for exponential backoff.
    #[serde(default)]
    pub max_wait_duration: Option<String>,

    /// Jitter as a fraction of the computed delay, in `[0, 1]`.
    #[serde(default)]
    pub randomization_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_wait_duration() -> String {
    "500ms".to_string()
}

fn default_backoff_policy() -> String {
    "constant".to_string()
}

impl RetryPolicySpec {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::spec("retry maxAttempts must be at least 1"));
        }
        match self.back_off_policy.as_str() {
            "constant" | "exponential" => {}
            other => {
                return Err(Error::spec(format!("unknown backOffPolicy {:?}", other)));
            }
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(Error::spec("randomizationFactor must be within [0, 1]"));
        }
        parse_duration(&self.wait_duration)?;
        if let Some(max) = &self.max_wait_duration {
            parse_duration(max)?;
        }
        Ok(())
    }
}

/// Compiled retry policy.
pub struct RetryPolicy {
    max_attempts: u32,
    wait: Duration,
    max_wait: Duration,
    exponential: bool,
    randomization_factor: f64,
}

impl RetryPolicy {
    pub fn new(spec: RetryPolicySpec) -> Self {
        let wait = parse_duration(&spec.wait_duration).unwrap_or(Duration::from_millis(500));
        let max_wait = spec
            .max_wait_duration
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .unwrap_or_else(|| wait.saturating_mul(32));
        Self {
            max_attempts: spec.max_attempts,
            wait,
            max_wait,
            exponential: spec.back_off_policy == "exponential",
            randomization_factor: spec.randomization_factor,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1 << 16);
            self.wait.saturating_mul(factor).min(self.max_wait)
        } else {
            self.wait
        };
        if self.randomization_factor <= 0.0 {
            return base;
        }
        let jitter_max = base.as_millis() as f64 * self.randomization_factor;
        let jitter = if jitter_max >= 1.0 {
            rand::thread_rng().gen_range(0.0..jitter_max)
        } else {
            0.0
        };
        base + Duration::from_millis(jitter as u64)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Spec of a circuit breaker policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CircuitBreakerPolicySpec {
    pub kind: String,
    pub name: String,

    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before a probe is allowed.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> String {
    "10s".to_string()
}

impl CircuitBreakerPolicySpec {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::spec("failureThreshold must be at least 1"));
        }
        parse_duration(&self.recovery_timeout)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Count-based circuit breaker: closed until `failure_threshold` consecutive
/// failures, then open for `recovery_timeout`, then a single half-open probe.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(spec: CircuitBreakerPolicySpec) -> Self {
        let recovery =
            parse_duration(&spec.recovery_timeout).unwrap_or(Duration::from_secs(10));
        Self {
            failure_threshold: spec.failure_threshold,
            recovery_timeout: recovery,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. Transitions open -> half-open when the
    /// recovery window has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }
}
