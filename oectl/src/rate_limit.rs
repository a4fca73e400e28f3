//! In-memory admission control across request, token, and cost dimensions.
//!
//! Usage is counted per (API key, agent scope) in fixed time-aligned buckets:
//! one counter per dimension per rolling window (minute/hour/day). Buckets are
//! non-overlapping — a request at 12:00:59 and one at 12:01:01 land in
//! different minute buckets.
//!
//! The requests dimension is enforced before work is dispatched: the counter
//! is incremented only when the projected value stays within every configured
//! ceiling. Token and cost usage is only known after execution, so those
//! dimensions are recorded post-hoc via [`RateLimiter::record_usage`] and the
//! admission check merely rejects callers whose recorded usage already sits at
//! or above a ceiling. Enforcement for tokens/cost is therefore soft — at most
//! one request late.
//!
//! All checks and mutations for one call happen under a single lock, so two
//! concurrent requests can never both pass a check against the same stale
//! count. Critical sections are CPU-only; no I/O happens under the lock.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;

use crate::config::{RateLimitPolicy, RateLimitsConfig};

/// Tolerance absorbing floating point drift when comparing usage to a limit.
const EPSILON: f64 = 1e-9;

/// Rolling windows evaluated for every dimension, in check order.
const WINDOWS: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

/// Measured quantities, in check order.
const DIMENSIONS: [Dimension; 3] = [Dimension::Requests, Dimension::Tokens, Dimension::Cost];

/// A fixed-length counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn seconds(&self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3600,
            Window::Day => 86400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A measured usage quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Requests,
    Tokens,
    Cost,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Requests => "requests",
            Dimension::Tokens => "tokens",
            Dimension::Cost => "cost",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter identity for one key/scope/dimension/window bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    api_key_id: String,
    agent: String,
    dimension: Dimension,
    window: Window,
    bucket_start: u64,
}

impl CounterKey {
    fn new(api_key_id: &str, agent: &str, dimension: Dimension, window: Window, now: f64) -> Self {
        let seconds = window.seconds();
        let bucket_start = (now as u64 / seconds) * seconds;
        Self {
            api_key_id: api_key_id.to_string(),
            agent: agent.to_string(),
            dimension,
            window,
            bucket_start,
        }
    }
}

/// Result of a single rate-limit check, for allow/deny signaling and response
/// headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Dimension that triggered a denial, or the one surfaced in headers
    pub dimension: Dimension,
    pub window: Window,
    pub limit: f64,
    pub used: f64,
    pub remaining: f64,
    /// Epoch seconds when the triggering bucket rolls over
    pub reset_at: u64,
    /// Seconds the caller should wait before retrying; zero when allowed
    pub retry_after_seconds: u64,
    pub detail: String,
}

struct UsageState {
    usage: HashMap<CounterKey, f64>,
    last_cleanup: Instant,
}

/// Tracks usage in-memory and evaluates per-key rate limits.
///
/// One instance is constructed at startup and shared by handle; all state
/// lives behind a single mutex.
pub struct RateLimiter {
    config: RateLimitsConfig,
    state: Mutex<UsageState>,
    max_window_seconds: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(UsageState {
                usage: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            max_window_seconds: WINDOWS.iter().map(Window::seconds).max().unwrap_or(86400),
        }
    }

    /// Whether rate limiting is enabled.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Evaluate request/token/cost limits and consume one request if allowed.
    ///
    /// Returns `None` when rate limiting is disabled or no request window is
    /// configured for the resolved policy; otherwise a decision suitable for
    /// deny/allow signaling and response headers.
    pub fn consume_request(&self, api_key_id: &str, agent: &str) -> Option<RateLimitDecision> {
        if !self.enabled() {
            return None;
        }

        let mut state = self.state.lock();
        let now = unix_now();
        self.cleanup_if_needed(&mut state, now);
        let policy = self.config.policy_for(agent);

        // Validate all dimensions before mutating counters.
        for dimension in DIMENSIONS {
            let increment = if dimension == Dimension::Requests { 1.0 } else { 0.0 };
            if let Some(denied) =
                first_exceeded_limit(&state.usage, api_key_id, agent, &policy, dimension, increment, now)
            {
                tracing::debug!(
                    api_key_id,
                    agent,
                    dimension = %denied.dimension,
                    window = %denied.window,
                    limit = denied.limit,
                    used = denied.used,
                    "Rate limit exceeded"
                );
                return Some(denied);
            }
        }

        // Consume request counters across all configured request windows.
        for (window, _limit) in configured_limits(&policy, Dimension::Requests) {
            let key = CounterKey::new(api_key_id, agent, Dimension::Requests, window, now);
            *state.usage.entry(key).or_insert(0.0) += 1.0;
        }

        primary_request_decision(&state.usage, api_key_id, agent, &policy, now)
    }

    /// Record post-execution token/cost usage for future enforcement.
    ///
    /// No-op when rate limiting is disabled or both amounts are zero.
    pub fn record_usage(&self, api_key_id: &str, agent: &str, tokens: u64, estimated_cost: f64) {
        if !self.enabled() {
            return;
        }

        let token_increment = tokens as f64;
        let cost_increment = estimated_cost.max(0.0);
        if token_increment == 0.0 && cost_increment == 0.0 {
            return;
        }

        let mut state = self.state.lock();
        let now = unix_now();
        self.cleanup_if_needed(&mut state, now);
        let policy = self.config.policy_for(agent);

        if token_increment > 0.0 {
            increment_dimension(
                &mut state.usage,
                api_key_id,
                agent,
                &policy,
                Dimension::Tokens,
                token_increment,
                now,
            );
        }
        if cost_increment > 0.0 {
            increment_dimension(
                &mut state.usage,
                api_key_id,
                agent,
                &policy,
                Dimension::Cost,
                cost_increment,
                now,
            );
        }
    }

    /// Build HTTP headers describing current limit state.
    pub fn build_headers(decision: &RateLimitDecision) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            numeric_header(format_limit_number(decision.limit)),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            numeric_header(format_limit_number(decision.remaining)),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            numeric_header(decision.reset_at.to_string()),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-dimension"),
            HeaderValue::from_static(decision.dimension.as_str()),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-window"),
            HeaderValue::from_static(decision.window.as_str()),
        );
        if !decision.allowed {
            headers.insert(
                HeaderName::from_static("retry-after"),
                numeric_header(decision.retry_after_seconds.to_string()),
            );
        }
        headers
    }

    /// Evicts buckets that expired more than the largest window ago. Runs at
    /// most once per configured interval, piggybacked on regular calls so no
    /// dedicated sweeper task is needed.
    fn cleanup_if_needed(&self, state: &mut UsageState, now: f64) {
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds);
        if state.last_cleanup.elapsed() < interval {
            return;
        }

        let cutoff = (now as u64).saturating_sub(self.max_window_seconds);
        let before = state.usage.len();
        state
            .usage
            .retain(|key, _| key.bucket_start + key.window.seconds() >= cutoff);

        let swept = before - state.usage.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = state.usage.len(), "Swept stale rate-limit buckets");
        }
        state.last_cleanup = Instant::now();
    }
}

/// Returns a denial for the first configured window whose ceiling the call
/// would break, in stable minute/hour/day order. `increment` is 1 for the
/// requests dimension and 0 for tokens/cost, where only already-recorded
/// usage can be checked.
fn first_exceeded_limit(
    usage: &HashMap<CounterKey, f64>,
    api_key_id: &str,
    agent: &str,
    policy: &RateLimitPolicy,
    dimension: Dimension,
    increment: f64,
    now: f64,
) -> Option<RateLimitDecision> {
    for (window, limit) in configured_limits(policy, dimension) {
        let key = CounterKey::new(api_key_id, agent, dimension, window, now);
        let used = usage.get(&key).copied().unwrap_or(0.0);
        let exceeded = if increment == 0.0 {
            used >= limit - EPSILON
        } else {
            used + increment > limit + EPSILON
        };
        if exceeded {
            let reset_at = key.bucket_start + window.seconds();
            let retry_after_seconds = ((reset_at as f64 - now).ceil() as u64).max(1);
            return Some(RateLimitDecision {
                allowed: false,
                dimension,
                window,
                limit,
                used,
                remaining: (limit - used).max(0.0),
                reset_at,
                retry_after_seconds,
                detail: format!("Rate limit exceeded for {dimension} per {window}"),
            });
        }
    }
    None
}

/// Picks the allowed-decision surfaced in response headers: the configured
/// requests window with the smallest remaining-to-limit ratio. The tightest
/// margin is the most informative, not necessarily the shortest window.
fn primary_request_decision(
    usage: &HashMap<CounterKey, f64>,
    api_key_id: &str,
    agent: &str,
    policy: &RateLimitPolicy,
    now: f64,
) -> Option<RateLimitDecision> {
    let mut best: Option<RateLimitDecision> = None;
    let mut best_score = f64::INFINITY;

    for (window, limit) in configured_limits(policy, Dimension::Requests) {
        let key = CounterKey::new(api_key_id, agent, Dimension::Requests, window, now);
        let used = usage.get(&key).copied().unwrap_or(0.0);
        let remaining = (limit - used).max(0.0);
        let score = if limit > 0.0 { remaining / limit } else { 0.0 };

        if score < best_score {
            best_score = score;
            best = Some(RateLimitDecision {
                allowed: true,
                dimension: Dimension::Requests,
                window,
                limit,
                used,
                remaining,
                reset_at: key.bucket_start + window.seconds(),
                retry_after_seconds: 0,
                detail: "Rate limit check passed".to_string(),
            });
        }
    }

    best
}

fn increment_dimension(
    usage: &mut HashMap<CounterKey, f64>,
    api_key_id: &str,
    agent: &str,
    policy: &RateLimitPolicy,
    dimension: Dimension,
    amount: f64,
    now: f64,
) {
    for (window, _limit) in configured_limits(policy, dimension) {
        let key = CounterKey::new(api_key_id, agent, dimension, window, now);
        *usage.entry(key).or_insert(0.0) += amount;
    }
}

/// The configured (window, limit) pairs for one dimension, in stable window
/// order. Windows with no ceiling are skipped entirely.
fn configured_limits(policy: &RateLimitPolicy, dimension: Dimension) -> Vec<(Window, f64)> {
    let raw: [(Window, Option<f64>); 3] = match dimension {
        Dimension::Requests => [
            (Window::Minute, policy.requests_per_minute.map(|v| v as f64)),
            (Window::Hour, policy.requests_per_hour.map(|v| v as f64)),
            (Window::Day, policy.requests_per_day.map(|v| v as f64)),
        ],
        Dimension::Tokens => [
            (Window::Minute, policy.tokens_per_minute.map(|v| v as f64)),
            (Window::Hour, policy.tokens_per_hour.map(|v| v as f64)),
            (Window::Day, policy.tokens_per_day.map(|v| v as f64)),
        ],
        Dimension::Cost => [
            (Window::Minute, policy.cost_per_minute),
            (Window::Hour, policy.cost_per_hour),
            (Window::Day, policy.cost_per_day),
        ],
    };

    raw.into_iter()
        .filter_map(|(window, limit)| limit.map(|limit| (window, limit)))
        .collect()
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64()
}

fn numeric_header(value: String) -> HeaderValue {
    HeaderValue::from_str(&value).expect("numeric header value")
}

/// Whole numbers render without a fraction; fractional values trim trailing
/// zeros (e.g. 0.500000 -> "0.5").
fn format_limit_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let formatted = format!("{value:.6}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitPolicy, RateLimitsConfig};

    fn limiter_with_default(policy: RateLimitPolicy) -> RateLimiter {
        RateLimiter::new(RateLimitsConfig {
            enabled: true,
            default: policy,
            agents: Default::default(),
            cleanup_interval_seconds: 300,
        })
    }

    fn requests_counted(limiter: &RateLimiter, api_key_id: &str) -> f64 {
        let state = limiter.state.lock();
        state
            .usage
            .iter()
            .filter(|(key, _)| key.api_key_id == api_key_id && key.dimension == Dimension::Requests)
            .map(|(_, used)| used)
            .copied()
            .next()
            .unwrap_or(0.0)
    }

    #[test]
    fn per_key_request_limits() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(1),
            ..RateLimitPolicy::default()
        });

        let first = limiter.consume_request("key-1", "chat").unwrap();
        let second = limiter.consume_request("key-1", "chat").unwrap();
        let other_key = limiter.consume_request("key-2", "chat").unwrap();

        assert!(first.allowed);
        assert!(!second.allowed);
        assert!(other_key.allowed);
    }

    #[test]
    fn denied_request_does_not_consume() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(1),
            ..RateLimitPolicy::default()
        });

        assert!(limiter.consume_request("key-1", "chat").unwrap().allowed);
        assert!(!limiter.consume_request("key-1", "chat").unwrap().allowed);
        assert!(!limiter.consume_request("key-1", "chat").unwrap().allowed);

        // Only the single admitted request is counted.
        assert_eq!(requests_counted(&limiter, "key-1"), 1.0);
    }

    #[test]
    fn usage_never_exceeds_limit() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(3),
            ..RateLimitPolicy::default()
        });

        for _ in 0..5 {
            limiter.consume_request("key-1", "chat");
        }

        let counted = requests_counted(&limiter, "key-1");
        assert!(counted <= 3.0 + EPSILON);
        assert_eq!(counted, 3.0);
    }

    #[test]
    fn token_and_cost_limits_deny_at_threshold() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(10),
            tokens_per_day: Some(3),
            cost_per_day: Some(1.0),
            ..RateLimitPolicy::default()
        });

        // Recording exactly the ceiling is enough to block the next request.
        limiter.record_usage("token-key", "research", 3, 0.0);
        let token_block = limiter.consume_request("token-key", "research").unwrap();
        assert!(!token_block.allowed);
        assert_eq!(token_block.dimension, Dimension::Tokens);
        assert_eq!(token_block.window, Window::Day);

        limiter.record_usage("cost-key", "research", 0, 1.0);
        let cost_block = limiter.consume_request("cost-key", "research").unwrap();
        assert!(!cost_block.allowed);
        assert_eq!(cost_block.dimension, Dimension::Cost);
    }

    #[test]
    fn record_usage_with_zero_amounts_is_noop() {
        let limiter = limiter_with_default(RateLimitPolicy {
            tokens_per_day: Some(100),
            cost_per_day: Some(10.0),
            ..RateLimitPolicy::default()
        });

        limiter.record_usage("key-1", "chat", 0, 0.0);
        assert!(limiter.state.lock().usage.is_empty());

        // Negative cost clamps to zero as well.
        limiter.record_usage("key-1", "chat", 0, -5.0);
        assert!(limiter.state.lock().usage.is_empty());
    }

    #[test]
    fn agent_override_inherits_unset_fields() {
        let mut config = RateLimitsConfig {
            enabled: true,
            default: RateLimitPolicy {
                requests_per_minute: Some(10),
                tokens_per_day: Some(5),
                ..RateLimitPolicy::default()
            },
            agents: Default::default(),
            cleanup_interval_seconds: 300,
        };
        config.agents.insert(
            "chat".to_string(),
            RateLimitPolicy {
                requests_per_minute: Some(1),
                ..RateLimitPolicy::default()
            },
        );
        let limiter = RateLimiter::new(config);

        // Override applies to chat only.
        assert!(limiter.consume_request("key-1", "chat").unwrap().allowed);
        assert!(!limiter.consume_request("key-1", "chat").unwrap().allowed);
        assert!(limiter.consume_request("key-1", "research").unwrap().allowed);
        assert!(limiter.consume_request("key-1", "research").unwrap().allowed);

        // The token ceiling is inherited from the default policy.
        limiter.record_usage("key-2", "chat", 5, 0.0);
        let blocked = limiter.consume_request("key-2", "chat").unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.dimension, Dimension::Tokens);
    }

    #[test]
    fn primary_decision_surfaces_tightest_window() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(2),
            requests_per_hour: Some(100),
            ..RateLimitPolicy::default()
        });

        let decision = limiter.consume_request("key-1", "chat").unwrap();
        assert!(decision.allowed);
        // 1/2 remaining in the minute beats 99/100 in the hour.
        assert_eq!(decision.window, Window::Minute);
        assert_eq!(decision.limit, 2.0);
        assert_eq!(decision.remaining, 1.0);
    }

    #[test]
    fn denial_metadata_points_at_reset() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(1),
            ..RateLimitPolicy::default()
        });

        limiter.consume_request("key-1", "chat");
        let denied = limiter.consume_request("key-1", "chat").unwrap();

        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds >= 1);
        assert!(denied.reset_at as f64 > unix_now() - 1.0);
        assert_eq!(denied.remaining, 0.0);
        assert_eq!(denied.detail, "Rate limit exceeded for requests per minute");
    }

    #[test]
    fn disabled_limiter_returns_none_and_records_nothing() {
        let limiter = RateLimiter::new(RateLimitsConfig {
            enabled: false,
            ..RateLimitsConfig::default()
        });

        assert!(limiter.consume_request("key-1", "chat").is_none());
        limiter.record_usage("key-1", "chat", 100, 1.0);
        assert!(limiter.state.lock().usage.is_empty());
    }

    #[test]
    fn no_configured_request_windows_yields_no_decision() {
        let limiter = limiter_with_default(RateLimitPolicy::default());
        assert!(limiter.consume_request("key-1", "chat").is_none());
        assert!(limiter.state.lock().usage.is_empty());
    }

    #[test]
    fn cleanup_sweeps_expired_buckets() {
        let limiter = RateLimiter::new(RateLimitsConfig {
            enabled: true,
            default: RateLimitPolicy {
                requests_per_minute: Some(10),
                ..RateLimitPolicy::default()
            },
            agents: Default::default(),
            // Sweep on every call.
            cleanup_interval_seconds: 0,
        });

        let stale = CounterKey {
            api_key_id: "key-1".to_string(),
            agent: "chat".to_string(),
            dimension: Dimension::Requests,
            window: Window::Minute,
            bucket_start: 0,
        };
        limiter.state.lock().usage.insert(stale.clone(), 5.0);

        limiter.consume_request("key-1", "chat");

        let state = limiter.state.lock();
        assert!(!state.usage.contains_key(&stale));
        // The freshly consumed bucket survives the sweep.
        assert_eq!(
            state
                .usage
                .iter()
                .filter(|(key, _)| key.dimension == Dimension::Requests)
                .count(),
            1
        );
    }

    #[test]
    fn headers_describe_decision() {
        let limiter = limiter_with_default(RateLimitPolicy {
            requests_per_minute: Some(1),
            ..RateLimitPolicy::default()
        });

        let allowed = limiter.consume_request("key-1", "chat").unwrap();
        let headers = RateLimiter::build_headers(&allowed);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-dimension").unwrap(), "requests");
        assert_eq!(headers.get("x-ratelimit-window").unwrap(), "minute");
        assert!(headers.get("retry-after").is_none());
        assert_eq!(
            headers.get("x-ratelimit-reset").unwrap(),
            allowed.reset_at.to_string().as_str()
        );

        let denied = limiter.consume_request("key-1", "chat").unwrap();
        let headers = RateLimiter::build_headers(&denied);
        assert!(headers.get("retry-after").is_some());
    }

    #[test]
    fn limit_numbers_format_trimmed() {
        assert_eq!(format_limit_number(10.0), "10");
        assert_eq!(format_limit_number(0.5), "0.5");
        assert_eq!(format_limit_number(1.25), "1.25");
        assert_eq!(format_limit_number(1000000.0), "1000000");
    }
}
