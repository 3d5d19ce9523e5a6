//! Local token bucket plus server-header-driven pacing.
//!
//! The bucket enforces the configured steady-state budget. On top of that,
//! every response's `X-Ratelimit-*` headers feed back into the limiter: when
//! the remaining server budget drops below the proactive threshold the
//! refill rate shrinks to spread what is left across the reset window, and a
//! 429 pauses token issuance outright until the window resets.

use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

pub(crate) const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const HEADER_RESET: &str = "x-ratelimit-reset";
pub(crate) const HEADER_USED: &str = "x-ratelimit-used";

/// Reset intervals beyond this are treated as header noise.
const MAX_RESET_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Fallback pause after a 429 that carried no usable reset header.
const FALLBACK_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Steady-state local cap, in requests per minute.
    pub requests_per_minute: u32,
    /// Bucket capacity: how many requests may burst back-to-back.
    pub burst: u32,
    /// Remaining server budget at which proactive throttling kicks in.
    pub proactive_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst: 10,
            proactive_threshold: 10.0,
        }
    }
}

/// Last server-reported budget, as read from response headers.
#[derive(Debug, Clone, Copy, Default)]
struct ServerSnapshot {
    remaining: Option<f64>,
    used: Option<f64>,
    reset_at: Option<Instant>,
}

/// Read-only view of the limiter for callers and log events.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub remaining: Option<f64>,
    pub used: Option<f64>,
    pub reset_in: Option<Duration>,
    pub throttled: bool,
    pub paused: bool,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    pause_until: Option<Instant>,
    throttled: bool,
    snapshot: ServerSnapshot,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    base_rate: f64,
    threshold: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        let base_rate = f64::from(config.requests_per_minute.max(1)) / 60.0;
        Self {
            capacity,
            base_rate,
            threshold: config.proactive_threshold,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refill_rate: base_rate,
                last_refill: Instant::now(),
                pause_until: None,
                throttled: false,
                snapshot: ServerSnapshot::default(),
            }),
        }
    }

    /// Suspend until one request token is issued. Never fails; dropping the
    /// future is the way to cancel the wait.
    pub async fn wait(&self) {
        loop {
            let wait_for = {
                let mut state = self.state.lock().await;
                match Self::try_take(&mut state, self.capacity, self.base_rate, Instant::now()) {
                    Ok(()) => return,
                    Err(wait_for) => wait_for,
                }
            };
            sleep(wait_for).await;
        }
    }

    fn try_take(
        state: &mut BucketState,
        capacity: f64,
        base_rate: f64,
        now: Instant,
    ) -> Result<(), Duration> {
        if let Some(until) = state.pause_until {
            if now < until {
                return Err(until - now);
            }
            state.pause_until = None;
            state.refill_rate = base_rate;
            state.throttled = false;
        }

        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * state.refill_rate).min(capacity);
        state.last_refill = now;

        // The observed window has passed: back to the configured rate.
        if state.throttled && state.snapshot.reset_at.map_or(true, |reset| now >= reset) {
            state.refill_rate = base_rate;
            state.throttled = false;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - state.tokens) / state.refill_rate,
            ))
        }
    }

    /// Fold a response's rate-limit headers into the pacing state. Missing
    /// or malformed headers leave the state untouched.
    pub async fn observe(&self, headers: &HeaderMap) {
        let remaining = parse_float(headers, HEADER_REMAINING);
        let used = parse_float(headers, HEADER_USED);
        let reset_in = reset_interval(headers);
        if remaining.is_none() && used.is_none() && reset_in.is_none() {
            return;
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        if remaining.is_some() {
            state.snapshot.remaining = remaining;
        }
        if used.is_some() {
            state.snapshot.used = used;
        }
        if let Some(reset_in) = reset_in {
            state.snapshot.reset_at = Some(now + reset_in);
        }

        if let (Some(remaining), Some(reset_at)) = (state.snapshot.remaining, state.snapshot.reset_at)
        {
            let window = reset_at.saturating_duration_since(now);
            if remaining < self.threshold && !window.is_zero() {
                let reduced = remaining.max(1.0) / window.as_secs_f64();
                if !state.throttled {
                    debug!(
                        remaining,
                        window_secs = window.as_secs_f64(),
                        rate = reduced,
                        "server budget low, throttling proactively"
                    );
                }
                state.refill_rate = reduced;
                state.throttled = true;
            } else if state.throttled && remaining >= self.threshold {
                debug!(remaining, "server budget recovered, restoring steady rate");
                state.refill_rate = self.base_rate;
                state.throttled = false;
            }
        }
    }

    /// The server answered 429: stop issuing tokens until the last observed
    /// reset instant (or a short fallback when none was reported).
    pub async fn note_too_many_requests(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let until = state
            .snapshot
            .reset_at
            .filter(|reset| *reset > now)
            .unwrap_or(now + FALLBACK_PAUSE);
        warn!(
            pause_secs = (until - now).as_secs_f64(),
            "server rate limit hit, pausing token issuance"
        );
        state.pause_until = Some(until);
    }

    pub async fn status(&self) -> RateLimitStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        RateLimitStatus {
            remaining: state.snapshot.remaining,
            used: state.snapshot.used,
            reset_in: state
                .snapshot
                .reset_at
                .map(|reset| reset.saturating_duration_since(now)),
            throttled: state.throttled,
            paused: state.pause_until.is_some_and(|until| until > now),
        }
    }
}

fn parse_float(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

// `X-Ratelimit-Reset` is seconds until the window resets, not an absolute
// timestamp. Negative or absurd values are ignored.
pub(crate) fn reset_interval(headers: &HeaderMap) -> Option<Duration> {
    parse_float(headers, HEADER_RESET)
        .map(Duration::from_secs_f64)
        .filter(|d| *d <= MAX_RESET_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};
    use tokio::time::timeout;

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn burst_capacity_is_honored() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            requests_per_minute: 60,
            burst: 5,
            proactive_threshold: 10.0,
        });

        for _ in 0..5 {
            timeout(Duration::from_millis(50), limiter.wait())
                .await
                .expect("burst acquisition should not block");
        }
        // Bucket is empty now; the next wait has to sit out a refill.
        assert!(timeout(Duration::from_millis(100), limiter.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        // 600/min = 10 tokens per second.
        let limiter = RateLimiter::new(&RateLimitConfig {
            requests_per_minute: 600,
            burst: 1,
            proactive_threshold: 10.0,
        });

        limiter.wait().await;
        timeout(Duration::from_millis(500), limiter.wait())
            .await
            .expect("one token should refill within half a second");
    }

    #[tokio::test]
    async fn malformed_headers_leave_state_untouched() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        limiter
            .observe(&headers(&[
                ("x-ratelimit-remaining", "not-a-number"),
                ("x-ratelimit-reset", "-5"),
                ("x-ratelimit-used", "NaN"),
            ]))
            .await;
        let status = limiter.status().await;
        assert_eq!(status.remaining, None);
        assert_eq!(status.used, None);
        assert_eq!(status.reset_in, None);
        assert!(!status.throttled);
    }

    #[tokio::test]
    async fn absurd_reset_window_is_ignored() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        limiter
            .observe(&headers(&[
                ("x-ratelimit-remaining", "5"),
                ("x-ratelimit-reset", "90000"),
            ]))
            .await;
        let status = limiter.status().await;
        assert_eq!(status.remaining, Some(5.0));
        assert_eq!(status.reset_in, None);
        assert!(!status.throttled);
    }

    #[tokio::test]
    async fn low_remaining_budget_throttles_and_recovers() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());

        limiter
            .observe(&headers(&[
                ("x-ratelimit-remaining", "3"),
                ("x-ratelimit-reset", "30"),
                ("x-ratelimit-used", "597"),
            ]))
            .await;
        let status = limiter.status().await;
        assert!(status.throttled);
        assert_eq!(status.remaining, Some(3.0));
        assert_eq!(status.used, Some(597.0));

        limiter
            .observe(&headers(&[
                ("x-ratelimit-remaining", "600"),
                ("x-ratelimit-reset", "60"),
            ]))
            .await;
        assert!(!limiter.status().await.throttled);
    }

    #[tokio::test]
    async fn too_many_requests_pauses_until_reset() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        limiter
            .observe(&headers(&[
                ("x-ratelimit-remaining", "5"),
                ("x-ratelimit-reset", "1"),
            ]))
            .await;
        limiter.note_too_many_requests().await;
        assert!(limiter.status().await.paused);

        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert!(!limiter.status().await.paused);
    }

    #[tokio::test]
    async fn pause_without_observed_reset_uses_fallback() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        limiter.note_too_many_requests().await;
        let status = limiter.status().await;
        assert!(status.paused);

        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
