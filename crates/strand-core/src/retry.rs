use std::time::Duration;

/// `base_ms * 2^attempt`, capped at `max_ms`.
pub fn exponential_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Scale a delay by a random factor in 0.8x..1.2x.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
}
