//! Pacing between acquire attempts.

use std::time::Duration;

use rand::Rng;

/// A random delay in `[0, max]`.
pub(crate) fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let upper = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(rand::thread_rng().gen_range(0..=upper))
}

/// Sleep for a jittered delay so competing acquirers spread out.
pub(crate) async fn pause(max: Duration) {
    let delay = jitter(max);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bound() {
        let max = Duration::from_millis(3);
        for _ in 0..200 {
            assert!(jitter(max) <= max);
        }
    }

    #[test]
    fn zero_bound_disables_jitter() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
