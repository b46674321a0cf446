//! Retry delay computation: fixed or exponential backoff with a cap.

use quiver_core::QueueConfig;

/// Delay before a message's next delivery attempt, given how many retries
/// it has already consumed.
///
/// With backoff disabled this is the configured base delay. With backoff
/// enabled the base delay is multiplied by `multiplier^retry_count` and
/// capped at `max_retry_delay_ms`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn retry_delay_ms(config: &QueueConfig, retry_count: u32) -> u64 {
    if !config.enable_retry_backoff {
        return config.retry_delay_ms;
    }
    let factor = config
        .retry_backoff_multiplier
        .max(1.0)
        .powi(i32::try_from(retry_count).unwrap_or(i32::MAX));
    let delay = (config.retry_delay_ms as f64) * factor;
    let cap = if config.max_retry_delay_ms == 0 {
        u64::MAX
    } else {
        config.max_retry_delay_ms
    };
    if delay >= cap as f64 {
        cap
    } else {
        delay as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, backoff: bool, multiplier: f64, cap: u64) -> QueueConfig {
        QueueConfig {
            retry_delay_ms: base,
            enable_retry_backoff: backoff,
            retry_backoff_multiplier: multiplier,
            max_retry_delay_ms: cap,
            ..QueueConfig::named("q")
        }
    }

    #[test]
    fn fixed_delay_ignores_retry_count() {
        let cfg = config(500, false, 2.0, 60_000);
        assert_eq!(retry_delay_ms(&cfg, 0), 500);
        assert_eq!(retry_delay_ms(&cfg, 10), 500);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let cfg = config(100, true, 2.0, 60_000);
        assert_eq!(retry_delay_ms(&cfg, 0), 100);
        assert_eq!(retry_delay_ms(&cfg, 1), 200);
        assert_eq!(retry_delay_ms(&cfg, 2), 400);
        assert_eq!(retry_delay_ms(&cfg, 3), 800);
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = config(1_000, true, 2.0, 5_000);
        assert_eq!(retry_delay_ms(&cfg, 10), 5_000);
    }

    #[test]
    fn zero_cap_means_uncapped() {
        let cfg = config(1, true, 2.0, 0);
        assert_eq!(retry_delay_ms(&cfg, 20), 1 << 20);
    }

    #[test]
    fn sub_one_multiplier_is_clamped() {
        let cfg = config(100, true, 0.5, 60_000);
        assert_eq!(retry_delay_ms(&cfg, 5), 100);
    }

    proptest::proptest! {
        #[test]
        fn backoff_is_nondecreasing_and_capped(
            base in 1u64..10_000,
            half_steps in 2u8..=8,
            cap in 1u64..1_000_000,
            retries in 0u32..20,
        ) {
            // Multipliers on half steps stay exactly representable, so the
            // monotonicity assertion is not at the mercy of rounding.
            let multiplier = f64::from(half_steps) / 2.0;
            let cfg = config(base, true, multiplier, cap);
            let delay = retry_delay_ms(&cfg, retries);
            let next = retry_delay_ms(&cfg, retries + 1);
            proptest::prop_assert!(next >= delay);
            proptest::prop_assert!(delay <= cap);
        }
    }
}
