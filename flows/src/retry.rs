use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Exponential backoff applied when the asset API reports an exhausted quota.
///
/// The delay before retry number `n` (zero based) is
/// `retry_delay * backoff_factor^n`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(7_500),
            backoff_factor: 2.0,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(retry_delay: Duration, backoff_factor: f64, max_retries: u32) -> Self {
        Self {
            retry_delay,
            backoff_factor,
            max_retries,
        }
    }

    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Sum of every delay slept before the error propagates.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|retries| self.delay_for(retries))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delays_double_with_default_factor() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, 5);
        let delays: Vec<u64> = (0..5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.total_delay(), Duration::from_secs(31));
    }

    #[test]
    fn default_matches_asset_api_quota_settings() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.retry_delay, Duration::from_millis(7_500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(15));
        assert_eq!(policy.max_retries, 5);
    }

    #[test]
    fn deserializes_delay_from_seconds() {
        let policy: BackoffPolicy =
            serde_yaml::from_str("retry_delay: 0.5\nbackoff_factor: 3\nmax_retries: 2\n")
                .expect("parse");
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_500));
    }
}
