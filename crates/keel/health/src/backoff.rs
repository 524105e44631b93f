//! Exponential backoff between check attempts

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{HealthError, Result};
use crate::progress::{Progress, Reporter};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt
    #[serde(with = "duration_ms")]
    pub initial: Duration,

    /// Upper bound for a single delay
    #[serde(with = "duration_ms")]
    pub max: Duration,

    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
            multiplier: 1.5,
        }
    }
}

/// Delay sequence `initial, initial * m, initial * m^2, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.config.max);
        self.current = self
            .current
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max);
        delay
    }
}

/// Run `attempt` until it succeeds, the deadline passes or the reporter's
/// token is cancelled. Every failed attempt is reported as `CHECKING`.
pub(crate) async fn retry_within<T, F, Fut>(
    reporter: &Reporter,
    config: BackoffConfig,
    deadline: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = String::from("no attempt completed");
    let mut backoff = ExponentialBackoff::new(config);

    let work = async {
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_error = err.to_string();
                    if !reporter.send(Progress::Checking, Some(last_error.clone())).await {
                        return Err(HealthError::Cancelled);
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = reporter.cancelled() => Err(HealthError::Cancelled),
        result = tokio::time::timeout(deadline, work) => match result {
            Ok(result) => result,
            Err(_) => Err(HealthError::Timeout {
                timeout: deadline,
                last_error: String::new(),
            }),
        },
    };

    match outcome {
        Err(HealthError::Timeout { timeout, .. }) => Err(HealthError::Timeout { timeout, last_error }),
        other => other,
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            multiplier: 2.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_config_serializes_millis() {
        let json = serde_json::to_value(BackoffConfig::default()).unwrap();
        assert_eq!(json["initial"], 500);
        assert_eq!(json["max"], 5000);
    }
}
