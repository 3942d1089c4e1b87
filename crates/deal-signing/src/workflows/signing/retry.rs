use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// Caller-owned allowance for prepare attempts on one deal.
///
/// The first prepare call is free. Each later call spends a manual retry. Inside a
/// call, transient provider failures spend automatic refreshes with doubling backoff.
/// A refresh resumes the round, reusing an envelope the call already created. Once
/// both are gone the workflow fails with `MaxRetriesExceeded` and the budget refuses
/// further attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    max_manual: u32,
    max_auto: u32,
    manual_used: u32,
    auto_used: u32,
    attempts: u32,
    #[serde(with = "duration_millis")]
    backoff: Duration,
}

impl RetryBudget {
    pub fn new(max_manual: u32, max_auto: u32, backoff: Duration) -> Self {
        Self {
            max_manual,
            max_auto,
            manual_used: 0,
            auto_used: 0,
            attempts: 0,
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.manual_retries, config.auto_refreshes, config.backoff)
    }

    /// Registers a caller-initiated attempt. Returns false when no manual retry is left.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts == 0 {
            self.attempts = 1;
            return true;
        }
        if self.manual_used >= self.max_manual {
            return false;
        }
        self.manual_used += 1;
        self.attempts += 1;
        true
    }

    /// Spends one automatic refresh, returning the delay to wait before it.
    pub fn take_auto_refresh(&mut self) -> Option<Duration> {
        if self.auto_used >= self.max_auto {
            return None;
        }
        self.auto_used += 1;
        let factor = 1u32 << (self.auto_used - 1).min(16);
        Some(self.backoff.saturating_mul(factor))
    }

    pub fn manual_remaining(&self) -> u32 {
        self.max_manual.saturating_sub(self.manual_used)
    }

    pub fn auto_remaining(&self) -> u32 {
        self.max_auto.saturating_sub(self.auto_used)
    }

    /// No manual retry is left for a caller to spend.
    pub fn is_exhausted(&self) -> bool {
        self.attempts > 0 && self.manual_remaining() == 0
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
