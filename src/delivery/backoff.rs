use std::time::Duration;

use anyhow::bail;

/// Waiting times after each send of a reliable notice. After the last entry's wait runs out
///  without an ack, the notice's schedule is exhausted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackoffSchedule(Vec<Duration>);

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> anyhow::Result<BackoffSchedule> {
        if delays.is_empty() {
            bail!("backoff schedule must not be empty");
        }
        Ok(BackoffSchedule(delays))
    }

    /// 2, 2, 4, 4, 8 seconds
    pub fn standard() -> BackoffSchedule {
        BackoffSchedule([2, 2, 4, 4, 8]
            .into_iter()
            .map(Duration::from_secs)
            .collect())
    }

    /// number of sends before the schedule is exhausted
    pub fn max_sends(&self) -> usize {
        self.0.len()
    }

    /// the time to wait for an ack after the `num_sends`-th send (1-based)
    pub fn delay_after(&self, num_sends: usize) -> Option<Duration> {
        num_sends.checked_sub(1)
            .and_then(|idx| self.0.get(idx))
            .copied()
    }

    pub fn total(&self) -> Duration {
        self.0.iter().sum()
    }
}
