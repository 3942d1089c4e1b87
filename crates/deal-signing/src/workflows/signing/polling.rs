use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::domain::DealKey;
use super::orchestrator::{ContractOrchestrator, StatusReport};
use crate::config::PollingConfig;

/// Shortest period a watcher will tick at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a polling loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The provider reported the envelope completed (or failed); no further checks run.
    Finished(StatusReport),
    Cancelled,
    /// A non-transient error ended the loop.
    Stopped { error: String },
}

/// Spawns per-deal status watchers on a fixed interval.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    orchestrator: ContractOrchestrator,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(orchestrator: ContractOrchestrator, config: &PollingConfig) -> Self {
        Self::with_interval(orchestrator, config.interval)
    }

    /// Intervals below `MIN_POLL_INTERVAL` are raised to it.
    pub fn with_interval(orchestrator: ContractOrchestrator, interval: Duration) -> Self {
        if interval < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "poll interval too short; using the minimum"
            );
        }
        let interval = interval.max(MIN_POLL_INTERVAL);
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts watching `deal`. The first check happens one interval from now. Dropping
    /// the returned handle cancels the watcher.
    pub fn watch(&self, deal: DealKey) -> PollHandle {
        let (stop, stopped) = oneshot::channel();
        let orchestrator = self.orchestrator.clone();
        let period = self.interval;
        let task_deal = deal.clone();
        let task = tokio::spawn(async move { poll_until_done(orchestrator, task_deal, period, stopped).await });

        PollHandle {
            deal,
            stop: Some(stop),
            task: Some(task),
        }
    }
}

async fn poll_until_done(
    orchestrator: ContractOrchestrator,
    deal: DealKey,
    period: Duration,
    mut stopped: oneshot::Receiver<()>,
) -> PollOutcome {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stopped => {
                debug!(deal = %deal, "status polling cancelled");
                return PollOutcome::Cancelled;
            }
            _ = ticker.tick() => {}
        }

        debug!(deal = %deal, "polling envelope status");
        match orchestrator.refresh_status(&deal).await {
            Ok(report) if report.completed || report.stage.is_failed() => {
                info!(
                    deal = %deal,
                    round = report.round.label(),
                    stage = report.stage.label(),
                    "status polling finished"
                );
                return PollOutcome::Finished(report);
            }
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                warn!(deal = %deal, error = %err, "status check failed; will retry next interval");
            }
            Err(err) => {
                warn!(deal = %deal, error = %err, "status polling stopped");
                return PollOutcome::Stopped {
                    error: err.to_string(),
                };
            }
        }
    }
}

/// Owner of one running watcher. Cancels the watcher when dropped, tying its lifetime
/// to whatever view or request registered it.
#[derive(Debug)]
pub struct PollHandle {
    deal: DealKey,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<PollOutcome>>,
}

impl PollHandle {
    pub fn deal(&self) -> &DealKey {
        &self.deal
    }

    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the watcher to end on its own (or through `cancel`).
    pub async fn outcome(mut self) -> PollOutcome {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    warn!(deal = %self.deal, "status watcher panicked");
                    PollOutcome::Stopped {
                        error: format!("status watcher for {} panicked", self.deal),
                    }
                }
                Err(_) => PollOutcome::Cancelled,
            },
            None => PollOutcome::Cancelled,
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
