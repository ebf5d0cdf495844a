use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::SharedApi;
use crate::notices::Notifier;
use crate::optimistic::CancellationToken;
use crate::store::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

/// Polls the backend and reports when it goes away or comes back.
#[derive(Clone)]
pub struct HealthMonitor {
    api: SharedApi,
    notifier: Notifier,
    interval: Duration,
    state: Arc<Mutex<Reachability>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(api: SharedApi, notifier: Notifier, interval: Duration) -> Self {
        Self {
            api,
            notifier,
            interval,
            state: Arc::new(Mutex::new(Reachability::Unknown)),
        }
    }

    #[must_use]
    pub fn reachability(&self) -> Reachability {
        *lock(&self.state)
    }

    /// One probe. Notices fire only when reachability changes; a healthy
    /// first probe is silent.
    pub async fn check(&self) -> Reachability {
        let result = self.api.probe().await;
        let next = if result.is_ok() {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        };

        let previous = std::mem::replace(&mut *lock(&self.state), next);
        if previous == next {
            return next;
        }
        match (previous, result) {
            (Reachability::Unknown, Ok(())) => {
                tracing::info!("backend reachable");
            }
            (_, Ok(())) => {
                tracing::info!("backend reachable again");
                self.notifier.success("Backend connection restored");
            }
            (_, Err(error)) => {
                tracing::warn!(%error, "backend unreachable");
                self.notifier
                    .warning(format!("Backend unreachable: {error}"));
            }
        }
        next
    }

    /// Probes immediately and then on every interval until `stop` fires.
    #[must_use]
    pub fn spawn(&self, stop: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check().await;
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{HealthMonitor, Reachability};
    use crate::notices::{notice_channel, NoticeLevel};
    use crate::optimistic::CancellationToken;
    use crate::test_support::ScriptedApi;

    #[tokio::test]
    async fn notices_only_on_transitions() {
        let api = Arc::new(ScriptedApi::default());
        let (notifier, mut feed) = notice_channel();
        let monitor = HealthMonitor::new(api.clone(), notifier, Duration::from_secs(15));

        assert_eq!(monitor.check().await, Reachability::Reachable);
        assert_eq!(monitor.check().await, Reachability::Reachable);
        assert!(feed.drain().is_empty());

        api.fail_next("probe", "connection refused");
        api.fail_next("probe", "connection refused");
        assert_eq!(monitor.check().await, Reachability::Unreachable);
        assert_eq!(monitor.check().await, Reachability::Unreachable);
        assert_eq!(monitor.check().await, Reachability::Reachable);

        let notices = feed.drain();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].level, NoticeLevel::Warning);
        assert_eq!(notices[1].level, NoticeLevel::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_until_stopped() {
        let api = Arc::new(ScriptedApi::default());
        let (notifier, _feed) = notice_channel();
        let monitor = HealthMonitor::new(api.clone(), notifier, Duration::from_secs(15));
        let stop = CancellationToken::new();

        let handle = monitor.spawn(stop.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;
        stop.cancel();
        handle.await.expect("monitor task");

        assert_eq!(api.call_count("probe"), 3);
    }
}
