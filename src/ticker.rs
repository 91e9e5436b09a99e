use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sync::ServiceSync;

/// Periodic refresher: one immediate refresh on start, then one per period.
///
/// A tick that fires while a refresh is still in flight is coalesced rather
/// than queued, and refresh failures only skip the cycle.
pub struct RefreshTicker {
    sync: Arc<ServiceSync>,
    period: Duration,
}

impl RefreshTicker {
    pub fn new(sync: Arc<ServiceSync>, period: Duration) -> Self {
        RefreshTicker { sync, period }
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let mut ticks = tokio::time::interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("refresh ticker stopped");
                    return Ok(());
                },
                _ = ticks.tick() => {
                    if let Err(e) = self.sync.refresh_and_publish().await {
                        warn!(error = %e, "failed to refresh services; keeping the previous view");
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::event::EventBus;
    use crate::model::Service;
    use crate::source::{ServiceSource, SourceError};
    use crate::xds::cache::SnapshotCache;
    use crate::xds::distributor::Distributor;

    struct CountingSource {
        refreshes: AtomicUsize,
        failing_cycles: HashSet<usize>,
    }

    #[async_trait]
    impl ServiceSource for CountingSource {
        async fn refresh(&self) -> Result<(), SourceError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.failing_cycles.contains(&n) {
                return Err(SourceError::Auth("injected".into()));
            }
            Ok(())
        }

        async fn list_all(&self) -> Result<Vec<Service>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn syncer(source: Arc<CountingSource>) -> Arc<ServiceSync> {
        let cache = Arc::new(SnapshotCache::default());
        Arc::new(ServiceSync::new(
            source,
            Arc::new(EventBus::new()),
            Arc::new(Distributor::new(cache)),
        ))
    }

    #[tokio::test]
    async fn refreshes_immediately_and_keeps_ticking_past_errors() {
        let source = Arc::new(CountingSource {
            refreshes: AtomicUsize::new(0),
            // Fail the second cycle; the third must still run.
            failing_cycles: [1].into_iter().collect(),
        });
        let ticker = RefreshTicker::new(syncer(source.clone()), Duration::from_millis(10));

        let token = CancellationToken::new();
        let handle = tokio::spawn(ticker.run(token.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.refreshes.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ticker should keep refreshing after an error");

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
