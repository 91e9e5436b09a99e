use std::sync::Arc;

use async_trait::async_trait;

use crate::event::{EventBus, RefreshedHandler};
use crate::source::{ServiceSource, SourceError};
use crate::xds::distributor::Distributor;

/// Ties the refresh and distribution halves of the control plane together:
/// the ticker drives [`refresh_and_publish`](Self::refresh_and_publish), the
/// bus worker and the discovery server drive the distribution paths.
pub struct ServiceSync {
    source: Arc<dyn ServiceSource>,
    bus: Arc<EventBus>,
    distributor: Arc<Distributor>,
}

impl ServiceSync {
    pub fn new(
        source: Arc<dyn ServiceSource>,
        bus: Arc<EventBus>,
        distributor: Arc<Distributor>,
    ) -> Self {
        ServiceSync {
            source,
            bus,
            distributor,
        }
    }

    /// Refreshes the upstream listing and notifies subscribers. The
    /// notification is only published after a successful refresh.
    pub async fn refresh_and_publish(&self) -> Result<(), SourceError> {
        self.source.refresh().await?;
        self.bus.publish();
        Ok(())
    }

    /// Rebuilds and installs snapshots for every registered node from the
    /// current service listing.
    pub async fn distribute_all(&self) -> Result<(), SourceError> {
        let services = self.source.list_all().await?;
        self.distributor.distribute_all(&services);
        Ok(())
    }

    /// Rebuilds and installs the snapshot for a single node from the current
    /// service listing.
    pub async fn distribute_to_node(&self, node: &str) -> Result<(), SourceError> {
        let services = self.source.list_all().await?;
        self.distributor.distribute_to_node(node, &services);
        Ok(())
    }
}

#[async_trait]
impl RefreshedHandler for ServiceSync {
    async fn handle(&self) -> anyhow::Result<()> {
        self.distribute_all().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::model::Service;
    use crate::xds::cache::SnapshotCache;

    struct FlakySource {
        fail: bool,
    }

    #[async_trait]
    impl ServiceSource for FlakySource {
        async fn refresh(&self) -> Result<(), SourceError> {
            if self.fail {
                return Err(SourceError::Auth("injected".into()));
            }
            Ok(())
        }

        async fn list_all(&self) -> Result<Vec<Service>, SourceError> {
            Ok(Vec::new())
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl RefreshedHandler for Counting {
        async fn handle(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn syncer(fail: bool, bus: Arc<EventBus>) -> ServiceSync {
        let cache = Arc::new(SnapshotCache::default());
        ServiceSync::new(
            Arc::new(FlakySource { fail }),
            bus,
            Arc::new(Distributor::new(cache)),
        )
    }

    #[tokio::test]
    async fn failed_refreshes_are_not_published() {
        let bus = Arc::new(EventBus::new());
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        bus.subscribe(handler.clone()).unwrap();
        let token = CancellationToken::new();
        bus.start(token.clone());

        let failing = syncer(true, bus.clone());
        assert!(failing.refresh_and_publish().await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);

        let working = syncer(false, bus.clone());
        working.refresh_and_publish().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.0.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a successful refresh must be published");

        token.cancel();
    }
}
