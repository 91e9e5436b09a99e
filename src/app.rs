use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::event::{EventBus, SubscribeError};
use crate::source::{CloudRunSource, HttpRunApiClient, ServiceSource, SourceError};
use crate::sync::ServiceSync;
use crate::ticker::RefreshTicker;
use crate::xds::cache::SnapshotCache;
use crate::xds::distributor::Distributor;
use crate::xds::server::AdsServer;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("failed to build the upstream registry client: {0}")]
    SourceClient(#[from] SourceError),
    #[error("failed to subscribe the distribution handler: {0}")]
    Subscribe(#[from] SubscribeError),
}

/// The fully wired control plane.
pub struct App {
    config: Config,
    bus: Arc<EventBus>,
    ticker: RefreshTicker,
    ads: AdsServer,
}

impl App {
    pub fn build(config: Config) -> Result<App, BuildError> {
        let client = HttpRunApiClient::new(
            &config.project,
            &config.location,
            config.emulator_host.as_deref(),
        )?;
        let source: Arc<dyn ServiceSource> = Arc::new(CloudRunSource::new(client));

        let cache = Arc::new(SnapshotCache::default());
        let distributor = Arc::new(Distributor::new(cache.clone()));
        let bus = Arc::new(EventBus::new());
        let sync = Arc::new(ServiceSync::new(source, bus.clone(), distributor.clone()));

        // Every successful refresh fans out to all connected nodes.
        bus.subscribe(sync.clone())?;

        let ticker = RefreshTicker::new(sync.clone(), config.sync_period);
        let ads = AdsServer::new(sync, distributor, cache);

        Ok(App {
            config,
            bus,
            ticker,
            ads,
        })
    }

    /// Runs until a termination signal arrives or a worker fails. The bus,
    /// the ticker and the gRPC server share one cancellation scope; whichever
    /// ends first takes the others down with it.
    pub async fn run(self) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let mut workers = JoinSet::new();

        self.bus.start(token.clone());

        let ticker = self.ticker;
        let ticker_token = token.clone();
        workers.spawn(async move { ticker.run(ticker_token).await });

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let service = AggregatedDiscoveryServiceServer::new(self.ads);
        let server_token = token.clone();
        workers.spawn(async move {
            info!(%addr, "serving aggregated discovery");
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(addr, server_token.cancelled_owned())
                .await
                .context("discovery server aborted")
        });

        let mut failure = None;
        tokio::select! {
            _ = shutdown_signal() => {},
            joined = workers.join_next() => {
                // A root worker ended before shutdown was requested.
                failure = Some(match joined {
                    Some(Ok(Ok(()))) => anyhow::anyhow!("a worker exited unexpectedly"),
                    Some(Ok(Err(e))) => e,
                    Some(Err(e)) => anyhow::Error::from(e).context("a worker panicked"),
                    None => anyhow::anyhow!("no workers were running"),
                });
            },
        }

        token.cancel();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "worker failed during shutdown"),
                Err(e) => warn!(error = %e, "worker panicked during shutdown"),
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to register the SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to register the SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, starting shutdown"),
            _ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, starting shutdown");
    }
}
