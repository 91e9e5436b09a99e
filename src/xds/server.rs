use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::ResourceType;
use super::cache::{SnapshotCache, WatchId};
use super::distributor::Distributor;
use crate::sync::ServiceSync;

type ActiveWatch = Option<(WatchId, oneshot::Receiver<DiscoveryResponse>)>;

/// The aggregated discovery endpoint.
///
/// Every accepted stream runs its own loop: requests classify into listener
/// or cluster subscriptions, each subscription update triggers a
/// distribution pass for the node, and at most one watch per resource type
/// stays open against the snapshot cache. The node identity is taken from
/// the first request and reused for the rest of the stream, since proxies
/// only send it once.
#[derive(Clone)]
pub struct AdsServer {
    sync: Arc<ServiceSync>,
    distributor: Arc<Distributor>,
    cache: Arc<SnapshotCache>,
}

impl AdsServer {
    pub fn new(
        sync: Arc<ServiceSync>,
        distributor: Arc<Distributor>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        AdsServer {
            sync,
            distributor,
            cache,
        }
    }

    async fn handle_stream<S>(
        &self,
        mut requests: S,
        responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin + Send,
    {
        let mut node_id: Option<String> = None;
        let mut listener_watch: ActiveWatch = None;
        let mut cluster_watch: ActiveWatch = None;

        loop {
            tokio::select! {
                request = requests.next() => match request {
                    Some(Ok(request)) => {
                        let proceed = self
                            .on_request(
                                request,
                                &mut node_id,
                                &mut listener_watch,
                                &mut cluster_watch,
                                &responses,
                            )
                            .await;
                        if !proceed {
                            break;
                        }
                    },
                    Some(Err(status)) => {
                        warn!(
                            node = node_id.as_deref().unwrap_or("unknown"),
                            error = %status,
                            "error receiving discovery request"
                        );
                        break;
                    },
                    None => {
                        info!(
                            node = node_id.as_deref().unwrap_or("unknown"),
                            "discovery stream closed by client"
                        );
                        break;
                    },
                },
                response = next_watch(&mut listener_watch), if listener_watch.is_some() => {
                    if !forward(response, node_id.as_deref(), &responses).await {
                        break;
                    }
                },
                response = next_watch(&mut cluster_watch), if cluster_watch.is_some() => {
                    if !forward(response, node_id.as_deref(), &responses).await {
                        break;
                    }
                },
            }
        }

        // Parked watches die with the stream; the node's subscriptions and
        // snapshot survive so a reconnect picks up where it left off.
        if let Some((id, _)) = listener_watch.take() {
            self.cache.cancel(id);
        }
        if let Some((id, _)) = cluster_watch.take() {
            self.cache.cancel(id);
        }
    }

    /// Handles one request; returns false when the stream must terminate.
    async fn on_request(
        &self,
        request: DiscoveryRequest,
        node_id: &mut Option<String>,
        listener_watch: &mut ActiveWatch,
        cluster_watch: &mut ActiveWatch,
        responses: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> bool {
        if node_id.is_none() {
            match request.node.as_ref().filter(|node| !node.id.is_empty()) {
                Some(node) => *node_id = Some(node.id.clone()),
                None => {
                    warn!("closing stream: the first discovery request carried no node id");
                    let _ = responses
                        .send(Err(Status::invalid_argument("node id is required")))
                        .await;
                    return false;
                },
            }
        }
        let node = node_id.as_deref().expect("node id is set above").to_string();

        let Some(ty) = ResourceType::from_type_url(&request.type_url) else {
            debug!(
                node = %node,
                type_url = %request.type_url,
                "ignoring request for an unsupported resource type"
            );
            return true;
        };

        if let Some(detail) = &request.error_detail {
            warn!(
                node = %node,
                %ty,
                nonce = %request.response_nonce,
                code = detail.code,
                message = %detail.message,
                "client rejected the previous response"
            );
        }

        info!(
            node = %node,
            %ty,
            names = ?request.resource_names,
            version = %request.version_info,
            "received discovery request"
        );

        match ty {
            ResourceType::Listener => {
                self
                    .distributor
                    .register_listener_filter(&node, &request.resource_names);
            },
            ResourceType::Cluster => {
                self
                    .distributor
                    .register_cluster_filter(&node, &request.resource_names);
            },
        }

        if let Err(e) = self.sync.distribute_to_node(&node).await {
            warn!(
                node = %node,
                error = %e,
                "failed to distribute services; the previous snapshot stays in place"
            );
        }

        // Replace any watch left over from the previous request of this
        // type. The new watch answers immediately unless the client already
        // acknowledged the current version.
        let slot = match ty {
            ResourceType::Listener => listener_watch,
            ResourceType::Cluster => cluster_watch,
        };
        if let Some((id, _)) = slot.take() {
            self.cache.cancel(id);
        }
        *slot = Some(self.cache.create_watch(&node, ty, &request.version_info));
        true
    }
}

/// Awaits the active watch and clears the slot once it resolves. Only polled
/// when a watch is present.
async fn next_watch(watch: &mut ActiveWatch) -> Option<DiscoveryResponse> {
    match watch {
        Some((_, rx)) => {
            let response = rx.await.ok();
            *watch = None;
            response
        },
        None => std::future::pending().await,
    }
}

/// Sends one watch result to the client; returns false once the transport is
/// gone.
async fn forward(
    response: Option<DiscoveryResponse>,
    node: Option<&str>,
    responses: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> bool {
    let Some(response) = response else {
        // The watch was dropped without an answer; nothing to send.
        return true;
    };
    info!(
        node = node.unwrap_or("unknown"),
        type_url = %response.type_url,
        version = %response.version_info,
        nonce = %response.nonce,
        resources = response.resources.len(),
        "sending discovery response"
    );
    responses.send(Ok(response)).await.is_ok()
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;
    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!("discovery stream opened");
        let (tx, rx) = mpsc::channel(16);
        let server = self.clone();
        let requests = request.into_inner();
        tokio::spawn(async move { server.handle_stream(requests, tx).await });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }
}
