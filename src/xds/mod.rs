use std::fmt;

pub mod cache;
pub mod distributor;
pub mod resources;
pub mod server;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Request header prefix a proxy uses to select a sibling route; the full
/// header name is `cloud-run-service-router-<service>`.
pub const ROUTE_HEADER_PREFIX: &str = "cloud-run-service-router-";

/// The resource types this control plane serves over ADS.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Listener,
    Cluster,
}

impl ResourceType {
    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Listener => LISTENER_TYPE_URL,
            ResourceType::Cluster => CLUSTER_TYPE_URL,
        }
    }

    pub fn from_type_url(url: &str) -> Option<ResourceType> {
        match url {
            LISTENER_TYPE_URL => Some(ResourceType::Listener),
            CLUSTER_TYPE_URL => Some(ResourceType::Cluster),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceType::Listener => "listener",
            ResourceType::Cluster => "cluster",
        })
    }
}
