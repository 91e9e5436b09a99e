use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::cache::{Snapshot, SnapshotCache, TypedResources};
use super::resources;
use crate::model::Service;

/// Per-node subscription registry plus the orchestration that turns the
/// current service listing into per-node snapshots.
///
/// Listener and cluster filters live under independent locks so the two
/// request paths never contend with each other. Entries are kept for the
/// process lifetime: a node that reconnects finds its filters, and therefore
/// its version continuity, intact.
pub struct Distributor {
    cache: Arc<SnapshotCache>,
    listener_filters: RwLock<HashMap<String, Vec<String>>>,
    cluster_filters: RwLock<HashMap<String, Vec<String>>>,
}

impl Distributor {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Distributor {
            cache,
            listener_filters: RwLock::new(HashMap::new()),
            cluster_filters: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the node's listener filter. An empty filter means "all
    /// services".
    pub fn register_listener_filter(&self, node: &str, names: &[String]) {
        debug!(node = %node, names = ?names, "registering listener subscription");
        self
            .listener_filters
            .write()
            .expect("listener filter lock poisoned")
            .insert(node.to_string(), names.to_vec());
    }

    /// Replaces the node's cluster filter. The names are upstream hosts; an
    /// empty filter means "all routes".
    pub fn register_cluster_filter(&self, node: &str, names: &[String]) {
        debug!(node = %node, names = ?names, "registering cluster subscription");
        self
            .cluster_filters
            .write()
            .expect("cluster filter lock poisoned")
            .insert(node.to_string(), names.to_vec());
    }

    /// Rebuilds the node's snapshot from `services` under its current
    /// filters and installs it. A resource type the node has never
    /// subscribed to keeps whatever the previous snapshot held, so a
    /// single-type update never erases the other type.
    pub fn distribute_to_node(&self, node: &str, services: &[Service]) {
        // Copy the filters out before touching the cache: installing a
        // snapshot delivers watch responses and must not run under the
        // registry locks.
        let listener_filter = self
            .listener_filters
            .read()
            .expect("listener filter lock poisoned")
            .get(node)
            .cloned();
        let cluster_filter = self
            .cluster_filters
            .read()
            .expect("cluster filter lock poisoned")
            .get(node)
            .cloned();

        let previous = self.cache.get(node).unwrap_or_default();

        let listeners = match listener_filter {
            Some(filter) => {
                let (items, version) = resources::build_listeners(services, &filter);
                TypedResources { version, items }
            },
            None => previous.listeners,
        };
        let clusters = match cluster_filter {
            Some(filter) => {
                let (items, version) = resources::build_clusters(services, &filter);
                TypedResources { version, items }
            },
            None => previous.clusters,
        };

        self.cache.set(node, Snapshot { listeners, clusters });
    }

    /// Rebuilds and installs snapshots for every node that has registered at
    /// least one subscription.
    pub fn distribute_all(&self, services: &[Service]) {
        for node in self.known_nodes() {
            self.distribute_to_node(&node, services);
        }
    }

    fn known_nodes(&self) -> Vec<String> {
        let mut nodes: HashSet<String> = self
            .listener_filters
            .read()
            .expect("listener filter lock poisoned")
            .keys()
            .cloned()
            .collect();
        nodes.extend(
            self
                .cluster_filters
                .read()
                .expect("cluster filter lock poisoned")
                .keys()
                .cloned(),
        );
        nodes.into_iter().collect()
    }
}
