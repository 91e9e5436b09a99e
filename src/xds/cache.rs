use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::oneshot;
use tracing::debug;

use super::ResourceType;

/// The full set of resources of one type currently published to a node,
/// together with the version that identifies it on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypedResources {
    pub version: String,
    pub items: Vec<Any>,
}

/// Everything published to a single node. Version equality across snapshots
/// means "no change on the wire" for that resource type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub listeners: TypedResources,
    pub clusters: TypedResources,
}

impl Snapshot {
    pub fn typed(&self, ty: ResourceType) -> &TypedResources {
        match ty {
            ResourceType::Listener => &self.listeners,
            ResourceType::Cluster => &self.clusters,
        }
    }
}

/// Handle for cancelling a parked watch when its stream goes away.
#[derive(Debug)]
pub struct WatchId(u64);

struct Watch {
    node: String,
    ty: ResourceType,
    /// The version the client last acknowledged; the watch fires only when
    /// the installed snapshot differs from it.
    known_version: String,
    tx: oneshot::Sender<DiscoveryResponse>,
}

/// Per-node snapshot store with state-of-the-world discovery semantics.
///
/// Nodes are keyed by their identity string. Installing a snapshot wakes
/// exactly the watches whose resource type now has a version the client has
/// not seen; installing an identical version wakes nobody, which is what
/// keeps acknowledgement round-trips from turning into resend storms. A
/// watch opened against an already-newer snapshot is answered immediately.
/// Each watch delivers at most one response.
#[derive(Default)]
pub struct SnapshotCache {
    inner: Mutex<Inner>,
    nonce: AtomicU64,
}

struct Inner {
    snapshots: HashMap<String, Snapshot>,
    watches: HashMap<u64, Watch>,
    next_watch_id: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            snapshots: HashMap::new(),
            watches: HashMap::new(),
            // 0 is reserved for watches answered at creation time.
            next_watch_id: 1,
        }
    }
}

impl SnapshotCache {
    /// Installs `snapshot` for `node` and answers any parked watch whose
    /// resource type changed relative to what its client last acknowledged.
    pub fn set(&self, node: &str, snapshot: Snapshot) {
        let mut inner = self.inner.lock().expect("snapshot cache lock poisoned");
        inner.snapshots.insert(node.to_string(), snapshot.clone());

        let due: Vec<u64> = inner
            .watches
            .iter()
            .filter(|(_, watch)| {
                watch.node == node && watch.known_version != snapshot.typed(watch.ty).version
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(watch) = inner.watches.remove(&id) {
                let response = self.response(&snapshot, watch.ty);
                debug!(
                    node = %watch.node,
                    ty = %watch.ty,
                    version = %response.version_info,
                    "answering watch"
                );
                // A closed receiver just means the stream went away first.
                let _ = watch.tx.send(response);
            }
        }
    }

    pub fn get(&self, node: &str) -> Option<Snapshot> {
        self
            .inner
            .lock()
            .expect("snapshot cache lock poisoned")
            .snapshots
            .get(node)
            .cloned()
    }

    /// Opens a watch for `(node, ty)` that resolves with one response as soon
    /// as a snapshot with a version other than `known_version` is installed.
    /// If such a snapshot is already present the watch resolves immediately.
    pub fn create_watch(
        &self,
        node: &str,
        ty: ResourceType,
        known_version: &str,
    ) -> (WatchId, oneshot::Receiver<DiscoveryResponse>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("snapshot cache lock poisoned");

        if let Some(snapshot) = inner.snapshots.get(node) {
            if snapshot.typed(ty).version != known_version {
                let response = self.response(snapshot, ty);
                let _ = tx.send(response);
                return (WatchId(0), rx);
            }
        }

        let id = inner.next_watch_id;
        inner.next_watch_id += 1;
        inner.watches.insert(
            id,
            Watch {
                node: node.to_string(),
                ty,
                known_version: known_version.to_string(),
                tx,
            },
        );
        (WatchId(id), rx)
    }

    /// Discards a parked watch. Harmless for watches that already fired.
    pub fn cancel(&self, id: WatchId) {
        if id.0 == 0 {
            return;
        }
        self
            .inner
            .lock()
            .expect("snapshot cache lock poisoned")
            .watches
            .remove(&id.0);
    }

    fn response(&self, snapshot: &Snapshot, ty: ResourceType) -> DiscoveryResponse {
        let resources = snapshot.typed(ty);
        DiscoveryResponse {
            version_info: resources.version.clone(),
            resources: resources.items.clone(),
            type_url: ty.type_url().to_string(),
            nonce: self.nonce.fetch_add(1, Ordering::Relaxed).to_string(),
            ..Default::default()
        }
    }
}
