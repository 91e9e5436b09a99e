use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// A deployment a proxy can route to: either the canonical deployment of a
/// service or one of its sibling revisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Unique within the owning service; doubles as the value a proxy puts in
    /// the routing header to select this sibling.
    pub name: String,
    /// Upstream DNS name.
    pub host: String,
    /// Opaque identity of the backing revision, `{uid}-{generation}` upstream.
    pub version: String,
}

impl Route {
    pub fn new(name: impl Into<String>, host: impl Into<String>, version: impl Into<String>) -> Self {
        Route {
            name: name.into(),
            host: host.into(),
            version: version.into(),
        }
    }
}

/// A canonical service together with the sibling routes that point at it.
///
/// Two services compare equal only when every field matches, including
/// `version`; that comparison is what gates re-publication to proxies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    /// Content hash over the default route name and the sibling route names in
    /// ascending order. Stable across refreshes that do not change the set of
    /// participating names; hosts and revision ids do not contribute.
    pub version: String,
    /// The canonical deployment. Always present once the service is built.
    pub default_route: Route,
    /// Siblings keyed by route name. Names are unique within a service.
    pub routes: BTreeMap<String, Route>,
}

impl Service {
    pub fn new(default_route: Route, routes: BTreeMap<String, Route>) -> Self {
        let version = Self::compute_version(&default_route, &routes);
        Service {
            name: default_route.name.clone(),
            version,
            default_route,
            routes,
        }
    }

    fn compute_version(default_route: &Route, routes: &BTreeMap<String, Route>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(default_route.name.as_bytes());
        // BTreeMap iterates keys in ascending order.
        for name in routes.keys() {
            hasher.update(name.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sibling(name: &str) -> (String, Route) {
        (
            name.to_string(),
            Route::new(name, format!("{name}.example.com"), "uid-1"),
        )
    }

    fn service(routes: &[&str]) -> Service {
        Service::new(
            Route::new("test", "test.example.com", "94ba4b1f-1"),
            routes.iter().map(|r| sibling(r)).collect(),
        )
    }

    #[test]
    fn version_is_a_hash_over_default_and_sorted_sibling_names() {
        let svc = Service::new(
            Route::new("origin-service-1", "origin-service-1-test-an.a.run.app", "a-1"),
            [sibling("route-service-1")].into_iter().collect(),
        );
        assert_eq!(
            svc.version,
            "b543a676722f1d45cdd5b7c4b9c4ce939cc14896e0251d36c789c9d812b65a89"
        );

        let svc = Service::new(
            Route::new("origin-service-2", "origin-service-2-test-an.a.run.app", "b-1"),
            [sibling("route-service-3"), sibling("route-service-2")]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            svc.version,
            "9630692759893938f2f580f7f1add146279dab745e4a22f7c972f36c53c608bb"
        );

        let svc = Service::new(
            Route::new(
                "origin-service-without-route",
                "origin-service-without-route-test-an.a.run.app",
                "c-1",
            ),
            BTreeMap::new(),
        );
        assert_eq!(
            svc.version,
            "a7928920b8b5fdab798afdb07a8a2e3795c0d932f2f42e0e4f34c27895357ffe"
        );
    }

    #[test]
    fn version_ignores_hosts_but_tracks_names() {
        let a = service(&["test-1", "test-2"]);

        let mut moved_host = a.clone();
        moved_host
            .routes
            .get_mut("test-1")
            .unwrap()
            .host = "elsewhere.example.com".to_string();
        let recomputed = Service::new(moved_host.default_route.clone(), moved_host.routes.clone());
        assert_eq!(a.version, recomputed.version);

        let renamed = service(&["test-1", "test-3"]);
        assert_ne!(a.version, renamed.version);

        let removed = service(&["test-1"]);
        assert_ne!(a.version, removed.version);
    }

    #[test]
    fn equality_is_structural_including_version() {
        let a = service(&["test-1", "test-2"]);
        let b = service(&["test-1", "test-2"]);
        assert_eq!(a, b);

        let mut different_version = b.clone();
        different_version.version = "341d6116-8b17-4813-bdee-c5667073ca25".to_string();
        assert_ne!(a, different_version);

        let mut different_name = b.clone();
        different_name.name = "xxx".to_string();
        assert_ne!(a, different_name);

        let mut different_default = b.clone();
        different_default.default_route.host = "xxx.example.com".to_string();
        assert_ne!(a, different_default);

        let mut different_route_host = b.clone();
        different_route_host
            .routes
            .get_mut("test-1")
            .unwrap()
            .host = "xxx.example.com".to_string();
        assert_ne!(a, different_route_host);

        let fewer_routes = service(&["test-1"]);
        assert_ne!(a, fewer_routes);

        let more_routes = service(&["test-1", "test-2", "test-3"]);
        assert_ne!(a, more_routes);
    }

    #[test]
    fn route_equality_is_per_field() {
        let a = Route::new("test", "test.example.com", "uid-1");
        assert_eq!(a, a.clone());
        assert_ne!(a, Route::new("xxx", "test.example.com", "uid-1"));
        assert_ne!(a, Route::new("test", "xxx.example.com", "uid-1"));
        assert_ne!(a, Route::new("test", "test.example.com", "uid-2"));
    }
}
