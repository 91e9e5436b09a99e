use std::collections::HashSet;

use envoy_types::pb::envoy::config::cluster::v3 as cluster_v3;
use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::config::endpoint::v3 as endpoint_v3;
use envoy_types::pb::envoy::config::listener::v3 as listener_v3;
use envoy_types::pb::envoy::config::route::v3 as route_v3;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3 as hcm_v3;
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration};
use itertools::Itertools;
use prost::Message;
use sha2::{Digest, Sha256};

use super::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_HEADER_PREFIX};
use crate::model::{Route, Service};

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
const ROUTER_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

const UPSTREAM_PORT: u32 = 443;
const ROUTE_TIMEOUT: Duration = Duration {
    seconds: 10,
    nanos: 0,
};

/// Builds one API listener per selected service, together with the version
/// that identifies the set on the wire.
///
/// `requested` filters by service name; an empty filter selects every
/// service. Output is ordered by service name, so identical inputs produce
/// byte-identical payloads and version strings regardless of input order.
/// The version hashes the emitted listener names only: it moves exactly when
/// the set of selected services moves.
pub fn build_listeners(services: &[Service], requested: &[String]) -> (Vec<Any>, String) {
    let requested: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let selected = services
        .iter()
        .filter(|service| requested.is_empty() || requested.contains(service.name.as_str()))
        .sorted_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    let mut resources = Vec::new();
    for service in selected {
        hasher.update(service.name.as_bytes());
        resources.push(listener(service));
    }
    (resources, hex::encode(hasher.finalize()))
}

/// Builds one `LOGICAL_DNS` cluster per selected route.
///
/// `requested` filters by upstream host, not by service name: a proxy's CDS
/// subscription names the clusters its listeners route to, and those are
/// keyed by host. An empty filter selects every route of every service. A
/// host reachable through several services is emitted once per (service,
/// route) pair.
pub fn build_clusters(services: &[Service], requested: &[String]) -> (Vec<Any>, String) {
    let requested: HashSet<&str> = requested.iter().map(String::as_str).collect();

    let mut hasher = Sha256::new();
    let mut resources = Vec::new();
    for service in services.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
        let routes = std::iter::once(&service.default_route)
            .chain(service.routes.values())
            .filter(|route| requested.is_empty() || requested.contains(route.host.as_str()))
            .sorted_by(|a, b| a.name.cmp(&b.name));
        for route in routes {
            hasher.update(route.host.as_bytes());
            resources.push(cluster(&route.host));
        }
    }
    (resources, hex::encode(hasher.finalize()))
}

fn listener(service: &Service) -> Any {
    let mut routes: Vec<route_v3::Route> = service
        .routes
        .values()
        .map(|route| sibling_route(service, route))
        .collect();
    routes.push(fallthrough_route(service));

    let manager = hcm_v3::HttpConnectionManager {
        http_filters: vec![hcm_v3::HttpFilter {
            name: ROUTER_FILTER_NAME.to_string(),
            config_type: Some(hcm_v3::http_filter::ConfigType::TypedConfig(Any {
                type_url: ROUTER_FILTER_TYPE_URL.to_string(),
                value: Vec::new(),
            })),
            ..Default::default()
        }],
        route_specifier: Some(hcm_v3::http_connection_manager::RouteSpecifier::RouteConfig(
            route_v3::RouteConfiguration {
                virtual_hosts: vec![route_v3::VirtualHost {
                    name: service.name.clone(),
                    domains: vec![service.name.clone()],
                    routes,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )),
        ..Default::default()
    };

    let listener = listener_v3::Listener {
        name: service.name.clone(),
        api_listener: Some(listener_v3::ApiListener {
            api_listener: Some(Any {
                type_url: HCM_TYPE_URL.to_string(),
                value: manager.encode_to_vec(),
            }),
        }),
        ..Default::default()
    };

    Any {
        type_url: LISTENER_TYPE_URL.to_string(),
        value: listener.encode_to_vec(),
    }
}

/// Matched when the request carries `cloud-run-service-router-<service>`
/// equal to the sibling's route name.
fn sibling_route(service: &Service, route: &Route) -> route_v3::Route {
    routing_rule(&route.name, &route.host, Some(header_match(service, route)))
}

/// The terminal rule: no header match, traffic goes to the canonical
/// deployment. Ordered after every sibling rule.
fn fallthrough_route(service: &Service) -> route_v3::Route {
    routing_rule(&service.name, &service.default_route.host, None)
}

fn routing_rule(
    name: &str,
    cluster: &str,
    header: Option<route_v3::HeaderMatcher>,
) -> route_v3::Route {
    route_v3::Route {
        name: name.to_string(),
        r#match: Some(route_v3::RouteMatch {
            path_specifier: Some(route_v3::route_match::PathSpecifier::Prefix("/".to_string())),
            headers: header.into_iter().collect(),
            ..Default::default()
        }),
        action: Some(route_v3::route::Action::Route(route_v3::RouteAction {
            cluster_specifier: Some(route_v3::route_action::ClusterSpecifier::Cluster(
                cluster.to_string(),
            )),
            timeout: Some(ROUTE_TIMEOUT),
            host_rewrite_specifier: Some(
                route_v3::route_action::HostRewriteSpecifier::AutoHostRewrite(BoolValue {
                    value: true,
                }),
            ),
            ..Default::default()
        })),
        ..Default::default()
    }
}

// exact_match is superseded by string_match upstream, but it is what the
// data-plane fleet is validated against.
#[allow(deprecated)]
fn header_match(service: &Service, route: &Route) -> route_v3::HeaderMatcher {
    route_v3::HeaderMatcher {
        name: format!("{ROUTE_HEADER_PREFIX}{}", service.name),
        header_match_specifier: Some(route_v3::header_matcher::HeaderMatchSpecifier::ExactMatch(
            route.name.clone(),
        )),
        ..Default::default()
    }
}

fn cluster(host: &str) -> Any {
    let cluster = cluster_v3::Cluster {
        name: host.to_string(),
        cluster_discovery_type: Some(cluster_v3::cluster::ClusterDiscoveryType::Type(
            cluster_v3::cluster::DiscoveryType::LogicalDns as i32,
        )),
        lb_policy: cluster_v3::cluster::LbPolicy::RoundRobin as i32,
        load_assignment: Some(endpoint_v3::ClusterLoadAssignment {
            cluster_name: host.to_string(),
            endpoints: vec![endpoint_v3::LocalityLbEndpoints {
                lb_endpoints: vec![endpoint_v3::LbEndpoint {
                    host_identifier: Some(endpoint_v3::lb_endpoint::HostIdentifier::Endpoint(
                        endpoint_v3::Endpoint {
                            hostname: host.to_string(),
                            address: Some(core_v3::Address {
                                address: Some(core_v3::address::Address::SocketAddress(
                                    core_v3::SocketAddress {
                                        address: host.to_string(),
                                        port_specifier: Some(
                                            core_v3::socket_address::PortSpecifier::PortValue(UPSTREAM_PORT),
                                        ),
                                        ..Default::default()
                                    },
                                )),
                            }),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    Any {
        type_url: CLUSTER_TYPE_URL.to_string(),
        value: cluster.encode_to_vec(),
    }
}
