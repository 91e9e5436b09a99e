use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::{Route, Service};

/// Annotation that marks an upstream service as a sibling of the named
/// canonical service.
pub const ORIGIN_SERVICE_ANNOTATION: &str = "kauche.com/cloud-run-service-router-origin-service";

const RUN_API_BASE: &str = "https://run.googleapis.com";

/// Errors from the upstream registry. All of them are transient from the
/// caller's point of view: a failed refresh keeps the previous service map
/// and is retried on the next tick.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("failed to authenticate to the upstream registry: {0}")]
    Auth(String),
}

/// A service record as returned by the Cloud Run Admin v2 `services.list`
/// surface. Only the fields the router consumes are modeled.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamService {
    /// Full resource name, `projects/{project}/locations/{location}/services/{name}`.
    pub name: String,
    /// Serving URL, e.g. `https://my-service-test-an.a.run.app`.
    pub uri: String,
    pub uid: String,
    pub generation: i64,
    pub annotations: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePage {
    pub services: Vec<UpstreamService>,
    pub next_page_token: String,
}

/// Paged listing surface of the upstream registry. Implementations own
/// transport and auth; paging is driven by the caller.
#[async_trait]
pub trait RunApiClient: Send + Sync + 'static {
    async fn list_services(&self, page_token: &str) -> Result<ServicePage, SourceError>;
}

/// Source of the services the control plane routes between.
#[async_trait]
pub trait ServiceSource: Send + Sync + 'static {
    /// Re-fetches the full upstream listing and atomically replaces the
    /// cached service map. No partial install: any page failure leaves the
    /// previous map in place.
    async fn refresh(&self) -> Result<(), SourceError>;

    /// Returns a snapshot of the current service map values.
    async fn list_all(&self) -> Result<Vec<Service>, SourceError>;
}

/// Caching [`ServiceSource`] over the Cloud Run Admin API.
///
/// Readers take a cheap values copy under the read lock; writers swap the
/// whole map in one store, so a concurrent `list_all` sees either the old or
/// the new listing, never a mix.
pub struct CloudRunSource<C> {
    client: C,
    services: RwLock<HashMap<String, Service>>,
}

impl<C: RunApiClient> CloudRunSource<C> {
    pub fn new(client: C) -> Self {
        CloudRunSource {
            client,
            services: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_all(&self) -> Result<Vec<UpstreamService>, SourceError> {
        let mut records = Vec::new();
        let mut page_token = String::new();
        loop {
            let page = self.client.list_services(&page_token).await?;
            records.extend(page.services);
            if page.next_page_token.is_empty() {
                return Ok(records);
            }
            page_token = page.next_page_token;
        }
    }
}

#[async_trait]
impl<C: RunApiClient> ServiceSource for CloudRunSource<C> {
    async fn refresh(&self) -> Result<(), SourceError> {
        let records = self.fetch_all().await?;
        let services = assemble(records);
        debug!(services = services.len(), "refreshed upstream services");
        *self.services.write().expect("service map lock poisoned") = services;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Service>, SourceError> {
        let services = self.services.read().expect("service map lock poisoned");
        Ok(services.values().cloned().collect())
    }
}

/// Builds the service map from raw upstream records: records without the
/// origin annotation become canonical services, annotated records attach to
/// the canonical service their annotation names. Siblings pointing at a
/// nonexistent canonical service are dropped.
fn assemble(records: Vec<UpstreamService>) -> HashMap<String, Service> {
    let mut origins = Vec::new();
    let mut siblings: HashMap<String, Vec<Route>> = HashMap::new();

    for record in records {
        match record.annotations.get(ORIGIN_SERVICE_ANNOTATION) {
            Some(origin) => {
                let origin = origin.clone();
                siblings.entry(origin).or_default().push(route_of(&record));
            },
            None => origins.push(record),
        }
    }

    let mut services = HashMap::new();
    for record in origins {
        let default_route = route_of(&record);
        let routes: BTreeMap<String, Route> = siblings
            .remove(&default_route.name)
            .unwrap_or_default()
            .into_iter()
            .map(|route| (route.name.clone(), route))
            .collect();
        services.insert(default_route.name.clone(), Service::new(default_route, routes));
    }

    for (origin, orphans) in siblings {
        for orphan in orphans {
            warn!(
                route = %orphan.name,
                origin = %origin,
                "dropping sibling route whose canonical service does not exist"
            );
        }
    }

    services
}

fn route_of(record: &UpstreamService) -> Route {
    Route::new(
        short_name(&record.name),
        host_of(&record.uri),
        format!("{}-{}", record.uid, record.generation),
    )
}

/// The last segment of a full resource name.
fn short_name(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

fn host_of(uri: &str) -> &str {
    uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"))
        .unwrap_or(uri)
}

/// REST client for the Cloud Run Admin v2 API.
///
/// With an emulator endpoint the client speaks plain HTTP without
/// authentication; against the real API every request carries a Bearer token
/// from application-default credentials (requires the `gcp` feature).
pub struct HttpRunApiClient {
    http: reqwest::Client,
    base: String,
    parent: String,
    authenticated: bool,
}

impl HttpRunApiClient {
    pub fn new(
        project: &str,
        location: &str,
        emulator_host: Option<&str>,
    ) -> Result<Self, SourceError> {
        let (base, authenticated) = match emulator_host {
            Some(host) => (format!("http://{host}"), false),
            None => (RUN_API_BASE.to_string(), true),
        };
        Ok(HttpRunApiClient {
            http: reqwest::Client::builder().build()?,
            base,
            parent: format!("projects/{project}/locations/{location}"),
            authenticated,
        })
    }
}

#[async_trait]
impl RunApiClient for HttpRunApiClient {
    async fn list_services(&self, page_token: &str) -> Result<ServicePage, SourceError> {
        let url = format!("{}/v2/{}/services", self.base, self.parent);
        let mut request = self.http.get(&url);
        if !page_token.is_empty() {
            request = request.query(&[("pageToken", page_token)]);
        }
        if self.authenticated {
            request = request.bearer_auth(auth::access_token().await?);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                status: response.status(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(feature = "gcp")]
mod auth {
    use google_cloud_auth::credentials::{self, CacheableResource};
    use tokio::sync::OnceCell;

    use super::SourceError;

    static CREDS: OnceCell<credentials::Credentials> = OnceCell::const_new();

    pub async fn access_token() -> Result<String, SourceError> {
        let creds = CREDS
            .get_or_try_init(|| async { credentials::Builder::default().build() })
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))?;
        let headers = match creds
            .headers(http::Extensions::new())
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))?
        {
            CacheableResource::New { data, .. } => data,
            CacheableResource::NotModified => {
                return Err(SourceError::Auth("credential headers unavailable".into()));
            },
        };
        headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.to_string())
            .ok_or_else(|| SourceError::Auth("no authorization header in credentials".into()))
    }
}

#[cfg(not(feature = "gcp"))]
mod auth {
    use super::SourceError;

    pub async fn access_token() -> Result<String, SourceError> {
        Err(SourceError::Auth(
            "built without the `gcp` feature; set CLOUD_RUN_EMULATOR_HOST or rebuild with --features gcp"
                .into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const SERVICES_PATH: &str = "/v2/projects/test-project/locations/test-location/services";

    fn record(short: &str, uid: &str, origin: Option<&str>) -> serde_json::Value {
        let mut annotations = serde_json::Map::new();
        if let Some(origin) = origin {
            annotations.insert(
                ORIGIN_SERVICE_ANNOTATION.to_string(),
                serde_json::Value::String(origin.to_string()),
            );
        }
        serde_json::json!({
            "name": format!("projects/test-project/locations/test-location/services/{short}"),
            "uri": format!("https://{short}-test-an.a.run.app"),
            "uid": uid,
            "generation": 1,
            "annotations": annotations,
        })
    }

    async fn paged_registry() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICES_PATH))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "services": [
                    record("origin-service-1", "8748", None),
                    record("route-service-1", "b6c2", Some("origin-service-1")),
                    record("origin-service-without-route", "1742", None),
                    record("route-service-without-origin", "dead", Some("route-service-without-origin")),
                ],
                "nextPageToken": "next-page-token",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(SERVICES_PATH))
            .and(query_param("pageToken", "next-page-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "services": [
                    record("origin-service-2", "b1a2", None),
                    record("route-service-2", "c001", Some("origin-service-2")),
                    record("route-service-3", "c002", Some("origin-service-2")),
                ],
                "nextPageToken": "",
            })))
            .mount(&server)
            .await;
        server
    }

    fn source_for(server: &MockServer) -> CloudRunSource<HttpRunApiClient> {
        let client = HttpRunApiClient::new(
            "test-project",
            "test-location",
            Some(server.address().to_string().as_str()),
        )
        .unwrap();
        CloudRunSource::new(client)
    }

    #[tokio::test]
    async fn refresh_assembles_services_across_pages() {
        let server = paged_registry().await;
        let source = source_for(&server);

        source.refresh().await.unwrap();
        let mut services = source.list_all().await.unwrap();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "origin-service-1",
                "origin-service-2",
                "origin-service-without-route"
            ]
        );

        let first = &services[0];
        assert_eq!(
            first.version,
            "b543a676722f1d45cdd5b7c4b9c4ce939cc14896e0251d36c789c9d812b65a89"
        );
        assert_eq!(first.default_route.host, "origin-service-1-test-an.a.run.app");
        assert_eq!(first.default_route.version, "8748-1");
        assert_eq!(
            first.routes.keys().collect::<Vec<_>>(),
            ["route-service-1"]
        );
        assert_eq!(
            first.routes["route-service-1"].host,
            "route-service-1-test-an.a.run.app"
        );

        let second = &services[1];
        assert_eq!(
            second.version,
            "9630692759893938f2f580f7f1add146279dab745e4a22f7c972f36c53c608bb"
        );
        assert_eq!(
            second.routes.keys().collect::<Vec<_>>(),
            ["route-service-2", "route-service-3"]
        );

        let third = &services[2];
        assert_eq!(
            third.version,
            "a7928920b8b5fdab798afdb07a8a2e3795c0d932f2f42e0e4f34c27895357ffe"
        );
        assert!(third.routes.is_empty());
    }

    #[tokio::test]
    async fn refresh_is_idempotent_for_identical_upstream_data() {
        let server = paged_registry().await;
        let source = source_for(&server);

        source.refresh().await.unwrap();
        let mut before = source.list_all().await.unwrap();
        before.sort_by(|a, b| a.name.cmp(&b.name));

        source.refresh().await.unwrap();
        let mut after = source.list_all().await.unwrap();
        after.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_previous_listing() {
        let server = paged_registry().await;
        let source = source_for(&server);
        source.refresh().await.unwrap();

        server.reset().await;
        Mock::given(method("GET"))
            .and(path(SERVICES_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(matches!(
            source.refresh().await,
            Err(SourceError::Status { .. })
        ));
        assert_eq!(source.list_all().await.unwrap().len(), 3);
    }

    #[test]
    fn short_name_takes_the_last_path_segment() {
        assert_eq!(
            short_name("projects/p/locations/l/services/origin-service-1"),
            "origin-service-1"
        );
        assert_eq!(short_name("origin-service-1"), "origin-service-1");
    }

    #[test]
    fn host_of_strips_the_scheme() {
        assert_eq!(host_of("https://svc-test-an.a.run.app"), "svc-test-an.a.run.app");
        assert_eq!(host_of("svc-test-an.a.run.app"), "svc-test-an.a.run.app");
    }
}
