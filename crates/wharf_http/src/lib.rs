//! # Wharf HTTP
//!
//! The OCI Distribution v2 surface of the registry: pull, push with
//! chunked uploads and cross-repository mounts, tag listing, the catalog,
//! and the signatures API extension. Handlers are written against the
//! store traits in [`wharf_core::registry`] and are backend agnostic.
//!
//! Repository names may span several path segments (`library/busybox`,
//! and pull-through paths like `docker-cache/library/busybox`), which an
//! axum path capture cannot express, so `/v2/*rest` is parsed by
//! [`RegistryPath`] and dispatched manually.

use std::str::FromStr;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::header::{HeaderName, HeaderValue};
use http::Request;
use hyper::body::Body;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{self, TraceLayer};

mod errors;
pub(crate) use errors::Error;
pub(crate) use errors::Result;

mod auth;
pub use auth::{AuthContext, Authorizer};

pub(crate) mod blobs;
pub(crate) mod cache;
pub(crate) mod catalog;
pub(crate) mod headers;
mod manifests;
mod signatures;
mod tags;

use wharf_core::registry::{
    OnDemandFetcher, Remote, RepositoryKind, RepositoryStore, RepositoryStoreManager,
};
use wharf_core::Error as CoreError;
use wharf_tasks::TaskRuntime;

use cache::ManifestCache;

/// Configuration for the HTTP surface.
pub struct WharfOptions {
    pub authorizer: Authorizer,
    pub fetcher: Option<Arc<dyn OnDemandFetcher>>,
    pub cache_enabled: bool,
}

/// Shared state behind every Distribution API handler.
#[derive(Clone)]
pub struct Wharf {
    manager: Arc<dyn RepositoryStoreManager>,
    runtime: TaskRuntime,
    authorizer: Authorizer,
    fetcher: Option<Arc<dyn OnDemandFetcher>>,
    cache: Option<Arc<ManifestCache>>,
}

impl Wharf {
    pub fn new(
        manager: Arc<dyn RepositoryStoreManager>,
        runtime: TaskRuntime,
        options: WharfOptions,
    ) -> Self {
        Self {
            manager,
            runtime,
            authorizer: options.authorizer,
            fetcher: options.fetcher,
            cache: options.cache_enabled.then(|| Arc::new(ManifestCache::default())),
        }
    }

    pub fn manager(&self) -> &Arc<dyn RepositoryStoreManager> {
        &self.manager
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.runtime
    }

    pub(crate) fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub(crate) fn fetcher(&self) -> Option<&Arc<dyn OnDemandFetcher>> {
        self.fetcher.as_ref()
    }

    pub(crate) fn cache(&self) -> Option<&Arc<ManifestCache>> {
        self.cache.as_ref()
    }

    /// Return an [`axum::Router`] serving the Distribution API.
    pub fn router(&self) -> Result<axum::Router> {
        let app = Router::new()
            .route("/v2", any(dispatch))
            .route("/v2/", any(dispatch))
            .route("/v2/*rest", any(dispatch))
            .route("/extensions/v2/*rest", any(dispatch_extensions))
            .with_state(self.clone())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new())
                    .on_response(trace::DefaultOnResponse::new())
                    .on_request(trace::DefaultOnRequest::new()),
            )
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("docker-distribution-api-version")?,
                HeaderValue::from_str("registry/2.0")?,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("x-registry-supports-signatures")?,
                HeaderValue::from_str("1")?,
            ));

        Ok(app)
    }

    /// Resolve the repository addressed by a request path: a distribution
    /// base path, a bare repository name, or a pull-through prefix whose
    /// remainder names the upstream image.
    pub(crate) async fn resolve_view(&self, requested: &str) -> Result<RepoView> {
        if let Some(dist) = self.manager.distribution(requested).await? {
            let store = self.manager.get(&dist.repository_name).await?;
            let remote = match dist.remote_id {
                Some(id) => self.manager.remote(&id).await?,
                None => None,
            };
            let pull_through = remote.is_some();
            return Ok(RepoView {
                requested: requested.to_string(),
                name: dist.repository_name,
                store,
                version: dist.version_number,
                remote,
                pull_through,
                private: dist.private,
            });
        }

        if let Some(store) = self.manager.get(requested).await? {
            return Ok(RepoView {
                requested: requested.to_string(),
                name: requested.to_string(),
                store: Some(store),
                version: None,
                remote: None,
                pull_through: false,
                private: false,
            });
        }

        // pull-through: the longest distribution prefix wins and the
        // remainder names the upstream repository
        let segments: Vec<&str> = requested.split('/').collect();
        for i in (1..segments.len()).rev() {
            let prefix = segments[..i].join("/");
            let Some(dist) = self.manager.distribution(&prefix).await? else {
                continue;
            };
            let Some(remote_id) = dist.remote_id else {
                continue;
            };
            let Some(mut remote) = self.manager.remote(&remote_id).await? else {
                continue;
            };
            let local = segments[i..].join("/");
            remote.upstream_name = local.clone();
            let store = self.manager.get(&local).await?;
            return Ok(RepoView {
                requested: requested.to_string(),
                name: local,
                store,
                version: None,
                remote: Some(remote),
                pull_through: true,
                private: dist.private,
            });
        }

        Err(CoreError::NameUnknown(Some(requested.to_string())).into())
    }

    /// The repository for a push request, creating it on first push.
    pub(crate) async fn push_target(&self, requested: &str) -> Result<Arc<dyn RepositoryStore>> {
        let view = match self.resolve_view(requested).await {
            Ok(view) => Some(view),
            Err(Error::Core(CoreError::NameUnknown(_))) => None,
            Err(e) => return Err(e),
        };
        match view.and_then(|v| v.store) {
            Some(store) => {
                if store.kind() != RepositoryKind::Push {
                    return Err(CoreError::Denied(Some(
                        "repository is sync-backed and read-only".to_string(),
                    ))
                    .into());
                }
                Ok(store)
            }
            None => Ok(self
                .manager
                .create(requested, RepositoryKind::Push)
                .await?),
        }
    }
}

/// A resolved repository reference.
pub(crate) struct RepoView {
    /// The name as the client requested it (authorization scope).
    pub requested: String,
    /// The local repository name (differs under pull-through prefixes).
    pub name: String,
    pub store: Option<Arc<dyn RepositoryStore>>,
    /// Pinned version when a distribution pins one.
    pub version: Option<i64>,
    pub remote: Option<Remote>,
    pub pull_through: bool,
    #[allow(dead_code)]
    pub private: bool,
}

impl RepoView {
    pub fn store(&self) -> Result<&Arc<dyn RepositoryStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| CoreError::NameUnknown(Some(self.requested.clone())).into())
    }
}

/// Parsed `/v2/*rest` path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RegistryPath {
    Catalog,
    TagsList { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    UploadStart { name: String },
    Upload { name: String, uuid: String },
}

impl RegistryPath {
    pub fn parse(rest: &str) -> Option<Self> {
        let rest = rest.trim_start_matches('/');
        if rest == "_catalog" {
            return Some(RegistryPath::Catalog);
        }

        let trailing_slash = rest.ends_with('/');
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        let n = segments.len();

        if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
            return Some(RegistryPath::TagsList {
                name: segments[..n - 2].join("/"),
            });
        }
        if n >= 3 && segments[n - 2] == "manifests" {
            return Some(RegistryPath::Manifest {
                name: segments[..n - 2].join("/"),
                reference: segments[n - 1].to_string(),
            });
        }
        if n >= 3 && segments[n - 2] == "blobs" && segments[n - 1] == "uploads" && trailing_slash
        {
            return Some(RegistryPath::UploadStart {
                name: segments[..n - 2].join("/"),
            });
        }
        if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" {
            return Some(RegistryPath::Upload {
                name: segments[..n - 3].join("/"),
                uuid: segments[n - 1].to_string(),
            });
        }
        if n >= 3 && segments[n - 2] == "blobs" {
            return Some(RegistryPath::Blob {
                name: segments[..n - 2].join("/"),
                digest: segments[n - 1].to_string(),
            });
        }
        None
    }
}

/// Collect query parameters without percent-decoding surprises.
pub(crate) fn query_map(uri: &http::Uri) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.insert(key.into_owned(), value.into_owned());
        }
    }
    map
}

async fn dispatch(
    axum::extract::State(wharf): axum::extract::State<Wharf>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let rest = path
        .strip_prefix("/v2")
        .unwrap_or("")
        .trim_start_matches('/');

    if rest.is_empty() {
        return match wharf.authorizer().authorize_base(req.headers()) {
            Ok(_) => auth::version_check_ok(),
            Err(response) => response,
        };
    }

    let Some(parsed) = RegistryPath::parse(rest) else {
        return errors::into_error_response(
            wharf_core::DistributionErrorCode::NameInvalid,
            Some(format!("unroutable path: {path}")),
        );
    };

    match (parsed, method.as_str()) {
        (RegistryPath::Catalog, "GET") => catalog::get_catalog(wharf, req).await,
        (RegistryPath::TagsList { name }, "GET") => tags::get_tags(wharf, req, name).await,
        (RegistryPath::Manifest { name, reference }, "GET") => {
            manifests::get_manifest(wharf, req, name, reference, false).await
        }
        (RegistryPath::Manifest { name, reference }, "HEAD") => {
            manifests::get_manifest(wharf, req, name, reference, true).await
        }
        (RegistryPath::Manifest { name, reference }, "PUT") => {
            manifests::put_manifest(wharf, req, name, reference).await
        }
        (RegistryPath::Manifest { name, reference }, "DELETE") => {
            manifests::delete_manifest(wharf, req, name, reference).await
        }
        (RegistryPath::Blob { name, digest }, "GET") => {
            blobs::get_blob(wharf, req, name, digest, false).await
        }
        (RegistryPath::Blob { name, digest }, "HEAD") => {
            blobs::get_blob(wharf, req, name, digest, true).await
        }
        (RegistryPath::UploadStart { name }, "POST") => {
            blobs::uploads_post(wharf, req, name).await
        }
        (RegistryPath::Upload { name, uuid }, "PATCH") => {
            blobs::uploads_patch(wharf, req, name, uuid).await
        }
        (RegistryPath::Upload { name, uuid }, "PUT") => {
            blobs::uploads_put(wharf, req, name, uuid).await
        }
        (RegistryPath::Upload { name, uuid }, "GET") => {
            blobs::uploads_get(wharf, req, name, uuid).await
        }
        _ => errors::into_error_response(
            wharf_core::DistributionErrorCode::Unsupported,
            None,
        ),
    }
}

async fn dispatch_extensions(
    axum::extract::State(wharf): axum::extract::State<Wharf>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let rest = path
        .strip_prefix("/extensions/v2")
        .unwrap_or("")
        .trim_start_matches('/');

    // /extensions/v2/<name>/signatures/<digest>
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    let n = segments.len();
    if n >= 3 && segments[n - 2] == "signatures" {
        let name = segments[..n - 2].join("/");
        let digest = segments[n - 1].to_string();
        return match method.as_str() {
            "GET" => signatures::get_signatures(wharf, req, name, digest).await,
            "PUT" => signatures::put_signatures(wharf, req, name, digest).await,
            _ => errors::into_error_response(
                wharf_core::DistributionErrorCode::Unsupported,
                None,
            ),
        };
    }
    errors::into_error_response(
        wharf_core::DistributionErrorCode::NameInvalid,
        Some(format!("unroutable path: {path}")),
    )
}

/// Shorthand for handlers converting `Result<Response>` bodies.
pub(crate) fn respond(result: Result<Response>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::catalog("_catalog", RegistryPath::Catalog)]
    #[case::tags("library/busybox/tags/list", RegistryPath::TagsList { name: "library/busybox".into() })]
    #[case::manifest_tag("alice/img/manifests/v1", RegistryPath::Manifest { name: "alice/img".into(), reference: "v1".into() })]
    #[case::manifest_single_segment("busybox/manifests/latest", RegistryPath::Manifest { name: "busybox".into(), reference: "latest".into() })]
    #[case::manifest_deep("docker-cache/library/busybox/manifests/1.36", RegistryPath::Manifest { name: "docker-cache/library/busybox".into(), reference: "1.36".into() })]
    #[case::blob("alice/img/blobs/sha256:abc", RegistryPath::Blob { name: "alice/img".into(), digest: "sha256:abc".into() })]
    #[case::upload_start("alice/img/blobs/uploads/", RegistryPath::UploadStart { name: "alice/img".into() })]
    #[case::upload("alice/img/blobs/uploads/123e4567-e89b-12d3-a456-426614174000", RegistryPath::Upload { name: "alice/img".into(), uuid: "123e4567-e89b-12d3-a456-426614174000".into() })]
    fn path_parsing(#[case] rest: &str, #[case] expected: RegistryPath) {
        assert_eq!(RegistryPath::parse(rest), Some(expected));
    }

    #[rstest]
    #[case::bare_name("busybox")]
    #[case::trailing_junk("busybox/manifests")]
    fn path_parsing_rejects(#[case] rest: &str) {
        assert_eq!(RegistryPath::parse(rest), None);
    }

    #[rstest]
    fn query_map_decodes() {
        let uri: http::Uri = "/v2/a/blobs/uploads/?mount=sha256%3Aabc&from=alice%2Fimg"
            .parse()
            .unwrap();
        let map = query_map(&uri);
        assert_eq!(map.get("mount").map(String::as_str), Some("sha256:abc"));
        assert_eq!(map.get("from").map(String::as_str), Some("alice/img"));
    }
}
