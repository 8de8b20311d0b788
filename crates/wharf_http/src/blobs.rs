//! Blob pull and the upload state machine.
//!
//! Uploads move through `POST` (open, cross-repo mount, or monolithic),
//! `PATCH` (contiguous chunk append) and `PUT` (finalize against the
//! client digest). Finalization commits the blob into a new repository
//! version under the repository's write reservation; contention surfaces
//! as `429 Too Many Requests` with no suggested retry interval.

use axum::body::StreamBody;
use axum::response::{IntoResponse, Response};
use headers::{Header, HeaderMapExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, StatusCode};
use hyper::body::Body;
use uuid::Uuid;

use wharf_core::registry::{BlobContent, ContentRef, DownloadPolicy};
use wharf_core::Error as CoreError;
use wharf_core::OciDigest;
use wharf_tasks::ResourceKey;
use wharf_token::Action;

use super::errors::{Error, Result};
use super::headers::{ContentRange, Range};
use super::{query_map, respond, Wharf};

fn digest_headers(digest: &str, length: Option<i64>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_lowercase(b"docker-content-digest")?,
        HeaderValue::from_str(digest)?,
    );
    if let Some(length) = length {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(length.to_string().as_str())?,
        );
    }
    Ok(headers)
}

fn upload_headers(name: &str, uuid: &Uuid, last_range_end: i64) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    headers.insert(
        HeaderName::from_lowercase(b"docker-upload-uuid")?,
        HeaderValue::from_str(uuid.to_string().as_str())?,
    );
    let range = Range {
        start: 0,
        end: last_range_end.max(0) as u64,
    };
    let range: String = (&range).into();
    headers.insert(Range::name().clone(), HeaderValue::from_str(&range)?);
    Ok(headers)
}

pub(crate) async fn get_blob(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    digest: String,
    is_head: bool,
) -> Response {
    let ctx = match wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Pull)
    {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let oci_digest: OciDigest = digest.as_str().try_into().map_err(Error::from)?;

        if let Some(store) = &view.store {
            let blob_store = store.blob_store();
            if is_head {
                if let Some(blob) = blob_store.head(view.version, &oci_digest).await? {
                    let headers = digest_headers(&digest, Some(blob.bytes_on_disk))?;
                    return Ok((StatusCode::OK, headers, "").into_response());
                }
            } else if let Some((blob, content)) =
                blob_store.get(view.version, &oci_digest).await?
            {
                return match content {
                    BlobContent::Redirect(url) => {
                        let mut headers = digest_headers(&digest, None)?;
                        headers.insert(header::LOCATION, HeaderValue::from_str(&url)?);
                        Ok((StatusCode::FOUND, headers, "").into_response())
                    }
                    BlobContent::Stream(stream) => {
                        let headers = digest_headers(&digest, Some(blob.bytes_on_disk))?;
                        Ok((StatusCode::OK, headers, StreamBody::new(stream)).into_response())
                    }
                };
            }
        }

        // deferred or proxied content behind a pull-through remote
        if let (Some(remote), Some(fetcher)) = (&view.remote, wharf.fetcher()) {
            if remote.policy != DownloadPolicy::Immediate {
                if !ctx.is_authenticated() {
                    return Ok(wharf.authorizer().unauthorized(
                        Some(&format!("repository:{name}:pull")),
                        "authentication required to fetch upstream content",
                    ));
                }
                if let Some(stream) = fetcher
                    .fetch_blob(&view.name, remote, &oci_digest)
                    .await?
                {
                    // streamed policy: proxy without storing
                    let headers = digest_headers(&digest, None)?;
                    return Ok(
                        (StatusCode::OK, headers, StreamBody::new(stream)).into_response()
                    );
                }
                // on_demand policy stored it; read back from our store
                let store = match &view.store {
                    Some(store) => store.clone(),
                    None => wharf.resolve_view(&name).await?.store()?.clone(),
                };
                if let Some((blob, content)) = store.blob_store().get(None, &oci_digest).await? {
                    return match content {
                        BlobContent::Redirect(url) => {
                            let mut headers = digest_headers(&digest, None)?;
                            headers.insert(header::LOCATION, HeaderValue::from_str(&url)?);
                            Ok((StatusCode::FOUND, headers, "").into_response())
                        }
                        BlobContent::Stream(stream) => {
                            let headers = digest_headers(&digest, Some(blob.bytes_on_disk))?;
                            Ok((StatusCode::OK, headers, StreamBody::new(stream))
                                .into_response())
                        }
                    };
                }
            }
        }

        Err(CoreError::BlobUnknown(None).into())
    }
    .await)
}

// /v2/<name>/blobs/uploads/
//
// three cases:
// * cross-repository mount (`?mount=<digest>&from=<repo>`)
// * monolithic upload (`?digest=<digest>` with the body attached)
// * open a session for POST-PUT or POST-PATCH-PUT
pub(crate) async fn uploads_post(wharf: Wharf, req: Request<Body>, name: String) -> Response {
    let ctx = match wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };

    respond(async {
        let repository = wharf.push_target(&name).await?;
        let params = query_map(req.uri());

        if let (Some(mount), Some(from)) = (params.get("mount"), params.get("from")) {
            let oci_digest: OciDigest = mount.as_str().try_into().map_err(Error::from)?;

            // the mount only succeeds when the bearer may read the source
            // repository and the blob is present there; otherwise fall
            // through to a regular upload session
            let source_readable = wharf
                .authorizer()
                .authorize_repository(req.headers(), from, Action::Pull)
                .is_ok();
            let mut mounted = false;
            if source_readable {
                if let Ok(source_view) = wharf.resolve_view(from).await {
                    if let Some(source_store) = &source_view.store {
                        if source_store
                            .blob_store()
                            .head(source_view.version, &oci_digest)
                            .await?
                            .is_some()
                        {
                            let version_store = repository.version_store();
                            let digest_for_add = oci_digest.clone();
                            wharf
                                .runtime()
                                .try_run_exclusive(
                                    vec![ResourceKey::repository(repository.name())],
                                    async move {
                                        version_store
                                            .recursive_add(&[ContentRef::Blob(digest_for_add)])
                                            .await
                                    },
                                )
                                .await
                                .map_err(|_| CoreError::TooManyRequests)??;
                            mounted = true;
                        }
                    }
                }
            }

            if mounted {
                tracing::info!(
                    repository = name,
                    from,
                    digest = %oci_digest,
                    user = ctx.subject().unwrap_or("-"),
                    "cross-repository blob mount",
                );
                let location = format!("/v2/{name}/blobs/{mount}");
                let mut headers = digest_headers(mount, None)?;
                headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
                return Ok((StatusCode::CREATED, headers, "").into_response());
            }
        }

        if let Some(digest) = params.get("digest") {
            // single-shot monolithic upload
            let oci_digest: OciDigest = digest.as_str().try_into().map_err(Error::from)?;
            let content_length = req
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(Error::MissingHeader("Content-Length"))?;

            let blob_store = repository.blob_store();
            blob_store
                .put(&oci_digest, content_length, req.into_body())
                .await?;

            let version_store = repository.version_store();
            let digest_for_add = oci_digest.clone();
            wharf
                .runtime()
                .try_run_exclusive(
                    vec![ResourceKey::repository(repository.name())],
                    async move {
                        version_store
                            .recursive_add(&[ContentRef::Blob(digest_for_add)])
                            .await
                    },
                )
                .await
                .map_err(|_| CoreError::TooManyRequests)??;

            let location = format!("/v2/{name}/blobs/{digest}");
            let mut headers = digest_headers(digest, None)?;
            headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
            return Ok((StatusCode::CREATED, headers, "").into_response());
        }

        let session = repository
            .upload_session_store()
            .new_upload_session()
            .await?;
        let headers = upload_headers(&name, &session.uuid, session.last_range_end)?;
        Ok((StatusCode::ACCEPTED, headers, "").into_response())
    }
    .await)
}

pub(crate) async fn uploads_patch(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    uuid: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let repository = view.store()?.clone();
        let session_uuid = Uuid::parse_str(&uuid)
            .map_err(|e| Error::from(CoreError::from(e)))?;

        let content_range = req.headers().typed_get::<ContentRange>();
        let content_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let start = content_range.as_ref().map(|r| r.start);

        let blob_store = repository.blob_store();
        let mut writer = blob_store.resume(&session_uuid, start).await?;
        let session = match content_length {
            Some(content_length) => writer.write(content_length, req.into_body()).await?,
            None => writer.write_chunked(req.into_body()).await?,
        };

        let headers = upload_headers(&name, &session_uuid, session.last_range_end)?;
        Ok((StatusCode::ACCEPTED, headers, "").into_response())
    }
    .await)
}

// /v2/<name>/blobs/uploads/<uuid>
//
// finalization of either flavor of upload:
// * POST-PUT monolithic: the entire blob is the PUT body
// * POST-PATCH-PUT chunked: the PUT may carry a final chunk
//
// both require the `digest` query parameter naming the whole blob.
pub(crate) async fn uploads_put(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    uuid: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let repository = view.store()?.clone();
        let session_uuid = Uuid::parse_str(&uuid)
            .map_err(|e| Error::from(CoreError::from(e)))?;

        let params = query_map(req.uri());
        let digest = params
            .get("digest")
            .ok_or(Error::MissingQueryParameter("digest"))?
            .clone();
        let oci_digest: OciDigest = digest.as_str().try_into().map_err(Error::from)?;

        let session_store = repository.upload_session_store();
        let session = session_store.get_upload_session(&session_uuid).await?;

        let content_range = req.headers().typed_get::<ContentRange>();
        let content_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let start = content_range.as_ref().map(|r| r.start);

        let blob_store = repository.blob_store();
        match session.upload_id {
            // POST-PATCH-PUT: optionally a final chunk, then assemble
            Some(_) => {
                if let Some(content_length) = content_length {
                    if content_length > 0 {
                        let mut writer = blob_store.resume(&session_uuid, start).await?;
                        writer.write(content_length, req.into_body()).await?;
                    }
                }
                let mut writer = blob_store.resume(&session_uuid, None).await?;
                writer.finalize(&oci_digest).await?;
            }
            // POST-PUT: the body is the whole blob
            None => {
                let content_length =
                    content_length.ok_or(Error::MissingHeader("Content-Length"))?;
                blob_store
                    .put(&oci_digest, content_length, req.into_body())
                    .await?;
            }
        }

        // the commit into a new repository version runs under the
        // repository reservation; contention is the client's problem
        let version_store = repository.version_store();
        let digest_for_add = oci_digest.clone();
        wharf
            .runtime()
            .try_run_exclusive(
                vec![ResourceKey::repository(repository.name())],
                async move {
                    version_store
                        .recursive_add(&[ContentRef::Blob(digest_for_add)])
                        .await
                },
            )
            .await
            .map_err(|_| CoreError::TooManyRequests)??;

        if let Err(e) = session_store.delete_session(&session_uuid).await {
            tracing::warn!("failed to delete session: {e:?}");
        }

        let location = format!("/v2/{name}/blobs/{digest}");
        let mut headers = digest_headers(&digest, None)?;
        headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
        headers.insert(
            HeaderName::from_lowercase(b"docker-upload-uuid")?,
            HeaderValue::from_str(&uuid)?,
        );
        Ok((StatusCode::CREATED, headers, "").into_response())
    }
    .await)
}

pub(crate) async fn uploads_get(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    uuid: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let repository = view.store()?.clone();
        let session_uuid = Uuid::parse_str(&uuid)
            .map_err(|e| Error::from(CoreError::from(e)))?;

        let session = repository
            .upload_session_store()
            .get_upload_session(&session_uuid)
            .await?;

        let headers = upload_headers(&name, &session.uuid, session.last_range_end)?;
        Ok((StatusCode::NO_CONTENT, headers, "").into_response())
    }
    .await)
}
