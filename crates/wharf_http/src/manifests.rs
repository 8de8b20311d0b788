//! Manifest pull (with content negotiation and pull-through), push and
//! delete.

use axum::body::StreamBody;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, StatusCode};
use hyper::body::Body;

use wharf_core::registry::{ContentRef, ManifestRecord, ManifestRef, RepositoryKind};
use wharf_core::Error as CoreError;
use wharf_core::ManifestSpec;
use wharf_tasks::ResourceKey;
use wharf_token::Action;

use super::errors::{Error, Result};
use super::{respond, Wharf};

fn manifest_headers(record: &ManifestRecord) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let digest: String = (&record.digest).into();
    headers.insert(
        HeaderName::from_lowercase(b"docker-content-digest")?,
        HeaderValue::from_str(&digest)?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(record.bytes_on_disk.to_string().as_str())?,
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.media_type)?,
    );
    Ok(headers)
}

/// Accept-header negotiation. An empty or wildcard accept set admits
/// anything; otherwise the stored media type must appear. Schema
/// conversion is not performed: clients that only accept older schemas
/// than what is stored are told the manifest does not exist.
fn acceptable(accept: Option<&HeaderValue>, stored_media_type: &str) -> bool {
    let Some(accept) = accept.and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let mut saw_concrete = false;
    for item in accept.split(',') {
        let media_type = item.split(';').next().unwrap_or(item).trim();
        if media_type.is_empty() {
            continue;
        }
        if media_type == "*/*" || media_type == "application/*" {
            return true;
        }
        saw_concrete = true;
        if media_type.eq_ignore_ascii_case(stored_media_type) {
            return true;
        }
    }
    !saw_concrete
}

pub(crate) async fn get_manifest(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    reference: String,
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
        let accept = req.headers().get(header::ACCEPT).cloned();
        let manifest_ref: ManifestRef = reference.parse()?;

        if !is_head {
            if let Some(cache) = wharf.cache() {
                if let Some(cached) = cache.get(&name, &reference, ctx.subject()) {
                    if acceptable(accept.as_ref(), &cached.media_type) {
                        let mut headers = HeaderMap::new();
                        headers.insert(
                            HeaderName::from_lowercase(b"docker-content-digest")?,
                            HeaderValue::from_str(&cached.digest)?,
                        );
                        headers.insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_str(&cached.media_type)?,
                        );
                        return Ok(
                            (StatusCode::OK, headers, cached.bytes.clone()).into_response()
                        );
                    }
                }
            }
        }

        let mut view = wharf.resolve_view(&name).await?;

        let mut found = match &view.store {
            Some(store) => {
                store
                    .manifest_store()
                    .head(view.version, &manifest_ref)
                    .await?
            }
            None => None,
        };

        // pull-through: a miss against a remote-backed view triggers a
        // synchronous single-image sync, for authenticated clients only
        if found.is_none() && view.pull_through {
            let (Some(remote), Some(fetcher)) = (view.remote.clone(), wharf.fetcher()) else {
                return Err(CoreError::ManifestUnknown(None).into());
            };
            if !ctx.is_authenticated() {
                return Ok(wharf.authorizer().unauthorized(
                    Some(&format!("repository:{name}:pull")),
                    "authentication required to fetch upstream content",
                ));
            }
            fetcher.fetch_image(&view.name, &remote, &reference).await?;
            view = wharf.resolve_view(&name).await?;
            found = match &view.store {
                Some(store) => {
                    store
                        .manifest_store()
                        .head(view.version, &manifest_ref)
                        .await?
                }
                None => None,
            };
        }

        let Some(record) = found else {
            return Err(CoreError::ManifestUnknown(None).into());
        };

        if !acceptable(accept.as_ref(), &record.media_type) {
            // stored form is a newer schema than the client accepts
            return Err(CoreError::ManifestUnknown(Some(format!(
                "manifest stored as {} which the client does not accept",
                record.media_type
            )))
            .into());
        }

        let headers = manifest_headers(&record)?;
        if is_head {
            return Ok((StatusCode::OK, headers, "").into_response());
        }

        let store = view.store()?;
        let Some((record, body)) = store
            .manifest_store()
            .get(view.version, &manifest_ref)
            .await?
        else {
            return Err(CoreError::ManifestUnknown(None).into());
        };

        // small manifests are buffered so they can land in the cache
        if wharf.cache().is_some() && record.bytes_on_disk <= 64 * 1024 {
            use futures::TryStreamExt;
            let chunks: Vec<Bytes> = body
                .try_collect()
                .await
                .map_err(|e| Error::InternalServerError(format!("{e}")))?;
            let bytes = Bytes::from(chunks.into_iter().flatten().collect::<Vec<u8>>());
            if let Some(cache) = wharf.cache() {
                cache.insert(
                    &name,
                    &reference,
                    ctx.subject(),
                    bytes.clone(),
                    record.media_type.clone(),
                    String::from(&record.digest),
                );
            }
            return Ok((StatusCode::OK, headers, bytes).into_response());
        }

        Ok((StatusCode::OK, headers, StreamBody::new(body)).into_response())
    }
    .await)
}

/// https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-manifests
pub(crate) async fn put_manifest(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    reference: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let manifest_ref: ManifestRef = reference.parse()?;
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let repository = wharf.push_target(&name).await?;

        let bytes = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| Error::InternalServerError(format!("{e}")))?;

        // deserialize non-destructively: the exact bytes the client sent
        // are what gets stored and served back
        let spec = ManifestSpec::parse(&bytes, content_type.as_deref())?;

        if let Some(content_type) = &content_type {
            if spec.media_type() != content_type {
                return Err(CoreError::ManifestInvalid(Some(format!(
                    "mediaType {} does not match content type {content_type}",
                    spec.media_type()
                )))
                .into());
            }
        }

        let record = repository
            .manifest_store()
            .put(&spec, bytes, true)
            .await?;

        let refs = match &manifest_ref {
            ManifestRef::Tag(tag) => vec![ContentRef::Tag {
                name: tag.clone(),
                manifest: Some(record.digest.clone()),
            }],
            ManifestRef::Digest(digest) => {
                if digest != &record.digest {
                    return Err(CoreError::DigestInvalid(Some(format!(
                        "content hashed to {}, request named {digest}",
                        record.digest
                    )))
                    .into());
                }
                vec![ContentRef::Manifest(record.digest.clone())]
            }
        };

        let version_store = repository.version_store();
        wharf
            .runtime()
            .run_exclusive(
                vec![ResourceKey::repository(repository.name())],
                async move { version_store.recursive_add(&refs).await },
            )
            .await?;

        if let Some(cache) = wharf.cache() {
            cache.invalidate_repository(&name);
        }

        let location = format!("/v2/{name}/manifests/{reference}");
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
        headers.insert(
            HeaderName::from_lowercase(b"docker-content-digest")?,
            HeaderValue::from_str(String::from(&record.digest).as_str())?,
        );
        Ok((StatusCode::CREATED, headers, "").into_response())
    }
    .await)
}

pub(crate) async fn delete_manifest(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    reference: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let manifest_ref: ManifestRef = reference.parse()?;
        let view = wharf.resolve_view(&name).await?;
        let repository = view.store()?.clone();

        if repository.kind() != RepositoryKind::Push {
            return Err(CoreError::Denied(Some(
                "repository is sync-backed and read-only".to_string(),
            ))
            .into());
        }

        let version_store = repository.version_store();
        wharf
            .runtime()
            .run_exclusive(
                vec![ResourceKey::repository(repository.name())],
                async move {
                    match manifest_ref {
                        // deleting a tag unbinds the name only
                        ManifestRef::Tag(tag) => version_store.untag(&tag).await,
                        // deleting by digest removes the manifest closure
                        ManifestRef::Digest(digest) => {
                            version_store
                                .recursive_remove(&[ContentRef::Manifest(digest)])
                                .await
                        }
                    }
                },
            )
            .await?;

        if let Some(cache) = wharf.cache() {
            cache.invalidate_repository(&name);
        }

        Ok((StatusCode::ACCEPTED, "").into_response())
    }
    .await)
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use wharf_core::media_types::*;

    fn hv(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[rstest]
    fn no_accept_header_admits_anything() {
        assert!(acceptable(None, OCI_MANIFEST));
    }

    #[rstest]
    fn exact_match_is_accepted() {
        let v = hv(DOCKER_MANIFEST_V2);
        assert!(acceptable(Some(&v), DOCKER_MANIFEST_V2));
    }

    #[rstest]
    fn wildcard_is_accepted() {
        let v = hv("*/*");
        assert!(acceptable(Some(&v), OCI_INDEX));
    }

    #[rstest]
    fn v1_only_client_is_refused_v2_content() {
        let v = hv(DOCKER_MANIFEST_V1_SIGNED);
        assert!(!acceptable(Some(&v), DOCKER_MANIFEST_V2));
    }

    #[rstest]
    fn multi_value_accept() {
        let v = hv(&format!(
            "{DOCKER_MANIFEST_V2}, {OCI_MANIFEST};q=0.9, {OCI_INDEX}"
        ));
        assert!(acceptable(Some(&v), OCI_MANIFEST));
        assert!(!acceptable(Some(&v), DOCKER_MANIFEST_V1));
    }
}
