//! The signatures API extension:
//! `GET`/`PUT /extensions/v2/<name>/signatures/<digest>`.

use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{Request, StatusCode};
use hyper::body::Body;
use serde::{Deserialize, Serialize};

use wharf_core::registry::{ContentRef, ManifestRef, SignatureKind};
use wharf_core::Error as CoreError;
use wharf_core::OciDigest;
use wharf_tasks::ResourceKey;
use wharf_token::Action;

use super::errors::{Error, Result};
use super::{respond, Wharf};

#[derive(Serialize)]
struct SignatureRead {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Serialize)]
struct SignatureListRead {
    signatures: Vec<SignatureRead>,
}

#[derive(Deserialize)]
struct SignatureWrite {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    content: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignatureWriteBody {
    List { signatures: Vec<SignatureWrite> },
    Single(SignatureWrite),
}

pub(crate) async fn get_signatures(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    digest: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Pull)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let store = view.store()?;
        let oci_digest: OciDigest = digest.as_str().try_into().map_err(Error::from)?;

        let signature_store = store.signature_store();
        let records = signature_store.list(view.version, &oci_digest).await?;

        let mut signatures = Vec::with_capacity(records.len());
        for record in &records {
            let payload = signature_store.read(record).await?;
            signatures.push(SignatureRead {
                name: record.name.clone(),
                kind: record.kind.as_str().to_string(),
                content: BASE64.encode(&payload),
            });
        }

        Ok((StatusCode::OK, Json(SignatureListRead { signatures })).into_response())
    }
    .await)
}

pub(crate) async fn put_signatures(
    wharf: Wharf,
    req: Request<Body>,
    name: String,
    digest: String,
) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Push)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let store = view.store()?.clone();
        let oci_digest: OciDigest = digest.as_str().try_into().map_err(Error::from)?;

        // the signed manifest must be present in the served version
        if store
            .manifest_store()
            .head(view.version, &ManifestRef::Digest(oci_digest.clone()))
            .await?
            .is_none()
        {
            return Err(CoreError::ManifestUnknown(Some(digest.clone())).into());
        }

        let bytes = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| Error::InternalServerError(format!("{e}")))?;
        let body: SignatureWriteBody = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::ManifestInvalid(Some(format!("bad signature body: {e}"))))?;
        let writes = match body {
            SignatureWriteBody::List { signatures } => signatures,
            SignatureWriteBody::Single(signature) => vec![signature],
        };

        let signature_store = store.signature_store();
        let mut refs = Vec::with_capacity(writes.len());
        for write in writes {
            let payload = BASE64.decode(write.content.as_bytes()).map_err(|e| {
                CoreError::ManifestInvalid(Some(format!("undecodable signature content: {e}")))
            })?;
            let kind = match write.kind.as_deref() {
                Some("cosign") => SignatureKind::Cosign,
                Some("atomic") | None => SignatureKind::Atomic,
                Some(other) => {
                    return Err(CoreError::ManifestInvalid(Some(format!(
                        "unknown signature type: {other}"
                    )))
                    .into())
                }
            };
            let signature_name = write
                .name
                .unwrap_or_else(|| format!("{oci_digest}@{}", uuid::Uuid::new_v4().simple()));
            let record = signature_store
                .put(
                    &signature_name,
                    &oci_digest,
                    kind,
                    None,
                    Bytes::from(payload),
                )
                .await?;
            refs.push(ContentRef::Signature { id: record.id });
        }

        let version_store = store.version_store();
        wharf
            .runtime()
            .run_exclusive(
                vec![ResourceKey::repository(store.name())],
                async move { version_store.recursive_add(&refs).await },
            )
            .await?;

        Ok((StatusCode::CREATED, "").into_response())
    }
    .await)
}
