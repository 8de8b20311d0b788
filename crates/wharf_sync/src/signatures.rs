//! Signature discovery during sync.
//!
//! Upstreams expose image signatures in three layouts: the Docker API
//! signatures extension (`/extensions/v2/<name>/signatures/<digest>`),
//! cosign objects stored as tags named `sha256-<hex>.sig` (and `.att` /
//! `.sbom` attachments), and external sigstores laid out as
//! `{sigstore}/{name}@{algo}={hex}/signature-{n}`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use uuid::Uuid;

use wharf_core::registry::{ContentRef, Remote, RepositoryStore, SignatureKind};
use wharf_core::ManifestSpec;
use wharf_core::OciDigest;

use super::client::UpstreamClient;
use super::errors::Result;
use super::sync::SyncJob;

/// Safety bound on sigstore enumeration; no sane image carries more.
const MAX_SIGSTORE_SIGNATURES: u32 = 100;

const COSIGN_ATTACHMENT_SUFFIXES: &[&str] = &[".sig", ".att", ".sbom"];

#[derive(Debug, Deserialize)]
struct ExtensionSignature {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtensionSignatureList {
    #[serde(default)]
    signatures: Vec<ExtensionSignature>,
}

fn generated_name(manifest_digest: &OciDigest) -> String {
    format!("{}@{}", manifest_digest, Uuid::new_v4().simple())
}

/// Discover and ingest every signature upstream holds for
/// `manifest_digest`. Returns extra content refs (cosign attachment tags)
/// the caller should include in the new repository version; signature rows
/// themselves ride into versions through their manifest's closure.
pub(crate) async fn discover_and_ingest(
    client: &mut UpstreamClient,
    remote: &Remote,
    repository: &Arc<dyn RepositoryStore>,
    manifest_digest: &OciDigest,
    job: &SyncJob,
) -> Result<Vec<ContentRef>> {
    let signature_store = repository.signature_store();
    let mut extra_refs = Vec::new();

    // 1. the signatures API extension, when advertised
    if let Some(document) = client.get_signatures_extension(manifest_digest).await? {
        let list: ExtensionSignatureList = serde_json::from_value(document)?;
        for signature in list.signatures {
            let Some(content) = signature.content else {
                continue;
            };
            let Ok(payload) = BASE64.decode(content.as_bytes()) else {
                tracing::warn!("discarding signature with undecodable content");
                continue;
            };
            let kind = match signature.kind.as_deref() {
                Some("cosign") => SignatureKind::Cosign,
                _ => SignatureKind::Atomic,
            };
            let name = signature
                .name
                .unwrap_or_else(|| generated_name(manifest_digest));
            signature_store
                .put(&name, manifest_digest, kind, None, Bytes::from(payload))
                .await?;
        }
    }

    // 2. cosign objects stored under tag conventions
    for suffix in COSIGN_ATTACHMENT_SUFFIXES {
        let tag = format!(
            "{}-{}{}",
            manifest_digest.algorithm().as_str(),
            manifest_digest.encoded(),
            suffix,
        );
        let Some(fetched) = client.get_manifest(&tag).await? else {
            continue;
        };
        let spec = ManifestSpec::parse(&fetched.bytes, Some(&fetched.media_type))?;

        // payloads are the simplesigning layer blobs; capture the bytes as
        // they download so the signature row stores the exact payload
        if *suffix == ".sig" {
            for layer in spec.blob_digests()? {
                let payload = match repository.blob_store().head_global(&layer).await? {
                    Some(_) => None,
                    None => {
                        let response = client.get_blob(&layer).await?;
                        let bytes = response.bytes().await?;
                        let len = bytes.len() as u64;
                        repository
                            .blob_store()
                            .put(&layer, len, hyper::body::Body::from(bytes.clone()))
                            .await?;
                        Some(bytes)
                    }
                };
                if let Some(payload) = payload {
                    let name = format!("{manifest_digest}@{}", layer.encoded());
                    signature_store
                        .put(
                            &name,
                            manifest_digest,
                            SignatureKind::Cosign,
                            None,
                            payload,
                        )
                        .await?;
                }
            }
        }

        let attachment = job.ingest_manifest_tree(client, fetched).await?;
        extra_refs.push(ContentRef::Tag {
            name: tag,
            manifest: Some(attachment),
        });
    }

    // 3. external sigstore layout
    if let Some(sigstore) = &remote.sigstore {
        for index in 1..=MAX_SIGSTORE_SIGNATURES {
            let Some(payload) = client
                .get_sigstore_signature(sigstore, manifest_digest, index)
                .await?
            else {
                break;
            };
            let name = format!("{manifest_digest}@signature-{index}");
            signature_store
                .put(
                    &name,
                    manifest_digest,
                    SignatureKind::Atomic,
                    None,
                    payload,
                )
                .await?;
        }
    }

    Ok(extra_refs)
}
