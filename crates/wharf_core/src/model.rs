//! Wire model for the manifest flavors the registry accepts: Docker schema1
//! (bare and JWS-signed), Docker schema2 manifests and manifest lists, and
//! OCI image manifests and indexes.
//!
//! The registry must store the exact bytes a client or upstream sent while
//! also understanding enough of the document to walk its references, so
//! these types deserialize non-destructively from the raw body and the raw
//! body is always what lands in the object store.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::media_types::{self, MediaTypeRegistry};
use crate::oci_digest::OciDigest;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Docker schema2 manifest or OCI image manifest.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Docker manifest list or OCI image index.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    pub v1_compatibility: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JwsSignature {
    pub protected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<serde_json::Value>,
    pub signature: String,
}

/// The payload framing carried in a schema1 JWS `protected` header.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JwsProtected {
    format_length: usize,
    format_tail: String,
}

/// Docker schema1 manifest, optionally carrying a `signatures` JWS block.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV1 {
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<V1History>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<JwsSignature>>,
}

/// Characteristic flags derived once at ingest from media types and labels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristics {
    pub is_bootable: bool,
    pub is_flatpak: bool,
    pub is_helm: bool,
    pub is_cosign_signature: bool,
}

/// Tagged view over the manifest flavors, sharing the raw bytes and the
/// digest computed over their canonical form.
#[derive(Clone, Debug)]
pub enum ManifestSpec {
    Image(ImageManifest),
    List(ManifestList),
    V1(ManifestV1),
}

impl ManifestSpec {
    /// Deserialize manifest bytes, preferring the declared media type when
    /// the client provided one and falling back to shape detection.
    pub fn parse(bytes: &[u8], media_type: Option<&str>) -> Result<Self> {
        match media_type {
            Some(media_types::DOCKER_MANIFEST_V1)
            | Some(media_types::DOCKER_MANIFEST_V1_SIGNED) => {
                let m: ManifestV1 = serde_json::from_slice(bytes)
                    .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
                return Ok(ManifestSpec::V1(m));
            }
            Some(mt) if media_types::is_list_type(mt) => {
                let m: ManifestList = serde_json::from_slice(bytes)
                    .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
                return Ok(ManifestSpec::List(m));
            }
            Some(media_types::DOCKER_MANIFEST_V2) | Some(media_types::OCI_MANIFEST) => {
                let m: ImageManifest = serde_json::from_slice(bytes)
                    .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
                return Ok(ManifestSpec::Image(m));
            }
            _ => {}
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
        let schema_version = value.get("schemaVersion").and_then(|v| v.as_u64());
        if schema_version == Some(1) {
            let m: ManifestV1 = serde_json::from_value(value)
                .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
            Ok(ManifestSpec::V1(m))
        } else if value.get("manifests").is_some() {
            let m: ManifestList = serde_json::from_value(value)
                .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
            Ok(ManifestSpec::List(m))
        } else {
            let m: ImageManifest = serde_json::from_value(value)
                .map_err(|e| Error::ManifestInvalid(Some(format!("{e}"))))?;
            Ok(ManifestSpec::Image(m))
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            ManifestSpec::Image(m) => m.schema_version,
            ManifestSpec::List(m) => m.schema_version,
            ManifestSpec::V1(m) => m.schema_version,
        }
    }

    /// The effective media type, honoring an embedded `mediaType` field and
    /// falling back to the flavor's canonical type.
    pub fn media_type(&self) -> &str {
        match self {
            ManifestSpec::Image(m) => m
                .media_type
                .as_deref()
                .unwrap_or(media_types::OCI_MANIFEST),
            ManifestSpec::List(m) => m.media_type.as_deref().unwrap_or(media_types::OCI_INDEX),
            ManifestSpec::V1(m) => {
                if m.signatures.is_some() {
                    media_types::DOCKER_MANIFEST_V1_SIGNED
                } else {
                    media_types::DOCKER_MANIFEST_V1
                }
            }
        }
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        match self {
            ManifestSpec::Image(m) => m.annotations.as_ref(),
            ManifestSpec::List(m) => m.annotations.as_ref(),
            ManifestSpec::V1(_) => None,
        }
    }

    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        match self {
            ManifestSpec::Image(m) => Some(&m.config),
            _ => None,
        }
    }

    /// Digests of the blobs this manifest references directly (config and
    /// layers). Empty for manifest lists.
    pub fn blob_digests(&self) -> Result<Vec<OciDigest>> {
        match self {
            ManifestSpec::Image(m) => {
                let mut digests = Vec::with_capacity(m.layers.len() + 1);
                digests.push(OciDigest::try_from(m.config.digest.as_str())?);
                for layer in &m.layers {
                    digests.push(OciDigest::try_from(layer.digest.as_str())?);
                }
                Ok(digests)
            }
            ManifestSpec::List(_) => Ok(vec![]),
            ManifestSpec::V1(m) => m
                .fs_layers
                .iter()
                .map(|l| OciDigest::try_from(l.blob_sum.as_str()))
                .collect(),
        }
    }

    /// Digests of sub-manifests, present only for lists/indexes.
    pub fn child_digests(&self) -> Result<Vec<OciDigest>> {
        match self {
            ManifestSpec::List(m) => m
                .manifests
                .iter()
                .map(|d| OciDigest::try_from(d.digest.as_str()))
                .collect(),
            _ => Ok(vec![]),
        }
    }

    /// Extract image labels. Schema1 manifests embed the image config in
    /// their history entries; schema2/OCI labels arrive via the config blob
    /// and are extracted separately when that blob is available.
    pub fn labels(&self) -> HashMap<String, String> {
        match self {
            ManifestSpec::V1(m) => m
                .history
                .first()
                .and_then(|h| labels_from_config_bytes(h.v1_compatibility.as_bytes()))
                .unwrap_or_default(),
            _ => HashMap::new(),
        }
    }

    /// Derive the characteristic flags exposed on stored manifests.
    pub fn characteristics(&self, labels: &HashMap<String, String>) -> Characteristics {
        let annotations = self.annotations().cloned().unwrap_or_default();
        let has = |key: &str| labels.contains_key(key) || annotations.contains_key(key);

        let (is_helm, is_cosign_signature) = match self {
            ManifestSpec::Image(m) => (
                m.config.media_type == media_types::HELM_CONFIG,
                m.layers
                    .iter()
                    .all(|l| l.media_type == media_types::COSIGN_SIMPLESIGNING)
                    && !m.layers.is_empty(),
            ),
            _ => (false, false),
        };

        Characteristics {
            is_bootable: has("containers.bootc"),
            is_flatpak: has("org.flatpak.ref"),
            is_helm,
            is_cosign_signature,
        }
    }

    /// Validate manifest structure and media types against the registry's
    /// allow-list. Schema1 manifests have no config descriptor and skip the
    /// artifact check.
    pub fn validate(&self, registry: &MediaTypeRegistry) -> Result<()> {
        match self {
            ManifestSpec::Image(m) => {
                if m.schema_version != 2 {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "unexpected schemaVersion {} for image manifest",
                        m.schema_version
                    ))));
                }
                let layer_types: Vec<&str> =
                    m.layers.iter().map(|l| l.media_type.as_str()).collect();
                registry.validate_artifact(&m.config.media_type, &layer_types)
            }
            ManifestSpec::List(m) => {
                if m.schema_version != 2 {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "unexpected schemaVersion {} for manifest list",
                        m.schema_version
                    ))));
                }
                for d in &m.manifests {
                    if !media_types::is_manifest_type(&d.media_type) {
                        return Err(Error::ManifestInvalid(Some(format!(
                            "list references non-manifest media type {}",
                            d.media_type
                        ))));
                    }
                }
                Ok(())
            }
            ManifestSpec::V1(m) => {
                if m.schema_version != 1 {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "unexpected schemaVersion {} for schema1 manifest",
                        m.schema_version
                    ))));
                }
                if m.fs_layers.len() != m.history.len() {
                    return Err(Error::ManifestInvalid(Some(
                        "fsLayers and history length mismatch".to_string(),
                    )));
                }
                Ok(())
            }
        }
    }

    /// Compute the digest the manifest is stored under.
    ///
    /// For JWS-signed schema1 manifests the signature block is stripped
    /// before hashing by reconstructing the signed payload from the
    /// `protected` header's `formatLength`/`formatTail` framing. All other
    /// flavors hash the exact received bytes.
    pub fn canonical_digest(&self, raw: &[u8]) -> Result<OciDigest> {
        if let ManifestSpec::V1(m) = self {
            if let Some(signatures) = &m.signatures {
                let sig = signatures.first().ok_or_else(|| {
                    Error::ManifestInvalid(Some("empty signatures block".to_string()))
                })?;
                let protected_raw =
                    URL_SAFE_NO_PAD.decode(sig.protected.as_bytes()).map_err(|e| {
                        Error::ManifestInvalid(Some(format!("bad protected header: {e}")))
                    })?;
                let protected: JwsProtected =
                    serde_json::from_slice(&protected_raw).map_err(|e| {
                        Error::ManifestInvalid(Some(format!("bad protected header: {e}")))
                    })?;
                if protected.format_length > raw.len() {
                    return Err(Error::ManifestInvalid(Some(
                        "formatLength exceeds manifest size".to_string(),
                    )));
                }
                let tail = URL_SAFE_NO_PAD
                    .decode(protected.format_tail.as_bytes())
                    .map_err(|e| {
                        Error::ManifestInvalid(Some(format!("bad formatTail: {e}")))
                    })?;
                let mut payload = Vec::with_capacity(protected.format_length + tail.len());
                payload.extend_from_slice(&raw[..protected.format_length]);
                payload.extend_from_slice(&tail);
                return Ok(OciDigest::from(payload.as_slice()));
            }
        }
        Ok(OciDigest::from(raw))
    }
}

/// Pull `config.Labels` (or the flat `Labels` of a schema1 v1Compatibility
/// entry) out of an image configuration document.
pub fn labels_from_config_bytes(bytes: &[u8]) -> Option<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let labels = value
        .get("config")
        .and_then(|c| c.get("Labels"))
        .or_else(|| value.get("Labels"))?;
    let map = labels.as_object()?;
    Some(
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}

/// Response body of `/v2/<name>/tags/list`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use crate::media_types::*;

    fn oci_manifest_json() -> String {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": OCI_CONFIG,
                "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
                "size": 7023,
            },
            "layers": [
                {
                    "mediaType": OCI_LAYER_TAR_GZIP,
                    "digest": "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0",
                    "size": 32654,
                },
            ],
            "annotations": {"org.opencontainers.image.source": "https://example.com"},
        })
        .to_string()
    }

    #[rstest]
    fn parse_oci_manifest() {
        let raw = oci_manifest_json();
        let spec = ManifestSpec::parse(raw.as_bytes(), None).unwrap();
        assert_eq!(spec.media_type(), OCI_MANIFEST);
        assert_eq!(spec.schema_version(), 2);
        let blobs = spec.blob_digests().unwrap();
        assert_eq!(blobs.len(), 2);
        assert!(spec.child_digests().unwrap().is_empty());
        assert!(spec.validate(&MediaTypeRegistry::default()).is_ok());
    }

    #[rstest]
    fn parse_manifest_list() {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_LIST,
            "manifests": [
                {
                    "mediaType": DOCKER_MANIFEST_V2,
                    "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
                    "size": 7143,
                    "platform": {"architecture": "ppc64le", "os": "linux"},
                },
                {
                    "mediaType": DOCKER_MANIFEST_V2,
                    "digest": "sha256:5b0bcabd1ed22e9fb1310cf6c2dec7cdef19f0ad69efa1f392e94a4333501270",
                    "size": 7682,
                    "platform": {"architecture": "amd64", "os": "linux"},
                },
            ],
        })
        .to_string();
        let spec = ManifestSpec::parse(raw.as_bytes(), Some(DOCKER_MANIFEST_LIST)).unwrap();
        assert!(matches!(spec, ManifestSpec::List(_)));
        assert_eq!(spec.child_digests().unwrap().len(), 2);
        assert!(spec.validate(&MediaTypeRegistry::default()).is_ok());
    }

    #[rstest]
    fn helm_and_cosign_characteristics() {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": HELM_CONFIG,
                "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
                "size": 153,
            },
            "layers": [{
                "mediaType": HELM_CHART,
                "digest": "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0",
                "size": 32654,
            }],
        })
        .to_string();
        let spec = ManifestSpec::parse(raw.as_bytes(), None).unwrap();
        let ch = spec.characteristics(&HashMap::new());
        assert!(ch.is_helm);
        assert!(!ch.is_cosign_signature);

        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": COSIGN_CONFIG,
                "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
                "size": 153,
            },
            "layers": [{
                "mediaType": COSIGN_SIMPLESIGNING,
                "digest": "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0",
                "size": 256,
            }],
        })
        .to_string();
        let spec = ManifestSpec::parse(raw.as_bytes(), None).unwrap();
        assert!(spec.characteristics(&HashMap::new()).is_cosign_signature);
    }

    #[rstest]
    fn schema1_signed_digest_strips_signatures() {
        let base = r#"{"schemaVersion":1,"name":"library/busybox","tag":"1.36","architecture":"amd64","fsLayers":[{"blobSum":"sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0"}],"history":[{"v1Compatibility":"{\"id\":\"x\"}"}]}"#;
        // The signed payload is the manifest without its closing brace plus
        // the formatTail bytes; docker clients construct signatures the same
        // way.
        let body = &base[..base.len() - 1];
        let tail = "}";
        let protected = serde_json::json!({
            "formatLength": body.len(),
            "formatTail": URL_SAFE_NO_PAD.encode(tail),
        });
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
        let raw = format!(
            "{body},\"signatures\":[{{\"protected\":\"{protected_b64}\",\"signature\":\"abc\"}}]}}"
        );

        let spec = ManifestSpec::parse(raw.as_bytes(), None).unwrap();
        assert_eq!(spec.media_type(), DOCKER_MANIFEST_V1_SIGNED);
        let digest = spec.canonical_digest(raw.as_bytes()).unwrap();
        assert_eq!(digest, OciDigest::from(base.as_bytes()));
    }

    #[rstest]
    fn schema1_labels_from_history() {
        let config = serde_json::json!({
            "id": "x",
            "config": {"Labels": {"org.flatpak.ref": "app/org.example.App/x86_64/stable"}},
        })
        .to_string();
        let raw = serde_json::json!({
            "schemaVersion": 1,
            "name": "flatpak/app",
            "tag": "stable",
            "architecture": "amd64",
            "fsLayers": [{"blobSum": "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0"}],
            "history": [{"v1Compatibility": config}],
        })
        .to_string();
        let spec = ManifestSpec::parse(raw.as_bytes(), None).unwrap();
        let labels = spec.labels();
        assert!(labels.contains_key("org.flatpak.ref"));
        assert!(spec.characteristics(&labels).is_flatpak);
    }

    #[rstest]
    #[case::bad_json(b"not json".as_slice(), None)]
    #[case::wrong_schema_for_type(br#"{"schemaVersion":2,"manifests":[]}"#.as_slice(), Some(DOCKER_MANIFEST_V2))]
    fn parse_rejects(#[case] raw: &[u8], #[case] media_type: Option<&str>) {
        assert!(ManifestSpec::parse(raw, media_type).is_err());
    }
}
