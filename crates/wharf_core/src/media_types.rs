//! Media types understood by the registry and the configurable allow-list
//! used to validate pushed artifacts.

use std::collections::HashMap;

use serde::Deserialize;

use crate::errors::{Error, Result};

// Manifest media types.
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

// Config media types.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
pub const COSIGN_CONFIG: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";
pub const OCTET_STREAM: &str = "application/octet-stream";

// Layer media types.
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_FOREIGN: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_LAYER_NONDIST_TAR: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_LAYER_NONDIST_TAR_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const HELM_CHART: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
pub const HELM_PROVENANCE: &str = "application/vnd.cncf.helm.chart.provenance.v1.prov";
pub const COSIGN_SIMPLESIGNING: &str = "application/vnd.dev.cosign.simplesigning.v1+json";

/// Accept set sent upstream when negotiating manifests during sync.
pub const MANIFEST_ACCEPT: &[&str] = &[
    DOCKER_MANIFEST_V2,
    DOCKER_MANIFEST_LIST,
    OCI_MANIFEST,
    OCI_INDEX,
    DOCKER_MANIFEST_V1_SIGNED,
    DOCKER_MANIFEST_V1,
];

pub fn is_list_type(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
}

pub fn is_manifest_type(media_type: &str) -> bool {
    matches!(
        media_type,
        DOCKER_MANIFEST_V1
            | DOCKER_MANIFEST_V1_SIGNED
            | DOCKER_MANIFEST_V2
            | DOCKER_MANIFEST_LIST
            | OCI_MANIFEST
            | OCI_INDEX
    )
}

/// Validation strictness for layer media types (see the registry's
/// `manifest_spec_strict` option).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecMode {
    Strict,
    #[default]
    Relaxed,
}

/// Allow-list of `config media type -> permitted layer media types`,
/// seeded with the OCI/Docker/Helm/Cosign core and extendable through
/// configuration (`additional_oci_artifact_types`).
#[derive(Clone, Debug)]
pub struct MediaTypeRegistry {
    artifact_types: HashMap<String, Vec<String>>,
    mode: SpecMode,
    max_payload_bytes: usize,
}

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

impl Default for MediaTypeRegistry {
    fn default() -> Self {
        Self::new(HashMap::new(), SpecMode::default(), DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl MediaTypeRegistry {
    pub fn new(
        additional: HashMap<String, Vec<String>>,
        mode: SpecMode,
        max_payload_bytes: usize,
    ) -> Self {
        let mut artifact_types: HashMap<String, Vec<String>> = HashMap::from([
            (
                DOCKER_CONFIG.to_string(),
                vec![
                    DOCKER_LAYER.to_string(),
                    DOCKER_LAYER_FOREIGN.to_string(),
                ],
            ),
            (
                OCI_CONFIG.to_string(),
                vec![
                    OCI_LAYER_TAR.to_string(),
                    OCI_LAYER_TAR_GZIP.to_string(),
                    OCI_LAYER_TAR_ZSTD.to_string(),
                    OCI_LAYER_NONDIST_TAR.to_string(),
                    OCI_LAYER_NONDIST_TAR_GZIP.to_string(),
                    DOCKER_LAYER.to_string(),
                ],
            ),
            (
                HELM_CONFIG.to_string(),
                vec![HELM_CHART.to_string(), HELM_PROVENANCE.to_string()],
            ),
            (
                COSIGN_CONFIG.to_string(),
                vec![COSIGN_SIMPLESIGNING.to_string()],
            ),
            (
                OCTET_STREAM.to_string(),
                vec![OCTET_STREAM.to_string(), OCI_LAYER_TAR_GZIP.to_string()],
            ),
        ]);
        for (config, layers) in additional {
            artifact_types.entry(config).or_default().extend(layers);
        }
        Self {
            artifact_types,
            mode,
            max_payload_bytes,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn config_type_allowed(&self, media_type: &str) -> bool {
        self.artifact_types.contains_key(media_type)
    }

    /// Check a `(config media type, layer media types)` combination against
    /// the allow-list. Unknown config types are rejected outright; unknown
    /// layer types are rejected only in strict mode.
    pub fn validate_artifact(&self, config_type: &str, layer_types: &[&str]) -> Result<()> {
        let allowed_layers = self.artifact_types.get(config_type).ok_or_else(|| {
            Error::ManifestInvalid(Some(format!(
                "unknown config media type: {config_type}"
            )))
        })?;
        if self.mode == SpecMode::Strict {
            for lt in layer_types {
                if !allowed_layers.iter().any(|a| a == lt) {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "layer media type {lt} not allowed for config type {config_type}"
                    ))));
                }
            }
        }
        Ok(())
    }

    /// Enforce the non-blob payload cap on manifest and signature bodies.
    pub fn check_payload_size(&self, len: usize) -> Result<()> {
        if len > self.max_payload_bytes {
            return Err(Error::ManifestInvalid(Some(format!(
                "payload of {len} bytes exceeds the {} byte limit",
                self.max_payload_bytes
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::oci(OCI_CONFIG, &[OCI_LAYER_TAR_GZIP], SpecMode::Strict, true)]
    #[case::docker(DOCKER_CONFIG, &[DOCKER_LAYER], SpecMode::Strict, true)]
    #[case::helm(HELM_CONFIG, &[HELM_CHART, HELM_PROVENANCE], SpecMode::Strict, true)]
    #[case::unknown_config("application/vnd.acme.rocket.config.v1+json", &[], SpecMode::Relaxed, false)]
    #[case::unknown_layer_strict(OCI_CONFIG, &["application/x-mystery"], SpecMode::Strict, false)]
    #[case::unknown_layer_relaxed(OCI_CONFIG, &["application/x-mystery"], SpecMode::Relaxed, true)]
    fn artifact_validation(
        #[case] config: &str,
        #[case] layers: &[&str],
        #[case] mode: SpecMode,
        #[case] ok: bool,
    ) {
        let registry = MediaTypeRegistry::new(HashMap::new(), mode, DEFAULT_MAX_PAYLOAD_BYTES);
        assert_eq!(registry.validate_artifact(config, layers).is_ok(), ok);
    }

    #[rstest]
    fn additional_types_extend_allow_list() {
        let additional = HashMap::from([(
            "application/vnd.acme.rocket.config.v1+json".to_string(),
            vec!["application/vnd.acme.rocket.docs.layer.v1+tar".to_string()],
        )]);
        let registry =
            MediaTypeRegistry::new(additional, SpecMode::Strict, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(registry
            .validate_artifact(
                "application/vnd.acme.rocket.config.v1+json",
                &["application/vnd.acme.rocket.docs.layer.v1+tar"],
            )
            .is_ok());
    }

    #[rstest]
    fn payload_cap() {
        let registry = MediaTypeRegistry::default();
        assert!(registry.check_payload_size(1024).is_ok());
        assert!(registry.check_payload_size(DEFAULT_MAX_PAYLOAD_BYTES + 1).is_err());
    }
}
