use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use wharf_backend_postgres::PgBackendConfig;
use wharf_core::media_types::SpecMode;
use wharf_core::registry::{DownloadPolicy, RepositoryKind};
use wharf_token::{AccessPolicy, SignatureAlgorithm};

#[derive(Clone, Deserialize)]
pub struct Config {
    pub backend: RepositoryBackend,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub static_repositories: Option<Vec<RepositoryDefinition>>,

    #[serde(default)]
    pub remotes: Vec<RemoteDefinition>,

    #[serde(default)]
    pub distributions: Vec<DistributionDefinition>,

    #[serde(default = "Config::default_listen")]
    pub listen: String,
}

impl Config {
    fn default_listen() -> String {
        "0.0.0.0:13030".to_string()
    }
}

#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RepositoryBackend {
    Postgres(PgBackendConfig),
}

#[derive(Clone, Deserialize)]
pub struct RegistryConfig {
    /// Service name tokens are issued for (`aud`).
    #[serde(default = "RegistryConfig::default_service")]
    pub service: String,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub policy: AccessPolicy,

    /// Extra `config media type -> layer media types` entries for the
    /// artifact allow-list.
    #[serde(default)]
    pub additional_oci_artifact_types: HashMap<String, Vec<String>>,

    /// Cap on non-blob payload size (manifests, signatures).
    #[serde(default = "RegistryConfig::default_payload_max")]
    pub oci_payload_max_bytes: usize,

    /// Layer media-type validation strictness.
    #[serde(default)]
    pub manifest_spec: SpecMode,

    /// Reserved: the Flatpak index front end is served by a separate
    /// component.
    #[serde(default)]
    pub flatpak_index_enabled: bool,

    #[serde(default)]
    pub cache_enabled: bool,

    #[serde(default = "RegistryConfig::default_max_signing")]
    pub max_parallel_signing_tasks: usize,

    /// External signer executable; signing subcommands fail without it.
    #[serde(default)]
    pub signer_script: Option<PathBuf>,

    /// Default signing key id handed to the signer.
    #[serde(default)]
    pub signing_key_id: Option<String>,

    /// Reclaim unreferenced content on this interval when set.
    #[serde(default)]
    pub reclaim_interval_seconds: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service: Self::default_service(),
            token: TokenConfig::default(),
            policy: AccessPolicy::default(),
            additional_oci_artifact_types: HashMap::new(),
            oci_payload_max_bytes: Self::default_payload_max(),
            manifest_spec: SpecMode::default(),
            flatpak_index_enabled: false,
            cache_enabled: false,
            max_parallel_signing_tasks: Self::default_max_signing(),
            signer_script: None,
            signing_key_id: None,
            reclaim_interval_seconds: None,
        }
    }
}

impl RegistryConfig {
    fn default_service() -> String {
        "wharf".to_string()
    }
    fn default_payload_max() -> usize {
        wharf_core::media_types::DEFAULT_MAX_PAYLOAD_BYTES
    }
    fn default_max_signing() -> usize {
        10
    }
}

#[derive(Clone, Deserialize)]
pub struct TokenConfig {
    /// Turns off the bearer flow; Basic / Remote-User identification is
    /// used instead.
    #[serde(default)]
    pub disabled: bool,

    /// Absolute URL of the token endpoint, advertised in challenges.
    #[serde(default = "TokenConfig::default_server_url")]
    pub server_url: String,

    #[serde(default = "TokenConfig::default_algorithm")]
    pub signature_algorithm: SignatureAlgorithm,

    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,

    #[serde(default = "TokenConfig::default_expiration")]
    pub expiration_seconds: i64,

    /// Optional `kid` header advertised on issued tokens.
    #[serde(default)]
    pub kid: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            disabled: true,
            server_url: Self::default_server_url(),
            signature_algorithm: Self::default_algorithm(),
            public_key_path: None,
            private_key_path: None,
            expiration_seconds: Self::default_expiration(),
            kid: None,
        }
    }
}

impl TokenConfig {
    fn default_server_url() -> String {
        "http://localhost:13030/token/".to_string()
    }
    fn default_algorithm() -> SignatureAlgorithm {
        SignatureAlgorithm::ES256
    }
    fn default_expiration() -> i64 {
        wharf_token::DEFAULT_TOKEN_TTL_SECONDS
    }
}

/// Statically-defined repositories initialized at startup if they don't
/// already exist.
#[derive(Clone, Deserialize)]
pub struct RepositoryDefinition {
    pub name: String,
    #[serde(default = "RepositoryDefinition::default_kind")]
    pub kind: RepositoryKind,
}

impl RepositoryDefinition {
    fn default_kind() -> RepositoryKind {
        RepositoryKind::Push
    }
}

#[derive(Clone, Deserialize)]
pub struct RemoteDefinition {
    pub name: String,
    pub url: String,
    pub upstream_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sigstore: Option<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default = "RemoteDefinition::default_policy")]
    pub policy: DownloadPolicy,
    #[serde(default = "RemoteDefinition::default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl RemoteDefinition {
    fn default_policy() -> DownloadPolicy {
        DownloadPolicy::Immediate
    }
    fn default_max_retries() -> u32 {
        3
    }
}

#[derive(Clone, Deserialize)]
pub struct DistributionDefinition {
    pub base_path: String,
    pub repository: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub private: bool,
    /// Name of a configured remote; turns the distribution into a
    /// pull-through cache endpoint.
    #[serde(default)]
    pub remote: Option<String>,
}
