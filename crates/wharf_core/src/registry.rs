//! # Registry Abstractions
//!
//! Defines the interoperability layer between the Distribution HTTP surface
//! (`wharf_http`), the synchronizer (`wharf_sync`) and backend
//! implementations.
//!
//! Backends distinguish metadata (relational rows describing the content
//! graph and repository versions) from bulk data (digest-addressed bytes in
//! an object store). The traits here are object safe so the HTTP layer can
//! hold `Arc<dyn ...>` handles without being generic over the backend.
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use futures_core::Stream;
use hyper::body::Body;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{Characteristics, ManifestSpec};
use crate::oci_digest::OciDigest;
use crate::version::ContentSummary;

pub type ByteStream = Pin<
    Box<
        dyn Stream<Item = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>
            + Send,
    >,
>;

/// How a repository acquires content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    /// Writable through the Distribution push API.
    Push,
    /// Populated by syncing from a configured remote.
    Sync,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryKind::Push => "push",
            RepositoryKind::Sync => "sync",
        }
    }
}

impl TryFrom<&str> for RepositoryKind {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(RepositoryKind::Push),
            "sync" => Ok(RepositoryKind::Sync),
            other => Err(Error::BackendError(format!(
                "unknown repository kind: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub kind: RepositoryKind,
    pub latest_version: i64,
}

/// A published endpoint serving a repository version at a base path.
#[derive(Clone, Debug)]
pub struct Distribution {
    pub id: Uuid,
    pub base_path: String,
    pub repository_id: Uuid,
    pub repository_name: String,
    /// Pinned version; `None` follows the repository's latest version.
    pub version_number: Option<i64>,
    pub private: bool,
    pub remote_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    Immediate,
    OnDemand,
    Streamed,
}

impl DownloadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadPolicy::Immediate => "immediate",
            DownloadPolicy::OnDemand => "on_demand",
            DownloadPolicy::Streamed => "streamed",
        }
    }
}

impl TryFrom<&str> for DownloadPolicy {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(DownloadPolicy::Immediate),
            "on_demand" => Ok(DownloadPolicy::OnDemand),
            "streamed" => Ok(DownloadPolicy::Streamed),
            other => Err(Error::BackendError(format!(
                "unknown download policy: {other}"
            ))),
        }
    }
}

/// An upstream registry binding used for syncing or pull-through.
#[derive(Clone, Debug, Deserialize)]
pub struct Remote {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub upstream_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sigstore: Option<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    pub policy: DownloadPolicy,
    #[serde(default = "Remote::default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl Remote {
    fn default_max_retries() -> u32 {
        3
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Additive,
    Mirror,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Blob,
    Manifest,
    Tag,
    Signature,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Blob => "blob",
            ContentKind::Manifest => "manifest",
            ContentKind::Tag => "tag",
            ContentKind::Signature => "signature",
        }
    }
}

impl TryFrom<&str> for ContentKind {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ContentKind::Blob),
            "manifest" => Ok(ContentKind::Manifest),
            "tag" => Ok(ContentKind::Tag),
            "signature" => Ok(ContentKind::Signature),
            other => Err(Error::BackendError(format!("unknown content kind: {other}"))),
        }
    }
}

/// Content descriptor accepted by the repository version operations.
#[derive(Clone, Debug)]
pub enum ContentRef {
    /// A tag binding; `manifest` may be omitted when removing by name.
    Tag {
        name: String,
        manifest: Option<OciDigest>,
    },
    Manifest(OciDigest),
    Blob(OciDigest),
    Signature { id: Uuid },
}

#[derive(Clone, Debug)]
pub struct BlobRecord {
    pub id: Uuid,
    pub digest: OciDigest,
    pub bytes_on_disk: i64,
}

#[derive(Clone, Debug)]
pub struct ManifestRecord {
    pub id: Uuid,
    pub digest: OciDigest,
    pub media_type: String,
    pub schema_version: i32,
    pub config_blob_digest: Option<OciDigest>,
    pub annotations: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub characteristics: Characteristics,
    pub bytes_on_disk: i64,
}

#[derive(Clone, Debug)]
pub struct TagRecord {
    pub id: Uuid,
    pub name: String,
    pub manifest_id: Uuid,
    pub manifest_digest: OciDigest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Atomic,
    Cosign,
}

impl SignatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureKind::Atomic => "atomic",
            SignatureKind::Cosign => "cosign",
        }
    }
}

impl TryFrom<&str> for SignatureKind {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        match s {
            "atomic" => Ok(SignatureKind::Atomic),
            "cosign" => Ok(SignatureKind::Cosign),
            other => Err(Error::BackendError(format!(
                "unknown signature kind: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignatureRecord {
    pub id: Uuid,
    pub name: String,
    pub manifest_digest: OciDigest,
    pub kind: SignatureKind,
    pub key_id: Option<String>,
    pub digest: OciDigest,
    pub bytes_on_disk: i64,
}

/// Chunked upload session state persisted between requests.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub uuid: Uuid,
    pub start_date: NaiveDate,
    pub upload_id: Option<String>,
    pub chunk_number: i32,
    pub last_range_end: i64,
    pub bytes: u64,
}

impl UploadSession {
    /// A chunk starting at `start` is acceptable only when it continues
    /// exactly where the previous one ended.
    pub fn validate_range(&self, start: u64) -> bool {
        if start == 0 && self.chunk_number == 1 {
            return true;
        }
        start as i64 == self.last_range_end + 1
    }
}

/// Blob bytes are either streamed through the registry or redirected to a
/// presigned object-store URL.
pub enum BlobContent {
    Stream(ByteStream),
    Redirect(String),
}

/// Provide access to [`RepositoryStore`] instances and registry-wide
/// entities (distributions, remotes, the catalog).
#[async_trait]
pub trait RepositoryStoreManager: Send + Sync + 'static {
    /// Get the repository with the given name if it exists. This name
    /// corresponds to the `<name>` in distribution-spec API endpoints like
    /// `/v2/<name>/blobs/<digest>`.
    async fn get(&self, name: &str) -> Result<Option<Arc<dyn RepositoryStore>>>;

    /// Create a repository (and its implicit namespace) with the given name.
    async fn create(&self, name: &str, kind: RepositoryKind)
        -> Result<Arc<dyn RepositoryStore>>;

    /// Stable, lexically ordered repository name listing for the catalog.
    async fn catalog(&self, n: i64, last: Option<&str>) -> Result<Vec<String>>;

    /// Look up a distribution by its base path.
    async fn distribution(&self, base_path: &str) -> Result<Option<Distribution>>;

    async fn remote(&self, id: &Uuid) -> Result<Option<Remote>>;
}

/// Scoped access to a single repository's content and versions.
pub trait RepositoryStore: Send + Sync + 'static {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    fn kind(&self) -> RepositoryKind;

    fn blob_store(&self) -> Arc<dyn BlobStore>;
    fn manifest_store(&self) -> Arc<dyn ManifestStore>;
    fn upload_session_store(&self) -> Arc<dyn UploadSessionStore>;
    fn version_store(&self) -> Arc<dyn VersionStore>;
    fn signature_store(&self) -> Arc<dyn SignatureStore>;
}

/// Provides access to upload sessions.
#[async_trait]
pub trait UploadSessionStore: Send + Sync + 'static {
    async fn new_upload_session(&self) -> Result<UploadSession>;

    async fn get_upload_session(&self, session_uuid: &Uuid) -> Result<UploadSession>;

    async fn delete_session(&self, session_uuid: &Uuid) -> Result<()>;
}

/// Provides access to registry blobs.
///
/// Blob rows are global (content is deduplicated by digest across
/// repositories); the optional `version` argument scopes visibility to a
/// repository version's membership set.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn head(&self, version: Option<i64>, key: &OciDigest) -> Result<Option<BlobRecord>>;

    /// Registry-wide lookup unscoped by repository; used to skip upstream
    /// downloads of blobs the registry already holds.
    async fn head_global(&self, key: &OciDigest) -> Result<Option<BlobRecord>>;

    async fn get(
        &self,
        version: Option<i64>,
        key: &OciDigest,
    ) -> Result<Option<(BlobRecord, BlobContent)>>;

    /// Store blob bytes under their digest; duplicate puts converge on the
    /// existing row.
    async fn put(&self, digest: &OciDigest, content_length: u64, body: Body)
        -> Result<BlobRecord>;

    /// Unconditionally delete a blob row and its bytes. Used by the orphan
    /// reclaim pass; callers are responsible for reference checks.
    async fn delete(&self, digest: &OciDigest) -> Result<()>;

    /// Resume a chunked upload session.
    async fn resume(
        &self,
        session_uuid: &Uuid,
        start_of_range: Option<u64>,
    ) -> Result<Box<dyn BlobWriter>>;
}

/// Implements chunked blob uploads.
#[async_trait]
pub trait BlobWriter: Send + Sync + 'static {
    async fn write(&mut self, content_length: u64, body: Body) -> Result<UploadSession>;

    async fn write_chunked(&mut self, body: Body) -> Result<UploadSession>;

    /// Assemble the uploaded chunks, verify the client-provided digest and
    /// commit the blob row.
    async fn finalize(&mut self, digest: &OciDigest) -> Result<UploadSession>;
}

/// Provides access to registry manifests.
#[async_trait]
pub trait ManifestStore: Send + Sync + 'static {
    async fn head(
        &self,
        version: Option<i64>,
        key: &ManifestRef,
    ) -> Result<Option<ManifestRecord>>;

    async fn get(
        &self,
        version: Option<i64>,
        key: &ManifestRef,
    ) -> Result<Option<(ManifestRecord, ByteStream)>>;

    /// Digest-keyed lookup unscoped by repository; used to skip upstream
    /// fetches for content the registry already holds.
    async fn get_global(&self, digest: &OciDigest) -> Result<Option<ManifestRecord>>;

    /// Validate and store a manifest. With `require_references` set (push),
    /// absent referenced blobs or sub-manifests fail the put; sync callers
    /// clear it when the download policy defers content.
    async fn put(
        &self,
        spec: &ManifestSpec,
        raw: Bytes,
        require_references: bool,
    ) -> Result<ManifestRecord>;
}

/// Provides access to image signatures.
#[async_trait]
pub trait SignatureStore: Send + Sync + 'static {
    async fn list(
        &self,
        version: Option<i64>,
        manifest_digest: &OciDigest,
    ) -> Result<Vec<SignatureRecord>>;

    async fn read(&self, record: &SignatureRecord) -> Result<Bytes>;

    /// Store a signature payload and its row; idempotent on `(name, digest)`.
    async fn put(
        &self,
        name: &str,
        manifest_digest: &OciDigest,
        kind: SignatureKind,
        key_id: Option<String>,
        payload: Bytes,
    ) -> Result<SignatureRecord>;
}

/// The repository version engine: immutable membership snapshots with
/// recursive closure semantics.
#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    async fn latest(&self) -> Result<i64>;

    async fn exists(&self, number: i64) -> Result<bool>;

    /// Create a new version adding the given refs and their closures.
    async fn recursive_add(&self, refs: &[ContentRef]) -> Result<i64>;

    /// Create a new version removing the given refs and their closures,
    /// preserving content still referenced by what remains.
    async fn recursive_remove(&self, refs: &[ContentRef]) -> Result<i64>;

    /// Recursively add the named tags (all when `names` is `None`) from
    /// another repository's version.
    async fn copy_tags(
        &self,
        src_repository: &str,
        src_version: i64,
        names: Option<&[String]>,
    ) -> Result<i64>;

    /// Recursively add manifests from another repository's version selected
    /// by digest and/or media type (all when both are `None`).
    async fn copy_manifests(
        &self,
        src_repository: &str,
        src_version: i64,
        digests: Option<&[OciDigest]>,
        media_types: Option<&[String]>,
    ) -> Result<i64>;

    async fn tag(&self, manifest_digest: &OciDigest, name: &str) -> Result<i64>;

    async fn untag(&self, name: &str) -> Result<i64>;

    async fn diff(&self, a: i64, b: i64) -> Result<ContentSummary>;

    /// Delete every version older than the latest. Pull-through cache
    /// repositories are single-version: each on-demand fetch replaces the
    /// previous snapshot.
    async fn prune_older_versions(&self) -> Result<u64>;

    /// Tag listing for a version, lexically ordered with `n`/`last`
    /// pagination.
    async fn tags(
        &self,
        version: Option<i64>,
        n: Option<i64>,
        last: Option<&str>,
    ) -> Result<Vec<TagRecord>>;
}

/// Invoked by the HTTP layer when a pull against a pull-through
/// distribution misses the local cache.
#[async_trait]
pub trait OnDemandFetcher: Send + Sync + 'static {
    /// Synchronously sync the single image `reference` from `remote` into
    /// the local repository `repo_name`, creating it if needed.
    async fn fetch_image(&self, repo_name: &str, remote: &Remote, reference: &str) -> Result<()>;

    /// Fetch a blob deferred by the remote's download policy. Under
    /// `on_demand` the blob is stored locally and `None` is returned so the
    /// caller re-reads its store; under `streamed` the upstream body is
    /// returned for proxying and nothing is stored.
    async fn fetch_blob(
        &self,
        repo_name: &str,
        remote: &Remote,
        digest: &OciDigest,
    ) -> Result<Option<ByteStream>>;
}

/// Reference to a manifest as specified by the Distribution Spec: either a
/// digest or a tag matching `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
#[derive(Clone, Debug)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(dgst) = OciDigest::try_from(s) {
            return Ok(Self::Digest(dgst));
        }
        if TAG_RE.is_match(s) {
            return Ok(Self::Tag(String::from(s)));
        }

        Err(Error::ManifestInvalid(Some(format!(
            "invalid manifest reference: {s}"
        ))))
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ManifestRef::Digest(d) => write!(f, "{d}"),
            ManifestRef::Tag(t) => write!(f, "{t}"),
        }
    }
}

pub fn validate_tag_name(name: &str) -> Result<()> {
    if TAG_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::ManifestInvalid(Some(format!(
            "invalid tag name: {name}"
        ))))
    }
}

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
});

/// Validate a repository or namespace path against the Distribution `name`
/// grammar.
pub fn validate_repository_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::NameInvalid(Some(name.to_string())))
    }
}

/// The namespace component of a repository path (`ns/name` -> `ns`; a bare
/// name is its own namespace).
pub fn namespace_of(name: &str) -> &str {
    match name.find('/') {
        Some(i) => &name[..i],
        None => name,
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::simple("latest", true)]
    #[case::dotted("v1.2.3", true)]
    #[case::underscore_lead("_tag", true)]
    #[case::cosign_style("sha256-abc123.sig", true)]
    #[case::leading_dash("-bad", false)]
    #[case::too_long(&"a".repeat(129), false)]
    #[case::space("a b", false)]
    fn tag_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_tag_name(name).is_ok(), ok, "{name}");
    }

    #[rstest]
    #[case::simple("busybox", true)]
    #[case::nested("library/busybox", true)]
    #[case::deep("a/b/c", true)]
    #[case::separators("my-org/my.repo_x", true)]
    #[case::uppercase("Library/busybox", false)]
    #[case::trailing_slash("library/", false)]
    #[case::double_sep("a..b", false)]
    fn repository_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_repository_name(name).is_ok(), ok, "{name}");
    }

    #[rstest]
    fn manifest_ref_parses_digest_and_tag() {
        let r: ManifestRef =
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
                .parse()
                .unwrap();
        assert!(matches!(r, ManifestRef::Digest(_)));
        let r: ManifestRef = "v1.0".parse().unwrap();
        assert!(matches!(r, ManifestRef::Tag(_)));
    }

    #[rstest]
    fn namespace_extraction() {
        assert_eq!(namespace_of("library/busybox"), "library");
        assert_eq!(namespace_of("solo"), "solo");
        assert_eq!(namespace_of("a/b/c"), "a");
    }

    #[rstest]
    fn upload_session_range_validation() {
        let session = UploadSession {
            uuid: Uuid::new_v4(),
            start_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            upload_id: Some("x".to_string()),
            chunk_number: 2,
            last_range_end: 49,
            bytes: 50,
        };
        assert!(session.validate_range(50));
        assert!(!session.validate_range(100));
        assert!(!session.validate_range(0));
    }
}
