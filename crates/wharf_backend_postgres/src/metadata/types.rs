use std::collections::HashMap;

use chrono::NaiveDate;
use sea_query::Iden;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use wharf_core::model::Characteristics;
use wharf_core::registry::{
    self, DownloadPolicy, RepositoryKind, SignatureKind,
};
use wharf_core::OciDigest;

fn decode_digest(row: &sqlx_postgres::PgRow, index: &str) -> sqlx::Result<OciDigest> {
    match row.try_get::<String, _>(index)?.as_str().try_into() {
        Ok(v) => Ok(v),
        Err(e) => Err(sqlx::Error::ColumnDecode {
            index: index.to_string(),
            source: format!("{e}").into(),
        }),
    }
}

#[derive(Clone, Debug)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub kind: RepositoryKind,
    pub latest_version: i64,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Repository {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: match RepositoryKind::try_from(row.try_get::<String, _>("kind")?.as_str()) {
                Ok(v) => v,
                Err(e) => {
                    return Err(sqlx::Error::ColumnDecode {
                        index: "kind".to_string(),
                        source: format!("{e}").into(),
                    })
                }
            },
            latest_version: row.try_get("latest_version")?,
        })
    }
}

#[derive(Iden)]
pub enum Repositories {
    Table,
    Id,
    Name,
    Kind,
    LatestVersion,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RepositoryVersion {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub number: i64,
    pub base_number: Option<i64>,
}

#[derive(Iden)]
pub enum RepositoryVersions {
    Table,
    Id,
    RepositoryId,
    Number,
    BaseNumber,
    CreatedAt,
}

#[derive(Iden)]
pub enum VersionContent {
    Table,
    VersionId,
    ContentId,
    ContentKind,
}

pub struct Blob {
    pub id: Uuid,
    pub digest: OciDigest,
    pub bytes_on_disk: i64,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Blob {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            digest: decode_digest(row, "digest")?,
            bytes_on_disk: row.try_get("bytes_on_disk")?,
        })
    }
}

impl From<Blob> for registry::BlobRecord {
    fn from(b: Blob) -> Self {
        Self {
            id: b.id,
            digest: b.digest,
            bytes_on_disk: b.bytes_on_disk,
        }
    }
}

#[derive(Iden)]
pub enum Blobs {
    Table,
    Id,
    Digest,
    BytesOnDisk,
}

pub struct Manifest {
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

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Manifest {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            digest: decode_digest(row, "digest")?,
            media_type: row.try_get("media_type")?,
            schema_version: row.try_get("schema_version")?,
            config_blob_digest: row
                .try_get::<Option<String>, _>("config_blob_digest")?
                .map(|v| match OciDigest::try_from(v.as_str()) {
                    Ok(v) => Ok(v),
                    Err(e) => Err(sqlx::Error::ColumnDecode {
                        index: "config_blob_digest".to_string(),
                        source: format!("{e}").into(),
                    }),
                })
                .transpose()?,
            annotations: row
                .try_get::<Json<HashMap<String, String>>, _>("annotations")?
                .0,
            labels: row.try_get::<Json<HashMap<String, String>>, _>("labels")?.0,
            characteristics: Characteristics {
                is_bootable: row.try_get("is_bootable")?,
                is_flatpak: row.try_get("is_flatpak")?,
                is_helm: row.try_get("is_helm")?,
                is_cosign_signature: row.try_get("is_cosign")?,
            },
            bytes_on_disk: row.try_get("bytes_on_disk")?,
        })
    }
}

impl From<Manifest> for registry::ManifestRecord {
    fn from(m: Manifest) -> Self {
        Self {
            id: m.id,
            digest: m.digest,
            media_type: m.media_type,
            schema_version: m.schema_version,
            config_blob_digest: m.config_blob_digest,
            annotations: m.annotations,
            labels: m.labels,
            characteristics: m.characteristics,
            bytes_on_disk: m.bytes_on_disk,
        }
    }
}

#[derive(Iden)]
pub enum Manifests {
    Table,
    Id,
    Digest,
    MediaType,
    SchemaVersion,
    ConfigBlobDigest,
    Annotations,
    Labels,
    IsBootable,
    IsFlatpak,
    IsHelm,
    IsCosign,
    BytesOnDisk,
}

#[derive(Iden)]
pub enum ManifestLayers {
    Table,
    ManifestId,
    BlobId,
    Ordinal,
}

/// Children are referenced by digest so an index can be stored before its
/// sub-manifests arrive under an on-demand download policy.
#[derive(Iden)]
pub enum IndexManifests {
    Table,
    ParentId,
    ChildDigest,
    Ordinal,
}

pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub manifest_id: Uuid,
    pub manifest_digest: OciDigest,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Tag {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            manifest_id: row.try_get("manifest_id")?,
            manifest_digest: decode_digest(row, "manifest_digest")?,
        })
    }
}

impl From<Tag> for registry::TagRecord {
    fn from(t: Tag) -> Self {
        Self {
            id: t.id,
            name: t.name,
            manifest_id: t.manifest_id,
            manifest_digest: t.manifest_digest,
        }
    }
}

#[derive(Iden)]
pub enum Tags {
    Table,
    Id,
    Name,
    ManifestId,
}

pub struct Signature {
    pub id: Uuid,
    pub name: String,
    pub manifest_digest: OciDigest,
    pub kind: SignatureKind,
    pub key_id: Option<String>,
    pub digest: OciDigest,
    pub bytes_on_disk: i64,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Signature {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            manifest_digest: decode_digest(row, "manifest_digest")?,
            kind: match SignatureKind::try_from(row.try_get::<String, _>("kind")?.as_str()) {
                Ok(v) => v,
                Err(e) => {
                    return Err(sqlx::Error::ColumnDecode {
                        index: "kind".to_string(),
                        source: format!("{e}").into(),
                    })
                }
            },
            key_id: row.try_get("key_id")?,
            digest: decode_digest(row, "digest")?,
            bytes_on_disk: row.try_get("bytes_on_disk")?,
        })
    }
}

impl From<Signature> for registry::SignatureRecord {
    fn from(s: Signature) -> Self {
        Self {
            id: s.id,
            name: s.name,
            manifest_digest: s.manifest_digest,
            kind: s.kind,
            key_id: s.key_id,
            digest: s.digest,
            bytes_on_disk: s.bytes_on_disk,
        }
    }
}

#[derive(Iden)]
pub enum Signatures {
    Table,
    Id,
    Name,
    ManifestDigest,
    Kind,
    KeyId,
    Digest,
    BytesOnDisk,
}

#[derive(Iden)]
pub enum Namespaces {
    Table,
    Id,
    Name,
}

pub struct Distribution {
    pub id: Uuid,
    pub base_path: String,
    pub repository_id: Uuid,
    pub repository_name: String,
    pub version_number: Option<i64>,
    pub private: bool,
    pub remote_id: Option<Uuid>,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Distribution {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            base_path: row.try_get("base_path")?,
            repository_id: row.try_get("repository_id")?,
            repository_name: row.try_get("repository_name")?,
            version_number: row.try_get("version_number")?,
            private: row.try_get("private")?,
            remote_id: row.try_get("remote_id")?,
        })
    }
}

impl From<Distribution> for registry::Distribution {
    fn from(d: Distribution) -> Self {
        Self {
            id: d.id,
            base_path: d.base_path,
            repository_id: d.repository_id,
            repository_name: d.repository_name,
            version_number: d.version_number,
            private: d.private,
            remote_id: d.remote_id,
        }
    }
}

#[derive(Iden)]
pub enum Distributions {
    Table,
    Id,
    BasePath,
    RepositoryId,
    VersionNumber,
    Private,
    RemoteId,
}

pub struct Remote {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub upstream_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sigstore: Option<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub policy: DownloadPolicy,
    pub max_retries: i32,
    pub rate_limit: Option<i32>,
}

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for Remote {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            upstream_name: row.try_get("upstream_name")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            sigstore: row.try_get("sigstore")?,
            include_tags: row.try_get::<Json<Vec<String>>, _>("include_tags")?.0,
            exclude_tags: row.try_get::<Json<Vec<String>>, _>("exclude_tags")?.0,
            policy: match DownloadPolicy::try_from(row.try_get::<String, _>("policy")?.as_str()) {
                Ok(v) => v,
                Err(e) => {
                    return Err(sqlx::Error::ColumnDecode {
                        index: "policy".to_string(),
                        source: format!("{e}").into(),
                    })
                }
            },
            max_retries: row.try_get("max_retries")?,
            rate_limit: row.try_get("rate_limit")?,
        })
    }
}

impl From<Remote> for registry::Remote {
    fn from(r: Remote) -> Self {
        Self {
            id: r.id,
            name: r.name,
            url: r.url,
            upstream_name: r.upstream_name,
            username: r.username,
            password: r.password,
            sigstore: r.sigstore,
            include_tags: r.include_tags,
            exclude_tags: r.exclude_tags,
            policy: r.policy,
            max_retries: r.max_retries as u32,
            rate_limit: r.rate_limit.map(|v| v as u32),
        }
    }
}

#[derive(Iden)]
pub enum Remotes {
    Table,
    Id,
    Name,
    Url,
    UpstreamName,
    Username,
    Password,
    Sigstore,
    IncludeTags,
    ExcludeTags,
    Policy,
    MaxRetries,
    RateLimit,
}

#[derive(Debug, sqlx::FromRow)]
pub struct UploadSession {
    pub uuid: Uuid,
    pub repository_id: Uuid,
    pub start_date: NaiveDate,
    pub upload_id: Option<String>,
    pub chunk_number: i32,
    pub last_range_end: i64,
    pub bytes: i64,
}

impl From<UploadSession> for registry::UploadSession {
    fn from(s: UploadSession) -> Self {
        Self {
            uuid: s.uuid,
            start_date: s.start_date,
            upload_id: s.upload_id,
            chunk_number: s.chunk_number,
            last_range_end: s.last_range_end,
            bytes: s.bytes as u64,
        }
    }
}

#[derive(Iden)]
pub enum UploadSessions {
    Table,
    Uuid,
    RepositoryId,
    StartDate,
    UploadId,
    ChunkNumber,
    LastRangeEnd,
    Bytes,
}

#[derive(Default, sqlx::FromRow)]
pub struct Chunk {
    pub e_tag: Option<String>,
    pub chunk_number: i32,
}

impl From<wharf_objectstore::UploadedPart> for Chunk {
    fn from(part: wharf_objectstore::UploadedPart) -> Self {
        Self {
            e_tag: part.e_tag,
            chunk_number: part.part_number,
        }
    }
}

impl From<Chunk> for wharf_objectstore::UploadedPart {
    fn from(chunk: Chunk) -> Self {
        Self {
            e_tag: chunk.e_tag,
            part_number: chunk.chunk_number,
        }
    }
}

#[derive(Iden)]
pub enum Chunks {
    Table,
    UploadSessionUuid,
    ChunkNumber,
    ETag,
}
