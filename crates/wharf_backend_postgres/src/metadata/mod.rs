//! Relational metadata for the content graph and repository versions.
//!
//! All SQL is built with sea-query and bound through sea-query-binder;
//! callers obtain either a pooled connection ([`MetadataConn`]) for reads or
//! a transaction ([`MetadataTx`]) when a version mutation must land
//! atomically.

use sea_query::{Expr, OnConflict, Order, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::types::Uuid;
use sqlx::{PgConnection, Pool, Row, Transaction};

use wharf_core::registry::{ManifestRef, RepositoryKind};
use wharf_core::OciDigest;

use super::errors::{Error, Result};

pub(crate) mod types;
pub(crate) use types::*;

#[derive(Clone, Deserialize)]
pub struct PostgresConfig {
    connection_string: String,
}

impl PostgresConfig {
    pub async fn new_metadata(&self) -> Result<MetadataPool> {
        let pool = PgPoolOptions::new()
            .connect(&self.connection_string)
            .await?;
        Ok(MetadataPool { pool })
    }
}

#[derive(Clone)]
pub struct MetadataPool {
    pool: Pool<Postgres>,
}

impl MetadataPool {
    pub async fn get_conn(&self) -> Result<MetadataConn> {
        Ok(MetadataConn {
            conn: self.pool.acquire().await?,
        })
    }

    pub async fn get_tx(&self) -> Result<MetadataTx> {
        Ok(MetadataTx {
            tx: Some(self.pool.begin().await?),
        })
    }
}

pub struct MetadataConn {
    conn: PoolConnection<Postgres>,
}

impl MetadataConn {
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

pub struct MetadataTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl MetadataTx {
    pub fn executor(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::TxInactive),
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(Error::TxInactive),
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(Error::TxInactive),
        }
    }
}

/// The query collection. Every function takes a bare `&mut PgConnection` so
/// it can run against a pool connection or inside a transaction.
pub(crate) struct Queries {}

impl Queries {
    // ------------------------------------------------------------------
    // repositories & namespaces

    pub async fn insert_repository(
        executor: &mut PgConnection,
        name: &str,
        kind: RepositoryKind,
    ) -> Result<Repository> {
        let (sql, values) = Query::insert()
            .into_table(Repositories::Table)
            .columns([
                Repositories::Name,
                Repositories::Kind,
                Repositories::LatestVersion,
            ])
            .values([Value::from(name).into(), kind.as_str().into(), 0i64.into()])?
            .returning(Query::returning().columns([
                Repositories::Id,
                Repositories::Name,
                Repositories::Kind,
                Repositories::LatestVersion,
            ]))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_one(executor)
            .await?)
    }

    pub async fn get_repository(
        executor: &mut PgConnection,
        name: &str,
    ) -> Result<Option<Repository>> {
        let (sql, values) = Query::select()
            .from(Repositories::Table)
            .columns([
                Repositories::Id,
                Repositories::Name,
                Repositories::Kind,
                Repositories::LatestVersion,
            ])
            .and_where(Expr::col(Repositories::Name).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn update_latest_version(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        number: i64,
    ) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Repositories::Table)
            .value(Repositories::LatestVersion, number)
            .and_where(Expr::col(Repositories::Id).eq(*repository_id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn list_repositories(
        executor: &mut PgConnection,
        n: i64,
        last: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut builder = Query::select();
        builder
            .from(Repositories::Table)
            .column(Repositories::Name)
            .order_by(Repositories::Name, Order::Asc)
            .limit(n as u64);
        if let Some(last) = last {
            builder.and_where(Expr::col(Repositories::Name).gt(last));
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| Ok(row.try_get("name")?))
            .collect::<Result<Vec<String>>>()
    }

    pub async fn ensure_namespace(executor: &mut PgConnection, name: &str) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Namespaces::Table)
            .columns([Namespaces::Id, Namespaces::Name])
            .values([Uuid::new_v4().into(), name.into()])?
            .on_conflict(
                OnConflict::column(Namespaces::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // repository versions

    pub async fn insert_version(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        number: i64,
        base_number: Option<i64>,
    ) -> Result<Uuid> {
        let (sql, values) = Query::insert()
            .into_table(RepositoryVersions::Table)
            .columns([
                RepositoryVersions::Id,
                RepositoryVersions::RepositoryId,
                RepositoryVersions::Number,
                RepositoryVersions::BaseNumber,
            ])
            .values([
                Uuid::new_v4().into(),
                (*repository_id).into(),
                number.into(),
                base_number.into(),
            ])?
            .returning_col(RepositoryVersions::Id)
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_version(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        number: i64,
    ) -> Result<Option<RepositoryVersion>> {
        let (sql, values) = Query::select()
            .from(RepositoryVersions::Table)
            .columns([
                RepositoryVersions::Id,
                RepositoryVersions::RepositoryId,
                RepositoryVersions::Number,
                RepositoryVersions::BaseNumber,
            ])
            .and_where(Expr::col(RepositoryVersions::RepositoryId).eq(*repository_id))
            .and_where(Expr::col(RepositoryVersions::Number).eq(number))
            .build_sqlx(PostgresQueryBuilder);
        Ok(
            sqlx::query_as_with::<_, RepositoryVersion, _>(&sql, values)
                .fetch_optional(executor)
                .await?,
        )
    }

    pub async fn delete_versions_before(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        number: i64,
    ) -> Result<u64> {
        let (sql, values) = Query::delete()
            .from_table(VersionContent::Table)
            .cond_where(
                Expr::col(VersionContent::VersionId).in_subquery(
                    Query::select()
                        .from(RepositoryVersions::Table)
                        .column(RepositoryVersions::Id)
                        .and_where(
                            Expr::col(RepositoryVersions::RepositoryId).eq(*repository_id),
                        )
                        .and_where(Expr::col(RepositoryVersions::Number).lt(number))
                        .to_owned(),
                ),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *executor).await?;

        let (sql, values) = Query::delete()
            .from_table(RepositoryVersions::Table)
            .cond_where(Expr::col(RepositoryVersions::RepositoryId).eq(*repository_id))
            .and_where(Expr::col(RepositoryVersions::Number).lt(number))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(result.rows_affected())
    }

    pub async fn version_members(
        executor: &mut PgConnection,
        version_id: &Uuid,
    ) -> Result<Vec<(Uuid, String)>> {
        let (sql, values) = Query::select()
            .from(VersionContent::Table)
            .columns([VersionContent::ContentId, VersionContent::ContentKind])
            .and_where(Expr::col(VersionContent::VersionId).eq(*version_id))
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| Ok((row.try_get("content_id")?, row.try_get("content_kind")?)))
            .collect()
    }

    pub async fn insert_version_content(
        executor: &mut PgConnection,
        version_id: &Uuid,
        members: &[(Uuid, &str)],
    ) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut builder = Query::insert();
        builder.into_table(VersionContent::Table).columns([
            VersionContent::VersionId,
            VersionContent::ContentId,
            VersionContent::ContentKind,
        ]);
        for (content_id, kind) in members {
            builder.values([(*version_id).into(), (*content_id).into(), (*kind).into()])?;
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // blobs

    pub async fn insert_blob(
        executor: &mut PgConnection,
        digest: &OciDigest,
        bytes_on_disk: i64,
    ) -> Result<Uuid> {
        let (sql, values) = Query::insert()
            .into_table(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            .values([
                Uuid::new_v4().into(),
                String::from(digest).into(),
                bytes_on_disk.into(),
            ])?
            .returning_col(Blobs::Id)
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_blob(
        executor: &mut PgConnection,
        digest: &OciDigest,
    ) -> Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn get_blob_in_version(
        executor: &mut PgConnection,
        version_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([
                (Blobs::Table, Blobs::Id),
                (Blobs::Table, Blobs::Digest),
                (Blobs::Table, Blobs::BytesOnDisk),
            ])
            .inner_join(
                VersionContent::Table,
                Expr::col((VersionContent::Table, VersionContent::ContentId))
                    .equals((Blobs::Table, Blobs::Id)),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::VersionId)).eq(*version_id),
            )
            .and_where(Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("blob"))
            .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn get_blobs(
        executor: &mut PgConnection,
        digests: &[String],
    ) -> Result<Vec<Blob>> {
        if digests.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            .and_where(Expr::col(Blobs::Digest).is_in(digests.iter().cloned()))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn get_blobs_by_ids(
        executor: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<Vec<Blob>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            .and_where(Expr::col(Blobs::Id).is_in(ids.iter().copied()))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn delete_blob(executor: &mut PgConnection, blob_id: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .cond_where(Expr::col(Blobs::Id).eq(*blob_id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    /// Blob rows referenced by no repository version. Manifest-layer edges
    /// do not keep a blob alive on their own: a manifest outside every
    /// version is itself an orphan.
    pub async fn orphan_blobs(executor: &mut PgConnection) -> Result<Vec<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            .and_where(
                Expr::col(Blobs::Id).not_in_subquery(
                    Query::select()
                        .from(VersionContent::Table)
                        .column(VersionContent::ContentId)
                        .and_where(Expr::col(VersionContent::ContentKind).eq("blob"))
                        .to_owned(),
                ),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    // ------------------------------------------------------------------
    // manifests

    pub async fn insert_manifest(
        executor: &mut PgConnection,
        manifest: &Manifest,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Manifests::Table)
            .columns([
                Manifests::Id,
                Manifests::Digest,
                Manifests::MediaType,
                Manifests::SchemaVersion,
                Manifests::ConfigBlobDigest,
                Manifests::Annotations,
                Manifests::Labels,
                Manifests::IsBootable,
                Manifests::IsFlatpak,
                Manifests::IsHelm,
                Manifests::IsCosign,
                Manifests::BytesOnDisk,
            ])
            .values([
                manifest.id.into(),
                String::from(&manifest.digest).into(),
                manifest.media_type.clone().into(),
                manifest.schema_version.into(),
                manifest
                    .config_blob_digest
                    .as_ref()
                    .map(String::from)
                    .into(),
                serde_json::to_value(&manifest.annotations)?.into(),
                serde_json::to_value(&manifest.labels)?.into(),
                manifest.characteristics.is_bootable.into(),
                manifest.characteristics.is_flatpak.into(),
                manifest.characteristics.is_helm.into(),
                manifest.characteristics.is_cosign_signature.into(),
                manifest.bytes_on_disk.into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    fn select_manifests() -> sea_query::SelectStatement {
        Query::select()
            .from(Manifests::Table)
            .columns([
                (Manifests::Table, Manifests::Id),
                (Manifests::Table, Manifests::Digest),
                (Manifests::Table, Manifests::MediaType),
                (Manifests::Table, Manifests::SchemaVersion),
                (Manifests::Table, Manifests::ConfigBlobDigest),
                (Manifests::Table, Manifests::Annotations),
                (Manifests::Table, Manifests::Labels),
                (Manifests::Table, Manifests::IsBootable),
                (Manifests::Table, Manifests::IsFlatpak),
                (Manifests::Table, Manifests::IsHelm),
                (Manifests::Table, Manifests::IsCosign),
                (Manifests::Table, Manifests::BytesOnDisk),
            ])
            .to_owned()
    }

    pub async fn get_manifest_by_digest(
        executor: &mut PgConnection,
        digest: &OciDigest,
    ) -> Result<Option<Manifest>> {
        let (sql, values) = Self::select_manifests()
            .and_where(
                Expr::col((Manifests::Table, Manifests::Digest)).eq(String::from(digest)),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn get_manifests_by_digests(
        executor: &mut PgConnection,
        digests: &[String],
    ) -> Result<Vec<Manifest>> {
        if digests.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Self::select_manifests()
            .and_where(
                Expr::col((Manifests::Table, Manifests::Digest))
                    .is_in(digests.iter().cloned()),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn get_manifests_by_ids(
        executor: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<Vec<Manifest>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Self::select_manifests()
            .and_where(Expr::col((Manifests::Table, Manifests::Id)).is_in(ids.iter().copied()))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn get_manifest_in_version(
        executor: &mut PgConnection,
        version_id: &Uuid,
        manifest_ref: &ManifestRef,
    ) -> Result<Option<Manifest>> {
        let mut builder = Self::select_manifests();

        match manifest_ref {
            ManifestRef::Digest(d) => {
                builder
                    .inner_join(
                        VersionContent::Table,
                        Expr::col((VersionContent::Table, VersionContent::ContentId))
                            .equals((Manifests::Table, Manifests::Id)),
                    )
                    .and_where(
                        Expr::col((VersionContent::Table, VersionContent::VersionId))
                            .eq(*version_id),
                    )
                    .and_where(
                        Expr::col((VersionContent::Table, VersionContent::ContentKind))
                            .eq("manifest"),
                    )
                    .and_where(
                        Expr::col((Manifests::Table, Manifests::Digest)).eq(String::from(d)),
                    );
            }
            ManifestRef::Tag(t) => {
                builder
                    .inner_join(
                        Tags::Table,
                        Expr::col((Tags::Table, Tags::ManifestId))
                            .equals((Manifests::Table, Manifests::Id)),
                    )
                    .inner_join(
                        VersionContent::Table,
                        Expr::col((VersionContent::Table, VersionContent::ContentId))
                            .equals((Tags::Table, Tags::Id)),
                    )
                    .and_where(
                        Expr::col((VersionContent::Table, VersionContent::VersionId))
                            .eq(*version_id),
                    )
                    .and_where(
                        Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("tag"),
                    )
                    .and_where(Expr::col((Tags::Table, Tags::Name)).eq(t.as_str()));
            }
        }

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn manifests_in_version(
        executor: &mut PgConnection,
        version_id: &Uuid,
    ) -> Result<Vec<Manifest>> {
        let (sql, values) = Self::select_manifests()
            .inner_join(
                VersionContent::Table,
                Expr::col((VersionContent::Table, VersionContent::ContentId))
                    .equals((Manifests::Table, Manifests::Id)),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::VersionId)).eq(*version_id),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("manifest"),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn insert_manifest_layers(
        executor: &mut PgConnection,
        manifest_id: &Uuid,
        blob_ids: &[Uuid],
    ) -> Result<()> {
        if blob_ids.is_empty() {
            return Ok(());
        }
        let mut builder = Query::insert();
        builder.into_table(ManifestLayers::Table).columns([
            ManifestLayers::ManifestId,
            ManifestLayers::BlobId,
            ManifestLayers::Ordinal,
        ]);
        for (ordinal, blob_id) in blob_ids.iter().enumerate() {
            builder.values([
                (*manifest_id).into(),
                (*blob_id).into(),
                (ordinal as i32).into(),
            ])?;
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_manifest_layers(
        executor: &mut PgConnection,
        manifest_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, Uuid)>> {
        if manifest_ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Query::select()
            .from(ManifestLayers::Table)
            .columns([
                ManifestLayers::ManifestId,
                ManifestLayers::BlobId,
                ManifestLayers::Ordinal,
            ])
            .and_where(
                Expr::col(ManifestLayers::ManifestId).is_in(manifest_ids.iter().copied()),
            )
            .order_by(ManifestLayers::Ordinal, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| Ok((row.try_get("manifest_id")?, row.try_get("blob_id")?)))
            .collect()
    }

    pub async fn insert_index_children(
        executor: &mut PgConnection,
        parent_id: &Uuid,
        child_digests: &[String],
    ) -> Result<()> {
        if child_digests.is_empty() {
            return Ok(());
        }
        let mut builder = Query::insert();
        builder.into_table(IndexManifests::Table).columns([
            IndexManifests::ParentId,
            IndexManifests::ChildDigest,
            IndexManifests::Ordinal,
        ]);
        for (ordinal, digest) in child_digests.iter().enumerate() {
            builder.values([
                (*parent_id).into(),
                digest.clone().into(),
                (ordinal as i32).into(),
            ])?;
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_index_children(
        executor: &mut PgConnection,
        parent_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, String)>> {
        if parent_ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Query::select()
            .from(IndexManifests::Table)
            .columns([
                IndexManifests::ParentId,
                IndexManifests::ChildDigest,
                IndexManifests::Ordinal,
            ])
            .and_where(Expr::col(IndexManifests::ParentId).is_in(parent_ids.iter().copied()))
            .order_by(IndexManifests::Ordinal, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| Ok((row.try_get("parent_id")?, row.try_get("child_digest")?)))
            .collect()
    }

    pub async fn delete_manifest(executor: &mut PgConnection, id: &Uuid) -> Result<()> {
        for (sql, values) in [
            Query::delete()
                .from_table(ManifestLayers::Table)
                .cond_where(Expr::col(ManifestLayers::ManifestId).eq(*id))
                .build_sqlx(PostgresQueryBuilder),
            Query::delete()
                .from_table(IndexManifests::Table)
                .cond_where(Expr::col(IndexManifests::ParentId).eq(*id))
                .build_sqlx(PostgresQueryBuilder),
            Query::delete()
                .from_table(Manifests::Table)
                .cond_where(Expr::col(Manifests::Id).eq(*id))
                .build_sqlx(PostgresQueryBuilder),
        ] {
            sqlx::query_with(&sql, values).execute(&mut *executor).await?;
        }
        Ok(())
    }

    pub async fn orphan_manifests(executor: &mut PgConnection) -> Result<Vec<Manifest>> {
        let (sql, values) = Self::select_manifests()
            .and_where(
                Expr::col((Manifests::Table, Manifests::Id)).not_in_subquery(
                    Query::select()
                        .from(VersionContent::Table)
                        .column(VersionContent::ContentId)
                        .and_where(Expr::col(VersionContent::ContentKind).eq("manifest"))
                        .to_owned(),
                ),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    // ------------------------------------------------------------------
    // tags

    fn select_tags() -> sea_query::SelectStatement {
        Query::select()
            .from(Tags::Table)
            .columns([
                (Tags::Table, Tags::Id),
                (Tags::Table, Tags::Name),
                (Tags::Table, Tags::ManifestId),
            ])
            .expr_as(
                Expr::col((Manifests::Table, Manifests::Digest)),
                sea_query::Alias::new("manifest_digest"),
            )
            .inner_join(
                Manifests::Table,
                Expr::col((Tags::Table, Tags::ManifestId))
                    .equals((Manifests::Table, Manifests::Id)),
            )
            .to_owned()
    }

    pub async fn find_tag(
        executor: &mut PgConnection,
        name: &str,
        manifest_id: &Uuid,
    ) -> Result<Option<Tag>> {
        let (sql, values) = Self::select_tags()
            .and_where(Expr::col((Tags::Table, Tags::Name)).eq(name))
            .and_where(Expr::col((Tags::Table, Tags::ManifestId)).eq(*manifest_id))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn insert_tag(
        executor: &mut PgConnection,
        name: &str,
        manifest_id: &Uuid,
    ) -> Result<Uuid> {
        let (sql, values) = Query::insert()
            .into_table(Tags::Table)
            .columns([Tags::Id, Tags::Name, Tags::ManifestId])
            .values([Uuid::new_v4().into(), name.into(), (*manifest_id).into()])?
            .returning_col(Tags::Id)
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_tags_by_ids(
        executor: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<Vec<Tag>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Self::select_tags()
            .and_where(Expr::col((Tags::Table, Tags::Id)).is_in(ids.iter().copied()))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn tags_in_version(
        executor: &mut PgConnection,
        version_id: &Uuid,
        n: Option<i64>,
        last: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let mut builder = Self::select_tags();
        builder
            .inner_join(
                VersionContent::Table,
                Expr::col((VersionContent::Table, VersionContent::ContentId))
                    .equals((Tags::Table, Tags::Id)),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::VersionId)).eq(*version_id),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("tag"),
            )
            .order_by((Tags::Table, Tags::Name), Order::Asc);
        if let Some(last) = last {
            builder.and_where(Expr::col((Tags::Table, Tags::Name)).gt(last));
        }
        if let Some(n) = n {
            builder.limit(n as u64);
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn tag_in_version_by_name(
        executor: &mut PgConnection,
        version_id: &Uuid,
        name: &str,
    ) -> Result<Option<Tag>> {
        let (sql, values) = Self::select_tags()
            .inner_join(
                VersionContent::Table,
                Expr::col((VersionContent::Table, VersionContent::ContentId))
                    .equals((Tags::Table, Tags::Id)),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::VersionId)).eq(*version_id),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("tag"),
            )
            .and_where(Expr::col((Tags::Table, Tags::Name)).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    // ------------------------------------------------------------------
    // signatures

    fn select_signatures() -> sea_query::SelectStatement {
        Query::select()
            .from(Signatures::Table)
            .columns([
                (Signatures::Table, Signatures::Id),
                (Signatures::Table, Signatures::Name),
                (Signatures::Table, Signatures::ManifestDigest),
                (Signatures::Table, Signatures::Kind),
                (Signatures::Table, Signatures::KeyId),
                (Signatures::Table, Signatures::Digest),
                (Signatures::Table, Signatures::BytesOnDisk),
            ])
            .to_owned()
    }

    pub async fn insert_signature(
        executor: &mut PgConnection,
        signature: &Signature,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Signatures::Table)
            .columns([
                Signatures::Id,
                Signatures::Name,
                Signatures::ManifestDigest,
                Signatures::Kind,
                Signatures::KeyId,
                Signatures::Digest,
                Signatures::BytesOnDisk,
            ])
            .values([
                signature.id.into(),
                signature.name.clone().into(),
                String::from(&signature.manifest_digest).into(),
                signature.kind.as_str().into(),
                signature.key_id.clone().into(),
                String::from(&signature.digest).into(),
                signature.bytes_on_disk.into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_signature(
        executor: &mut PgConnection,
        name: &str,
        manifest_digest: &OciDigest,
    ) -> Result<Option<Signature>> {
        let (sql, values) = Self::select_signatures()
            .and_where(Expr::col((Signatures::Table, Signatures::Name)).eq(name))
            .and_where(
                Expr::col((Signatures::Table, Signatures::ManifestDigest))
                    .eq(String::from(manifest_digest)),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Signature, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn signatures_for_manifests(
        executor: &mut PgConnection,
        manifest_digests: &[String],
    ) -> Result<Vec<Signature>> {
        if manifest_digests.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Self::select_signatures()
            .and_where(
                Expr::col((Signatures::Table, Signatures::ManifestDigest))
                    .is_in(manifest_digests.iter().cloned()),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Signature, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn signatures_in_version(
        executor: &mut PgConnection,
        version_id: &Uuid,
        manifest_digest: &OciDigest,
    ) -> Result<Vec<Signature>> {
        let (sql, values) = Self::select_signatures()
            .inner_join(
                VersionContent::Table,
                Expr::col((VersionContent::Table, VersionContent::ContentId))
                    .equals((Signatures::Table, Signatures::Id)),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::VersionId)).eq(*version_id),
            )
            .and_where(
                Expr::col((VersionContent::Table, VersionContent::ContentKind)).eq("signature"),
            )
            .and_where(
                Expr::col((Signatures::Table, Signatures::ManifestDigest))
                    .eq(String::from(manifest_digest)),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Signature, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn get_signatures_by_ids(
        executor: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<Vec<Signature>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let (sql, values) = Self::select_signatures()
            .and_where(Expr::col((Signatures::Table, Signatures::Id)).is_in(ids.iter().copied()))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Signature, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn delete_signature(executor: &mut PgConnection, id: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Signatures::Table)
            .cond_where(Expr::col(Signatures::Id).eq(*id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn orphan_signatures(executor: &mut PgConnection) -> Result<Vec<Signature>> {
        let (sql, values) = Self::select_signatures()
            .and_where(
                Expr::col((Signatures::Table, Signatures::Id)).not_in_subquery(
                    Query::select()
                        .from(VersionContent::Table)
                        .column(VersionContent::ContentId)
                        .and_where(Expr::col(VersionContent::ContentKind).eq("signature"))
                        .to_owned(),
                ),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Signature, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    // ------------------------------------------------------------------
    // distributions & remotes

    pub async fn get_distribution(
        executor: &mut PgConnection,
        base_path: &str,
    ) -> Result<Option<Distribution>> {
        let (sql, values) = Query::select()
            .from(Distributions::Table)
            .columns([
                (Distributions::Table, Distributions::Id),
                (Distributions::Table, Distributions::BasePath),
                (Distributions::Table, Distributions::RepositoryId),
                (Distributions::Table, Distributions::VersionNumber),
                (Distributions::Table, Distributions::Private),
                (Distributions::Table, Distributions::RemoteId),
            ])
            .expr_as(
                Expr::col((Repositories::Table, Repositories::Name)),
                sea_query::Alias::new("repository_name"),
            )
            .inner_join(
                Repositories::Table,
                Expr::col((Distributions::Table, Distributions::RepositoryId))
                    .equals((Repositories::Table, Repositories::Id)),
            )
            .and_where(Expr::col((Distributions::Table, Distributions::BasePath)).eq(base_path))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Distribution, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn upsert_distribution(
        executor: &mut PgConnection,
        base_path: &str,
        repository_id: &Uuid,
        version_number: Option<i64>,
        private: bool,
        remote_id: Option<Uuid>,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Distributions::Table)
            .columns([
                Distributions::Id,
                Distributions::BasePath,
                Distributions::RepositoryId,
                Distributions::VersionNumber,
                Distributions::Private,
                Distributions::RemoteId,
            ])
            .values([
                Uuid::new_v4().into(),
                base_path.into(),
                (*repository_id).into(),
                version_number.into(),
                private.into(),
                remote_id.into(),
            ])?
            .on_conflict(
                OnConflict::column(Distributions::BasePath)
                    .update_columns([
                        Distributions::RepositoryId,
                        Distributions::VersionNumber,
                        Distributions::Private,
                        Distributions::RemoteId,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_remote(
        executor: &mut PgConnection,
        id: &Uuid,
    ) -> Result<Option<Remote>> {
        let (sql, values) = Query::select()
            .from(Remotes::Table)
            .columns([
                Remotes::Id,
                Remotes::Name,
                Remotes::Url,
                Remotes::UpstreamName,
                Remotes::Username,
                Remotes::Password,
                Remotes::Sigstore,
                Remotes::IncludeTags,
                Remotes::ExcludeTags,
                Remotes::Policy,
                Remotes::MaxRetries,
                Remotes::RateLimit,
            ])
            .and_where(Expr::col(Remotes::Id).eq(*id))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Remote, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn upsert_remote(executor: &mut PgConnection, remote: &Remote) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Remotes::Table)
            .columns([
                Remotes::Id,
                Remotes::Name,
                Remotes::Url,
                Remotes::UpstreamName,
                Remotes::Username,
                Remotes::Password,
                Remotes::Sigstore,
                Remotes::IncludeTags,
                Remotes::ExcludeTags,
                Remotes::Policy,
                Remotes::MaxRetries,
                Remotes::RateLimit,
            ])
            .values([
                remote.id.into(),
                remote.name.clone().into(),
                remote.url.clone().into(),
                remote.upstream_name.clone().into(),
                remote.username.clone().into(),
                remote.password.clone().into(),
                remote.sigstore.clone().into(),
                serde_json::to_value(&remote.include_tags)?.into(),
                serde_json::to_value(&remote.exclude_tags)?.into(),
                remote.policy.as_str().into(),
                remote.max_retries.into(),
                remote.rate_limit.into(),
            ])?
            .on_conflict(
                OnConflict::column(Remotes::Name)
                    .update_columns([
                        Remotes::Url,
                        Remotes::UpstreamName,
                        Remotes::Username,
                        Remotes::Password,
                        Remotes::Sigstore,
                        Remotes::IncludeTags,
                        Remotes::ExcludeTags,
                        Remotes::Policy,
                        Remotes::MaxRetries,
                        Remotes::RateLimit,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_remote_by_name(
        executor: &mut PgConnection,
        name: &str,
    ) -> Result<Option<Remote>> {
        let (sql, values) = Query::select()
            .from(Remotes::Table)
            .columns([
                Remotes::Id,
                Remotes::Name,
                Remotes::Url,
                Remotes::UpstreamName,
                Remotes::Username,
                Remotes::Password,
                Remotes::Sigstore,
                Remotes::IncludeTags,
                Remotes::ExcludeTags,
                Remotes::Policy,
                Remotes::MaxRetries,
                Remotes::RateLimit,
            ])
            .and_where(Expr::col(Remotes::Name).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Remote, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    // ------------------------------------------------------------------
    // upload sessions

    pub async fn new_upload_session(
        executor: &mut PgConnection,
        repository_id: &Uuid,
    ) -> Result<UploadSession> {
        let session = UploadSession {
            uuid: Uuid::new_v4(),
            repository_id: *repository_id,
            start_date: chrono::Utc::now().date_naive(),
            upload_id: None,
            chunk_number: 1,
            last_range_end: -1,
            bytes: 0,
        };
        let (sql, values) = Query::insert()
            .into_table(UploadSessions::Table)
            .columns([
                UploadSessions::Uuid,
                UploadSessions::RepositoryId,
                UploadSessions::StartDate,
                UploadSessions::UploadId,
                UploadSessions::ChunkNumber,
                UploadSessions::LastRangeEnd,
                UploadSessions::Bytes,
            ])
            .values([
                session.uuid.into(),
                session.repository_id.into(),
                session.start_date.into(),
                session.upload_id.clone().into(),
                session.chunk_number.into(),
                session.last_range_end.into(),
                session.bytes.into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(session)
    }

    pub async fn get_session(
        executor: &mut PgConnection,
        uuid: &Uuid,
    ) -> Result<Option<UploadSession>> {
        let (sql, values) = Query::select()
            .from(UploadSessions::Table)
            .columns([
                UploadSessions::Uuid,
                UploadSessions::RepositoryId,
                UploadSessions::StartDate,
                UploadSessions::UploadId,
                UploadSessions::ChunkNumber,
                UploadSessions::LastRangeEnd,
                UploadSessions::Bytes,
            ])
            .and_where(Expr::col(UploadSessions::Uuid).eq(*uuid))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, UploadSession, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn update_session(
        executor: &mut PgConnection,
        session: &UploadSession,
    ) -> Result<()> {
        let (sql, values) = Query::update()
            .table(UploadSessions::Table)
            .value(UploadSessions::UploadId, session.upload_id.clone())
            .value(UploadSessions::ChunkNumber, session.chunk_number)
            .value(UploadSessions::LastRangeEnd, session.last_range_end)
            .value(UploadSessions::Bytes, session.bytes)
            .and_where(Expr::col(UploadSessions::Uuid).eq(session.uuid))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn delete_session(executor: &mut PgConnection, uuid: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(UploadSessions::Table)
            .cond_where(Expr::col(UploadSessions::Uuid).eq(*uuid))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn insert_chunk(
        executor: &mut PgConnection,
        session_uuid: &Uuid,
        chunk: &Chunk,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Chunks::Table)
            .columns([
                Chunks::UploadSessionUuid,
                Chunks::ChunkNumber,
                Chunks::ETag,
            ])
            .values([
                (*session_uuid).into(),
                chunk.chunk_number.into(),
                chunk.e_tag.clone().into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_chunks(
        executor: &mut PgConnection,
        session_uuid: &Uuid,
    ) -> Result<Vec<Chunk>> {
        let (sql, values) = Query::select()
            .from(Chunks::Table)
            .columns([Chunks::ETag, Chunks::ChunkNumber])
            .and_where(Expr::col(Chunks::UploadSessionUuid).eq(*session_uuid))
            .order_by(Chunks::ChunkNumber, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Chunk, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn delete_chunks(executor: &mut PgConnection, session_uuid: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Chunks::Table)
            .cond_where(Expr::col(Chunks::UploadSessionUuid).eq(*session_uuid))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }
}
