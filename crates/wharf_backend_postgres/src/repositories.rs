use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use wharf_core::registry::{
    namespace_of, validate_repository_name, BlobStore, Distribution, ManifestStore, Remote,
    RepositoryKind, RepositoryStore, RepositoryStoreManager, SignatureStore, UploadSessionStore,
    VersionStore,
};
use wharf_core::Error as CoreError;
use wharf_core::MediaTypeRegistry;
use wharf_core::Result;
use wharf_objectstore::ObjectStore;

use super::blobs::PgBlobStore;
use super::errors::Error;
use super::manifests::PgManifestStore;
use super::metadata::{MetadataPool, Queries, Repository};
use super::signatures::PgSignatureStore;
use super::uploads::PgSessionStore;
use super::versions::PgVersionStore;

/// Provides [`PgRepository`] instances and registry-wide entity lookups.
#[derive(Clone)]
pub struct PgRepositoryManager {
    metadata: MetadataPool,
    objects: Arc<dyn ObjectStore>,
    media_types: Arc<MediaTypeRegistry>,
}

impl PgRepositoryManager {
    pub fn new(
        metadata: MetadataPool,
        objects: Arc<dyn ObjectStore>,
        media_types: Arc<MediaTypeRegistry>,
    ) -> Self {
        Self {
            metadata,
            objects,
            media_types,
        }
    }

    pub fn metadata(&self) -> &MetadataPool {
        &self.metadata
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Bootstrap helper used at startup for statically configured remotes.
    pub async fn upsert_remote(&self, remote: &Remote) -> Result<Uuid> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let row = super::metadata::Remote {
            id: remote.id,
            name: remote.name.clone(),
            url: remote.url.clone(),
            upstream_name: remote.upstream_name.clone(),
            username: remote.username.clone(),
            password: remote.password.clone(),
            sigstore: remote.sigstore.clone(),
            include_tags: remote.include_tags.clone(),
            exclude_tags: remote.exclude_tags.clone(),
            policy: remote.policy,
            max_retries: remote.max_retries as i32,
            rate_limit: remote.rate_limit.map(|v| v as i32),
        };
        Queries::upsert_remote(conn.executor(), &row)
            .await
            .map_err(Error::from)?;
        let stored = Queries::get_remote_by_name(conn.executor(), &remote.name)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| CoreError::BackendError("remote upsert lost".to_string()))?;
        Ok(stored.id)
    }

    /// Bootstrap helper used at startup for statically configured
    /// distributions (including pull-through caches).
    pub async fn upsert_distribution(
        &self,
        base_path: &str,
        repository_name: &str,
        version_number: Option<i64>,
        private: bool,
        remote_id: Option<Uuid>,
    ) -> Result<()> {
        let repository = match self.get(repository_name).await? {
            Some(r) => r,
            None => {
                let kind = if remote_id.is_some() {
                    RepositoryKind::Sync
                } else {
                    RepositoryKind::Push
                };
                self.create(repository_name, kind).await?
            }
        };
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Queries::upsert_distribution(
            conn.executor(),
            base_path,
            &repository.id(),
            version_number,
            private,
            remote_id,
        )
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    fn repository_store(&self, repository: Repository) -> Arc<dyn RepositoryStore> {
        Arc::new(PgRepository {
            metadata: self.metadata.clone(),
            objects: self.objects.clone(),
            media_types: self.media_types.clone(),
            repository,
        })
    }
}

#[async_trait]
impl RepositoryStoreManager for PgRepositoryManager {
    async fn get(&self, name: &str) -> Result<Option<Arc<dyn RepositoryStore>>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(Queries::get_repository(conn.executor(), name)
            .await
            .map_err(Error::from)?
            .map(|r| self.repository_store(r)))
    }

    async fn create(&self, name: &str, kind: RepositoryKind) -> Result<Arc<dyn RepositoryStore>> {
        validate_repository_name(name)?;
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let executor = tx.executor().map_err(Error::from)?;
        Queries::ensure_namespace(executor, namespace_of(name))
            .await
            .map_err(Error::from)?;
        let repository = Queries::insert_repository(executor, name, kind)
            .await
            .map_err(Error::from)?;
        // every repository starts from an empty version zero
        Queries::insert_version(executor, &repository.id, 0, None)
            .await
            .map_err(Error::from)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(self.repository_store(repository))
    }

    async fn catalog(&self, n: i64, last: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Queries::list_repositories(conn.executor(), n, last)
            .await
            .map_err(|e| Error::from(e).into())
    }

    async fn distribution(&self, base_path: &str) -> Result<Option<Distribution>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(Queries::get_distribution(conn.executor(), base_path)
            .await
            .map_err(Error::from)?
            .map(Into::into))
    }

    async fn remote(&self, id: &Uuid) -> Result<Option<Remote>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(Queries::get_remote(conn.executor(), id)
            .await
            .map_err(Error::from)?
            .map(Into::into))
    }
}

/// Scoped access to one repository, handing out the per-concern stores.
pub struct PgRepository {
    metadata: MetadataPool,
    objects: Arc<dyn ObjectStore>,
    media_types: Arc<MediaTypeRegistry>,
    repository: Repository,
}

impl PgRepository {
    fn blobstore(&self) -> PgBlobStore {
        PgBlobStore::new(
            self.metadata.clone(),
            self.objects.clone(),
            self.repository.clone(),
        )
    }
}

impl RepositoryStore for PgRepository {
    fn id(&self) -> Uuid {
        self.repository.id
    }

    fn name(&self) -> &str {
        &self.repository.name
    }

    fn kind(&self) -> RepositoryKind {
        self.repository.kind
    }

    fn blob_store(&self) -> Arc<dyn BlobStore> {
        Arc::new(self.blobstore())
    }

    fn manifest_store(&self) -> Arc<dyn ManifestStore> {
        Arc::new(PgManifestStore::new(
            self.blobstore(),
            self.media_types.clone(),
        ))
    }

    fn upload_session_store(&self) -> Arc<dyn UploadSessionStore> {
        Arc::new(PgSessionStore::new(
            self.metadata.clone(),
            self.repository.clone(),
        ))
    }

    fn version_store(&self) -> Arc<dyn VersionStore> {
        Arc::new(PgVersionStore::new(
            self.metadata.clone(),
            self.repository.clone(),
        ))
    }

    fn signature_store(&self) -> Arc<dyn SignatureStore> {
        Arc::new(PgSignatureStore::new(
            self.blobstore(),
            self.media_types.clone(),
        ))
    }
}
