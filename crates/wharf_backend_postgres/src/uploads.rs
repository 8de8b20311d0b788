use async_trait::async_trait;
use uuid::Uuid;

use wharf_core::registry::{UploadSession, UploadSessionStore};
use wharf_core::Error as CoreError;
use wharf_core::Result;

use super::errors::Error;
use super::metadata::{MetadataPool, Queries, Repository};

#[derive(Clone)]
pub struct PgSessionStore {
    metadata: MetadataPool,
    repository: Repository,
}

impl PgSessionStore {
    pub fn new(metadata: MetadataPool, repository: Repository) -> Self {
        Self {
            metadata,
            repository,
        }
    }
}

#[async_trait]
impl UploadSessionStore for PgSessionStore {
    async fn new_upload_session(&self) -> Result<UploadSession> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(
            Queries::new_upload_session(conn.executor(), &self.repository.id)
                .await
                .map_err(Error::from)?
                .into(),
        )
    }

    async fn get_upload_session(&self, session_uuid: &Uuid) -> Result<UploadSession> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(Queries::get_session(conn.executor(), session_uuid)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::BlobUploadUnknown)?
            .into())
    }

    async fn delete_session(&self, session_uuid: &Uuid) -> Result<()> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        Queries::delete_chunks(tx.executor().map_err(Error::from)?, session_uuid)
            .await
            .map_err(Error::from)?;
        Queries::delete_session(tx.executor().map_err(Error::from)?, session_uuid)
            .await
            .map_err(Error::from)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }
}
