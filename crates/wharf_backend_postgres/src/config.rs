use std::sync::Arc;

use serde::Deserialize;

use wharf_core::MediaTypeRegistry;
use wharf_core::Result;

use super::errors::Error;
use super::metadata::PostgresConfig;
use super::repositories::PgRepositoryManager;

/// Backend configuration: relational metadata plus bulk object storage.
#[derive(Clone, Deserialize)]
pub struct PgBackendConfig {
    pub postgres: PostgresConfig,
    pub objects: wharf_objectstore::Config,
}

impl PgBackendConfig {
    pub async fn get_manager(
        &self,
        media_types: Arc<MediaTypeRegistry>,
    ) -> Result<PgRepositoryManager> {
        let metadata = self.postgres.new_metadata().await.map_err(Error::from)?;
        let objects = self.objects.build().await.map_err(Error::from)?;
        Ok(PgRepositoryManager::new(metadata, objects, media_types))
    }
}
