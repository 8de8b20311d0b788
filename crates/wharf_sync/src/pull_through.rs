//! On-demand population of cache repositories.
//!
//! A distribution bound to a pull-through remote serves whatever is cached;
//! when a pull misses, the HTTP layer calls into here to synchronously sync
//! the one requested image and then serves it from the just-created
//! repository version. Cache repositories are single-version: each fetch
//! replaces the previous snapshot, though previously fetched tags stay in
//! the content set.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Body;

use wharf_core::registry::{
    ByteStream, ContentRef, DownloadPolicy, OnDemandFetcher, Remote, RepositoryKind,
    RepositoryStore, RepositoryStoreManager, SyncMode,
};
use wharf_core::Error as CoreError;
use wharf_core::OciDigest;
use wharf_tasks::{ResourceKey, TaskRuntime};

use super::client::UpstreamClient;
use super::errors::Error;
use super::sync::SyncJob;

#[derive(Clone)]
pub struct PullThroughCache {
    manager: Arc<dyn RepositoryStoreManager>,
    runtime: TaskRuntime,
}

impl PullThroughCache {
    pub fn new(manager: Arc<dyn RepositoryStoreManager>, runtime: TaskRuntime) -> Self {
        Self { manager, runtime }
    }

    async fn ensure_repository(
        &self,
        repo_name: &str,
    ) -> wharf_core::Result<Arc<dyn RepositoryStore>> {
        match self.manager.get(repo_name).await? {
            Some(repository) => Ok(repository),
            None => self.manager.create(repo_name, RepositoryKind::Sync).await,
        }
    }
}

#[async_trait]
impl OnDemandFetcher for PullThroughCache {
    async fn fetch_image(
        &self,
        repo_name: &str,
        remote: &Remote,
        reference: &str,
    ) -> wharf_core::Result<()> {
        let repository = self.ensure_repository(repo_name).await?;

        let job = SyncJob {
            repository: repository.clone(),
            remote: remote.clone(),
            mode: SyncMode::Additive,
            runtime: self.runtime.clone(),
        };

        let mut client = UpstreamClient::for_remote(remote);
        let digest = job
            .sync_reference(&mut client, reference)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::ManifestUnknown(Some(reference.to_string())))?;

        let refs = match OciDigest::try_from(reference) {
            Ok(_) => vec![ContentRef::Manifest(digest)],
            Err(_) => vec![ContentRef::Tag {
                name: reference.to_string(),
                manifest: Some(digest),
            }],
        };

        let version_store = repository.version_store();
        self.runtime
            .run_exclusive(
                vec![ResourceKey::repository(repository.name())],
                async move {
                    version_store.recursive_add(&refs).await?;
                    // cache repositories retain only their newest snapshot
                    version_store.prune_older_versions().await?;
                    Ok::<_, CoreError>(())
                },
            )
            .await?;

        tracing::info!(
            repository = repo_name,
            reference,
            "pull-through fetch complete",
        );
        Ok(())
    }

    async fn fetch_blob(
        &self,
        repo_name: &str,
        remote: &Remote,
        digest: &OciDigest,
    ) -> wharf_core::Result<Option<ByteStream>> {
        let mut client = UpstreamClient::for_remote(remote);

        if remote.policy == DownloadPolicy::Streamed {
            // never stored; the upstream body is proxied straight through
            let response = client.get_blob(digest).await.map_err(CoreError::from)?;
            let stream: ByteStream = Box::pin(futures::TryStreamExt::map_err(
                response.bytes_stream(),
                |e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) },
            ));
            return Ok(Some(stream));
        }

        // on_demand: download, store, let the caller serve from the store
        let repository = self.ensure_repository(repo_name).await?;
        let blob_store = repository.blob_store();
        if blob_store.head_global(digest).await?.is_none() {
            let response = client.get_blob(digest).await.map_err(CoreError::from)?;
            match response.content_length() {
                Some(len) => {
                    let body = Body::wrap_stream(response.bytes_stream());
                    blob_store.put(digest, len, body).await?;
                }
                None => {
                    let bytes = response.bytes().await.map_err(Error::from).map_err(CoreError::from)?;
                    let len = bytes.len() as u64;
                    blob_store.put(digest, len, Body::from(bytes)).await?;
                }
            }
        }

        let version_store = repository.version_store();
        let blob_digest = digest.clone();
        self.runtime
            .run_exclusive(
                vec![ResourceKey::repository(repository.name())],
                async move {
                    version_store
                        .recursive_add(&[ContentRef::Blob(blob_digest)])
                        .await?;
                    Ok::<_, CoreError>(())
                },
            )
            .await?;
        Ok(None)
    }
}
