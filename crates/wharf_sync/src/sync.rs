//! Mirror and additive synchronization from an upstream registry.

use std::collections::VecDeque;
use std::sync::Arc;

use hyper::body::Body;

use wharf_core::registry::{
    ContentRef, DownloadPolicy, Remote, RepositoryStore, SyncMode,
};
use wharf_core::ManifestSpec;
use wharf_core::OciDigest;
use wharf_tasks::{ResourceKey, TaskRuntime};

use super::client::{FetchedManifest, UpstreamClient};
use super::errors::{Error, Result};
use super::filter::TagFilter;
use super::signatures;

#[derive(Clone, Debug, Default)]
pub struct SyncOutcome {
    pub version: i64,
    pub tags_synced: Vec<String>,
    pub tags_removed: Vec<String>,
}

/// One synchronization run of a repository against its remote.
pub struct SyncJob {
    pub repository: Arc<dyn RepositoryStore>,
    pub remote: Remote,
    pub mode: SyncMode,
    pub runtime: TaskRuntime,
}

impl SyncJob {
    /// Execute the sync: list, filter, fetch, then build the new repository
    /// version under the repository's write reservation. Upstream failures
    /// leave the repository at its last committed version.
    pub async fn run(&self) -> Result<SyncOutcome> {
        let filter = TagFilter::new(&self.remote.include_tags, &self.remote.exclude_tags)?;
        let mut client = UpstreamClient::for_remote(&self.remote);

        let upstream_tags = client.list_tags().await?;
        let selected = filter.apply(upstream_tags);
        tracing::info!(
            repository = self.repository.name(),
            remote = %self.remote.url,
            tags = selected.len(),
            "starting sync",
        );

        let mut refs: Vec<ContentRef> = Vec::with_capacity(selected.len());
        let mut synced: Vec<String> = Vec::with_capacity(selected.len());
        for tag in &selected {
            let Some(digest) = self.sync_reference(&mut client, tag).await? else {
                tracing::warn!(tag, "tag disappeared upstream during sync");
                continue;
            };
            match signatures::discover_and_ingest(
                &mut client,
                &self.remote,
                &self.repository,
                &digest,
                self,
            )
            .await
            {
                Ok(extra_refs) => refs.extend(extra_refs),
                Err(e) => {
                    tracing::warn!(tag, "signature discovery failed: {e}");
                }
            }
            refs.push(ContentRef::Tag {
                name: tag.clone(),
                manifest: Some(digest),
            });
            synced.push(tag.clone());
        }

        let keep: Vec<String> = refs
            .iter()
            .filter_map(|r| match r {
                ContentRef::Tag { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();

        let version_store = self.repository.version_store();
        let mode = self.mode;
        let outcome = self
            .runtime
            .run_exclusive(
                vec![ResourceKey::repository(self.repository.name())],
                async move {
                    let mut version = version_store.recursive_add(&refs).await?;
                    let mut removed = Vec::new();
                    if mode == SyncMode::Mirror {
                        let current = version_store.tags(None, None, None).await?;
                        let stale: Vec<ContentRef> = current
                            .iter()
                            .filter(|t| !keep.iter().any(|k| k == &t.name))
                            .map(|t| ContentRef::Tag {
                                name: t.name.clone(),
                                manifest: None,
                            })
                            .collect();
                        if !stale.is_empty() {
                            removed = stale
                                .iter()
                                .filter_map(|r| match r {
                                    ContentRef::Tag { name, .. } => Some(name.clone()),
                                    _ => None,
                                })
                                .collect();
                            version = version_store.recursive_remove(&stale).await?;
                        }
                    }
                    Ok::<_, Error>(SyncOutcome {
                        version,
                        tags_synced: synced,
                        tags_removed: removed,
                    })
                },
            )
            .await?;

        tracing::info!(
            repository = self.repository.name(),
            version = outcome.version,
            synced = outcome.tags_synced.len(),
            removed = outcome.tags_removed.len(),
            "sync complete",
        );
        Ok(outcome)
    }

    /// Sync a single reference (tag or digest) and return the digest of its
    /// manifest. Skips the download entirely when the upstream's advertised
    /// digest is already stored.
    pub(crate) async fn sync_reference(
        &self,
        client: &mut UpstreamClient,
        reference: &str,
    ) -> Result<Option<OciDigest>> {
        let manifest_store = self.repository.manifest_store();

        if let Some(digest) = client.head_manifest_digest(reference).await? {
            if manifest_store.get_global(&digest).await?.is_some() {
                tracing::debug!(reference, %digest, "manifest already present, skipping fetch");
                return Ok(Some(digest));
            }
        }

        let Some(fetched) = client.get_manifest(reference).await? else {
            return Ok(None);
        };
        Ok(Some(self.ingest_manifest_tree(client, fetched).await?))
    }

    /// Store a manifest and, depending on the download policy, its
    /// sub-manifests and blobs. Returns the root manifest's canonical
    /// digest.
    pub(crate) async fn ingest_manifest_tree(
        &self,
        client: &mut UpstreamClient,
        fetched: FetchedManifest,
    ) -> Result<OciDigest> {
        let manifest_store = self.repository.manifest_store();
        let mut root_digest: Option<OciDigest> = None;
        let mut queue: VecDeque<FetchedManifest> = VecDeque::from([fetched]);

        while let Some(item) = queue.pop_front() {
            let spec = ManifestSpec::parse(&item.bytes, Some(&item.media_type))?;

            if self.remote.policy == DownloadPolicy::Immediate {
                for child in spec.child_digests()? {
                    if manifest_store.get_global(&child).await?.is_some() {
                        continue;
                    }
                    if let Some(sub) = client.get_manifest(&child.to_string()).await? {
                        queue.push_back(sub);
                    } else {
                        tracing::warn!(%child, "list references a manifest missing upstream");
                    }
                }
                for blob in spec.blob_digests()? {
                    self.ensure_blob(client, &blob).await?;
                }
            }

            let record = manifest_store.put(&spec, item.bytes.clone(), false).await?;
            if root_digest.is_none() {
                root_digest = Some(record.digest);
            }
        }

        root_digest.ok_or_else(|| {
            Error::Upstream {
                status: 0,
                message: "manifest tree resolved to nothing".to_string(),
            }
        })
    }

    /// Download a blob unless the registry already holds it.
    pub(crate) async fn ensure_blob(
        &self,
        client: &mut UpstreamClient,
        digest: &OciDigest,
    ) -> Result<()> {
        let blob_store = self.repository.blob_store();
        if blob_store.head_global(digest).await?.is_some() {
            return Ok(());
        }

        let response = client.get_blob(digest).await?;
        match response.content_length() {
            Some(len) => {
                let body = Body::wrap_stream(response.bytes_stream());
                blob_store.put(digest, len, body).await?;
            }
            None => {
                // no declared length; buffer so the object store learns it
                let bytes = response.bytes().await?;
                let len = bytes.len() as u64;
                blob_store.put(digest, len, Body::from(bytes)).await?;
            }
        }
        Ok(())
    }
}
