use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use hyper::body::Body;
use uuid::Uuid;

use wharf_core::model::labels_from_config_bytes;
use wharf_core::registry::{ByteStream, ManifestRecord, ManifestRef, ManifestStore};
use wharf_core::Error as CoreError;
use wharf_core::ManifestSpec;
use wharf_core::MediaTypeRegistry;
use wharf_core::OciDigest;
use wharf_core::Result;
use wharf_objectstore::Key;

use super::blobs::{blob_key, PgBlobStore};
use super::errors::Error;
use super::metadata::{Manifest, Queries};

pub(crate) fn manifest_key(digest: &OciDigest) -> Key {
    Key::content(digest.algorithm().as_str(), digest.encoded())
}

pub struct PgManifestStore {
    blobstore: PgBlobStore,
    media_types: std::sync::Arc<MediaTypeRegistry>,
}

impl PgManifestStore {
    pub fn new(blobstore: PgBlobStore, media_types: std::sync::Arc<MediaTypeRegistry>) -> Self {
        Self {
            blobstore,
            media_types,
        }
    }

    /// Read the referenced config blob, if stored, to pull image labels out
    /// of it. Schema2/OCI manifests carry labels only in their config.
    async fn config_labels(&self, config_digest: &OciDigest) -> Result<HashMap<String, String>> {
        let mut conn = self
            .blobstore
            .metadata
            .get_conn()
            .await
            .map_err(Error::from)?;
        if Queries::get_blob(conn.executor(), config_digest)
            .await
            .map_err(Error::from)?
            .is_none()
        {
            return Ok(HashMap::new());
        }
        let stream = self
            .blobstore
            .objects
            .get(&blob_key(config_digest))
            .await
            .map_err(Error::from)?;
        let chunks: Vec<Bytes> = stream.try_collect().await.map_err(Error::from)?;
        let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
        Ok(labels_from_config_bytes(&bytes).unwrap_or_default())
    }
}

#[async_trait]
impl ManifestStore for PgManifestStore {
    async fn head(
        &self,
        version: Option<i64>,
        key: &ManifestRef,
    ) -> Result<Option<ManifestRecord>> {
        let version_id = self.blobstore.resolve_version(version).await?;
        let mut conn = self
            .blobstore
            .metadata
            .get_conn()
            .await
            .map_err(Error::from)?;
        Ok(
            Queries::get_manifest_in_version(conn.executor(), &version_id, key)
                .await
                .map_err(Error::from)?
                .map(Into::into),
        )
    }

    async fn get(
        &self,
        version: Option<i64>,
        key: &ManifestRef,
    ) -> Result<Option<(ManifestRecord, ByteStream)>> {
        let version_id = self.blobstore.resolve_version(version).await?;
        let mut conn = self
            .blobstore
            .metadata
            .get_conn()
            .await
            .map_err(Error::from)?;
        let Some(manifest) =
            Queries::get_manifest_in_version(conn.executor(), &version_id, key)
                .await
                .map_err(Error::from)?
        else {
            return Ok(None);
        };

        let body = self
            .blobstore
            .objects
            .get(&manifest_key(&manifest.digest))
            .await
            .map_err(Error::from)?;
        let stream: ByteStream = Box::pin(body.map_err(|e| e.into()));
        Ok(Some((manifest.into(), stream)))
    }

    async fn get_global(&self, digest: &OciDigest) -> Result<Option<ManifestRecord>> {
        let mut conn = self
            .blobstore
            .metadata
            .get_conn()
            .await
            .map_err(Error::from)?;
        Ok(Queries::get_manifest_by_digest(conn.executor(), digest)
            .await
            .map_err(Error::from)?
            .map(Into::into))
    }

    async fn put(
        &self,
        spec: &ManifestSpec,
        raw: Bytes,
        require_references: bool,
    ) -> Result<ManifestRecord> {
        self.media_types.check_payload_size(raw.len())?;
        spec.validate(&self.media_types)?;

        let calculated_digest = spec.canonical_digest(&raw)?;

        let mut tx = self
            .blobstore
            .metadata
            .get_tx()
            .await
            .map_err(Error::from)?;

        if let Some(existing) =
            Queries::get_manifest_by_digest(tx.executor().map_err(Error::from)?, &calculated_digest)
                .await
                .map_err(Error::from)?
        {
            return Ok(existing.into());
        }

        // resolve and, for pushes, require referenced blobs
        let (config_digest, layer_digests) = match spec {
            ManifestSpec::Image(m) => (
                Some(OciDigest::try_from(m.config.digest.as_str())?),
                m.layers
                    .iter()
                    .map(|l| OciDigest::try_from(l.digest.as_str()))
                    .collect::<Result<Vec<_>>>()?,
            ),
            ManifestSpec::V1(m) => (
                None,
                m.fs_layers
                    .iter()
                    .map(|l| OciDigest::try_from(l.blob_sum.as_str()))
                    .collect::<Result<Vec<_>>>()?,
            ),
            ManifestSpec::List(_) => (None, vec![]),
        };

        let mut wanted: Vec<String> = layer_digests.iter().map(String::from).collect();
        if let Some(config) = &config_digest {
            wanted.push(String::from(config));
        }
        let blobs = Queries::get_blobs(tx.executor().map_err(Error::from)?, &wanted)
            .await
            .map_err(Error::from)?;
        let by_digest: HashMap<String, Uuid> = blobs
            .iter()
            .map(|b| (String::from(&b.digest), b.id))
            .collect();
        if require_references {
            for digest in &wanted {
                if !by_digest.contains_key(digest) {
                    let msg = format!("blob {digest} not found in registry");
                    tracing::warn!("{msg}");
                    return Err(CoreError::ManifestBlobUnknown(Some(msg)));
                }
            }
        }

        let child_digests: Vec<String> = spec
            .child_digests()?
            .iter()
            .map(String::from)
            .collect();
        if require_references && !child_digests.is_empty() {
            let children = Queries::get_manifests_by_digests(
                tx.executor().map_err(Error::from)?,
                &child_digests,
            )
            .await
            .map_err(Error::from)?;
            let known: HashSet<String> =
                children.iter().map(|m| String::from(&m.digest)).collect();
            for digest in &child_digests {
                if !known.contains(digest) {
                    let msg = format!("sub-manifest {digest} not found in registry");
                    tracing::warn!("{msg}");
                    return Err(CoreError::ManifestUnknown(Some(msg)));
                }
            }
        }

        let mut labels = spec.labels();
        if labels.is_empty() {
            if let Some(config) = &config_digest {
                labels = self.config_labels(config).await?;
            }
        }
        let characteristics = spec.characteristics(&labels);

        let manifest = Manifest {
            id: Uuid::new_v4(),
            digest: calculated_digest.clone(),
            media_type: spec.media_type().to_string(),
            schema_version: spec.schema_version() as i32,
            config_blob_digest: config_digest,
            annotations: spec.annotations().cloned().unwrap_or_default(),
            labels,
            characteristics,
            bytes_on_disk: raw.len() as i64,
        };

        let executor = tx.executor().map_err(Error::from)?;
        Queries::insert_manifest(executor, &manifest)
            .await
            .map_err(Error::from)?;

        let layer_ids: Vec<Uuid> = layer_digests
            .iter()
            .filter_map(|d| by_digest.get(&String::from(d)).copied())
            .collect();
        Queries::insert_manifest_layers(executor, &manifest.id, &layer_ids)
            .await
            .map_err(Error::from)?;
        Queries::insert_index_children(executor, &manifest.id, &child_digests)
            .await
            .map_err(Error::from)?;

        // the exact received bytes are what clients get back on pull
        let key = manifest_key(&calculated_digest);
        if !self
            .blobstore
            .objects
            .exists(&key)
            .await
            .map_err(Error::from)?
        {
            let len = raw.len() as u64;
            self.blobstore
                .objects
                .put(&key, Body::from(raw), len)
                .await
                .map_err(Error::from)?;
        }

        tx.commit().await.map_err(Error::from)?;

        Ok(manifest.into())
    }
}
