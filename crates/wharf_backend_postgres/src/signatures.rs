use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::TryStreamExt;
use hyper::body::Body;
use uuid::Uuid;

use wharf_core::registry::{SignatureKind, SignatureRecord, SignatureStore};
use wharf_core::MediaTypeRegistry;
use wharf_core::OciDigest;
use wharf_core::Result;
use wharf_objectstore::{Key, ObjectStore};

use super::blobs::PgBlobStore;
use super::errors::Error;
use super::metadata::{Queries, Signature};

fn signature_key(digest: &OciDigest) -> Key {
    Key::content(digest.algorithm().as_str(), digest.encoded())
}

pub struct PgSignatureStore {
    blobstore: PgBlobStore,
    media_types: Arc<MediaTypeRegistry>,
}

impl PgSignatureStore {
    pub fn new(blobstore: PgBlobStore, media_types: Arc<MediaTypeRegistry>) -> Self {
        Self {
            blobstore,
            media_types,
        }
    }

    fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.blobstore.objects
    }
}

#[async_trait]
impl SignatureStore for PgSignatureStore {
    async fn list(
        &self,
        version: Option<i64>,
        manifest_digest: &OciDigest,
    ) -> Result<Vec<SignatureRecord>> {
        let version_id = self.blobstore.resolve_version(version).await?;
        let mut conn = self
            .blobstore
            .metadata
            .get_conn()
            .await
            .map_err(Error::from)?;
        Ok(
            Queries::signatures_in_version(conn.executor(), &version_id, manifest_digest)
                .await
                .map_err(Error::from)?
                .into_iter()
                .map(Into::into)
                .collect(),
        )
    }

    async fn read(&self, record: &SignatureRecord) -> Result<Bytes> {
        let stream = self
            .objects()
            .get(&signature_key(&record.digest))
            .await
            .map_err(Error::from)?;
        let chunks: Vec<Bytes> = stream.try_collect().await.map_err(Error::from)?;
        let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
        Ok(Bytes::from(bytes))
    }

    async fn put(
        &self,
        name: &str,
        manifest_digest: &OciDigest,
        kind: SignatureKind,
        key_id: Option<String>,
        payload: Bytes,
    ) -> Result<SignatureRecord> {
        // signatures are non-blob content and share the manifest size cap
        self.media_types.check_payload_size(payload.len())?;

        let digest = OciDigest::from(payload.as_ref());

        let mut tx = self
            .blobstore
            .metadata
            .get_tx()
            .await
            .map_err(Error::from)?;
        if let Some(existing) =
            Queries::get_signature(tx.executor().map_err(Error::from)?, name, manifest_digest)
                .await
                .map_err(Error::from)?
        {
            return Ok(existing.into());
        }

        let signature = Signature {
            id: Uuid::new_v4(),
            name: name.to_string(),
            manifest_digest: manifest_digest.clone(),
            kind,
            key_id,
            digest: digest.clone(),
            bytes_on_disk: payload.len() as i64,
        };
        Queries::insert_signature(tx.executor().map_err(Error::from)?, &signature)
            .await
            .map_err(Error::from)?;

        let key = signature_key(&digest);
        if !self.objects().exists(&key).await.map_err(Error::from)? {
            let len = payload.len() as u64;
            self.objects()
                .put(&key, Body::from(payload), len)
                .await
                .map_err(Error::from)?;
        }

        tx.commit().await.map_err(Error::from)?;
        Ok(signature.into())
    }
}
