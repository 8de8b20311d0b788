use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use hyper::body::Body;
use uuid::Uuid;

use wharf_core::registry::{BlobContent, BlobRecord, BlobStore, BlobWriter, UploadSession};
use wharf_core::Error as CoreError;
use wharf_core::Result;
use wharf_core::{ChunkedBody, DigestBody, Digester, OciDigest};
use wharf_objectstore::{Key, ObjectStore, UploadedPart};

use super::errors::Error;
use super::metadata::{Chunk as MetadataChunk, MetadataPool, Queries, Repository};

const PRESIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

pub(crate) fn blob_key(digest: &OciDigest) -> Key {
    Key::content(digest.algorithm().as_str(), digest.encoded())
}

pub struct PgBlobStore {
    pub(crate) metadata: MetadataPool,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) repository: Repository,
}

impl PgBlobStore {
    pub fn new(
        metadata: MetadataPool,
        objects: Arc<dyn ObjectStore>,
        repository: Repository,
    ) -> Self {
        Self {
            metadata,
            objects,
            repository,
        }
    }

    /// Resolve a version number (default: the repository's current latest)
    /// to its row id.
    pub(crate) async fn resolve_version(&self, version: Option<i64>) -> Result<Uuid> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let number = match version {
            Some(n) => n,
            None => {
                Queries::get_repository(conn.executor(), &self.repository.name)
                    .await
                    .map_err(Error::from)?
                    .ok_or(CoreError::NameUnknown(None))?
                    .latest_version
            }
        };
        let version = Queries::get_version(conn.executor(), &self.repository.id, number)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| {
                CoreError::NameUnknown(Some(format!(
                    "repository {} has no version {number}",
                    self.repository.name
                )))
            })?;
        Ok(version.id)
    }
}

#[async_trait]
impl BlobStore for PgBlobStore {
    async fn head(&self, version: Option<i64>, key: &OciDigest) -> Result<Option<BlobRecord>> {
        let version_id = self.resolve_version(version).await?;
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(
            Queries::get_blob_in_version(conn.executor(), &version_id, key)
                .await
                .map_err(Error::from)?
                .map(Into::into),
        )
    }

    async fn head_global(&self, key: &OciDigest) -> Result<Option<BlobRecord>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(Queries::get_blob(conn.executor(), key)
            .await
            .map_err(Error::from)?
            .map(Into::into))
    }

    async fn get(
        &self,
        version: Option<i64>,
        key: &OciDigest,
    ) -> Result<Option<(BlobRecord, BlobContent)>> {
        let version_id = self.resolve_version(version).await?;
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let Some(blob) = Queries::get_blob_in_version(conn.executor(), &version_id, key)
            .await
            .map_err(Error::from)?
        else {
            return Ok(None);
        };

        let object_key = blob_key(&blob.digest);
        if let Some(url) = self
            .objects
            .presign_get(&object_key, PRESIGNED_URL_TTL)
            .await
            .map_err(Error::from)?
        {
            return Ok(Some((blob.into(), BlobContent::Redirect(url))));
        }

        let body = self.objects.get(&object_key).await.map_err(Error::from)?;
        Ok(Some((
            blob.into(),
            BlobContent::Stream(Box::pin(body.map_err(|e| e.into()))),
        )))
    }

    async fn put(
        &self,
        digest: &OciDigest,
        content_length: u64,
        body: Body,
    ) -> Result<BlobRecord> {
        let object_key = blob_key(digest);

        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        if let Some(existing) = Queries::get_blob(tx.executor().map_err(Error::from)?, digest)
            .await
            .map_err(Error::from)?
        {
            // content-addressed writes converge; verify the bytes are really
            // there before trusting the row
            if self.objects.exists(&object_key).await.map_err(Error::from)? {
                return Ok(existing.into());
            }
        }

        let digester = Arc::new(Mutex::new(digest.digester()));
        let stream_body = DigestBody::from_body(body, digester.clone());
        self.objects
            .put(&object_key, Body::wrap_stream(stream_body), content_length)
            .await
            .map_err(Error::from)?;

        let digester = Arc::into_inner(digester)
            .expect("no other references should exist at this point")
            .into_inner()
            .expect("the mutex cannot be locked if there are no other Arc references");
        let observed_bytes = digester.bytes();
        let observed = digester.finalize();
        if &observed != digest {
            self.objects.delete(&object_key).await.map_err(Error::from)?;
            return Err(CoreError::DigestInvalid(Some(format!(
                "expected {digest}, content hashed to {observed}"
            ))));
        }
        if content_length > 0 && observed_bytes != content_length {
            self.objects.delete(&object_key).await.map_err(Error::from)?;
            return Err(CoreError::SizeInvalid(Some(format!(
                "declared {content_length} bytes, received {observed_bytes}"
            ))));
        }

        let executor = tx.executor().map_err(Error::from)?;
        let id = match Queries::get_blob(executor, digest)
            .await
            .map_err(Error::from)?
        {
            Some(b) => b.id,
            None => Queries::insert_blob(executor, digest, observed_bytes as i64)
                .await
                .map_err(Error::from)?,
        };
        tx.commit().await.map_err(Error::from)?;

        Ok(BlobRecord {
            id,
            digest: digest.clone(),
            bytes_on_disk: observed_bytes as i64,
        })
    }

    async fn delete(&self, digest: &OciDigest) -> Result<()> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let blob = Queries::get_blob(tx.executor().map_err(Error::from)?, digest)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::BlobUnknown(None))?;
        Queries::delete_blob(tx.executor().map_err(Error::from)?, &blob.id)
            .await
            .map_err(Error::from)?;
        self.objects
            .delete(&blob_key(digest))
            .await
            .map_err(Error::from)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }

    async fn resume(
        &self,
        session_uuid: &Uuid,
        start_of_range: Option<u64>,
    ) -> Result<Box<dyn BlobWriter>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let mut session: UploadSession = Queries::get_session(conn.executor(), session_uuid)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::BlobUploadUnknown)?
            .into();

        if let Some(start) = start_of_range {
            if !session.validate_range(start) {
                tracing::debug!("content range start {start} is discontiguous");
                return Err(CoreError::RangeInvalid(Some(format!(
                    "range must continue from byte {}",
                    session.last_range_end + 1
                ))));
            }
        }

        if session.upload_id.is_none() {
            session.upload_id = Some(
                self.objects
                    .begin_staged_upload(&Key::staging(&session.uuid))
                    .await
                    .map_err(Error::from)?,
            );
            let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
            Queries::update_session(conn.executor(), &to_row(&session, &self.repository.id))
                .await
                .map_err(Error::from)?;
        }

        Ok(Box::new(PgBlobWriter {
            metadata: self.metadata.clone(),
            objects: self.objects.clone(),
            repository_id: self.repository.id,
            session: Some(session),
        }))
    }
}

fn to_row(
    session: &UploadSession,
    repository_id: &Uuid,
) -> super::metadata::UploadSession {
    super::metadata::UploadSession {
        uuid: session.uuid,
        repository_id: *repository_id,
        start_date: session.start_date,
        upload_id: session.upload_id.clone(),
        chunk_number: session.chunk_number,
        last_range_end: session.last_range_end,
        bytes: session.bytes as i64,
    }
}

pub struct PgBlobWriter {
    metadata: MetadataPool,
    objects: Arc<dyn ObjectStore>,
    repository_id: Uuid,
    session: Option<UploadSession>,
}

impl PgBlobWriter {
    fn upload_id(session: &UploadSession) -> &str {
        session
            .upload_id
            .as_deref()
            .expect("UploadSession.upload_id is always set by resume")
    }
}

#[async_trait]
impl BlobWriter for PgBlobWriter {
    async fn write(&mut self, content_length: u64, body: Body) -> Result<UploadSession> {
        let mut session = self
            .session
            .take()
            .ok_or(CoreError::BlobUploadInvalid(Some(
                "writer already consumed".to_string(),
            )))?;
        tracing::debug!("before chunk upload: {:?}", session);

        let digester = Arc::new(Mutex::new(Digester::default()));
        let stream_body = DigestBody::from_body(body, digester.clone());
        let part = self
            .objects
            .stage_part(
                Self::upload_id(&session),
                &Key::staging(&session.uuid),
                session.chunk_number,
                content_length,
                Body::wrap_stream(stream_body),
            )
            .await
            .map_err(Error::from)?;

        let digester = Arc::into_inner(digester)
            .expect("no other references should exist at this point")
            .into_inner()
            .expect("the mutex cannot be locked if there are no other Arc references");

        if digester.bytes() != content_length {
            return Err(CoreError::SizeInvalid(Some(format!(
                "declared {content_length} bytes, received {}",
                digester.bytes()
            ))));
        }

        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Queries::insert_chunk(
            conn.executor(),
            &session.uuid,
            &MetadataChunk::from(part),
        )
        .await
        .map_err(Error::from)?;

        session.chunk_number += 1;
        session.last_range_end += digester.bytes() as i64;
        session.bytes += digester.bytes();

        Queries::update_session(conn.executor(), &to_row(&session, &self.repository_id))
            .await
            .map_err(Error::from)?;

        Ok(session)
    }

    async fn write_chunked(&mut self, body: Body) -> Result<UploadSession> {
        let mut session = self
            .session
            .take()
            .ok_or(CoreError::BlobUploadInvalid(Some(
                "writer already consumed".to_string(),
            )))?;
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let mut digester = Digester::default();

        let mut chunked = ChunkedBody::from_body(body);

        while let Some(bytes) = chunked.next().await {
            let bytes = bytes
                .map_err(|e| CoreError::BlobUploadInvalid(Some(format!("{e}"))))?;
            digester.update(&bytes);
            let part = self
                .objects
                .stage_part(
                    Self::upload_id(&session),
                    &Key::staging(&session.uuid),
                    session.chunk_number,
                    bytes.len() as u64,
                    bytes.into(),
                )
                .await
                .map_err(Error::from)?;
            Queries::insert_chunk(
                tx.executor().map_err(Error::from)?,
                &session.uuid,
                &MetadataChunk::from(part),
            )
            .await
            .map_err(Error::from)?;
            session.chunk_number += 1;
        }

        session.last_range_end += digester.bytes() as i64;
        session.bytes += digester.bytes();
        Queries::update_session(
            tx.executor().map_err(Error::from)?,
            &to_row(&session, &self.repository_id),
        )
        .await
        .map_err(Error::from)?;

        tx.commit().await.map_err(Error::from)?;
        Ok(session)
    }

    async fn finalize(&mut self, digest: &OciDigest) -> Result<UploadSession> {
        let session = self
            .session
            .take()
            .ok_or(CoreError::BlobUploadInvalid(Some(
                "writer already consumed".to_string(),
            )))?;

        let target_key = blob_key(digest);
        let staging_key = Key::staging(&session.uuid);

        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;

        if self.objects.exists(&target_key).await.map_err(Error::from)? {
            // duplicate upload of known content; drop the staged parts
            self.objects
                .abandon_staged_upload(Self::upload_id(&session), &staging_key)
                .await
                .map_err(Error::from)?;
        } else {
            let parts = Queries::get_chunks(tx.executor().map_err(Error::from)?, &session.uuid)
                .await
                .map_err(Error::from)?
                .into_iter()
                .map(UploadedPart::from)
                .collect();
            self.objects
                .promote_staged_upload(
                    Self::upload_id(&session),
                    &staging_key,
                    parts,
                    &target_key,
                )
                .await
                .map_err(Error::from)?;

            // hash state cannot be persisted across requests, so the
            // assembled object is re-read to verify the client digest
            let mut digester = digest.digester();
            let mut stream = self.objects.get(&target_key).await.map_err(Error::from)?;
            while let Some(bytes) = stream.try_next().await.map_err(Error::from)? {
                digester.update(&bytes);
            }
            let observed = digester.finalize();
            if &observed != digest {
                self.objects
                    .delete(&target_key)
                    .await
                    .map_err(Error::from)?;
                return Err(CoreError::DigestInvalid(Some(format!(
                    "expected {digest}, content hashed to {observed}"
                ))));
            }
        }

        let executor = tx.executor().map_err(Error::from)?;
        if Queries::get_blob(executor, digest)
            .await
            .map_err(Error::from)?
            .is_none()
        {
            Queries::insert_blob(executor, digest, session.bytes as i64)
                .await
                .map_err(Error::from)?;
        }

        tx.commit().await.map_err(Error::from)?;
        Ok(session)
    }
}
