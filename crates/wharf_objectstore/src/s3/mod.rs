//! S3-compatible backend.
//!
//! Content keys are written in place at their digest fan-out address;
//! staged uploads ride the service's multipart API against the session's
//! `staging/` key until promotion copies the sealed object to its content
//! address.

use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use hyper::body::Body;
use serde::Deserialize;

use super::errors::{Error, Result};
use super::{Key, ObjectBody, ObjectStore, UploadedPart};

#[derive(Clone, Deserialize)]
pub struct S3Config {
    /// Full endpoint URL, e.g. `https://s3.example.com` or a local minio.
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    /// Redirect content reads to presigned URLs instead of streaming the
    /// bytes through the registry.
    #[serde(default)]
    presigned_redirects: bool,
}

impl S3Config {
    pub async fn build(&self) -> Result<S3> {
        let credentials = SharedCredentialsProvider::new(
            Credentials::new(
                self.access_key.clone(),
                self.secret_key.clone(),
                None,
                None,
                "wharf",
            )
            .provide_credentials()
            .await?,
        );

        let base = aws_config::load_from_env().await;
        let config = aws_sdk_s3::config::Builder::from(&base)
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(self.endpoint.clone())
            .build();

        Ok(S3 {
            bucket: self.bucket.clone(),
            presigned_redirects: self.presigned_redirects,
            client: Client::from_conf(config),
        })
    }
}

#[derive(Clone)]
pub struct S3 {
    bucket: String,
    presigned_redirects: bool,
    client: Client,
}

#[async_trait]
impl ObjectStore for S3 {
    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await?;
        Ok(object.body.map_err(Error::from).boxed())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(inner)) if inner.raw().status().as_u16() == 404 => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &Key, body: Body, content_length: u64) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(content_length as i64)
            .body(body.into())
            .send()
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await?;
        Ok(())
    }

    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<Option<String>> {
        if !self.presigned_redirects {
            return Ok(None);
        }
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;
        Ok(Some(presigned.uri().to_string()))
    }

    async fn begin_staged_upload(&self, staging: &Key) -> Result<String> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(staging.as_str())
            .send()
            .await?;
        upload.upload_id.ok_or(Error::UploadIdMissing)
    }

    async fn stage_part(
        &self,
        upload_id: &str,
        staging: &Key,
        part_number: i32,
        content_length: u64,
        body: Body,
    ) -> Result<UploadedPart> {
        let staged = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(staging.as_str())
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(content_length as i64)
            .body(body.into())
            .send()
            .await?;
        Ok(UploadedPart {
            e_tag: staged.e_tag,
            part_number,
        })
    }

    async fn promote_staged_upload(
        &self,
        upload_id: &str,
        staging: &Key,
        parts: Vec<UploadedPart>,
        destination: &Key,
    ) -> Result<()> {
        let completed_parts = parts.into_iter().fold(
            CompletedMultipartUpload::builder(),
            |acc, part| {
                let mut completed = CompletedPart::builder().part_number(part.part_number);
                if let Some(e_tag) = part.e_tag {
                    completed = completed.e_tag(e_tag);
                }
                acc.parts(completed.build())
            },
        );
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(staging.as_str())
            .upload_id(upload_id)
            .multipart_upload(completed_parts.build())
            .send()
            .await?;

        // multipart uploads can only complete where they were opened; the
        // sealed object then moves to its content address and the staging
        // copy goes away
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, staging))
            .key(destination.as_str())
            .send()
            .await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(staging.as_str())
            .send()
            .await?;
        Ok(())
    }

    async fn abandon_staged_upload(&self, upload_id: &str, staging: &Key) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(staging.as_str())
            .upload_id(upload_id)
            .send()
            .await?;
        Ok(())
    }
}
