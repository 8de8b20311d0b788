//! Digest-addressed object storage.
//!
//! Every committed object lives at the address derived from its content
//! digest: `<algorithm>/<first two hex chars>/<remaining hex>`. The two
//! character fan-out bounds how many objects share a listing prefix.
//! In-flight chunked uploads are staged under `staging/<session uuid>` and
//! only promoted to a content address once the client's digest checks out,
//! so an abandoned upload never lands in the content namespace. Because
//! addresses are a function of content, puts are idempotent and concurrent
//! writers of identical bytes converge on one object.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use hyper::body::Body;

pub mod config;
pub mod errors;
pub(crate) mod s3;

#[doc(hidden)]
pub use config::Config;
#[doc(hidden)]
pub use errors::{Error, KeyError, Result};
pub use s3::S3Config;

/// Receipt for one staged part, collected by callers and handed back when
/// the staged upload is promoted.
pub struct UploadedPart {
    pub e_tag: Option<String>,
    pub part_number: i32,
}

/// A validated object-store location.
///
/// Digest- and session-derived addresses come from [`Key::content`] and
/// [`Key::staging`], which always produce safe keys. Arbitrary strings go
/// through [`TryFrom<&str>`], which admits only characters the [S3 key
/// guidance](https://docs.aws.amazon.com/AmazonS3/latest/userguide/object-keys.html)
/// documents as safe and rejects absolute or relative path shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key(String);

impl Key {
    /// The content address of a digest: `<algorithm>/<hh>/<rest>`.
    ///
    /// Algorithm and hex come out of an already-validated digest; hex
    /// shorter than the fan-out width (seen only in tests) skips it.
    pub fn content(algorithm: &str, encoded: &str) -> Key {
        if encoded.len() <= 2 {
            Key(format!("{algorithm}/{encoded}"))
        } else {
            Key(format!("{algorithm}/{}/{}", &encoded[..2], &encoded[2..]))
        }
    }

    /// The staging address of an in-flight upload session.
    pub fn staging(session: &uuid::Uuid) -> Key {
        Key(format!("staging/{session}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const ALLOWED_PUNCTUATION: &[char] = &['_', '-', '.', '!', '*', '\'', '(', ')'];

impl TryFrom<&str> for Key {
    type Error = KeyError;

    fn try_from(raw: &str) -> std::result::Result<Key, KeyError> {
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        if raw.starts_with('/') {
            return Err(KeyError::Absolute);
        }
        for segment in raw.split('/') {
            match segment {
                "" => return Err(KeyError::EmptySegment),
                "." | ".." => return Err(KeyError::RelativeSegment),
                _ => {}
            }
            if let Some(c) = segment
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && !ALLOWED_PUNCTUATION.contains(c))
            {
                return Err(KeyError::ForbiddenCharacter(c));
            }
        }
        Ok(Key(raw.to_string()))
    }
}

pub type ObjectBody = BoxStream<'static, Result<Bytes>>;

/// Uniform interface over bulk object storage backends.
///
/// Reads stream [`bytes::Bytes`]; writes take [`hyper::body::Body`] so
/// request bodies pass through without buffering. The staged-upload
/// methods mirror the chunked blob-upload protocol: parts accumulate
/// against a session's staging key and move to their content address in
/// one promotion once the digest is verified.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, key: &Key) -> Result<ObjectBody>;

    async fn exists(&self, key: &Key) -> Result<bool>;

    async fn put(&self, key: &Key, body: Body, content_length: u64) -> Result<()>;

    async fn delete(&self, key: &Key) -> Result<()>;

    /// A presigned GET URL clients may be redirected to, when the backend
    /// offers them. The URL must reach clients byte-for-byte as returned
    /// here; rewriting breaks its signature.
    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<Option<String>>;

    /// Open a staged upload for the given staging key, returning the
    /// backend's upload id.
    async fn begin_staged_upload(&self, staging: &Key) -> Result<String>;

    async fn stage_part(
        &self,
        upload_id: &str,
        staging: &Key,
        part_number: i32,
        content_length: u64,
        body: Body,
    ) -> Result<UploadedPart>;

    /// Concatenate the staged parts at `destination` and discard the
    /// staging object.
    async fn promote_staged_upload(
        &self,
        upload_id: &str,
        staging: &Key,
        parts: Vec<UploadedPart>,
        destination: &Key,
    ) -> Result<()>;

    /// Drop a staged upload without promoting it.
    async fn abandon_staged_upload(&self, upload_id: &str, staging: &Key) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    // the trait must stay object safe; stores are shared as trait objects
    #[allow(dead_code)]
    struct Holder {
        objects: Box<dyn ObjectStore>,
    }

    #[rstest]
    fn content_address_fans_out() {
        let key = Key::content("sha256", "ba7816bf8f01");
        assert_eq!(key.as_str(), "sha256/ba/7816bf8f01");
    }

    #[rstest]
    fn short_hex_skips_fan_out() {
        let key = Key::content("sha256", "ab");
        assert_eq!(key.as_str(), "sha256/ab");
    }

    #[rstest]
    fn staging_address_is_session_scoped() {
        let session = uuid::Uuid::new_v4();
        let key = Key::staging(&session);
        assert_eq!(key.as_str(), format!("staging/{session}"));
    }

    #[rstest]
    #[case::digest_shaped("sha256/ab/cdef", None)]
    #[case::empty("", Some(KeyError::Empty))]
    #[case::rooted("/sha256/ab/cdef", Some(KeyError::Absolute))]
    #[case::trailing_slash("sha256/ab/", Some(KeyError::EmptySegment))]
    #[case::parent("sha256/../cdef", Some(KeyError::RelativeSegment))]
    #[case::space("sha256/a b/cdef", Some(KeyError::ForbiddenCharacter(' ')))]
    fn arbitrary_key_validation(#[case] raw: &str, #[case] expected: Option<KeyError>) {
        match (Key::try_from(raw), expected) {
            (Ok(key), None) => assert_eq!(key.as_str(), raw),
            (Err(actual), Some(expected)) => assert_eq!(actual, expected),
            (result, expected) => panic!("{raw}: got {result:?}, wanted {expected:?}"),
        }
    }
}
