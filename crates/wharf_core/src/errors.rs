use serde::Serialize;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),
    #[error("invalid uuid")]
    InvalidUuid(#[from] uuid::Error),
    #[error("json error")]
    SerdeJson(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    BackendError(String),
    #[error("upstream registry error: {0}")]
    UpstreamError(String),
    #[error("task cancelled")]
    TaskCancelled,

    #[error("blob unknown to registry{}", fmt_detail(.0))]
    BlobUnknown(Option<String>),
    #[error("blob upload invalid{}", fmt_detail(.0))]
    BlobUploadInvalid(Option<String>),
    #[error("blob upload unknown to registry")]
    BlobUploadUnknown,
    #[error("provided digest did not match content{}", fmt_detail(.0))]
    DigestInvalid(Option<String>),
    #[error("manifest references a manifest or blob unknown to registry{}", fmt_detail(.0))]
    ManifestBlobUnknown(Option<String>),
    #[error("manifest invalid{}", fmt_detail(.0))]
    ManifestInvalid(Option<String>),
    #[error("manifest unknown to registry{}", fmt_detail(.0))]
    ManifestUnknown(Option<String>),
    #[error("invalid repository name{}", fmt_detail(.0))]
    NameInvalid(Option<String>),
    #[error("repository name not known to registry{}", fmt_detail(.0))]
    NameUnknown(Option<String>),
    #[error("provided length did not match content length{}", fmt_detail(.0))]
    SizeInvalid(Option<String>),
    #[error("requested range is not satisfiable{}", fmt_detail(.0))]
    RangeInvalid(Option<String>),
    #[error("authentication required{}", fmt_detail(.0))]
    Unauthorized(Option<String>),
    #[error("requested access to the resource is denied{}", fmt_detail(.0))]
    Denied(Option<String>),
    #[error("the operation is unsupported{}", fmt_detail(.0))]
    Unsupported(Option<String>),
    #[error("too many requests")]
    TooManyRequests,
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(s) => format!(": {s}"),
        None => String::new(),
    }
}

impl Error {
    /// Map onto the Distribution Spec error code this error surfaces as, if
    /// it is client-facing at all.
    pub fn code(&self) -> Option<DistributionErrorCode> {
        use DistributionErrorCode as C;
        match self {
            Error::InvalidDigest(_) | Error::UnsupportedDigestAlgorithm(_) => {
                Some(C::DigestInvalid)
            }
            Error::BlobUnknown(_) => Some(C::BlobUnknown),
            Error::BlobUploadInvalid(_) => Some(C::BlobUploadInvalid),
            Error::BlobUploadUnknown => Some(C::BlobUploadUnknown),
            Error::DigestInvalid(_) => Some(C::DigestInvalid),
            Error::ManifestBlobUnknown(_) => Some(C::ManifestBlobUnknown),
            Error::ManifestInvalid(_) => Some(C::ManifestInvalid),
            Error::ManifestUnknown(_) => Some(C::ManifestUnknown),
            Error::NameInvalid(_) => Some(C::NameInvalid),
            Error::NameUnknown(_) => Some(C::NameUnknown),
            Error::SizeInvalid(_) => Some(C::SizeInvalid),
            Error::RangeInvalid(_) => Some(C::RangeInvalid),
            Error::Unauthorized(_) => Some(C::Unauthorized),
            Error::Denied(_) => Some(C::Denied),
            Error::Unsupported(_) => Some(C::Unsupported),
            Error::TooManyRequests => Some(C::TooManyRequests),
            _ => None,
        }
    }
}

// https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes
// plus RANGE_INVALID which docker/distribution emits for discontiguous chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    RangeInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    TooManyRequests,
}

impl DistributionErrorCode {
    pub fn default_message(&self) -> &'static str {
        match self {
            DistributionErrorCode::BlobUnknown => "blob unknown to registry",
            DistributionErrorCode::BlobUploadInvalid => "blob upload invalid",
            DistributionErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            DistributionErrorCode::DigestInvalid => {
                "provided digest did not match uploaded content"
            }
            DistributionErrorCode::ManifestBlobUnknown => {
                "manifest references a manifest or blob unknown to registry"
            }
            DistributionErrorCode::ManifestInvalid => "manifest invalid",
            DistributionErrorCode::ManifestUnknown => "manifest unknown to registry",
            DistributionErrorCode::NameInvalid => "invalid repository name",
            DistributionErrorCode::NameUnknown => "repository name not known to registry",
            DistributionErrorCode::SizeInvalid => "provided length did not match content length",
            DistributionErrorCode::RangeInvalid => "requested range is not satisfiable",
            DistributionErrorCode::Unauthorized => "authentication required",
            DistributionErrorCode::Denied => "requested access to the resource is denied",
            DistributionErrorCode::Unsupported => "the operation is unsupported",
            DistributionErrorCode::TooManyRequests => "too many requests",
        }
    }
}
