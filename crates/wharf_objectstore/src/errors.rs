//! Object storage errors, named for the registry operation that failed
//! rather than the backend call that carried it.

use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read object: {0}")]
    Read(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>),
    #[error("failed to stat object: {0}")]
    Stat(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>),
    #[error("failed to store object: {0}")]
    Store(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>),
    #[error("failed to delete object: {0}")]
    Delete(
        #[from]
        aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::delete_object::DeleteObjectError>,
    ),

    #[error("failed to open staged upload: {0}")]
    OpenStagedUpload(
        #[from]
        aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    ),
    #[error("failed to stage part: {0}")]
    StagePart(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    ),
    #[error("failed to seal staged upload: {0}")]
    SealStagedUpload(
        #[from]
        aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    ),
    #[error("failed to promote staged upload to its content address: {0}")]
    PromoteStagedUpload(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::copy_object::CopyObjectError>,
    ),
    #[error("failed to abandon staged upload: {0}")]
    AbandonStagedUpload(
        #[from]
        aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError,
        >,
    ),
    #[error("backend returned no upload id for a staged upload")]
    UploadIdMissing,

    #[error("object body error: {0}")]
    ObjectBody(#[from] aws_sdk_s3::primitives::ByteStreamError),
    #[error("presigning configuration: {0}")]
    Presign(#[from] aws_sdk_s3::presigning::PresigningConfigError),
    #[error("credentials: {0}")]
    Credentials(#[from] aws_credential_types::provider::error::CredentialsError),

    #[error("invalid object key: {0}")]
    Key(#[from] KeyError),
}

/// Rejections produced when validating an arbitrary string as a
/// [`super::Key`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("object keys must not be empty")]
    Empty,

    #[error("object keys must be relative")]
    Absolute,

    #[error("object keys must not contain empty segments")]
    EmptySegment,

    #[error("object keys must not contain `.` or `..` segments")]
    RelativeSegment,

    #[error("character {0:?} is not allowed in object keys")]
    ForbiddenCharacter(char),
}
