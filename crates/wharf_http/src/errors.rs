use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use thiserror;

use wharf_core::DistributionErrorCode;
use wharf_core::Error as CoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http invalid header name")]
    HTTPInvalidHeaderName(#[from] http::header::InvalidHeaderName),
    #[error("http invalid header value")]
    HTTPInvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("missing query parameter: {0}")]
    MissingQueryParameter(&'static str),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal server error")]
    InternalServerError(String),
}

// Describes a server error returned from a registry, per the error-codes
// section of the distribution spec.
#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: DistributionErrorCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorInfo>,
}

pub(crate) fn status_code(c: &DistributionErrorCode) -> StatusCode {
    match c {
        DistributionErrorCode::BlobUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::BlobUploadInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::BlobUploadUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::ManifestBlobUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::ManifestInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::ManifestUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::NameInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::NameUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::SizeInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
        DistributionErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        DistributionErrorCode::Denied => StatusCode::FORBIDDEN,
        DistributionErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
        DistributionErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
    }
}

#[inline]
pub(crate) fn into_error_response(
    code: DistributionErrorCode,
    message: Option<String>,
) -> Response {
    let message = message.unwrap_or_else(|| code.default_message().to_string());
    let body = ErrorResponse {
        errors: vec![ErrorInfo {
            code,
            message: Some(message),
            detail: None,
        }],
    };
    (status_code(&code), axum::Json(body)).into_response()
}

#[inline]
fn core_error_to_response(e: CoreError) -> Response {
    let message = format!("{e}");
    match e.code() {
        Some(code) => into_error_response(code, Some(message)),
        None => {
            tracing::warn!("internal error: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("internal server error"),
            )
                .into_response()
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Core(e) => core_error_to_response(e),
            Error::MissingHeader(_) => {
                (StatusCode::BAD_REQUEST, format!("{self}")).into_response()
            }
            Error::MissingQueryParameter(_) => {
                (StatusCode::BAD_REQUEST, format!("{self}")).into_response()
            }
            Error::HTTPInvalidHeaderName(_) => {
                (StatusCode::BAD_REQUEST, format!("{self}")).into_response()
            }
            Error::HTTPInvalidHeaderValue(_) => {
                (StatusCode::BAD_REQUEST, format!("{self}")).into_response()
            }
            Error::InternalServerError(s) => {
                tracing::warn!("{s:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    String::from("internal server error"),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::range(DistributionErrorCode::RangeInvalid, 416)]
    #[case::unsupported(DistributionErrorCode::Unsupported, 405)]
    #[case::unauthorized(DistributionErrorCode::Unauthorized, 401)]
    #[case::denied(DistributionErrorCode::Denied, 403)]
    #[case::manifest_unknown(DistributionErrorCode::ManifestUnknown, 404)]
    #[case::upload_invalid(DistributionErrorCode::BlobUploadInvalid, 400)]
    #[case::upload_unknown(DistributionErrorCode::BlobUploadUnknown, 404)]
    #[case::throttled(DistributionErrorCode::TooManyRequests, 429)]
    fn status_mapping(#[case] code: DistributionErrorCode, #[case] expected: u16) {
        assert_eq!(status_code(&code).as_u16(), expected);
    }

    #[rstest]
    fn envelope_shape() {
        let body = ErrorResponse {
            errors: vec![ErrorInfo {
                code: DistributionErrorCode::RangeInvalid,
                message: Some("requested range is not satisfiable".to_string()),
                detail: None,
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "RANGE_INVALID");
        assert!(json["errors"][0]["message"].is_string());
    }
}
