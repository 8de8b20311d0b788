use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("jwt error")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("io error")]
    Io(#[from] std::io::Error),
}
