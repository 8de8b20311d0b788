use thiserror;

use wharf_core::Error as CoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlx error")]
    SQLXError(#[from] sqlx::Error),
    #[error("sea-query error")]
    SeaQueryError(#[from] sea_query::error::Error),
    #[error("json error")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("objectstore error: {0}")]
    ObjectStore(#[from] wharf_objectstore::Error),

    #[error("transaction already rolled back or committed")]
    TxInactive,

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> CoreError {
        match e {
            Error::Core(core) => core,
            other => CoreError::BackendError(format!("{other}")),
        }
    }
}
