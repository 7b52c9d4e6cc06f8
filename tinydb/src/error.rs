use thiserror::Error;
use tinydb_store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("unsupported format version {found} (this build reads version {expected})")]
    Version { found: u8, expected: u8 },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("unsupported schema change: {0}")]
    Schema(String),

    #[error("database handle is busy")]
    Busy,
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => Error::Io(e.to_string()),
            StoreError::Corruption { page_no, details } => {
                Error::Corruption(format!("page {page_no}: {details}"))
            }
            StoreError::Version { found, expected } => Error::Version { found, expected },
            StoreError::Busy => Error::Busy,
        }
    }
}

impl Error {
    /// I/O and corruption failures poison the handle (read-only or dead);
    /// everything else only aborts the current transaction.
    pub fn poisons_handle(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Corruption(_))
    }
}
