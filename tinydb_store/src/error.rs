use crate::PageNo;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_no} corrupt: {details}")]
    Corruption { page_no: PageNo, details: String },

    #[error("unsupported format version {found} (this build reads version {expected})")]
    Version { found: u8, expected: u8 },

    #[error("database file is locked by another handle")]
    Busy,
}

impl StoreError {
    pub fn corruption(page_no: PageNo, details: impl Into<String>) -> Self {
        StoreError::Corruption {
            page_no,
            details: details.into(),
        }
    }
}
