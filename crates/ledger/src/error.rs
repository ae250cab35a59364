use sled::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("invalid invoice form: {}", .0.join("; "))]
    InvalidForm(Vec<String>),

    #[error("invoice {0} already exists")]
    DuplicateInvoice(String),

    #[error("cannot cancel unknown invoice {0}")]
    UnknownInvoice(String),

    #[error("invoice {0} is not an ALTA record and cannot be cancelled")]
    NotCancellable(String),

    #[error("invoice record {0} is missing")]
    MissingRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<TransactionError<LedgerError>> for LedgerError {
    fn from(err: TransactionError<LedgerError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => LedgerError::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
