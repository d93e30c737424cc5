use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "xlsx")]
    #[error("Workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unable to load ledger: {count} error(s)")]
    LedgerLoad { count: usize },

    #[error("Bad value in {file}: {message}")]
    Extract { file: String, message: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TallyError>;
