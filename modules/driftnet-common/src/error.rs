use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftnetError {
    #[error("duplicate source: {0}")]
    DuplicateSource(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("source quota exceeded ({0} sources)")]
    QuotaExceeded(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fetch failed (status {status}): {message}")]
    Fetch { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl DriftnetError {
    /// The HTTP status carried by a fetch error, 0 when there was none.
    pub fn fetch_status(&self) -> u16 {
        match self {
            DriftnetError::Fetch { status, .. } => *status,
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriftnetError>;
