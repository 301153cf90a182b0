use thiserror::Error;

/// Failures surfaced by the grade, report-card and attendance core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input rejected before any write happened.
    #[error("{0}")]
    Validation(String),

    /// The referenced record does not exist. Holds the entity name.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    /// Wire-level error code for the IPC response.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "bad_params",
            CoreError::NotFound(_) => "not_found",
            CoreError::Db(_) => "db_query_failed",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
