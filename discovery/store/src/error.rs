use rusqlite::{ffi, ErrorCode};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No row exists for the derived primary key.
    #[error("not found")]
    NotFound,

    /// A row already exists for the derived primary key.
    #[error("already exists")]
    Conflict,

    #[error("invalid {0}")]
    Invalid(String),

    #[error("failed to encode column: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sql(rusqlite::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::ConstraintViolation
                    && (e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE) =>
            {
                Self::Conflict
            }
            error => Self::Sql(error),
        }
    }
}
