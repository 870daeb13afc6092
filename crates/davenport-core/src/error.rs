use thiserror::Error;

/// All errors that Davenport can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// Document (or database directory) does not exist, or its winning
    /// revision is deleted. The payload is the CouchDB-style reason.
    #[error("missing: {0}")]
    MissingDoc(String),

    #[error("conflict: document update conflict")]
    RevConflict,

    #[error("database is not open")]
    NotOpen,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid revision format: {0}")]
    InvalidRev(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Error surfaced by the underlying key-value engine.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an engine error, preserving its message as the reason.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Error::MissingDoc(reason.into())
    }

    /// CouchDB wire name for this error.
    pub fn name(&self) -> &'static str {
        match self {
            Error::MissingDoc(_) => "not_found",
            Error::RevConflict => "conflict",
            Error::NotOpen => "not_open",
            Error::BadRequest(_) => "bad_request",
            Error::InvalidRev(_) => "bad_request",
            Error::Unsupported(_) => "bad_request",
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => "internal_server_error",
        }
    }

    /// HTTP-style status code, used in per-document bulk results.
    pub fn status(&self) -> u16 {
        match self {
            Error::MissingDoc(_) => 404,
            Error::RevConflict => 409,
            Error::NotOpen => 412,
            Error::BadRequest(_) | Error::InvalidRev(_) | Error::Unsupported(_) => 400,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => 500,
        }
    }

    /// Human reason string, without the error-name prefix.
    pub fn reason(&self) -> String {
        match self {
            Error::MissingDoc(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
