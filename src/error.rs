//! Error taxonomy for the knowledge-chat core.
//!
//! Every externally-triggered call site catches and degrades: `RemoteService`
//! never reaches an end user (call sites log it and substitute the local
//! fallback), `Persistence` clears progress indicators without rolling back
//! prior steps, and the remaining variants surface as inline messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad user input: wrong file type, empty required field, malformed
    /// email, non-positive seat limit. Blocks the action, no retry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An extractor could not parse its input (invalid PDF bytes).
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// URL fetch rejected or failed: disallowed host or scheme, non-2xx
    /// response, non-HTML content type.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Analysis/chat model unreachable, non-2xx, or unparseable payload.
    /// Never surfaced to end users.
    #[error("remote service error: {0}")]
    RemoteService(String),

    /// Database or blob write/delete failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Seat limit reached, or the acting user is not a member of the
    /// target company/team.
    #[error("not authorized: {0}")]
    Authorization(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
