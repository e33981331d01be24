use thiserror::Error;

/// Errors surfaced by the store, import/export and backup layers.
///
/// Rendering never returns an error: malformed math or diagrams are rendered
/// inline as error markers instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("note {0} not found")]
    NotFound(i64),

    #[error("invalid import: {0}")]
    InvalidImport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, Error>;
