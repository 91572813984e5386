use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error(
        "index '{id}' already exists with backend {existing}, requested {requested}"
    )]
    BackendMismatch {
        id: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error(transparent)]
    Find(#[from] crate::index::FindError),

    #[error("annotator error: {0}")]
    Annotator(String),

    #[error("ingestion worker is no longer running")]
    WorkerGone,
}
