//! Error types for the understand core library.
//!
//! Only conditions that would otherwise produce a misleading artifact are
//! errors. Failures confined to one input unit (one unparsable file, one
//! timed-out recording) are reported as warnings or flags on the artifact.

/// Top-level error enum for the understand core library.
#[derive(Debug, thiserror::Error)]
pub enum UnderstandError {
    #[error("No seed candidates found in {origin}")]
    NoSeedCandidates { origin: &'static str },

    #[error("No seeds resolved to known functions (requested: {})", .requested.join(", "))]
    EmptyLens { requested: Vec<String> },

    #[error("Unknown seed preset: {0}")]
    UnknownPreset(String),

    #[error("Instrumentation target error: {0}")]
    InstrumentationTarget(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Pattern error: {0}")]
    Pattern(#[from] ignore::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type UnderstandResult<T> = Result<T, UnderstandError>;
