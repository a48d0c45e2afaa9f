use std::path::PathBuf;
use thiserror::Error;

/// Failure of an external data source (DTM tiles, OSM features, imagery).
///
/// Providers retry internally; once one of these surfaces the run aborts.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("elevation tile not found: {0}")]
    TileMissing(PathBuf),
    #[error("failed to parse elevation tile {path}: {reason}")]
    TileMalformed { path: PathBuf, reason: String },
    #[error("provider {provider} returned no usable data")]
    EmptyData { provider: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top level error taxonomy of a generation run.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("map template not found: {0}")]
    TemplateMissing(PathBuf),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to write {path}: {source}")]
    FormatWrite {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    /// The process exit code associated with this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            GenerationError::InvalidInput(_) => 2,
            GenerationError::Fetch(_) => 3,
            GenerationError::TemplateMissing(_) => 4,
            GenerationError::FormatWrite { .. } | GenerationError::Other(_) => 5,
        }
    }
}

/// A single feature could not be placed on the map. Logged and skipped.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("geometry fell outside the map bounds")]
    OutOfBounds,
    #[error("geometry split into multiple parts after fitting")]
    Split,
    #[error("degenerate shape with {0} usable points")]
    Degenerate(usize),
}
