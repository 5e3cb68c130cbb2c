use map_cluster_lib::ClusterError;
use std::path::PathBuf;

/// Error types for the command-line front end
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("GPX parsing error in {path}: {source}")]
    GpxParse {
        path: PathBuf,
        source: gpx::errors::GpxError,
    },

    #[error("JSON parsing error in {path}: {source}")]
    JsonParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unsupported input format: {0} (expected .gpx or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("Clustering error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Write error: {0}")]
    Write(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
