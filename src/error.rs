//! Error types for the provisioning pipeline.
//!
//! Soft failures (unparseable config or catalog) never surface here; they are
//! logged and replaced by defaults at the call site.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Source folder {path} cannot be read: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write version catalog {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize version catalog: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown version: {0}")]
    UnknownVersion(String),
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {output}")]
    Exit {
        command: String,
        status: String,
        output: String,
    },

    #[error("No block device found behind {0}")]
    DeviceNotFound(PathBuf),

    #[error("Formatting is not supported on this platform")]
    Unsupported,

    #[error("Formatting took longer than {0} seconds")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Version folder {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Copy task failed: {0}")]
    Task(String),
}

/// Reasons a transfer or format request is refused before any work starts.
#[derive(Debug, Error, PartialEq)]
pub enum StartError {
    #[error("Another operation is already running")]
    Busy,

    #[error("No valid volume selected")]
    NoVolume,

    #[error("Source folder is not set or does not exist")]
    SourceRootMissing,

    #[error("No valid version selected: {0}")]
    UnknownVersion(String),

    #[error("Format blocked: volume is {size_gb:.1} GB (max {max_gb:.1} GB)")]
    CapacityExceeded { size_gb: f64, max_gb: f64 },
}
