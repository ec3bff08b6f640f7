//! Error kinds reported by archive creation and extraction.
//!
//! Every public operation returns exactly one terminal outcome: a summary
//! value or one of these variants. Low-level ZIP parsing works with
//! `anyhow::Result` and is folded into [`ArchiveError::CorruptArchive`] at
//! the extraction boundary, keeping the full context chain in the message.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Source directory '{}' not found", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Source '{}' is not a directory", path.display())]
    SourceNotADirectory { path: PathBuf },

    #[error("Cannot read '{}': {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Path '{}' cannot be stored in a ZIP archive: {reason}", path.display())]
    UnsupportedPath { path: PathBuf, reason: String },

    #[error("Invalid archive options: {0}")]
    InvalidOptions(String),

    #[error("Cannot write to '{}': {source}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Destination '{}' already exists and is not an empty directory", path.display())]
    DestinationNotEmpty { path: PathBuf },

    #[error("Compression of '{}' failed: {source}", path.display())]
    CompressionFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Write to '{}' failed: {source}", path.display())]
    IoWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open archive '{}': {source}", path.display())]
    ArchiveUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Entry '{entry}' would be written outside the destination: {reason}")]
    PathTraversalRejected { entry: String, reason: String },

    #[error("Failed to start worker runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl ArchiveError {
    pub(crate) fn corrupt(err: anyhow::Error) -> Self {
        ArchiveError::CorruptArchive(format!("{:#}", err))
    }

    pub(crate) fn traversal(entry: &str, reason: impl Into<String>) -> Self {
        ArchiveError::PathTraversalRejected {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
