//! # zipfolder
//!
//! Archive a directory tree into a single ZIP file, and extract it back.
//!
//! Archives are deterministic: the tree is walked depth-first with siblings
//! sorted by name, and entries are written in that order no matter how many
//! of them are compressed in parallel. Running [`create_archive`] twice on an
//! unchanged tree with the same options yields byte-identical files.
//!
//! Extraction validates every entry before writing anything, so names such
//! as `../evil.txt`, absolute paths, or symlinks pointing outside the
//! destination abort the whole extraction with
//! [`ArchiveError::PathTraversalRejected`].
//!
//! ## Features
//!
//! - STORED and DEFLATE entries, levels 0-9
//! - ZIP64 for large files and archives with many entries
//! - Symlinks stored as links or followed, per [`SymlinkPolicy`]
//! - Unix permissions and modification times, restored on extraction
//! - Size and CRC-32 verification of every extracted entry
//!
//! ## Example
//!
//! ```no_run
//! use zipfolder::{ArchiveOptions, create_archive, extract_archive};
//!
//! fn main() -> Result<(), zipfolder::ArchiveError> {
//!     let summary = create_archive("site", "site.zip", &ArchiveOptions::default())?;
//!     println!("{} files archived", summary.files);
//!
//!     extract_archive("site.zip", "restored")?;
//!     Ok(())
//! }
//! ```
//!
//! The blocking functions start their own tokio runtime. Code already running
//! inside a runtime should call the `*_async` variants instead.

pub mod archive;
pub mod error;
pub mod extract;
pub mod io;
pub mod path;
pub mod zip;

pub use archive::{ArchiveOptions, ArchiveSummary, SymlinkPolicy, create_archive_async};
pub use error::{ArchiveError, Result};
pub use extract::{ExtractSummary, extract_archive_async, list_archive_async};
pub use io::{LocalFileReader, ReadAt};
pub use zip::{EntryKind, ZipExtractor, ZipFileEntry, ZipWriter};

use std::num::NonZeroUsize;
use std::path::Path;
use tokio::runtime::Runtime;

/// Archive `source_root` into a new ZIP file at `destination`.
///
/// Blocks until the archive is complete. On error no file is left at
/// `destination`.
///
/// # Panics
///
/// Panics if called from within an async runtime; use
/// [`create_archive_async`] there instead.
pub fn create_archive(
    source_root: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    options: &ArchiveOptions,
) -> Result<ArchiveSummary> {
    runtime(options.parallelism)?.block_on(create_archive_async(
        source_root.as_ref(),
        destination.as_ref(),
        options,
    ))
}

/// Extract `archive` into `destination`, which must be absent or empty.
///
/// # Panics
///
/// Panics if called from within an async runtime; use
/// [`extract_archive_async`] there instead.
pub fn extract_archive(
    archive: impl AsRef<Path>,
    destination: impl AsRef<Path>,
) -> Result<ExtractSummary> {
    runtime(NonZeroUsize::MIN)?
        .block_on(extract_archive_async(archive.as_ref(), destination.as_ref()))
}

/// List the entries of `archive` in Central Directory order.
///
/// # Panics
///
/// Panics if called from within an async runtime; use
/// [`list_archive_async`] there instead.
pub fn list_archive(archive: impl AsRef<Path>) -> Result<Vec<ZipFileEntry>> {
    runtime(NonZeroUsize::MIN)?.block_on(list_archive_async(archive.as_ref()))
}

fn runtime(blocking_threads: NonZeroUsize) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(blocking_threads.get())
        .enable_all()
        .build()
        .map_err(ArchiveError::Runtime)
}
