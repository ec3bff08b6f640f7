//! Directory-to-ZIP pipeline.
//!
//! The source tree is walked once, depth-first with siblings in byte order
//! of their names, producing the complete list of entries up front. Entries
//! are then read and compressed on tokio's blocking pool, at most
//! `parallelism` at a time, while the writer consumes finished entries
//! strictly in walk order. Parallelism therefore never shows up in the
//! output: the same tree and options always give the same bytes.
//!
//! If anything fails after the destination file is created, the file is
//! removed before the error is returned.

use std::collections::VecDeque;
use std::fs::Metadata;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::BufWriter;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::path;
use crate::zip::{EntryKind, PreparedEntry, ZipWriter};

/// How symbolic links inside the source tree are archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymlinkPolicy {
    /// Store the link itself; its target path becomes the entry data.
    #[default]
    Preserve,
    /// Archive whatever the link points to. Loops are reported as
    /// [`ArchiveError::SourceUnreadable`].
    Follow,
}

/// Options for [`create_archive`](crate::create_archive).
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Deflate level, 0 (store) to 9 (smallest).
    pub compression_level: u32,
    /// Prefix every entry with the source directory's own name.
    pub include_root: bool,
    pub symlinks: SymlinkPolicy,
    /// Upper bound on entries being read and compressed at once.
    pub parallelism: NonZeroUsize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            include_root: false,
            symlinks: SymlinkPolicy::default(),
            parallelism: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl ArchiveOptions {
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_include_root(mut self, include_root: bool) -> Self {
        self.include_root = include_root;
        self
    }

    pub fn with_symlinks(mut self, symlinks: SymlinkPolicy) -> Self {
        self.symlinks = symlinks;
        self
    }

    pub fn with_parallelism(mut self, parallelism: NonZeroUsize) -> Self {
        self.parallelism = parallelism;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(ArchiveError::InvalidOptions(format!(
                "compression level {} is outside 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// What [`create_archive`](crate::create_archive) wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: u64,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// Sockets, FIFOs and device nodes left out of the archive.
    pub skipped: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

impl ArchiveSummary {
    fn record(&mut self, entry: &PreparedEntry) {
        self.entries += 1;
        match entry.kind {
            EntryKind::Directory => self.directories += 1,
            EntryKind::File => self.files += 1,
            EntryKind::Symlink => self.symlinks += 1,
        }
        self.uncompressed_bytes += entry.uncompressed_size;
        self.compressed_bytes += entry.data.len() as u64;
    }
}

#[derive(Debug)]
enum SourceKind {
    Directory,
    File,
    Symlink(String),
}

#[derive(Debug)]
struct SourceEntry {
    path: PathBuf,
    name: String,
    kind: SourceKind,
    modified: Option<SystemTime>,
    permissions: u32,
}

/// Removes the destination file unless the archive was completed.
struct PartialArchive {
    path: PathBuf,
    committed: bool,
}

impl PartialArchive {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialArchive {
    fn drop(&mut self) {
        if !self.committed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed incomplete archive"),
                Err(err) => warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove incomplete archive"
                ),
            }
        }
    }
}

/// Async form of [`create_archive`](crate::create_archive).
///
/// Must run inside a tokio runtime with a blocking pool.
pub async fn create_archive_async(
    source_root: &Path,
    destination: &Path,
    options: &ArchiveOptions,
) -> Result<ArchiveSummary> {
    options.validate()?;
    let root = check_source(source_root).await?;

    info!(
        source = %root.display(),
        destination = %destination.display(),
        level = options.compression_level,
        "creating archive"
    );

    let file = fs::File::create(destination)
        .await
        .map_err(|source| ArchiveError::DestinationUnwritable {
            path: destination.to_path_buf(),
            source,
        })?;
    let guard = PartialArchive {
        path: destination.to_path_buf(),
        committed: false,
    };
    let exclude = fs::canonicalize(destination).await.ok();

    let (entries, skipped) = {
        let root = root.clone();
        let options = options.clone();
        task::spawn_blocking(move || collect_entries(&root, &options, exclude.as_deref()))
            .await
            .map_err(join_error)??
    };
    debug!(entries = entries.len(), skipped, "source tree walked");

    let mut summary = ArchiveSummary {
        skipped,
        ..ArchiveSummary::default()
    };
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let window = options.parallelism.get();
    let level = options.compression_level;
    let mut queue = entries.into_iter();
    let mut pending: VecDeque<JoinHandle<Result<PreparedEntry>>> = VecDeque::with_capacity(window);

    loop {
        while pending.len() < window {
            match queue.next() {
                Some(entry) => pending.push_back(task::spawn_blocking(move || prepare(entry, level))),
                None => break,
            }
        }
        let Some(handle) = pending.pop_front() else {
            break;
        };
        let prepared = handle.await.map_err(join_error)??;

        writer
            .write_entry(&prepared)
            .await
            .map_err(|source| write_failure(destination, source))?;
        debug!(
            name = %prepared.name,
            size = prepared.uncompressed_size,
            compressed = prepared.data.len(),
            "added entry"
        );
        summary.record(&prepared);
    }

    let file = writer
        .finish()
        .await
        .map_err(|source| write_failure(destination, source))?
        .into_inner();
    file.sync_all()
        .await
        .map_err(|source| write_failure(destination, source))?;
    drop(file);
    guard.commit();

    info!(
        destination = %destination.display(),
        entries = summary.entries,
        files = summary.files,
        directories = summary.directories,
        symlinks = summary.symlinks,
        compressed_bytes = summary.compressed_bytes,
        "archive created"
    );
    Ok(summary)
}

async fn check_source(source_root: &Path) -> Result<PathBuf> {
    let metadata = fs::metadata(source_root).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ArchiveError::SourceNotFound {
                path: source_root.to_path_buf(),
            }
        } else {
            ArchiveError::SourceUnreadable {
                path: source_root.to_path_buf(),
                source,
            }
        }
    })?;
    if !metadata.is_dir() {
        return Err(ArchiveError::SourceNotADirectory {
            path: source_root.to_path_buf(),
        });
    }
    fs::canonicalize(source_root)
        .await
        .map_err(|source| ArchiveError::SourceUnreadable {
            path: source_root.to_path_buf(),
            source,
        })
}

/// Walk `root` and describe every entry to archive, in output order.
fn collect_entries(
    root: &Path,
    options: &ArchiveOptions,
    exclude: Option<&Path>,
) -> Result<(Vec<SourceEntry>, u64)> {
    let prefix = if options.include_root {
        match root.file_name() {
            Some(name) => Some(
                name.to_str()
                    .ok_or_else(|| ArchiveError::UnsupportedPath {
                        path: root.to_path_buf(),
                        reason: "name is not valid UTF-8".into(),
                    })?
                    .to_string(),
            ),
            None => None,
        }
    } else {
        None
    };

    let walker = WalkDir::new(root)
        .follow_links(options.symlinks == SymlinkPolicy::Follow)
        .sort_by_file_name();

    let mut entries = Vec::new();
    let mut skipped = 0;
    for item in walker {
        let entry = item.map_err(|err| unreadable(root, err))?;
        if entry.depth() == 0 && prefix.is_none() {
            continue;
        }
        if exclude == Some(entry.path()) {
            debug!(path = %entry.path().display(), "skipping the archive being written");
            continue;
        }

        let name = path::entry_name(root, entry.path(), prefix.as_deref())?;
        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            SourceKind::Directory
        } else if file_type.is_file() {
            SourceKind::File
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|source| {
                ArchiveError::SourceUnreadable {
                    path: entry.path().to_path_buf(),
                    source,
                }
            })?;
            let target = path::link_target(entry.path(), &target)?;
            // Refuse links that extraction would reject, so every archive
            // written here can be extracted again.
            if let Err(ArchiveError::PathTraversalRejected { reason, .. }) =
                path::validate_link_target(&name, Path::new(&name), &target)
            {
                return Err(ArchiveError::UnsupportedPath {
                    path: entry.path().to_path_buf(),
                    reason: format!("{reason}; SymlinkPolicy::Follow stores its content instead"),
                });
            }
            SourceKind::Symlink(target)
        } else {
            warn!(path = %entry.path().display(), "skipping special file");
            skipped += 1;
            continue;
        };

        let metadata = entry.metadata().map_err(|err| unreadable(root, err))?;
        entries.push(SourceEntry {
            name,
            path: entry.into_path(),
            kind,
            modified: metadata.modified().ok(),
            permissions: permissions(&metadata),
        });
    }

    Ok((entries, skipped))
}

/// Read and compress one entry. Runs on the blocking pool.
fn prepare(entry: SourceEntry, level: u32) -> Result<PreparedEntry> {
    match entry.kind {
        SourceKind::Directory => Ok(PreparedEntry::directory(
            format!("{}/", entry.name),
            entry.modified,
            entry.permissions,
        )),
        SourceKind::Symlink(target) => {
            Ok(PreparedEntry::symlink(entry.name, &target, entry.modified))
        }
        SourceKind::File => {
            let contents =
                std::fs::read(&entry.path).map_err(|source| ArchiveError::SourceUnreadable {
                    path: entry.path.clone(),
                    source,
                })?;
            PreparedEntry::file(
                entry.name,
                &contents,
                level,
                entry.modified,
                entry.permissions,
            )
            .map_err(|source| ArchiveError::CompressionFailure {
                path: entry.path,
                source,
            })
        }
    }
}

#[cfg(unix)]
fn permissions(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn unreadable(root: &Path, err: walkdir::Error) -> ArchiveError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    ArchiveError::SourceUnreadable {
        path,
        source: err.into(),
    }
}

fn write_failure(destination: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::IoWriteFailure {
        path: destination.to_path_buf(),
        source,
    }
}

fn join_error(err: task::JoinError) -> ArchiveError {
    ArchiveError::Runtime(std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walk_is_sorted_and_directories_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b/inner")).unwrap();
        fs::write(root.join("b/inner/z.txt"), "z").unwrap();
        fs::write(root.join("b/a.txt"), "a").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("c.txt"), "c").unwrap();

        let (entries, skipped) =
            collect_entries(root, &ArchiveOptions::default(), None).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b", "b/a.txt", "b/inner", "b/inner/z.txt", "c.txt"]);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn include_root_adds_the_root_entry() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file.txt"), "x").unwrap();

        let options = ArchiveOptions::default().with_include_root(true);
        let (entries, _) = collect_entries(&root, &options, None).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["project", "project/file.txt"]);
        assert!(matches!(entries[0].kind, SourceKind::Directory));
    }

    #[test]
    fn excluded_path_is_not_walked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("keep.txt"), "x").unwrap();
        fs::write(root.join("out.zip"), "").unwrap();

        let exclude = root.join("out.zip");
        let (entries, _) =
            collect_entries(root, &ArchiveOptions::default(), Some(&exclude)).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["keep.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_preserved_or_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("target.txt"), "content").unwrap();
        std::os::unix::fs::symlink("target.txt", root.join("link")).unwrap();

        let (entries, _) = collect_entries(root, &ArchiveOptions::default(), None).unwrap();
        assert!(matches!(&entries[0].kind, SourceKind::Symlink(t) if t == "target.txt"));

        let follow = ArchiveOptions::default().with_symlinks(SymlinkPolicy::Follow);
        let (entries, _) = collect_entries(root, &follow, None).unwrap();
        assert!(matches!(entries[0].kind, SourceKind::File));
    }

    #[cfg(unix)]
    #[test]
    fn preserved_links_must_stay_inside_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        std::os::unix::fs::symlink("../top.txt", root.join("sub/up")).unwrap();
        collect_entries(&root, &ArchiveOptions::default(), None).unwrap();

        for (name, target) in [("host", "/etc/hostname"), ("out", "../elsewhere")] {
            std::os::unix::fs::symlink(target, root.join(name)).unwrap();
            let err = collect_entries(&root, &ArchiveOptions::default(), None).unwrap_err();
            assert!(
                matches!(&err, ArchiveError::UnsupportedPath { path, .. } if path.ends_with(name)),
                "{err}"
            );
            fs::remove_file(root.join(name)).unwrap();
        }
    }

    #[test]
    fn level_above_nine_is_rejected() {
        let err = ArchiveOptions::default()
            .with_compression_level(10)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidOptions(_)));
    }
}
