//! ZIP-to-directory extraction.
//!
//! Extraction is planned before it is performed: every entry name is
//! validated, duplicates are refused, symlink targets are checked, and only
//! then is the destination touched. Directories are created first, then
//! regular files, then symlinks, so no write ever goes through a link
//! created by the same archive. Timestamps and permissions are applied at
//! the end, deepest directory first.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::io::LocalFileReader;
use crate::path;
use crate::zip::{EntryKind, ZipExtractor, ZipFileEntry};

/// What [`extract_archive`](crate::extract_archive) wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// Decompressed bytes written to regular files.
    pub bytes: u64,
}

struct PlannedEntry {
    entry: ZipFileEntry,
    relative: PathBuf,
    link_target: Option<String>,
}

type Extractor = ZipExtractor<LocalFileReader>;

fn open(archive: &Path) -> Result<Extractor> {
    let reader =
        LocalFileReader::new(archive).map_err(|source| ArchiveError::ArchiveUnreadable {
            path: archive.to_path_buf(),
            source,
        })?;
    Ok(ZipExtractor::new(Arc::new(reader)))
}

/// Async form of [`list_archive`](crate::list_archive).
pub async fn list_archive_async(archive: &Path) -> Result<Vec<ZipFileEntry>> {
    open(archive)?
        .list_files()
        .await
        .map_err(ArchiveError::corrupt)
}

/// Async form of [`extract_archive`](crate::extract_archive).
pub async fn extract_archive_async(archive: &Path, destination: &Path) -> Result<ExtractSummary> {
    info!(
        archive = %archive.display(),
        destination = %destination.display(),
        "extracting archive"
    );

    let extractor = open(archive)?;
    let entries = extractor.list_files().await.map_err(ArchiveError::corrupt)?;
    let plan = plan(&extractor, entries).await?;

    let created = prepare_destination(destination).await?;
    match unpack(&extractor, &plan, destination).await {
        Ok(summary) => {
            info!(
                destination = %destination.display(),
                files = summary.files,
                directories = summary.directories,
                symlinks = summary.symlinks,
                bytes = summary.bytes,
                "archive extracted"
            );
            Ok(summary)
        }
        Err(err) => {
            warn!(destination = %destination.display(), error = %err, "extraction failed");
            rollback(destination, created).await;
            Err(err)
        }
    }
}

async fn plan(extractor: &Extractor, entries: Vec<ZipFileEntry>) -> Result<Vec<PlannedEntry>> {
    let mut seen = HashSet::new();
    let mut planned = Vec::with_capacity(entries.len());

    for entry in entries {
        let relative = path::sanitize_entry_name(&entry.file_name)?;
        if !seen.insert(relative.clone()) {
            return Err(ArchiveError::CorruptArchive(format!(
                "duplicate entry '{}'",
                entry.file_name
            )));
        }

        let link_target = if entry.kind == EntryKind::Symlink {
            let data = extractor
                .extract_to_memory(&entry)
                .await
                .map_err(ArchiveError::corrupt)?;
            let target = String::from_utf8(data).map_err(|_| {
                ArchiveError::CorruptArchive(format!(
                    "link target of '{}' is not valid UTF-8",
                    entry.file_name
                ))
            })?;
            path::validate_link_target(&entry.file_name, &relative, &target)?;
            Some(target)
        } else {
            None
        };

        planned.push(PlannedEntry {
            entry,
            relative,
            link_target,
        });
    }

    let links: HashSet<&Path> = planned
        .iter()
        .filter(|p| p.link_target.is_some())
        .map(|p| p.relative.as_path())
        .collect();
    if !links.is_empty() {
        for p in &planned {
            if p.relative.ancestors().skip(1).any(|a| links.contains(a)) {
                return Err(ArchiveError::traversal(
                    &p.entry.file_name,
                    "nested under a symlink entry",
                ));
            }
        }
    }

    Ok(planned)
}

/// Make sure `destination` is an empty directory. Returns whether it had
/// to be created.
async fn prepare_destination(destination: &Path) -> Result<bool> {
    let unwritable = |source: io::Error| ArchiveError::DestinationUnwritable {
        path: destination.to_path_buf(),
        source,
    };

    match fs::metadata(destination).await {
        Ok(metadata) if metadata.is_dir() => {
            let mut listing = fs::read_dir(destination).await.map_err(unwritable)?;
            if listing.next_entry().await.map_err(unwritable)?.is_some() {
                return Err(ArchiveError::DestinationNotEmpty {
                    path: destination.to_path_buf(),
                });
            }
            Ok(false)
        }
        Ok(_) => Err(ArchiveError::DestinationNotEmpty {
            path: destination.to_path_buf(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(destination).await.map_err(unwritable)?;
            Ok(true)
        }
        Err(err) => Err(unwritable(err)),
    }
}

async fn unpack(
    extractor: &Extractor,
    plan: &[PlannedEntry],
    destination: &Path,
) -> Result<ExtractSummary> {
    let mut summary = ExtractSummary::default();
    let write_failure = |path: &Path, source: io::Error| ArchiveError::IoWriteFailure {
        path: path.to_path_buf(),
        source,
    };

    for p in plan.iter().filter(|p| p.entry.kind == EntryKind::Directory) {
        let out = destination.join(&p.relative);
        fs::create_dir_all(&out)
            .await
            .map_err(|e| write_failure(&out, e))?;
        debug!(name = %p.entry.file_name, "created directory");
        summary.directories += 1;
    }

    for p in plan.iter().filter(|p| p.entry.kind == EntryKind::File) {
        let out = destination.join(&p.relative);
        let data = extractor
            .extract_to_memory(&p.entry)
            .await
            .map_err(ArchiveError::corrupt)?;
        // Archives are not required to list parent directories.
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failure(parent, e))?;
        }
        fs::write(&out, &data)
            .await
            .map_err(|e| write_failure(&out, e))?;
        debug!(name = %p.entry.file_name, size = data.len(), "extracted file");
        summary.files += 1;
        summary.bytes += data.len() as u64;
    }

    for p in plan.iter() {
        let Some(target) = &p.link_target else {
            continue;
        };
        let out = destination.join(&p.relative);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failure(parent, e))?;
        }
        create_symlink(target, &out)
            .await
            .map_err(|e| write_failure(&out, e))?;
        debug!(name = %p.entry.file_name, link_target = %target, "created symlink");
        summary.symlinks += 1;
    }

    // Files first, then directories deepest first, so setting a child never
    // bumps a parent's restored mtime.
    let mut directories: Vec<&PlannedEntry> = plan
        .iter()
        .filter(|p| p.entry.kind == EntryKind::Directory)
        .collect();
    directories.sort_by_key(|p| std::cmp::Reverse(p.relative.components().count()));
    let attributes: Vec<(PathBuf, ZipFileEntry)> = plan
        .iter()
        .filter(|p| p.entry.kind == EntryKind::File)
        .chain(directories)
        .map(|p| (destination.join(&p.relative), p.entry.clone()))
        .collect();

    task::spawn_blocking(move || {
        for (path, entry) in &attributes {
            restore_attributes(path, entry).map_err(|source| ArchiveError::IoWriteFailure {
                path: path.clone(),
                source,
            })?;
        }
        Ok::<(), ArchiveError>(())
    })
    .await
    .map_err(|err| ArchiveError::Runtime(io::Error::other(err)))??;

    Ok(summary)
}

#[cfg(unix)]
async fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    // Link creation needs extra privileges on Windows; keep the target as text.
    warn!(link = %link.display(), link_target = %target, "symlinks unsupported, writing target as a file");
    fs::write(link, target).await
}

fn restore_attributes(path: &Path, entry: &ZipFileEntry) -> io::Result<()> {
    if let Some(modified) = entry.modified() {
        if entry.kind == EntryKind::File {
            std::fs::OpenOptions::new()
                .write(true)
                .open(path)?
                .set_modified(modified)?;
        } else if cfg!(unix) {
            std::fs::File::open(path)?.set_modified(modified)?;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = entry.unix_mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }

    Ok(())
}

/// Put the destination back the way it was found.
async fn rollback(destination: &Path, created: bool) {
    let result = if created {
        fs::remove_dir_all(destination).await
    } else {
        clear_directory(destination).await
    };
    if let Err(err) = result {
        warn!(destination = %destination.display(), error = %err, "cleanup after failed extraction");
    }
}

async fn clear_directory(dir: &Path) -> io::Result<()> {
    let mut listing = fs::read_dir(dir).await?;
    while let Some(child) = listing.next_entry().await? {
        if child.file_type().await?.is_dir() {
            fs::remove_dir_all(child.path()).await?;
        } else {
            fs::remove_file(child.path()).await?;
        }
    }
    Ok(())
}
