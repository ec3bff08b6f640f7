//! Mapping between filesystem paths and archive entry names.
//!
//! Archive names always use `/`, never start with `/` and never contain a
//! `..` component. The writing side builds names from path components; the
//! reading side re-validates every name (and every symlink target) before
//! anything touches the destination directory.

use std::path::{Component, Path, PathBuf};

use crate::error::{ArchiveError, Result};

/// Build the archive name of `path`, which must live under `root`.
///
/// `prefix` is prepended as an extra leading component. Returns an empty
/// string for the root itself when there is no prefix.
pub fn entry_name(root: &Path, path: &Path, prefix: Option<&str>) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::UnsupportedPath {
            path: path.to_path_buf(),
            reason: format!("not under '{}'", root.display()),
        })?;

    let mut parts: Vec<&str> = prefix.into_iter().collect();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| ArchiveError::UnsupportedPath {
                    path: path.to_path_buf(),
                    reason: "name is not valid UTF-8".into(),
                })?;
                if part.contains('\\') {
                    return Err(ArchiveError::UnsupportedPath {
                        path: path.to_path_buf(),
                        reason: "name contains a backslash".into(),
                    });
                }
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(ArchiveError::UnsupportedPath {
                    path: path.to_path_buf(),
                    reason: "unexpected path component".into(),
                });
            }
        }
    }

    if parts.first().is_some_and(|first| is_drive_prefix(first)) {
        return Err(ArchiveError::UnsupportedPath {
            path: path.to_path_buf(),
            reason: "leading component looks like a drive letter".into(),
        });
    }
    Ok(parts.join("/"))
}

/// `C:` on its own, the one leading component that Windows would read as a
/// drive rather than a directory name.
fn is_drive_prefix(part: &str) -> bool {
    matches!(part.as_bytes(), [letter, b':'] if letter.is_ascii_alphabetic())
}

/// Whether `part`, at position `index` of a name or link target, would be
/// read as something other than a plain file name.
fn is_prefix_component(index: usize, part: &str) -> bool {
    (index == 0 && is_drive_prefix(part)) || (cfg!(windows) && part.contains(':'))
}

/// Turn a symlink target into its archived form.
pub fn link_target(link: &Path, target: &Path) -> Result<String> {
    let target = target.to_str().ok_or_else(|| ArchiveError::UnsupportedPath {
        path: link.to_path_buf(),
        reason: "link target is not valid UTF-8".into(),
    })?;
    Ok(if cfg!(windows) {
        target.replace('\\', "/")
    } else {
        target.to_string()
    })
}

/// Validate an archive name and convert it to a path relative to the
/// extraction root.
pub fn sanitize_entry_name(name: &str) -> Result<PathBuf> {
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(ArchiveError::traversal(name, "absolute path"));
    }

    let mut relative = PathBuf::new();
    for (index, part) in name.split(['/', '\\']).enumerate() {
        match part {
            "" | "." => {}
            ".." => return Err(ArchiveError::traversal(name, "parent directory component")),
            _ if is_prefix_component(index, part) => {
                return Err(ArchiveError::traversal(name, "drive or stream prefix"));
            }
            _ if part.contains('\0') => {
                return Err(ArchiveError::traversal(name, "NUL byte in name"));
            }
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(ArchiveError::traversal(name, "empty name"));
    }
    Ok(relative)
}

/// Check that a symlink stored at `link` (already sanitized, relative to
/// the extraction root) cannot resolve outside that root.
///
/// The target must be relative, and `..` is accepted only as a leading run
/// that climbs no higher than the link's own directory depth. A `..` after
/// a normal component could step back out of another symlink, so it is
/// refused outright.
pub fn validate_link_target(entry: &str, link: &Path, target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(ArchiveError::traversal(entry, "empty link target"));
    }
    if target.starts_with('/')
        || target.starts_with('\\')
        || target
            .split(['/', '\\'])
            .enumerate()
            .any(|(index, part)| is_prefix_component(index, part))
    {
        return Err(ArchiveError::traversal(entry, "absolute link target"));
    }

    let depth = link.components().count().saturating_sub(1);
    let mut climbed = 0usize;
    let mut descended = false;
    for part in target.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." if descended => {
                return Err(ArchiveError::traversal(entry, "link target backtracks"));
            }
            ".." => {
                climbed += 1;
                if climbed > depth {
                    return Err(ArchiveError::traversal(entry, "link target escapes the root"));
                }
            }
            _ => descended = true,
        }
    }
    Ok(())
}
