// ABOUTME: Archive entries, path normalization and the tar-based archive codec
// ABOUTME: Also packs host directories into entries and extracts entries onto the host

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid entry path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_LINK_MODE: u32 = 0o777;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: String },
}

/// One node of a transferred tree. `path` is relative and forward-slash separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            mode: DEFAULT_FILE_MODE,
            content: content.into(),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            mode: DEFAULT_DIR_MODE,
            content: Vec::new(),
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Symlink {
                target: target.into(),
            },
            mode: DEFAULT_LINK_MODE,
            content: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o7777;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Codec turning an ordered list of entries into a transportable byte stream and back.
pub trait ArchiveCodec: Send + Sync {
    fn pack(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>>;
    fn unpack(&self, data: &[u8]) -> Result<Vec<ArchiveEntry>>;
}

/// POSIX tar codec. Directories precede their children; mtimes are zeroed so
/// packing the same tree twice yields identical bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarCodec;

impl ArchiveCodec for TarCodec {
    fn pack(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());

        for entry in entries {
            let path = normalize_path(&entry.path)?;
            if path.is_empty() {
                continue;
            }

            let mut header = Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_mtime(0);

            match &entry.kind {
                EntryKind::File => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(entry.content.len() as u64);
                    builder.append_data(&mut header, &path, entry.content.as_slice())?;
                }
                EntryKind::Directory => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, &path, std::io::empty())?;
                }
                EntryKind::Symlink { target } => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, &path, target)?;
                }
            }
        }

        builder.into_inner().map_err(ArchiveError::Io)
    }

    fn unpack(&self, data: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let mut archive = Archive::new(data);
        let mut entries = Vec::new();

        for item in archive.entries()? {
            let mut item = item?;
            let raw_path = item.path()?.to_string_lossy().into_owned();
            let path = normalize_path(&raw_path)?;
            if path.is_empty() {
                continue;
            }

            let header = item.header();
            let mode = header.mode().unwrap_or(DEFAULT_FILE_MODE) & 0o7777;
            let entry_type = header.entry_type();

            let entry = match entry_type {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    let mut content = Vec::with_capacity(item.size() as usize);
                    item.read_to_end(&mut content)?;
                    ArchiveEntry {
                        path,
                        kind: EntryKind::File,
                        mode,
                        content,
                    }
                }
                EntryType::Directory => ArchiveEntry::directory(path).with_mode(mode),
                EntryType::Symlink => {
                    let target = item
                        .link_name()?
                        .map(|t| t.to_string_lossy().into_owned())
                        .ok_or_else(|| ArchiveError::InvalidPath {
                            path: raw_path.clone(),
                            reason: "symlink without target".to_string(),
                        })?;
                    ArchiveEntry::symlink(path, target).with_mode(mode)
                }
                other => {
                    warn!("Skipping unsupported tar entry {} ({:?})", raw_path, other);
                    continue;
                }
            };
            entries.push(entry);
        }

        Ok(entries)
    }
}

/// Normalize an entry path to relative forward-slash form.
///
/// `./a//b/` becomes `a/b` and the archive root becomes the empty string.
/// Absolute paths and `..` components are rejected so entries cannot escape
/// the directory they are unpacked into.
pub fn normalize_path(raw: &str) -> Result<String> {
    let invalid = |reason: &str| ArchiveError::InvalidPath {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(invalid("absolute paths are not allowed"));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(invalid("parent directory components are not allowed")),
            part if part.contains('\0') => return Err(invalid("NUL byte in path")),
            part => parts.push(part),
        }
    }

    Ok(parts.join("/"))
}

/// Normalize every entry path, drop the root entry and order parents before children.
pub fn normalize_entries(entries: Vec<ArchiveEntry>) -> Result<Vec<ArchiveEntry>> {
    let mut normalized = Vec::with_capacity(entries.len());
    for mut entry in entries {
        entry.path = normalize_path(&entry.path)?;
        if !entry.path.is_empty() {
            normalized.push(entry);
        }
    }
    normalized.sort_by(|a, b| a.path.cmp(&b.path));
    normalized.dedup_by(|later, earlier| later.path == earlier.path);
    Ok(normalized)
}

/// Walk a host directory into archive entries, without following symlinks.
pub fn collect_dir(root: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();

    for item in walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let item = item.map_err(|e| {
            ArchiveError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;

        let relative = item
            .path()
            .strip_prefix(root)
            .map_err(|_| ArchiveError::InvalidPath {
                path: item.path().display().to_string(),
                reason: "outside of walked root".to_string(),
            })?;
        let path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        let metadata = item.path().symlink_metadata()?;
        let mode = host_mode(&metadata);
        let file_type = metadata.file_type();

        let entry = if file_type.is_symlink() {
            let target = std::fs::read_link(item.path())?;
            ArchiveEntry::symlink(path, target.to_string_lossy().replace('\\', "/"))
        } else if file_type.is_dir() {
            ArchiveEntry::directory(path).with_mode(mode)
        } else if file_type.is_file() {
            ArchiveEntry::file(path, std::fs::read(item.path())?).with_mode(mode)
        } else {
            debug!("Skipping special file {}", item.path().display());
            continue;
        };
        entries.push(entry);
    }

    debug!("Collected {} entries from {}", entries.len(), root.display());
    Ok(entries)
}

/// Write entries beneath `dest`, creating intermediate directories. Returns the number written.
pub fn extract_to_dir(entries: &[ArchiveEntry], dest: &Path) -> Result<u64> {
    std::fs::create_dir_all(dest)?;
    let mut written = 0;

    for entry in entries {
        let relative = normalize_path(&entry.path)?;
        if relative.is_empty() {
            continue;
        }
        let replaces_link = matches!(entry.kind, EntryKind::Symlink { .. });
        reject_symlinked_ancestors(dest, &relative, replaces_link)?;
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match &entry.kind {
            EntryKind::Directory => {
                std::fs::create_dir_all(&target)?;
                set_host_mode(&target, entry.mode)?;
            }
            EntryKind::File => {
                std::fs::write(&target, &entry.content)?;
                set_host_mode(&target, entry.mode)?;
            }
            EntryKind::Symlink { target: link } => {
                create_symlink(link, &target)?;
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Fail if any existing component of `relative` under `dest` is a symlink.
///
/// Earlier entries may have planted a link; writing through it would land outside `dest`.
/// A symlink entry replaces its own final component, so only its ancestors are checked.
fn reject_symlinked_ancestors(dest: &Path, relative: &str, skip_last: bool) -> Result<()> {
    let parts: Vec<&str> = relative.split('/').collect();
    let checked = if skip_last {
        parts.len().saturating_sub(1)
    } else {
        parts.len()
    };
    let mut current = dest.to_path_buf();
    for part in &parts[..checked] {
        current.push(part);
        match current.symlink_metadata() {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(ArchiveError::InvalidPath {
                    path: relative.to_string(),
                    reason: format!("'{}' is a symlink", current.display()),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn host_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn host_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

#[cfg(unix)]
fn set_host_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_host_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link_target: &str, at: &Path) -> std::io::Result<()> {
    if at.symlink_metadata().is_ok() {
        std::fs::remove_file(at)?;
    }
    std::os::unix::fs::symlink(link_target, at)
}

#[cfg(not(unix))]
fn create_symlink(link_target: &str, at: &Path) -> std::io::Result<()> {
    warn!(
        "Symlinks are not supported on this platform, skipping {} -> {}",
        at.display(),
        link_target
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::directory("src"),
            ArchiveEntry::file("src/index.js", b"console.log('hi')\n".to_vec()),
            ArchiveEntry::file("run.sh", b"#!/bin/sh\necho ok\n".to_vec()).with_mode(0o755),
            ArchiveEntry::symlink("latest", "src/index.js"),
        ]
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./a//b/").unwrap(), "a/b");
        assert_eq!(normalize_path("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path(".").unwrap(), "");
        assert_eq!(normalize_path("./").unwrap(), "");
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_tar_preserves_kinds_modes_and_bytes() {
        let codec = TarCodec;
        let packed = codec.pack(&sample_tree()).unwrap();
        let unpacked = codec.unpack(&packed).unwrap();

        assert_eq!(unpacked.len(), 4);
        let script = unpacked.iter().find(|e| e.path == "run.sh").unwrap();
        assert_eq!(script.mode, 0o755);
        assert_eq!(script.content, b"#!/bin/sh\necho ok\n");

        let link = unpacked.iter().find(|e| e.path == "latest").unwrap();
        assert_eq!(
            link.kind,
            EntryKind::Symlink {
                target: "src/index.js".to_string()
            }
        );
        assert!(unpacked.iter().any(|e| e.path == "src" && e.is_dir()));
    }

    #[test]
    fn test_tar_handles_long_paths() {
        let deep = (0..30).map(|i| format!("dir{}", i)).collect::<Vec<_>>().join("/");
        let path = format!("{}/file.txt", deep);
        let codec = TarCodec;
        let packed = codec
            .pack(&[ArchiveEntry::file(path.clone(), b"deep".to_vec())])
            .unwrap();
        let unpacked = codec.unpack(&packed).unwrap();
        assert_eq!(unpacked[0].path, path);
    }

    #[test]
    fn test_pack_is_deterministic() {
        let codec = TarCodec;
        assert_eq!(
            codec.pack(&sample_tree()).unwrap(),
            codec.pack(&sample_tree()).unwrap()
        );
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let codec = TarCodec;
        let garbage = vec![0x42u8; 700];
        assert!(codec.unpack(&garbage).is_err());
    }

    #[test]
    fn test_normalize_entries_orders_parents_first() {
        let entries = normalize_entries(vec![
            ArchiveEntry::file("a/b/c.txt", b"c".to_vec()),
            ArchiveEntry::directory("./a/b"),
            ArchiveEntry::directory("a"),
            ArchiveEntry::directory("."),
        ])
        .unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.txt"]);
    }

    #[test]
    fn test_host_directory_round_trip() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("lib/nested")).unwrap();
        std::fs::write(source.path().join("lib/nested/data.bin"), [0u8, 159, 146, 150]).unwrap();
        std::fs::write(source.path().join("README.md"), "# hello\n").unwrap();

        let entries = collect_dir(source.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["README.md", "lib", "lib/nested", "lib/nested/data.bin"]
        );

        let dest = tempfile::tempdir().unwrap();
        let written = extract_to_dir(&entries, dest.path()).unwrap();
        assert_eq!(written, 4);
        assert_eq!(
            std::fs::read(dest.path().join("lib/nested/data.bin")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_dir_keeps_symlinks_unresolved() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("target.txt"), "t").unwrap();
        std::os::unix::fs::symlink("target.txt", source.path().join("link")).unwrap();

        let entries = collect_dir(source.path()).unwrap();
        let link = entries.iter().find(|e| e.path == "link").unwrap();
        assert_eq!(
            link.kind,
            EntryKind::Symlink {
                target: "target.txt".to_string()
            }
        );
    }

    #[test]
    fn test_extract_rejects_escaping_paths() {
        let dest = tempfile::tempdir().unwrap();
        let result = extract_to_dir(&[ArchiveEntry::file("../evil", b"x".to_vec())], dest.path());
        assert!(matches!(result, Err(ArchiveError::InvalidPath { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_refuses_to_write_through_symlinks() {
        let dest = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link_target = outside.path().to_string_lossy().into_owned();

        let result = extract_to_dir(
            &[
                ArchiveEntry::symlink("link", link_target),
                ArchiveEntry::file("link/pwned.txt", b"x".to_vec()),
            ],
            dest.path(),
        );
        assert!(matches!(result, Err(ArchiveError::InvalidPath { .. })));
        assert!(!outside.path().join("pwned.txt").exists());

        // Replacing the link itself with a file must not write through it either
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, b"original").unwrap();
        let result = extract_to_dir(
            &[
                ArchiveEntry::symlink("alias", victim.to_string_lossy().into_owned()),
                ArchiveEntry::file("alias", b"overwritten".to_vec()),
            ],
            dest.path(),
        );
        assert!(matches!(result, Err(ArchiveError::InvalidPath { .. })));
        assert_eq!(std::fs::read(&victim).unwrap(), b"original");
    }
}
