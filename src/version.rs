//! Versions: immutable snapshots of an artifact's metadata or content,
//! attributed to the command that created them.
//!
//! Directory versions may be partial (a single link or unlink); a directory's
//! effective contents are defined by scanning its version stack newest to
//! oldest, which is why the variants here answer entry lookups with a
//! three-valued result.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::env::ArtifactId;
use crate::hash::Fingerprint;
use crate::ir::CommandId;

/// Answer from asking one directory version about an entry. `Maybe` means the
/// version has no opinion and the scan continues to the next version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Yes,
    No,
    Maybe,
}

/// The (uid, gid, mode) triple tracked for every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Metadata {
    pub fn from_fs(meta: &std::fs::Metadata) -> Metadata {
        use std::os::unix::fs::MetadataExt;
        Metadata {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        }
    }

    pub fn matches(&self, other: &Metadata) -> bool {
        self.uid == other.uid && self.gid == other.gid && self.mode == other.mode
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// A snapshot of an artifact's metadata.
#[derive(Debug, Clone)]
pub struct MetadataVersion {
    pub meta: Metadata,
    pub mtime: (i64, u32),
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl MetadataVersion {
    pub fn new(meta: Metadata) -> MetadataVersion {
        MetadataVersion {
            meta,
            mtime: (0, 0),
            creator: None,
            committed: false,
        }
    }

    /// Metadata is always carried in full, so matching never degrades.
    pub fn matches(&self, expected: &MetadataVersion) -> bool {
        self.meta.matches(&expected.meta)
    }
}

/// A snapshot of a file's contents. The fingerprint is optional: a version we
/// produced during emulation but never fingerprinted can only be compared
/// pessimistically.
#[derive(Debug, Clone)]
pub struct FileVersion {
    pub fingerprint: Option<Fingerprint>,
    /// The content bytes are stored in the cache under the fingerprint digest.
    pub saved: bool,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl FileVersion {
    pub fn new() -> FileVersion {
        FileVersion {
            fingerprint: None,
            saved: false,
            creator: None,
            committed: false,
        }
    }

    pub fn empty() -> FileVersion {
        FileVersion {
            fingerprint: Some(Fingerprint::empty()),
            ..FileVersion::new()
        }
    }

    pub fn with_fingerprint(fp: Fingerprint) -> FileVersion {
        FileVersion {
            fingerprint: Some(fp),
            ..FileVersion::new()
        }
    }

    /// Fingerprint the on-disk file at `path` if we have not already.
    pub fn fingerprint(&mut self, path: &Path) -> std::io::Result<()> {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(Fingerprint::of_path(path)?);
        }
        Ok(())
    }

    /// Compare saved fingerprints. A version without a fingerprint never
    /// matches, which forces the consumer to rerun.
    pub fn matches(&self, expected: &FileVersion) -> bool {
        match (&self.fingerprint, &expected.fingerprint) {
            (Some(a), Some(b)) => a.same_content(b),
            _ => false,
        }
    }
}

/// A snapshot of a symlink's target.
#[derive(Debug, Clone)]
pub struct SymlinkVersion {
    pub target: PathBuf,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl SymlinkVersion {
    pub fn new(target: PathBuf) -> SymlinkVersion {
        SymlinkVersion {
            target,
            creator: None,
            committed: false,
        }
    }

    pub fn matches(&self, expected: &SymlinkVersion) -> bool {
        self.target == expected.target
    }
}

/// The state carried by one directory version.
#[derive(Debug, Clone)]
pub enum DirState {
    /// Lazy view of an on-disk directory. Entries found (or found missing) by
    /// earlier lookups are cached so the answer stays stable for the build.
    Existing {
        present: HashSet<String>,
        absent: HashSet<String>,
    },
    /// An empty directory created during the build.
    Created,
    /// A complete listing.
    Listed { entries: BTreeSet<String> },
    /// Partial: one entry was linked.
    AddEntry { name: String, target: ArtifactId },
    /// Partial: one entry was unlinked.
    RemoveEntry { name: String },
}

/// One version in a directory's stack.
#[derive(Debug, Clone)]
pub struct DirVersion {
    pub state: DirState,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl DirVersion {
    pub fn existing() -> DirVersion {
        DirVersion {
            state: DirState::Existing {
                present: HashSet::new(),
                absent: HashSet::new(),
            },
            creator: None,
            committed: false,
        }
    }

    pub fn created() -> DirVersion {
        DirVersion {
            state: DirState::Created,
            creator: None,
            committed: false,
        }
    }

    /// Does this version guarantee the presence or absence of `name`?
    /// `dir_path` is the directory's on-disk path, needed only by the
    /// `Existing` baseline.
    pub fn has_entry(&mut self, dir_path: Option<&Path>, name: &str) -> Lookup {
        match &mut self.state {
            DirState::Existing { present, absent } => {
                if present.contains(name) {
                    return Lookup::Yes;
                }
                if absent.contains(name) {
                    return Lookup::No;
                }
                let found = match dir_path {
                    Some(dir) => std::fs::symlink_metadata(dir.join(name)).is_ok(),
                    None => false,
                };
                if found {
                    present.insert(name.to_string());
                    Lookup::Yes
                } else {
                    absent.insert(name.to_string());
                    Lookup::No
                }
            }
            DirState::Created => Lookup::No,
            DirState::Listed { entries } => {
                if entries.contains(name) {
                    Lookup::Yes
                } else {
                    Lookup::No
                }
            }
            DirState::AddEntry { name: entry, .. } => {
                if entry == name {
                    Lookup::Yes
                } else {
                    Lookup::Maybe
                }
            }
            DirState::RemoveEntry { name: entry } => {
                if entry == name {
                    Lookup::No
                } else {
                    Lookup::Maybe
                }
            }
        }
    }

    /// The artifact behind `name`, if this version knows it directly.
    /// `None` means the caller should ask the filesystem.
    pub fn entry_artifact(&self, name: &str) -> Option<ArtifactId> {
        match &self.state {
            DirState::AddEntry { name: entry, target } if entry == name => Some(*target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsaved_content_never_matches() {
        let produced = FileVersion::new();
        let expected = FileVersion::with_fingerprint(Fingerprint::empty());
        assert!(!produced.matches(&expected));
        assert!(!expected.matches(&produced));
    }

    #[test]
    fn fingerprinted_content_matches_by_digest() {
        let a = FileVersion::with_fingerprint(Fingerprint::empty());
        let b = FileVersion::with_fingerprint(Fingerprint::empty());
        assert!(a.matches(&b));
    }

    #[test]
    fn partial_versions_answer_only_for_their_entry() {
        let mut add = DirVersion {
            state: DirState::AddEntry {
                name: "out".into(),
                target: ArtifactId(0),
            },
            creator: None,
            committed: false,
        };
        assert_eq!(add.has_entry(None, "out"), Lookup::Yes);
        assert_eq!(add.has_entry(None, "other"), Lookup::Maybe);

        let mut rm = DirVersion {
            state: DirState::RemoveEntry { name: "out".into() },
            creator: None,
            committed: false,
        };
        assert_eq!(rm.has_entry(None, "out"), Lookup::No);
        assert_eq!(rm.has_entry(None, "other"), Lookup::Maybe);
    }

    #[test]
    fn created_dir_is_empty() {
        let mut v = DirVersion::created();
        assert_eq!(v.has_entry(None, "anything"), Lookup::No);
    }

    #[test]
    fn existing_dir_consults_the_filesystem_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), "").unwrap();

        let mut v = DirVersion::existing();
        assert_eq!(v.has_entry(Some(dir.path()), "present"), Lookup::Yes);
        assert_eq!(v.has_entry(Some(dir.path()), "missing"), Lookup::No);

        // The first answer is cached: deleting the entry does not change it.
        std::fs::remove_file(dir.path().join("present")).unwrap();
        assert_eq!(v.has_entry(Some(dir.path()), "present"), Lookup::Yes);
    }
}
