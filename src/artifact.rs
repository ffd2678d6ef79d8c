//! Artifacts: filesystem objects with evolving version histories. One
//! artifact exists per on-disk inode the build touches, plus one per
//! anonymous object (pipes, temporary files, created directories).

use std::collections::HashMap;
use std::path::Path;

use crate::env::ArtifactId;
use crate::version::{DirVersion, FileVersion, Lookup, MetadataVersion, SymlinkVersion};

/// Kind-specific content history. Pipes and special files carry file-style
/// content stacks; only the kind tag differs.
pub enum Content {
    File { versions: Vec<FileVersion> },
    Pipe { versions: Vec<FileVersion> },
    Special { versions: Vec<FileVersion> },
    Symlink { versions: Vec<SymlinkVersion> },
    Dir {
        versions: Vec<DirVersion>,
        /// Cache of entry name to resolved artifact.
        resolved: HashMap<String, ArtifactId>,
    },
}

pub struct Artifact {
    pub content: Content,
    /// Metadata history, oldest first. Never empty.
    pub metadata: Vec<MetadataVersion>,
    /// Current link edges: (parent directory, entry name). The root
    /// directory has a single link with no parent.
    pub links: Vec<(Option<ArtifactId>, String)>,
    /// Diagnostic name, usually the first path this artifact was reached by.
    pub name: String,
}

impl Artifact {
    pub fn new(content: Content, metadata: MetadataVersion) -> Artifact {
        Artifact {
            content,
            metadata: vec![metadata],
            links: Vec::new(),
            name: String::new(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.content {
            Content::File { .. } => "file",
            Content::Pipe { .. } => "pipe",
            Content::Special { .. } => "special",
            Content::Symlink { .. } => "symlink",
            Content::Dir { .. } => "dir",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.content, Content::Symlink { .. })
    }

    /* ---- metadata ---- */

    pub fn current_metadata(&self) -> &MetadataVersion {
        self.metadata.last().unwrap()
    }

    pub fn push_metadata(&mut self, v: MetadataVersion) {
        self.metadata.push(v);
    }

    /* ---- file-style content ---- */

    /// The file-style version stack, for file, pipe, and special artifacts.
    pub fn file_versions(&self) -> Option<&Vec<FileVersion>> {
        match &self.content {
            Content::File { versions }
            | Content::Pipe { versions }
            | Content::Special { versions } => Some(versions),
            _ => None,
        }
    }

    pub fn file_versions_mut(&mut self) -> Option<&mut Vec<FileVersion>> {
        match &mut self.content {
            Content::File { versions }
            | Content::Pipe { versions }
            | Content::Special { versions } => Some(versions),
            _ => None,
        }
    }

    pub fn current_file_version(&self) -> Option<&FileVersion> {
        self.file_versions().and_then(|v| v.last())
    }

    pub fn push_file_version(&mut self, v: FileVersion) -> Option<usize> {
        let versions = self.file_versions_mut()?;
        versions.push(v);
        Some(versions.len() - 1)
    }

    /* ---- symlinks ---- */

    pub fn symlink_versions(&self) -> Option<&Vec<SymlinkVersion>> {
        match &self.content {
            Content::Symlink { versions } => Some(versions),
            _ => None,
        }
    }

    pub fn current_symlink(&self) -> Option<&SymlinkVersion> {
        self.symlink_versions().and_then(|v| v.last())
    }

    /* ---- directories ---- */

    pub fn dir_versions(&self) -> Option<&Vec<DirVersion>> {
        match &self.content {
            Content::Dir { versions, .. } => Some(versions),
            _ => None,
        }
    }

    pub fn dir_versions_mut(&mut self) -> Option<&mut Vec<DirVersion>> {
        match &mut self.content {
            Content::Dir { versions, .. } => Some(versions),
            _ => None,
        }
    }

    /// Push a partial directory version (link or unlink), updating the
    /// resolved-entry cache. Returns the version's stack index.
    pub fn push_dir_version(&mut self, v: DirVersion) -> Option<usize> {
        use crate::version::DirState;
        let (versions, resolved) = match &mut self.content {
            Content::Dir { versions, resolved } => (versions, resolved),
            _ => return None,
        };
        match &v.state {
            DirState::AddEntry { name, target } => {
                resolved.insert(name.clone(), *target);
            }
            DirState::RemoveEntry { name } => {
                resolved.remove(name);
            }
            _ => {}
        }
        versions.push(v);
        Some(versions.len() - 1)
    }

    /// Scan the version stack newest to oldest for `name`. The first
    /// definite answer wins; the `Existing` baseline at the bottom always
    /// answers. Returns the index of the deciding version.
    ///
    /// `dir_path` is this directory's on-disk path, used only when the scan
    /// reaches the baseline.
    pub fn dir_lookup(&mut self, dir_path: Option<&Path>, name: &str) -> (Lookup, Option<usize>) {
        let versions = match &mut self.content {
            Content::Dir { versions, .. } => versions,
            _ => return (Lookup::No, None),
        };
        for idx in (0..versions.len()).rev() {
            let answer = versions[idx].has_entry(dir_path, name);
            if answer != Lookup::Maybe {
                return (answer, Some(idx));
            }
        }
        // A directory stack always bottoms out in Existing or Created, both
        // of which are definite; an empty stack means absent.
        (Lookup::No, None)
    }

    pub fn cached_entry(&self, name: &str) -> Option<ArtifactId> {
        match &self.content {
            Content::Dir { resolved, .. } => resolved.get(name).copied(),
            _ => None,
        }
    }

    pub fn cache_entry(&mut self, name: &str, target: ArtifactId) {
        if let Content::Dir { resolved, .. } = &mut self.content {
            resolved.insert(name.to_string(), target);
        }
    }

    /* ---- links ---- */

    pub fn add_link(&mut self, parent: Option<ArtifactId>, name: &str) {
        let edge = (parent, name.to_string());
        if !self.links.contains(&edge) {
            self.links.push(edge);
        }
        if self.name.is_empty() {
            self.name = name.to_string();
        }
    }

    pub fn remove_link(&mut self, parent: Option<ArtifactId>, name: &str) {
        self.links
            .retain(|(p, n)| !(*p == parent && n == name));
    }

    /// Whether all content versions have reached the disk.
    pub fn fully_committed(&self) -> bool {
        let content_ok = match &self.content {
            Content::File { versions }
            | Content::Pipe { versions }
            | Content::Special { versions } => versions.iter().all(|v| v.committed),
            Content::Symlink { versions } => versions.iter().all(|v| v.committed),
            Content::Dir { versions, .. } => versions.iter().all(|v| v.committed),
        };
        content_ok && self.metadata.iter().all(|v| v.committed)
    }
}
