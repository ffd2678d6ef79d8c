//! The environment: the registry of every artifact the build knows about,
//! keyed by inode for on-disk objects, and the bridge between the artifact
//! model and the real filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, Content};
use crate::cache::Cache;
use crate::densemap::{declare_id, DenseMap};
use crate::hash::Fingerprint;
use crate::ir::CommandId;
use crate::observer::BuildObserver;
use crate::version::{
    DirState, DirVersion, FileVersion, Lookup, Metadata, MetadataVersion, SymlinkVersion,
};

declare_id!(ArtifactId);

/// Outcome of looking up one directory entry.
pub enum DirEntry {
    /// Entry exists. `version` is the stack index of the deciding directory
    /// version (None when the lookup was the trivial ".").
    Found {
        artifact: ArtifactId,
        version: Option<usize>,
    },
    /// Entry is definitely absent; `version` excluded it.
    Missing { version: Option<usize> },
    NotADir,
}

pub struct Env {
    pub artifacts: DenseMap<ArtifactId, Artifact>,
    /// At most one artifact per (device, inode) pair.
    inodes: HashMap<(u64, u64), ArtifactId>,
    root: Option<ArtifactId>,
    stdio: [Option<ArtifactId>; 3],
    next_temp: usize,
    state_dir: PathBuf,
}

fn current_umask() -> u32 {
    // There is no read-only query for the umask.
    unsafe {
        let mask = libc::umask(0);
        libc::umask(mask);
        mask as u32
    }
}

impl Env {
    pub fn new(state_dir: PathBuf) -> Env {
        Env {
            artifacts: DenseMap::new(),
            inodes: HashMap::new(),
            root: None,
            stdio: [None; 3],
            next_temp: 0,
            state_dir,
        }
    }

    /// The shared artifact for one of the tool's standard streams (0..=2).
    pub fn stdio(&mut self, fd: usize) -> ArtifactId {
        if let Some(id) = self.stdio[fd] {
            return id;
        }
        let id = self.create_pipe(None);
        self.artifacts.get_mut(id).name = ["stdin", "stdout", "stderr"][fd].to_string();
        self.stdio[fd] = Some(id);
        id
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    /// The artifact for the filesystem root, fabricated on first use.
    pub fn root_dir(&mut self) -> anyhow::Result<ArtifactId> {
        if let Some(root) = self.root {
            return Ok(root);
        }
        let meta = std::fs::symlink_metadata("/")?;
        let id = self.artifact_from_disk(Path::new("/"), &meta);
        self.artifacts.get_mut(id).add_link(None, "/");
        self.root = Some(id);
        Ok(id)
    }

    /// Find or create the artifact for an on-disk path. The inode registry
    /// guarantees at most one artifact per inode, so hard links and repeated
    /// lookups converge on the same artifact.
    pub fn filesystem_artifact(
        &mut self,
        path: &Path,
        parent: Option<ArtifactId>,
        name: &str,
    ) -> std::io::Result<ArtifactId> {
        let meta = std::fs::symlink_metadata(path)?;
        let id = self.artifact_from_disk(path, &meta);
        self.artifacts.get_mut(id).add_link(parent, name);
        Ok(id)
    }

    fn artifact_from_disk(&mut self, path: &Path, meta: &std::fs::Metadata) -> ArtifactId {
        use std::os::unix::fs::MetadataExt;
        let key = (meta.dev(), meta.ino());
        if let Some(&id) = self.inodes.get(&key) {
            return id;
        }

        let mut mv = MetadataVersion::new(Metadata::from_fs(meta));
        mv.mtime = (meta.mtime(), meta.mtime_nsec() as u32);
        mv.committed = true;

        let content = if meta.is_dir() {
            let mut dv = DirVersion::existing();
            dv.committed = true;
            Content::Dir {
                versions: vec![dv],
                resolved: HashMap::new(),
            }
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(path).unwrap_or_default();
            let mut sv = SymlinkVersion::new(target);
            sv.committed = true;
            Content::Symlink { versions: vec![sv] }
        } else if meta.is_file() {
            let mut cv = FileVersion::new();
            cv.committed = true;
            Content::File { versions: vec![cv] }
        } else {
            // Device nodes, sockets, fifos on disk.
            let mut cv = FileVersion::new();
            cv.committed = true;
            Content::Special { versions: vec![cv] }
        };

        let id = self.artifacts.push(Artifact::new(content, mv));
        self.inodes.insert(key, id);
        id
    }

    /* ---- anonymous artifacts ---- */

    fn manufactured(&self, mode: u32) -> MetadataVersion {
        let meta = Metadata {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            mode,
        };
        MetadataVersion::new(meta)
    }

    pub fn create_file(
        &mut self,
        creator: Option<CommandId>,
        mode: u16,
        committed: bool,
    ) -> ArtifactId {
        let mut mv = self.manufactured(libc::S_IFREG | (mode as u32 & !current_umask()));
        mv.creator = creator;
        mv.committed = committed;
        let mut cv = FileVersion::empty();
        cv.creator = creator;
        cv.committed = committed;
        self.artifacts
            .push(Artifact::new(Content::File { versions: vec![cv] }, mv))
    }

    pub fn create_dir(
        &mut self,
        creator: Option<CommandId>,
        mode: u16,
        committed: bool,
    ) -> ArtifactId {
        let mut mv = self.manufactured(libc::S_IFDIR | (mode as u32 & !current_umask()));
        mv.creator = creator;
        mv.committed = committed;
        let mut dv = DirVersion::created();
        dv.creator = creator;
        dv.committed = committed;
        self.artifacts.push(Artifact::new(
            Content::Dir {
                versions: vec![dv],
                resolved: HashMap::new(),
            },
            mv,
        ))
    }

    pub fn create_symlink(&mut self, creator: Option<CommandId>, target: PathBuf) -> ArtifactId {
        let mut mv = self.manufactured(libc::S_IFLNK | 0o777);
        mv.creator = creator;
        let mut sv = SymlinkVersion::new(target);
        sv.creator = creator;
        self.artifacts
            .push(Artifact::new(Content::Symlink { versions: vec![sv] }, mv))
    }

    pub fn create_pipe(&mut self, creator: Option<CommandId>) -> ArtifactId {
        let mut mv = self.manufactured(libc::S_IFIFO | 0o600);
        mv.creator = creator;
        mv.committed = true;
        let mut cv = FileVersion::empty();
        cv.creator = creator;
        cv.committed = true;
        self.artifacts
            .push(Artifact::new(Content::Pipe { versions: vec![cv] }, mv))
    }

    /* ---- paths ---- */

    /// The on-disk path for an artifact, following its first link edge up to
    /// the root. Anonymous artifacts have none.
    pub fn path_of(&self, id: ArtifactId) -> Option<PathBuf> {
        let (parent, name) = self.artifacts.get(id).links.first()?;
        match parent {
            // A parentless link names an absolute anchor ("/" for the root).
            None => Some(PathBuf::from(name)),
            Some(p) => {
                let mut path = self.path_of(*p)?;
                path.push(name);
                Some(path)
            }
        }
    }

    /// Allocate a fresh path under the tool's temporary directory.
    pub fn temp_path(&mut self) -> std::io::Result<PathBuf> {
        let tmp = self.tmp_dir();
        std::fs::create_dir_all(&tmp)?;
        loop {
            let candidate = tmp.join(self.next_temp.to_string());
            self.next_temp += 1;
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    /* ---- directory entries ---- */

    /// Look up `name` in a directory artifact, per the version-stack scan.
    pub fn dir_get_entry(&mut self, dir: ArtifactId, name: &str) -> DirEntry {
        if !self.artifacts.get(dir).is_dir() {
            return DirEntry::NotADir;
        }
        if name == "." {
            return DirEntry::Found {
                artifact: dir,
                version: None,
            };
        }

        let dir_path = self.path_of(dir);
        let (answer, version) = self
            .artifacts
            .get_mut(dir)
            .dir_lookup(dir_path.as_deref(), name);

        if answer != Lookup::Yes {
            return DirEntry::Missing { version };
        }

        // Resolved-entry cache first.
        if let Some(artifact) = self.artifacts.get(dir).cached_entry(name) {
            return DirEntry::Found { artifact, version };
        }

        // The deciding version may carry the target directly.
        let known = version.and_then(|idx| {
            self.artifacts.get(dir).dir_versions().unwrap()[idx].entry_artifact(name)
        });
        let artifact = match known {
            Some(a) => a,
            None => {
                // Ask the filesystem; this can discover a new inode.
                let full = match &dir_path {
                    Some(dp) => dp.join(name),
                    None => return DirEntry::Missing { version },
                };
                match self.filesystem_artifact(&full, Some(dir), name) {
                    Ok(a) => a,
                    Err(_) => return DirEntry::Missing { version },
                }
            }
        };
        self.artifacts.get_mut(dir).cache_entry(name, artifact);
        DirEntry::Found { artifact, version }
    }

    /// The parent directory of an artifact via its first link, or the
    /// artifact itself at the root.
    pub fn parent_of(&self, id: ArtifactId) -> ArtifactId {
        match self.artifacts.get(id).links.first() {
            Some((Some(parent), _)) => *parent,
            _ => id,
        }
    }

    /* ---- final state ---- */

    /// Lazily fingerprint the current committed content of a file artifact.
    pub fn fingerprint_current(&mut self, id: ArtifactId) {
        let path = match self.path_of(id) {
            Some(p) => p,
            None => return,
        };
        let art = self.artifacts.get_mut(id);
        if let Some(versions) = art.file_versions_mut() {
            if let Some(cur) = versions.last_mut() {
                if cur.committed && cur.fingerprint.is_none() {
                    let _ = cur.fingerprint(&path);
                }
            }
        }
    }

    /// Compare every artifact's newest produced state against the disk,
    /// reporting mismatches. Versions found to already match are marked
    /// committed so the commit engine skips them.
    pub fn check_final_state(&mut self, cache: &Cache, obs: &mut dyn BuildObserver) {
        for id in self.artifacts.ids().collect::<Vec<_>>() {
            let path = match self.path_of(id) {
                Some(p) => p,
                None => continue,
            };
            self.check_artifact_final_state(id, &path, cache, obs);
        }
    }

    fn check_artifact_final_state(
        &mut self,
        id: ArtifactId,
        path: &Path,
        cache: &Cache,
        obs: &mut dyn BuildObserver,
    ) {
        // Content.
        let art = self.artifacts.get_mut(id);
        match &mut art.content {
            Content::File { versions } => {
                if let Some(cur) = versions.last_mut() {
                    if !cur.committed {
                        let ondisk = Fingerprint::of_path(path).ok();
                        let matches = match (&cur.fingerprint, &ondisk) {
                            (Some(want), Some(have)) => want.same_content(have),
                            _ => false,
                        };
                        if matches {
                            cur.committed = true;
                        } else {
                            let can_stage = cur.saved
                                && cur
                                    .fingerprint
                                    .map(|fp| cache.has(fp.digest))
                                    .unwrap_or(false);
                            obs.final_mismatch(id, cur.creator, can_stage);
                        }
                    }
                }
            }
            Content::Symlink { versions } => {
                if let Some(cur) = versions.last_mut() {
                    if !cur.committed {
                        match std::fs::read_link(path) {
                            Ok(target) if target == cur.target => cur.committed = true,
                            // Symlink targets are always carried, so they can
                            // always be staged back in.
                            _ => obs.final_mismatch(id, cur.creator, true),
                        }
                    }
                }
            }
            Content::Dir { versions, .. } => {
                for v in versions.iter_mut() {
                    if v.committed {
                        continue;
                    }
                    let holds = match &v.state {
                        DirState::Created => path.is_dir(),
                        DirState::AddEntry { name, .. } => path.join(name).symlink_metadata().is_ok(),
                        DirState::RemoveEntry { name } => {
                            path.join(name).symlink_metadata().is_err()
                        }
                        DirState::Existing { .. } | DirState::Listed { .. } => true,
                    };
                    if holds {
                        v.committed = true;
                    } else {
                        // Directory operations can always be replayed.
                        obs.final_mismatch(id, v.creator, true);
                    }
                }
            }
            Content::Pipe { .. } | Content::Special { .. } => {}
        }

        // Metadata.
        let cur = self.artifacts.get_mut(id).metadata.last_mut().unwrap();
        if !cur.committed {
            match std::fs::symlink_metadata(path) {
                Ok(meta) if Metadata::from_fs(&meta).matches(&cur.meta) => cur.committed = true,
                // Metadata is cheap enough to always carry.
                _ => obs.final_mismatch(id, cur.creator, true),
            }
        }
    }

    /// Save the content of every fingerprintable file into the cache so a
    /// later build can stage it back without rerunning its producer.
    pub fn save_all(&mut self, cache: &Cache) {
        for id in self.artifacts.ids().collect::<Vec<_>>() {
            let path = match self.path_of(id) {
                Some(p) => p,
                None => continue,
            };
            self.fingerprint_current(id);
            let art = self.artifacts.get_mut(id);
            if let Some(versions) = art.file_versions_mut() {
                if let Some(cur) = versions.last_mut() {
                    if cur.committed && !cur.saved {
                        if let Some(fp) = cur.fingerprint {
                            if cache.save(&path, fp.digest).is_ok() {
                                cur.saved = true;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_in(dir: &Path) -> Env {
        Env::new(dir.join(".rkr"))
    }

    #[test]
    fn one_artifact_per_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let link = tmp.path().join("hard");
        std::fs::hard_link(&file, &link).unwrap();

        let mut env = env_in(tmp.path());
        let a = env.filesystem_artifact(&file, None, "f").unwrap();
        let b = env.filesystem_artifact(&link, None, "hard").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn temp_paths_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = env_in(tmp.path());
        let a = env.temp_path().unwrap();
        std::fs::write(&a, "").unwrap();
        let b = env.temp_path().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn dir_entries_resolve_through_the_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("present"), "hello").unwrap();

        let mut env = env_in(tmp.path());
        let anchor = tmp.path().to_string_lossy().into_owned();
        let dir = env
            .filesystem_artifact(tmp.path(), None, &anchor)
            .unwrap();
        assert_eq!(env.path_of(dir).unwrap(), tmp.path());

        match env.dir_get_entry(dir, ".") {
            DirEntry::Found { artifact, .. } => assert_eq!(artifact, dir),
            _ => panic!("dot lookup failed"),
        }
        let found = match env.dir_get_entry(dir, "present") {
            DirEntry::Found { artifact, .. } => artifact,
            _ => panic!("entry should exist"),
        };
        assert_eq!(env.path_of(found).unwrap(), tmp.path().join("present"));

        match env.dir_get_entry(dir, "missing") {
            DirEntry::Missing { .. } => {}
            _ => panic!("entry should be absent"),
        }

        // Lookups are cached: the same artifact comes back.
        match env.dir_get_entry(dir, "present") {
            DirEntry::Found { artifact, .. } => assert_eq!(artifact, found),
            _ => panic!("cached lookup failed"),
        }
    }
}
