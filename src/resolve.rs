//! Path resolution: walking a symbolic reference from a base directory to an
//! artifact, honoring partial directory versions, create/exclusive/truncate
//! flags, and symlink chains.
//!
//! Permissions are recorded in the flags but never enforced here; an Access
//! error can only come from the trace expecting one.

use std::path::{Component, Path};

use crate::command::Resolution;
use crate::env::{ArtifactId, DirEntry, Env};
use crate::flags::{AccessFlags, ResultCode};
use crate::ir::CommandId;
use crate::observer::{BuildObserver, InputKind, VersionInfo};
use crate::version::FileVersion;

pub struct Resolver<'a> {
    pub env: &'a mut Env,
    pub obs: &'a mut dyn BuildObserver,
    pub symlink_limit: usize,
}

impl<'a> Resolver<'a> {
    /// Resolve `path` relative to `base`, which must be a directory.
    pub fn resolve(
        &mut self,
        c: CommandId,
        base: Resolution,
        path: &Path,
        flags: &AccessFlags,
    ) -> Resolution {
        let base = match base {
            Resolution::Artifact(a) => a,
            Resolution::Err(code) => return Resolution::Err(code),
            Resolution::Pending => return Resolution::Err(ResultCode::Invalid),
        };
        if !self.env.artifacts.get(base).is_dir() {
            return Resolution::Err(ResultCode::NotDir);
        }

        let mut cur = base;
        // Remaining components, last first so expansion pushes cheaply.
        let mut stack: Vec<String> = Vec::new();
        if !self.push_components(&mut cur, path, &mut stack) {
            return Resolution::Err(ResultCode::Invalid);
        }
        let mut followed = 0usize;

        while let Some(name) = stack.pop() {
            let last = stack.is_empty();
            match name.as_str() {
                "." => {
                    if last {
                        return self.finish(c, cur, flags);
                    }
                }
                ".." => {
                    cur = self.env.parent_of(cur);
                    if last {
                        return self.finish(c, cur, flags);
                    }
                }
                _ => match self.env.dir_get_entry(cur, &name) {
                    DirEntry::NotADir => return Resolution::Err(ResultCode::NotDir),
                    DirEntry::Missing { version } => {
                        self.record_dir_input(c, cur, version);
                        if last && flags.create {
                            return self.create_entry(c, cur, &name, flags);
                        }
                        return Resolution::Err(ResultCode::NotFound);
                    }
                    DirEntry::Found { artifact, version } => {
                        self.record_dir_input(c, cur, version);

                        if last && flags.create && flags.exclusive {
                            return Resolution::Err(ResultCode::Exists);
                        }

                        let is_symlink = self.env.artifacts.get(artifact).is_symlink();
                        if is_symlink && (!last || !flags.nofollow) {
                            followed += 1;
                            if followed > self.symlink_limit {
                                return Resolution::Err(ResultCode::Loop);
                            }
                            let target = match self.read_symlink(c, artifact) {
                                Some(t) => t,
                                None => return Resolution::Err(ResultCode::NotFound),
                            };
                            if !self.push_components(&mut cur, &target, &mut stack) {
                                return Resolution::Err(ResultCode::Invalid);
                            }
                            if stack.is_empty() {
                                // Link to "." or equivalent.
                                return self.finish(c, cur, flags);
                            }
                            continue;
                        }

                        if last {
                            return self.finish(c, artifact, flags);
                        }
                        if !self.env.artifacts.get(artifact).is_dir() {
                            return Resolution::Err(ResultCode::NotDir);
                        }
                        cur = artifact;
                    }
                },
            }
        }

        // Empty path: the reference names the base itself.
        self.finish(c, cur, flags)
    }

    /// Append `path`'s components to the walk stack, rebasing to the root for
    /// absolute paths.
    fn push_components(&mut self, cur: &mut ArtifactId, path: &Path, stack: &mut Vec<String>) -> bool {
        let mut components = Vec::new();
        for comp in path.components() {
            match comp {
                Component::RootDir => {
                    match self.env.root_dir() {
                        Ok(root) => *cur = root,
                        Err(_) => return false,
                    }
                    components.clear();
                }
                Component::CurDir => components.push(".".to_string()),
                Component::ParentDir => components.push("..".to_string()),
                Component::Normal(name) => match name.to_str() {
                    Some(s) => components.push(s.to_string()),
                    None => return false,
                },
                Component::Prefix(_) => return false,
            }
        }
        for comp in components.into_iter().rev() {
            stack.push(comp);
        }
        true
    }

    /// Final-component bookkeeping: kind checks and truncation.
    fn finish(&mut self, c: CommandId, artifact: ArtifactId, flags: &AccessFlags) -> Resolution {
        let art = self.env.artifacts.get(artifact);
        if flags.directory && !art.is_dir() {
            return Resolution::Err(ResultCode::NotDir);
        }
        if flags.truncate {
            if let crate::artifact::Content::File { .. } = art.content {
                let mut v = FileVersion::empty();
                v.creator = Some(c);
                self.env.artifacts.get_mut(artifact).push_file_version(v);
                self.obs.output(c, artifact);
            }
        }
        Resolution::Artifact(artifact)
    }

    /// Create the missing final entry: a file, or a directory when the
    /// reference asked for one.
    fn create_entry(
        &mut self,
        c: CommandId,
        dir: ArtifactId,
        name: &str,
        flags: &AccessFlags,
    ) -> Resolution {
        let new = if flags.directory {
            self.env.create_dir(Some(c), flags.mode, false)
        } else {
            self.env.create_file(Some(c), flags.mode, false)
        };
        let v = crate::version::DirVersion {
            state: crate::version::DirState::AddEntry {
                name: name.to_string(),
                target: new,
            },
            creator: Some(c),
            committed: false,
        };
        self.env.artifacts.get_mut(dir).push_dir_version(v);
        self.env.artifacts.get_mut(new).add_link(Some(dir), name);
        self.obs.output(c, dir);
        self.obs.output(c, new);
        Resolution::Artifact(new)
    }

    /// Read a symlink's target, recording the content input.
    fn read_symlink(&mut self, c: CommandId, link: ArtifactId) -> Option<std::path::PathBuf> {
        let version = self.env.artifacts.get(link).current_symlink()?;
        let info = VersionInfo {
            creator: version.creator,
            can_stage: true,
        };
        let target = version.target.clone();
        self.obs.input(c, link, info, InputKind::PathResolution);
        Some(target)
    }

    fn record_dir_input(&mut self, c: CommandId, dir: ArtifactId, version: Option<usize>) {
        let idx = match version {
            Some(idx) => idx,
            None => return,
        };
        let creator = self.env.artifacts.get(dir).dir_versions().unwrap()[idx].creator;
        self.obs.input(
            c,
            dir,
            VersionInfo {
                creator,
                can_stage: true,
            },
            InputKind::PathResolution,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;

    fn setup(tmp: &Path) -> (Env, ArtifactId) {
        let mut env = Env::new(tmp.join(".rkr"));
        let anchor = tmp.to_string_lossy().into_owned();
        let base = env.filesystem_artifact(tmp, None, &anchor).unwrap();
        (env, base)
    }

    fn resolve(env: &mut Env, base: ArtifactId, path: &str, flags: AccessFlags) -> Resolution {
        let mut obs = NullObserver;
        let mut r = Resolver {
            env,
            obs: &mut obs,
            symlink_limit: 40,
        };
        r.resolve(
            CommandId(0),
            Resolution::Artifact(base),
            Path::new(path),
            &flags,
        )
    }

    #[test]
    fn resolves_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/f"), "x").unwrap();

        let (mut env, base) = setup(tmp.path());
        let flags = AccessFlags {
            r: true,
            ..AccessFlags::default()
        };
        match resolve(&mut env, base, "sub/f", flags) {
            Resolution::Artifact(a) => {
                assert_eq!(env.path_of(a).unwrap(), tmp.path().join("sub/f"))
            }
            other => panic!("expected artifact, got {:?}", other),
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        let (mut env, base) = setup(tmp.path());
        let flags = AccessFlags::default();
        let a = resolve(&mut env, base, "f", flags);
        let b = resolve(&mut env, base, "f", flags);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_path_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, base) = setup(tmp.path());
        match resolve(&mut env, base, "nope", AccessFlags::default()) {
            Resolution::Err(ResultCode::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn create_makes_a_file_and_links_it() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, base) = setup(tmp.path());
        let flags = AccessFlags {
            w: true,
            create: true,
            mode: 0o644,
            ..AccessFlags::default()
        };
        let created = match resolve(&mut env, base, "new", flags) {
            Resolution::Artifact(a) => a,
            other => panic!("expected artifact, got {:?}", other),
        };
        // Subsequent lookups see the uncommitted entry.
        match resolve(&mut env, base, "new", AccessFlags::default()) {
            Resolution::Artifact(a) => assert_eq!(a, created),
            other => panic!("expected artifact, got {:?}", other),
        }
    }

    /// Two exclusive creates of the same path: the first succeeds, the
    /// second reports that the file exists.
    #[test]
    fn exclusive_create_of_existing_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, base) = setup(tmp.path());
        let flags = AccessFlags {
            w: true,
            create: true,
            exclusive: true,
            mode: 0o644,
            ..AccessFlags::default()
        };
        assert!(matches!(
            resolve(&mut env, base, "x", flags),
            Resolution::Artifact(_)
        ));
        assert_eq!(
            resolve(&mut env, base, "x", flags),
            Resolution::Err(ResultCode::Exists)
        );
    }

    #[test]
    fn intermediate_file_is_not_a_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), "").unwrap();
        let (mut env, base) = setup(tmp.path());
        assert_eq!(
            resolve(&mut env, base, "f/x", AccessFlags::default()),
            Resolution::Err(ResultCode::NotDir)
        );
    }

    #[test]
    fn symlinks_are_followed() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("real"), "content").unwrap();
        std::os::unix::fs::symlink("real", tmp.path().join("link")).unwrap();

        let (mut env, base) = setup(tmp.path());
        let through = match resolve(&mut env, base, "link", AccessFlags::default()) {
            Resolution::Artifact(a) => a,
            other => panic!("expected artifact, got {:?}", other),
        };
        let direct = match resolve(&mut env, base, "real", AccessFlags::default()) {
            Resolution::Artifact(a) => a,
            other => panic!("expected artifact, got {:?}", other),
        };
        assert_eq!(through, direct);

        // nofollow resolves to the link artifact itself.
        let flags = AccessFlags {
            nofollow: true,
            ..AccessFlags::default()
        };
        let link = match resolve(&mut env, base, "link", flags) {
            Resolution::Artifact(a) => a,
            other => panic!("expected artifact, got {:?}", other),
        };
        assert_ne!(link, direct);
        assert!(env.artifacts.get(link).is_symlink());
    }

    /// A two-link cycle must resolve to Loop, not hang.
    #[test]
    fn symlink_cycle_is_a_loop() {
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("b", tmp.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", tmp.path().join("b")).unwrap();

        let (mut env, base) = setup(tmp.path());
        assert_eq!(
            resolve(&mut env, base, "a", AccessFlags::default()),
            Resolution::Err(ResultCode::Loop)
        );
    }

    /// A chain exactly at the limit resolves; one more fails.
    #[test]
    fn symlink_chain_limit_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("end"), "").unwrap();
        // link0 -> link1 -> ... -> link39 -> end: 40 followed links.
        for i in 0..40 {
            let target = if i == 39 {
                "end".to_string()
            } else {
                format!("link{}", i + 1)
            };
            std::os::unix::fs::symlink(&target, tmp.path().join(format!("link{}", i))).unwrap();
        }

        let (mut env, base) = setup(tmp.path());
        assert!(matches!(
            resolve(&mut env, base, "link0", AccessFlags::default()),
            Resolution::Artifact(_)
        ));

        // One extra hop in front pushes the chain over the limit.
        std::os::unix::fs::symlink("link0", tmp.path().join("over")).unwrap();
        assert_eq!(
            resolve(&mut env, base, "over", AccessFlags::default()),
            Resolution::Err(ResultCode::Loop)
        );
    }

    #[test]
    fn dotdot_stops_at_the_walk_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), "").unwrap();
        let (mut env, base) = setup(tmp.path());
        // The base has no parent link, so ".." stays put.
        match resolve(&mut env, base, "../f", AccessFlags::default()) {
            Resolution::Artifact(_) => {}
            other => panic!("expected artifact, got {:?}", other),
        }
    }

    #[test]
    fn truncate_pushes_an_empty_version() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), "old content").unwrap();
        let (mut env, base) = setup(tmp.path());
        let flags = AccessFlags {
            w: true,
            truncate: true,
            ..AccessFlags::default()
        };
        let a = match resolve(&mut env, base, "f", flags) {
            Resolution::Artifact(a) => a,
            other => panic!("expected artifact, got {:?}", other),
        };
        let cur = env.artifacts.get(a).current_file_version().unwrap();
        assert!(!cur.committed);
        assert!(cur
            .fingerprint
            .unwrap()
            .same_content(&crate::hash::Fingerprint::empty()));
    }
}
