//! The commit engine: reconciles in-memory artifact state with the
//! filesystem at the end of a build. Directories are materialized before
//! their entries, extra hard links after primary content, and unlinks are
//! deferred to the very end so a rename-over-rename sequence cannot lose
//! data.

use std::path::PathBuf;

use anyhow::Context;

use crate::artifact::Content;
use crate::cache::Cache;
use crate::env::{ArtifactId, Env};
use crate::version::DirState;

/// Commit every uncommitted version to disk. Idempotent: a second call
/// performs no filesystem mutations.
pub fn commit_all(env: &mut Env, cache: &Cache) -> anyhow::Result<()> {
    // Shallow paths first, so parent directories exist before their entries.
    let mut ordered: Vec<(usize, PathBuf, ArtifactId)> = Vec::new();
    for id in env.artifacts.ids() {
        if let Some(path) = env.path_of(id) {
            ordered.push((path.components().count(), path, id));
        }
    }
    ordered.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    // Directories, then file and symlink content, then metadata.
    for (_, path, id) in &ordered {
        commit_dirs(env, id, path)?;
    }
    for (_, path, id) in &ordered {
        commit_content(env, cache, id, path)?;
        commit_metadata(env, id, path)?;
    }

    // Secondary hard links.
    for (_, path, id) in &ordered {
        let extra: Vec<(ArtifactId, String)> = env
            .artifacts
            .get(*id)
            .links
            .iter()
            .skip(1)
            .filter_map(|(p, n)| p.map(|p| (p, n.clone())))
            .collect();
        for (parent, name) in extra {
            if let Some(parent_path) = env.path_of(parent) {
                let link = parent_path.join(&name);
                if std::fs::symlink_metadata(&link).is_err() {
                    std::fs::hard_link(path, &link)
                        .with_context(|| format!("link {:?} -> {:?}", link, path))?;
                }
            }
        }
    }

    // Deferred unlinks, then settle the partial-version bookkeeping.
    for (_, path, id) in &ordered {
        let art = self_dir_ops(env, id);
        for (idx, state) in art {
            let holds = match &state {
                DirState::RemoveEntry { name } => {
                    let victim = path.join(name);
                    match std::fs::symlink_metadata(&victim) {
                        Ok(meta) if meta.is_dir() => {
                            std::fs::remove_dir_all(&victim)
                                .with_context(|| format!("unlink {:?}", victim))?;
                            true
                        }
                        Ok(_) => {
                            std::fs::remove_file(&victim)
                                .with_context(|| format!("unlink {:?}", victim))?;
                            true
                        }
                        Err(_) => true,
                    }
                }
                DirState::AddEntry { name, .. } => path.join(name).symlink_metadata().is_ok(),
                _ => true,
            };
            if holds {
                if let Some(versions) = env.artifacts.get_mut(*id).dir_versions_mut() {
                    versions[idx].committed = true;
                }
            }
        }
    }

    Ok(())
}

/// Uncommitted directory-version operations for one artifact.
fn self_dir_ops(env: &Env, id: &ArtifactId) -> Vec<(usize, DirState)> {
    match env.artifacts.get(*id).dir_versions() {
        Some(versions) => versions
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.committed)
            .map(|(i, v)| (i, v.state.clone()))
            .collect(),
        None => Vec::new(),
    }
}

fn commit_dirs(env: &mut Env, id: &ArtifactId, path: &PathBuf) -> anyhow::Result<()> {
    let pending: Vec<usize> = match env.artifacts.get(*id).dir_versions() {
        Some(versions) => versions
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.committed)
            .map(|(i, _)| i)
            .collect(),
        None => return Ok(()),
    };
    for idx in pending {
        let state = env.artifacts.get(*id).dir_versions().unwrap()[idx].state.clone();
        let done = match state {
            DirState::Created => {
                std::fs::create_dir_all(path).with_context(|| format!("mkdir {:?}", path))?;
                true
            }
            // Baselines and listings describe state that is already real.
            DirState::Existing { .. } | DirState::Listed { .. } => true,
            // Links settle once their target's content lands; unlinks are
            // deferred. Both are finalized in the last pass.
            DirState::AddEntry { .. } | DirState::RemoveEntry { .. } => false,
        };
        if done {
            env.artifacts.get_mut(*id).dir_versions_mut().unwrap()[idx].committed = true;
        }
    }
    Ok(())
}

fn commit_content(env: &mut Env, cache: &Cache, id: &ArtifactId, path: &PathBuf) -> anyhow::Result<()> {
    enum Pending {
        File(crate::version::FileVersion),
        Symlink(crate::version::SymlinkVersion),
        Settled,
        Nothing,
    }

    let pending = match &env.artifacts.get(*id).content {
        Content::File { versions } => match versions.last() {
            Some(v) if !v.committed => Pending::File(v.clone()),
            Some(_) => Pending::Settled,
            None => Pending::Nothing,
        },
        Content::Symlink { versions } => match versions.last() {
            Some(v) if !v.committed => Pending::Symlink(v.clone()),
            Some(_) => Pending::Settled,
            None => Pending::Nothing,
        },
        // Pipes and special files have no on-disk content to write.
        Content::Pipe { .. } | Content::Special { .. } => Pending::Settled,
        Content::Dir { .. } => Pending::Nothing,
    };

    match pending {
        Pending::File(cur) => {
            let ondisk = crate::hash::Fingerprint::of_path(path).ok();
            let already = match (&cur.fingerprint, &ondisk) {
                (Some(want), Some(have)) => want.same_content(have),
                _ => false,
            };
            if !already {
                let fp = cur.fingerprint.with_context(|| {
                    format!("cannot commit unfingerprinted content for {:?}", path)
                })?;
                if !(cur.saved && cache.has(fp.digest)) {
                    anyhow::bail!("no saved content to commit for {:?}", path);
                }
                let tmp = env.temp_path()?;
                cache
                    .stage(fp.digest, path, &tmp)
                    .with_context(|| format!("stage {:?}", path))?;
            }
        }
        Pending::Symlink(cur) => match std::fs::read_link(path) {
            Ok(target) if target == cur.target => {}
            other => {
                if other.is_ok() || path.symlink_metadata().is_ok() {
                    std::fs::remove_file(path).with_context(|| format!("replace {:?}", path))?;
                }
                std::os::unix::fs::symlink(&cur.target, path)
                    .with_context(|| format!("symlink {:?}", path))?;
            }
        },
        Pending::Settled => {}
        Pending::Nothing => return Ok(()),
    }

    // The newest version is on disk; older ones are superseded by it.
    match &mut env.artifacts.get_mut(*id).content {
        Content::File { versions }
        | Content::Pipe { versions }
        | Content::Special { versions } => {
            for v in versions.iter_mut() {
                v.committed = true;
            }
        }
        Content::Symlink { versions } => {
            for v in versions.iter_mut() {
                v.committed = true;
            }
        }
        Content::Dir { .. } => {}
    }
    Ok(())
}

fn commit_metadata(env: &mut Env, id: &ArtifactId, path: &PathBuf) -> anyhow::Result<()> {
    let cur = env.artifacts.get(*id).current_metadata().clone();
    if !cur.committed {
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            let on_disk = crate::version::Metadata::from_fs(&meta);
            if on_disk.mode & 0o7777 != cur.meta.mode & 0o7777 && !meta.file_type().is_symlink() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    path,
                    std::fs::Permissions::from_mode(cur.meta.mode & 0o7777),
                )
                .with_context(|| format!("chmod {:?}", path))?;
            }
            // Ownership changes need privileges the build tool does not
            // assume; the mode is what we reconcile.
        }
    }
    for v in env.artifacts.get_mut(*id).metadata.iter_mut() {
        v.committed = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Digest, Fingerprint};
    use crate::version::FileVersion;

    fn env_and_cache(root: &std::path::Path) -> (Env, Cache) {
        let env = Env::new(root.join(".rkr"));
        let cache = Cache::new(root.join(".rkr/cache"));
        (env, cache)
    }

    #[test]
    fn staged_content_lands_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, cache) = env_and_cache(tmp.path());

        // Seed the cache with a blob.
        let seed = tmp.path().join("seed");
        std::fs::write(&seed, "built output").unwrap();
        let digest = Digest::of_file(&seed).unwrap();
        cache.save(&seed, digest).unwrap();

        // A file artifact whose newest version is saved but not on disk.
        let anchor = tmp.path().to_string_lossy().into_owned();
        let dir = env.filesystem_artifact(tmp.path(), None, &anchor).unwrap();
        let file = env.create_file(None, 0o644, false);
        env.artifacts.get_mut(file).add_link(Some(dir), "out");
        let mut v = FileVersion::with_fingerprint(Fingerprint {
            digest,
            size: 12,
            mtime: (0, 0),
        });
        v.saved = true;
        *env.artifacts.get_mut(file).file_versions_mut().unwrap() = vec![v];

        commit_all(&mut env, &cache).unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("out")).unwrap(),
            b"built output"
        );
    }

    /// Committing twice must not touch the filesystem the second time.
    #[test]
    fn commit_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, cache) = env_and_cache(tmp.path());

        let seed = tmp.path().join("seed");
        std::fs::write(&seed, "content").unwrap();
        let digest = Digest::of_file(&seed).unwrap();
        cache.save(&seed, digest).unwrap();

        let anchor = tmp.path().to_string_lossy().into_owned();
        let dir = env.filesystem_artifact(tmp.path(), None, &anchor).unwrap();
        let file = env.create_file(None, 0o644, false);
        env.artifacts.get_mut(file).add_link(Some(dir), "out");
        let mut v = FileVersion::with_fingerprint(Fingerprint {
            digest,
            size: 7,
            mtime: (0, 0),
        });
        v.saved = true;
        *env.artifacts.get_mut(file).file_versions_mut().unwrap() = vec![v];

        commit_all(&mut env, &cache).unwrap();
        let mtime_after_first = std::fs::metadata(tmp.path().join("out")).unwrap().modified().unwrap();

        commit_all(&mut env, &cache).unwrap();
        let mtime_after_second = std::fs::metadata(tmp.path().join("out")).unwrap().modified().unwrap();
        assert_eq!(mtime_after_first, mtime_after_second);
    }

    #[test]
    fn created_dirs_and_unlinks_are_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut env, cache) = env_and_cache(tmp.path());
        std::fs::write(tmp.path().join("stale"), "old").unwrap();

        let anchor = tmp.path().to_string_lossy().into_owned();
        let dir = env.filesystem_artifact(tmp.path(), None, &anchor).unwrap();

        // The build created a subdirectory and removed a stale file.
        let sub = env.create_dir(None, 0o755, false);
        env.artifacts.get_mut(sub).add_link(Some(dir), "sub");
        env.artifacts.get_mut(dir).push_dir_version(crate::version::DirVersion {
            state: DirState::AddEntry {
                name: "sub".into(),
                target: sub,
            },
            creator: None,
            committed: false,
        });
        env.artifacts.get_mut(dir).push_dir_version(crate::version::DirVersion {
            state: DirState::RemoveEntry {
                name: "stale".into(),
            },
            creator: None,
            committed: false,
        });

        commit_all(&mut env, &cache).unwrap();
        assert!(tmp.path().join("sub").is_dir());
        assert!(!tmp.path().join("stale").exists());
        assert!(env.artifacts.get(dir).fully_committed());
    }
}
