//! The content cache: saved file versions addressed by digest, letting a
//! later build stage a version in without rerunning its producer.

use std::path::{Path, PathBuf};

use crate::hash::Digest;

pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: PathBuf) -> Cache {
        Cache { root }
    }

    fn blob_path(&self, digest: Digest) -> PathBuf {
        self.root.join(digest.to_hex())
    }

    pub fn has(&self, digest: Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Copy the file at `path` into the cache under `digest`. A blob that is
    /// already present is left alone.
    pub fn save(&self, path: &Path, digest: Digest) -> std::io::Result<()> {
        let dest = self.blob_path(digest);
        if dest.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.root)?;
        // Write to a sibling temp name and rename, so a partial copy is
        // never visible under the digest.
        let tmp = self.root.join(format!("{}.part", digest.to_hex()));
        std::fs::copy(path, &tmp)?;
        std::fs::rename(&tmp, &dest)?;
        Ok(())
    }

    /// Materialize the blob for `digest` at `dest`, atomically.
    pub fn stage(&self, digest: Digest, dest: &Path, tmp: &Path) -> std::io::Result<()> {
        let blob = self.blob_path(digest);
        if !blob.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no cached blob for {}", digest.to_hex()),
            ));
        }
        std::fs::copy(&blob, tmp)?;
        std::fs::rename(tmp, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_stage_reproduces_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"));

        let src = dir.path().join("src");
        std::fs::write(&src, "payload").unwrap();
        let digest = Digest::of_file(&src).unwrap();

        cache.save(&src, digest).unwrap();
        assert!(cache.has(digest));

        let out = dir.path().join("out");
        let tmp = dir.path().join("tmp0");
        cache.stage(digest, &out, &tmp).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"payload");
        // The staging temp file does not linger.
        assert!(!tmp.exists());
    }

    #[test]
    fn staging_a_missing_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("cache"));
        let digest = Digest::of_bytes(b"never stored");
        let err = cache
            .stage(digest, &dir.path().join("out"), &dir.path().join("t"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
