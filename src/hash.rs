//! Content digests. A fingerprint (digest + size + mtime) recorded for a file
//! version is what decides whether a command's input changed.

use std::io::Read;
use std::path::Path;

/// A blake3 digest of file contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        Digest(*blake3::hash(bytes).as_bytes())
    }

    pub fn of_file(path: &Path) -> std::io::Result<Digest> {
        let mut f = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 << 10];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(*hasher.finalize().as_bytes()))
    }

    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Snapshot of a file's content identity at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: Digest,
    pub size: u64,
    /// mtime as (seconds, nanoseconds) since the epoch.
    pub mtime: (i64, u32),
}

impl Fingerprint {
    /// The fingerprint of an empty file, known without touching the disk.
    pub fn empty() -> Fingerprint {
        Fingerprint {
            digest: Digest::of_bytes(b""),
            size: 0,
            mtime: (0, 0),
        }
    }

    /// Fingerprint an on-disk file.
    pub fn of_path(path: &Path) -> std::io::Result<Fingerprint> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Fingerprint {
            digest: Digest::of_file(path)?,
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec() as u32),
        })
    }

    /// Two fingerprints identify the same content if their digests and sizes
    /// agree; mtime is advisory only.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.digest == other.digest && self.size == other.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_fingerprint_matches_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();
        let fp = Fingerprint::of_path(&path).unwrap();
        assert!(fp.same_content(&Fingerprint::empty()));
    }

    #[test]
    fn content_changes_change_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "one").unwrap();
        let a = Fingerprint::of_path(&path).unwrap();
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(b"two").unwrap();
        drop(f);
        let b = Fingerprint::of_path(&path).unwrap();
        assert!(!a.same_content(&b));
    }
}
