//! Access flags recorded on path references, and the closed taxonomy of
//! resolution outcomes used throughout the trace.

/// The flags a command specified when it made a path reference. These are
/// recorded, not enforced; resolution only consults the flags that change
/// what a reference does (create, exclusive, truncate, nofollow, directory).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags {
    /// Read access requested.
    pub r: bool,
    /// Write access requested.
    pub w: bool,
    /// Execute/search access requested.
    pub x: bool,
    /// Resolve to the symlink itself rather than its target.
    pub nofollow: bool,
    /// Truncate the artifact's contents on open.
    pub truncate: bool,
    /// Create the artifact if none exists.
    pub create: bool,
    /// Creation must actually happen (with create).
    pub exclusive: bool,
    /// Writes go to the end of the artifact.
    pub append: bool,
    /// The reference must name a directory.
    pub directory: bool,
    /// Permission bits used if this reference creates an artifact.
    pub mode: u16,
}

impl AccessFlags {
    /// Derive flags from the open(2) flags and mode arguments.
    pub fn from_open(flags: i32, mode: u16) -> AccessFlags {
        let acc = flags & libc::O_ACCMODE;
        AccessFlags {
            r: acc == libc::O_RDONLY || acc == libc::O_RDWR,
            w: acc == libc::O_WRONLY || acc == libc::O_RDWR,
            x: false,
            nofollow: flags & libc::O_NOFOLLOW != 0,
            truncate: flags & libc::O_TRUNC != 0,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
            append: flags & libc::O_APPEND != 0,
            directory: flags & libc::O_DIRECTORY != 0,
            mode,
        }
    }

    /// Derive flags from the access(2)/faccessat(2) mode and flags arguments.
    pub fn from_access(mode: i32, flags: i32) -> AccessFlags {
        AccessFlags {
            r: mode & libc::R_OK != 0,
            w: mode & libc::W_OK != 0,
            x: mode & libc::X_OK != 0,
            nofollow: flags & libc::AT_SYMLINK_NOFOLLOW != 0,
            ..AccessFlags::default()
        }
    }

    /// Derive flags from the fstatat(2) flags argument.
    pub fn from_stat(flags: i32) -> AccessFlags {
        AccessFlags {
            nofollow: flags & libc::AT_SYMLINK_NOFOLLOW != 0,
            ..AccessFlags::default()
        }
    }

    /// Pack into a bitfield for the trace encoding.
    pub fn bits(&self) -> u16 {
        let mut b = 0u16;
        for (i, set) in [
            self.r,
            self.w,
            self.x,
            self.nofollow,
            self.truncate,
            self.create,
            self.exclusive,
            self.append,
            self.directory,
        ]
        .iter()
        .enumerate()
        {
            if *set {
                b |= 1 << i;
            }
        }
        b
    }

    pub fn from_bits(b: u16, mode: u16) -> AccessFlags {
        AccessFlags {
            r: b & (1 << 0) != 0,
            w: b & (1 << 1) != 0,
            x: b & (1 << 2) != 0,
            nofollow: b & (1 << 3) != 0,
            truncate: b & (1 << 4) != 0,
            create: b & (1 << 5) != 0,
            exclusive: b & (1 << 6) != 0,
            append: b & (1 << 7) != 0,
            directory: b & (1 << 8) != 0,
            mode,
        }
    }
}

impl std::fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.r { 'r' } else { '-' },
            if self.w { 'w' } else { '-' },
            if self.x { 'x' } else { '-' }
        )?;
        for (set, name) in [
            (self.nofollow, " nofollow"),
            (self.truncate, " truncate"),
            (self.create, " create"),
            (self.exclusive, " exclusive"),
            (self.append, " append"),
            (self.directory, " directory"),
        ] {
            if set {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// The outcome of resolving a reference. This taxonomy is total: POSIX codes
/// we do not model map to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    NotFound,
    Exists,
    NotDir,
    IsDir,
    Loop,
    Access,
    NoSpace,
    Invalid,
    Other(i32),
}

impl ResultCode {
    pub fn from_errno(err: i32) -> ResultCode {
        match err {
            0 => ResultCode::Ok,
            libc::ENOENT => ResultCode::NotFound,
            libc::EEXIST => ResultCode::Exists,
            libc::ENOTDIR => ResultCode::NotDir,
            libc::EISDIR => ResultCode::IsDir,
            libc::ELOOP => ResultCode::Loop,
            libc::EACCES => ResultCode::Access,
            libc::ENOSPC => ResultCode::NoSpace,
            libc::EINVAL => ResultCode::Invalid,
            other => ResultCode::Other(other),
        }
    }

    pub fn to_errno(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::NotFound => libc::ENOENT,
            ResultCode::Exists => libc::EEXIST,
            ResultCode::NotDir => libc::ENOTDIR,
            ResultCode::IsDir => libc::EISDIR,
            ResultCode::Loop => libc::ELOOP,
            ResultCode::Access => libc::EACCES,
            ResultCode::NoSpace => libc::ENOSPC,
            ResultCode::Invalid => libc::EINVAL,
            ResultCode::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::NotFound => "ENOENT",
            ResultCode::Exists => "EEXIST",
            ResultCode::NotDir => "ENOTDIR",
            ResultCode::IsDir => "EISDIR",
            ResultCode::Loop => "ELOOP",
            ResultCode::Access => "EACCES",
            ResultCode::NoSpace => "ENOSPC",
            ResultCode::Invalid => "EINVAL",
            ResultCode::Other(_) => "E?",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResultCode::Other(code) => write!(f, "errno {}", code),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags() {
        let f = AccessFlags::from_open(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, 0o644);
        assert!(f.w && f.create && f.exclusive);
        assert!(!f.r && !f.truncate);
        assert_eq!(f.mode, 0o644);

        let f = AccessFlags::from_open(libc::O_RDWR | libc::O_TRUNC, 0);
        assert!(f.r && f.w && f.truncate);
    }

    #[test]
    fn access_flags() {
        let f = AccessFlags::from_access(libc::R_OK | libc::X_OK, libc::AT_SYMLINK_NOFOLLOW);
        assert!(f.r && f.x && f.nofollow);
        assert!(!f.w && !f.create);
    }

    #[test]
    fn flag_bits_round_trip() {
        let f = AccessFlags::from_open(
            libc::O_RDWR | libc::O_CREAT | libc::O_NOFOLLOW | libc::O_APPEND,
            0o600,
        );
        assert_eq!(AccessFlags::from_bits(f.bits(), f.mode), f);
    }

    #[test]
    fn errno_taxonomy_is_total() {
        for err in [0, libc::ENOENT, libc::EEXIST, libc::ELOOP, libc::EDQUOT, 9999] {
            let code = ResultCode::from_errno(err);
            assert_eq!(code.to_errno(), err);
        }
    }
}
