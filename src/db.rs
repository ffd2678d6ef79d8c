//! Trace persistence: the binary record format under `.rkr/db`, and the
//! default trace used when no readable trace exists.
//!
//! Records are length-prefixed and tagged; command ids are assigned in
//! first-appearance order, so a loaded trace's ids are dense and stable. A
//! trace that fails to parse, or that does not end with the End sentinel,
//! is treated as absent: the engine falls back to a default trace that
//! launches the root build command.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::command::Command;
use crate::densemap::DenseMap;
use crate::flags::{AccessFlags, ResultCode};
use crate::hash::{Digest, Fingerprint};
use crate::ir::{
    CommandId, IRSink, SpecialRef, Step, Trace, VersionSpec, REF_CWD, REF_EXE, REF_ROOT,
    REF_STDERR, REF_STDIN, REF_STDOUT, TOOL_CMD,
};
use crate::version::Metadata;

const MAGIC: &[u8; 4] = b"rkr0";

const TAG_END: u8 = 0;
const TAG_SPECIAL_REF: u8 = 1;
const TAG_PIPE_REF: u8 = 2;
const TAG_FILE_REF: u8 = 3;
const TAG_SYMLINK_REF: u8 = 4;
const TAG_DIR_REF: u8 = 5;
const TAG_PATH_REF: u8 = 6;
const TAG_EXPECT_RESULT: u8 = 7;
const TAG_MATCH_METADATA: u8 = 8;
const TAG_MATCH_CONTENT: u8 = 9;
const TAG_UPDATE_METADATA: u8 = 10;
const TAG_UPDATE_CONTENT: u8 = 11;
const TAG_LAUNCH: u8 = 12;
const TAG_JOIN: u8 = 13;
const TAG_EXIT: u8 = 14;

/// Load the trace at `path`, falling back to the default trace when the file
/// is missing, unparseable, or unterminated.
pub fn load(path: &Path, root_args: &[String]) -> Trace {
    match read(path) {
        Ok(trace) => trace,
        Err(_) => default_trace(root_args),
    }
}

/// The trace constructed when none exists: stdio specials, root, cwd and
/// launch-exe references, then a single launch of the root command.
pub fn default_trace(root_args: &[String]) -> Trace {
    let mut commands = DenseMap::new();
    let tool = commands.push(Command::new(vec!["rkr".to_string()]));
    debug_assert_eq!(tool, TOOL_CMD);

    let mut root_cmd = Command::new(root_args.to_vec());
    let fds = vec![(0, REF_STDIN), (1, REF_STDOUT), (2, REF_STDERR)];
    root_cmd.initial_fds = fds.clone();
    let root = commands.push(root_cmd);

    let specials = [
        (SpecialRef::Stdin, REF_STDIN),
        (SpecialRef::Stdout, REF_STDOUT),
        (SpecialRef::Stderr, REF_STDERR),
        (SpecialRef::Root, REF_ROOT),
        (SpecialRef::Cwd, REF_CWD),
        (SpecialRef::LaunchExe, REF_EXE),
    ];
    let mut steps: Vec<Step> = specials
        .iter()
        .map(|&(entity, out)| Step::SpecialRef {
            cmd: TOOL_CMD,
            entity,
            out,
        })
        .collect();
    steps.push(Step::Launch {
        cmd: TOOL_CMD,
        child: root,
        args: root_args.to_vec(),
        fds,
        refs: vec![
            (REF_ROOT, REF_ROOT),
            (REF_CWD, REF_CWD),
            (REF_EXE, REF_EXE),
            (REF_STDIN, REF_STDIN),
            (REF_STDOUT, REF_STDOUT),
            (REF_STDERR, REF_STDERR),
        ],
    });

    Trace {
        commands,
        steps,
        root,
    }
}

fn read(path: &Path) -> anyhow::Result<Trace> {
    let f = File::open(path)?;
    let mut r = Reader {
        r: BufReader::new(f),
    };

    let mut magic = [0u8; 4];
    r.r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("bad trace magic");
    }

    let mut commands: DenseMap<CommandId, Command> = DenseMap::new();
    let tool = commands.push(Command::new(vec!["rkr".to_string()]));
    debug_assert_eq!(tool, TOOL_CMD);
    let mut root = None;

    let mut steps = Vec::new();
    loop {
        let tag = r.read_u8()?;
        let step = match tag {
            TAG_END => break,
            TAG_SPECIAL_REF => Step::SpecialRef {
                cmd: r.read_cmd()?,
                entity: decode_special(r.read_u8()?)?,
                out: r.read_u32()?,
            },
            TAG_PIPE_REF => Step::PipeRef {
                cmd: r.read_cmd()?,
                read: r.read_u32()?,
                write: r.read_u32()?,
            },
            TAG_FILE_REF => Step::FileRef {
                cmd: r.read_cmd()?,
                mode: r.read_u16()?,
                out: r.read_u32()?,
            },
            TAG_SYMLINK_REF => Step::SymlinkRef {
                cmd: r.read_cmd()?,
                target: PathBuf::from(r.read_str()?),
                out: r.read_u32()?,
            },
            TAG_DIR_REF => Step::DirRef {
                cmd: r.read_cmd()?,
                mode: r.read_u16()?,
                out: r.read_u32()?,
            },
            TAG_PATH_REF => {
                let cmd = r.read_cmd()?;
                let base = r.read_u32()?;
                let path = PathBuf::from(r.read_str()?);
                let bits = r.read_u16()?;
                let mode = r.read_u16()?;
                let out = r.read_u32()?;
                Step::PathRef {
                    cmd,
                    base,
                    path,
                    flags: AccessFlags::from_bits(bits, mode),
                    out,
                }
            }
            TAG_EXPECT_RESULT => Step::ExpectResult {
                cmd: r.read_cmd()?,
                ref_id: r.read_u32()?,
                expected: ResultCode::from_errno(r.read_i32()?),
            },
            TAG_MATCH_METADATA => Step::MatchMetadata {
                cmd: r.read_cmd()?,
                ref_id: r.read_u32()?,
                expected: r.read_metadata()?,
            },
            TAG_MATCH_CONTENT => Step::MatchContent {
                cmd: r.read_cmd()?,
                ref_id: r.read_u32()?,
                expected: r.read_version()?,
            },
            TAG_UPDATE_METADATA => Step::UpdateMetadata {
                cmd: r.read_cmd()?,
                ref_id: r.read_u32()?,
                written: r.read_metadata()?,
            },
            TAG_UPDATE_CONTENT => Step::UpdateContent {
                cmd: r.read_cmd()?,
                ref_id: r.read_u32()?,
                written: r.read_version()?,
            },
            TAG_LAUNCH => {
                let cmd = r.read_cmd()?;
                let child_id = r.read_u32()?;
                let argc = r.read_u32()? as usize;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(r.read_str()?);
                }
                let fd_count = r.read_u32()? as usize;
                let mut fds = Vec::with_capacity(fd_count);
                for _ in 0..fd_count {
                    fds.push((r.read_i32()?, r.read_u32()?));
                }
                let ref_count = r.read_u32()? as usize;
                let mut refs = Vec::with_capacity(ref_count);
                for _ in 0..ref_count {
                    refs.push((r.read_u32()?, r.read_u32()?));
                }

                let mut child_cmd = Command::new(args.clone());
                child_cmd.initial_fds = fds.clone();
                let child = commands.push(child_cmd);
                if child.0 != child_id {
                    bail!("launch record out of order");
                }
                if cmd == TOOL_CMD && root.is_none() {
                    root = Some(child);
                }
                Step::Launch {
                    cmd,
                    child,
                    args,
                    fds,
                    refs,
                }
            }
            TAG_JOIN => Step::Join {
                cmd: r.read_cmd()?,
                child: CommandId(r.read_u32()?),
                exit_status: r.read_i32()?,
            },
            TAG_EXIT => {
                let cmd = r.read_cmd()?;
                let exit_status = r.read_i32()?;
                if commands.lookup(cmd).is_some() {
                    commands.get_mut(cmd).observed_exit = Some(exit_status);
                }
                Step::Exit { cmd, exit_status }
            }
            other => bail!("unknown record tag {}", other),
        };

        // Steps may only reference commands that already appeared.
        if let Some(c) = step.cmd() {
            if commands.lookup(c).is_none() {
                bail!("record references unknown command {}", c.0);
            }
        }
        if let Step::Join { child, .. } = &step {
            if commands.lookup(*child).is_none() {
                bail!("join references unknown command {}", child.0);
            }
        }
        steps.push(step);
    }

    let root = root.context("trace has no root launch")?;
    Ok(Trace {
        commands,
        steps,
        root,
    })
}

struct Reader {
    r: BufReader<File>,
}

impl Reader {
    fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.r.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0u8; 2];
        self.r.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self) -> std::io::Result<i32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i64(&mut self) -> std::io::Result<i64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_cmd(&mut self) -> std::io::Result<CommandId> {
        Ok(CommandId(self.read_u32()?))
    }

    fn read_str(&mut self) -> anyhow::Result<String> {
        let len = self.read_u32()? as usize;
        if len > (1 << 20) {
            bail!("unreasonable string length {}", len);
        }
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    fn read_metadata(&mut self) -> std::io::Result<Metadata> {
        Ok(Metadata {
            uid: self.read_u32()?,
            gid: self.read_u32()?,
            mode: self.read_u32()?,
        })
    }

    fn read_version(&mut self) -> anyhow::Result<VersionSpec> {
        let spec = match self.read_u8()? {
            0 => {
                let has_fp = self.read_u8()? != 0;
                let mut digest = [0u8; 32];
                self.r.read_exact(&mut digest)?;
                let size = self.read_u64()?;
                let mtime = (self.read_i64()?, self.read_u32()?);
                let saved = self.read_u8()? != 0;
                VersionSpec::File {
                    fingerprint: has_fp.then_some(Fingerprint {
                        digest: Digest(digest),
                        size,
                        mtime,
                    }),
                    saved,
                }
            }
            1 => VersionSpec::Symlink {
                target: PathBuf::from(self.read_str()?),
            },
            2 => {
                let count = self.read_u32()? as usize;
                let mut entries = std::collections::BTreeSet::new();
                for _ in 0..count {
                    entries.insert(self.read_str()?);
                }
                VersionSpec::DirListed { entries }
            }
            3 => VersionSpec::DirCreated,
            4 => VersionSpec::DirAdd {
                name: self.read_str()?,
                target: self.read_u32()?,
            },
            5 => VersionSpec::DirRemove {
                name: self.read_str()?,
            },
            other => bail!("unknown version tag {}", other),
        };
        Ok(spec)
    }
}

fn decode_special(b: u8) -> anyhow::Result<SpecialRef> {
    Ok(match b {
        0 => SpecialRef::Stdin,
        1 => SpecialRef::Stdout,
        2 => SpecialRef::Stderr,
        3 => SpecialRef::Root,
        4 => SpecialRef::Cwd,
        5 => SpecialRef::LaunchExe,
        other => bail!("unknown special ref {}", other),
    })
}

fn encode_special(s: SpecialRef) -> u8 {
    match s {
        SpecialRef::Stdin => 0,
        SpecialRef::Stdout => 1,
        SpecialRef::Stderr => 2,
        SpecialRef::Root => 3,
        SpecialRef::Cwd => 4,
        SpecialRef::LaunchExe => 5,
    }
}

/// An opened output trace: serializes every record it receives, remapping
/// command ids to first-appearance order.
pub struct OutputTrace {
    w: BufWriter<File>,
    ids: HashMap<CommandId, u32>,
    next_id: u32,
    err: Option<std::io::Error>,
    ended: bool,
}

impl OutputTrace {
    pub fn create(path: &Path) -> anyhow::Result<OutputTrace> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let f = File::create(path).with_context(|| format!("create {:?}", path))?;
        let mut w = BufWriter::new(f);
        w.write_all(MAGIC)?;
        let mut ids = HashMap::new();
        ids.insert(TOOL_CMD, 0);
        Ok(OutputTrace {
            w,
            ids,
            next_id: 1,
            err: None,
            ended: false,
        })
    }

    /// The first write error, if any, surfaced at the end of the build.
    pub fn into_result(self) -> std::io::Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn map_cmd(&mut self, c: CommandId) -> u32 {
        *self.ids.get(&c).unwrap_or(&c.0)
    }

    fn assign_cmd(&mut self, c: CommandId) -> u32 {
        if let Some(&id) = self.ids.get(&c) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(c, id);
        id
    }

    fn write(&mut self, step: &Step) -> std::io::Result<()> {
        match step {
            Step::End => {
                self.w.write_all(&[TAG_END])?;
                self.w.flush()?;
            }
            Step::SpecialRef { cmd, entity, out } => {
                self.w.write_all(&[TAG_SPECIAL_REF])?;
                self.write_cmd(*cmd)?;
                self.w.write_all(&[encode_special(*entity)])?;
                self.write_u32(*out)?;
            }
            Step::PipeRef { cmd, read, write } => {
                self.w.write_all(&[TAG_PIPE_REF])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*read)?;
                self.write_u32(*write)?;
            }
            Step::FileRef { cmd, mode, out } => {
                self.w.write_all(&[TAG_FILE_REF])?;
                self.write_cmd(*cmd)?;
                self.write_u16(*mode)?;
                self.write_u32(*out)?;
            }
            Step::SymlinkRef { cmd, target, out } => {
                self.w.write_all(&[TAG_SYMLINK_REF])?;
                self.write_cmd(*cmd)?;
                self.write_path(target)?;
                self.write_u32(*out)?;
            }
            Step::DirRef { cmd, mode, out } => {
                self.w.write_all(&[TAG_DIR_REF])?;
                self.write_cmd(*cmd)?;
                self.write_u16(*mode)?;
                self.write_u32(*out)?;
            }
            Step::PathRef {
                cmd,
                base,
                path,
                flags,
                out,
            } => {
                self.w.write_all(&[TAG_PATH_REF])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*base)?;
                self.write_path(path)?;
                self.write_u16(flags.bits())?;
                self.write_u16(flags.mode)?;
                self.write_u32(*out)?;
            }
            Step::ExpectResult {
                cmd,
                ref_id,
                expected,
            } => {
                self.w.write_all(&[TAG_EXPECT_RESULT])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*ref_id)?;
                self.write_i32(expected.to_errno())?;
            }
            Step::MatchMetadata {
                cmd,
                ref_id,
                expected,
            } => {
                self.w.write_all(&[TAG_MATCH_METADATA])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*ref_id)?;
                self.write_metadata(expected)?;
            }
            Step::MatchContent {
                cmd,
                ref_id,
                expected,
            } => {
                self.w.write_all(&[TAG_MATCH_CONTENT])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*ref_id)?;
                self.write_version(expected)?;
            }
            Step::UpdateMetadata {
                cmd,
                ref_id,
                written,
            } => {
                self.w.write_all(&[TAG_UPDATE_METADATA])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*ref_id)?;
                self.write_metadata(written)?;
            }
            Step::UpdateContent {
                cmd,
                ref_id,
                written,
            } => {
                self.w.write_all(&[TAG_UPDATE_CONTENT])?;
                self.write_cmd(*cmd)?;
                self.write_u32(*ref_id)?;
                self.write_version(written)?;
            }
            Step::Launch {
                cmd,
                child,
                args,
                fds,
                refs,
            } => {
                self.w.write_all(&[TAG_LAUNCH])?;
                self.write_cmd(*cmd)?;
                let child_id = self.assign_cmd(*child);
                self.write_u32(child_id)?;
                self.write_u32(args.len() as u32)?;
                for arg in args {
                    self.write_str(arg)?;
                }
                self.write_u32(fds.len() as u32)?;
                for (fd, ref_id) in fds {
                    self.write_i32(*fd)?;
                    self.write_u32(*ref_id)?;
                }
                self.write_u32(refs.len() as u32)?;
                for (parent_ref, child_ref) in refs {
                    self.write_u32(*parent_ref)?;
                    self.write_u32(*child_ref)?;
                }
            }
            Step::Join {
                cmd,
                child,
                exit_status,
            } => {
                self.w.write_all(&[TAG_JOIN])?;
                self.write_cmd(*cmd)?;
                let child_id = self.map_cmd(*child);
                self.write_u32(child_id)?;
                self.write_i32(*exit_status)?;
            }
            Step::Exit { cmd, exit_status } => {
                self.w.write_all(&[TAG_EXIT])?;
                self.write_cmd(*cmd)?;
                self.write_i32(*exit_status)?;
            }
        }
        Ok(())
    }

    fn write_cmd(&mut self, c: CommandId) -> std::io::Result<()> {
        let id = self.map_cmd(c);
        self.write_u32(id)
    }

    fn write_u16(&mut self, n: u16) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_u32(&mut self, n: u32) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_i32(&mut self, n: i32) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_u64(&mut self, n: u64) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_i64(&mut self, n: i64) -> std::io::Result<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.write_u32(s.len() as u32)?;
        self.w.write_all(s.as_bytes())
    }

    fn write_path(&mut self, p: &Path) -> std::io::Result<()> {
        self.write_str(&p.to_string_lossy())
    }

    fn write_metadata(&mut self, m: &Metadata) -> std::io::Result<()> {
        self.write_u32(m.uid)?;
        self.write_u32(m.gid)?;
        self.write_u32(m.mode)
    }

    fn write_version(&mut self, v: &VersionSpec) -> std::io::Result<()> {
        match v {
            VersionSpec::File { fingerprint, saved } => {
                self.w.write_all(&[0])?;
                match fingerprint {
                    Some(fp) => {
                        self.w.write_all(&[1])?;
                        self.w.write_all(&fp.digest.0)?;
                        self.write_u64(fp.size)?;
                        self.write_i64(fp.mtime.0)?;
                        self.write_u32(fp.mtime.1)?;
                    }
                    None => {
                        self.w.write_all(&[0])?;
                        self.w.write_all(&[0u8; 32])?;
                        self.write_u64(0)?;
                        self.write_i64(0)?;
                        self.write_u32(0)?;
                    }
                }
                self.w.write_all(&[*saved as u8])
            }
            VersionSpec::Symlink { target } => {
                self.w.write_all(&[1])?;
                self.write_path(target)
            }
            VersionSpec::DirListed { entries } => {
                self.w.write_all(&[2])?;
                self.write_u32(entries.len() as u32)?;
                for entry in entries {
                    self.write_str(entry)?;
                }
                Ok(())
            }
            VersionSpec::DirCreated => self.w.write_all(&[3]),
            VersionSpec::DirAdd { name, target } => {
                self.w.write_all(&[4])?;
                self.write_str(name)?;
                self.write_u32(*target)
            }
            VersionSpec::DirRemove { name } => {
                self.w.write_all(&[5])?;
                self.write_str(name)
            }
        }
    }
}

impl IRSink for OutputTrace {
    fn step(&mut self, step: &Step) {
        if self.err.is_some() || self.ended {
            return;
        }
        if matches!(step, Step::End) {
            self.ended = true;
        }
        if let Err(err) = self.write(step) {
            self.err = Some(err);
        }
    }

    fn finish(&mut self) {
        if !self.ended {
            self.step(&Step::End);
        }
        if let Err(err) = self.w.flush() {
            if self.err.is_none() {
                self.err = Some(err);
            }
        }
    }
}
