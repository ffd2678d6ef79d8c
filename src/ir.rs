//! The trace IR: step records attributed to commands, and the narrow
//! source/sink interfaces the rest of the engine is built around.
//!
//! Steps come in three families: references (bind a RefId to an outcome),
//! predicates (something observed last time must still hold), and actions
//! (mutations the command performed). Records are totally ordered per
//! command; across commands they are ordered only through Launch/Join/Exit.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::command::Command;
use crate::densemap::{declare_id, DenseMap};
use crate::flags::{AccessFlags, ResultCode};
use crate::hash::Fingerprint;
use crate::version::Metadata;

declare_id!(CommandId);

/// The build tool's own pseudo-command: the primordial parent that binds the
/// special references and launches the root command.
pub const TOOL_CMD: CommandId = CommandId(0);

/// Index into a command's reference table. Every command's first slots are
/// reserved for the references it inherits at launch.
pub type RefId = u32;

pub const REF_ROOT: RefId = 0;
pub const REF_CWD: RefId = 1;
pub const REF_EXE: RefId = 2;
pub const REF_STDIN: RefId = 3;
pub const REF_STDOUT: RefId = 4;
pub const REF_STDERR: RefId = 5;
pub const RESERVED_REFS: u32 = 6;

/// Well-known entities a SpecialRef step can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialRef {
    Stdin,
    Stdout,
    Stderr,
    Root,
    Cwd,
    LaunchExe,
}

/// Which pass a predicate was evaluated in: replaying the recorded build, or
/// checking final on-disk state afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Build,
    PostBuild,
}

/// The version payload carried inline by match/update steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    File {
        fingerprint: Option<Fingerprint>,
        saved: bool,
    },
    Symlink {
        target: PathBuf,
    },
    DirListed {
        entries: BTreeSet<String>,
    },
    DirCreated,
    DirAdd {
        name: String,
        target: RefId,
    },
    DirRemove {
        name: String,
    },
}

/// One record in the trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    SpecialRef {
        cmd: CommandId,
        entity: SpecialRef,
        out: RefId,
    },
    PipeRef {
        cmd: CommandId,
        read: RefId,
        write: RefId,
    },
    FileRef {
        cmd: CommandId,
        mode: u16,
        out: RefId,
    },
    SymlinkRef {
        cmd: CommandId,
        target: PathBuf,
        out: RefId,
    },
    DirRef {
        cmd: CommandId,
        mode: u16,
        out: RefId,
    },
    PathRef {
        cmd: CommandId,
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
        out: RefId,
    },
    ExpectResult {
        cmd: CommandId,
        ref_id: RefId,
        expected: ResultCode,
    },
    MatchMetadata {
        cmd: CommandId,
        ref_id: RefId,
        expected: Metadata,
    },
    MatchContent {
        cmd: CommandId,
        ref_id: RefId,
        expected: VersionSpec,
    },
    UpdateMetadata {
        cmd: CommandId,
        ref_id: RefId,
        written: Metadata,
    },
    UpdateContent {
        cmd: CommandId,
        ref_id: RefId,
        written: VersionSpec,
    },
    Launch {
        cmd: CommandId,
        child: CommandId,
        /// The child command's identity, carried at first appearance.
        args: Vec<String>,
        /// The child's initial file descriptors: fd number to child RefId.
        fds: Vec<(i32, RefId)>,
        /// (parent ref, child ref) pairs the child inherits.
        refs: Vec<(RefId, RefId)>,
    },
    Join {
        cmd: CommandId,
        child: CommandId,
        exit_status: i32,
    },
    Exit {
        cmd: CommandId,
        exit_status: i32,
    },
    End,
}

impl Step {
    /// The command this record is attributed to, if any.
    pub fn cmd(&self) -> Option<CommandId> {
        match self {
            Step::SpecialRef { cmd, .. }
            | Step::PipeRef { cmd, .. }
            | Step::FileRef { cmd, .. }
            | Step::SymlinkRef { cmd, .. }
            | Step::DirRef { cmd, .. }
            | Step::PathRef { cmd, .. }
            | Step::ExpectResult { cmd, .. }
            | Step::MatchMetadata { cmd, .. }
            | Step::MatchContent { cmd, .. }
            | Step::UpdateMetadata { cmd, .. }
            | Step::UpdateContent { cmd, .. }
            | Step::Launch { cmd, .. }
            | Step::Join { cmd, .. }
            | Step::Exit { cmd, .. } => Some(*cmd),
            Step::End => None,
        }
    }
}

/// Consumes a stream of IR records: the emulator, the output-trace writer,
/// the graph writer.
pub trait IRSink {
    fn step(&mut self, step: &Step);

    /// The stream is complete. Flush.
    fn finish(&mut self) {}
}

/// Supplies a stream of IR records to a sink.
pub trait IRSource {
    fn send_to(&mut self, sink: &mut dyn IRSink);
}

/// Forward records to two sinks in order.
pub struct Tee<'a> {
    pub first: &'a mut dyn IRSink,
    pub second: &'a mut dyn IRSink,
}

impl IRSink for Tee<'_> {
    fn step(&mut self, step: &Step) {
        self.first.step(step);
        self.second.step(step);
    }

    fn finish(&mut self) {
        self.first.finish();
        self.second.finish();
    }
}

/// A sink that discards everything.
pub struct NullSink;

impl IRSink for NullSink {
    fn step(&mut self, _step: &Step) {}
}

/// An in-memory trace: the command table plus the ordered records.
pub struct Trace {
    pub commands: DenseMap<CommandId, Command>,
    pub steps: Vec<Step>,
    pub root: CommandId,
}

impl Trace {
    /// Replay every record into `sink`, ending with `finish`. The `End`
    /// sentinel is delivered explicitly so sinks that persist see it.
    pub fn send_to(&self, sink: &mut dyn IRSink) {
        for step in &self.steps {
            sink.step(step);
        }
        sink.step(&Step::End);
        sink.finish();
    }
}

/// Renders records as readable IR text, for the `-d trace` debug tool.
pub struct TracePrinter<W: std::io::Write> {
    w: W,
}

impl<W: std::io::Write> TracePrinter<W> {
    pub fn new(w: W) -> Self {
        TracePrinter { w }
    }

    fn print(&mut self, step: &Step) -> std::io::Result<()> {
        let c = step.cmd().map(|c| c.0).unwrap_or(0);
        match step {
            Step::SpecialRef { entity, out, .. } => {
                writeln!(self.w, "[c{}] r{} = {:?}", c, out, entity)
            }
            Step::PipeRef { read, write, .. } => {
                writeln!(self.w, "[c{}] (r{}, r{}) = pipe()", c, read, write)
            }
            Step::FileRef { mode, out, .. } => {
                writeln!(self.w, "[c{}] r{} = file({:o})", c, out, mode)
            }
            Step::SymlinkRef { target, out, .. } => {
                writeln!(self.w, "[c{}] r{} = symlink({:?})", c, out, target)
            }
            Step::DirRef { mode, out, .. } => {
                writeln!(self.w, "[c{}] r{} = dir({:o})", c, out, mode)
            }
            Step::PathRef {
                base,
                path,
                flags,
                out,
                ..
            } => writeln!(
                self.w,
                "[c{}] r{} = path(r{}, {:?}, [{}])",
                c, out, base, path, flags
            ),
            Step::ExpectResult {
                ref_id, expected, ..
            } => writeln!(self.w, "[c{}] expect(r{}, {})", c, ref_id, expected),
            Step::MatchMetadata { ref_id, .. } => {
                writeln!(self.w, "[c{}] match_metadata(r{})", c, ref_id)
            }
            Step::MatchContent { ref_id, .. } => {
                writeln!(self.w, "[c{}] match_content(r{})", c, ref_id)
            }
            Step::UpdateMetadata { ref_id, .. } => {
                writeln!(self.w, "[c{}] update_metadata(r{})", c, ref_id)
            }
            Step::UpdateContent { ref_id, written, .. } => {
                writeln!(self.w, "[c{}] update_content(r{}, {:?})", c, ref_id, written)
            }
            Step::Launch { child, args, .. } => {
                writeln!(self.w, "[c{}] launch(c{}, {:?})", c, child.0, args)
            }
            Step::Join {
                child, exit_status, ..
            } => writeln!(self.w, "[c{}] join(c{}, exit {})", c, child.0, exit_status),
            Step::Exit { exit_status, .. } => writeln!(self.w, "[c{}] exit({})", c, exit_status),
            Step::End => writeln!(self.w, "end"),
        }
    }
}

impl<W: std::io::Write> IRSink for TracePrinter<W> {
    fn step(&mut self, step: &Step) {
        let _ = self.print(step);
    }
}
