//! Commands: the invocation nodes of the traced process tree. A command's
//! identity is its argument vector plus the references it inherits; its
//! lifecycle state accumulates as the trace replays.

use std::path::Path;

use crate::env::ArtifactId;
use crate::flags::{AccessFlags, ResultCode};
use crate::ir::{CommandId, RefId, RESERVED_REFS};

/// The outcome of resolving one of a command's references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Not resolved yet this run.
    Pending,
    Artifact(ArtifactId),
    Err(ResultCode),
}

impl Resolution {
    pub fn code(&self) -> ResultCode {
        match self {
            Resolution::Pending => ResultCode::Invalid,
            Resolution::Artifact(_) => ResultCode::Ok,
            Resolution::Err(code) => *code,
        }
    }

    pub fn artifact(&self) -> Option<ArtifactId> {
        match self {
            Resolution::Artifact(a) => Some(*a),
            _ => None,
        }
    }
}

/// How the planner decided to treat a command this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marking {
    /// Replay the recorded steps without running anything.
    Emulate,
    /// Execute for real under the tracer.
    MustRun,
}

/// A slot in a command's reference table, holding the access flags the
/// reference was made with and its resolution.
#[derive(Debug, Clone)]
pub struct RefSlot {
    pub flags: AccessFlags,
    pub resolution: Resolution,
}

pub struct Command {
    /// Argument vector; args[0] is the executable.
    pub args: Vec<String>,
    /// Initial file descriptor map: fd number to the command's own RefId.
    pub initial_fds: Vec<(i32, RefId)>,
    /// Reference table, indexed by RefId. Slots 0..RESERVED_REFS are the
    /// inherited root/cwd/exe/stdio references.
    refs: Vec<RefSlot>,
    /// Children launched by this command, in launch order.
    pub children: Vec<CommandId>,
    /// Exit status recorded in the input trace, if the command ever ran.
    pub observed_exit: Option<i32>,
    /// Exit status from the current build.
    pub exit_status: Option<i32>,
    pub marking: Marking,
    pub launched: bool,
    /// Temp-path renames applied when matching a relaunched command.
    pub substitutions: Vec<(String, String)>,
}

impl Command {
    pub fn new(args: Vec<String>) -> Command {
        let refs = (0..RESERVED_REFS)
            .map(|_| RefSlot {
                flags: AccessFlags::default(),
                resolution: Resolution::Pending,
            })
            .collect();
        Command {
            args,
            initial_fds: Vec::new(),
            refs,
            children: Vec::new(),
            observed_exit: None,
            exit_status: None,
            marking: Marking::Emulate,
            launched: false,
            substitutions: Vec::new(),
        }
    }

    pub fn must_run(&self) -> bool {
        self.marking == Marking::MustRun
    }

    /// A command that has no recorded exit has never completed a run.
    pub fn never_run(&self) -> bool {
        self.observed_exit.is_none()
    }

    /// Bind a reference slot. The first resolution wins: a slot never flips
    /// between success and error within one run.
    pub fn set_ref(&mut self, id: RefId, flags: AccessFlags, resolution: Resolution) {
        let idx = id as usize;
        if idx >= self.refs.len() {
            self.refs.resize(
                idx + 1,
                RefSlot {
                    flags: AccessFlags::default(),
                    resolution: Resolution::Pending,
                },
            );
        }
        let slot = &mut self.refs[idx];
        if slot.resolution == Resolution::Pending {
            *slot = RefSlot { flags, resolution };
        }
    }

    pub fn ref_result(&self, id: RefId) -> Resolution {
        self.refs
            .get(id as usize)
            .map(|s| s.resolution)
            .unwrap_or(Resolution::Pending)
    }

    pub fn ref_flags(&self, id: RefId) -> AccessFlags {
        self.refs
            .get(id as usize)
            .map(|s| s.flags)
            .unwrap_or_default()
    }

    /// Forget resolutions from a previous replay so the trace can be
    /// evaluated again from scratch.
    pub fn reset_for_replay(&mut self) {
        for slot in &mut self.refs {
            slot.resolution = Resolution::Pending;
        }
        self.children.clear();
        self.exit_status = None;
        self.launched = false;
    }

    /// Executable name without its directory, for progress display.
    pub fn short_name(&self) -> &str {
        let base = self.args.first().map(String::as_str).unwrap_or("<none>");
        match base.rfind('/') {
            Some(pos) => &base[pos + 1..],
            None => base,
        }
    }

    pub fn full_name(&self) -> String {
        self.args.join(" ")
    }

    /// Try to match a traced launch against this command's identity.
    /// Arguments must agree exactly, except that paths under the tool's
    /// temporary directory may differ; those yield substitutions the rest of
    /// the recorded trace is rewritten with.
    pub fn try_match(&self, args: &[String], tmp_dir: &Path) -> Option<Vec<(String, String)>> {
        if self.args.len() != args.len() {
            return None;
        }
        let tmp = tmp_dir.to_string_lossy();
        let mut subs = Vec::new();
        for (mine, theirs) in self.args.iter().zip(args) {
            if mine == theirs {
                continue;
            }
            if mine.starts_with(tmp.as_ref()) && theirs.starts_with(tmp.as_ref()) {
                subs.push((mine.clone(), theirs.clone()));
            } else {
                return None;
            }
        }
        Some(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolution_wins() {
        let mut c = Command::new(vec!["sh".into()]);
        c.set_ref(7, AccessFlags::default(), Resolution::Err(ResultCode::NotFound));
        c.set_ref(7, AccessFlags::default(), Resolution::Artifact(ArtifactId(1)));
        assert_eq!(c.ref_result(7), Resolution::Err(ResultCode::NotFound));
    }

    #[test]
    fn match_requires_equal_args() {
        let c = Command::new(vec!["gcc".into(), "-o".into(), "a".into()]);
        let tmp = Path::new(".rkr/tmp");
        assert!(c
            .try_match(&["gcc".into(), "-o".into(), "a".into()], tmp)
            .is_some());
        assert!(c
            .try_match(&["gcc".into(), "-o".into(), "b".into()], tmp)
            .is_none());
    }

    #[test]
    fn match_substitutes_temp_paths() {
        let c = Command::new(vec!["cc".into(), ".rkr/tmp/0".into()]);
        let subs = c
            .try_match(&["cc".into(), ".rkr/tmp/3".into()], Path::new(".rkr/tmp"))
            .unwrap();
        assert_eq!(subs, vec![(".rkr/tmp/0".to_string(), ".rkr/tmp/3".to_string())]);
    }
}
