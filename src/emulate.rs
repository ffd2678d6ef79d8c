//! The build emulator: replays IR records against the environment. Commands
//! the plan left emulated have their recorded steps applied and forwarded to
//! the output trace; commands marked must-run are handed to the tracer when
//! their parent launches them, and the tracer becomes the authority for
//! their steps.

use std::collections::HashSet;
use std::path::Path;

use crate::cache::Cache;
use crate::command::{Marking, Resolution};
use crate::env::{ArtifactId, Env};
use crate::flags::AccessFlags;
use crate::ir::{CommandId, IRSink, NullSink, RefId, Scenario, SpecialRef, Step, Trace, VersionSpec, TOOL_CMD};
use crate::observer::{BuildObserver, InputKind, NullObserver, VersionInfo};
use crate::options::Options;
use crate::plan::RebuildPlan;
use crate::progress::ConsoleProgress;
use crate::resolve::Resolver;
use crate::tracer::Tracer;
use crate::version::{DirState, DirVersion, FileVersion, MetadataVersion, SymlinkVersion};

/// Replay a trace against a fresh environment for planning: no tracer, no
/// output, every command emulated. Ends with the final-state check.
pub fn plan_build(
    trace: &mut Trace,
    env: &mut Env,
    cache: &Cache,
    opts: &Options,
    obs: &mut dyn BuildObserver,
) {
    for id in trace.commands.ids().collect::<Vec<_>>() {
        let c = trace.commands.get_mut(id);
        c.reset_for_replay();
        c.marking = Marking::Emulate;
    }
    let steps = trace.steps.clone();
    let mut null_out = NullSink;
    {
        let mut build = Build {
            trace: &mut *trace,
            env: &mut *env,
            cache,
            opts,
            obs: &mut *obs,
            out: &mut null_out,
            tracer: None,
            progress: None,
            checked: HashSet::new(),
            failed: false,
            ran: 0,
        };
        for step in &steps {
            build.step(step);
        }
    }
    env.check_final_state(cache, obs);
}

/// Replay a trace for real: emulated commands feed the output trace, marked
/// commands execute under the tracer. Returns the number of commands run (or
/// printed, under dry-run) and whether any of them failed.
pub fn execute_build(
    trace: &mut Trace,
    env: &mut Env,
    cache: &Cache,
    opts: &Options,
    plan: &RebuildPlan,
    out: &mut dyn IRSink,
    tracer: &mut dyn Tracer,
    progress: &mut ConsoleProgress,
) -> (usize, bool) {
    for id in trace.commands.ids().collect::<Vec<_>>() {
        // The tool's own pseudo-command is never run.
        let marking = if id != TOOL_CMD && plan.must_run(id) {
            Marking::MustRun
        } else {
            Marking::Emulate
        };
        let c = trace.commands.get_mut(id);
        c.reset_for_replay();
        c.marking = marking;
    }

    let steps = trace.steps.clone();
    let mut obs = NullObserver;
    {
        let mut build = Build {
            trace: &mut *trace,
            env: &mut *env,
            cache,
            opts,
            obs: &mut obs,
            out: &mut *out,
            tracer: Some(tracer),
            progress: Some(progress),
            checked: HashSet::new(),
            failed: false,
            ran: 0,
        };
        for step in &steps {
            build.step(step);
        }
        let result = (build.ran, build.failed);
        drop(build);
        out.step(&Step::End);
        out.finish();
        result
    }
}

/// One replay pass. Implements IRSink so a trace source can drive it.
pub struct Build<'a> {
    pub trace: &'a mut Trace,
    pub env: &'a mut Env,
    pub cache: &'a Cache,
    pub opts: &'a Options,
    pub obs: &'a mut dyn BuildObserver,
    pub out: &'a mut dyn IRSink,
    pub tracer: Option<&'a mut dyn Tracer>,
    pub progress: Option<&'a mut ConsoleProgress>,
    /// Predicates already evaluated, for skip_repeat_checks.
    checked: HashSet<(CommandId, RefId, u8)>,
    /// Some executed command exited non-zero.
    pub failed: bool,
    /// Commands handed to the tracer (or printed, under dry-run).
    pub ran: usize,
}

impl IRSink for Build<'_> {
    fn step(&mut self, step: &Step) {
        self.apply(step);
    }
}

impl Build<'_> {
    fn apply(&mut self, step: &Step) {
        let c = match step.cmd() {
            Some(c) => c,
            None => return,
        };

        // A must-run command's records are stale: the tracer is the
        // authority for what it does this build. This also covers Launch
        // and Join, whose children the tracer's process tree owns.
        if self.trace.commands.get(c).must_run() {
            return;
        }

        match step.clone() {
            Step::SpecialRef { cmd, entity, out } => self.special_ref(cmd, entity, out),
            Step::PipeRef { cmd, read, write } => self.pipe_ref(cmd, read, write),
            Step::FileRef { cmd, mode, out } => {
                self.forward(step);
                let a = self.env.create_file(Some(cmd), mode, false);
                self.obs.output(cmd, a);
                let flags = AccessFlags {
                    r: true,
                    w: true,
                    mode,
                    ..AccessFlags::default()
                };
                self.trace
                    .commands
                    .get_mut(cmd)
                    .set_ref(out, flags, Resolution::Artifact(a));
            }
            Step::SymlinkRef { cmd, target, out } => {
                self.forward(step);
                let a = self.env.create_symlink(Some(cmd), target);
                self.obs.output(cmd, a);
                self.trace.commands.get_mut(cmd).set_ref(
                    out,
                    AccessFlags::default(),
                    Resolution::Artifact(a),
                );
            }
            Step::DirRef { cmd, mode, out } => {
                self.forward(step);
                let a = self.env.create_dir(Some(cmd), mode, false);
                self.obs.output(cmd, a);
                self.trace.commands.get_mut(cmd).set_ref(
                    out,
                    AccessFlags::default(),
                    Resolution::Artifact(a),
                );
            }
            Step::PathRef {
                cmd,
                base,
                path,
                flags,
                out,
            } => {
                self.forward(step);
                let base_res = self.trace.commands.get(cmd).ref_result(base);
                let resolution = {
                    let mut resolver = Resolver {
                        env: &mut *self.env,
                        obs: &mut *self.obs,
                        symlink_limit: self.opts.symlink_limit,
                    };
                    resolver.resolve(cmd, base_res, &path, &flags)
                };
                self.trace
                    .commands
                    .get_mut(cmd)
                    .set_ref(out, flags, resolution);
            }
            Step::ExpectResult {
                cmd,
                ref_id,
                expected,
            } => {
                self.forward(step);
                if self.already_checked(cmd, ref_id, 0) {
                    return;
                }
                let observed = self.trace.commands.get(cmd).ref_result(ref_id).code();
                if observed != expected {
                    self.obs.resolution_change(
                        cmd,
                        ref_id,
                        expected.to_errno(),
                        observed.to_errno(),
                    );
                }
            }
            Step::MatchMetadata {
                cmd,
                ref_id,
                expected,
            } => {
                self.forward(step);
                if self.already_checked(cmd, ref_id, 1) {
                    return;
                }
                match self.trace.commands.get(cmd).ref_result(ref_id) {
                    Resolution::Artifact(a) => {
                        let current = self.env.artifacts.get(a).current_metadata().clone();
                        self.record_input(cmd, a, current.creator, true, InputKind::Accessed);
                        if !current.meta.matches(&expected) {
                            self.obs.mismatch(cmd, Scenario::Build, a);
                        }
                    }
                    other => {
                        self.obs
                            .resolution_change(cmd, ref_id, 0, other.code().to_errno());
                    }
                }
            }
            Step::MatchContent {
                cmd,
                ref_id,
                expected,
            } => {
                self.forward(step);
                if self.already_checked(cmd, ref_id, 2) {
                    return;
                }
                match self.trace.commands.get(cmd).ref_result(ref_id) {
                    Resolution::Artifact(a) => self.match_content(cmd, a, &expected),
                    other => {
                        self.obs
                            .resolution_change(cmd, ref_id, 0, other.code().to_errno());
                    }
                }
            }
            Step::UpdateMetadata {
                cmd,
                ref_id,
                written,
            } => {
                self.forward(step);
                match self.trace.commands.get(cmd).ref_result(ref_id) {
                    Resolution::Artifact(a) => {
                        let mut v = MetadataVersion::new(written);
                        v.creator = Some(cmd);
                        self.env.artifacts.get_mut(a).push_metadata(v);
                        self.obs.output(cmd, a);
                    }
                    other => {
                        self.obs
                            .resolution_change(cmd, ref_id, 0, other.code().to_errno());
                    }
                }
            }
            Step::UpdateContent {
                cmd,
                ref_id,
                written,
            } => {
                self.forward(step);
                match self.trace.commands.get(cmd).ref_result(ref_id) {
                    Resolution::Artifact(a) => self.update_content(cmd, a, &written),
                    other => {
                        self.obs
                            .resolution_change(cmd, ref_id, 0, other.code().to_errno());
                    }
                }
            }
            Step::Launch {
                cmd, child, refs, ..
            } => {
                // The launch record precedes the child's own records.
                self.forward(step);
                self.launch(cmd, child, &refs);
            }
            Step::Join {
                cmd,
                child,
                exit_status,
            } => {
                // The output trace records the status the child actually
                // reached this build, not the stale one.
                let observed = self.trace.commands.get(child).exit_status;
                self.forward(&Step::Join {
                    cmd,
                    child,
                    exit_status: observed.unwrap_or(exit_status),
                });
                if let Some(observed) = observed {
                    if observed != exit_status {
                        self.obs.exit_code_change(cmd, child, exit_status, observed);
                    }
                }
            }
            Step::Exit { cmd, exit_status } => {
                self.forward(step);
                self.trace.commands.get_mut(cmd).exit_status = Some(exit_status);
            }
            Step::End => {}
        }
    }

    /// Forward an emulated record to the output trace.
    fn forward(&mut self, step: &Step) {
        self.out.step(step);
    }

    fn already_checked(&mut self, c: CommandId, ref_id: RefId, kind: u8) -> bool {
        if !self.opts.skip_repeat_checks {
            return false;
        }
        !self.checked.insert((c, ref_id, kind))
    }

    fn record_input(
        &mut self,
        c: CommandId,
        a: ArtifactId,
        creator: Option<CommandId>,
        can_stage: bool,
        kind: InputKind,
    ) {
        if self.opts.ignore_self_reads && creator == Some(c) {
            return;
        }
        self.obs
            .input(c, a, VersionInfo { creator, can_stage }, kind);
    }

    fn special_ref(&mut self, cmd: CommandId, entity: SpecialRef, out: RefId) {
        self.forward(&Step::SpecialRef { cmd, entity, out });
        let read = AccessFlags {
            r: true,
            ..AccessFlags::default()
        };
        let write = AccessFlags {
            w: true,
            ..AccessFlags::default()
        };
        let search = AccessFlags {
            r: true,
            x: true,
            ..AccessFlags::default()
        };
        let resolution = match entity {
            SpecialRef::Stdin => Resolution::Artifact(self.env.stdio(0)),
            SpecialRef::Stdout => Resolution::Artifact(self.env.stdio(1)),
            SpecialRef::Stderr => Resolution::Artifact(self.env.stdio(2)),
            SpecialRef::Root => match self.env.root_dir() {
                Ok(root) => Resolution::Artifact(root),
                Err(_) => Resolution::Err(crate::flags::ResultCode::NotFound),
            },
            SpecialRef::Cwd => self.resolve_absolute(cmd, std::env::current_dir().ok(), &search),
            SpecialRef::LaunchExe => {
                self.resolve_absolute(cmd, std::env::current_exe().ok(), &search)
            }
        };
        let flags = match entity {
            SpecialRef::Stdin => read,
            SpecialRef::Stdout | SpecialRef::Stderr => write,
            _ => search,
        };
        self.trace
            .commands
            .get_mut(cmd)
            .set_ref(out, flags, resolution);
    }

    fn resolve_absolute(
        &mut self,
        cmd: CommandId,
        path: Option<std::path::PathBuf>,
        flags: &AccessFlags,
    ) -> Resolution {
        let path = match path {
            Some(p) => p,
            None => return Resolution::Err(crate::flags::ResultCode::NotFound),
        };
        let root = match self.env.root_dir() {
            Ok(root) => root,
            Err(_) => return Resolution::Err(crate::flags::ResultCode::NotFound),
        };
        let mut resolver = Resolver {
            env: &mut *self.env,
            obs: &mut *self.obs,
            symlink_limit: self.opts.symlink_limit,
        };
        resolver.resolve(cmd, Resolution::Artifact(root), &path, flags)
    }

    fn pipe_ref(&mut self, cmd: CommandId, read: RefId, write: RefId) {
        self.forward(&Step::PipeRef { cmd, read, write });
        let pipe = self.env.create_pipe(Some(cmd));
        self.obs.output(cmd, pipe);
        let r = AccessFlags {
            r: true,
            ..AccessFlags::default()
        };
        let w = AccessFlags {
            w: true,
            ..AccessFlags::default()
        };
        let command = self.trace.commands.get_mut(cmd);
        command.set_ref(read, r, Resolution::Artifact(pipe));
        command.set_ref(write, w, Resolution::Artifact(pipe));
    }

    fn match_content(&mut self, cmd: CommandId, a: ArtifactId, expected: &VersionSpec) {
        use crate::artifact::Content;
        self.env.fingerprint_current(a);
        let path = self.env.path_of(a);
        let art = self.env.artifacts.get(a);
        let (creator, matches, can_stage) = match (&art.content, expected) {
            (Content::File { versions }, VersionSpec::File { fingerprint, .. }) => {
                let cur = versions.last().unwrap();
                let matches = match (&cur.fingerprint, fingerprint) {
                    (Some(have), Some(want)) => have.same_content(want),
                    _ => false,
                };
                let can_stage = cur.committed
                    || (cur.saved
                        && cur
                            .fingerprint
                            .map(|fp| self.cache.has(fp.digest))
                            .unwrap_or(false));
                (cur.creator, matches, can_stage)
            }
            // Pipe contents are not tracked across commands; a content
            // predicate against a pipe cannot be verified and fails.
            (Content::Pipe { versions }, _) => (versions.last().unwrap().creator, false, false),
            (Content::Special { versions }, _) => (versions.last().unwrap().creator, false, false),
            (Content::Symlink { versions }, VersionSpec::Symlink { target }) => {
                let cur = versions.last().unwrap();
                (cur.creator, &cur.target == target, true)
            }
            (Content::Dir { versions, .. }, VersionSpec::DirListed { entries }) => {
                let cur = versions.last().unwrap();
                let matches = match (&cur.state, &path) {
                    (DirState::Existing { .. }, Some(path)) if cur.committed => {
                        list_dir(path).map(|have| have == *entries).unwrap_or(false)
                    }
                    (DirState::Listed { entries: have }, _) => have == entries,
                    _ => false,
                };
                (cur.creator, matches, true)
            }
            _ => (None, false, false),
        };
        self.record_input(cmd, a, creator, can_stage, InputKind::Accessed);
        if !matches {
            self.obs.mismatch(cmd, Scenario::Build, a);
        }
    }

    fn update_content(&mut self, cmd: CommandId, a: ArtifactId, written: &VersionSpec) {
        use crate::artifact::Content;
        match written {
            VersionSpec::File { fingerprint, saved } => {
                let combine = self.opts.combine_writes;
                let mut v = FileVersion::new();
                v.fingerprint = *fingerprint;
                v.saved = *saved;
                v.creator = Some(cmd);
                let art = self.env.artifacts.get_mut(a);
                if let Some(versions) = art.file_versions_mut() {
                    // Consecutive writes by the same command collapse into
                    // the final version.
                    if combine {
                        if let Some(last) = versions.last() {
                            if last.creator == Some(cmd) && !last.committed {
                                versions.pop();
                            }
                        }
                    }
                    versions.push(v);
                }
            }
            VersionSpec::Symlink { target } => {
                let mut v = SymlinkVersion::new(target.clone());
                v.creator = Some(cmd);
                if let Content::Symlink { versions } = &mut self.env.artifacts.get_mut(a).content {
                    versions.push(v);
                }
            }
            VersionSpec::DirCreated => {
                let mut v = DirVersion::created();
                v.creator = Some(cmd);
                self.env.artifacts.get_mut(a).push_dir_version(v);
            }
            VersionSpec::DirListed { entries } => {
                let v = DirVersion {
                    state: DirState::Listed {
                        entries: entries.clone(),
                    },
                    creator: Some(cmd),
                    committed: false,
                };
                self.env.artifacts.get_mut(a).push_dir_version(v);
            }
            VersionSpec::DirAdd { name, target } => {
                let target = match self.trace.commands.get(cmd).ref_result(*target) {
                    Resolution::Artifact(t) => t,
                    other => {
                        self.obs
                            .resolution_change(cmd, *target, 0, other.code().to_errno());
                        return;
                    }
                };
                let v = DirVersion {
                    state: DirState::AddEntry {
                        name: name.clone(),
                        target,
                    },
                    creator: Some(cmd),
                    committed: false,
                };
                self.env.artifacts.get_mut(a).push_dir_version(v);
                self.env.artifacts.get_mut(target).add_link(Some(a), name);
                self.obs.output(cmd, target);
            }
            VersionSpec::DirRemove { name } => {
                if let Some(old) = self.env.artifacts.get(a).cached_entry(name) {
                    self.env.artifacts.get_mut(old).remove_link(Some(a), name);
                }
                let v = DirVersion {
                    state: DirState::RemoveEntry { name: name.clone() },
                    creator: Some(cmd),
                    committed: false,
                };
                self.env.artifacts.get_mut(a).push_dir_version(v);
            }
        }
        self.obs.output(cmd, a);
    }

    fn launch(&mut self, parent: CommandId, child: CommandId, refs: &[(RefId, RefId)]) {
        // Inherit references and their content dependencies.
        for &(parent_ref, child_ref) in refs {
            let (flags, resolution) = {
                let p = self.trace.commands.get(parent);
                (p.ref_flags(parent_ref), p.ref_result(parent_ref))
            };
            self.trace
                .commands
                .get_mut(child)
                .set_ref(child_ref, flags, resolution);
            if let Resolution::Artifact(a) = resolution {
                let creator = self.env.artifacts.get(a).current_metadata().creator;
                self.record_input(child, a, creator, true, InputKind::Inherited);
            }
        }

        self.trace.commands.get_mut(parent).children.push(child);
        let observer_parent = if parent == TOOL_CMD { None } else { Some(parent) };
        self.obs.launch(observer_parent, child);

        let must_run = self.trace.commands.get(child).must_run();
        if !must_run && self.trace.commands.get(child).never_run() {
            self.obs.command_never_run(child);
        }

        if must_run && (self.opts.print_on_run || self.opts.dry_run) {
            let name = self.trace.commands.get(child).full_name();
            if let Some(progress) = self.progress.as_deref_mut() {
                progress.command_started(&name);
            }
        }

        self.trace.commands.get_mut(child).launched = true;

        if must_run {
            if self.opts.dry_run {
                self.ran += 1;
            } else {
                self.run_child(child);
            }
        }
    }

    /// Execute a marked command under the tracer. The emulated state built so
    /// far is committed first so the command sees its inputs on disk.
    fn run_child(&mut self, child: CommandId) {
        if let Err(err) = crate::commit::commit_all(self.env, self.cache) {
            if let Some(progress) = self.progress.as_deref_mut() {
                progress.log(&format!("rkr: staging inputs failed: {}", err));
            }
            self.failed = true;
            return;
        }
        let tracer = match self.tracer.as_deref_mut() {
            Some(t) => t,
            None => return,
        };
        self.ran += 1;
        let args = self.trace.commands.get(child).args.clone();
        match tracer.run(child, &args, self.out) {
            Ok(status) => {
                self.trace.commands.get_mut(child).exit_status = Some(status);
                if status != 0 {
                    self.failed = true;
                }
                let name = self.trace.commands.get(child).short_name().to_string();
                if let Some(progress) = self.progress.as_deref_mut() {
                    progress.command_finished(&name, status);
                }
            }
            Err(err) => {
                self.failed = true;
                if let Some(progress) = self.progress.as_deref_mut() {
                    progress.log(&format!("rkr: command failed to start: {}", err));
                }
            }
        }
    }
}

fn list_dir(path: &Path) -> std::io::Result<std::collections::BTreeSet<String>> {
    let mut entries = std::collections::BTreeSet::new();
    for entry in std::fs::read_dir(path)? {
        entries.insert(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(entries)
}
