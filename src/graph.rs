//! Graphviz output: renders the command tree and the file reads/writes the
//! trace records, as a dot document. Implemented as an IR sink so it can tee
//! off any record stream.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

use crate::ir::{CommandId, IRSink, RefId, SpecialRef, Step};

const SYSTEM_PREFIXES: &[&str] = &["/usr", "/lib", "/lib64", "/etc", "/proc", "/sys", "/dev"];

pub struct GraphWriter<W: Write> {
    w: W,
    show_sysfiles: bool,
    /// Command id -> display label.
    commands: BTreeMap<u32, String>,
    /// (cmd, ref) -> path label, accumulated from reference records.
    refs: HashMap<(u32, RefId), String>,
    edges: BTreeSet<(u32, u32)>,
    reads: BTreeSet<(String, u32)>,
    writes: BTreeSet<(u32, String)>,
}

impl<W: Write> GraphWriter<W> {
    pub fn new(w: W, show_sysfiles: bool) -> GraphWriter<W> {
        GraphWriter {
            w,
            show_sysfiles,
            commands: BTreeMap::new(),
            refs: HashMap::new(),
            edges: BTreeSet::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
        }
    }

    fn ref_label(&self, cmd: CommandId, ref_id: RefId) -> Option<String> {
        let label = self.refs.get(&(cmd.0, ref_id))?;
        if !self.show_sysfiles && SYSTEM_PREFIXES.iter().any(|p| label.starts_with(p)) {
            return None;
        }
        Some(label.clone())
    }

    fn render(&mut self) -> std::io::Result<()> {
        writeln!(self.w, "digraph build {{")?;
        writeln!(self.w, "  rankdir=LR;")?;
        for (id, label) in &self.commands {
            writeln!(
                self.w,
                "  c{} [shape=box, label={:?}];",
                id,
                truncate(label, 60)
            )?;
        }
        let files: BTreeSet<&String> = self
            .reads
            .iter()
            .map(|(f, _)| f)
            .chain(self.writes.iter().map(|(_, f)| f))
            .collect();
        for file in files {
            writeln!(self.w, "  {:?} [shape=ellipse];", file)?;
        }
        for (parent, child) in &self.edges {
            writeln!(self.w, "  c{} -> c{} [style=dashed];", parent, child)?;
        }
        for (file, cmd) in &self.reads {
            writeln!(self.w, "  {:?} -> c{};", file, cmd)?;
        }
        for (cmd, file) in &self.writes {
            writeln!(self.w, "  c{} -> {:?};", cmd, file)?;
        }
        writeln!(self.w, "}}")
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        format!("{}...", &s[..limit])
    }
}

impl<W: Write> IRSink for GraphWriter<W> {
    fn step(&mut self, step: &Step) {
        match step {
            Step::SpecialRef { cmd, entity, out } => {
                let label = match entity {
                    SpecialRef::Root => "/",
                    SpecialRef::Cwd => ".",
                    SpecialRef::Stdin => "<stdin>",
                    SpecialRef::Stdout => "<stdout>",
                    SpecialRef::Stderr => "<stderr>",
                    SpecialRef::LaunchExe => "<exe>",
                };
                self.refs.insert((cmd.0, *out), label.to_string());
            }
            Step::PathRef {
                cmd,
                base,
                path,
                out,
                ..
            } => {
                let label = match self.refs.get(&(cmd.0, *base)) {
                    Some(base) if base == "." => path.to_string_lossy().into_owned(),
                    Some(base) => format!("{}/{}", base.trim_end_matches('/'), path.display()),
                    None => path.to_string_lossy().into_owned(),
                };
                self.refs.insert((cmd.0, *out), label);
            }
            Step::MatchContent { cmd, ref_id, .. } | Step::MatchMetadata { cmd, ref_id, .. } => {
                if let Some(label) = self.ref_label(*cmd, *ref_id) {
                    self.reads.insert((label, cmd.0));
                }
            }
            Step::UpdateContent { cmd, ref_id, .. } | Step::UpdateMetadata { cmd, ref_id, .. } => {
                if let Some(label) = self.ref_label(*cmd, *ref_id) {
                    self.writes.insert((cmd.0, label));
                }
            }
            Step::Launch {
                cmd, child, args, refs, ..
            } => {
                self.commands.insert(child.0, args.join(" "));
                if self.commands.contains_key(&cmd.0) {
                    self.edges.insert((cmd.0, child.0));
                }
                // Inherited references keep their labels in the child.
                for (parent_ref, child_ref) in refs {
                    if let Some(label) = self.refs.get(&(cmd.0, *parent_ref)).cloned() {
                        self.refs.insert((child.0, *child_ref), label);
                    }
                }
            }
            Step::End => {}
            _ => {}
        }
    }

    fn finish(&mut self) {
        let _ = self.render();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::default_trace;
    use crate::flags::AccessFlags;
    use crate::ir::REF_CWD;

    #[test]
    fn renders_commands_and_file_edges() {
        let mut trace = default_trace(&["Rikerfile".to_string()]);
        let root = trace.root;
        trace.steps.push(Step::PathRef {
            cmd: root,
            base: REF_CWD,
            path: "src/a.c".into(),
            flags: AccessFlags::default(),
            out: 6,
        });
        trace.steps.push(Step::MatchContent {
            cmd: root,
            ref_id: 6,
            expected: crate::ir::VersionSpec::File {
                fingerprint: None,
                saved: false,
            },
        });

        let mut out = Vec::new();
        trace.send_to(&mut GraphWriter::new(&mut out, false));
        let dot = String::from_utf8(out).unwrap();
        assert!(dot.contains("digraph build"));
        assert!(dot.contains("Rikerfile"));
        assert!(dot.contains("src/a.c"));
        assert!(dot.contains("-> c1"));
    }

    #[test]
    fn system_files_are_hidden_by_default() {
        let mut trace = default_trace(&["Rikerfile".to_string()]);
        let root = trace.root;
        trace.steps.push(Step::PathRef {
            cmd: root,
            base: crate::ir::REF_ROOT,
            path: "usr/lib/libc.so".into(),
            flags: AccessFlags::default(),
            out: 6,
        });
        trace.steps.push(Step::MatchContent {
            cmd: root,
            ref_id: 6,
            expected: crate::ir::VersionSpec::File {
                fingerprint: None,
                saved: false,
            },
        });

        let mut hidden = Vec::new();
        trace.send_to(&mut GraphWriter::new(&mut hidden, false));
        assert!(!String::from_utf8(hidden).unwrap().contains("libc.so"));

        let mut shown = Vec::new();
        trace.send_to(&mut GraphWriter::new(&mut shown, true));
        assert!(String::from_utf8(shown).unwrap().contains("libc.so"));
    }
}
