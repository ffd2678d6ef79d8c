//! The interface the engine drives to execute commands for real. The
//! syscall-level tracer (ptrace/seccomp) is an external collaborator; the
//! bundled tracer runs commands through posix_spawn and reports lifecycle
//! records only. A command rerun under it regains fine-grained dependency
//! records only once a syscall tracer is attached in its place.

use crate::ir::{CommandId, IRSink, Step};
use crate::process;

pub trait Tracer {
    /// Run `args` to completion, emitting the command's IR records into
    /// `sink`. Returns the exit status.
    fn run(&mut self, cmd: CommandId, args: &[String], sink: &mut dyn IRSink)
        -> anyhow::Result<i32>;
}

/// Executes commands without syscall interception.
pub struct ProcessTracer {
    /// Echo the command's combined output.
    pub echo_output: bool,
}

impl ProcessTracer {
    pub fn new() -> ProcessTracer {
        ProcessTracer { echo_output: true }
    }
}

impl Default for ProcessTracer {
    fn default() -> Self {
        ProcessTracer::new()
    }
}

impl Tracer for ProcessTracer {
    fn run(
        &mut self,
        cmd: CommandId,
        args: &[String],
        sink: &mut dyn IRSink,
    ) -> anyhow::Result<i32> {
        let argv = runnable_argv(args);
        let (status, output) = process::run_command(&argv)?;
        if self.echo_output && !output.is_empty() {
            // Raw bytes: build output is not necessarily UTF-8.
            use std::io::Write;
            let stdout = std::io::stdout();
            let _ = stdout.lock().write_all(&output);
        }
        sink.step(&Step::Exit {
            cmd,
            exit_status: status,
        });
        Ok(status)
    }
}

/// A script that is not directly executable is run through the shell, the
/// same way execvp degrades for ENOEXEC.
fn runnable_argv(args: &[String]) -> Vec<String> {
    if let Some(first) = args.first() {
        let path = std::path::Path::new(first);
        if path.exists() && !is_executable(path) {
            let mut argv = vec!["/bin/sh".to_string()];
            argv.extend(args.iter().cloned());
            return argv;
        }
    }
    args.to_vec()
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NullSink;

    #[test]
    fn reports_exit_status_and_emits_exit() {
        struct Collect(Vec<Step>);
        impl IRSink for Collect {
            fn step(&mut self, step: &Step) {
                self.0.push(step.clone());
            }
        }

        let mut tracer = ProcessTracer {
            echo_output: false,
        };
        let mut sink = Collect(Vec::new());
        let status = tracer
            .run(
                CommandId(1),
                &["/bin/sh".to_string(), "-c".to_string(), "exit 2".to_string()],
                &mut sink,
            )
            .unwrap();
        assert_eq!(status, 2);
        assert_eq!(
            sink.0,
            vec![Step::Exit {
                cmd: CommandId(1),
                exit_status: 2
            }]
        );
    }

    #[test]
    fn non_executable_scripts_run_through_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script");
        std::fs::write(&script, "exit 0\n").unwrap();

        let mut tracer = ProcessTracer {
            echo_output: false,
        };
        let status = tracer
            .run(
                CommandId(1),
                &[script.to_string_lossy().into_owned()],
                &mut NullSink,
            )
            .unwrap();
        assert_eq!(status, 0);
    }
}
