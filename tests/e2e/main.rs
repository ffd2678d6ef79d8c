//! Support code for e2e tests, which run rkr as a binary against a
//! temporary project directory.

mod basic;
mod regen;

pub fn rkr_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("rkr")
}

pub fn rkr_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(rkr_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Use print! so the Rust test framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    if !stdout.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    if stdout.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

/// Manages a temporary directory for invoking rkr.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    /// Invoke rkr, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test. Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}
