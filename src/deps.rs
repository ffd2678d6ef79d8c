//! Dependency-manifest subcommands: map the system files a traced build read
//! to the packages that own them, and turn that manifest into an installable
//! container definition.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::artifact::Content;
use crate::env::Env;

pub const DEPS_FILE: &str = ".rkr-deps";

/// Walk the emulated environment and write the package list to `.rkr-deps`,
/// one package per line.
pub fn gen_deps(env: &Env, project_root: &Path) -> anyhow::Result<usize> {
    let mut packages = BTreeSet::new();
    for (id, artifact) in env.artifacts.iter() {
        // Directories and special files never map to a package cleanly.
        match artifact.content {
            Content::File { .. } | Content::Symlink { .. } => {}
            _ => continue,
        }
        let path = match env.path_of(id) {
            Some(p) => p,
            None => continue,
        };
        if !wanted(&path, project_root) {
            continue;
        }
        if let Some(package) = package_for(&path) {
            packages.insert(package);
        }
    }

    let mut f = std::fs::File::create(DEPS_FILE).context("create .rkr-deps")?;
    for package in &packages {
        writeln!(f, "{}", package)?;
    }
    Ok(packages.len())
}

/// Paths that can meaningfully belong to a package: absolute, outside the
/// project, and not kernel-synthesized.
fn wanted(path: &Path, project_root: &Path) -> bool {
    if !path.is_absolute() || path.starts_with(project_root) {
        return false;
    }
    if path.starts_with("/proc") || path.starts_with("/sys") || path.starts_with("/dev") {
        return false;
    }
    if path.starts_with("/tmp") || path.starts_with("/home") {
        return false;
    }
    true
}

/// Ask dpkg which package owns `path`, trying the usual hard-link aliases
/// (/bin vs /usr/bin, /usr vs /usr/local) when the literal path is unknown.
fn package_for(path: &Path) -> Option<String> {
    if let Some(package) = dpkg_search(path) {
        return Some(package);
    }
    for alias in aliases(path) {
        if !same_inode(path, &alias) {
            continue;
        }
        if let Some(package) = dpkg_search(&alias) {
            return Some(package);
        }
    }
    None
}

fn aliases(path: &Path) -> Vec<PathBuf> {
    let s = path.to_string_lossy();
    let mut out = Vec::new();
    if let Some(rest) = s.strip_prefix("/usr/local") {
        out.push(PathBuf::from(rest));
        out.push(PathBuf::from(format!("/usr{}", rest)));
    } else if let Some(rest) = s.strip_prefix("/usr") {
        out.push(PathBuf::from(rest));
        out.push(PathBuf::from(format!("/usr/local{}", rest)));
    } else {
        out.push(PathBuf::from(format!("/usr{}", s)));
        out.push(PathBuf::from(format!("/usr/local{}", s)));
    }
    out
}

fn same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

fn dpkg_search(path: &Path) -> Option<String> {
    let out = std::process::Command::new("dpkg")
        .arg("-S")
        .arg(path)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout);
    // "package: /the/path"
    let first = text.lines().next()?;
    let package = first.split(':').next()?.trim();
    if package.is_empty() {
        None
    } else {
        Some(package.to_string())
    }
}

/// Install every package from `.rkr-deps` that is not already present.
pub fn install_deps() -> anyhow::Result<()> {
    let deps = std::fs::read_to_string(DEPS_FILE)
        .with_context(|| format!("{} not found; run gen-deps first", DEPS_FILE))?;
    for package in deps.lines().filter(|l| !l.is_empty()) {
        let installed = std::process::Command::new("dpkg-query")
            .args(["-W", package])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if installed {
            println!("{} is already installed", package);
            continue;
        }
        println!("installing {}", package);
        let status = std::process::Command::new("apt-get")
            .args(["install", "-y", package])
            .status()
            .context("run apt-get")?;
        if !status.success() {
            anyhow::bail!("failed to install {}", package);
        }
    }
    Ok(())
}

/// Write a dev-container definition that installs the manifest's packages.
pub fn gen_container() -> anyhow::Result<()> {
    let deps = std::fs::read_to_string(DEPS_FILE)
        .with_context(|| format!("{} not found; run gen-deps first", DEPS_FILE))?;

    std::fs::create_dir_all(".devcontainer")?;
    let mut settings = std::fs::File::create(".devcontainer/devcontainer.json")?;
    writeln!(
        settings,
        "{{\n  \"name\": \"Container\",\n  \"dockerFile\": \"Dockerfile\",\n  \"remoteUser\": \"vscode\"\n}}"
    )?;

    let mut dockerfile = std::fs::File::create(".devcontainer/Dockerfile")?;
    writeln!(dockerfile, "FROM ubuntu:22.04")?;
    writeln!(dockerfile, "ENV DEBIAN_FRONTEND=noninteractive")?;
    writeln!(
        dockerfile,
        "RUN apt-get update && apt-get -y install --no-install-recommends \\"
    )?;
    for package in deps.lines().filter(|l| !l.is_empty()) {
        writeln!(dockerfile, "  {} \\", package)?;
    }
    writeln!(
        dockerfile,
        "  && apt-get autoremove -y && apt-get clean -y && rm -rf /var/lib/apt/lists/*"
    )?;
    writeln!(dockerfile, "ENV DEBIAN_FRONTEND=dialog")?;
    Ok(())
}
