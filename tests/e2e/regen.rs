//! Trace persistence behaviors: fallback on corruption, debug dumps, and
//! derived outputs.

use crate::*;

/// A corrupted trace falls back to rerunning the root command.
#[test]
fn corrupt_trace_falls_back_to_full_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    space.run_expect(&mut rkr_command(vec!["build"]))?;

    std::fs::remove_file(space.path().join("out"))?;
    space.write(".rkr/db", "this is not a trace")?;

    let out = space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert_output_contains(&out, "ran 1 command");
    assert!(space.exists("out"));
    Ok(())
}

/// A rebuilt trace is written back out, so the build converges.
#[test]
fn trace_survives_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;

    space.run_expect(&mut rkr_command(vec!["build"]))?;
    let db1 = space.read(".rkr/db")?;

    let out = space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert_output_contains(&out, "No changes detected");
    let db2 = space.read(".rkr/db")?;
    assert_eq!(db1, db2);
    Ok(())
}

/// -d trace dumps the stored records as readable IR.
#[test]
fn debug_trace_dump() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    space.run_expect(&mut rkr_command(vec!["build"]))?;

    let out = space.run_expect(&mut rkr_command(vec!["build", "-d", "trace"]))?;
    assert_output_contains(&out, "launch");
    assert_output_contains(&out, "exit");
    Ok(())
}

/// -d list names the available tools.
#[test]
fn debug_list() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    let out = space.run(&mut rkr_command(vec!["build", "-d", "list"]))?;
    assert_output_contains(&out, "debug tools:");
    Ok(())
}

/// graph renders the stored trace as dot.
#[test]
fn graph_renders_dot() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    space.run_expect(&mut rkr_command(vec!["build"]))?;

    let out = space.run_expect(&mut rkr_command(vec!["graph"]))?;
    assert_output_contains(&out, "digraph build");
    assert_output_contains(&out, "Rikerfile");
    Ok(())
}

/// gen-container turns a dependency manifest into a Dockerfile.
#[test]
fn gen_container_from_manifest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(".rkr-deps", "gcc\nlibc6-dev\n")?;

    space.run_expect(&mut rkr_command(vec!["gen-container"]))?;
    let dockerfile = String::from_utf8(space.read(".devcontainer/Dockerfile")?)?;
    assert!(dockerfile.contains("gcc"));
    assert!(dockerfile.contains("libc6-dev"));
    assert!(space.exists(".devcontainer/devcontainer.json"));
    Ok(())
}

/// gen-container without a manifest explains what to do.
#[test]
fn gen_container_requires_manifest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut rkr_command(vec!["gen-container"]))?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}
