use crate::*;

/// First build runs the build script; the second detects no changes.
#[test]
fn first_build_then_no_op() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;

    let out = space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert_output_contains(&out, "ran 1 command");
    assert!(space.exists("out"));
    assert!(space.exists(".rkr/db"));

    let out = space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert_output_contains(&out, "No changes detected");
    Ok(())
}

/// With no subcommand, rkr builds.
#[test]
fn default_subcommand_is_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    space.run_expect(&mut rkr_command(vec![]))?;
    assert!(space.exists("out"));
    Ok(())
}

/// Dry run prints the command but executes nothing.
#[test]
fn dry_run_executes_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;

    let out = space.run_expect(&mut rkr_command(vec!["build", "--dry-run"]))?;
    assert_output_contains(&out, "Rikerfile");
    assert_output_contains(&out, "would run 1 command");
    assert!(!space.exists("out"));
    assert!(!space.exists(".rkr/db"));
    Ok(())
}

/// A failing build command surfaces as exit code 1.
#[test]
fn failing_command_exits_one() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "exit 7\n")?;

    let out = space.run(&mut rkr_command(vec!["build"]))?;
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}

/// check reports what a first build would do without running it.
#[test]
fn check_reports_without_running() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;

    let out = space.run_expect(&mut rkr_command(vec!["check"]))?;
    assert_output_contains(&out, "All commands that must rerun:");
    assert_output_contains(&out, "Rikerfile");
    assert!(!space.exists("out"));

    space.run_expect(&mut rkr_command(vec!["build"]))?;
    let out = space.run_expect(&mut rkr_command(vec!["check"]))?;
    assert_output_contains(&out, "No changes detected");
    Ok(())
}

/// An executable build script runs directly.
#[test]
fn executable_build_script() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "#!/bin/sh\ntouch out\n")?;
    let path = space.path().join("Rikerfile");
    let mut perms = std::fs::metadata(&path)?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;

    space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert!(space.exists("out"));
    Ok(())
}

/// Build output is echoed through.
#[test]
fn command_output_is_visible() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "echo greetings from the build\n")?;
    let out = space.run_expect(&mut rkr_command(vec!["build"]))?;
    assert_output_contains(&out, "greetings from the build");
    Ok(())
}

/// --print-on-run echoes the command line itself.
#[test]
fn print_on_run_echoes_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Rikerfile", "touch out\n")?;
    let out = space.run_expect(&mut rkr_command(vec!["build", "--print-on-run"]))?;
    assert_output_contains(&out, "Rikerfile");
    Ok(())
}
