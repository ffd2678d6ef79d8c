//! Command-line entry points: argument parsing, subcommand dispatch, and the
//! plan-then-execute build orchestration.

use std::path::PathBuf;

use anyhow::Context;

use crate::cache::Cache;
use crate::db;
use crate::emulate;
use crate::env::Env;
use crate::graph::GraphWriter;
use crate::ir::{NullSink, Trace, TracePrinter};
use crate::observer::NullObserver;
use crate::options::Options;
use crate::plan::Planner;
use crate::progress::ConsoleProgress;
use crate::signal;
use crate::tracer::ProcessTracer;

/// Where persisted state lives, relative to the project root.
const STATE_DIR: &str = ".rkr";
/// The executable build script that drives a first build.
const BUILD_FILE: &str = "Rikerfile";

#[derive(argh::FromArgs)]
/// rkr, a forward build system: run a build script once under tracing, then
/// rerun only the commands whose dependencies changed.
struct TopOpts {
    #[argh(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Cmd {
    Build(BuildOpts),
    Check(CheckOpts),
    GenDeps(GenDepsOpts),
    InstallDeps(InstallDepsOpts),
    GenContainer(GenContainerOpts),
    Graph(GraphOpts),
}

#[derive(argh::FromArgs, Default)]
#[argh(subcommand, name = "build")]
/// run the build, rerunning only what changed
struct BuildOpts {
    /// print the commands that would run without executing them
    #[argh(switch)]
    dry_run: bool,

    /// echo each command as it runs
    #[argh(switch)]
    print_on_run: bool,

    /// do not stage outputs from the content cache
    #[argh(switch)]
    no_cache: bool,

    /// evaluate every recorded predicate, even repeats
    #[argh(switch)]
    no_skip_checks: bool,

    /// debugging tools; use "-d list" to list them
    #[argh(option, short = 'd')]
    debug: Option<String>,
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "check")]
/// report which commands would rerun, without running anything
struct CheckOpts {
    /// also write stageable cached state to disk
    #[argh(switch)]
    commit: bool,

    /// do not stage outputs from the content cache
    #[argh(switch)]
    no_cache: bool,
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "gen-deps")]
/// write the packages the traced build depends on to .rkr-deps
struct GenDepsOpts {}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "install-deps")]
/// install any missing packages listed in .rkr-deps
struct InstallDepsOpts {}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "gen-container")]
/// generate a dev-container definition from .rkr-deps
struct GenContainerOpts {}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "graph")]
/// render the traced build as Graphviz dot
struct GraphOpts {
    /// include system files in the graph
    #[argh(switch)]
    show_sysfiles: bool,

    /// output path (defaults to stdout)
    #[argh(option, short = 'o')]
    output: Option<String>,
}

pub fn run() -> anyhow::Result<i32> {
    let top: TopOpts = argh::from_env();
    match top.cmd.unwrap_or(Cmd::Build(BuildOpts::default())) {
        Cmd::Build(opts) => build(opts),
        Cmd::Check(opts) => check(opts),
        Cmd::GenDeps(_) => gen_deps(),
        Cmd::InstallDeps(_) => {
            crate::deps::install_deps()?;
            Ok(0)
        }
        Cmd::GenContainer(_) => {
            crate::deps::gen_container()?;
            Ok(0)
        }
        Cmd::Graph(opts) => graph(opts),
    }
}

fn state_dir() -> PathBuf {
    PathBuf::from(STATE_DIR)
}

fn load_trace() -> Trace {
    db::load(&state_dir().join("db"), &[BUILD_FILE.to_string()])
}

fn build(opts: BuildOpts) -> anyhow::Result<i32> {
    signal::register_sigint();
    let state = state_dir();
    std::fs::create_dir_all(&state).with_context(|| format!("create {:?}", state))?;

    let options = Options {
        enable_cache: !opts.no_cache,
        skip_repeat_checks: !opts.no_skip_checks,
        print_on_run: opts.print_on_run,
        dry_run: opts.dry_run,
        ..Options::default()
    };

    let mut trace = load_trace();
    let cache = Cache::new(state.join("cache"));

    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  print the loaded trace as IR text");
                println!("  plan   print the rebuild plan and reasons");
                return Ok(1);
            }
            "trace" => {
                let stdout = std::io::stdout();
                trace.send_to(&mut TracePrinter::new(stdout.lock()));
                return Ok(0);
            }
            "plan" => {}
            other => anyhow::bail!("unknown -d {:?}, use -d list to list", other),
        }
    }

    // Planning pass: replay the trace and collect what changed.
    let mut plan_env = Env::new(state.clone());
    let mut planner = Planner::new(options.enable_cache);
    emulate::plan_build(&mut trace, &mut plan_env, &cache, &options, &mut planner);
    let plan = planner.plan();

    if opts.debug.as_deref() == Some("plan") {
        print_plan(&trace, &planner, &plan);
        return Ok(0);
    }

    // Execution pass: emulate the unchanged commands, run the rest.
    let mut env = Env::new(state.clone());
    let mut progress = ConsoleProgress::new(opts.print_on_run);
    let mut tracer = ProcessTracer::new();

    let (ran, failed) = if options.dry_run {
        let mut out = NullSink;
        emulate::execute_build(
            &mut trace,
            &mut env,
            &cache,
            &options,
            &plan,
            &mut out,
            &mut tracer,
            &mut progress,
        )
    } else {
        let new_db = state.join("db.new");
        let mut out = db::OutputTrace::create(&new_db)?;
        let result = emulate::execute_build(
            &mut trace,
            &mut env,
            &cache,
            &options,
            &plan,
            &mut out,
            &mut tracer,
            &mut progress,
        );
        out.into_result().context("write trace")?;
        std::fs::rename(&new_db, state.join("db")).context("install trace")?;
        result
    };

    if !options.dry_run {
        crate::commit::commit_all(&mut env, &cache)?;
        if options.enable_cache {
            env.save_all(&cache);
        }
    }

    progress.summary(ran, options.dry_run);
    if failed || signal::was_interrupted() {
        return Ok(1);
    }
    Ok(0)
}

fn check(opts: CheckOpts) -> anyhow::Result<i32> {
    let state = state_dir();
    std::fs::create_dir_all(&state)?;
    let options = Options {
        enable_cache: !opts.no_cache,
        ..Options::default()
    };

    let mut trace = load_trace();
    let cache = Cache::new(state.join("cache"));
    let mut env = Env::new(state.clone());
    let mut planner = Planner::new(options.enable_cache);
    emulate::plan_build(&mut trace, &mut env, &cache, &options, &mut planner);
    let plan = planner.plan();

    print_plan(&trace, &planner, &plan);

    if opts.commit {
        crate::commit::commit_all(&mut env, &cache)?;
    }
    Ok(0)
}

fn print_plan(trace: &Trace, planner: &Planner, plan: &crate::plan::RebuildPlan) {
    if plan.is_empty() {
        println!("No changes detected");
        return;
    }

    println!("Commands with changed inputs:");
    for &c in planner.changed() {
        println!("  {}", trace.commands.get(c).full_name());
    }
    println!();
    println!("Commands whose output is needed:");
    for &c in planner.output_needed() {
        println!("  {}", trace.commands.get(c).full_name());
    }
    println!();
    println!("All commands that must rerun:");
    for (c, reason) in plan.iter() {
        println!(
            "  {} ({})",
            trace.commands.get(c).full_name(),
            reason.describe()
        );
    }
}

fn gen_deps() -> anyhow::Result<i32> {
    let state = state_dir();
    std::fs::create_dir_all(&state)?;
    let options = Options::default();

    let mut trace = load_trace();
    let cache = Cache::new(state.join("cache"));
    let mut env = Env::new(state.clone());
    let mut obs = NullObserver;
    emulate::plan_build(&mut trace, &mut env, &cache, &options, &mut obs);

    let project_root = std::env::current_dir()?;
    let count = crate::deps::gen_deps(&env, &project_root)?;
    println!("wrote {} package{} to .rkr-deps", count, if count == 1 { "" } else { "s" });
    Ok(0)
}

fn graph(opts: GraphOpts) -> anyhow::Result<i32> {
    let trace = load_trace();
    match opts.output {
        Some(path) => {
            let f = std::fs::File::create(&path).with_context(|| format!("create {}", path))?;
            trace.send_to(&mut GraphWriter::new(f, opts.show_sysfiles));
        }
        None => {
            let stdout = std::io::stdout();
            trace.send_to(&mut GraphWriter::new(stdout.lock(), opts.show_sysfiles));
        }
    }
    Ok(0)
}
