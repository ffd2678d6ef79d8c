//! The configuration record threaded through the core. Every knob the engine
//! consults lives here; nothing reads globals.

#[derive(Debug, Clone)]
pub struct Options {
    /// Allow staging saved versions from the cache instead of rerunning the
    /// producer.
    pub enable_cache: bool,
    /// Skip input edges for versions a command itself created.
    pub ignore_self_reads: bool,
    /// Collapse consecutive content writes by the same command into one
    /// version.
    pub combine_writes: bool,
    /// Skip re-evaluating a predicate a command already checked this run.
    pub skip_repeat_checks: bool,
    /// Echo each command as it is executed.
    pub print_on_run: bool,
    /// Plan and print, but do not execute or commit.
    pub dry_run: bool,
    /// Include system paths in graph output.
    pub show_sysfiles: bool,
    /// Maximum symlink chain length before resolution fails with Loop.
    pub symlink_limit: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            enable_cache: true,
            ignore_self_reads: true,
            combine_writes: true,
            skip_repeat_checks: true,
            print_on_run: false,
            dry_run: false,
            show_sysfiles: false,
            symlink_limit: 40,
        }
    }
}
