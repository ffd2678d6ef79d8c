pub mod artifact;
pub mod cache;
pub mod command;
pub mod commit;
pub mod db;
pub mod densemap;
pub mod deps;
pub mod emulate;
pub mod env;
pub mod flags;
pub mod graph;
pub mod hash;
pub mod ir;
pub mod observer;
pub mod options;
pub mod plan;
pub mod process;
pub mod progress;
pub mod resolve;
pub mod run;
pub mod signal;
pub mod tracer;
pub mod version;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
