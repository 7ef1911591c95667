//! tmt - task monitoring tracer.
//!
//! Traces the process lifecycle and scheduling of one launched command and
//! everything it spawns, then reconstructs a process tree with a liveness
//! timeline and per-CPU on-CPU slices.
//!
//! # Modules
//!
//! - [`backend`] - event sources: the BPF skeleton (feature `bpf`) and an
//!   in-memory source for tests
//! - [`ancestry`] - the growing set of ids that belong to the traced subtree
//! - [`handler`] / [`coordinator`] - polling, filtering and the end-of-trace drain
//! - [`merge`], [`process`], [`sched`] - analysis of the finalized logs
//! - [`output`] - CSV and JSON lines exporters
//!
//! # Example
//!
//! ```no_run
//! use tmt::{run, Config};
//!
//! let config = Config {
//!     command: Some("make -j8".to_string()),
//!     ..Default::default()
//! };
//! let exit_code = run(&config).expect("trace failed");
//! std::process::exit(exit_code);
//! ```

pub mod ancestry;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handler;
pub mod merge;
pub mod output;
pub mod process;
pub mod sched;
pub mod traced_command;
pub mod tracer_core;
pub mod utils;

pub use error::TraceError;
pub use tracer_core::{get_available_sources, run, trace, Config, TraceReport};

/// Initialise `env_logger`. `RUST_LOG` wins if set, otherwise `verbosity`
/// selects info, debug or trace.
pub fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    // A logger may already be installed, e.g. by a test harness.
    let _ = builder.try_init();
}
