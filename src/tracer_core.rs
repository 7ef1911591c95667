//! Configuration, the source table, and the trace pipeline that ties the
//! coordinator to the analysis engines and the exporters.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, log_enabled, warn, Level};

use crate::ancestry::MembershipSet;
use crate::backend::EventSource;
use crate::coordinator::{Capture, DrainCoordinator, Launcher};
use crate::error::TraceError;
use crate::handler::{DrainBudget, DrainReport};
use crate::merge::MergedLog;
use crate::output::{print_raw, CsvOutput, JsonLinesOutput, TraceOutput};
use crate::process::ProcessTree;
use crate::sched::{build_slices, top_runtime_per_cpu, CpuRuntime, OnCpuSlice, TimeUnit};

/// Information about an available event source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Get list of all available sources, in the order their handlers are created.
pub fn get_available_sources() -> Vec<SourceInfo> {
    vec![
        SourceInfo {
            name: "execve",
            description: "execve entry and exit (sys_enter_execve, sys_exit_execve)",
        },
        SourceInfo {
            name: "fork",
            description: "task creation (sched_process_fork)",
        },
        SourceInfo {
            name: "clone",
            description: "clone() returning in the parent (sys_exit_clone)",
        },
        SourceInfo {
            name: "clone3",
            description: "clone3() returning in the parent (sys_exit_clone3)",
        },
        SourceInfo {
            name: "exit",
            description: "thread exit (sys_enter_exit)",
        },
        SourceInfo {
            name: "exit_group",
            description: "thread group exit (sys_enter_exit_group)",
        },
        SourceInfo {
            name: "sched",
            description: "context switches as run/desched pairs (sched_switch)",
        },
    ]
}

pub fn source_names() -> Vec<&'static str> {
    get_available_sources().iter().map(|s| s.name).collect()
}

/// Every name must be known and appear once. Two handlers on one ring buffer
/// would split its records and both come up short against the same counter.
pub fn validate_source_names(names: &[String]) -> Result<(), TraceError> {
    let valid = source_names();
    let mut seen = HashSet::new();
    for name in names {
        if !valid.contains(&name.as_str()) {
            return Err(TraceError::InvalidSource {
                name: name.clone(),
                valid: valid.join(", "),
            });
        }
        if !seen.insert(name.as_str()) {
            return Err(TraceError::DuplicateSource(name.clone()));
        }
    }
    Ok(())
}

/// Runtime options, separated from the CLI parsing concerns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shell command to trace.
    pub command: Option<String>,
    /// How long a polling thread waits on an empty ring buffer.
    pub poll_timeout: Duration,
    /// Consecutive zero-yield polls before a drain gives up.
    pub drain_idle_polls: u32,
    /// Sleep between zero-yield drain polls.
    pub drain_poll_interval: Duration,
    pub sources: Vec<String>,
    pub output_dir: PathBuf,
    /// Entries per CPU in the runtime ranking.
    pub top_n: usize,
    pub time_unit: TimeUnit,
    /// Print the merged log to stdout.
    pub print_raw: bool,
    /// Dump the merged log as JSON lines to this path.
    pub events_json: Option<PathBuf>,
    /// 0 = info, 1 = debug, 2+ = trace
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            command: None,
            poll_timeout: Duration::from_millis(100),
            drain_idle_polls: 5000,
            drain_poll_interval: Duration::from_millis(1),
            sources: source_names().into_iter().map(String::from).collect(),
            output_dir: PathBuf::from("out"),
            top_n: 10,
            time_unit: TimeUnit::Ms,
            print_raw: false,
            events_json: None,
            verbosity: 0,
        }
    }
}

impl Config {
    pub fn drain_budget(&self) -> DrainBudget {
        DrainBudget {
            max_idle_polls: self.drain_idle_polls,
            poll_interval: self.drain_poll_interval,
        }
    }

    /// Reject configurations that cannot start a trace, before anything is
    /// attached.
    pub fn validate(&self) -> Result<(), TraceError> {
        match self.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => {}
            _ => return Err(TraceError::CommandNotSet),
        }
        validate_source_names(&self.sources)
    }
}

/// Analysis results of one trace, read-only for the exporters.
#[derive(Debug)]
pub struct TraceReport {
    pub root_pid: u32,
    pub exit_code: i32,
    pub members: usize,
    pub drain: Vec<DrainReport>,
    pub log: MergedLog,
    pub tree: ProcessTree,
    pub slices: Vec<OnCpuSlice>,
    pub ranking: Vec<CpuRuntime>,
}

impl TraceReport {
    /// Merge the finalized logs and run both engines over the result.
    pub fn analyze(capture: Capture, top_n: usize) -> Self {
        let log = MergedLog::from_logs(capture.logs);
        let tree = ProcessTree::build(log.events(), capture.root_pid);
        let slices = build_slices(log.events());
        let ranking = top_runtime_per_cpu(&slices, top_n);
        TraceReport {
            root_pid: capture.root_pid,
            exit_code: capture.exit_code,
            members: capture.members,
            drain: capture.reports,
            log,
            tree,
            slices,
            ranking,
        }
    }

    pub fn shortfall(&self) -> u64 {
        self.drain.iter().map(|r| r.shortfall).sum()
    }

    pub fn write(&self, output: &mut dyn TraceOutput, unit: TimeUnit) -> Result<()> {
        output.write_liveness(self.tree.samples())?;
        output.write_slices(&self.slices)?;
        output.write_ranking(&self.ranking, unit)?;
        output.write_events(&self.log)?;
        output.flush()
    }

    /// The trace length is printed too, since the liveness series ends at
    /// its last change rather than at the end of the trace.
    pub fn print_summary(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "pid {} exited with {}: {} events over {} ns, {} processes, {} slices, {} members",
            self.root_pid,
            self.exit_code,
            self.log.len(),
            self.log.duration_ns(),
            self.tree.root().len(),
            self.slices.len(),
            self.members
        )?;
        for report in &self.drain {
            write!(
                out,
                "  {:<10} read {:>8} / {:<8} admitted {:>8}",
                report.source, report.read, report.expected, report.admitted
            )?;
            if report.shortfall > 0 {
                write!(out, "  SHORT {}", report.shortfall)?;
            }
            if let Some(missed) = report.missed.filter(|m| *m > 0) {
                write!(out, "  dropped {missed}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Trace `config.command` over `sources` and analyze the result.
pub fn trace(
    config: &Config,
    sources: Vec<Box<dyn EventSource>>,
    launcher: &mut dyn Launcher,
) -> Result<TraceReport> {
    config.validate()?;
    let members = Arc::new(MembershipSet::for_tracer());
    let coordinator =
        DrainCoordinator::new(sources, members, config.poll_timeout, config.drain_budget());
    let capture = coordinator.run(config.command.as_deref(), launcher)?;
    if capture.shortfall() > 0 {
        warn!(
            "trace is incomplete: {} records never arrived",
            capture.shortfall()
        );
    }
    Ok(TraceReport::analyze(capture, config.top_n))
}

/// Write every artifact `config` asks for.
pub fn export(report: &TraceReport, config: &Config) -> Result<()> {
    let mut csv = CsvOutput::new(&config.output_dir)?;
    report.write(&mut csv, config.time_unit)?;

    if let Some(path) = config.events_json.as_deref() {
        let mut json = JsonLinesOutput::create(path)?;
        report.write(&mut json, config.time_unit)?;
        info!("Wrote {} events to {}", report.log.len(), path.display());
    }

    if config.print_raw {
        print_raw(&report.log, &mut io::stdout().lock())?;
    }

    if log_enabled!(Level::Debug) {
        debug!("process tree:\n{}", report.tree.render());
    }
    Ok(())
}

#[cfg(feature = "bpf")]
fn trace_with_kernel(config: &Config) -> Result<TraceReport> {
    use crate::backend::bpf::with_bpf_sources;
    use crate::traced_command::ShellLauncher;

    with_bpf_sources(&config.sources, |sources| {
        let mut launcher = ShellLauncher::default();
        trace(config, sources, &mut launcher)
    })
}

#[cfg(not(feature = "bpf"))]
fn trace_with_kernel(_config: &Config) -> Result<TraceReport> {
    anyhow::bail!("tmt was built without the `bpf` feature, rebuild with `--features bpf` to trace")
}

/// Run a full trace against the kernel. Returns the command's exit code.
pub fn run(config: &Config) -> Result<i32> {
    config.validate()?;
    let report = trace_with_kernel(config)?;
    export(&report, config)?;
    report.print_summary(&mut io::stdout().lock())?;
    Ok(report.exit_code)
}
