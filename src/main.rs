use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;

use tmt::sched::TimeUnit;
use tmt::{get_available_sources, init_logger, run, Config};

#[derive(Debug, Parser)]
#[command(version, about = "Trace a command's process tree and scheduling")]
struct Command {
    /// Shell command to launch and trace
    #[arg(short, long)]
    cmd: Option<String>,
    /// Directory for the CSV artifacts
    #[arg(short, long, default_value = "out")]
    output_dir: PathBuf,
    /// Entries per CPU in the runtime ranking
    #[arg(long, default_value = "10")]
    top_n: usize,
    /// Unit of the runtime ranking: ns, us, ms or s
    #[arg(long, default_value = "ms")]
    time_unit: String,
    /// Event sources to enable, all by default
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,
    /// Print the merged event log
    #[arg(long)]
    print_raw: bool,
    /// Write the merged event log as JSON lines
    #[arg(long)]
    events_json: Option<PathBuf>,
    #[arg(long, default_value = "100")]
    poll_timeout_ms: u64,
    /// Zero-yield polls before a drain gives up
    #[arg(long, default_value = "5000")]
    drain_idle_polls: u32,
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// List the available event sources and exit
    #[arg(long)]
    list_sources: bool,
}

impl Command {
    fn into_config(self) -> Result<Config> {
        let mut config = Config {
            command: self.cmd,
            poll_timeout: std::time::Duration::from_millis(self.poll_timeout_ms),
            drain_idle_polls: self.drain_idle_polls,
            output_dir: self.output_dir,
            top_n: self.top_n,
            time_unit: self.time_unit.parse::<TimeUnit>()?,
            print_raw: self.print_raw,
            events_json: self.events_json,
            verbosity: self.verbose,
            ..Default::default()
        };
        if !self.sources.is_empty() {
            config.sources = self.sources;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logger(opts.verbose);

    if opts.list_sources {
        println!("Available sources:");
        for source in get_available_sources() {
            println!("  {:<12} {}", source.name, source.description);
        }
        return Ok(());
    }

    let config = opts.into_config()?;
    let exit_code = run(&config)?;
    process::exit(exit_code);
}
