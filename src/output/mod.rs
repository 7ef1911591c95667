//! Output format abstraction layer
//!
//! Exporters receive the finished, read-only analysis through [`TraceOutput`].
//! [`CsvOutput`] writes the tabular artifacts into a directory and
//! [`JsonLinesOutput`] dumps the merged event log, one JSON object per line.

mod csv;
mod jsonl;

pub use self::csv::{CsvOutput, LIVENESS_FILE, RANKING_FILE, SLICES_FILE};
pub use self::jsonl::JsonLinesOutput;

use std::io::Write;

use anyhow::Result;

use crate::merge::MergedLog;
use crate::process::IntervalSample;
use crate::sched::{CpuRuntime, OnCpuSlice, TimeUnit};

/// Every method defaults to doing nothing so a format only implements what it
/// has a representation for.
pub trait TraceOutput {
    /// Live process count over time.
    fn write_liveness(&mut self, _samples: &[IntervalSample]) -> Result<()> {
        Ok(())
    }

    fn write_slices(&mut self, _slices: &[OnCpuSlice]) -> Result<()> {
        Ok(())
    }

    /// Per-CPU runtime ranking, totals converted to `unit`.
    fn write_ranking(&mut self, _ranking: &[CpuRuntime], _unit: TimeUnit) -> Result<()> {
        Ok(())
    }

    fn write_events(&mut self, _log: &MergedLog) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Print the merged log, one event per line.
pub fn print_raw(log: &MergedLog, out: &mut dyn Write) -> Result<()> {
    for event in log.events() {
        writeln!(out, "{event}")?;
    }
    Ok(())
}
