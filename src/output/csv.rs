use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use super::TraceOutput;
use crate::process::IntervalSample;
use crate::sched::{CpuRuntime, OnCpuSlice, TimeUnit};

pub const LIVENESS_FILE: &str = "alive_series.csv";
pub const SLICES_FILE: &str = "oncpu_slices.csv";
pub const RANKING_FILE: &str = "top_runtime_per_cpu.csv";

/// Writes one CSV file per artifact into `dir`.
pub struct CsvOutput {
    dir: PathBuf,
}

impl CsvOutput {
    /// Creates `dir` if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        Ok(CsvOutput { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create(&self, name: &str) -> Result<BufWriter<File>> {
        let path = self.dir.join(name);
        let file =
            File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        info!("Writing {}", path.display());
        Ok(BufWriter::new(file))
    }
}

/// Quote a field if it would otherwise break the row. Commands are
/// user-controlled and may contain anything.
fn field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl TraceOutput for CsvOutput {
    fn write_liveness(&mut self, samples: &[IntervalSample]) -> Result<()> {
        let mut out = self.create(LIVENESS_FILE)?;
        writeln!(out, "time,alive")?;
        for sample in samples {
            writeln!(out, "{},{}", sample.time, sample.alive_count)?;
        }
        out.flush()?;
        Ok(())
    }

    fn write_slices(&mut self, slices: &[OnCpuSlice]) -> Result<()> {
        let mut out = self.create(SLICES_FILE)?;
        writeln!(out, "pid,cpu,command,start_ns,end_ns,delta_ns,reason")?;
        for slice in slices {
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                slice.pid,
                slice.cpu,
                field(&slice.command),
                slice.start_ns,
                slice.end_ns,
                slice.delta_ns,
                slice.reason
            )?;
        }
        out.flush()?;
        Ok(())
    }

    fn write_ranking(&mut self, ranking: &[CpuRuntime], unit: TimeUnit) -> Result<()> {
        let mut out = self.create(RANKING_FILE)?;
        writeln!(out, "cpu,rank,label,total_{unit}")?;
        for cpu in ranking {
            for (rank, entry) in cpu.top.iter().enumerate() {
                writeln!(
                    out,
                    "{},{},{},{}",
                    cpu.cpu,
                    rank + 1,
                    field(&entry.label()),
                    unit.scale(entry.total_ns)
                )?;
            }
        }
        out.flush()?;
        Ok(())
    }
}
