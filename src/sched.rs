//! On-CPU slices from run/desched pairs, and per-CPU runtime rankings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::Serialize;

use crate::error::TraceError;
use crate::events::{EventKind, RawEvent, SchedReason};

/// Why a slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SliceReason {
    Desched(SchedReason),
    /// Still on a CPU when the trace stopped.
    EndOfTrace,
}

impl fmt::Display for SliceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceReason::Desched(reason) => reason.fmt(f),
            SliceReason::EndOfTrace => f.write_str("end of trace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnCpuSlice {
    pub pid: u32,
    pub cpu: u32,
    pub command: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub delta_ns: u64,
    pub reason: SliceReason,
}

/// A task that was switched in and has not been switched out yet.
struct OpenSlice {
    start_ns: u64,
    cpu: u32,
    command: String,
}

/// Pairs run and desched events into slices.
///
/// Open slices are keyed by pid only. A pid seen running on a second CPU
/// without a desched in between replaces the first open slice.
#[derive(Default)]
pub struct SliceBuilder {
    open: HashMap<u32, OpenSlice>,
    slices: Vec<OnCpuSlice>,
    max_ts: u64,
    non_causal: usize,
}

impl SliceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-scheduler events are ignored.
    pub fn handle_event(&mut self, event: &RawEvent) {
        if !event.kind.is_sched() {
            return;
        }
        self.max_ts = self.max_ts.max(event.timestamp);

        if event.kind == EventKind::Run {
            self.open.insert(
                event.pid,
                OpenSlice {
                    start_ns: event.timestamp,
                    cpu: event.cpu,
                    command: event.command.clone(),
                },
            );
            return;
        }

        let Some(open) = self.open.remove(&event.pid) else {
            return;
        };
        if event.timestamp <= open.start_ns {
            self.non_causal += 1;
            return;
        }
        self.slices.push(OnCpuSlice {
            pid: event.pid,
            cpu: open.cpu,
            command: open.command,
            start_ns: open.start_ns,
            end_ns: event.timestamp,
            delta_ns: event.timestamp - open.start_ns,
            reason: SliceReason::Desched(event.reason),
        });
    }

    /// Close every still-open slice at the latest scheduler timestamp seen.
    /// Unlike desched pairing, nothing is dropped here.
    pub fn finish(mut self) -> Vec<OnCpuSlice> {
        let end_ns = self.max_ts;
        // Sorted by pid so the synthetic slices come out deterministically.
        let pending: BTreeMap<u32, OpenSlice> = self.open.drain().collect();
        debug!(
            "closing {} pending slices at {end_ns}, {} non-causal pairs dropped",
            pending.len(),
            self.non_causal
        );
        // max_ts bounds every start, so a task switched in at the very end
        // still gets a zero-length slice.
        for (pid, open) in pending {
            self.slices.push(OnCpuSlice {
                pid,
                cpu: open.cpu,
                command: open.command,
                start_ns: open.start_ns,
                end_ns,
                delta_ns: end_ns - open.start_ns,
                reason: SliceReason::EndOfTrace,
            });
        }
        self.slices
    }
}

pub fn build_slices(events: &[RawEvent]) -> Vec<OnCpuSlice> {
    let mut builder = SliceBuilder::new();
    for event in events {
        builder.handle_event(event);
    }
    builder.finish()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Ns,
    Us,
    #[default]
    Ms,
    S,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Ns => "ns",
            TimeUnit::Us => "us",
            TimeUnit::Ms => "ms",
            TimeUnit::S => "s",
        }
    }

    pub fn nanos_per_unit(&self) -> f64 {
        match self {
            TimeUnit::Ns => 1.0,
            TimeUnit::Us => 1e3,
            TimeUnit::Ms => 1e6,
            TimeUnit::S => 1e9,
        }
    }

    pub fn scale(&self, nanos: u64) -> f64 {
        nanos as f64 / self.nanos_per_unit()
    }
}

impl FromStr for TimeUnit {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" => Ok(TimeUnit::Ns),
            "us" | "µs" => Ok(TimeUnit::Us),
            "ms" => Ok(TimeUnit::Ms),
            "s" => Ok(TimeUnit::S),
            other => Err(TraceError::InvalidTimeUnit(other.to_string())),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total on-CPU time of one `(pid, command)` on one CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEntry {
    pub pid: u32,
    pub command: String,
    pub total_ns: u64,
}

impl RuntimeEntry {
    pub fn label(&self) -> String {
        format!("{}:{}", self.command, self.pid)
    }
}

/// Ranked consumers of one CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuRuntime {
    pub cpu: u32,
    /// Sum over every group on this CPU, not only the ranked ones.
    pub total_ns: u64,
    pub top: Vec<RuntimeEntry>,
}

/// Group slices by `(cpu, pid, command)` and keep the `top_n` largest totals
/// per CPU, largest first. Ties are broken by label so the output only
/// depends on its input.
pub fn top_runtime_per_cpu(slices: &[OnCpuSlice], top_n: usize) -> Vec<CpuRuntime> {
    let mut totals: BTreeMap<(u32, u32, &str), u64> = BTreeMap::new();
    for slice in slices {
        *totals
            .entry((slice.cpu, slice.pid, slice.command.as_str()))
            .or_default() += slice.delta_ns;
    }

    let mut per_cpu: BTreeMap<u32, Vec<RuntimeEntry>> = BTreeMap::new();
    for ((cpu, pid, command), total_ns) in totals {
        per_cpu.entry(cpu).or_default().push(RuntimeEntry {
            pid,
            command: command.to_string(),
            total_ns,
        });
    }

    per_cpu
        .into_iter()
        .map(|(cpu, mut entries)| {
            let total_ns = entries.iter().map(|e| e.total_ns).sum();
            entries.sort_by(|a, b| {
                b.total_ns
                    .cmp(&a.total_ns)
                    .then_with(|| a.label().cmp(&b.label()))
            });
            entries.truncate(top_n);
            CpuRuntime {
                cpu,
                total_ns,
                top: entries,
            }
        })
        .collect()
}
