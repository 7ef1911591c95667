//! Kernel backend built on the libbpf skeleton of `src/bpf/tmt.bpf.c`.
//!
//! All programs for the selected sources are attached up front, with every
//! producer disabled. A source starts producing when it is installed and
//! stops when it is frozen, so records only flow while a handler is there to
//! consume them.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libbpf_rs::skel::{OpenSkel, SkelBuilder};
use libbpf_rs::{Link, MapCore, MapFlags, MapHandle, RingBuffer, RingBufferBuilder};
use log::{debug, info};
use plain::Plain;

use super::{EventSource, ProducerControl, RecordSink};
use crate::error::TraceError;
use crate::events::{EventKind, RawEvent, SchedReason};
use crate::utils::{comm_to_string, tgid_from_tgidpid, tid_from_tgidpid};

// Include BPF skeleton in a module to allow suppressing warnings from generated code
#[allow(unused_imports)]
#[allow(clippy::all)]
mod skel {
    include!(concat!(env!("OUT_DIR"), "/tmt.skel.rs"));
}

use skel::types::{proc_record, sched_record};
use skel::{TmtSkel, TmtSkelBuilder};

unsafe impl Plain for proc_record {}
unsafe impl Plain for sched_record {}

const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

// Must match enum source_index in tmt.bpf.c.
const SRC_EXECVE: u32 = 0;
const SRC_FORK: u32 = 1;
const SRC_CLONE: u32 = 2;
const SRC_CLONE3: u32 = 3;
const SRC_EXIT: u32 = 4;
const SRC_EXIT_GROUP: u32 = 5;
const SRC_SCHED: u32 = 6;

const SCHED_RUN: u32 = 1;
const REASON_PREEMPTED: u32 = 1;
const REASON_SLEPT: u32 = 2;

pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB. This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }
    Ok(())
}

fn decode_proc(kind: EventKind, r: &proc_record) -> RawEvent {
    RawEvent {
        kind,
        timestamp: r.ts,
        pid: r.pid,
        tid: tid_from_tgidpid(r.tgidpid),
        tgid: tgid_from_tgidpid(r.tgidpid),
        parent_pid: r.parent_pid,
        child_pid: r.child_pid,
        pgid: r.pgid,
        command: comm_to_string(&r.comm),
        cpu: 0,
        reason: SchedReason::None,
    }
}

fn decode_sched(r: &sched_record) -> RawEvent {
    let tid = tid_from_tgidpid(r.tgidpid);
    let tgid = tgid_from_tgidpid(r.tgidpid);
    let (kind, reason) = if r.kind == SCHED_RUN {
        (EventKind::Run, SchedReason::None)
    } else {
        let reason = match r.reason {
            REASON_PREEMPTED => SchedReason::Preempted,
            REASON_SLEPT => SchedReason::Slept,
            _ => SchedReason::None,
        };
        (EventKind::Desched, reason)
    };
    RawEvent {
        kind,
        timestamp: r.ts,
        pid: tid,
        tid,
        tgid,
        parent_pid: 0,
        child_pid: 0,
        pgid: tgid,
        command: comm_to_string(&r.comm),
        cpu: r.cpu,
        reason,
    }
}

/// How the records of one ring buffer are laid out.
#[derive(Debug, Clone, Copy)]
enum RecordFormat {
    Proc(EventKind),
    Sched,
}

fn handle_record(format: RecordFormat, data: &[u8], sink: &RecordSink) {
    match format {
        RecordFormat::Proc(kind) => {
            let mut record = proc_record::default();
            if plain::copy_from_bytes(&mut record, data).is_ok() {
                sink(decode_proc(kind, &record));
            }
        }
        RecordFormat::Sched => {
            let mut record = sched_record::default();
            if plain::copy_from_bytes(&mut record, data).is_ok() {
                sink(decode_sched(&record));
            }
        }
    }
}

fn sum_percpu(map: &MapHandle, index: u32) -> Result<u64> {
    let values = map
        .lookup_percpu(&index.to_ne_bytes(), MapFlags::ANY)
        .with_context(|| format!("Failed to read per-CPU slot {index}"))?;
    let mut total = 0;
    for cpu_data in values.unwrap_or_default() {
        let mut value: u64 = 0;
        if plain::copy_from_bytes(&mut value, &cpu_data).is_ok() {
            total += value;
        }
    }
    Ok(total)
}

pub struct BpfSource {
    // Dropped first: it references the ring buffer maps.
    ring: Option<RingBuffer<'static>>,
    name: &'static str,
    index: u32,
    rings: Vec<(RecordFormat, MapHandle)>,
    delivered: Arc<AtomicUsize>,
    producer_enabled: MapHandle,
    emitted: MapHandle,
    missed: MapHandle,
    allowed: Option<MapHandle>,
}

impl BpfSource {
    fn new(
        skel: &TmtSkel,
        name: &'static str,
        index: u32,
        rings: Vec<(RecordFormat, MapHandle)>,
    ) -> Result<Self> {
        let allowed = if index == SRC_SCHED {
            Some(MapHandle::try_from(&skel.maps.allowed).context("Failed to get allowed map")?)
        } else {
            None
        };
        Ok(BpfSource {
            ring: None,
            name,
            index,
            rings,
            delivered: Arc::new(AtomicUsize::new(0)),
            producer_enabled: MapHandle::try_from(&skel.maps.producer_enabled)
                .context("Failed to get producer_enabled map")?,
            emitted: MapHandle::try_from(&skel.maps.emitted)
                .context("Failed to get emitted map")?,
            missed: MapHandle::try_from(&skel.maps.missed).context("Failed to get missed map")?,
            allowed,
        })
    }

    fn write_producer(&self, value: u32) -> Result<()> {
        self.producer_enabled
            .update(
                &self.index.to_ne_bytes(),
                &value.to_ne_bytes(),
                MapFlags::ANY,
            )
            .with_context(|| format!("Failed to toggle producer of {}", self.name))
    }
}

impl EventSource for BpfSource {
    fn name(&self) -> &str {
        self.name
    }

    fn install(&mut self, sink: RecordSink) -> Result<()> {
        let mut builder = RingBufferBuilder::new();
        for (format, map) in self.rings.iter() {
            let format = *format;
            let sink = sink.clone();
            let delivered = self.delivered.clone();
            builder.add(map as &dyn MapCore, move |data: &[u8]| {
                handle_record(format, data, &sink);
                delivered.fetch_add(1, Ordering::Relaxed);
                0
            })?;
        }
        self.ring = Some(builder.build()?);
        self.write_producer(1)
    }

    fn poll(&mut self, timeout: Duration) -> Result<usize> {
        let Some(ring) = self.ring.as_ref() else {
            bail!("{} polled before install", self.name);
        };
        ring.poll(timeout)?;
        Ok(self.delivered.swap(0, Ordering::Relaxed))
    }

    fn emitted_count(&self) -> Result<Option<u64>> {
        sum_percpu(&self.emitted, self.index).map(Some)
    }

    fn set_producer_enabled(&mut self, enabled: bool) -> Result<ProducerControl> {
        self.write_producer(enabled as u32)?;
        Ok(ProducerControl::Applied)
    }

    fn missed_count(&self) -> Option<u64> {
        sum_percpu(&self.missed, self.index).ok()
    }

    fn track_root(&mut self, pid: u32) -> Result<()> {
        if let Some(allowed) = self.allowed.as_ref() {
            allowed
                .update(&pid.to_ne_bytes(), &1u8.to_ne_bytes(), MapFlags::ANY)
                .context("Failed to seed the sched pre-filter")?;
        }
        Ok(())
    }

    fn detach(&mut self) {
        let _ = self.write_producer(0);
        self.ring = None;
    }
}

fn attached(result: libbpf_rs::Result<Link>, probe: &str) -> Result<Link, TraceError> {
    result.map_err(|e| TraceError::Attach {
        probe: probe.to_string(),
        reason: e.to_string(),
    })
}

fn ring(handle: libbpf_rs::Result<MapHandle>, name: &str) -> Result<MapHandle> {
    handle.with_context(|| format!("Failed to get ring buffer {name}"))
}

/// Load the BPF object, attach the programs of `names` and hand one source
/// per name to `f`.
///
/// The skeleton and its links live on this stack frame, so everything that
/// uses the sources has to happen inside `f`.
pub fn with_bpf_sources<R>(
    names: &[String],
    f: impl FnOnce(Vec<Box<dyn EventSource>>) -> Result<R>,
) -> Result<R> {
    bump_memlock_rlimit()?;

    let skel_builder = TmtSkelBuilder::default();
    let mut open_object = MaybeUninit::uninit();
    let open_skel = skel_builder
        .open(&mut open_object)
        .context("Failed to open BPF object")?;
    let skel = open_skel.load().context("Failed to load BPF object")?;

    let mut links: Vec<Link> = Vec::new();
    let mut sources: Vec<Box<dyn EventSource>> = Vec::new();
    for name in names {
        let source = match name.as_str() {
            "execve" => {
                links.push(attached(
                    skel.progs.handle_execve_enter.attach(),
                    "syscalls:sys_enter_execve",
                )?);
                links.push(attached(
                    skel.progs.handle_execve_exit.attach(),
                    "syscalls:sys_exit_execve",
                )?);
                BpfSource::new(
                    &skel,
                    "execve",
                    SRC_EXECVE,
                    vec![
                        (
                            RecordFormat::Proc(EventKind::ExecveEntry),
                            ring(MapHandle::try_from(&skel.maps.rb_execve_enter), "rb_execve_enter")?,
                        ),
                        (
                            RecordFormat::Proc(EventKind::ExecveExit),
                            ring(MapHandle::try_from(&skel.maps.rb_execve_exit), "rb_execve_exit")?,
                        ),
                    ],
                )?
            }
            "fork" => {
                links.push(attached(
                    skel.progs.handle_sched_fork.attach(),
                    "sched:sched_process_fork",
                )?);
                BpfSource::new(
                    &skel,
                    "fork",
                    SRC_FORK,
                    vec![(
                        RecordFormat::Proc(EventKind::Fork),
                        ring(MapHandle::try_from(&skel.maps.rb_fork), "rb_fork")?,
                    )],
                )?
            }
            "clone" => {
                links.push(attached(
                    skel.progs.handle_clone_exit.attach(),
                    "syscalls:sys_exit_clone",
                )?);
                BpfSource::new(
                    &skel,
                    "clone",
                    SRC_CLONE,
                    vec![(
                        RecordFormat::Proc(EventKind::Clone),
                        ring(MapHandle::try_from(&skel.maps.rb_clone), "rb_clone")?,
                    )],
                )?
            }
            "clone3" => {
                links.push(attached(
                    skel.progs.handle_clone3_exit.attach(),
                    "syscalls:sys_exit_clone3",
                )?);
                BpfSource::new(
                    &skel,
                    "clone3",
                    SRC_CLONE3,
                    vec![(
                        RecordFormat::Proc(EventKind::Clone3),
                        ring(MapHandle::try_from(&skel.maps.rb_clone3), "rb_clone3")?,
                    )],
                )?
            }
            "exit" => {
                links.push(attached(
                    skel.progs.handle_exit_enter.attach(),
                    "syscalls:sys_enter_exit",
                )?);
                BpfSource::new(
                    &skel,
                    "exit",
                    SRC_EXIT,
                    vec![(
                        RecordFormat::Proc(EventKind::Exit),
                        ring(MapHandle::try_from(&skel.maps.rb_exit), "rb_exit")?,
                    )],
                )?
            }
            "exit_group" => {
                links.push(attached(
                    skel.progs.handle_exit_group_enter.attach(),
                    "syscalls:sys_enter_exit_group",
                )?);
                BpfSource::new(
                    &skel,
                    "exit_group",
                    SRC_EXIT_GROUP,
                    vec![(
                        RecordFormat::Proc(EventKind::ExitGroup),
                        ring(MapHandle::try_from(&skel.maps.rb_exit_group), "rb_exit_group")?,
                    )],
                )?
            }
            "sched" => {
                links.push(attached(
                    skel.progs.handle_sched_switch.attach(),
                    "sched:sched_switch",
                )?);
                links.push(attached(
                    skel.progs.propagate_allowed.attach(),
                    "sched:sched_process_fork",
                )?);
                BpfSource::new(
                    &skel,
                    "sched",
                    SRC_SCHED,
                    vec![(RecordFormat::Sched, ring(MapHandle::try_from(&skel.maps.rb_sched), "rb_sched")?)],
                )?
            }
            other => {
                return Err(TraceError::InvalidSource {
                    name: other.to_string(),
                    valid: crate::tracer_core::source_names().join(", "),
                }
                .into())
            }
        };
        debug!("attached source {name}");
        sources.push(Box::new(source));
    }
    info!("Attached {} probes for {} sources", links.len(), sources.len());

    let result = f(sources);
    drop(links);
    result
}
