//! One handler per [`EventSource`].
//!
//! A handler owns a background thread that polls its source until stopped,
//! filters every delivered record through the shared [`AncestryFilter`] and
//! keeps the admitted ones in arrival order. At the end of a trace the
//! coordinator drives it synchronously through [`SourceHandler::drain_until`]
//! so nothing the kernel emitted is left behind in the ring buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::ancestry::AncestryFilter;
use crate::backend::{EventSource, ProducerControl, RecordSink};
use crate::events::RawEvent;

/// How long the background thread backs off while a drain is in progress.
const DRAIN_BACKOFF: Duration = Duration::from_millis(1);

/// Limits for the end-of-trace drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
    /// Consecutive polls that deliver nothing before giving up.
    pub max_idle_polls: u32,
    /// Sleep between idle polls.
    pub poll_interval: Duration,
}

impl Default for DrainBudget {
    fn default() -> Self {
        DrainBudget {
            max_idle_polls: 5000,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Result of draining one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub source: String,
    pub expected: u64,
    pub read: u64,
    pub admitted: u64,
    pub shortfall: u64,
    pub missed: Option<u64>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.shortfall == 0
    }
}

/// Admitted events of one source, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLog {
    pub source: String,
    pub events: Vec<RawEvent>,
}

type SharedSource = Arc<Mutex<Box<dyn EventSource>>>;

fn lock_source(source: &SharedSource) -> MutexGuard<'_, Box<dyn EventSource>> {
    source.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SourceHandler {
    name: String,
    source: SharedSource,
    filter: AncestryFilter,
    log: Arc<Mutex<Vec<RawEvent>>>,
    read_events: Arc<AtomicU64>,
    admitted: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    poll_timeout: Duration,
    poll_thread: Option<thread::JoinHandle<()>>,
    detached: bool,
}

impl SourceHandler {
    pub fn new(source: Box<dyn EventSource>, filter: AncestryFilter, poll_timeout: Duration) -> Self {
        SourceHandler {
            name: source.name().to_string(),
            source: Arc::new(Mutex::new(source)),
            filter,
            log: Arc::new(Mutex::new(Vec::new())),
            read_events: Arc::new(AtomicU64::new(0)),
            admitted: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            poll_timeout,
            poll_thread: None,
            detached: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every record delivered by the source is counted, then filtered.
    pub fn install(&mut self) -> Result<()> {
        let filter = self.filter.clone();
        let log = self.log.clone();
        let read_events = self.read_events.clone();
        let admitted = self.admitted.clone();
        let sink: RecordSink = Arc::new(move |event: RawEvent| {
            if filter.admit(&event) {
                log.lock().unwrap_or_else(PoisonError::into_inner).push(event);
                admitted.fetch_add(1, Ordering::Relaxed);
            }
            read_events.fetch_add(1, Ordering::Release);
        });
        lock_source(&self.source)
            .install(sink)
            .with_context(|| format!("Failed to install source {}", self.name))?;
        debug!("[{}] installed", self.name);
        Ok(())
    }

    /// Spawn the background polling thread.
    pub fn start(&mut self) -> Result<()> {
        if self.poll_thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let name = self.name.clone();
        let source = self.source.clone();
        let running = self.running.clone();
        let draining = self.draining.clone();
        let timeout = self.poll_timeout;
        let handle = thread::Builder::new()
            .name(format!("tmt-{}", self.name))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if draining.load(Ordering::Acquire) {
                        thread::sleep(DRAIN_BACKOFF);
                        continue;
                    }
                    let res = lock_source(&source).poll(timeout);
                    if let Err(e) = res {
                        debug!("[{name}] poll failed: {e:#}");
                        thread::sleep(DRAIN_BACKOFF);
                    }
                }
            })
            .with_context(|| format!("Failed to spawn polling thread for {}", self.name))?;
        self.poll_thread = Some(handle);
        Ok(())
    }

    pub fn track_root(&self, pid: u32) -> Result<()> {
        lock_source(&self.source)
            .track_root(pid)
            .with_context(|| format!("Failed to track root pid {pid} in {}", self.name))
    }

    /// Ask the source to stop producing. Failure is not fatal: the drain then
    /// chases a counter that may keep moving for a little longer.
    pub fn freeze(&self) -> ProducerControl {
        match lock_source(&self.source).set_producer_enabled(false) {
            Ok(ProducerControl::Applied) => {
                debug!("[{}] producer disabled", self.name);
                ProducerControl::Applied
            }
            Ok(ProducerControl::Unsupported) => {
                info!(
                    "[{}] producer cannot be disabled, draining a moving target",
                    self.name
                );
                ProducerControl::Unsupported
            }
            Err(e) => {
                warn!("[{}] failed to disable producer: {e:#}", self.name);
                ProducerControl::Unsupported
            }
        }
    }

    /// Records the kernel side claims to have emitted. Falls back to what was
    /// read so far when the source keeps no counter or reading it fails.
    pub fn snapshot_expected(&self) -> u64 {
        match lock_source(&self.source).emitted_count() {
            Ok(Some(count)) => count,
            Ok(None) => self.read_events(),
            Err(e) => {
                warn!("[{}] failed to read emitted counter: {e:#}", self.name);
                self.read_events()
            }
        }
    }

    /// Poll until `expected` records were read or the idle budget runs out.
    ///
    /// Polls with a zero timeout so an empty ring never blocks. Any growth of
    /// the read counter resets the idle budget, including growth caused by a
    /// concurrent poll.
    pub fn drain_until(&self, expected: u64, budget: &DrainBudget) -> DrainReport {
        self.draining.store(true, Ordering::Release);

        let mut idle: u32 = 0;
        let mut last_read = self.read_events();
        while last_read < expected {
            let delivered = match lock_source(&self.source).poll(Duration::ZERO) {
                Ok(n) => n,
                Err(e) => {
                    debug!("[{}] drain poll failed: {e:#}", self.name);
                    0
                }
            };
            let read = self.read_events();
            if delivered > 0 || read > last_read {
                idle = 0;
                last_read = read;
                continue;
            }
            idle += 1;
            if idle >= budget.max_idle_polls {
                break;
            }
            thread::sleep(budget.poll_interval);
        }

        let read = self.read_events();
        let report = DrainReport {
            source: self.name.clone(),
            expected,
            read,
            admitted: self.admitted.load(Ordering::Acquire),
            shortfall: expected.saturating_sub(read),
            missed: lock_source(&self.source).missed_count(),
        };
        if report.is_complete() {
            debug!(
                "[{}] drained {} of {} records ({} admitted)",
                self.name, report.read, report.expected, report.admitted
            );
        } else {
            warn!(
                "[{}] drain gave up: expected {} records, read {}, {} never arrived",
                self.name, report.expected, report.read, report.shortfall
            );
        }
        if let Some(missed) = report.missed.filter(|m| *m > 0) {
            warn!("[{}] ring buffer dropped {missed} records", self.name);
        }
        report
    }

    /// Join the polling thread and detach the source. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.poll_thread.take() {
            if handle.join().is_err() {
                error!("[{}] polling thread panicked", self.name);
            }
        }
        if !self.detached {
            lock_source(&self.source).detach();
            self.detached = true;
        }
    }

    pub fn read_events(&self) -> u64 {
        self.read_events.load(Ordering::Acquire)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Acquire)
    }

    pub fn collect(&self) -> SourceLog {
        SourceLog {
            source: self.name.clone(),
            events: self
                .log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Drop for SourceHandler {
    fn drop(&mut self) {
        self.stop();
    }
}
