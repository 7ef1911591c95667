//! In-memory [`EventSource`] driven by a prepared list of events.
//!
//! Used by the test suites to exercise the handler, coordinator and analysis
//! stages without a kernel. Two queues model the two interesting phases of a
//! real ring buffer:
//!
//! * `backlog`: records the kernel already emitted but user space has not
//!   consumed yet. They count towards [`EventSource::emitted_count`] from the
//!   start.
//! * `live`: records that are only produced while the producer is enabled, one
//!   per poll. Freezing the producer stops them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{EventSource, ProducerControl, RecordSink};
use crate::events::RawEvent;

/// Longest a poll on an empty source will block, so tests stay fast.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(5);

/// What [`ScriptedSource::emitted_count`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// The true number of emitted records.
    Exact,
    /// No kernel counter is available.
    Absent,
    /// A fixed value, to simulate records that never arrive.
    Fixed(u64),
}

/// Observable state, shared so tests can inspect a source after handing it
/// over to a handler.
#[derive(Debug, Default)]
pub struct ScriptStats {
    pub polls: AtomicUsize,
    pub delivered: AtomicU64,
    pub producer_enabled: AtomicBool,
    pub installed: AtomicBool,
    pub detached: AtomicBool,
    pub tracked_root: AtomicU64,
}

pub struct ScriptedSource {
    name: String,
    backlog: VecDeque<RawEvent>,
    live: VecDeque<RawEvent>,
    emitted: u64,
    batch: usize,
    counter: CounterMode,
    producer_control: bool,
    root_gate: bool,
    missed: Option<u64>,
    sink: Option<RecordSink>,
    stats: Arc<ScriptStats>,
}

impl ScriptedSource {
    /// A source whose events are all already emitted.
    pub fn new(name: &str, events: Vec<RawEvent>) -> Self {
        let emitted = events.len() as u64;
        ScriptedSource {
            name: name.to_string(),
            backlog: events.into(),
            live: VecDeque::new(),
            emitted,
            batch: usize::MAX,
            counter: CounterMode::Exact,
            producer_control: true,
            root_gate: false,
            missed: None,
            sink: None,
            stats: Arc::new(ScriptStats::default()),
        }
    }

    /// Events produced one per poll while the producer is enabled.
    pub fn with_live_events(mut self, events: Vec<RawEvent>) -> Self {
        self.live = events.into();
        self
    }

    /// Deliver at most `batch` records per poll.
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_counter(mut self, counter: CounterMode) -> Self {
        self.counter = counter;
        self
    }

    /// Report [`ProducerControl::Unsupported`] when asked to toggle.
    pub fn without_producer_control(mut self) -> Self {
        self.producer_control = false;
        self
    }

    /// Deliver nothing until a root pid is tracked, like a command that has
    /// not been launched yet.
    pub fn with_root_gate(mut self) -> Self {
        self.root_gate = true;
        self
    }

    pub fn with_missed(mut self, missed: u64) -> Self {
        self.missed = Some(missed);
        self
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        self.stats.clone()
    }

    fn producing(&self) -> bool {
        !self.producer_control || self.stats.producer_enabled.load(Ordering::Acquire)
    }
}

impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&mut self, sink: RecordSink) -> Result<()> {
        if self.stats.detached.load(Ordering::Acquire) {
            bail!("source {} was already detached", self.name);
        }
        self.sink = Some(sink);
        self.stats.installed.store(true, Ordering::Release);
        self.stats.producer_enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<usize> {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        let Some(sink) = self.sink.clone() else {
            bail!("source {} polled before install", self.name);
        };

        let gated = self.root_gate && self.stats.tracked_root.load(Ordering::Acquire) == 0;
        if gated {
            if !timeout.is_zero() {
                thread::sleep(timeout.min(MAX_IDLE_WAIT));
            }
            return Ok(0);
        }

        if self.producing() {
            if let Some(event) = self.live.pop_front() {
                self.backlog.push_back(event);
                self.emitted += 1;
            }
        }

        if self.backlog.is_empty() {
            if !timeout.is_zero() {
                thread::sleep(timeout.min(MAX_IDLE_WAIT));
            }
            return Ok(0);
        }

        let count = self.batch.min(self.backlog.len());
        for event in self.backlog.drain(..count) {
            sink(event);
        }
        self.stats
            .delivered
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn emitted_count(&self) -> Result<Option<u64>> {
        Ok(match self.counter {
            CounterMode::Exact => Some(self.emitted),
            CounterMode::Absent => None,
            CounterMode::Fixed(count) => Some(count),
        })
    }

    fn set_producer_enabled(&mut self, enabled: bool) -> Result<ProducerControl> {
        if !self.producer_control {
            return Ok(ProducerControl::Unsupported);
        }
        self.stats.producer_enabled.store(enabled, Ordering::Release);
        Ok(ProducerControl::Applied)
    }

    fn missed_count(&self) -> Option<u64> {
        self.missed
    }

    fn track_root(&mut self, pid: u32) -> Result<()> {
        self.stats.tracked_root.store(pid as u64, Ordering::Release);
        Ok(())
    }

    fn detach(&mut self) {
        self.sink = None;
        self.stats.producer_enabled.store(false, Ordering::Release);
        self.stats.detached.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::Mutex;

    fn collecting_sink() -> (RecordSink, Arc<Mutex<Vec<RawEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let clone = seen.clone();
        let sink: RecordSink = Arc::new(move |event| clone.lock().unwrap().push(event));
        (sink, seen)
    }

    fn events(n: u32) -> Vec<RawEvent> {
        (0..n)
            .map(|i| RawEvent::new(EventKind::ExecveEntry, i as u64, 100 + i))
            .collect()
    }

    #[test]
    fn test_batched_delivery() {
        let mut source = ScriptedSource::new("execve", events(5)).with_batch(2);
        let (sink, seen) = collecting_sink();
        source.install(sink).unwrap();

        assert_eq!(source.poll(Duration::ZERO).unwrap(), 2);
        assert_eq!(source.poll(Duration::ZERO).unwrap(), 2);
        assert_eq!(source.poll(Duration::ZERO).unwrap(), 1);
        assert_eq!(source.poll(Duration::ZERO).unwrap(), 0);
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(source.emitted_count().unwrap(), Some(5));
    }

    #[test]
    fn test_freeze_stops_live_events() {
        let mut source = ScriptedSource::new("fork", Vec::new()).with_live_events(events(10));
        let (sink, seen) = collecting_sink();
        source.install(sink).unwrap();

        source.poll(Duration::ZERO).unwrap();
        source.poll(Duration::ZERO).unwrap();
        assert_eq!(
            source.set_producer_enabled(false).unwrap(),
            ProducerControl::Applied
        );
        for _ in 0..5 {
            source.poll(Duration::ZERO).unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(source.emitted_count().unwrap(), Some(2));
    }

    #[test]
    fn test_poll_before_install_fails() {
        let mut source = ScriptedSource::new("exit", events(1));
        assert!(source.poll(Duration::ZERO).is_err());
    }

    #[test]
    fn test_unsupported_producer_control() {
        let mut source = ScriptedSource::new("exit", Vec::new()).without_producer_control();
        assert_eq!(
            source.set_producer_enabled(false).unwrap(),
            ProducerControl::Unsupported
        );
    }
}
