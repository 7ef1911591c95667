//! Interface to the instrumentation backend.
//!
//! A backend exposes one [`EventSource`] per event kind (or pair of kinds).
//! Each source owns one or more ring buffers and decodes their raw records
//! into [`RawEvent`]s, which it hands to the sink registered at install time.
//!
//! Two implementations live here: [`scripted::ScriptedSource`], an in-memory
//! source used by tests, and `bpf::BpfSource` (feature `bpf`), backed by the
//! libbpf skeleton built from `src/bpf/tmt.bpf.c`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::events::RawEvent;

#[cfg(feature = "bpf")]
pub mod bpf;
pub mod scripted;

/// Called once per delivered raw record, from whichever thread is polling.
pub type RecordSink = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Outcome of toggling a source's producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerControl {
    Applied,
    /// The source cannot be switched off; treat it as always on.
    Unsupported,
}

pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Open the ring buffer(s), route every delivered record to `sink` and
    /// enable the producer where that is controllable.
    fn install(&mut self, sink: RecordSink) -> Result<()>;

    /// Deliver pending records synchronously, waiting up to `timeout` for the
    /// first one. Returns the number of records delivered.
    fn poll(&mut self, timeout: Duration) -> Result<usize>;

    /// Authoritative count of records emitted by the kernel side, summed
    /// across CPUs. `None` if the backend keeps no such counter.
    fn emitted_count(&self) -> Result<Option<u64>>;

    fn set_producer_enabled(&mut self, enabled: bool) -> Result<ProducerControl>;

    /// Records dropped by the kernel side because the ring buffer was full.
    fn missed_count(&self) -> Option<u64> {
        None
    }

    /// The launched command's pid is known. Sources with a kernel side
    /// pre-filter use this to seed it.
    fn track_root(&mut self, _pid: u32) -> Result<()> {
        Ok(())
    }

    /// Best-effort teardown. Errors are ignored.
    fn detach(&mut self);
}
