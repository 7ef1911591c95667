use serde::Serialize;

use crate::events::RawEvent;
use crate::handler::SourceLog;

/// All admitted events of a trace in one timestamp-ordered sequence, rebased
/// so the earliest event is at 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedLog {
    /// Absolute timestamp subtracted from every event.
    base_ns: u64,
    events: Vec<RawEvent>,
}

impl MergedLog {
    /// Logs are concatenated in the order given before sorting. The sort is
    /// stable, so on equal timestamps the earlier log wins and, within a log,
    /// arrival order is kept.
    pub fn from_logs(logs: impl IntoIterator<Item = SourceLog>) -> Self {
        let mut events: Vec<RawEvent> = logs.into_iter().flat_map(|log| log.events).collect();
        // Ring buffers deliver in per-CPU order, not global timestamp order.
        events.sort_by_key(|event| event.timestamp);

        let base_ns = events.first().map(|event| event.timestamp).unwrap_or(0);
        for event in events.iter_mut() {
            event.timestamp -= base_ns;
        }
        MergedLog { base_ns, events }
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn base_ns(&self) -> u64 {
        self.base_ns
    }

    /// Rebased timestamp of the last event.
    pub fn duration_ns(&self) -> u64 {
        self.events.last().map(|event| event.timestamp).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn log(source: &str, events: Vec<RawEvent>) -> SourceLog {
        SourceLog {
            source: source.to_string(),
            events,
        }
    }

    #[test]
    fn test_merge_orders_and_rebases() {
        let fork = log(
            "fork",
            vec![
                RawEvent::new(EventKind::Fork, 1_000_300, 1).with_child(2),
                // out of order within a single ring
                RawEvent::new(EventKind::Fork, 1_000_100, 1).with_child(3),
            ],
        );
        let exit = log("exit", vec![RawEvent::new(EventKind::Exit, 1_000_200, 3)]);
        let merged = MergedLog::from_logs(vec![fork, exit]);

        let times: Vec<u64> = merged.events().iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![0, 100, 200]);
        assert_eq!(merged.base_ns(), 1_000_100);
        assert_eq!(merged.duration_ns(), 200);
        assert!(merged
            .events()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_ties_keep_source_order() {
        let a = log("execve", vec![RawEvent::new(EventKind::ExecveEntry, 50, 1)]);
        let b = log("exit", vec![RawEvent::new(EventKind::Exit, 50, 1)]);
        let merged = MergedLog::from_logs(vec![a, b]);
        assert_eq!(merged.events()[0].kind, EventKind::ExecveEntry);
        assert_eq!(merged.events()[1].kind, EventKind::Exit);
    }

    #[test]
    fn test_empty() {
        let merged = MergedLog::from_logs(Vec::new());
        assert!(merged.is_empty());
        assert_eq!(merged.duration_ns(), 0);
    }
}
