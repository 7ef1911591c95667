//! Process tree and liveness timeline.
//!
//! The merged log is replayed onto a tree rooted at the launched command.
//! Fork-family events add children, exit events kill whole subtrees, and
//! after every event the number of live processes is sampled into a
//! run-length compressed step function.

use std::fmt::Write as _;

use log::{debug, trace};
use serde::Serialize;

use crate::events::{EventKind, RawEvent};

/// Name given to the root when no event of the root pid was captured.
pub const UNKNOWN_COMMAND: &str = "[unknown]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: u32,
    pub command: String,
    pub alive: bool,
    pub children: Vec<ProcessNode>,
}

impl ProcessNode {
    pub fn new(pid: u32, command: impl Into<String>) -> Self {
        ProcessNode {
            pid,
            command: command.into(),
            alive: false,
            children: Vec::new(),
        }
    }

    pub fn find(&self, pid: u32) -> Option<&ProcessNode> {
        if self.pid == pid {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(pid))
    }

    fn find_mut(&mut self, pid: u32) -> Option<&mut ProcessNode> {
        if self.pid == pid {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(pid))
    }

    fn kill(&mut self) {
        self.alive = false;
        for child in self.children.iter_mut() {
            child.kill();
        }
    }

    /// Live nodes reachable through live ancestors. A dead node hides its
    /// whole subtree.
    pub fn alive_count(&self) -> usize {
        if !self.alive {
            return 0;
        }
        1 + self
            .children
            .iter()
            .map(ProcessNode::alive_count)
            .sum::<usize>()
    }

    /// Number of nodes in this subtree, dead or alive.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(ProcessNode::len).sum::<usize>()
    }

    fn render(&self, depth: usize, out: &mut String) {
        let _ = writeln!(
            out,
            "{:indent$}{} [{}]{}",
            "",
            self.command,
            self.pid,
            if self.alive { " (alive)" } else { "" },
            indent = depth * 2
        );
        for child in &self.children {
            child.render(depth + 1, out);
        }
    }
}

/// A point where the number of live processes changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalSample {
    pub time: u64,
    pub alive_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTree {
    root: ProcessNode,
    samples: Vec<IntervalSample>,
    dropped_forks: usize,
    duplicate_forks: usize,
}

impl ProcessTree {
    /// A tree holding only the live root.
    pub fn new(root_pid: u32, command: impl Into<String>) -> Self {
        let mut root = ProcessNode::new(root_pid, command);
        root.alive = true;
        ProcessTree {
            root,
            samples: Vec::new(),
            dropped_forks: 0,
            duplicate_forks: 0,
        }
    }

    /// Replay a timestamp-ordered log.
    ///
    /// The root is named after the first event carrying the root pid.
    pub fn build(events: &[RawEvent], root_pid: u32) -> Self {
        let command = events
            .iter()
            .find(|event| event.pid == root_pid)
            .map(|event| event.command.as_str())
            .unwrap_or(UNKNOWN_COMMAND);
        let mut tree = ProcessTree::new(root_pid, command);
        for event in events {
            tree.handle_event(event);
        }
        debug!(
            "process tree: {} nodes, {} samples, {} forks without a parent, {} duplicate forks",
            tree.root.len(),
            tree.samples.len(),
            tree.dropped_forks,
            tree.duplicate_forks
        );
        tree
    }

    /// Apply one event and sample the live count if it changed. The first
    /// event always produces a sample.
    pub fn handle_event(&mut self, event: &RawEvent) {
        match event.kind {
            kind if kind.is_fork_family() => self.add_child(event),
            EventKind::Exit => self.set_dead(event.pid),
            EventKind::ExitGroup => self.set_dead(event.parent_pid),
            _ => {}
        }

        let alive_count = self.root.alive_count();
        if self.samples.last().map(|s| s.alive_count) != Some(alive_count) {
            self.samples.push(IntervalSample {
                time: event.timestamp,
                alive_count,
            });
        }
    }

    fn add_child(&mut self, event: &RawEvent) {
        // fork, clone and clone3 can all report the same new task.
        if self.root.find(event.child_pid).is_some() {
            self.duplicate_forks += 1;
            return;
        }
        let Some(parent) = self.root.find_mut(event.pid) else {
            trace!(
                "no parent {} for child {}, dropping {}",
                event.pid,
                event.child_pid,
                event.kind
            );
            self.dropped_forks += 1;
            return;
        };
        let mut child = ProcessNode::new(event.child_pid, event.command.clone());
        child.alive = true;
        parent.children.push(child);
    }

    fn set_dead(&mut self, pid: u32) {
        if let Some(node) = self.root.find_mut(pid) {
            node.kill();
        }
    }

    pub fn root(&self) -> &ProcessNode {
        &self.root
    }

    pub fn samples(&self) -> &[IntervalSample] {
        &self.samples
    }

    pub fn alive_count(&self) -> usize {
        self.root.alive_count()
    }

    /// Fork-family events whose parent was not in the tree.
    pub fn dropped_forks(&self) -> usize {
        self.dropped_forks
    }

    /// Indented rendering, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.root.render(0, &mut out);
        out
    }
}
