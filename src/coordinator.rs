//! Drives a trace from installation to a finalized set of logs.
//!
//! ```text
//! Idle -> Installing -> Running -> Draining -> Finalized
//! ```
//!
//! Once the command exits, every producer is frozen, every source's emitted
//! counter is snapshotted, and each handler is drained until it has read that
//! many records. Only then are the polling threads stopped, so records still
//! sitting in a ring buffer when the command exits are not lost.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::ancestry::{AncestryFilter, MembershipSet};
use crate::backend::{EventSource, ProducerControl};
use crate::error::TraceError;
use crate::handler::{DrainBudget, DrainReport, SourceHandler, SourceLog};

/// Starts the traced command and waits for it.
pub trait Launcher {
    /// Create the command's process without letting it run yet and return its
    /// pid.
    fn spawn(&mut self, command: &str) -> Result<u32>;

    /// Let the spawned process run and block until it exits. Returns its exit
    /// code.
    fn run_to_exit(&mut self) -> Result<i32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Installing,
    Running,
    Draining,
    Finalized,
}

/// Everything collected by a finished trace.
#[derive(Debug)]
pub struct Capture {
    pub root_pid: u32,
    pub exit_code: i32,
    /// One log per source, in source order.
    pub logs: Vec<SourceLog>,
    pub reports: Vec<DrainReport>,
    /// Size of the membership set at the end of the trace.
    pub members: usize,
}

impl Capture {
    pub fn shortfall(&self) -> u64 {
        self.reports.iter().map(|r| r.shortfall).sum()
    }
}

pub struct DrainCoordinator {
    handlers: Vec<SourceHandler>,
    members: Arc<MembershipSet>,
    budget: DrainBudget,
    state: DrainState,
}

impl DrainCoordinator {
    pub fn new(
        sources: Vec<Box<dyn EventSource>>,
        members: Arc<MembershipSet>,
        poll_timeout: Duration,
        budget: DrainBudget,
    ) -> Self {
        let filter = AncestryFilter::new(members.clone());
        let handlers = sources
            .into_iter()
            .map(|source| SourceHandler::new(source, filter.clone(), poll_timeout))
            .collect();
        DrainCoordinator {
            handlers,
            members,
            budget,
            state: DrainState::Idle,
        }
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    fn transition(&mut self, next: DrainState) {
        debug!("coordinator {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Trace `command` to completion.
    ///
    /// Fails with [`TraceError::CommandNotSet`] before any source is touched
    /// if there is nothing to run.
    pub fn run(mut self, command: Option<&str>, launcher: &mut dyn Launcher) -> Result<Capture> {
        let command = match command.map(str::trim) {
            Some(command) if !command.is_empty() => command,
            _ => return Err(TraceError::CommandNotSet.into()),
        };

        self.transition(DrainState::Installing);
        for handler in self.handlers.iter_mut() {
            handler.install()?;
            handler.start()?;
        }

        self.transition(DrainState::Running);
        let root_pid = launcher
            .spawn(command)
            .with_context(|| format!("Failed to spawn '{command}'"))?;
        self.members.insert(root_pid);
        for handler in self.handlers.iter() {
            if let Err(e) = handler.track_root(root_pid) {
                warn!("{e:#}");
            }
        }
        info!("Tracing '{command}' (pid {root_pid})");
        let exit_code = launcher.run_to_exit()?;
        info!("Command exited with code {exit_code}, draining");

        self.transition(DrainState::Draining);
        let reports = self.drain();

        for handler in self.handlers.iter_mut() {
            handler.stop();
        }
        self.transition(DrainState::Finalized);

        let logs = self.handlers.iter().map(SourceHandler::collect).collect();
        Ok(Capture {
            root_pid,
            exit_code,
            logs,
            reports,
            members: self.members.len(),
        })
    }

    /// Freeze every producer first so no source keeps emitting while another
    /// is being drained, then snapshot and drain each one.
    fn drain(&self) -> Vec<DrainReport> {
        let unsupported = self
            .handlers
            .iter()
            .map(SourceHandler::freeze)
            .filter(|control| *control == ProducerControl::Unsupported)
            .count();
        if unsupported > 0 {
            debug!("{unsupported} source(s) treated as always on");
        }

        let expected: Vec<u64> = self
            .handlers
            .iter()
            .map(SourceHandler::snapshot_expected)
            .collect();

        self.handlers
            .iter()
            .zip(expected)
            .map(|(handler, expected)| handler.drain_until(expected, &self.budget))
            .collect()
    }
}
