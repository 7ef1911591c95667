//! Dynamic ancestry filter.
//!
//! The traced subtree is not known up front: it grows as the launched command
//! forks. Every source handler consults the same [`MembershipSet`] from its own
//! polling thread, so membership checks and growth happen under one lock.
//!
//! Identifiers are never removed. If the kernel recycles a pid that was once a
//! member, events of the unrelated new owner are admitted for the rest of the
//! trace.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::RawEvent;

/// pids, tids and tgids considered part of the traced subtree.
#[derive(Debug, Default)]
pub struct MembershipSet {
    ids: Mutex<HashSet<u32>>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with the tracer's own pid, parent pid and thread group id.
    pub fn for_tracer() -> Self {
        let set = Self::new();
        let pid = nix::unistd::getpid().as_raw() as u32;
        let ppid = nix::unistd::getppid().as_raw() as u32;
        // The process id is the thread group id of the main thread.
        set.extend([pid, ppid, pid]);
        set
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: u32) -> bool {
        self.lock().insert(id)
    }

    pub fn extend(&self, ids: impl IntoIterator<Item = u32>) {
        self.lock().extend(ids);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current members, mostly for tests and reporting.
    pub fn snapshot(&self) -> HashSet<u32> {
        self.lock().clone()
    }
}

/// Per-event inclusion decision over a shared [`MembershipSet`].
#[derive(Debug, Clone)]
pub struct AncestryFilter {
    members: Arc<MembershipSet>,
}

impl AncestryFilter {
    pub fn new(members: Arc<MembershipSet>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &Arc<MembershipSet> {
        &self.members
    }

    /// Admit `event` if its pid, tid or tgid is already a member.
    ///
    /// An admitted event contributes its tid, tgid and, when it created a task,
    /// its child pid. The check and the growth happen under one lock so two
    /// handlers cannot interleave between them.
    pub fn admit(&self, event: &RawEvent) -> bool {
        let mut ids = self.members.lock();
        let member =
            ids.contains(&event.pid) || ids.contains(&event.tid) || ids.contains(&event.tgid);
        if member {
            absorb_into(&mut ids, event);
        }
        member
    }

    /// Add the identifiers carried by `event` unconditionally.
    pub fn absorb(&self, event: &RawEvent) {
        absorb_into(&mut self.members.lock(), event);
    }
}

fn absorb_into(ids: &mut HashSet<u32>, event: &RawEvent) {
    ids.insert(event.tid);
    ids.insert(event.tgid);
    if event.child_pid > 0 {
        ids.insert(event.child_pid);
    }
}
