//! Process records and the runtime-scoped process table
//!
//! One [`ProcessRecord`] exists per live OS process known to a runtime
//! instance: a child, a sibling, or the process itself. The table has a
//! single logical writer, either the coordinating process or a freshly
//! forked child repairing its inherited copy before it spawns any
//! threads.

pub mod registry;

pub use registry::{PortKey, PortRegistry};

use crate::credentials::UserCredential;
use crate::port::{HandlerTable, Port};
use crate::Result;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Role a process plays in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Main,
    Controller,
    Router,
    Worker,
}

impl RoleKind {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn title(self) -> &'static str {
        match self {
            RoleKind::Main => "main",
            RoleKind::Controller => "controller",
            RoleKind::Router => "router",
            RoleKind::Worker => "worker",
        }
    }
}

/// Bitmap of role types active in a runtime.
///
/// A forked child clears it and re-registers only its own role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleMask(u32);

impl RoleMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: RoleKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: RoleKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Entry point a role runs once its process is bootstrapped; captures
/// whatever role-supplied data it needs.
pub type EntryPoint = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Immutable role configuration for one spawned process.
///
/// Owned by whoever constructs the spawn request and referenced by the
/// process record for the record's lifetime.
pub struct RoleInit {
    pub name: String,
    /// Target identity to switch to, when spawning as super-user.
    pub user_cred: Option<UserCredential>,
    /// Signals this role's event engine handles.
    pub signals: Vec<Signal>,
    pub kind: RoleKind,
    pub start: EntryPoint,
    /// Stream id tagged onto the ready notification.
    pub stream: u32,
    pub port_handlers: HandlerTable,
}

impl RoleInit {
    /// A role with no credential, no signals, and an empty handler table.
    pub fn new(name: impl Into<String>, kind: RoleKind, start: EntryPoint) -> Self {
        Self {
            name: name.into(),
            user_cred: None,
            signals: Vec::new(),
            kind,
            start,
            stream: 0,
            port_handlers: HandlerTable::new(),
        }
    }

    pub fn with_user_cred(mut self, cred: UserCredential) -> Self {
        self.user_cred = Some(cred);
        self
    }

    pub fn with_signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_stream(mut self, stream: u32) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_port_handlers(mut self, handlers: HandlerTable) -> Self {
        self.port_handlers = handlers;
        self
    }
}

impl fmt::Debug for RoleInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleInit")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("user_cred", &self.user_cred)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

/// One bulk shared-memory region mapped in from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub id: u32,
    pub len: usize,
}

/// Bulk message-buffer mappings for one direction of a peer process.
#[derive(Debug, Default)]
pub struct BufferMap {
    regions: Vec<BufferRegion>,
}

impl BufferMap {
    pub fn track(&mut self, region: BufferRegion) {
        self.regions.push(region);
    }

    /// Drop every mapping; returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let released = self.regions.len();
        self.regions.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Bookkeeping entry for one live OS process.
#[derive(Debug)]
pub struct ProcessRecord {
    pid: Pid,
    pub init: Arc<RoleInit>,
    /// Ports associated with this process, in creation order.
    ports: Vec<Arc<Port>>,
    ready: bool,
    /// Pending port-resource releases; the record leaves the table when
    /// this drains to zero.
    port_cleanups: u32,
    /// Registry of connected peer ports, scoped to this process.
    pub connected: PortRegistry,
    pub incoming: BufferMap,
    pub outgoing: BufferMap,
}

impl ProcessRecord {
    pub fn new(pid: Pid, init: Arc<RoleInit>) -> Self {
        Self {
            pid,
            init,
            ports: Vec::new(),
            ready: false,
            port_cleanups: 0,
            connected: PortRegistry::new(),
            incoming: BufferMap::default(),
            outgoing: BufferMap::default(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    /// The first-created port of this process.
    pub fn first_port(&self) -> Option<Arc<Port>> {
        self.ports.first().cloned()
    }

    pub fn port_cleanups(&self) -> u32 {
        self.port_cleanups
    }
}

/// Collection of process records scoped to one runtime instance.
#[derive(Debug, Default)]
pub struct ProcessTable {
    map: HashMap<Pid, ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: ProcessRecord) {
        debug!("process table: add {} (\"{}\")", record.pid, record.init.name);
        self.map.insert(record.pid, record);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRecord> {
        self.map.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.map.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord> {
        self.map.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.map.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flip a record to ready; false if the pid is unknown.
    pub fn mark_ready(&mut self, pid: Pid) -> bool {
        match self.map.get_mut(&pid) {
            Some(record) => {
                record.ready = true;
                true
            }
            None => false,
        }
    }

    /// Associate a port with a process record.
    ///
    /// The owner back-reference and the membership in the record's port
    /// list are updated together, under the table's single writer. The
    /// pending-cleanup count is incremented first.
    pub fn attach_port(&mut self, pid: Pid, port: Arc<Port>) -> bool {
        match self.map.get_mut(&pid) {
            Some(record) => {
                record.port_cleanups += 1;
                port.bind_to(pid);
                record.ports.push(port);
                true
            }
            None => false,
        }
    }

    /// Release one port-resource handle of the given process.
    ///
    /// The record is removed from the table exactly when its pending
    /// count reaches zero; returns whether this call removed it.
    pub fn release_port_resources(&mut self, pid: Pid) -> bool {
        let drained = match self.map.get_mut(&pid) {
            Some(record) if record.port_cleanups > 0 => {
                record.port_cleanups -= 1;
                record.port_cleanups == 0
            }
            _ => false,
        };
        if drained {
            debug!("process table: {} released its last port resources", pid);
            self.map.remove(&pid);
        }
        drained
    }

    /// One-shot repair of a table inherited across fork.
    ///
    /// Records whose bootstrap had not completed before the fork are
    /// unreliable in the child and are discarded; ready records stay but
    /// their bulk buffer mappings (both directions) are released, since
    /// the child does not own that cross-process memory.
    pub fn repair_after_fork(&mut self) {
        let stale: Vec<Pid> = self
            .map
            .values()
            .filter(|record| !record.ready)
            .map(|record| record.pid)
            .collect();

        for pid in stale {
            debug!("remove not ready process {}", pid);
            self.map.remove(&pid);
        }

        for record in self.map.values_mut() {
            let released = record.incoming.release_all() + record.outgoing.release_all();
            if released > 0 {
                debug!("released {} buffer mappings of process {}", released, record.pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_role(name: &str, kind: RoleKind) -> Arc<RoleInit> {
        Arc::new(RoleInit::new(name, kind, Box::new(|| Ok(()))))
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn test_role_mask_tracks_active_kinds() {
        let mut mask = RoleMask::new();
        assert!(mask.is_empty());
        mask.insert(RoleKind::Router);
        mask.insert(RoleKind::Worker);
        assert!(mask.contains(RoleKind::Router));
        assert!(!mask.contains(RoleKind::Controller));
        mask.clear();
        assert!(mask.is_empty());
    }

    #[test]
    fn test_attach_port_sets_backref_and_membership_together() {
        let mut table = ProcessTable::new();
        table.add(ProcessRecord::new(pid(100), noop_role("router", RoleKind::Router)));

        let port = Arc::new(Port::new(0));
        assert!(table.attach_port(pid(100), port.clone()));

        let record = table.get(pid(100)).unwrap();
        assert_eq!(port.owner(), Some(pid(100)));
        assert_eq!(record.ports().len(), 1);
        assert_eq!(record.port_cleanups(), 1);
        assert!(Arc::ptr_eq(&record.first_port().unwrap(), &port));
    }

    #[test]
    fn test_attach_port_to_unknown_pid_is_refused() {
        let mut table = ProcessTable::new();
        assert!(!table.attach_port(pid(1), Arc::new(Port::new(0))));
    }

    #[test]
    fn test_ports_keep_creation_order() {
        let mut table = ProcessTable::new();
        table.add(ProcessRecord::new(pid(7), noop_role("worker", RoleKind::Worker)));
        for id in 0..3 {
            table.attach_port(pid(7), Arc::new(Port::new(id)));
        }
        let ids: Vec<_> = table.get(pid(7)).unwrap().ports().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_record_removed_exactly_on_last_release() {
        let mut table = ProcessTable::new();
        table.add(ProcessRecord::new(pid(42), noop_role("worker", RoleKind::Worker)));
        for id in 0..3 {
            table.attach_port(pid(42), Arc::new(Port::new(id)));
        }

        assert!(!table.release_port_resources(pid(42)));
        assert!(!table.release_port_resources(pid(42)));
        assert!(table.contains(pid(42)));

        // The third release drains the count and removes the record.
        assert!(table.release_port_resources(pid(42)));
        assert!(!table.contains(pid(42)));

        // Never removed twice.
        assert!(!table.release_port_resources(pid(42)));
    }

    #[test]
    fn test_release_without_pending_cleanups_is_a_noop() {
        let mut table = ProcessTable::new();
        table.add(ProcessRecord::new(pid(42), noop_role("worker", RoleKind::Worker)));
        assert!(!table.release_port_resources(pid(42)));
        assert!(table.contains(pid(42)));
    }

    #[test]
    fn test_repair_after_fork_prunes_and_releases() {
        let mut table = ProcessTable::new();

        let mut ready = ProcessRecord::new(pid(10), noop_role("router", RoleKind::Router));
        ready.ready = true;
        ready.incoming.track(BufferRegion { id: 1, len: 4096 });
        ready.outgoing.track(BufferRegion { id: 2, len: 4096 });
        table.add(ready);

        table.add(ProcessRecord::new(pid(11), noop_role("worker", RoleKind::Worker)));

        table.repair_after_fork();

        // The not-ready record is gone; the ready one stays with its
        // buffer maps emptied in both directions.
        assert!(!table.contains(pid(11)));
        let kept = table.get(pid(10)).unwrap();
        assert!(kept.is_ready());
        assert!(kept.incoming.is_empty());
        assert!(kept.outgoing.is_empty());
    }

    #[test]
    fn test_mark_ready() {
        let mut table = ProcessTable::new();
        table.add(ProcessRecord::new(pid(5), noop_role("worker", RoleKind::Worker)));
        assert!(!table.get(pid(5)).unwrap().is_ready());
        assert!(table.mark_ready(pid(5)));
        assert!(table.get(pid(5)).unwrap().is_ready());
        assert!(!table.mark_ready(pid(6)));
    }
}
