//! Per-process registry of connected ports
//!
//! Maps (remote process id, remote port id) to the local port handle.
//! Ports are created and torn down from arbitrary worker threads as
//! remote peers connect and disconnect, so every operation runs under one
//! mutex; the inner table is created lazily on first insert.

use crate::port::{Port, PortId};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Compound registry key: owning process id plus port id.
pub type PortKey = (Pid, PortId);

/// Mutex-guarded hash table of connected ports, owned per process.
#[derive(Debug, Default)]
pub struct PortRegistry {
    inner: Mutex<Option<HashMap<PortKey, Arc<Port>>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a port under its (owner pid, port id) key.
    ///
    /// A port with no owner back-reference has not been attached to any
    /// process record yet and is ignored.
    pub fn add(&self, port: Arc<Port>) {
        match port.owner() {
            Some(pid) => {
                let mut guard = self.inner.lock().unwrap();
                let table = guard.get_or_insert_with(HashMap::new);
                table.insert((pid, port.id()), port);
            }
            None => {
                debug!("ignoring registry add for unowned port {}", port.id());
            }
        }
    }

    /// Remove a port; removing an absent entry is a no-op.
    pub fn remove(&self, port: &Port) {
        if let Some(pid) = port.owner() {
            let mut guard = self.inner.lock().unwrap();
            if let Some(table) = guard.as_mut() {
                table.remove(&(pid, port.id()));
            }
        }
    }

    /// Look up a connected port by its remote identity.
    pub fn find(&self, pid: Pid, port_id: PortId) -> Option<Arc<Port>> {
        let guard = self.inner.lock().unwrap();
        guard.as_ref().and_then(|table| table.get(&(pid, port_id)).cloned())
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        guard.as_ref().map_or(0, |table| table.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
