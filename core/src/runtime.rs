//! Runtime instance: the process table plus collaborator seams
//!
//! One `Runtime` exists per process. Across fork both sides transiently
//! hold what was the same instance; the child repairs its inherited copy
//! (see the spawner) before using it.

use crate::config::RuntimeConfig;
use crate::engine::{EngineRegistry, NullPools, PollBackend, ThreadPools};
use crate::port::{LogTransport, Port, PortIdAllocator, PortTransport};
use crate::process::{ProcessTable, RoleMask};
use std::fmt;
use std::sync::Arc;

pub struct Runtime {
    /// Records of every live process this runtime knows about.
    pub processes: ProcessTable,
    /// Role types active in this process.
    pub types: RoleMask,
    /// Local port-id allocator; reset in a forked child.
    pub port_ids: PortIdAllocator,
    /// Named event-engine backends.
    pub engines: EngineRegistry,
    engine_name: String,
    batch: u32,
    auxiliary_threads: usize,
    pools: Arc<dyn ThreadPools>,
    transport: Arc<dyn PortTransport>,
    /// Channel every non-main process reports readiness over.
    main_port: Option<Arc<Port>>,
}

impl Runtime {
    /// Build a runtime from a validated configuration, with the default
    /// backend registered and stand-in collaborators wired.
    pub fn new(config: &RuntimeConfig) -> Self {
        let mut engines = EngineRegistry::new();
        engines.register(Arc::new(PollBackend));

        Self {
            processes: ProcessTable::new(),
            types: RoleMask::new(),
            port_ids: PortIdAllocator::new(),
            engines,
            engine_name: config.engine.clone(),
            batch: config.batch,
            auxiliary_threads: config.auxiliary_threads,
            pools: Arc::new(NullPools),
            transport: Arc::new(LogTransport),
            main_port: None,
        }
    }

    pub fn with_pools(mut self, pools: Arc<dyn ThreadPools>) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PortTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn auxiliary_threads(&self) -> usize {
        self.auxiliary_threads
    }

    pub fn pools(&self) -> Arc<dyn ThreadPools> {
        Arc::clone(&self.pools)
    }

    pub fn transport(&self) -> Arc<dyn PortTransport> {
        Arc::clone(&self.transport)
    }

    pub fn set_main_port(&mut self, port: Arc<Port>) {
        self.main_port = Some(port);
    }

    pub fn main_port(&self) -> Option<Arc<Port>> {
        self.main_port.clone()
    }

    /// Allocate a port carrying the next local port id.
    pub fn new_port(&self) -> Arc<Port> {
        Arc::new(Port::new(self.port_ids.next()))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("processes", &self.processes.len())
            .field("types", &self.types)
            .field("engine", &self.engine_name)
            .field("batch", &self.batch)
            .field("auxiliary_threads", &self.auxiliary_threads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_default_backend_is_registered() {
        let rt = Runtime::new(&RuntimeConfig::default());
        assert!(rt.engines.lookup("poll").is_ok());
        assert_eq!(rt.engine_name(), "poll");
    }

    #[test]
    fn test_new_ports_take_sequential_ids() {
        let rt = Runtime::new(&RuntimeConfig::default());
        assert_eq!(rt.new_port().id(), 0);
        assert_eq!(rt.new_port().id(), 1);
        rt.port_ids.reset();
        assert_eq!(rt.new_port().id(), 0);
    }

    #[test]
    fn test_main_port_slot() {
        let mut rt = Runtime::new(&RuntimeConfig::default());
        assert!(rt.main_port().is_none());
        let port = rt.new_port();
        rt.set_main_port(port.clone());
        assert!(Arc::ptr_eq(&rt.main_port().unwrap(), &port));
    }
}
