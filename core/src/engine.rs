//! Event-engine and thread-pool collaborator seams
//!
//! The reactor implementation is an external collaborator; this module
//! holds the narrow contract the supervision core consumes: a registry of
//! named backends, an engine that can be rebound to one, and the
//! auxiliary thread-pool factory. `Null*` implementations stand in where
//! nothing is wired; `Mock*` implementations record and refuse for tests.

use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::debug;

/// A reactor backend this engine can be bound to.
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare the backend for an engine running `batch`-sized event
    /// batches; refusal aborts the rebind.
    fn attach(&self, _batch: u32) -> Result<()> {
        Ok(())
    }
}

/// Registry of event-engine backends, looked up by name.
#[derive(Default)]
pub struct EngineRegistry {
    backends: HashMap<String, Arc<dyn EngineBackend>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn EngineBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// # Errors
    ///
    /// [`CoreError::EngineNotFound`] when no backend carries the name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn EngineBackend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::EngineNotFound(name.to_string()))
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The per-process event engine state this core manages.
///
/// The engine's thread affinity goes stale across fork; the child calls
/// [`adopt_thread`](Self::adopt_thread) before anything else touches it.
pub struct EventEngine {
    backend: Option<Arc<dyn EngineBackend>>,
    batch: u32,
    signals: Vec<Signal>,
    owner_thread: Option<ThreadId>,
}

impl EventEngine {
    /// An engine not yet bound to any backend.
    pub fn new() -> Self {
        Self {
            backend: None,
            batch: 0,
            signals: Vec::new(),
            owner_thread: None,
        }
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref().map(|backend| backend.name())
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    /// Replace the signal set this engine handles.
    pub fn set_signals(&mut self, signals: &[Signal]) {
        self.signals = signals.to_vec();
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Claim the engine for the calling thread (post-fork repair).
    pub fn adopt_thread(&mut self) {
        self.owner_thread = Some(std::thread::current().id());
        debug!("event engine adopted by current thread");
    }

    pub fn is_adopted_by_current_thread(&self) -> bool {
        self.owner_thread == Some(std::thread::current().id())
    }

    /// Rebind the engine to a backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend's refusal; the engine keeps its previous
    /// binding in that case.
    pub fn rebind(&mut self, backend: Arc<dyn EngineBackend>, batch: u32) -> Result<()> {
        backend.attach(batch)?;
        debug!("event engine rebound to \"{}\" (batch {})", backend.name(), batch);
        self.backend = Some(backend);
        self.batch = batch;
        Ok(())
    }
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEngine")
            .field("backend", &self.backend_name())
            .field("batch", &self.batch)
            .field("signals", &self.signals)
            .finish()
    }
}

/// Poll-based reactor backend; the default registration.
#[derive(Copy, Clone, Debug, Default)]
pub struct PollBackend;

impl EngineBackend for PollBackend {
    fn name(&self) -> &str {
        "poll"
    }
}

/// Mock backend whose rebind can be made to fail.
#[derive(Debug)]
pub struct MockEngineBackend {
    name: String,
    refuse_attach: AtomicBool,
}

impl MockEngineBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            refuse_attach: AtomicBool::new(false),
        }
    }

    pub fn refuse_attach(self) -> Self {
        self.refuse_attach.store(true, Ordering::Relaxed);
        self
    }
}

impl EngineBackend for MockEngineBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, _batch: u32) -> Result<()> {
        if self.refuse_attach.load(Ordering::Relaxed) {
            return Err(CoreError::EngineRebind(format!(
                "backend \"{}\" refused to attach",
                self.name
            )));
        }
        Ok(())
    }
}

/// Auxiliary thread-pool factory, consumed during bootstrap.
pub trait ThreadPools: Send + Sync {
    fn create(&self, size: usize, idle_timeout: Duration) -> Result<()>;
}

/// Stand-in factory where no pool backend is wired.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullPools;

impl NullPools {
    pub fn new() -> Self {
        Self
    }
}

impl ThreadPools for NullPools {
    fn create(&self, size: usize, idle_timeout: Duration) -> Result<()> {
        debug!("thread pool: {} threads, idle timeout {:?}", size, idle_timeout);
        Ok(())
    }
}

/// Mock factory recording creations, optionally refusing them.
#[derive(Debug, Default)]
pub struct MockPools {
    created: Mutex<Vec<(usize, Duration)>>,
    refuse: AtomicBool,
}

impl MockPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_creation(self) -> Self {
        self.refuse.store(true, Ordering::Relaxed);
        self
    }

    pub fn created(&self) -> Vec<(usize, Duration)> {
        self.created.lock().unwrap().clone()
    }
}

impl ThreadPools for MockPools {
    fn create(&self, size: usize, idle_timeout: Duration) -> Result<()> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(CoreError::ThreadPools("pool creation refused".to_string()));
        }
        self.created.lock().unwrap().push((size, idle_timeout));
        Ok(())
    }
}
