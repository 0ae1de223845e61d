//! Process-supervision core for the Mirzam application server
//!
//! This crate creates, bootstraps, and tracks worker and auxiliary OS
//! processes, de-escalates their privileges, and maintains the
//! per-process registry of IPC ports used to route messages between
//! them. Wire-level transport, the reactor implementation, and thread
//! pool internals are external collaborators consumed through the seams
//! in [`port`] and [`engine`].

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod credentials;
pub mod daemonize;
pub mod engine;
pub mod error;
pub mod platform;
pub mod port;
pub mod process;
pub mod runtime;
pub mod spawn;

pub use config::{load_runtime_from_toml_path, load_runtime_from_toml_str, RoleConfig, RuntimeConfig};
pub use context::ProcessContext;
pub use credentials::{
    apply_credential, resolve_credential, IdentityOps, SupplementaryGroups, UserCredential,
};
pub use daemonize::daemonize;
pub use engine::{EngineBackend, EngineRegistry, EventEngine, ThreadPools};
pub use error::{CoreError, Result};
pub use port::{HandlerTable, MessageKind, Port, PortId, PortTransport};
pub use process::{PortRegistry, ProcessRecord, ProcessTable, RoleInit, RoleKind, RoleMask};
pub use runtime::Runtime;
pub use spawn::{spawn_exec, spawn_forked};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
