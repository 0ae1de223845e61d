//! Core error types and utilities

use nix::errno::Errno;
use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// The user account does not exist in the system directory.
    #[error("user \"{0}\" not found")]
    UserNotFound(String),

    /// The group does not exist in the system directory.
    #[error("group \"{0}\" not found")]
    GroupNotFound(String),

    /// The directory query itself failed, as opposed to a clean miss.
    #[error("lookup of \"{name}\" failed: {errno}")]
    LookupFailed { name: String, errno: Errno },

    /// Supplementary-group enumeration failed part-way, including the
    /// case where restoring the resolver's own groups failed.
    #[error("group enumeration failed: {0}")]
    GroupEnumeration(String),

    /// A step of the ordered privilege transition failed. Callers must
    /// treat this as fatal; the process is left part-way between
    /// identities.
    #[error("privilege switch failed: {0}")]
    PrivilegeSwitch(String),

    #[error("process spawn failed: {0}")]
    ProcessSpawn(String),

    #[error("exec of \"{path}\" failed: {errno}")]
    ProcessExec { path: String, errno: Errno },

    /// Daemonization failure, naming the operation that failed.
    #[error("daemonize: {op} failed: {errno}")]
    Daemonize { op: &'static str, errno: Errno },

    #[error("engine backend \"{0}\" not found")]
    EngineNotFound(String),

    #[error("engine rebind failed: {0}")]
    EngineRebind(String),

    #[error("thread pool creation failed: {0}")]
    ThreadPools(String),

    #[error("role entry point failed: {0}")]
    EntryPoint(String),

    #[error("port send failed: {0}")]
    PortSend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
