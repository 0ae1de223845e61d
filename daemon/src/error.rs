//! Daemon error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Core error: {0}")]
    Core(#[from] mirzam_core::CoreError),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
