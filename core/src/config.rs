//! Configuration loading and validation for the Mirzam runtime
//!
//! Parses a TOML runtime configuration, applies defaults via serde, and
//! performs strict validation with field-path error messages.

use crate::process::RoleKind;
use crate::{CoreError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_engine() -> String {
    "poll".to_string()
}

fn default_batch() -> u32 {
    32
}

fn default_auxiliary_threads() -> usize {
    2
}

/// One worker/auxiliary role to spawn at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    pub name: String,
    pub kind: RoleKind,
    /// Account to switch the spawned process to; requires the
    /// coordinating process to run as super-user to take effect.
    #[serde(default)]
    pub user: Option<String>,
    /// Group override applied on top of the account's primary group.
    #[serde(default)]
    pub group: Option<String>,
    /// Stream id tagged onto the role's ready notification.
    #[serde(default)]
    pub stream: u32,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Event-engine backend name, resolved through the engine registry.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Event batch size handed to the engine on rebind.
    #[serde(default = "default_batch")]
    pub batch: u32,
    /// Auxiliary thread-pool size per process.
    #[serde(default = "default_auxiliary_threads")]
    pub auxiliary_threads: usize,
    /// Detach from the controlling terminal at startup.
    #[serde(default)]
    pub daemonize: bool,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            batch: default_batch(),
            auxiliary_threads: default_auxiliary_threads(),
            daemonize: false,
            roles: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Strict validation; errors carry the offending field path.
    pub fn validate(&self) -> Result<()> {
        if self.engine.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "engine: backend name cannot be empty".to_string(),
            ));
        }
        if self.batch == 0 {
            return Err(CoreError::ValidationError(
                "batch: must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, role) in self.roles.iter().enumerate() {
            if role.name.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "roles[{}].name: cannot be empty",
                    i
                )));
            }
            if !seen.insert(role.name.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "roles[{}].name: duplicate role \"{}\"",
                    i, role.name
                )));
            }
            if role.kind == RoleKind::Main {
                return Err(CoreError::ValidationError(format!(
                    "roles[{}].kind: \"main\" is the coordinating process, not a spawnable role",
                    i
                )));
            }
            if role.group.as_deref().is_some_and(|g| !g.is_empty()) && role.user.is_none() {
                return Err(CoreError::ValidationError(format!(
                    "roles[{}].group: requires user to be set",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a runtime configuration from a TOML string.
pub fn load_runtime_from_toml_str(data: &str) -> Result<RuntimeConfig> {
    let config: RuntimeConfig = toml::from_str(data)
        .map_err(|e| CoreError::ConfigurationError(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load and validate a runtime configuration from a TOML file path.
pub fn load_runtime_from_toml_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_runtime_from_toml_str(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply() {
        let config = load_runtime_from_toml_str("").unwrap();
        assert_eq!(config.engine, "poll");
        assert_eq!(config.batch, 32);
        assert_eq!(config.auxiliary_threads, 2);
        assert!(!config.daemonize);
        assert!(config.roles.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config = load_runtime_from_toml_str(
            r#"
            engine = "poll"
            batch = 64
            auxiliary_threads = 4
            daemonize = true

            [[roles]]
            name = "router"
            kind = "router"
            stream = 1

            [[roles]]
            name = "app"
            kind = "worker"
            user = "nobody"
            group = "nogroup"
            stream = 2
            "#,
        )
        .unwrap();

        assert!(config.daemonize);
        assert_eq!(config.roles.len(), 2);
        assert_eq!(config.roles[0].kind, RoleKind::Router);
        assert_eq!(config.roles[1].user.as_deref(), Some("nobody"));
    }

    #[test]
    fn test_empty_role_name_is_rejected() {
        let err = load_runtime_from_toml_str(
            r#"
            [[roles]]
            name = ""
            kind = "worker"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("roles[0].name"));
    }

    #[test]
    fn test_duplicate_role_names_are_rejected() {
        let err = load_runtime_from_toml_str(
            r#"
            [[roles]]
            name = "app"
            kind = "worker"

            [[roles]]
            name = "app"
            kind = "router"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate role"));
    }

    #[test]
    fn test_main_is_not_a_spawnable_role() {
        let err = load_runtime_from_toml_str(
            r#"
            [[roles]]
            name = "boss"
            kind = "main"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn test_group_without_user_is_rejected() {
        let err = load_runtime_from_toml_str(
            r#"
            [[roles]]
            name = "app"
            kind = "worker"
            group = "nogroup"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires user"));
    }

    #[test]
    fn test_zero_batch_is_rejected() {
        let err = load_runtime_from_toml_str("batch = 0").unwrap_err();
        assert!(err.to_string().contains("batch"));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine = \"poll\"").unwrap();
        let config = load_runtime_from_toml_path(file.path()).unwrap();
        assert_eq!(config.engine, "poll");

        let missing = load_runtime_from_toml_path("/nonexistent/mirzam.toml");
        assert!(matches!(missing, Err(CoreError::ConfigurationError(_))));
    }
}
