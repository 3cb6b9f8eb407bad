//! Runtime configuration for the mission runtime.
//!
//! Configuration can be set via environment variables:
//! - `OPENJULES_SANDBOX_ROOT` - Optional. Absolute path for sandbox workspaces;
//!   overrides the per-project setting. Defaults to `~/.openjules/sandboxes`.
//! - `OPENJULES_SANDBOX_PERSIST` - Optional. Keep workspaces after teardown.
//! - `OPENJULES_DOCKER_IMAGE` - Optional. Default container image.
//! - `DOCKER_SOCKET_PATH` - Optional. Defaults to `/var/run/docker.sock`.

use std::path::PathBuf;

use thiserror::Error;

/// Image used when neither settings nor environment name one.
pub const DEFAULT_DOCKER_IMAGE: &str = "node:20-bookworm-slim";

/// Docker daemon socket used when `DOCKER_SOCKET_PATH` is unset.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Could not resolve a home directory for the default sandbox root")]
    NoHomeDir,
}

/// Process-level configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which per-mission sandboxes are created.
    /// `None` means no env override; settings or the home default apply.
    pub sandbox_root_override: Option<PathBuf>,

    /// Keep sandbox workspaces on teardown (env override).
    pub persist_sandbox_override: Option<bool>,

    /// Container image override from the environment.
    pub docker_image_override: Option<String>,

    /// Path to the Docker daemon socket.
    pub docker_socket: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sandbox_root_override = match std::env::var("OPENJULES_SANDBOX_ROOT") {
            Ok(raw) => {
                let path = PathBuf::from(raw.trim());
                if !path.is_absolute() {
                    return Err(ConfigError::InvalidValue(
                        "OPENJULES_SANDBOX_ROOT".to_string(),
                        format!("{} is not an absolute path", path.display()),
                    ));
                }
                Some(path)
            }
            Err(_) => None,
        };

        let persist_sandbox_override = std::env::var("OPENJULES_SANDBOX_PERSIST")
            .ok()
            .map(|v| parse_bool(&v));

        let docker_image_override = std::env::var("OPENJULES_DOCKER_IMAGE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let docker_socket = std::env::var("DOCKER_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DOCKER_SOCKET));

        Ok(Self {
            sandbox_root_override,
            persist_sandbox_override,
            docker_image_override,
            docker_socket,
        })
    }

    /// Fallback sandbox root under the user's home directory.
    pub fn default_sandbox_root() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".openjules").join("sandboxes"))
            .ok_or(ConfigError::NoHomeDir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root_override: None,
            persist_sandbox_override: None,
            docker_image_override: None,
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}
