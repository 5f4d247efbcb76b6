//! Configuration for the clawmux daemon.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub agent: AgentCliConfig,
    pub manager: ManagerTimings,
    pub http: Option<HttpConfig>,
    pub telegram: Option<TelegramConfig>,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            runtime: RuntimeConfig::from_env()?,
            agent: AgentCliConfig::from_env()?,
            manager: ManagerTimings::default(),
            http: HttpConfig::from_env()?,
            telegram: TelegramConfig::from_env()?,
        })
    }
}

/// Filesystem layout: sockets, PID files, logs, the session record.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding host sockets, PID files, and host log files.
    pub runtime_dir: PathBuf,
    /// Path of the persisted `{channel: session_id}` record.
    pub session_file: PathBuf,
    /// Working directory the agent runs in.
    pub workdir: PathBuf,
}

impl RuntimeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let runtime_dir = optional_env("CLAWMUX_RUNTIME_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let session_file = optional_env("CLAWMUX_SESSION_FILE")?
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".clawmux")
                    .join("sessions.json")
            });

        let workdir = optional_env("CLAWMUX_WORKDIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));

        Ok(Self {
            runtime_dir,
            session_file,
            workdir,
        })
    }

    pub fn socket_path(&self, channel: &str) -> PathBuf {
        self.runtime_dir.join(format!("clawmux-{channel}.sock"))
    }

    pub fn pid_file(&self, channel: &str) -> PathBuf {
        self.runtime_dir.join(format!("clawmux-{channel}.pid"))
    }

    /// The detached host's own operational log (its stdio is disconnected).
    pub fn host_log(&self, channel: &str) -> PathBuf {
        self.runtime_dir.join(format!("clawmux-{channel}.log"))
    }

    /// Per-channel capture of the agent's stderr.
    pub fn agent_stderr_log(&self, channel: &str) -> PathBuf {
        self.runtime_dir
            .join(format!("clawmux-{channel}.stderr.log"))
    }
}

/// Invocation parameters for the agent binary. Serialized into the host's
/// JSON configuration argument, so the host spawns the agent exactly as the
/// daemon was configured to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCliConfig {
    /// Agent binary name or path.
    pub binary: String,
    /// Arguments inserted before the protocol flags. Empty in production;
    /// lets tests substitute a scripted stand-in (`sh -c '...'`).
    #[serde(default)]
    pub base_args: Vec<String>,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            base_args: Vec::new(),
            max_turns: 50,
            allowed_tools: default_allowed_tools(),
            append_system_prompt: None,
        }
    }
}

fn default_allowed_tools() -> Vec<String> {
    [
        "Bash", "Read", "Write", "Edit", "Glob", "Grep", "WebFetch", "WebSearch",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl AgentCliConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            binary: optional_env("CLAWMUX_AGENT_BINARY")?.unwrap_or(defaults.binary),
            base_args: Vec::new(),
            max_turns: parse_optional_env("CLAWMUX_AGENT_MAX_TURNS", defaults.max_turns)?,
            allowed_tools: optional_env("CLAWMUX_AGENT_ALLOWED_TOOLS")?
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.allowed_tools),
            append_system_prompt: optional_env("CLAWMUX_AGENT_SYSTEM_PROMPT")?,
        })
    }
}

/// Timings for the connect-or-spawn path. Fixed in production; tests shrink
/// them to keep failure paths fast.
#[derive(Debug, Clone)]
pub struct ManagerTimings {
    /// How long to wait for an existing host socket to accept.
    pub connect_timeout: Duration,
    /// How long to wait for a freshly spawned host's socket to appear.
    pub spawn_deadline: Duration,
    /// Socket poll interval while a spawn is pending.
    pub poll_interval: Duration,
}

impl Default for ManagerTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            spawn_deadline: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// HTTP adapter configuration. Present iff `HTTP_PORT` or `HTTP_HOST` is set.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<SecretString>,
}

impl HttpConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        if optional_env("HTTP_PORT")?.is_none() && optional_env("HTTP_HOST")?.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            host: optional_env("HTTP_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_optional_env("HTTP_PORT", 8741)?,
            auth_token: optional_env("HTTP_AUTH_TOKEN")?.map(SecretString::from),
        }))
    }
}

/// Telegram adapter configuration. Present iff `TELEGRAM_BOT_TOKEN` is set.
///
/// The sender allow-list is mandatory: the agent confers shell access, so
/// enabling the adapter without one is a hard configuration failure.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub allowed_users: Vec<i64>,
    pub api_base: String,
}

impl TelegramConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(token) = optional_env("TELEGRAM_BOT_TOKEN")? else {
            return Ok(None);
        };

        let allowed_users = optional_env("TELEGRAM_ALLOWED_USERS")?
            .map(|raw| parse_user_list(&raw))
            .transpose()?
            .unwrap_or_default();
        if allowed_users.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TELEGRAM_ALLOWED_USERS".to_string(),
                message: "must list at least one user id when the Telegram adapter is enabled"
                    .to_string(),
            });
        }

        Ok(Some(Self {
            bot_token: SecretString::from(token),
            allowed_users,
            api_base: optional_env("TELEGRAM_API_BASE")?
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
        }))
    }

    pub fn bot_token(&self) -> &str {
        self.bot_token.expose_secret()
    }
}

fn parse_user_list(raw: &str) -> Result<Vec<i64>, ConfigError> {
    split_list(raw)
        .iter()
        .map(|part| {
            part.parse::<i64>().map_err(|e| ConfigError::InvalidValue {
                key: "TELEGRAM_ALLOWED_USERS".to_string(),
                message: format!("'{part}' is not a user id: {e}"),
            })
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

// Helper functions

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read: {e}"),
        }),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
