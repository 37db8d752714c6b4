use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is absent or empty.
    Missing(&'static str),
    /// A variable is present but cannot be parsed.
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "required configuration variable {key} is not set"),
            Self::Invalid { key, value, expected } => {
                write!(f, "configuration variable {key}='{value}' is invalid (expected {expected})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration, loaded once at startup from the environment.
///
/// Credentials have no defaults and fail the load; everything else falls
/// back to a safe default.
pub struct Config {
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub discord_token: String,
    pub application_id: String,
    /// Hex-encoded Ed25519 key used to verify interaction webhooks.
    pub public_key: String,
    /// The single requester allowed to use the bot.
    pub allowed_user_id: String,
    /// Minimum interval between progressive edits of one reply.
    pub throttle: Duration,
    /// Client-side deadline for the one-shot provider call.
    pub provider_timeout: Duration,
    pub system_prompt_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Whether this host keeps running after the HTTP response is sent.
    pub long_running: bool,
    /// Whether this host can flush a response body early and keep working.
    pub background_continuation: bool,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let public_key = required(&vars, "PUBLIC_KEY")?;
        match hex::decode(&public_key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(ConfigError::Invalid {
                    key: "PUBLIC_KEY",
                    value: public_key,
                    expected: "64 hex characters (32-byte Ed25519 key)",
                });
            }
        }

        let allowed_user_id = required(&vars, "ALLOWED_USER_ID")?;
        if allowed_user_id.parse::<u64>().is_err() {
            return Err(ConfigError::Invalid {
                key: "ALLOWED_USER_ID",
                value: allowed_user_id,
                expected: "a numeric user id",
            });
        }

        let application_id = required(&vars, "APPLICATION_ID")?;
        if application_id.parse::<u64>().is_err() {
            return Err(ConfigError::Invalid {
                key: "APPLICATION_ID",
                value: application_id,
                expected: "a numeric application id",
            });
        }

        Ok(Self {
            provider_base_url: optional(&vars, "OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            provider_api_key: required(&vars, "OPENROUTER_API_KEY")?,
            default_model: optional(&vars, "DEFAULT_MODEL")
                .unwrap_or_else(|| "google/gemini-2.0-flash-exp:free".to_string()),
            max_tokens: parse_or(&vars, "MAX_TOKENS", 1000, "a positive integer")?,
            temperature: parse_or(&vars, "TEMPERATURE", 0.7, "a number")?,
            discord_token: required(&vars, "DISCORD_TOKEN")?,
            application_id,
            public_key,
            allowed_user_id,
            throttle: Duration::from_millis(parse_or(
                &vars,
                "THROTTLE_MS",
                1500,
                "an interval in milliseconds",
            )?),
            provider_timeout: Duration::from_millis(parse_or(
                &vars,
                "PROVIDER_TIMEOUT_MS",
                2500,
                "a timeout in milliseconds",
            )?),
            system_prompt_path: optional(&vars, "SYSTEM_PROMPT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("system-prompt.xml")),
            bind_addr: parse_or(
                &vars,
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
                "a socket address like 0.0.0.0:3000",
            )?,
            long_running: parse_bool(&vars, "HOST_LONG_RUNNING", true)?,
            background_continuation: parse_bool(&vars, "HOST_BACKGROUND_CONTINUATION", false)?,
            log_dir: optional(&vars, "LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        })
    }
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn required(vars: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    optional(vars, key).ok_or(ConfigError::Missing(key))
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match optional(vars, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key,
            value,
            expected,
        }),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match optional(vars, key).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            expected: "true or false",
        }),
    }
}
