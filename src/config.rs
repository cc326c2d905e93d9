//! Runtime configuration from the environment.
//!
//! Dispatch is configured entirely through environment variables; there is
//! no config file. Two conditions are startup-fatal and map to distinct
//! exit codes so the supervisor can tell them apart:
//!
//! | Condition | Exit code |
//! |---|---|
//! | `DISPATCH_SELF_OAUTH_ACCESS_TOKEN` unset or empty | 129 |
//! | `DISPATCH_PORT` / `PORT` set but not a valid port | 128 |
//!
//! Replica credentials are NOT validated here; their discovery is lazy and
//! a miss merely degrades the DB-backed endpoints (see `replica`).

use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8000;

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP listener binds to.
    pub port: u16,
    /// OAuth bearer token for upstream API calls.
    pub oauth_token: String,
    /// Switch the stderr log layer to the raw single-line format.
    pub raw_log: bool,
    /// Root directory for on-disk state (only `.logs/` is ever written).
    pub root: PathBuf,
}

/// Startup-fatal configuration errors, with their exit codes.
#[derive(Debug, PartialEq, Eq)]
pub enum StartupError {
    /// `DISPATCH_SELF_OAUTH_ACCESS_TOKEN` is required.
    MissingOauthToken,
    /// The configured port is not an integer in 1–65535.
    InvalidPort(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::MissingOauthToken => 129,
            StartupError::InvalidPort(_) => 128,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StartupError::MissingOauthToken => {
                "DISPATCH_SELF_OAUTH_ACCESS_TOKEN must be set".to_string()
            }
            StartupError::InvalidPort(value) => {
                format!("invalid port {value:?}: expected an integer in 1-65535")
            }
        }
    }
}

/// Loads configuration from the process environment.
pub fn load() -> Result<Config, StartupError> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Same as [`load`], but reading from an arbitrary lookup function so the
/// validation rules are testable without touching the process environment.
pub fn from_lookup<F>(lookup: F) -> Result<Config, StartupError>
where
    F: Fn(&str) -> Option<String>,
{
    let oauth_token = lookup("DISPATCH_SELF_OAUTH_ACCESS_TOKEN")
        .filter(|token| !token.trim().is_empty())
        .ok_or(StartupError::MissingOauthToken)?;

    let port = match lookup("DISPATCH_PORT").or_else(|| lookup("PORT")) {
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(port @ 1..=65535) => port as u16,
            _ => return Err(StartupError::InvalidPort(raw)),
        },
        None => DEFAULT_PORT,
    };

    let raw_log = lookup("DISPATCH_RAWLOG").is_some_and(|v| !v.is_empty() && v != "0");

    let root = lookup("DISPATCH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Config {
        port,
        oauth_token,
        raw_log,
        root,
    })
}
