//! Replica database access.
//!
//! Connections to the wiki replicas are short-lived by policy: a job opens a
//! pool, runs its queries, and drops it. The hosting environment forbids
//! idle persistent connections, so every pool is built with a minimum size
//! of zero and a five-second idle timeout.
//!
//! Credential discovery is attempted once at startup, in order: explicit
//! environment, hosted build-service environment, then `replica.my.cnf` in
//! the tool data directory, the home directory, and the project root. A
//! miss is not fatal — DB-backed endpoints check availability explicitly
//! and report a degraded state.

use anyhow::anyhow;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ApiError;
use crate::models::Wiki;

const HOSTED_SUFFIX: &str = ".db.svc.wikimedia.cloud";
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);

/// Which replica cluster to hit. Analytics tolerates slow scans; web is
/// tuned for interactive latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaKind {
    Analytics,
    Web,
}

impl ReplicaKind {
    fn as_str(self) -> &'static str {
        match self {
            ReplicaKind::Analytics => "analytics",
            ReplicaKind::Web => "web",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaCredentials {
    pub user: String,
    pub password: String,
}

/// Opens short-lived replica pools under the connection-handling policy.
pub struct ReplicaPool {
    credentials: Option<ReplicaCredentials>,
    hosted: bool,
}

impl ReplicaPool {
    /// Discovers credentials and the hosting environment from the process
    /// environment. Logs a warning when no credentials are found.
    pub fn from_env() -> Self {
        let pool = Self::from_lookup(|key| std::env::var(key).ok(), |path| {
            std::fs::read_to_string(path).ok()
        });
        if pool.credentials.is_none() {
            tracing::warn!(
                "no replica credentials found; database-backed endpoints are degraded"
            );
        }
        pool
    }

    fn from_lookup<E, R>(env: E, read: R) -> Self
    where
        E: Fn(&str) -> Option<String>,
        R: Fn(&PathBuf) -> Option<String>,
    {
        let hosted = env("TOOL_DATA_DIR").is_some();
        let credentials = discover_credentials(&env, &read);
        Self {
            credentials,
            hosted,
        }
    }

    /// Whether DB-backed endpoints can work at all.
    pub fn available(&self) -> bool {
        self.credentials.is_some()
    }

    /// Opens a pool for one wiki's replica. The caller owns the pool and is
    /// expected to drop it when its job completes.
    pub async fn connect(&self, wiki: &Wiki, kind: ReplicaKind) -> Result<MySqlPool, ApiError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ApiError::Generic(anyhow!("replica credentials not configured")))?;

        let (host, port) = self.resolve_host(&wiki.dbname, kind);
        if self.hosted && !host.ends_with(HOSTED_SUFFIX) {
            return Err(ApiError::ConnectionRefused(host));
        }

        let options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&credentials.user)
            .password(&credentials.password)
            .database(&format!("{}_p", wiki.dbname));

        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .min_connections(0)
            .idle_timeout(IDLE_TIMEOUT)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|err| {
                ApiError::Generic(anyhow!("replica connection to {host} failed: {err}"))
            })?;

        tracing::debug!(dbname = %wiki.dbname, host = %host, kind = kind.as_str(), "replica pool opened");
        Ok(pool)
    }

    // Per-dbname overrides apply everywhere; the safety gate in `connect`
    // rejects an override that would escape the hosted network.
    fn resolve_host(&self, dbname: &str, kind: ReplicaKind) -> (String, u16) {
        let upper = dbname.to_uppercase();
        let override_host = std::env::var(format!("DISPATCH_TOOLSDB_HOST_{upper}")).ok();
        let override_port = std::env::var(format!("DISPATCH_TOOLSDB_PORT_{upper}"))
            .ok()
            .and_then(|raw| raw.parse().ok());

        if let Some(host) = override_host {
            return (host, override_port.unwrap_or(3306));
        }

        if self.hosted {
            (
                format!("{dbname}.{}{HOSTED_SUFFIX}", kind.as_str()),
                3306,
            )
        } else {
            ("127.0.0.1".to_string(), override_port.unwrap_or(3306))
        }
    }
}

fn discover_credentials<E, R>(env: &E, read: &R) -> Option<ReplicaCredentials>
where
    E: Fn(&str) -> Option<String>,
    R: Fn(&PathBuf) -> Option<String>,
{
    if let (Some(user), Some(password)) =
        (env("DISPATCH_TOOLSDB_USER"), env("DISPATCH_TOOLSDB_PASS"))
    {
        return Some(ReplicaCredentials { user, password });
    }

    if let (Some(user), Some(password)) =
        (env("TOOL_TOOLSDB_USER"), env("TOOL_TOOLSDB_PASSWORD"))
    {
        return Some(ReplicaCredentials { user, password });
    }

    let mut candidates = Vec::new();
    if let Some(data_dir) = env("TOOL_DATA_DIR") {
        candidates.push(PathBuf::from(data_dir).join("replica.my.cnf"));
    }
    if let Some(home) = env("HOME") {
        candidates.push(PathBuf::from(home).join("replica.my.cnf"));
    }
    candidates.push(PathBuf::from("replica.my.cnf"));

    for path in candidates {
        if let Some(content) = read(&path) {
            if let Some(credentials) = parse_my_cnf(&content) {
                tracing::info!(path = %path.display(), "replica credentials loaded");
                return Some(credentials);
            }
        }
    }

    None
}

/// Extracts `user` and `password` from the `[client]` section of a
/// `replica.my.cnf` file. The format is two keys in one INI section, so the
/// parsing lives here rather than behind a dependency.
fn parse_my_cnf(content: &str) -> Option<ReplicaCredentials> {
    let mut in_client = false;
    let mut user = None;
    let mut password = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_client = section.trim().eq_ignore_ascii_case("client");
            continue;
        }
        if !in_client {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('\'').trim_matches('"').to_string();
            match key.trim() {
                "user" => user = Some(value),
                "password" => password = Some(value),
                _ => {}
            }
        }
    }

    Some(ReplicaCredentials {
        user: user?,
        password: password?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    fn no_files(_: &PathBuf) -> Option<String> {
        None
    }

    #[test]
    fn my_cnf_client_section_parses() {
        let content = "\
[client]
user = 's12345'
password = \"hunter2\"
";
        let credentials = parse_my_cnf(content).unwrap();
        assert_eq!(credentials.user, "s12345");
        assert_eq!(credentials.password, "hunter2");
    }

    #[test]
    fn my_cnf_ignores_other_sections_and_comments() {
        let content = "\
# tool credentials
[mysql]
user = wrong
[client]
; quadrant
user=s999
password=secret
[other]
password = nope
";
        let credentials = parse_my_cnf(content).unwrap();
        assert_eq!(credentials.user, "s999");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn my_cnf_requires_both_keys() {
        assert!(parse_my_cnf("[client]\nuser = only\n").is_none());
        assert!(parse_my_cnf("password = lonely\n").is_none());
    }

    #[test]
    fn explicit_env_wins_over_hosted_env() {
        let pool = ReplicaPool::from_lookup(
            env(&[
                ("DISPATCH_TOOLSDB_USER", "explicit"),
                ("DISPATCH_TOOLSDB_PASS", "pw1"),
                ("TOOL_TOOLSDB_USER", "hosted"),
                ("TOOL_TOOLSDB_PASSWORD", "pw2"),
            ]),
            no_files,
        );
        assert_eq!(pool.credentials.unwrap().user, "explicit");
    }

    #[test]
    fn ini_discovery_reads_data_dir_first() {
        let lookup = env(&[("TOOL_DATA_DIR", "/data/project/dispatch"), ("HOME", "/home/tool")]);
        let read = |path: &PathBuf| {
            if path.starts_with("/data/project/dispatch") {
                Some("[client]\nuser=data\npassword=pw\n".to_string())
            } else if path.starts_with("/home/tool") {
                Some("[client]\nuser=home\npassword=pw\n".to_string())
            } else {
                None
            }
        };
        let pool = ReplicaPool::from_lookup(lookup, read);
        assert_eq!(pool.credentials.unwrap().user, "data");
        assert!(pool.hosted);
    }

    #[test]
    fn missing_credentials_leave_pool_degraded() {
        let pool = ReplicaPool::from_lookup(env(&[]), no_files);
        assert!(!pool.available());
        assert!(!pool.hosted);
    }

    #[test]
    fn hosted_host_shape() {
        let pool = ReplicaPool {
            credentials: Some(ReplicaCredentials {
                user: "u".into(),
                password: "p".into(),
            }),
            hosted: true,
        };
        let (host, port) = pool.resolve_host("enwiki", ReplicaKind::Analytics);
        assert_eq!(host, "enwiki.analytics.db.svc.wikimedia.cloud");
        assert_eq!(port, 3306);
        assert!(host.ends_with(HOSTED_SUFFIX));
    }
}
