//! Authenticated HTTP clients for the wiki action APIs.
//!
//! At most one client exists per wiki; it is built lazily on first use and
//! shared by every concurrent caller afterwards. All clients identify
//! themselves with the same user-agent and carry the tool's OAuth bearer
//! token as a default header.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::Wiki;

/// `<tool>/<version> <runtime>/<major> <http-lib>/<version>` on every
/// upstream call.
pub const USER_AGENT: &str = concat!(
    "dispatch/",
    env!("CARGO_PKG_VERSION"),
    " tokio/1 reqwest/0.12"
);

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Lazily-populated map of dbname → authenticated client.
pub struct ClientPool {
    oauth_token: String,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
    pub fn new(oauth_token: String) -> Self {
        Self {
            oauth_token,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for a wiki, constructing it on first use.
    /// `reqwest::Client` is internally reference-counted, so the returned
    /// clone shares the connection pool with every other caller.
    pub async fn for_wiki(&self, wiki: &Wiki) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&wiki.dbname) {
            return Ok(client.clone());
        }

        let client = build_client(&self.oauth_token)?;
        clients.insert(wiki.dbname.clone(), client.clone());
        tracing::debug!(dbname = %wiki.dbname, "constructed upstream client");
        Ok(client)
    }
}

fn build_client(oauth_token: &str) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {oauth_token}"))
        .context("OAuth token is not a valid header value")?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("failed to build upstream HTTP client")
}

/// Issues an action API GET with `format=json&formatversion=2` and the
/// given extra parameters, surfacing MediaWiki-level errors.
pub async fn action_get(
    client: &reqwest::Client,
    wiki: &Wiki,
    params: &[(&str, String)],
) -> Result<serde_json::Value> {
    let mut query: Vec<(&str, String)> = vec![
        ("format", "json".to_string()),
        ("formatversion", "2".to_string()),
    ];
    query.extend(params.iter().map(|(k, v)| (*k, v.clone())));

    let response = client
        .get(wiki.api_url())
        .query(&query)
        .send()
        .await
        .with_context(|| format!("request to {} failed", wiki.dbname))?;

    let status = response.status();
    if !status.is_success() {
        bail!("{} responded with HTTP {}", wiki.dbname, status);
    }

    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("invalid JSON from {}", wiki.dbname))?;

    if let Some(error) = body.get("error") {
        let code = error["code"].as_str().unwrap_or("unknown");
        let info = error["info"].as_str().unwrap_or("no detail");
        return Err(anyhow!("{} API error {code}: {info}", wiki.dbname));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_tool_runtime_and_library() {
        assert!(USER_AGENT.starts_with("dispatch/"));
        assert!(USER_AGENT.contains(" tokio/"));
        assert!(USER_AGENT.contains(" reqwest/"));
    }

    #[test]
    fn client_construction_accepts_normal_token() {
        assert!(build_client("abc123.token-value").is_ok());
    }

    #[test]
    fn client_construction_rejects_token_with_newline() {
        assert!(build_client("bad\ntoken").is_err());
    }
}
