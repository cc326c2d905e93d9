//! Site registry: the catalogue of known wikis.
//!
//! The catalogue is downloaded once from the sitematrix endpoint and indexed
//! two ways: by database name (`enwiki`) and by hostname
//! (`en.wikipedia.org`). A refresh replaces the whole snapshot atomically —
//! a failed refresh leaves the previous snapshot untouched. Concurrent
//! callers that find no snapshot share a single in-flight fetch.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::ApiError;
use crate::models::Wiki;

const SITEMATRIX_URL: &str =
    "https://meta.wikimedia.org/w/api.php?action=sitematrix&format=json&formatversion=2";

#[derive(Default)]
struct Snapshot {
    by_dbname: HashMap<String, Arc<Wiki>>,
    by_host: HashMap<String, Arc<Wiki>>,
}

impl Snapshot {
    fn from_wikis(wikis: Vec<Wiki>) -> Self {
        let mut snapshot = Snapshot::default();
        for wiki in wikis {
            let wiki = Arc::new(wiki);
            snapshot
                .by_host
                .insert(wiki.host().to_string(), Arc::clone(&wiki));
            snapshot.by_dbname.insert(wiki.dbname.clone(), wiki);
        }
        snapshot
    }

    fn from_sitematrix(body: &serde_json::Value) -> Result<Self> {
        let matrix = body
            .get("sitematrix")
            .and_then(|m| m.as_object())
            .context("sitematrix response missing 'sitematrix' object")?;

        let mut wikis = Vec::new();
        for (key, group) in matrix {
            match key.as_str() {
                "count" => continue,
                "specials" => {
                    for site in group.as_array().into_iter().flatten() {
                        if let Some(wiki) = parse_site(site, "special") {
                            wikis.push(wiki);
                        }
                    }
                }
                _ => {
                    let lang = group["code"].as_str().unwrap_or_default().to_string();
                    for site in group["site"].as_array().into_iter().flatten() {
                        if let Some(wiki) = parse_site(site, &lang) {
                            wikis.push(wiki);
                        }
                    }
                }
            }
        }

        if wikis.is_empty() {
            anyhow::bail!("sitematrix response contained no sites");
        }
        Ok(Snapshot::from_wikis(wikis))
    }
}

fn parse_site(site: &serde_json::Value, lang: &str) -> Option<Wiki> {
    let dbname = site["dbname"].as_str()?.to_string();
    let url = site["url"].as_str()?.to_string();
    Some(Wiki {
        dbname,
        url,
        lang: lang.to_string(),
        private: flag(site, "private"),
        closed: flag(site, "closed"),
        fishbowl: flag(site, "fishbowl"),
        nonglobal: flag(site, "nonglobal"),
    })
}

// Sitematrix flags are booleans with formatversion=2 but empty strings in
// the legacy shape; treat "present and not false" as set.
fn flag(site: &serde_json::Value, name: &str) -> bool {
    match site.get(name) {
        None => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Null) => false,
        Some(_) => true,
    }
}

/// Which index a [`SiteRegistry::get`] lookup consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Dbname,
    Host,
}

/// Process-wide catalogue of wikis with dbname and hostname indices.
pub struct SiteRegistry {
    http: reqwest::Client,
    endpoint: String,
    snapshot: Mutex<Option<Arc<Snapshot>>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SiteRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: SITEMATRIX_URL.to_string(),
            snapshot: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Builds a registry from an already-known set of wikis. Used by tests
    /// and offline development; lookups never trigger a network fetch.
    pub fn preloaded(wikis: Vec<Wiki>) -> Self {
        let registry = Self::new(reqwest::Client::new());
        *registry.snapshot.lock().unwrap() = Some(Arc::new(Snapshot::from_wikis(wikis)));
        registry
    }

    /// Fetches the catalogue and atomically replaces the snapshot.
    /// On failure the previous snapshot, if any, remains valid.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let _gate = self.refresh_gate.lock().await;
        self.fetch_and_install().await
    }

    async fn fetch_and_install(&self) -> Result<(), ApiError> {
        let fetched = async {
            let response = self
                .http
                .get(&self.endpoint)
                .send()
                .await
                .context("sitematrix request failed")?;
            let body: serde_json::Value = response
                .json()
                .await
                .context("sitematrix response was not JSON")?;
            Snapshot::from_sitematrix(&body)
        }
        .await
        .map_err(|err| ApiError::UpstreamUnavailable(format!("{err:#}")))?;

        let count = fetched.by_dbname.len();
        *self.snapshot.lock().unwrap() = Some(Arc::new(fetched));
        tracing::info!(wikis = count, "site catalogue refreshed");
        Ok(())
    }

    /// Ensures a snapshot exists, sharing one fetch between concurrent
    /// callers that all arrive before the first snapshot lands.
    async fn ensure(&self) -> Result<(), ApiError> {
        if self.snapshot.lock().unwrap().is_some() {
            return Ok(());
        }
        let _gate = self.refresh_gate.lock().await;
        if self.snapshot.lock().unwrap().is_some() {
            return Ok(());
        }
        self.fetch_and_install().await
    }

    /// Looks up a wiki, lazily fetching the catalogue if none is loaded.
    pub async fn get(&self, key: &str, kind: LookupKind) -> Result<Option<Arc<Wiki>>, ApiError> {
        self.ensure().await?;
        // A concurrent flush may have raced the ensure; treat it as a miss.
        let snapshot = self.snapshot.lock().unwrap().clone();
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        let wiki = match kind {
            LookupKind::Dbname => snapshot.by_dbname.get(key),
            LookupKind::Host => snapshot.by_host.get(key),
        };
        Ok(wiki.cloned())
    }

    /// Resolves an `Origin` header value against the hostname index.
    pub async fn by_origin(&self, origin: &str) -> Result<Option<Arc<Wiki>>, ApiError> {
        let host = origin
            .split("//")
            .nth(1)
            .unwrap_or(origin)
            .split('/')
            .next()
            .unwrap_or_default()
            .split(':')
            .next()
            .unwrap_or_default();
        if host.is_empty() {
            return Ok(None);
        }
        self.get(host, LookupKind::Host).await
    }

    /// Drops the snapshot; the next lookup re-fetches.
    pub fn flush(&self) {
        *self.snapshot.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_matrix() -> serde_json::Value {
        serde_json::json!({
            "sitematrix": {
                "count": 3,
                "0": {
                    "code": "en",
                    "name": "English",
                    "site": [
                        {
                            "url": "https://en.wikipedia.org",
                            "dbname": "enwiki",
                            "code": "wiki",
                            "sitename": "Wikipedia"
                        },
                        {
                            "url": "https://en.wikiquote.org",
                            "dbname": "enwikiquote",
                            "code": "wikiquote",
                            "closed": true
                        }
                    ]
                },
                "specials": [
                    {
                        "url": "https://office.wikimedia.org",
                        "dbname": "officewiki",
                        "code": "wiki",
                        "private": true,
                        "nonglobal": true
                    }
                ]
            }
        })
    }

    #[test]
    fn sitematrix_builds_both_indices() {
        let snapshot = Snapshot::from_sitematrix(&sample_matrix()).unwrap();
        assert_eq!(snapshot.by_dbname.len(), 3);

        let enwiki = &snapshot.by_dbname["enwiki"];
        assert_eq!(enwiki.lang, "en");
        assert!(!enwiki.closed && !enwiki.private && !enwiki.nonglobal);

        assert!(snapshot.by_dbname["enwikiquote"].closed);

        let office = &snapshot.by_host["office.wikimedia.org"];
        assert_eq!(office.dbname, "officewiki");
        assert_eq!(office.lang, "special");
        assert!(office.private && office.nonglobal);
    }

    #[test]
    fn empty_sitematrix_is_an_error() {
        let body = serde_json::json!({"sitematrix": {"count": 0}});
        assert!(Snapshot::from_sitematrix(&body).is_err());
        assert!(Snapshot::from_sitematrix(&serde_json::json!({})).is_err());
    }

    fn test_wiki(dbname: &str, url: &str) -> Wiki {
        Wiki {
            dbname: dbname.into(),
            url: url.into(),
            lang: "en".into(),
            private: false,
            closed: false,
            fishbowl: false,
            nonglobal: false,
        }
    }

    #[tokio::test]
    async fn preloaded_lookups_and_flush() {
        let registry = SiteRegistry::preloaded(vec![test_wiki(
            "enwiki",
            "https://en.wikipedia.org",
        )]);

        let by_dbname = registry.get("enwiki", LookupKind::Dbname).await.unwrap();
        assert_eq!(by_dbname.unwrap().host(), "en.wikipedia.org");

        let by_host = registry
            .get("en.wikipedia.org", LookupKind::Host)
            .await
            .unwrap();
        assert_eq!(by_host.unwrap().dbname, "enwiki");

        assert!(registry
            .get("nosuchwiki", LookupKind::Dbname)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn origin_resolution_parses_host() {
        let registry = SiteRegistry::preloaded(vec![test_wiki(
            "enwiki",
            "https://en.wikipedia.org",
        )]);

        let wiki = registry
            .by_origin("https://en.wikipedia.org")
            .await
            .unwrap();
        assert_eq!(wiki.unwrap().dbname, "enwiki");

        assert!(registry
            .by_origin("https://evil.example.com")
            .await
            .unwrap()
            .is_none());
        assert!(registry.by_origin("").await.unwrap().is_none());
    }
}
