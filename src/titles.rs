//! Per-wiki title normalization.
//!
//! Namespace metadata and the legal-title character set are fetched from a
//! wiki's action API on first use and cached until an explicit flush.
//! [`Titler::make_title`] reproduces the canonical form a wiki itself would
//! render: underscores become spaces, runs of whitespace collapse, the
//! first letter is upper-cased unless the namespace is case-sensitive, and
//! namespace aliases resolve to their canonical localized names.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clients::{action_get, ClientPool};
use crate::error::ApiError;
use crate::models::{NamespaceInfo, Wiki};

/// A canonicalized title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub namespace: i64,
    /// Title text without the namespace prefix.
    pub main_text: String,
    /// Full title including the localized namespace prefix.
    pub prefixed_text: String,
}

impl Title {
    /// The form the replica stores in `*_title` columns.
    pub fn db_key(&self) -> String {
        self.main_text.replace(' ', "_")
    }
}

/// Namespace-aware canonicalizer for one wiki.
pub struct Titler {
    namespaces: HashMap<i64, NamespaceInfo>,
    /// Lowercased canonical/localized names and aliases → namespace id.
    names: HashMap<String, i64>,
}

impl Titler {
    /// Builds a titler from a `meta=siteinfo` response carrying
    /// `namespaces` and `namespacealiases`.
    pub fn from_siteinfo(body: &serde_json::Value) -> Result<Self> {
        let query = body.get("query").context("siteinfo missing 'query'")?;
        let raw_namespaces = query
            .get("namespaces")
            .and_then(|n| n.as_object())
            .context("siteinfo missing 'namespaces'")?;

        let mut namespaces = HashMap::new();
        let mut names = HashMap::new();

        for ns in raw_namespaces.values() {
            let id = ns["id"].as_i64().context("namespace without id")?;
            let localized = ns["name"].as_str().unwrap_or_default().to_string();
            let canonical = ns["canonical"].as_str().unwrap_or_default().to_string();
            let info = NamespaceInfo {
                id,
                canonical: canonical.clone(),
                localized: localized.clone(),
                case_sensitive: ns["case"].as_str() == Some("case-sensitive"),
                content: ns["content"].as_bool().unwrap_or(false),
                subpages: ns["subpages"].as_bool().unwrap_or(false),
                right: ns["namespaceprotection"]
                    .as_str()
                    .map(|right| right.to_string()),
            };
            if !localized.is_empty() {
                names.insert(localized.to_lowercase(), id);
            }
            if !canonical.is_empty() {
                names.insert(canonical.to_lowercase(), id);
            }
            namespaces.insert(id, info);
        }

        for alias in query["namespacealiases"].as_array().into_iter().flatten() {
            if let (Some(id), Some(name)) = (alias["id"].as_i64(), alias["alias"].as_str()) {
                names.insert(name.to_lowercase().replace('_', " "), id);
            }
        }

        if !namespaces.contains_key(&0) {
            anyhow::bail!("siteinfo did not include the main namespace");
        }

        Ok(Self { namespaces, names })
    }

    pub fn namespace(&self, id: i64) -> Option<&NamespaceInfo> {
        self.namespaces.get(&id)
    }

    /// Canonicalizes `raw` within namespace `ns`. When `ns` is the main
    /// namespace and `raw` carries a recognized namespace prefix, the
    /// prefix wins.
    pub fn make_title(&self, ns: i64, raw: &str) -> Result<Title, ApiError> {
        let mut namespace = ns;
        let mut text = normalize_whitespace(raw);

        if namespace == 0 {
            if let Some((prefix, rest)) = text.split_once(':') {
                if let Some(&id) = self.names.get(prefix.trim().to_lowercase().as_str()) {
                    namespace = id;
                    text = normalize_whitespace(rest);
                }
            }
        }

        if text.is_empty() || !is_legal_title(&text) {
            return Err(ApiError::BadTitle(raw.to_string()));
        }

        let info = self
            .namespaces
            .get(&namespace)
            .ok_or_else(|| ApiError::BadTitle(raw.to_string()))?;

        let main_text = if info.case_sensitive {
            text
        } else {
            upper_first(&text)
        };

        let prefixed_text = if namespace == 0 {
            main_text.clone()
        } else {
            format!("{}:{}", info.localized, main_text)
        };

        Ok(Title {
            namespace,
            main_text,
            prefixed_text,
        })
    }

    /// The User and User talk titles for an account name, in that order.
    pub fn user_titles(&self, name: &str) -> Result<(Title, Title), ApiError> {
        Ok((self.make_title(2, name)?, self.make_title(3, name)?))
    }
}

fn normalize_whitespace(raw: &str) -> String {
    raw.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn upper_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// The complement of the default legal-title character set, plus the
// relative-path and signature forms every wiki rejects.
fn is_legal_title(text: &str) -> bool {
    if text.len() > 255 {
        return false;
    }
    if text.contains(['#', '<', '>', '[', ']', '|', '{', '}'])
        || text.chars().any(|c| c.is_control())
        || text.contains("~~~")
    {
        return false;
    }
    if text == "." || text == ".." {
        return false;
    }
    if text.starts_with("./")
        || text.starts_with("../")
        || text.contains("/./")
        || text.contains("/../")
        || text.ends_with("/.")
        || text.ends_with("/..")
    {
        return false;
    }
    true
}

/// Cache of per-wiki titlers, keyed by dbname.
pub struct TitleRegistry {
    cache: Mutex<HashMap<String, Arc<Titler>>>,
}

impl Default for TitleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleRegistry {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the titler for a wiki, fetching namespace metadata on first
    /// use. Cached indefinitely until [`TitleRegistry::flush`].
    pub async fn for_wiki(&self, clients: &ClientPool, wiki: &Wiki) -> Result<Arc<Titler>> {
        {
            let cache = self.cache.lock().await;
            if let Some(titler) = cache.get(&wiki.dbname) {
                return Ok(Arc::clone(titler));
            }
        }

        let client = clients.for_wiki(wiki).await?;
        let body = action_get(
            &client,
            wiki,
            &[
                ("action", "query".to_string()),
                ("meta", "siteinfo".to_string()),
                (
                    "siprop",
                    "namespaces|namespacealiases|general".to_string(),
                ),
            ],
        )
        .await?;

        let titler = Arc::new(Titler::from_siteinfo(&body)?);
        self.cache
            .lock()
            .await
            .insert(wiki.dbname.clone(), Arc::clone(&titler));
        Ok(titler)
    }

    /// Drops all cached titlers.
    pub async fn flush(&self) {
        self.cache.lock().await.clear();
    }
}
