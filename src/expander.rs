//! Staggered revision coalescer.
//!
//! Callers queue revision ids and receive one-shot handles; a single worker
//! drains the pending set in batches of at most [`PER_BATCH`] ids, issues
//! the two-pass upstream lookup, and resolves every handle exactly once.
//! Concurrent queues of the same id share one pending slot, so an id is
//! fetched at most once while a lookup is in flight.
//!
//! The two passes per batch: a props pass requesting ids, timestamps,
//! flags, comments, parsed comments, users, sizes, and tags; then a size
//! pass for the collected parent ids. `diffsize` is `size − parent.size`;
//! ids the upstream reports as bad become [`Revision::missing`] markers.
//!
//! An upstream failure fails only the in-flight batch — later batches are
//! attempted independently.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::clients::action_get;
use crate::error::ApiError;
use crate::models::{PageRef, Revision, RevisionData, VisibilityFlags, Wiki};

/// Maximum ids per upstream request.
pub const PER_BATCH: usize = 50;

/// Error delivered to every handle of a failed batch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream expansion failed: {0}")]
pub struct UpstreamError(pub String);

pub type ExpandResult = Result<Revision, UpstreamError>;

/// Result of the props pass.
#[derive(Debug, Default)]
pub struct PropsBatch {
    /// Fully attributed revisions, `diffsize` not yet computed.
    pub revisions: Vec<RevisionData>,
    /// Ids the upstream reported as bad.
    pub missing: Vec<u64>,
}

/// Upstream behind the expander. The production implementation talks to the
/// action API; tests drive the coalescer with an in-memory source.
pub trait RevisionSource: Send + Sync + 'static {
    /// Props pass over one batch of ids.
    fn fetch_revisions(&self, ids: Vec<u64>) -> BoxFuture<'_, Result<PropsBatch>>;
    /// Size pass over collected parent ids.
    fn fetch_sizes(&self, ids: Vec<u64>) -> BoxFuture<'_, Result<HashMap<u64, i64>>>;
}

struct PendingState {
    /// FIFO of ids awaiting a batch, in first-queue order.
    queue: VecDeque<u64>,
    /// Waiting handles per id; an id in `queue` always has an entry here.
    waiters: HashMap<u64, Vec<oneshot::Sender<ExpandResult>>>,
}

/// The coalescer. Construct once per wiki and share.
pub struct RevisionExpander {
    source: Arc<dyn RevisionSource>,
    state: Mutex<PendingState>,
    notify: Notify,
}

impl RevisionExpander {
    /// Creates the expander and spawns its worker.
    pub fn new(source: Arc<dyn RevisionSource>) -> Arc<Self> {
        let expander = Arc::new(Self {
            source,
            state: Mutex::new(PendingState {
                queue: VecDeque::new(),
                waiters: HashMap::new(),
            }),
            notify: Notify::new(),
        });
        let worker = Arc::clone(&expander);
        tokio::spawn(async move { worker.run().await });
        expander
    }

    /// Queues ids for expansion. Returns one receiver per distinct id; a
    /// queue of an id that is already pending attaches to the existing
    /// slot and resolves to the same value.
    pub fn queue(&self, ids: &[u64]) -> HashMap<u64, oneshot::Receiver<ExpandResult>> {
        let mut receivers = HashMap::new();
        {
            let mut state = self.state.lock().unwrap();
            for &id in ids {
                if receivers.contains_key(&id) {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                match state.waiters.get_mut(&id) {
                    Some(waiters) => waiters.push(tx),
                    None => {
                        state.waiters.insert(id, vec![tx]);
                        state.queue.push_back(id);
                    }
                }
                receivers.insert(id, rx);
            }
        }
        self.notify.notify_one();
        receivers
    }

    /// Queues ids and awaits their resolution against a wall-clock budget.
    /// On timeout, the ids that are still unresolved are reported for
    /// diagnostics; the worker keeps running and will finish (or re-error)
    /// the batch for any subsequent caller.
    pub async fn expand_with_timeout(
        &self,
        ids: &[u64],
        timeout: Duration,
    ) -> Result<HashMap<u64, Revision>, ApiError> {
        let deadline = Instant::now() + timeout;
        let receivers = self.queue(ids);

        let awaited = futures::future::join_all(receivers.into_iter().map(|(id, rx)| async move {
            (id, tokio::time::timeout_at(deadline, rx).await)
        }))
        .await;

        let mut revisions = HashMap::new();
        let mut pending = Vec::new();
        for (id, outcome) in awaited {
            match outcome {
                Ok(Ok(Ok(revision))) => {
                    revisions.insert(id, revision);
                }
                Ok(Ok(Err(upstream))) => {
                    return Err(ApiError::UpstreamUnavailable(upstream.to_string()));
                }
                Ok(Err(_closed)) => {
                    return Err(ApiError::UpstreamUnavailable(
                        "expander worker dropped the handle".to_string(),
                    ));
                }
                Err(_elapsed) => pending.push(id),
            }
        }

        if !pending.is_empty() {
            pending.sort_unstable();
            return Err(ApiError::ExpanderTimeout {
                timeout_secs: timeout.as_secs(),
                pending,
            });
        }
        Ok(revisions)
    }

    /// The synchronous batch path: both upstream passes for one id set,
    /// with `diffsize` computed and bad ids turned into missing markers.
    pub async fn request(&self, ids: &[u64]) -> Result<HashMap<u64, Revision>, UpstreamError> {
        let batch = self
            .source
            .fetch_revisions(ids.to_vec())
            .await
            .map_err(|err| UpstreamError(format!("{err:#}")))?;

        // Sizes already present in the props pass need no second lookup.
        let known_sizes: HashMap<u64, i64> = batch
            .revisions
            .iter()
            .map(|rev| (rev.revid, rev.size))
            .collect();
        let wanted_parents: Vec<u64> = batch
            .revisions
            .iter()
            .map(|rev| rev.parentid)
            .filter(|&parent| parent != 0 && !known_sizes.contains_key(&parent))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut parent_sizes = known_sizes;
        if !wanted_parents.is_empty() {
            let fetched = self
                .source
                .fetch_sizes(wanted_parents)
                .await
                .map_err(|err| UpstreamError(format!("{err:#}")))?;
            parent_sizes.extend(fetched);
        }

        let mut result: HashMap<u64, Revision> = HashMap::new();
        for mut revision in batch.revisions {
            revision.diffsize = if revision.parentid == 0 {
                Some(revision.size)
            } else {
                parent_sizes
                    .get(&revision.parentid)
                    .map(|parent_size| revision.size - parent_size)
            };
            result.insert(revision.revid, Revision::Live(revision));
        }
        for id in batch.missing {
            result.insert(id, Revision::missing(id));
        }
        // Anything the upstream silently dropped is missing as well; no id
        // may stay unresolved.
        for &id in ids {
            result.entry(id).or_insert_with(|| Revision::missing(id));
        }
        Ok(result)
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            loop {
                let batch: Vec<(u64, Vec<oneshot::Sender<ExpandResult>>)> = {
                    let mut state = self.state.lock().unwrap();
                    let take = state.queue.len().min(PER_BATCH);
                    let ids: Vec<u64> = state.queue.drain(..take).collect();
                    ids.into_iter()
                        .map(|id| {
                            let waiters = state.waiters.remove(&id).unwrap_or_default();
                            (id, waiters)
                        })
                        .collect()
                };
                if batch.is_empty() {
                    break;
                }

                let ids: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
                let outcome = self.request(&ids).await;

                for (id, waiters) in batch {
                    let value = match &outcome {
                        Ok(map) => map
                            .get(&id)
                            .cloned()
                            .map(Ok)
                            .unwrap_or_else(|| Ok(Revision::missing(id))),
                        Err(err) => Err(err.clone()),
                    };
                    for waiter in waiters {
                        let _ = waiter.send(value.clone());
                    }
                }
            }
        }
    }
}

/// Production source backed by a wiki's action API.
pub struct ActionApiSource {
    client: reqwest::Client,
    wiki: Arc<Wiki>,
}

impl ActionApiSource {
    pub fn new(client: reqwest::Client, wiki: Arc<Wiki>) -> Self {
        Self { client, wiki }
    }
}

impl RevisionSource for ActionApiSource {
    fn fetch_revisions(&self, ids: Vec<u64>) -> BoxFuture<'_, Result<PropsBatch>> {
        Box::pin(async move {
            let body = action_get(
                &self.client,
                &self.wiki,
                &[
                    ("action", "query".to_string()),
                    ("prop", "revisions".to_string()),
                    ("revids", join_ids(&ids)),
                    (
                        "rvprop",
                        "ids|timestamp|flags|comment|parsedcomment|user|size|tags".to_string(),
                    ),
                ],
            )
            .await?;
            parse_props_response(&body)
        })
    }

    fn fetch_sizes(&self, ids: Vec<u64>) -> BoxFuture<'_, Result<HashMap<u64, i64>>> {
        Box::pin(async move {
            let body = action_get(
                &self.client,
                &self.wiki,
                &[
                    ("action", "query".to_string()),
                    ("prop", "revisions".to_string()),
                    ("revids", join_ids(&ids)),
                    ("rvprop", "ids|size".to_string()),
                ],
            )
            .await?;
            parse_sizes_response(&body)
        })
    }
}

/// Lazily-constructed expander per wiki, shared by all handlers.
pub struct ExpanderMap {
    clients: Arc<crate::clients::ClientPool>,
    expanders: tokio::sync::Mutex<HashMap<String, Arc<RevisionExpander>>>,
}

impl ExpanderMap {
    pub fn new(clients: Arc<crate::clients::ClientPool>) -> Self {
        Self {
            clients,
            expanders: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn for_wiki(&self, wiki: &Arc<Wiki>) -> Result<Arc<RevisionExpander>> {
        let mut expanders = self.expanders.lock().await;
        if let Some(expander) = expanders.get(&wiki.dbname) {
            return Ok(Arc::clone(expander));
        }
        let client = self.clients.for_wiki(wiki).await?;
        let source = ActionApiSource::new(client, Arc::clone(wiki));
        let expander = RevisionExpander::new(Arc::new(source));
        expanders.insert(wiki.dbname.clone(), Arc::clone(&expander));
        Ok(expander)
    }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Parses the props pass response: revisions grouped under their pages,
/// plus the `badrevids` set.
pub fn parse_props_response(body: &serde_json::Value) -> Result<PropsBatch> {
    let query = body.get("query").context("response missing 'query'")?;
    let mut batch = PropsBatch::default();

    for page in query["pages"].as_array().into_iter().flatten() {
        let page_ref = PageRef {
            pageid: page["pageid"].as_u64().unwrap_or(0),
            namespace: page["ns"].as_i64().unwrap_or(0),
            title: page["title"].as_str().unwrap_or_default().to_string(),
        };
        for rev in page["revisions"].as_array().into_iter().flatten() {
            let Some(revid) = rev["revid"].as_u64() else {
                continue;
            };
            let hidden = VisibilityFlags {
                user: rev["userhidden"].as_bool().unwrap_or(false),
                comment: rev["commenthidden"].as_bool().unwrap_or(false),
                text: rev["texthidden"].as_bool().unwrap_or(false),
            };
            batch.revisions.push(RevisionData {
                revid,
                parentid: rev["parentid"].as_u64().unwrap_or(0),
                minor: rev["minor"].as_bool().unwrap_or(false),
                user: rev["user"].as_str().map(|user| user.to_string()),
                timestamp: rev["timestamp"]
                    .as_str()
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| ts.with_timezone(&Utc)),
                size: rev["size"].as_i64().unwrap_or(0),
                comment: rev["comment"].as_str().map(|comment| comment.to_string()),
                parsedcomment: rev["parsedcomment"]
                    .as_str()
                    .map(|parsed| parsed.to_string()),
                tags: rev["tags"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|tag| tag.as_str())
                    .map(|tag| tag.to_string())
                    .collect(),
                page: page_ref.clone(),
                diffsize: None,
                hidden,
                visibility: None,
            });
        }
    }

    // `badrevids` is a map in the legacy shape and an array with
    // formatversion=2; accept either.
    match &query["badrevids"] {
        serde_json::Value::Object(map) => {
            for bad in map.values() {
                if let Some(id) = bad["revid"].as_u64() {
                    batch.missing.push(id);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for bad in items {
                if let Some(id) = bad["revid"].as_u64() {
                    batch.missing.push(id);
                }
            }
        }
        _ => {}
    }

    Ok(batch)
}

/// Parses the size pass response into revid → size.
pub fn parse_sizes_response(body: &serde_json::Value) -> Result<HashMap<u64, i64>> {
    let query = body.get("query").context("response missing 'query'")?;
    let mut sizes = HashMap::new();
    for page in query["pages"].as_array().into_iter().flatten() {
        for rev in page["revisions"].as_array().into_iter().flatten() {
            if let (Some(revid), Some(size)) = (rev["revid"].as_u64(), rev["size"].as_i64()) {
                sizes.insert(revid, size);
            }
        }
    }
    Ok(sizes)
}
