//! Largest-edits ranking.
//!
//! Finds an actor's revisions with the largest absolute size delta. The
//! ranking happens on the replica via the parent self-join, so only one
//! page of candidates (50 ids) crosses the wire; the winners are then run
//! through the revision expander for full attributes. Reverted edits are
//! excluded unless the caller opts in, and arbitrary tag exclusions stack
//! on top.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{MySqlPool, Row};

use crate::expander::RevisionExpander;
use crate::models::Revision;
use crate::query::{bind_all, Param, QueryComposer, RowKind};

const PAGE_SIZE: u64 = 50;
const REVERTED_TAG: &str = "mw-reverted";

/// Options accepted by the largest-edits endpoint; doubles as the dedup
/// fingerprint input.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LargestEditsOptions {
    pub wiki: String,
    pub user: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub namespaces: Option<Vec<i64>>,
    #[serde(default, rename = "withReverts")]
    pub with_reverts: bool,
    #[serde(default, rename = "withoutTags")]
    pub without_tags: Vec<String>,
}

pub(crate) fn compose_candidates_query(
    actor_name: &str,
    options: &LargestEditsOptions,
) -> (String, Vec<Param>) {
    let mut composer = QueryComposer::new(RowKind::Revision, "rev", true)
        .columns(Some("rev"), &["rev_id"])
        .join_parents("parent")
        .join_actor()
        .filter("actor.actor_name = ?", vec![Param::Str(actor_name.into())]);

    if let Some(namespaces) = &options.namespaces {
        composer = composer.join_page().filter_in(
            "page.page_namespace",
            namespaces.iter().map(|ns| Param::I64(*ns)).collect(),
        );
    }

    if !options.with_reverts {
        composer = composer.lacks_tag(&[REVERTED_TAG]);
    }
    if !options.without_tags.is_empty() {
        let tags: Vec<&str> = options.without_tags.iter().map(String::as_str).collect();
        composer = composer.lacks_tag(&tags);
    }

    composer
        .order_by(
            "ABS(CAST(rev.rev_len AS SIGNED) - CAST(COALESCE(parent.rev_len, 0) AS SIGNED)) DESC",
        )
        .limit(PAGE_SIZE)
        .offset(options.offset)
        .render()
}

/// Runs the ranking: replica candidates, then expansion. The returned
/// revisions keep the replica's by-delta order.
pub async fn largest_edits(
    pool: &MySqlPool,
    expander: &RevisionExpander,
    actor_name: &str,
    options: &LargestEditsOptions,
    progress: impl Fn(f64),
) -> Result<Vec<Revision>> {
    let (sql, params) = compose_candidates_query(actor_name, options);
    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(pool)
        .await
        .context("largest-edits candidate query failed")?;
    progress(0.5);

    let ids: Vec<u64> = rows
        .iter()
        .filter_map(|row| row.try_get::<u64, _>("rev_id").ok())
        .collect();
    if ids.is_empty() {
        progress(1.0);
        return Ok(Vec::new());
    }

    let mut expanded = std::collections::HashMap::new();
    for (id, receiver) in expander.queue(&ids) {
        let revision = receiver
            .await
            .map_err(|_| anyhow!("expander dropped the handle"))??;
        expanded.insert(id, revision);
    }
    progress(0.95);

    let ranked = ids
        .iter()
        .filter_map(|id| expanded.remove(id))
        .collect::<Vec<_>>();
    progress(1.0);
    Ok(ranked)
}
