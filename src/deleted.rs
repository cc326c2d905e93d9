//! Reconstruction of revision-level and page-level deletions.
//!
//! The replicas keep no foreign key from an archived row to the log entry
//! that deleted it, so attribution is heuristic on both paths:
//!
//! - **Revisions**: candidate `delete/revision` log rows are found by a
//!   textual `i:<revid>;` match against `log_params`, decoded, and indexed
//!   oldest-first so that when two entries claim the same revid the later
//!   one wins (it is the latest cause). `islikelycause` marks revids among
//!   an entry's three smallest ids, where batch deletions name their
//!   primary targets.
//! - **Pages**: candidate `delete/*` log rows share the archive row's
//!   namespace and title and postdate it; the one closest from above wins,
//!   and the attribution is `guessed` unless its page id matches exactly.
//!
//! Both are best-effort: batch deletions and title reuse can misattribute,
//! and suppressed rows have their cause scrubbed entirely.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use std::collections::HashMap;

use crate::logparams::parse_log_params;
use crate::models::{
    parse_mw_timestamp, Deleted, DeletedPage, DeletedRevision, DeletionFlags, DeletionParams,
    LogEntry, PageDeleted, PageRef,
};
use crate::query::{bind_all, Param, QueryComposer, RowKind};

/// How many of a log entry's smallest ids count as its primary targets.
const LIKELY_CAUSE_WINDOW: usize = 3;

// ============ Row decoding ============

// Replica text columns are varbinary; decode through bytes.
fn row_string(row: &MySqlRow, col: &str) -> Option<String> {
    row.try_get::<Option<Vec<u8>>, _>(col)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn row_timestamp(row: &MySqlRow, col: &str) -> Option<DateTime<Utc>> {
    row_string(row, col).and_then(|raw| parse_mw_timestamp(&raw))
}

fn row_u64(row: &MySqlRow, col: &str) -> u64 {
    if let Ok(Some(value)) = row.try_get::<Option<u64>, _>(col) {
        return value;
    }
    if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(col) {
        return value.max(0) as u64;
    }
    0
}

fn row_i64(row: &MySqlRow, col: &str) -> i64 {
    if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(col) {
        return value;
    }
    if let Ok(Some(value)) = row.try_get::<Option<u64>, _>(col) {
        return value as i64;
    }
    0
}

fn row_bool(row: &MySqlRow, col: &str) -> bool {
    row_u64(row, col) != 0
}

// ============ Deleted revisions ============

/// Reconstructs an actor's revisions hidden by revision deletion, each
/// annotated with the log entry most likely responsible.
pub async fn deleted_revisions(
    pool: &MySqlPool,
    actor_name: &str,
    progress: impl Fn(f64),
) -> Result<Vec<DeletedRevision>> {
    let (sql, params) = QueryComposer::new(RowKind::Revision, "rev", true)
        .columns(
            Some("rev"),
            &[
                "rev_id",
                "rev_parent_id",
                "rev_timestamp",
                "rev_minor_edit",
                "rev_len",
                "rev_deleted",
            ],
        )
        .columns(Some("comment"), &["comment_text"])
        .columns(Some("page"), &["page_id", "page_namespace", "page_title"])
        .join_actor()
        .join_comment()
        .join_page()
        .filter("actor.actor_name = ?", vec![Param::Str(actor_name.into())])
        .filter("rev.rev_deleted > 0", vec![])
        .order_by("rev.rev_timestamp DESC")
        .render();

    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(pool)
        .await
        .context("deleted-revision query failed")?;
    progress(0.3);

    let revids: Vec<u64> = rows.iter().map(|row| row_u64(row, "rev_id")).collect();
    let index = if revids.is_empty() {
        HashMap::new()
    } else {
        let entries = fetch_deletion_log_entries(pool, &revids).await?;
        index_deletion_logs(entries)
    };
    progress(0.8);

    let mut revisions = Vec::with_capacity(rows.len());
    for row in &rows {
        let revid = row_u64(row, "rev_id");
        revisions.push(DeletedRevision {
            revid,
            parentid: row_u64(row, "rev_parent_id"),
            minor: row_bool(row, "rev_minor_edit"),
            timestamp: row_timestamp(row, "rev_timestamp"),
            size: row_i64(row, "rev_len"),
            comment: row_string(row, "comment_text"),
            page: PageRef {
                pageid: row_u64(row, "page_id"),
                namespace: row_i64(row, "page_namespace"),
                title: row_string(row, "page_title")
                    .unwrap_or_default()
                    .replace('_', " "),
            },
            hidden: DeletionFlags::from_bits(row_u64(row, "rev_deleted") as u32),
            deleted: attribute_revision(revid, &index),
        });
    }
    progress(1.0);
    Ok(revisions)
}

/// Fetches `delete/revision` log rows whose params textually name any of
/// the candidate revids, oldest first, with their tags attached.
async fn fetch_deletion_log_entries(pool: &MySqlPool, revids: &[u64]) -> Result<Vec<LogEntry>> {
    // The PHP-serialized list idiom stores each id as `i:<revid>;`.
    let like_clause = vec!["log.log_params LIKE ?"; revids.len()].join(" OR ");
    let like_params: Vec<Param> = revids
        .iter()
        .map(|revid| Param::Str(format!("%i:{revid};%")))
        .collect();

    let (sql, params) = QueryComposer::new(RowKind::Logging, "log", true)
        .columns(Some("log"), &["log_id", "log_timestamp", "log_params"])
        .columns(Some("actor"), &["actor_name"])
        .columns(Some("comment"), &["comment_text"])
        .join_actor()
        .join_comment()
        .filter("log.log_type = ?", vec![Param::Str("delete".into())])
        .filter("log.log_action = ?", vec![Param::Str("revision".into())])
        .filter(&format!("({like_clause})"), like_params)
        .order_by("log.log_timestamp ASC")
        .render();

    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(pool)
        .await
        .context("deletion-log query failed")?;

    let log_ids: Vec<u64> = rows.iter().map(|row| row_u64(row, "log_id")).collect();
    let mut tags = fetch_log_tags(pool, &log_ids).await?;

    let mut entries = Vec::new();
    for row in &rows {
        let Some(raw_params) = row_string(row, "log_params") else {
            continue;
        };
        let Some(params) = parse_log_params(&raw_params) else {
            continue;
        };
        let logid = row_u64(row, "log_id");
        entries.push(LogEntry {
            logid,
            timestamp: row_timestamp(row, "log_timestamp"),
            actor: row_string(row, "actor_name"),
            comment: row_string(row, "comment_text"),
            tags: tags.remove(&logid).unwrap_or_default(),
            params,
        });
    }
    Ok(entries)
}

async fn fetch_log_tags(pool: &MySqlPool, log_ids: &[u64]) -> Result<HashMap<u64, Vec<String>>> {
    let mut tags: HashMap<u64, Vec<String>> = HashMap::new();
    if log_ids.is_empty() {
        return Ok(tags);
    }
    let placeholders = vec!["?"; log_ids.len()].join(", ");
    let sql = format!(
        "SELECT ct_log_id, ctd_name FROM change_tag \
         JOIN change_tag_def ON ctd_id = ct_tag_id \
         WHERE ct_log_id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql);
    for id in log_ids {
        query = query.bind(id);
    }
    let rows = query
        .fetch_all(pool)
        .await
        .context("log tag query failed")?;
    for row in &rows {
        if let Some(name) = row_string(row, "ctd_name") {
            tags.entry(row_u64(row, "ct_log_id")).or_default().push(name);
        }
    }
    Ok(tags)
}

/// One indexed attribution candidate: the entry plus its smallest ids.
#[derive(Debug, Clone)]
pub(crate) struct IndexedEntry {
    pub entry: LogEntry,
    pub first_few: Vec<u64>,
}

/// Builds revid → entry, processing rows oldest-first so that when two
/// entries claim the same revid, the later (most recent cause) wins.
pub(crate) fn index_deletion_logs(entries: Vec<LogEntry>) -> HashMap<u64, IndexedEntry> {
    let mut index = HashMap::new();
    for entry in entries {
        let mut first_few = entry.params.ids.clone();
        first_few.sort_unstable();
        first_few.truncate(LIKELY_CAUSE_WINDOW);
        for &revid in &entry.params.ids {
            index.insert(
                revid,
                IndexedEntry {
                    entry: entry.clone(),
                    first_few: first_few.clone(),
                },
            );
        }
    }
    index
}

pub(crate) fn attribute_revision(revid: u64, index: &HashMap<u64, IndexedEntry>) -> Deleted {
    match index.get(&revid) {
        Some(indexed) => Deleted::Entry {
            entry: indexed.entry.clone(),
            islikelycause: indexed.first_few.contains(&revid),
        },
        None => Deleted::Suppressed,
    }
}

// ============ Deleted pages ============

/// One attribution candidate for a page deletion.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PageLogCandidate {
    pub log_id: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub log_page: u64,
}

/// Picks the candidate closest from above in time. `guessed` is set when
/// the winner's page id does not match the archive row's exactly.
pub(crate) fn choose_page_log(
    candidates: &[PageLogCandidate],
    archive_page_id: Option<u64>,
) -> Option<(u64, bool)> {
    let chosen = candidates
        .iter()
        .filter(|candidate| candidate.timestamp.is_some())
        .min_by_key(|candidate| candidate.timestamp)?;
    let guessed = match archive_page_id {
        Some(page_id) if page_id != 0 => chosen.log_page != page_id,
        _ => true,
    };
    Some((chosen.log_id, guessed))
}

/// Reconstructs the pages an actor created that have since been deleted.
pub async fn deleted_pages(
    pool: &MySqlPool,
    actor_name: &str,
    progress: impl Fn(f64),
) -> Result<Vec<DeletedPage>> {
    let (sql, params) = QueryComposer::new(RowKind::Archive, "ar", true)
        .columns(
            Some("ar"),
            &[
                "ar_id",
                "ar_page_id",
                "ar_namespace",
                "ar_title",
                "ar_timestamp",
                "ar_len",
            ],
        )
        .columns(Some("dlog"), &["log_id", "log_timestamp", "log_page"])
        .join_actor()
        .join_deletion_log("dlog")
        .filter("actor.actor_name = ?", vec![Param::Str(actor_name.into())])
        .filter("ar.ar_parent_id = 0", vec![])
        .order_by("ar.ar_timestamp DESC")
        .render();

    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(pool)
        .await
        .context("deleted-page query failed")?;
    progress(0.4);

    // The deletion-log join yields one row per (archive row × candidate);
    // regroup before disambiguating.
    struct ArchiveGroup {
        page_id: Option<u64>,
        namespace: i64,
        title: String,
        created: Option<DateTime<Utc>>,
        length: i64,
        candidates: Vec<PageLogCandidate>,
    }
    let mut order: Vec<u64> = Vec::new();
    let mut groups: HashMap<u64, ArchiveGroup> = HashMap::new();
    for row in &rows {
        let ar_id = row_u64(row, "ar_id");
        let group = groups.entry(ar_id).or_insert_with(|| {
            order.push(ar_id);
            let page_id = row_u64(row, "ar_page_id");
            ArchiveGroup {
                page_id: (page_id != 0).then_some(page_id),
                namespace: row_i64(row, "ar_namespace"),
                title: row_string(row, "ar_title")
                    .unwrap_or_default()
                    .replace('_', " "),
                created: row_timestamp(row, "ar_timestamp"),
                length: row_i64(row, "ar_len"),
                candidates: Vec::new(),
            }
        });
        let log_id = row_u64(row, "log_id");
        if log_id != 0 {
            group.candidates.push(PageLogCandidate {
                log_id,
                timestamp: row_timestamp(row, "log_timestamp"),
                log_page: row_u64(row, "log_page"),
            });
        }
    }

    // Resolve winners, then fetch their log details in one pass.
    let mut winners: HashMap<u64, (u64, bool)> = HashMap::new();
    for (&ar_id, group) in &groups {
        if let Some(winner) = choose_page_log(&group.candidates, group.page_id) {
            winners.insert(ar_id, winner);
        }
    }
    let winner_ids: Vec<u64> = winners.values().map(|(log_id, _)| *log_id).collect();
    let entries = fetch_log_entries_by_id(pool, &winner_ids).await?;
    progress(0.9);

    let mut pages = Vec::with_capacity(order.len());
    for ar_id in order {
        let group = groups.remove(&ar_id).expect("grouped above");
        let deleted = match winners.get(&ar_id) {
            Some((log_id, guessed)) => match entries.get(log_id) {
                Some(entry) => PageDeleted::Entry {
                    entry: entry.clone(),
                    guessed: *guessed,
                },
                None => PageDeleted::Suppressed,
            },
            None => PageDeleted::Suppressed,
        };
        pages.push(DeletedPage {
            pageid: group.page_id,
            namespace: group.namespace,
            title: group.title,
            created: group.created,
            length: group.length,
            deleted,
        });
    }
    progress(1.0);
    Ok(pages)
}

/// Loads full log entries (actor, comment, tags, decoded params) by id.
/// Page-deletion params often carry no revision list; those decode to an
/// empty id set rather than dropping the entry.
async fn fetch_log_entries_by_id(
    pool: &MySqlPool,
    log_ids: &[u64],
) -> Result<HashMap<u64, LogEntry>> {
    let mut entries = HashMap::new();
    if log_ids.is_empty() {
        return Ok(entries);
    }

    let id_params: Vec<Param> = log_ids.iter().map(|id| Param::U64(*id)).collect();
    let (sql, params) = QueryComposer::new(RowKind::Logging, "log", false)
        .columns(Some("log"), &["log_id", "log_timestamp", "log_params"])
        .columns(Some("actor"), &["actor_name"])
        .columns(Some("comment"), &["comment_text"])
        .join_actor()
        .join_comment()
        .filter_in("log.log_id", id_params)
        .render();

    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(pool)
        .await
        .context("log detail query failed")?;
    let mut tags = fetch_log_tags(pool, log_ids).await?;

    for row in &rows {
        let logid = row_u64(row, "log_id");
        let params = row_string(row, "log_params")
            .and_then(|raw| parse_log_params(&raw))
            .unwrap_or(DeletionParams {
                kind: "delete".to_string(),
                ids: Vec::new(),
                old: DeletionFlags::default(),
                new: DeletionFlags::default(),
            });
        entries.insert(
            logid,
            LogEntry {
                logid,
                timestamp: row_timestamp(row, "log_timestamp"),
                actor: row_string(row, "actor_name"),
                comment: row_string(row, "comment_text"),
                tags: tags.remove(&logid).unwrap_or_default(),
                params,
            },
        );
    }
    Ok(entries)
}
