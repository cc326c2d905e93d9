//! Talk-page filter scanning.
//!
//! Walks a page's history from the oldest revision forward and emits an
//! event whenever a filter's match count changes between adjacent
//! revisions: Δ > 0 produces that many `add` events (each carrying the
//! matches seen in the current revision), Δ < 0 produces `remove` events.
//! Revisions whose content slot is hidden are skipped without perturbing
//! the counts, and content is dropped as soon as it has been counted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::clients::action_get;
use crate::error::ApiError;
use crate::models::Wiki;
use crate::query::{bind_all, Param, QueryComposer, RowKind};

const HISTORY_PAGE_SIZE: u32 = 50;

/// The filter shape accepted over HTTP: a bare string, a set of strings,
/// or a regex-shaped object.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FilterSpec {
    One(String),
    Many(Vec<String>),
    Regex {
        source: String,
        #[serde(default)]
        flags: Option<String>,
    },
}

enum Matcher {
    Literal(String),
    Pattern(regex::Regex),
}

/// One compiled filter; `label` is the identity reported in events.
pub struct CompiledFilter {
    pub label: String,
    matcher: Matcher,
}

impl CompiledFilter {
    /// All matches of this filter in `content`, in order.
    fn matches(&self, content: &str) -> Vec<String> {
        match &self.matcher {
            Matcher::Literal(literal) => content
                .match_indices(literal.as_str())
                .map(|_| literal.clone())
                .collect(),
            Matcher::Pattern(pattern) => pattern
                .find_iter(content)
                .map(|found| found.as_str().to_string())
                .collect(),
        }
    }
}

/// Compiles the request filter into the per-filter list the scanner runs.
/// Fails with `invalidfilter` on an empty set or a non-compiling regex.
pub fn compile_filters(spec: &FilterSpec) -> Result<Vec<CompiledFilter>, ApiError> {
    match spec {
        FilterSpec::One(literal) => {
            if literal.is_empty() {
                return Err(ApiError::InvalidFilter("empty filter string".into()));
            }
            Ok(vec![CompiledFilter {
                label: literal.clone(),
                matcher: Matcher::Literal(literal.clone()),
            }])
        }
        FilterSpec::Many(literals) => {
            if literals.is_empty() {
                return Err(ApiError::InvalidFilter("empty filter set".into()));
            }
            Ok(literals
                .iter()
                .map(|literal| CompiledFilter {
                    label: literal.clone(),
                    matcher: Matcher::Literal(literal.clone()),
                })
                .collect())
        }
        FilterSpec::Regex { source, flags } => {
            let flags = flags.as_deref().unwrap_or("");
            // The global flag is forced by construction: every occurrence
            // is counted. The remaining JS flags map onto builder knobs.
            let pattern = RegexBuilder::new(source)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .build()
                .map_err(|err| ApiError::InvalidFilter(err.to_string()))?;
            Ok(vec![CompiledFilter {
                label: format!("/{source}/{flags}"),
                matcher: Matcher::Pattern(pattern),
            }])
        }
    }
}

/// Whether a filter began or ceased to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchAction {
    Add,
    Remove,
}

/// The revision fields carried on every event.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionSnapshot {
    pub revid: u64,
    pub parentid: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub user: Option<String>,
    pub comment: Option<String>,
    pub size: i64,
}

/// Emitted whenever a filter's match count changes between adjacent
/// revisions.
#[derive(Debug, Clone, Serialize)]
pub struct MatchEvent {
    #[serde(flatten)]
    pub revision: RevisionSnapshot,
    pub filter: String,
    pub action: MatchAction,
    pub matches: Vec<String>,
}

/// Per-filter running counts across the walk.
pub struct ScanState {
    previous: Vec<usize>,
}

impl ScanState {
    pub fn new(filters: &[CompiledFilter]) -> Self {
        Self {
            previous: vec![0; filters.len()],
        }
    }

    /// Counts matches in one revision's content and diffs against the
    /// previous revision. `None` content (deleted slot) is skipped and
    /// leaves the counts untouched.
    pub fn observe(
        &mut self,
        filters: &[CompiledFilter],
        content: Option<&str>,
        snapshot: &RevisionSnapshot,
    ) -> Vec<MatchEvent> {
        let Some(content) = content else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for (index, filter) in filters.iter().enumerate() {
            let matches = filter.matches(content);
            let current = matches.len();
            let previous = self.previous[index];

            if current > previous {
                for _ in 0..(current - previous) {
                    events.push(MatchEvent {
                        revision: snapshot.clone(),
                        filter: filter.label.clone(),
                        action: MatchAction::Add,
                        matches: matches.clone(),
                    });
                }
            } else if current < previous {
                for _ in 0..(previous - current) {
                    events.push(MatchEvent {
                        revision: snapshot.clone(),
                        filter: filter.label.clone(),
                        action: MatchAction::Remove,
                        matches: matches.clone(),
                    });
                }
            }
            self.previous[index] = current;
        }
        events
    }

    /// Current per-filter counts (used by the invariant tests).
    pub fn counts(&self) -> &[usize] {
        &self.previous
    }
}

/// One page of the history walk: revisions with their main-slot content,
/// plus the continuation token.
pub(crate) fn parse_history_page(
    body: &serde_json::Value,
) -> Result<(Vec<(RevisionSnapshot, Option<String>)>, Option<String>)> {
    let query = body.get("query").context("history response missing 'query'")?;
    let pages = query["pages"]
        .as_array()
        .context("history response missing 'pages'")?;

    let mut revisions = Vec::new();
    if let Some(page) = pages.first() {
        for rev in page["revisions"].as_array().into_iter().flatten() {
            let snapshot = RevisionSnapshot {
                revid: rev["revid"].as_u64().unwrap_or(0),
                parentid: rev["parentid"].as_u64().unwrap_or(0),
                timestamp: rev["timestamp"]
                    .as_str()
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| ts.with_timezone(&Utc)),
                user: rev["user"].as_str().map(|user| user.to_string()),
                comment: rev["comment"].as_str().map(|comment| comment.to_string()),
                size: rev["size"].as_i64().unwrap_or(0),
            };
            let content = rev["slots"]["main"]["content"]
                .as_str()
                .map(|content| content.to_string());
            revisions.push((snapshot, content));
        }
    }

    let continue_token = body["continue"]["rvcontinue"]
        .as_str()
        .map(|token| token.to_string());
    Ok((revisions, continue_token))
}

/// Counts a page's revisions on the replica, for the progress total.
pub async fn count_page_revisions(
    pool: &sqlx::MySqlPool,
    namespace: i64,
    db_key: &str,
) -> Result<u64> {
    use sqlx::Row;

    let (sql, params) = QueryComposer::new(RowKind::Revision, "rev", false)
        .raw_column("COUNT(*) AS total")
        .join_page()
        .filter("page.page_namespace = ?", vec![Param::I64(namespace)])
        .filter("page.page_title = ?", vec![Param::Str(db_key.to_string())])
        .render();

    let row = bind_all(sqlx::query(&sql), &params)
        .fetch_one(pool)
        .await
        .context("revision count query failed")?;
    let total: i64 = row.try_get("total").unwrap_or(0);
    Ok(total.max(0) as u64)
}

/// Runs the full scan: pages through the history oldest-first, observing
/// each revision and reporting progress after every API page when a total
/// is known.
pub async fn scan_talk_page(
    client: &reqwest::Client,
    wiki: &Wiki,
    prefixed_title: &str,
    filters: &[CompiledFilter],
    total_revisions: Option<u64>,
    progress: impl Fn(f64),
) -> Result<Vec<MatchEvent>> {
    let mut state = ScanState::new(filters);
    let mut events = Vec::new();
    let mut processed: u64 = 0;
    let mut continue_token: Option<String> = None;

    loop {
        let mut params = vec![
            ("action", "query".to_string()),
            ("prop", "revisions".to_string()),
            ("titles", prefixed_title.to_string()),
            ("rvdir", "newer".to_string()),
            ("rvslots", "main".to_string()),
            (
                "rvprop",
                "ids|timestamp|user|comment|size|content".to_string(),
            ),
            ("rvlimit", HISTORY_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = &continue_token {
            params.push(("rvcontinue", token.clone()));
        }

        let body = action_get(client, wiki, &params).await?;
        let (revisions, next) = parse_history_page(&body)?;

        for (snapshot, content) in &revisions {
            events.extend(state.observe(filters, content.as_deref(), snapshot));
        }
        processed += revisions.len() as u64;

        if let Some(total) = total_revisions {
            if total > 0 {
                progress((processed as f64 / total as f64).min(1.0));
            }
        }

        match next {
            Some(token) => continue_token = Some(token),
            None => break,
        }
    }

    progress(1.0);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(revid: u64) -> RevisionSnapshot {
        RevisionSnapshot {
            revid,
            parentid: revid.saturating_sub(1),
            timestamp: crate::models::parse_mw_timestamp("20240101000000"),
            user: Some("Example".into()),
            comment: None,
            size: 100,
        }
    }

    #[test]
    fn string_filter_compiles_to_one_literal() {
        let filters = compile_filters(&FilterSpec::One("uw-test1".into())).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].label, "uw-test1");
    }

    #[test]
    fn empty_filter_set_is_invalid() {
        assert!(matches!(
            compile_filters(&FilterSpec::Many(vec![])),
            Err(ApiError::InvalidFilter(_))
        ));
        assert!(matches!(
            compile_filters(&FilterSpec::One(String::new())),
            Err(ApiError::InvalidFilter(_))
        ));
    }

    #[test]
    fn bad_regex_is_invalid() {
        let spec = FilterSpec::Regex {
            source: "(unclosed".into(),
            flags: None,
        };
        assert!(matches!(
            compile_filters(&spec),
            Err(ApiError::InvalidFilter(_))
        ));
    }

    #[test]
    fn regex_matches_globally_and_honors_flags() {
        let spec = FilterSpec::Regex {
            source: "uw-\\w+".into(),
            flags: Some("i".into()),
        };
        let filters = compile_filters(&spec).unwrap();
        let matches = filters[0].matches("UW-test1 then uw-test2");
        assert_eq!(matches, vec!["UW-test1", "uw-test2"]);
    }

    #[test]
    fn filter_spec_deserializes_all_shapes() {
        let one: FilterSpec = serde_json::from_value(serde_json::json!("uw-test1")).unwrap();
        assert!(matches!(one, FilterSpec::One(_)));

        let many: FilterSpec =
            serde_json::from_value(serde_json::json!(["uw-test1", "uw-test2"])).unwrap();
        assert!(matches!(many, FilterSpec::Many(ref v) if v.len() == 2));

        let rx: FilterSpec =
            serde_json::from_value(serde_json::json!({"source": "uw-.*", "flags": "i"})).unwrap();
        assert!(matches!(rx, FilterSpec::Regex { .. }));
    }

    #[test]
    fn add_and_remove_events_follow_count_deltas() {
        let filters =
            compile_filters(&FilterSpec::Many(vec!["uw-test1".into(), "uw-test2".into()]))
                .unwrap();
        let mut state = ScanState::new(&filters);

        // Revision 1 adds one uw-test1.
        let events = state.observe(&filters, Some("warning: uw-test1"), &snapshot(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].filter, "uw-test1");
        assert_eq!(events[0].action, MatchAction::Add);
        assert_eq!(events[0].matches, vec!["uw-test1"]);

        // Revision 2 keeps uw-test1 and adds uw-test2.
        let events = state.observe(
            &filters,
            Some("warning: uw-test1 and uw-test2"),
            &snapshot(2),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].filter, "uw-test2");
        assert_eq!(events[0].action, MatchAction::Add);

        // Revision 3 removes uw-test1.
        let events = state.observe(&filters, Some("warning: uw-test2"), &snapshot(3));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].filter, "uw-test1");
        assert_eq!(events[0].action, MatchAction::Remove);
    }

    #[test]
    fn multiple_occurrences_emit_one_event_per_delta() {
        let filters = compile_filters(&FilterSpec::One("spam".into())).unwrap();
        let mut state = ScanState::new(&filters);

        let events = state.observe(&filters, Some("spam spam spam"), &snapshot(1));
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.action == MatchAction::Add));
        assert!(events.iter().all(|event| event.matches.len() == 3));

        let events = state.observe(&filters, Some("spam"), &snapshot(2));
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| event.action == MatchAction::Remove));
    }

    #[test]
    fn hidden_content_does_not_perturb_counts() {
        let filters = compile_filters(&FilterSpec::One("uw-test1".into())).unwrap();
        let mut state = ScanState::new(&filters);

        state.observe(&filters, Some("uw-test1"), &snapshot(1));
        let events = state.observe(&filters, None, &snapshot(2));
        assert!(events.is_empty());

        // The next visible revision diffs against revision 1, not the gap.
        let events = state.observe(&filters, Some("uw-test1"), &snapshot(3));
        assert!(events.is_empty());
    }

    #[test]
    fn summed_deltas_equal_final_count() {
        let filters =
            compile_filters(&FilterSpec::Many(vec!["alpha".into(), "beta".into()])).unwrap();
        let mut state = ScanState::new(&filters);
        let contents = [
            Some("alpha"),
            Some("alpha alpha beta"),
            None,
            Some("beta beta"),
            Some("alpha beta"),
        ];

        let mut all_events = Vec::new();
        for (index, content) in contents.iter().enumerate() {
            all_events.extend(state.observe(&filters, *content, &snapshot(index as u64 + 1)));
        }

        for (index, filter) in filters.iter().enumerate() {
            let delta: i64 = all_events
                .iter()
                .filter(|event| event.filter == filter.label)
                .map(|event| match event.action {
                    MatchAction::Add => 1,
                    MatchAction::Remove => -1,
                })
                .sum();
            assert_eq!(delta, state.counts()[index] as i64);
        }
    }

    #[test]
    fn history_page_parses_content_and_continuation() {
        let body = serde_json::json!({
            "continue": {"rvcontinue": "20240101|5", "continue": "||"},
            "query": {
                "pages": [{
                    "pageid": 9, "ns": 3, "title": "User talk:Example",
                    "revisions": [
                        {
                            "revid": 4, "parentid": 3,
                            "timestamp": "2024-01-01T00:00:00Z",
                            "user": "Helper", "comment": "warn", "size": 120,
                            "slots": {"main": {"content": "uw-test1"}}
                        },
                        {
                            "revid": 5, "parentid": 4,
                            "timestamp": "2024-01-02T00:00:00Z",
                            "user": "Helper", "comment": "rm", "size": 60,
                            "slots": {"main": {"texthidden": true}}
                        }
                    ]
                }]
            }
        });
        let (revisions, next) = parse_history_page(&body).unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].1.as_deref(), Some("uw-test1"));
        assert!(revisions[1].1.is_none(), "hidden slot yields no content");
        assert_eq!(next.as_deref(), Some("20240101|5"));
    }
}
