//! HTTP surface.
//!
//! A thin façade over the processing layer: requests either compose a
//! synchronous expansion and return, or spawn a job in a task engine and
//! return a ticket. The REST dialect:
//!
//! | Method & path | Purpose |
//! |---|---|
//! | `GET/POST /v1/revisions/{wiki}` | Expand revision ids |
//! | `POST /v1/user/deleted-revisions` | Spawn deleted-revision reconstruction |
//! | `GET /v1/user/deleted-revisions/{id}[/progress]` | Poll / fetch result |
//! | `POST /v1/user/largest-edits` + id routes | Rank edits by diffsize |
//! | `POST /v1/user/search-talk` + id routes | Talk-page filter scan |
//!
//! Validation failures fail fast here with the error codes of `error`;
//! job failures surface only through the poll/result protocol. CORS is
//! conditional: `Access-Control-Allow-Origin: *` (with `Vary: Origin`) is
//! set only when the request's Origin belongs to a known wiki.

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::clients::ClientPool;
use crate::config::Config;
use crate::deleted;
use crate::error::{ApiError, ApiFailure, ErrorFormat};
use crate::expander::{ExpanderMap, PER_BATCH};
use crate::largest::{self, LargestEditsOptions};
use crate::models::Wiki;
use crate::replica::{ReplicaKind, ReplicaPool};
use crate::sites::{LookupKind, SiteRegistry};
use crate::store::{RevisionStore, StoreOptions};
use crate::talk::{self, FilterSpec};
use crate::tasks::TaskEngine;
use crate::titles::TitleRegistry;

/// Wall-clock budget for one synchronous expansion.
const EXPANDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sites: Arc<SiteRegistry>,
    pub titles: Arc<TitleRegistry>,
    pub clients: Arc<ClientPool>,
    pub replica: Arc<ReplicaPool>,
    pub store: Arc<RevisionStore>,
    pub expanders: Arc<ExpanderMap>,
    pub deleted_tasks: Arc<TaskEngine>,
    pub largest_tasks: Arc<TaskEngine>,
    pub talk_tasks: Arc<TaskEngine>,
}

impl AppState {
    /// Wires the production state: live site registry, change-stream
    /// backed store, and one task engine per controller.
    pub fn new(config: Config) -> Self {
        let clients = Arc::new(ClientPool::new(config.oauth_token.clone()));
        Self {
            config: Arc::new(config),
            sites: Arc::new(SiteRegistry::new(reqwest::Client::new())),
            titles: Arc::new(TitleRegistry::new()),
            replica: Arc::new(ReplicaPool::from_env()),
            store: RevisionStore::new(StoreOptions::new().autostart(true)),
            expanders: Arc::new(ExpanderMap::new(Arc::clone(&clients))),
            clients,
            deleted_tasks: Arc::new(TaskEngine::new("deleted-revisions")),
            largest_tasks: Arc::new(TaskEngine::new("largest-edits")),
            talk_tasks: Arc::new(TaskEngine::new("search-talk")),
        }
    }
}

/// Builds the router with all routes and layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/revisions/{wiki}",
            get(get_revisions).post(post_revisions),
        )
        .route("/v1/user/deleted-revisions", post(spawn_deleted_revisions))
        .route(
            "/v1/user/deleted-revisions/{id}/progress",
            get(deleted_revisions_progress),
        )
        .route(
            "/v1/user/deleted-revisions/{id}",
            get(deleted_revisions_result),
        )
        .route("/v1/user/largest-edits", post(spawn_largest_edits))
        .route(
            "/v1/user/largest-edits/{id}/progress",
            get(largest_edits_progress),
        )
        .route("/v1/user/largest-edits/{id}", get(largest_edits_result))
        .route("/v1/user/search-talk", post(spawn_search_talk))
        .route(
            "/v1/user/search-talk/{id}/progress",
            get(search_talk_progress),
        )
        .route("/v1/user/search-talk/{id}", get(search_talk_result))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves until the process terminates.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "dispatch listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

// ============ Shared helpers ============

fn errorformat(query: &HashMap<String, String>) -> ErrorFormat {
    ErrorFormat::parse(query.get("errorformat").map(String::as_str))
}

/// Bodies are parsed leniently: absent or non-JSON input becomes `Null`, so
/// missing-field validation owns the error shape instead of the framework.
fn parse_body(bytes: &Bytes) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
}

/// Resolves a dbname; unknown and non-global wikis are unsupported.
async fn resolve_wiki(
    state: &AppState,
    dbname: &str,
    format: ErrorFormat,
    unsupported_status: StatusCode,
) -> Result<Arc<Wiki>, ApiFailure> {
    let wiki = state
        .sites
        .get(dbname, LookupKind::Dbname)
        .await
        .map_err(|err| ApiFailure::new(err, format))?;
    match wiki {
        Some(wiki) if !wiki.nonglobal => Ok(wiki),
        _ => Err(
            ApiFailure::new(ApiError::UnsupportedWiki(dbname.to_string()), format)
                .with_status(unsupported_status),
        ),
    }
}

fn parse_task_id(raw: &str, format: ErrorFormat) -> Result<Uuid, ApiFailure> {
    Uuid::parse_str(raw).map_err(|_| ApiFailure::new(ApiError::TaskMissing, format))
}

/// 202 with the progress payload and the relative `Location` pointing at
/// the progress URL.
fn accepted_response(payload: crate::tasks::ProgressPayload) -> Response {
    let location = format!("{}/progress", payload.id);
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(payload),
    )
        .into_response()
}

fn progress_response(payload: crate::tasks::ProgressPayload, finished: bool) -> Response {
    if finished {
        // Guide the client from `{id}/progress` over to `{id}`.
        (
            [(header::LOCATION, HeaderValue::from_static(".."))],
            Json(payload),
        )
            .into_response()
    } else {
        Json(payload).into_response()
    }
}

// ============ Conditional CORS ============

async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let mut response = next.run(request).await;

    if let Some(origin) = origin {
        if matches!(state.sites.by_origin(&origin).await, Ok(Some(_))) {
            let headers = response.headers_mut();
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
    }
    response
}

// ============ /v1/revisions ============

/// Splits a pipe-delimited id list, rejecting non-integers; the result is
/// distinct ids in first-appearance order.
fn parse_revision_list(raw: &str) -> Result<Vec<u64>, ApiError> {
    if raw.trim().is_empty() {
        return Err(ApiError::RevisionsMissing);
    }
    let mut ids = Vec::new();
    for token in raw.split('|') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let id: u64 = token
            .parse()
            .map_err(|_| ApiError::BadInteger(token.to_string()))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(ApiError::RevisionsMissing);
    }
    Ok(ids)
}

/// The POST body accepts a number, an array of numbers, or the same
/// pipe-delimited string the GET path takes.
fn parse_revisions_value(value: &serde_json::Value) -> Result<Vec<u64>, ApiError> {
    match value {
        serde_json::Value::Null => Err(ApiError::RevisionsMissing),
        serde_json::Value::Number(number) => number
            .as_u64()
            .map(|id| vec![id])
            .ok_or_else(|| ApiError::BadInteger(number.to_string())),
        serde_json::Value::String(raw) => parse_revision_list(raw),
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                return Err(ApiError::RevisionsMissing);
            }
            let mut ids = Vec::new();
            for item in items {
                let id = match item {
                    serde_json::Value::Number(number) => number
                        .as_u64()
                        .ok_or_else(|| ApiError::BadInteger(number.to_string()))?,
                    serde_json::Value::String(raw) => raw
                        .trim()
                        .parse()
                        .map_err(|_| ApiError::BadInteger(raw.clone()))?,
                    other => return Err(ApiError::BadInteger(other.to_string())),
                };
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            Ok(ids)
        }
        other => Err(ApiError::BadInteger(other.to_string())),
    }
}

async fn get_revisions(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    let format = errorformat(&query);
    let raw = query.get("revisions").map(String::as_str).unwrap_or("");
    let ids = parse_revision_list(raw).map_err(|err| ApiFailure::new(err, format))?;
    if ids.len() > PER_BATCH {
        // The bounded GET path refuses oversized requests outright.
        return Err(ApiFailure::new(ApiError::MethodLimited(PER_BATCH), format));
    }
    let wiki = resolve_wiki(&state, &dbname, format, StatusCode::UNPROCESSABLE_ENTITY).await?;
    expand_revisions(&state, &wiki, &ids, format).await
}

async fn post_revisions(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiFailure> {
    let format = errorformat(&query);
    let body = parse_body(&body);
    let ids = parse_revisions_value(&body["revisions"])
        .map_err(|err| ApiFailure::new(err, format))?;
    let wiki = resolve_wiki(&state, &dbname, format, StatusCode::UNPROCESSABLE_ENTITY).await?;
    expand_revisions(&state, &wiki, &ids, format).await
}

/// The shared expansion path: serve what the store already holds, expand
/// the rest under the wall-clock budget, and backfill the store.
async fn expand_revisions(
    state: &AppState,
    wiki: &Arc<Wiki>,
    ids: &[u64],
    format: ErrorFormat,
) -> Result<Response, ApiFailure> {
    let mut revisions: HashMap<u64, crate::models::Revision> = HashMap::new();
    let mut cold: Vec<u64> = Vec::new();
    for &id in ids {
        match state.store.get(&wiki.dbname, id) {
            Some(revision) => {
                revisions.insert(id, revision);
            }
            None => cold.push(id),
        }
    }

    if !cold.is_empty() {
        let expander = state
            .expanders
            .for_wiki(wiki)
            .await
            .map_err(|err| ApiFailure::new(ApiError::Generic(err), format))?;
        let fetched = expander
            .expand_with_timeout(&cold, EXPANDER_TIMEOUT)
            .await
            .map_err(|err| ApiFailure::new(err, format))?;
        for (id, revision) in fetched {
            state.store.set(&wiki.dbname, revision.clone());
            revisions.insert(id, revision);
        }
    }

    let mut body = serde_json::Map::new();
    for (id, revision) in revisions {
        body.insert(id.to_string(), serde_json::to_value(revision).unwrap_or_default());
    }
    Ok(Json(json!({ "version": 1, "revisions": body })).into_response())
}

// ============ /v1/user/deleted-revisions ============

async fn spawn_deleted_revisions(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiFailure> {
    let format = errorformat(&query);
    let body = parse_body(&body);
    let user = required_string(&body, "user", format)?;
    let dbname = required_string(&body, "wiki", format)?;
    let wiki = resolve_wiki(&state, &dbname, format, StatusCode::BAD_REQUEST).await?;
    require_replica(&state, format)?;

    let options = json!({ "user": user.clone(), "wiki": wiki.dbname });
    let worker_state = state.clone();
    let worker_wiki = Arc::clone(&wiki);
    let (id, reused) = state.deleted_tasks.run_task_deduped(&options, move |handle| {
        async move {
            let titler = worker_state
                .titles
                .for_wiki(&worker_state.clients, &worker_wiki)
                .await?;
            let (user_title, _) = titler.user_titles(&user)?;
            handle.set_progress(0.05);

            let pool = worker_state
                .replica
                .connect(&worker_wiki, ReplicaKind::Analytics)
                .await?;
            let revisions = deleted::deleted_revisions(&pool, &user_title.main_text, |p| {
                handle.set_progress(0.05 + p * 0.65)
            })
            .await?;
            let pages = deleted::deleted_pages(&pool, &user_title.main_text, |p| {
                handle.set_progress(0.7 + p * 0.3)
            })
            .await?;
            Ok(json!({ "revisions": revisions, "pages": pages }))
        }
    });

    if reused {
        tracing::debug!(task = %id, "deleted-revisions request deduplicated");
    }
    let (payload, _) = state
        .deleted_tasks
        .handle_progress_request(id)
        .map_err(|err| ApiFailure::new(err, format))?;
    Ok(accepted_response(payload))
}

async fn deleted_revisions_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_progress(&state.deleted_tasks, &id, &query)
}

async fn deleted_revisions_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_result(&state.deleted_tasks, &id, &query)
}

// ============ /v1/user/largest-edits ============

async fn spawn_largest_edits(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiFailure> {
    let format = errorformat(&query);
    let body = parse_body(&body);
    let options: LargestEditsOptions = serde_json::from_value(body)
        .map_err(|err| {
            ApiFailure::new(ApiError::Generic(anyhow::anyhow!("invalid body: {err}")), format)
                .with_status(StatusCode::BAD_REQUEST)
        })?;
    let wiki = resolve_wiki(&state, &options.wiki, format, StatusCode::BAD_REQUEST).await?;
    require_replica(&state, format)?;

    let worker_state = state.clone();
    let worker_wiki = Arc::clone(&wiki);
    let worker_options = options.clone();
    let (id, _) = state.largest_tasks.run_task_deduped(&options, move |handle| async move {
        let titler = worker_state
            .titles
            .for_wiki(&worker_state.clients, &worker_wiki)
            .await?;
        let (user_title, _) = titler.user_titles(&worker_options.user)?;
        handle.set_progress(0.05);

        let pool = worker_state
            .replica
            .connect(&worker_wiki, ReplicaKind::Analytics)
            .await?;
        let expander = worker_state.expanders.for_wiki(&worker_wiki).await?;
        let revisions = largest::largest_edits(
            &pool,
            &expander,
            &user_title.main_text,
            &worker_options,
            |p| handle.set_progress(0.05 + p * 0.95),
        )
        .await?;
        Ok(json!({ "revisions": revisions }))
    });

    let (payload, _) = state
        .largest_tasks
        .handle_progress_request(id)
        .map_err(|err| ApiFailure::new(err, format))?;
    Ok(accepted_response(payload))
}

async fn largest_edits_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_progress(&state.largest_tasks, &id, &query)
}

async fn largest_edits_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_result(&state.largest_tasks, &id, &query)
}

// ============ /v1/user/search-talk ============

async fn spawn_search_talk(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiFailure> {
    let format = errorformat(&query);
    let body = parse_body(&body);
    let user = required_string(&body, "user", format)?;
    let dbname = required_string(&body, "wiki", format)?;
    let spec: FilterSpec = serde_json::from_value(body["filter"].clone()).map_err(|_| {
        ApiFailure::new(
            ApiError::InvalidFilter("filter must be a string, string set, or regex".into()),
            format,
        )
    })?;
    // Compile up front so a bad filter fails the request, not the job.
    let filters = talk::compile_filters(&spec).map_err(|err| ApiFailure::new(err, format))?;
    let wiki = resolve_wiki(&state, &dbname, format, StatusCode::BAD_REQUEST).await?;

    let options = json!({ "user": user.clone(), "wiki": wiki.dbname, "filter": spec });
    let worker_state = state.clone();
    let worker_wiki = Arc::clone(&wiki);
    let (id, _) = state.talk_tasks.run_task_deduped(&options, move |handle| {
        async move {
            let client = worker_state
                .clients
                .for_wiki(&worker_wiki)
                .await?;
            let titler = worker_state
                .titles
                .for_wiki(&worker_state.clients, &worker_wiki)
                .await?;
            let (_, talk_title) = titler.user_titles(&user)?;
            handle.set_progress(0.02);

            // Total revision count for progress; skipped when the replica
            // is degraded.
            let total = if worker_state.replica.available() {
                match worker_state
                    .replica
                    .connect(&worker_wiki, ReplicaKind::Web)
                    .await
                {
                    Ok(pool) => talk::count_page_revisions(
                        &pool,
                        talk_title.namespace,
                        &talk_title.db_key(),
                    )
                    .await
                    .ok(),
                    Err(_) => None,
                }
            } else {
                None
            };

            let events = talk::scan_talk_page(
                &client,
                &worker_wiki,
                &talk_title.prefixed_text,
                &filters,
                total,
                |p| handle.set_progress(0.02 + p * 0.98),
            )
            .await?;
            Ok(json!({ "events": events }))
        }
    });

    let (payload, _) = state
        .talk_tasks
        .handle_progress_request(id)
        .map_err(|err| ApiFailure::new(err, format))?;
    Ok(accepted_response(payload))
}

async fn search_talk_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_progress(&state.talk_tasks, &id, &query)
}

async fn search_talk_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiFailure> {
    task_result(&state.talk_tasks, &id, &query)
}

// ============ Task verb plumbing ============

fn task_progress(
    engine: &TaskEngine,
    id: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiFailure> {
    let format = errorformat(query);
    let id = parse_task_id(id, format)?;
    let (payload, finished) = engine
        .handle_progress_request(id)
        .map_err(|err| ApiFailure::new(err, format))?;
    Ok(progress_response(payload, finished))
}

fn task_result(
    engine: &TaskEngine,
    id: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiFailure> {
    let format = errorformat(query);
    let id = parse_task_id(id, format)?;
    let result = engine
        .handle_result_request(id)
        .map_err(|err| ApiFailure::new(err, format))?;
    Ok(Json(result).into_response())
}

fn required_string(
    body: &serde_json::Value,
    field: &str,
    format: ErrorFormat,
) -> Result<String, ApiFailure> {
    body[field]
        .as_str()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| {
            ApiFailure::new(
                ApiError::Generic(anyhow::anyhow!("missing required field '{field}'")),
                format,
            )
            .with_status(StatusCode::BAD_REQUEST)
        })
}

/// DB-backed endpoints must check for degraded credentials explicitly.
fn require_replica(state: &AppState, format: ErrorFormat) -> Result<(), ApiFailure> {
    if state.replica.available() {
        Ok(())
    } else {
        Err(ApiFailure::new(
            ApiError::Generic(anyhow::anyhow!(
                "replica credentials are not configured; this endpoint is unavailable"
            )),
            format,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_list_rejects_blank_and_bad_tokens() {
        assert!(matches!(
            parse_revision_list(""),
            Err(ApiError::RevisionsMissing)
        ));
        assert!(matches!(
            parse_revision_list("   "),
            Err(ApiError::RevisionsMissing)
        ));
        assert!(matches!(
            parse_revision_list("abc|123"),
            Err(ApiError::BadInteger(token)) if token == "abc"
        ));
        assert!(matches!(
            parse_revision_list("12.5"),
            Err(ApiError::BadInteger(_))
        ));
    }

    #[test]
    fn revision_list_dedups_preserving_order() {
        let ids = parse_revision_list("3|1|3|2|1").unwrap();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn revisions_value_accepts_all_three_shapes() {
        assert_eq!(
            parse_revisions_value(&json!(1234567)).unwrap(),
            vec![1_234_567]
        );
        assert_eq!(
            parse_revisions_value(&json!([1, 2, 3])).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            parse_revisions_value(&json!("1|2|3")).unwrap(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            parse_revisions_value(&json!(null)),
            Err(ApiError::RevisionsMissing)
        ));
        assert!(matches!(
            parse_revisions_value(&json!([])),
            Err(ApiError::RevisionsMissing)
        ));
        assert!(matches!(
            parse_revisions_value(&json!([1, "x"])),
            Err(ApiError::BadInteger(_))
        ));
        assert!(matches!(
            parse_revisions_value(&json!(-5)),
            Err(ApiError::BadInteger(_))
        ));
    }

    #[test]
    fn post_body_has_no_hard_upper_bound() {
        let many: Vec<u64> = (1..=200).collect();
        let ids = parse_revisions_value(&json!(many)).unwrap();
        assert_eq!(ids.len(), 200);
    }
}
