//! Black-box tests over the HTTP surface.
//!
//! The router is driven in-process with a preloaded site catalogue and no
//! replica credentials, which exercises exactly the validation layer: the
//! request-shape errors, status codes, error envelopes, and conditional
//! CORS. Upstream-dependent behavior is covered by the unit tests of the
//! expander, store, and task engine.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::util::ServiceExt;

use dispatch::clients::ClientPool;
use dispatch::config;
use dispatch::expander::ExpanderMap;
use dispatch::models::Wiki;
use dispatch::replica::ReplicaPool;
use dispatch::server::{build_router, AppState};
use dispatch::sites::SiteRegistry;
use dispatch::store::{RevisionStore, StoreOptions};
use dispatch::tasks::TaskEngine;
use dispatch::titles::TitleRegistry;

fn wiki(dbname: &str, url: &str, nonglobal: bool) -> Wiki {
    Wiki {
        dbname: dbname.into(),
        url: url.into(),
        lang: "en".into(),
        private: false,
        closed: false,
        fishbowl: false,
        nonglobal,
    }
}

fn test_state() -> AppState {
    let config = config::from_lookup(|key| match key {
        "DISPATCH_SELF_OAUTH_ACCESS_TOKEN" => Some("test-token".to_string()),
        _ => None,
    })
    .unwrap();
    let clients = Arc::new(ClientPool::new(config.oauth_token.clone()));
    AppState {
        config: Arc::new(config),
        sites: Arc::new(SiteRegistry::preloaded(vec![
            wiki("enwiki", "https://en.wikipedia.org", false),
            wiki("privatewiki", "https://private.example.org", true),
        ])),
        titles: Arc::new(TitleRegistry::new()),
        replica: Arc::new(ReplicaPool::from_env()),
        store: RevisionStore::new(StoreOptions::new()),
        expanders: Arc::new(ExpanderMap::new(Arc::clone(&clients))),
        clients,
        deleted_tasks: Arc::new(TaskEngine::new("deleted-revisions")),
        largest_tasks: Arc::new(TaskEngine::new("largest-edits")),
        talk_tasks: Arc::new(TaskEngine::new("search-talk")),
    }
}

async fn get(uri: &str) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
    let router = build_router(test_state());
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body, headers)
}

async fn post(uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let router = build_router(test_state());
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

fn first_code(body: &serde_json::Value) -> &str {
    body["errors"][0]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn empty_revisions_parameter_is_missing() {
    let (status, body, _) = get("/v1/revisions/enwiki?revisions=").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(first_code(&body), "revisions-missing");

    let (status, body, _) = get("/v1/revisions/enwiki").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(first_code(&body), "revisions-missing");
}

#[tokio::test]
async fn non_integer_revision_is_rejected() {
    let (status, body, _) = get("/v1/revisions/enwiki?revisions=abc%7C123").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(first_code(&body), "badinteger");
    assert!(body["errors"][0]["text"]
        .as_str()
        .unwrap()
        .contains("abc"));
}

#[tokio::test]
async fn oversized_get_is_method_limited() {
    let ids: Vec<String> = (1..=51).map(|id| id.to_string()).collect();
    let uri = format!("/v1/revisions/enwiki?revisions={}", ids.join("%7C"));
    let (status, body, _) = get(&uri).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(first_code(&body), "method-limited");
}

#[tokio::test]
async fn duplicate_ids_do_not_count_toward_the_limit() {
    // 51 tokens but only 50 distinct ids: the request passes validation
    // and proceeds. Whatever the upstream then does, the response must
    // not be method-limited.
    let mut ids: Vec<String> = (1..=50).map(|id| id.to_string()).collect();
    ids.push("1".to_string());
    let uri = format!("/v1/revisions/enwiki?revisions={}", ids.join("%7C"));
    let (status, body, _) = get(&uri).await;
    assert_ne!(status, StatusCode::FORBIDDEN);
    assert_ne!(first_code(&body), "method-limited");
}

#[tokio::test]
async fn unknown_wiki_is_unsupported() {
    let (status, body, _) = get("/v1/revisions/nosuchwiki?revisions=1").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(first_code(&body), "unsupportedwiki");
}

#[tokio::test]
async fn nonglobal_wiki_is_unsupported() {
    let (status, body, _) = get("/v1/revisions/privatewiki?revisions=1").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(first_code(&body), "unsupportedwiki");
}

#[tokio::test]
async fn bc_errorformat_flattens_the_envelope() {
    let (status, body, _) = get("/v1/revisions/enwiki?revisions=&errorformat=bc").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "revisions-missing");
    assert!(body["info"].is_string());
    assert!(body.get("errors").is_none());
}

#[tokio::test]
async fn raw_errorformat_carries_key_and_params() {
    let (status, body, _) =
        get("/v1/revisions/enwiki?revisions=zzz&errorformat=raw").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0]["key"], "badinteger");
    assert_eq!(body["errors"][0]["params"][0], "zzz");
}

#[tokio::test]
async fn task_polling_unknown_ids_is_404() {
    let (status, body, _) = get(
        "/v1/user/deleted-revisions/00000000-0000-4000-8000-000000000000/progress",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(first_code(&body), "task-missing");

    // A non-UUID path segment is indistinguishable from a swept task.
    let (status, body, _) = get("/v1/user/search-talk/not-a-uuid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(first_code(&body), "task-missing");

    let (status, _, _) =
        get("/v1/user/largest-edits/00000000-0000-4000-8000-000000000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn search_talk_rejects_bad_filters() {
    let (status, body) = post(
        "/v1/user/search-talk",
        serde_json::json!({
            "user": "Example",
            "wiki": "enwiki",
            "filter": {"source": "(unclosed", "flags": ""}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_code(&body), "invalidfilter");

    let (status, body) = post(
        "/v1/user/search-talk",
        serde_json::json!({
            "user": "Example",
            "wiki": "enwiki",
            "filter": []
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_code(&body), "invalidfilter");
}

#[tokio::test]
async fn task_spawns_reject_unknown_wikis_with_400() {
    let (status, body) = post(
        "/v1/user/deleted-revisions",
        serde_json::json!({"user": "Example", "wiki": "nosuchwiki"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_code(&body), "unsupportedwiki");

    let (status, body) = post(
        "/v1/user/largest-edits",
        serde_json::json!({"user": "Example", "wiki": "nosuchwiki"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_code(&body), "unsupportedwiki");
}

#[tokio::test]
async fn missing_body_fields_fail_fast() {
    let (status, _) = post(
        "/v1/user/deleted-revisions",
        serde_json::json!({"wiki": "enwiki"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cors_is_granted_only_to_known_wiki_origins() {
    let router = build_router(test_state());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/revisions/enwiki?revisions=")
                .header(header::ORIGIN, "https://en.wikipedia.org")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
    assert_eq!(
        response
            .headers()
            .get(header::VARY)
            .and_then(|value| value.to_str().ok()),
        Some("Origin")
    );

    let router = build_router(test_state());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/revisions/enwiki?revisions=")
                .header(header::ORIGIN, "https://evil.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}
