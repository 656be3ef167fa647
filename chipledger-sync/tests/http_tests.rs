use chipledger_storage::MemoryKeyValueStore;
use chipledger_sync::{
    GrantStatus, HttpRemoteConfig, HttpRemoteStore, RemoteStore, SyncConfig, SyncCoordinator,
    SyncError, SyncOutcome, SyncTrigger,
};
use chipledger_types::{ConversionRate, MinorUnits, Session, SessionAccess, UserId};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HttpRemoteStore {
    HttpRemoteStore::new(HttpRemoteConfig {
        base_url: server.uri(),
        token: Some("tok".into()),
        ..Default::default()
    })
    .unwrap()
}

fn game(name: &str) -> Session {
    let mut session = Session::new(name, ConversionRate::one_to_one(), MinorUnits::new(100));
    let pid = session.add_participant("Ana", session.started_at).unwrap();
    session.standard_buy_in(pid, session.started_at).unwrap();
    session
}

// ── Config ───────────────────────────────────────────────────────

#[test]
fn default_config() {
    let config = HttpRemoteConfig::default();
    assert_eq!(config.base_url, "http://localhost:8080");
    assert_eq!(config.token, None);
    assert_eq!(config.request_timeout_ms, 30_000);
}

#[test]
fn invalid_base_url_is_rejected() {
    let result = HttpRemoteStore::new(HttpRemoteConfig {
        base_url: "not a url".into(),
        ..Default::default()
    });
    assert!(matches!(result, Err(SyncError::Network(_))));
}

#[test]
fn trailing_slash_is_trimmed() {
    let store = HttpRemoteStore::new(HttpRemoteConfig {
        base_url: "https://api.example.com/v1/".into(),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(store.base_url().as_str(), "https://api.example.com/v1");
}

// ── Reads ────────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_owned_repairs_and_drops_bad_entries() {
    let server = MockServer::start().await;
    let session = game("friday");
    Mock::given(method("GET"))
        .and(path("/users/ana/sessions"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            serde_json::to_value(&session).unwrap(),
            {"name": "no id"},
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let ana = UserId::new("ana");
    let owned = store.fetch_owned(&ana).await.unwrap();

    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].session.id, session.id);
    assert_eq!(owned[0].session.access, SessionAccess::Owner);
    assert_eq!(owned[0].session.owner_id, Some(ana));
    assert_eq!(owned[0].grant, None);
}

#[tokio::test]
async fn fetch_shared_reads_grant_entries() {
    let server = MockServer::start().await;
    let session = game("hosted by bob");
    Mock::given(method("GET"))
        .and(path("/users/ana/grants"))
        .and(query_param("status", "accepted"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "grant": {"session_id": session.id, "user_id": "ana", "status": "accepted"},
                "session": session,
            },
            {"grant": "broken"},
        ])))
        .mount(&server)
        .await;

    let shared = store_for(&server)
        .fetch_shared(&UserId::new("ana"), GrantStatus::Accepted)
        .await
        .unwrap();

    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].session.access, SessionAccess::Guest);
    assert_eq!(shared[0].grant.as_ref().unwrap().status, GrantStatus::Accepted);
}

#[tokio::test]
async fn read_errors_map_to_sync_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/expired/sessions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/other/sessions"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/flaky/sessions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let expired = store.fetch_owned(&UserId::new("expired")).await.unwrap_err();
    assert!(expired.is_auth());
    let other = store.fetch_owned(&UserId::new("other")).await.unwrap_err();
    assert!(other.is_auth());
    let flaky = store.fetch_owned(&UserId::new("flaky")).await.unwrap_err();
    assert!(flaky.is_transient());
    assert!(flaky.to_string().contains("maintenance"));
}

// ── Writes ───────────────────────────────────────────────────────

#[tokio::test]
async fn create_posts_session_with_owner() {
    let server = MockServer::start().await;
    let session = game("new");
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .and(body_partial_json(json!({"id": session.id, "owner_id": "ana"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    store_for(&server)
        .create(&UserId::new("ana"), &session)
        .await
        .unwrap();
}

#[tokio::test]
async fn write_errors_map_to_sync_errors() {
    let server = MockServer::start().await;
    let session = game("not mine");
    let route = format!("/sessions/{}", session.id);
    Mock::given(method("PUT"))
        .and(path(route.as_str()))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(route.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let ana = UserId::new("ana");
    let update = store.update(&ana, &session).await.unwrap_err();
    assert!(matches!(update, SyncError::Forbidden(_)));
    let delete = store.delete(&ana, session.id).await.unwrap_err();
    assert!(matches!(delete, SyncError::NotFound(_)));
}

#[tokio::test]
async fn token_can_be_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/ana/sessions"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    store.set_token(Some("fresh".into()));
    assert!(store.fetch_owned(&UserId::new("ana")).await.unwrap().is_empty());
}

// ── End to end ───────────────────────────────────────────────────

#[tokio::test]
async fn coordinator_syncs_over_http() {
    let server = MockServer::start().await;
    let session = game("over the wire");
    Mock::given(method("GET"))
        .and(path("/users/ana/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/ana/grants"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let coordinator = SyncCoordinator::new(
        Arc::new(store_for(&server)),
        Arc::new(MemoryKeyValueStore::new()),
        SyncConfig::default(),
    );
    coordinator.set_user(Some(UserId::new("ana")));

    let outcome = coordinator.sync(SyncTrigger::Mount).await;
    assert!(matches!(outcome, SyncOutcome::Synced { fetched: 1, .. }), "{outcome:?}");
    assert_eq!(coordinator.sessions()[0].name, "over the wire");
}
