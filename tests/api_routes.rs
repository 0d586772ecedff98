/// Router-level tests: requests go through the axum app without a socket.
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use mcc_console::config::Config;
use mcc_console::google_ads_client::GoogleAdsClient;
use mcc_console::handlers::{self, AppState};
use mcc_console::models::NewSubAccount;
use mcc_console::store::Store;
use mcc_console::testing::{manager_fixture, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn test_config() -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 3000,
        ads_api_base_url: "http://127.0.0.1:9/v22".to_string(),
        oauth_token_url: "http://127.0.0.1:9/token".to_string(),
        oauth_authorize_url: "https://accounts.example.com/o/oauth2/v2/auth".to_string(),
        oauth_userinfo_url: "http://127.0.0.1:9/userinfo".to_string(),
        default_client_id: "default-client".to_string(),
        default_client_secret: "default-secret".to_string(),
        oauth_redirect_uri: "http://localhost:3000/api/v1/oauth/callback".to_string(),
        app_url: "http://localhost:8080".to_string(),
        structure_cache_ttl_secs: 3600,
        sync_interval_secs: 1800,
        sync_schedule_enabled: false,
    }
}

fn test_app(store: Arc<MemoryStore>) -> Router {
    let config = test_config();
    let client = GoogleAdsClient::new(&config).unwrap();
    handlers::app(Arc::new(AppState::new(config, store, client)))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(test_app(Arc::new(MemoryStore::new())), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_manager_and_list_without_secrets() {
    let store = Arc::new(MemoryStore::new());
    let (status, created) = send(
        test_app(store.clone()),
        json_request(
            "POST",
            "/api/v1/managers",
            json!({
                "name": "Agency One",
                "mcc_number": "123-456-7890",
                "developer_token": "dev-token-secret",
                "manager_email": "owner@agency.example"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "Agency One");
    assert_eq!(created["connected"], false);

    let (status, listed) = send(test_app(store.clone()), get("/api/v1/managers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(!listed.to_string().contains("dev-token-secret"));
    assert_eq!(store.activity_actions().await, vec!["create_mss".to_string()]);
}

#[tokio::test]
async fn test_create_manager_rejects_blank_fields() {
    let (status, body) = send(
        test_app(Arc::new(MemoryStore::new())),
        json_request(
            "POST",
            "/api/v1/managers",
            json!({
                "name": "  ",
                "mcc_number": "123-456-7890",
                "developer_token": "",
                "manager_email": "owner@agency.example"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body.to_string();
    assert!(message.contains("name"));
    assert!(message.contains("developer_token"));
}

#[tokio::test]
async fn test_delete_unknown_manager_is_not_found() {
    let uri = format!("/api/v1/managers/{}", Uuid::new_v4());
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(test_app(Arc::new(MemoryStore::new())), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_authorize_returns_consent_url() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_fixture("Alpha", "111-222-3333", None);
    store.seed_manager(manager.clone()).await;

    let (status, body) = send(
        test_app(store),
        json_request(
            "POST",
            &format!("/api/v1/managers/{}/oauth/authorize", manager.id),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let url = body["auth_url"].as_str().unwrap();
    assert!(url.starts_with("https://accounts.example.com/o/oauth2/v2/auth?"));
    assert!(url.contains("client_id=default-client"));
    assert!(url.contains(&manager.id.to_string()));
}

#[tokio::test]
async fn test_callback_error_redirects_to_console() {
    let response = test_app(Arc::new(MemoryStore::new()))
        .oneshot(get("/api/v1/oauth/callback?error=access_denied"))
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://localhost:8080/accounts?error=access_denied"
    );
}

#[tokio::test]
async fn test_manual_connect_then_disconnect() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_fixture("Alpha", "111-222-3333", None);
    store.seed_manager(manager.clone()).await;
    let uri = format!("/api/v1/managers/{}/connection", manager.id);

    let (status, body) = send(
        test_app(store.clone()),
        json_request(
            "PUT",
            &uri,
            json!({
                "refresh_token": "1//manual-token",
                "connected_email": "ops@agency.example"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);

    let request = Request::builder()
        .method("DELETE")
        .uri(&uri)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(test_app(store.clone()), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert_eq!(
        store.activity_actions().await,
        vec!["connect_google".to_string(), "disconnect_google".to_string()]
    );
}

#[tokio::test]
async fn test_structure_requires_connection() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_fixture("Alpha", "111-222-3333", None);
    store.seed_manager(manager.clone()).await;

    let (status, _) = send(
        test_app(store),
        get(&format!("/api/v1/managers/{}/structure", manager.id)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_transfer_moves_sub_accounts() {
    let store = Arc::new(MemoryStore::new());
    let from = manager_fixture("Alpha", "111-222-3333", None);
    let to = manager_fixture("Beta", "444-555-6666", None);
    store.seed_manager(from.clone()).await;
    store.seed_manager(to.clone()).await;
    let account = store
        .insert_sub_account(&NewSubAccount {
            manager_account_id: from.id,
            customer_id: "1000000001".to_string(),
            currency_code: "USD".to_string(),
            timezone: "UTC".to_string(),
        })
        .await
        .unwrap();

    let (status, body) = send(
        test_app(store.clone()),
        json_request(
            "POST",
            "/api/v1/accounts/transfer",
            json!({
                "from_manager_id": from.id,
                "to_manager_id": to.id,
                "account_ids": [account.id]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transferred"], 1);
    assert!(store.list_sub_accounts(from.id).await.unwrap().is_empty());
    assert_eq!(store.list_sub_accounts(to.id).await.unwrap().len(), 1);
    assert!(store
        .activity_actions()
        .await
        .contains(&"transfer".to_string()));
}

#[tokio::test]
async fn test_transfer_to_same_manager_rejected() {
    let id = Uuid::new_v4();
    let (status, _) = send(
        test_app(Arc::new(MemoryStore::new())),
        json_request(
            "POST",
            "/api/v1/accounts/transfer",
            json!({
                "from_manager_id": id,
                "to_manager_id": id,
                "account_ids": [Uuid::new_v4()]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_without_body_covers_no_managers() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sync")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(test_app(Arc::new(MemoryStore::new())), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_activity_limit_is_clamped() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_fixture("Alpha", "111-222-3333", None);
    store.seed_manager(manager.clone()).await;
    for _ in 0..3 {
        mcc_console::store::record_activity(
            store.as_ref(),
            mcc_console::models::NewActivity::manager(
                mcc_console::models::ActivityAction::Transfer,
                &manager,
                json!({}),
            ),
        )
        .await;
    }

    let (status, body) = send(test_app(store), get("/api/v1/activity?limit=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}
