/// Integration tests with a mocked Google Ads API and OAuth server
/// Exercises sync, structure, provisioning and the connect flow end to end
/// against the in-memory store.
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use mcc_console::backoff::RetryPolicy;
use mcc_console::config::Config;
use mcc_console::errors::AppError;
use mcc_console::google_ads_client::{GoogleAdsClient, MAX_PAGES};
use mcc_console::google_ads_models::AccessLevel;
use mcc_console::metrics_sync::{MetricsSyncService, SyncPacing};
use mcc_console::models::{
    AccountMetricsCacheRow, ManagerAccount, ManagerMetricsCacheRow, OAuthClient,
};
use mcc_console::oauth::{CallbackParams, OAuthFlow};
use mcc_console::provisioning::{EmailInvitation, ProvisionRequest, ProvisioningService};
use mcc_console::store::Store;
use mcc_console::structure_cache::StructureCache;
use mcc_console::testing::{manager_fixture, MemoryStore, RecordingSleeper};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MCC: &str = "111-222-3333";
const MCC_ID: &str = "1112223333";

fn test_config(uri: &str) -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 3000,
        ads_api_base_url: format!("{}/v22", uri),
        oauth_token_url: format!("{}/token", uri),
        oauth_authorize_url: format!("{}/auth", uri),
        oauth_userinfo_url: format!("{}/userinfo", uri),
        default_client_id: "default-client".to_string(),
        default_client_secret: "default-secret".to_string(),
        oauth_redirect_uri: "http://localhost:3000/api/v1/oauth/callback".to_string(),
        app_url: "http://localhost:8080".to_string(),
        structure_cache_ttl_secs: 3600,
        sync_interval_secs: 1800,
        sync_schedule_enabled: false,
    }
}

fn oauth_defaults() -> OAuthClient {
    OAuthClient {
        client_id: "default-client".to_string(),
        client_secret: "default-secret".to_string(),
    }
}

fn test_client(server: &MockServer, sleeper: Arc<RecordingSleeper>) -> GoogleAdsClient {
    GoogleAdsClient::new(&test_config(&server.uri()))
        .expect("client")
        .with_sleeper(sleeper)
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-123",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

fn customer_row(id: &str, name: &str, manager: bool, level: i64) -> Value {
    json!({
        "customerClient": {
            "id": id,
            "descriptiveName": name,
            "currencyCode": "USD",
            "timeZone": "Europe/Kyiv",
            "manager": manager,
            "testAccount": false,
            "status": "ENABLED",
            "level": level.to_string()
        }
    })
}

async fn mount_leaf_accounts(server: &MockServer, ids: &[&str]) {
    let rows: Vec<Value> = ids
        .iter()
        .map(|id| customer_row(id, &format!("Client {}", id), false, 1))
        .collect();
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .and(body_string_contains("customer_client.manager = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": rows })))
        .mount(server)
        .await;
}

async fn mount_campaign_metrics(
    server: &MockServer,
    customer_id: &str,
    clicks: i64,
    impressions: i64,
    cost_micros: i64,
) {
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", customer_id)))
        .and(body_string_contains("FROM campaign"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "metrics": {
                    "clicks": clicks.to_string(),
                    "impressions": impressions.to_string(),
                    "costMicros": cost_micros.to_string(),
                    "conversions": 1.0
                }
            }]
        })))
        .mount(server)
        .await;
}

/// Cached account rows without their write timestamps.
async fn snapshot(store: &MemoryStore, manager: &ManagerAccount) -> Vec<AccountMetricsCacheRow> {
    let epoch = DateTime::<Utc>::default();
    store
        .list_account_metrics(manager.id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| AccountMetricsCacheRow {
            last_updated_at: epoch,
            ..row
        })
        .collect()
}

async fn seeded_store(manager: &ManagerAccount) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_manager(manager.clone()).await;
    store
}

#[tokio::test]
async fn test_sync_three_accounts_with_one_failing() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_leaf_accounts(&server, &["1000000001", "1000000002", "1000000003"]).await;
    mount_campaign_metrics(&server, "1000000001", 5, 50, 2_000_000).await;
    mount_campaign_metrics(&server, "1000000002", 10, 100, 5_000_000).await;
    Mock::given(method("POST"))
        .and(path("/v22/customers/1000000003/googleAds:search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let service = MetricsSyncService::new(
        store.clone(),
        test_client(&server, sleeper.clone()),
        oauth_defaults(),
    )
    .with_pacing(SyncPacing::none());

    let report = service.sync_all(None).await.unwrap();
    assert!(report.success);
    assert_eq!(report.results.len(), 1);
    let result = &report.results[0];
    assert!(result.success, "unexpected error: {:?}", result.error);
    assert_eq!(result.account_count, Some(3));
    assert_eq!(result.total_clicks, Some(15));
    assert_eq!(result.total_cost, Some(dec("7.00")));

    let totals = store.get_manager_metrics(manager.id).await.unwrap().unwrap();
    assert_eq!(totals.total_clicks, 15);
    assert_eq!(totals.total_impressions, 150);
    assert_eq!(totals.total_cost, dec("7.00"));
    assert_eq!(totals.ctr, dec("10.00"));
    assert_eq!(totals.account_count, 3);

    let rows = store.list_account_metrics(manager.id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].customer_id, "1000000002");
    let failed = rows.iter().find(|r| r.customer_id == "1000000003").unwrap();
    assert_eq!(failed.clicks, 0);
    assert_eq!(failed.cost, dec("0.00"));
}

#[tokio::test]
async fn test_resync_replaces_snapshot() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_leaf_accounts(&server, &["1000000001", "1000000002", "1000000003"]).await;
    mount_campaign_metrics(&server, "1000000001", 3, 40, 1_250_000).await;
    mount_campaign_metrics(&server, "1000000002", 7, 90, 2_345_678).await;
    mount_campaign_metrics(&server, "1000000003", 0, 0, 0).await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let service = MetricsSyncService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    )
    .with_pacing(SyncPacing::none());

    service.sync_all(None).await.unwrap();
    let first = snapshot(&store, &manager).await;
    let first_totals = store.get_manager_metrics(manager.id).await.unwrap().unwrap();

    service.sync_all(None).await.unwrap();
    let second = snapshot(&store, &manager).await;
    let second_totals = store.get_manager_metrics(manager.id).await.unwrap().unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    let cpc = first.iter().find(|r| r.customer_id == "1000000002").unwrap();
    assert_eq!(cpc.cost, dec("2.35"));
    assert_eq!(cpc.ctr, dec("7.78"));
    assert_eq!(cpc.avg_cpc, dec("0.34"));
    assert_eq!(second_totals.total_clicks, 10);
    assert_eq!(
        ManagerMetricsCacheRow {
            last_updated_at: first_totals.last_updated_at,
            ..second_totals
        },
        first_totals
    );

    // One account leaves the hierarchy
    server.reset().await;
    mount_token(&server).await;
    mount_leaf_accounts(&server, &["1000000001", "1000000002"]).await;
    for id in ["1000000001", "1000000002"] {
        mount_campaign_metrics(&server, id, 1, 10, 1_000_000).await;
    }

    service.sync_all(Some(manager.id)).await.unwrap();
    let rows = store.list_account_metrics(manager.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.customer_id != "1000000003"));
    let totals = store.get_manager_metrics(manager.id).await.unwrap().unwrap();
    assert_eq!(totals.account_count, 2);
    assert_eq!(totals.total_cost, dec("2.00"));
}

#[tokio::test]
async fn test_cancelled_sync_does_not_block_the_next_run() {
    let server = MockServer::start().await;
    // The first token exchange is slow enough for the caller to give up
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "access_token": "access-slow",
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }))
                .set_delay(Duration::from_millis(500)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_token(&server).await;
    mount_leaf_accounts(&server, &["1000000001"]).await;
    mount_campaign_metrics(&server, "1000000001", 4, 40, 1_000_000).await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let service = MetricsSyncService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    )
    .with_pacing(SyncPacing::none());

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), service.sync_manager(&manager)).await;
    assert!(abandoned.is_err());

    let result = service.sync_manager(&manager).await;
    assert!(result.success, "unexpected error: {:?}", result.error);
    assert_eq!(result.total_clicks, Some(4));
    assert_eq!(store.list_account_metrics(manager.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_pacing_is_applied_between_accounts_and_managers() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_leaf_accounts(&server, &["1000000001", "1000000002"]).await;
    for id in ["1000000001", "1000000002"] {
        mount_campaign_metrics(&server, id, 1, 10, 1_000_000).await;
    }

    let first = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let second = manager_fixture("Beta", MCC, Some("refresh-token"));
    let store = seeded_store(&first).await;
    store.seed_manager(second).await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let service = MetricsSyncService::new(
        store.clone(),
        test_client(&server, sleeper.clone()),
        oauth_defaults(),
    );

    let report = service.sync_all(None).await.unwrap();
    assert_eq!(report.results.len(), 2);

    let waits = sleeper.recorded();
    let account_delay = SyncPacing::default().account_delay;
    let manager_pause = SyncPacing::default().manager_pause;
    assert_eq!(waits.iter().filter(|w| **w == manager_pause).count(), 1);
    assert_eq!(waits.iter().filter(|w| **w == account_delay).count(), 2);
}

#[tokio::test]
async fn test_sync_of_disconnected_manager_is_skipped() {
    let server = MockServer::start().await;
    let manager = manager_fixture("Alpha", MCC, None);
    let store = seeded_store(&manager).await;
    let service = MetricsSyncService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    )
    .with_pacing(SyncPacing::none());

    let report = service.sync_all(None).await.unwrap();
    assert!(report.results.is_empty());
    assert!(store.get_manager_metrics(manager.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rate_limit_backoff_waits_10_then_20_seconds() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [customer_row("1000000001", "Client", false, 1)]
        })))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = test_client(&server, sleeper.clone());
    let session = client.open_session(&manager, &oauth_defaults()).await.unwrap();

    let response = client
        .query(&session, MCC_ID, "SELECT customer_client.id FROM customer_client", None)
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_secs(10), Duration::from_secs(20)]
    );
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_retry_budget() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
        .expect(2)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = test_client(&server, sleeper.clone())
        .with_retry_policy(RetryPolicy::default().with_max_retries(1));
    let session = client.open_session(&manager, &oauth_defaults()).await.unwrap();

    let err = client
        .query(&session, MCC_ID, "SELECT customer_client.id FROM customer_client", None)
        .await
        .unwrap_err();
    assert_eq!(err.remote_status(), Some(429));
    assert_eq!(sleeper.recorded(), vec![Duration::from_secs(10)]);
}

#[tokio::test]
async fn test_pagination_stops_at_page_limit() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [customer_row("1000000001", "Client", false, 1)],
            "nextPageToken": "more"
        })))
        .expect(MAX_PAGES as u64)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let client = test_client(&server, Arc::new(RecordingSleeper::default()));
    let session = client.open_session(&manager, &oauth_defaults()).await.unwrap();

    let rows = client
        .query_all_pages(&session, MCC_ID, "SELECT customer_client.id FROM customer_client", None)
        .await
        .unwrap();
    assert_eq!(rows.len(), MAX_PAGES);
}

#[tokio::test]
async fn test_rejected_refresh_token_surfaces_description() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("stale-token"));
    let client = test_client(&server, Arc::new(RecordingSleeper::default()));

    match client.open_session(&manager, &oauth_defaults()).await {
        Err(AppError::AuthError(msg)) => {
            assert_eq!(msg, "Token has been expired or revoked.");
        }
        other => panic!("expected AuthError, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_structure_is_cached_after_first_load() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}/googleAds:search", MCC_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                customer_row(MCC_ID, "Root", true, 0),
                customer_row("5550001111", "Folder", true, 1),
                customer_row("1000000001", "Ours", false, 1),
                customer_row("1000000002", "Theirs", false, 2)
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    store
        .insert_sub_account(&mcc_console::models::NewSubAccount {
            manager_account_id: manager.id,
            customer_id: "100-000-0001".to_string(),
            currency_code: "USD".to_string(),
            timezone: "Europe/Kyiv".to_string(),
        })
        .await
        .unwrap();

    let cache = StructureCache::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
        3600,
    );

    let first = cache.load(&manager, false).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.total_folders, 1);
    assert_eq!(first.total_accounts, 2);
    let summary = first.summary();
    assert_eq!(summary.created_by_us, 1);
    assert_eq!(summary.external, 1);

    let second = cache.load(&manager, false).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.accounts, first.accounts);
}

#[tokio::test]
async fn test_forbidden_folder_resolves_to_empty_and_is_cached() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/v22/customers/5550001111/googleAds:search"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "The caller does not have permission" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let cache = StructureCache::new(
        store,
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
        3600,
    );

    let accounts = cache
        .resolve_folder_accounts(&manager, "555-000-1111")
        .await
        .unwrap();
    assert!(accounts.is_empty());

    let again = cache
        .resolve_folder_accounts(&manager, "5550001111")
        .await
        .unwrap();
    assert!(again.is_empty());
}

/// Hands out increasing customer ids for `createCustomerClient`.
struct SequentialAccounts {
    next: AtomicU64,
}

impl Respond for SequentialAccounts {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(json!({
            "resourceName": format!("customers/{}/customerClients/{}", MCC_ID, id)
        }))
    }
}

#[tokio::test]
async fn test_provision_batch_with_one_failure() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}:createCustomerClient", MCC_ID)))
        .respond_with(SequentialAccounts {
            next: AtomicU64::new(9_000_000_001),
        })
        .expect(20)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(
            r"^/v22/customers/\d+/customerUserAccessInvitations:mutate$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "resourceName": "customers/1/customerUserAccessInvitations/1" }
        })))
        .expect(19)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    // The fifth account is created remotely but cannot be saved
    store.reject_sub_account("9000000005").await;

    let service = ProvisioningService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    );
    let request = ProvisionRequest {
        currency: "usd".to_string(),
        timezone: "Kyiv".to_string(),
        emails: (1..=20)
            .map(|i| EmailInvitation {
                email: format!("client{}@example.com", i),
                access_level: AccessLevel::Standard,
            })
            .collect(),
    };

    let result = service.provision(manager.id, &request).await.unwrap();
    assert!(result.success);
    assert_eq!(result.summary.total_requested, 20);
    assert_eq!(result.summary.accounts_created, 19);
    assert_eq!(result.summary.invitations_sent, 19);
    assert_eq!(result.summary.errors_count, 1);
    assert_eq!(result.summary.currency, "USD");
    assert_eq!(result.summary.timezone, "Europe/Kiev");
    assert_eq!(result.errors[0].email, "client5@example.com");
    assert!(result.errors[0].error.contains("9000000005"));

    assert_eq!(store.list_sub_accounts(manager.id).await.unwrap().len(), 19);
    assert_eq!(store.list_invitations(manager.id).await.unwrap().len(), 19);
    assert!(store
        .activity_actions()
        .await
        .contains(&"create_account".to_string()));
}

/// Like `SequentialAccounts`, but the `reject`-th call fails with a Google Ads error body.
struct RejectsOneCreation {
    accounts: SequentialAccounts,
    calls: AtomicU64,
    reject: u64,
}

impl Respond for RejectsOneCreation {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call != self.reject {
            return self.accounts.respond(request);
        }
        ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": 400,
                "message": "Request contains an invalid argument.",
                "status": "INVALID_ARGUMENT",
                "details": [{
                    "@type": "type.googleapis.com/google.ads.googleads.v22.errors.GoogleAdsFailure",
                    "errors": [{
                        "errorCode": { "customerError": "ACCOUNT_LIMIT_REACHED" },
                        "message": "The manager has reached its client account limit."
                    }]
                }]
            }
        }))
    }
}

#[tokio::test]
async fn test_provision_batch_with_one_remote_rejection() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}:createCustomerClient", MCC_ID)))
        .respond_with(RejectsOneCreation {
            accounts: SequentialAccounts {
                next: AtomicU64::new(9_200_000_001),
            },
            calls: AtomicU64::new(0),
            reject: 12,
        })
        .expect(20)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(
            r"^/v22/customers/\d+/customerUserAccessInvitations:mutate$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "resourceName": "customers/1/customerUserAccessInvitations/1" }
        })))
        .expect(19)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let service = ProvisioningService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    );
    let request = ProvisionRequest {
        currency: "USD".to_string(),
        timezone: "UTC".to_string(),
        emails: (1..=20)
            .map(|i| EmailInvitation {
                email: format!("client{}@example.com", i),
                access_level: AccessLevel::Admin,
            })
            .collect(),
    };

    let result = service.provision(manager.id, &request).await.unwrap();
    assert!(result.success);
    assert_eq!(result.summary.accounts_created, 19);
    assert_eq!(result.summary.invitations_sent, 19);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].email, "client12@example.com");
    let error = &result.errors[0].error;
    assert!(error.contains("400"), "{}", error);
    assert!(
        error.contains("The manager has reached its client account limit."),
        "{}",
        error
    );
    assert!(!error.contains("INVALID_ARGUMENT"), "{}", error);
    assert_eq!(store.list_sub_accounts(manager.id).await.unwrap().len(), 19);
}

#[tokio::test]
async fn test_unsaved_invitation_keeps_created_account() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}:createCustomerClient", MCC_ID)))
        .respond_with(SequentialAccounts {
            next: AtomicU64::new(9_300_000_001),
        })
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(
            r"^/v22/customers/\d+/customerUserAccessInvitations:mutate$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "resourceName": "customers/1/customerUserAccessInvitations/1" }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    store.reject_invitation("second@example.com").await;
    let service = ProvisioningService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    );
    let request = ProvisionRequest {
        currency: "USD".to_string(),
        timezone: "UTC".to_string(),
        emails: ["first@example.com", "second@example.com"]
            .iter()
            .map(|email| EmailInvitation {
                email: email.to_string(),
                access_level: AccessLevel::Standard,
            })
            .collect(),
    };

    let result = service.provision(manager.id, &request).await.unwrap();
    assert!(result.success);
    assert!(result.errors.is_empty());
    assert_eq!(result.summary.accounts_created, 2);
    assert_eq!(result.summary.invitations_sent, 2);
    assert_eq!(result.accounts.len(), 2);
    assert_eq!(result.invitations.len(), 1);
    assert_eq!(store.list_sub_accounts(manager.id).await.unwrap().len(), 2);
    assert_eq!(store.list_invitations(manager.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_invitation_is_recorded_not_fatal() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/v22/customers/{}:createCustomerClient", MCC_ID)))
        .respond_with(SequentialAccounts {
            next: AtomicU64::new(9_100_000_001),
        })
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(
            r"^/v22/customers/\d+/customerUserAccessInvitations:mutate$",
        ))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid email"))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, Some("refresh-token"));
    let store = seeded_store(&manager).await;
    let service = ProvisioningService::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    );
    let request = ProvisionRequest {
        currency: "EUR".to_string(),
        timezone: "UTC".to_string(),
        emails: vec![EmailInvitation {
            email: "someone@example.com".to_string(),
            access_level: AccessLevel::Read,
        }],
    };

    let result = service.provision(manager.id, &request).await.unwrap();
    assert!(result.success);
    assert_eq!(result.summary.accounts_created, 1);
    assert_eq!(result.summary.invitations_sent, 0);
    assert!(result.errors.is_empty());
    assert_eq!(result.invitations[0].status, "failed");
    assert_eq!(result.invitations[0].access_level, "read");
}

#[tokio::test]
async fn test_provision_requires_connection() {
    let server = MockServer::start().await;
    let manager = manager_fixture("Alpha", MCC, None);
    let store = seeded_store(&manager).await;
    let service = ProvisioningService::new(
        store,
        test_client(&server, Arc::new(RecordingSleeper::default())),
        oauth_defaults(),
    );
    let request = ProvisionRequest {
        currency: "USD".to_string(),
        timezone: "UTC".to_string(),
        emails: vec![EmailInvitation {
            email: "someone@example.com".to_string(),
            access_level: AccessLevel::Admin,
        }],
    };

    let err = service.provision(manager.id, &request).await.unwrap_err();
    assert!(matches!(err, AppError::NotConnected(_)));
}

#[tokio::test]
async fn test_oauth_callback_stores_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-123",
            "refresh_token": "fresh-refresh-token",
            "expires_in": 3599
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": "ops@agency.example"
        })))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, None);
    let store = seeded_store(&manager).await;
    let config = test_config(&server.uri());
    let flow = OAuthFlow::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        &config,
    );

    let redirect = flow
        .callback_redirect(&CallbackParams {
            code: Some("auth-code".to_string()),
            state: Some(manager.id.to_string()),
            error: None,
        })
        .await;
    assert_eq!(redirect, "http://localhost:8080/accounts?google_connected=true");

    let stored = store.get_manager(manager.id).await.unwrap().unwrap();
    assert_eq!(
        stored.google_refresh_token.as_deref(),
        Some("fresh-refresh-token")
    );
    assert_eq!(
        stored.google_connected_email.as_deref(),
        Some("ops@agency.example")
    );
    assert!(stored.is_connected());
    assert!(store
        .activity_actions()
        .await
        .contains(&"connect_google".to_string()));
}

#[tokio::test]
async fn test_oauth_callback_without_refresh_token_redirects_with_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-123"
        })))
        .mount(&server)
        .await;

    let manager = manager_fixture("Alpha", MCC, None);
    let store = seeded_store(&manager).await;
    let config = test_config(&server.uri());
    let flow = OAuthFlow::new(
        store.clone(),
        test_client(&server, Arc::new(RecordingSleeper::default())),
        &config,
    );

    let redirect = flow
        .callback_redirect(&CallbackParams {
            code: Some("auth-code".to_string()),
            state: Some(manager.id.to_string()),
            error: None,
        })
        .await;
    assert!(redirect.starts_with("http://localhost:8080/accounts?error="));
    let stored = store.get_manager(manager.id).await.unwrap().unwrap();
    assert!(stored.google_refresh_token.is_none());
}

#[tokio::test]
async fn test_oauth_callback_missing_params() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let config = test_config(&server.uri());
    let flow = OAuthFlow::new(
        store,
        test_client(&server, Arc::new(RecordingSleeper::default())),
        &config,
    );

    let redirect = flow
        .callback_redirect(&CallbackParams {
            code: Some("auth-code".to_string()),
            state: None,
            error: None,
        })
        .await;
    assert_eq!(redirect, "http://localhost:8080/accounts?error=missing_params");

    let denied = flow
        .callback_redirect(&CallbackParams {
            code: None,
            state: None,
            error: Some("access_denied".to_string()),
        })
        .await;
    assert_eq!(denied, "http://localhost:8080/accounts?error=access_denied");
}
