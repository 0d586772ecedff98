use crate::budgets::BudgetService;
use crate::config::Config;
use crate::errors::AppError;
use crate::google_ads_client::GoogleAdsClient;
use crate::metrics_sync::{self, LiveMetricsReport, MetricsSyncService, SyncReport};
use crate::models::*;
use crate::oauth::{CallbackParams, OAuthFlow};
use crate::provisioning::{ProvisionRequest, ProvisionResult, ProvisioningService};
use crate::store::{record_activity, Store};
use crate::structure_cache::StructureCache;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_ACTIVITY_LIMIT: i64 = 50;
const MAX_ACTIVITY_LIMIT: i64 = 200;

/// Shared application state injected into handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Persistence for managers, provisioning records and caches.
    pub store: Arc<dyn Store>,
    /// Structure snapshots and the session folder cache.
    pub structure: StructureCache,
    /// Metrics sync pipeline, shared with the scheduler.
    pub sync: Arc<MetricsSyncService>,
    pub budgets: BudgetService,
    pub provisioning: ProvisioningService,
    pub oauth: OAuthFlow,
}

impl AppState {
    /// Wires every service to the same store and remote client.
    pub fn new(config: Config, store: Arc<dyn Store>, client: GoogleAdsClient) -> Self {
        let defaults = config.oauth_defaults();
        Self {
            structure: StructureCache::new(
                store.clone(),
                client.clone(),
                defaults.clone(),
                config.structure_cache_ttl_secs,
            ),
            sync: Arc::new(MetricsSyncService::new(
                store.clone(),
                client.clone(),
                defaults.clone(),
            )),
            budgets: BudgetService::new(store.clone(), client.clone(), defaults.clone()),
            provisioning: ProvisioningService::new(store.clone(), client.clone(), defaults),
            oauth: OAuthFlow::new(store.clone(), client, &config),
            store,
            config,
        }
    }

    /// Replaces the sync service, e.g. to change its pacing.
    pub fn with_sync(mut self, sync: MetricsSyncService) -> Self {
        self.sync = Arc::new(sync);
        self
    }

    async fn manager(&self, id: Uuid) -> Result<ManagerAccount, AppError> {
        self.store
            .get_manager(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", id)))
    }
}

/// API routes, without state or transport layers.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/managers", get(list_managers).post(create_manager))
        .route("/api/v1/managers/:id", delete(delete_manager))
        .route("/api/v1/managers/:id/oauth/authorize", post(authorize))
        .route("/api/v1/oauth/callback", get(oauth_callback))
        .route(
            "/api/v1/managers/:id/connection",
            put(connect_manual).delete(disconnect),
        )
        .route("/api/v1/managers/:id/structure", get(get_structure))
        .route(
            "/api/v1/managers/:id/folders/:folder_id/accounts",
            get(get_folder_accounts),
        )
        .route("/api/v1/managers/:id/metrics", get(get_manager_metrics))
        .route("/api/v1/managers/:id/metrics/live", post(get_live_metrics))
        .route("/api/v1/managers/:id/budgets", post(refresh_budgets))
        .route(
            "/api/v1/managers/:id/accounts",
            get(list_sub_accounts).post(provision_accounts),
        )
        .route("/api/v1/accounts/transfer", post(transfer_accounts))
        .route("/api/v1/metrics", get(list_all_metrics))
        .route("/api/v1/sync", post(trigger_sync))
        .route("/api/v1/activity", get(list_activity))
}

/// Health check plus API routes bound to `state`, without rate limiting.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "mcc-console",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

// ============ Manager accounts ============

/// GET /api/v1/managers
pub async fn list_managers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ManagerAccountView>>, AppError> {
    let managers = state.store.list_managers().await?;
    Ok(Json(managers.into_iter().map(Into::into).collect()))
}

/// POST /api/v1/managers
///
/// # Arguments
///
/// * `payload` - Name, manager number, developer token and owner email; all required.
///
/// # Returns
///
/// * `Result<(StatusCode, Json<ManagerAccountView>), AppError>` - 201 with the new account.
pub async fn create_manager(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewManagerAccount>,
) -> Result<(StatusCode, Json<ManagerAccountView>), AppError> {
    let missing: Vec<&str> = [
        ("name", &payload.name),
        ("mcc_number", &payload.mcc_number),
        ("developer_token", &payload.developer_token),
        ("manager_email", &payload.manager_email),
    ]
    .iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(k, _)| *k)
    .collect();
    if !missing.is_empty() {
        return Err(AppError::ValidationError(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    let manager = state.store.create_manager(&payload).await?;
    record_activity(
        state.store.as_ref(),
        NewActivity::manager(
            ActivityAction::CreateManager,
            &manager,
            json!({ "mcc_number": manager.mcc_number }),
        ),
    )
    .await;

    Ok((StatusCode::CREATED, Json(manager.into())))
}

/// DELETE /api/v1/managers/:id
pub async fn delete_manager(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    if !state.store.delete_manager(id).await? {
        return Err(AppError::NotFound(format!("Manager account {}", id)));
    }

    tracing::info!("Deleted manager account {} ({})", manager.name, id);
    record_activity(
        state.store.as_ref(),
        NewActivity::manager(
            ActivityAction::DeleteManager,
            &manager,
            json!({ "mcc_number": manager.mcc_number }),
        ),
    )
    .await;

    Ok(Json(json!({ "success": true })))
}

// ============ Connection ============

/// POST /api/v1/managers/:id/oauth/authorize
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let auth_url = state.oauth.authorization_url(id).await?;
    Ok(Json(json!({ "auth_url": auth_url })))
}

/// GET /api/v1/oauth/callback
///
/// Always redirects back to the console; failures travel in the `error` parameter.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let target = state.oauth.callback_redirect(&params).await;
    Redirect::to(&target)
}

/// PUT /api/v1/managers/:id/connection
pub async fn connect_manual(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ManagerConnection>,
) -> Result<Json<ManagerAccountView>, AppError> {
    let manager = state.oauth.connect_manual(id, &payload).await?;
    Ok(Json(manager.into()))
}

/// DELETE /api/v1/managers/:id/connection
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ManagerAccountView>, AppError> {
    let manager = state.oauth.disconnect(id).await?;
    Ok(Json(manager.into()))
}

// ============ Structure ============

#[derive(Debug, Default, Deserialize)]
pub struct StructureParams {
    #[serde(default)]
    pub force_refresh: bool,
}

/// GET /api/v1/managers/:id/structure
pub async fn get_structure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<StructureParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    let structure = state
        .structure
        .load(&manager, params.force_refresh)
        .await?;

    Ok(Json(json!({
        "success": true,
        "manager": {
            "id": manager.id,
            "name": manager.name,
            "mcc_number": manager.mcc_number,
        },
        "summary": structure.summary(),
        "structure": structure,
    })))
}

/// GET /api/v1/managers/:id/folders/:folder_id/accounts
pub async fn get_folder_accounts(
    State(state): State<Arc<AppState>>,
    Path((id, folder_id)): Path<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    let accounts = state
        .structure
        .resolve_folder_accounts(&manager, &folder_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "folder_id": folder_id,
        "account_count": accounts.len(),
        "accounts": accounts,
    })))
}

// ============ Metrics ============

/// GET /api/v1/managers/:id/metrics
///
/// Cached figures from the last sync: manager totals plus one row per account.
pub async fn get_manager_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    let totals = state.store.get_manager_metrics(manager.id).await?;
    let accounts = state.store.list_account_metrics(manager.id).await?;

    Ok(Json(json!({
        "success": true,
        "totals": totals,
        "accounts_cost": metrics_sync::total_cost(&accounts),
        "accounts": accounts,
    })))
}

/// GET /api/v1/metrics
pub async fn list_all_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ManagerMetricsCacheRow>>, AppError> {
    Ok(Json(state.store.list_manager_metrics().await?))
}

#[derive(Debug, Deserialize)]
pub struct LiveMetricsRequest {
    pub account_ids: Vec<String>,
}

/// POST /api/v1/managers/:id/metrics/live
pub async fn get_live_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LiveMetricsRequest>,
) -> Result<Json<LiveMetricsReport>, AppError> {
    if payload.account_ids.is_empty() {
        return Err(AppError::ValidationError(
            "account_ids must not be empty".to_string(),
        ));
    }
    let manager = state.manager(id).await?;
    let report = state
        .sync
        .fetch_live_metrics(&manager, &payload.account_ids)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub manager_id: Option<Uuid>,
}

/// POST /api/v1/sync
///
/// Runs a sync now, for every connected manager or only `manager_id`.
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<SyncRequest>>,
) -> Result<Json<SyncReport>, AppError> {
    let scope = payload.and_then(|Json(p)| p.manager_id);
    tracing::info!("POST /sync - scope: {:?}", scope);
    // Spawned so the run completes even if the client goes away.
    let sync = state.sync.clone();
    let report = tokio::spawn(async move { sync.sync_all(scope).await })
        .await
        .map_err(|e| AppError::InternalError(format!("Sync task failed: {}", e)))??;
    Ok(Json(report))
}

/// POST /api/v1/managers/:id/budgets
pub async fn refresh_budgets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    let summary = state.budgets.refresh(&manager).await?;
    Ok(Json(json!({ "success": true, "budget": summary })))
}

// ============ Sub-accounts ============

/// GET /api/v1/managers/:id/accounts
pub async fn list_sub_accounts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager(id).await?;
    let accounts = state.store.list_sub_accounts(manager.id).await?;
    let invitations = state.store.list_invitations(manager.id).await?;
    Ok(Json(json!({
        "accounts": accounts,
        "invitations": invitations,
    })))
}

/// POST /api/v1/managers/:id/accounts
///
/// # Returns
///
/// * `Response` - 200 when at least one account was created, 502 when none were.
pub async fn provision_accounts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProvisionRequest>,
) -> Result<Response, AppError> {
    let result: ProvisionResult = state.provisioning.provision(id, &payload).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(result)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_manager_id: Uuid,
    pub to_manager_id: Uuid,
    pub account_ids: Vec<Uuid>,
}

/// POST /api/v1/accounts/transfer
pub async fn transfer_accounts(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TransferRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if payload.from_manager_id == payload.to_manager_id {
        return Err(AppError::ValidationError(
            "Source and target manager must differ".to_string(),
        ));
    }
    if payload.account_ids.is_empty() {
        return Err(AppError::ValidationError(
            "account_ids must not be empty".to_string(),
        ));
    }

    let from = state.manager(payload.from_manager_id).await?;
    let to = state.manager(payload.to_manager_id).await?;
    let transferred = state
        .store
        .transfer_sub_accounts(&payload.account_ids, from.id, to.id)
        .await?;

    tracing::info!(
        "Transferred {} account(s) from {} to {}",
        transferred,
        from.name,
        to.name
    );
    record_activity(
        state.store.as_ref(),
        NewActivity::manager(
            ActivityAction::Transfer,
            &to,
            json!({
                "from": from.name,
                "to": to.name,
                "count": transferred,
            }),
        ),
    )
    .await;

    Ok(Json(json!({ "success": true, "transferred": transferred })))
}

// ============ Activity ============

#[derive(Debug, Default, Deserialize)]
pub struct ActivityParams {
    pub limit: Option<i64>,
}

/// GET /api/v1/activity
pub async fn list_activity(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Vec<ActivityEntry>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    Ok(Json(state.store.list_activity(limit).await?))
}
