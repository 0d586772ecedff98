use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::google_ads_models::{normalize_customer_id, AccessLevel};

// ============ Database Models ============

/// A top-level manager (MCC) credential set.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManagerAccount {
    /// Local identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// External manager id as typed by operators (may contain dashes).
    pub mcc_number: String,
    /// Google Ads developer token.
    #[serde(skip_serializing)]
    pub developer_token: String,
    /// Contact email of the manager owner.
    pub manager_email: String,
    /// OAuth client override.
    pub google_client_id: Option<String>,
    #[serde(skip_serializing)]
    pub google_client_secret: Option<String>,
    /// Present while the account is connected.
    #[serde(skip_serializing)]
    pub google_refresh_token: Option<String>,
    /// Google user that granted consent.
    pub google_connected_email: Option<String>,
    pub google_connected_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ManagerAccount {
    /// External manager id without dashes.
    pub fn customer_id(&self) -> String {
        normalize_customer_id(&self.mcc_number)
    }

    pub fn is_connected(&self) -> bool {
        self.google_refresh_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    /// The account's own OAuth client when both halves are set, else `defaults`.
    pub fn oauth_client(&self, defaults: &OAuthClient) -> OAuthClient {
        match (
            self.google_client_id.as_deref().filter(|s| !s.is_empty()),
            self.google_client_secret.as_deref().filter(|s| !s.is_empty()),
        ) {
            (Some(client_id), Some(client_secret)) => OAuthClient {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            },
            _ => defaults.clone(),
        }
    }
}

/// OAuth client credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

/// Fields required to register a manager account.
#[derive(Debug, Clone, Deserialize)]
pub struct NewManagerAccount {
    pub name: String,
    pub mcc_number: String,
    pub developer_token: String,
    pub manager_email: String,
}

/// Credentials stored when a manager account is connected.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConnection {
    /// Optional OAuth client override (manual connect).
    #[serde(default)]
    pub google_client_id: Option<String>,
    #[serde(default)]
    pub google_client_secret: Option<String>,
    pub refresh_token: String,
    pub connected_email: String,
}

/// A leaf account provisioned by this service.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SubAccount {
    pub id: Uuid,
    pub manager_account_id: Uuid,
    /// External numeric id (no dashes).
    pub customer_id: String,
    pub currency_code: String,
    pub timezone: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubAccount {
    pub manager_account_id: Uuid,
    pub customer_id: String,
    pub currency_code: String,
    pub timezone: String,
}

/// Delivery state of an access invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Sent,
    Failed,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Sent => "sent",
            InvitationStatus::Failed => "failed",
        }
    }
}

/// One invitation per email submitted for provisioning.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Invitation {
    pub id: Uuid,
    pub manager_account_id: Uuid,
    pub sub_account_id: Option<Uuid>,
    pub email: String,
    pub access_level: String,
    pub status: String,
    pub invited_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvitation {
    pub manager_account_id: Uuid,
    pub sub_account_id: Option<Uuid>,
    pub email: String,
    pub access_level: AccessLevel,
    pub status: InvitationStatus,
}

/// Latest 30-day metrics of one leaf account under one manager.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct AccountMetricsCacheRow {
    pub manager_account_id: Uuid,
    pub customer_id: String,
    pub customer_name: String,
    pub currency_code: Option<String>,
    pub timezone: Option<String>,
    pub status: Option<String>,
    pub clicks: i64,
    pub impressions: i64,
    pub cost_micros: i64,
    /// Currency units, scale 2.
    pub cost: BigDecimal,
    pub conversions: BigDecimal,
    pub ctr: BigDecimal,
    pub avg_cpc: BigDecimal,
    pub metrics_date_from: NaiveDate,
    pub metrics_date_to: NaiveDate,
    pub last_updated_at: DateTime<Utc>,
}

/// Pre-aggregated totals per manager, as written by a metrics sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerMetricsTotals {
    pub manager_account_id: Uuid,
    pub total_clicks: i64,
    pub total_impressions: i64,
    pub total_cost: BigDecimal,
    pub total_conversions: BigDecimal,
    pub ctr: BigDecimal,
    pub avg_cpc: BigDecimal,
    pub account_count: i32,
    pub folder_count: i32,
    pub last_updated_at: DateTime<Utc>,
}

/// Budget columns of the manager row, as written by a budget refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerBudgetSummary {
    pub manager_account_id: Uuid,
    pub total_budget: BigDecimal,
    pub total_spent: BigDecimal,
    pub total_remaining: BigDecimal,
    pub percent_used: i32,
    pub accounts_with_budget: i32,
    pub last_updated_at: DateTime<Utc>,
}

/// Full manager cache row (metrics and budget halves).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ManagerMetricsCacheRow {
    pub manager_account_id: Uuid,
    pub total_clicks: i64,
    pub total_impressions: i64,
    pub total_cost: BigDecimal,
    pub total_conversions: BigDecimal,
    pub ctr: BigDecimal,
    pub avg_cpc: BigDecimal,
    pub account_count: i32,
    pub folder_count: i32,
    pub total_budget: Option<BigDecimal>,
    pub total_spent: Option<BigDecimal>,
    pub total_remaining: Option<BigDecimal>,
    pub percent_used: Option<i32>,
    pub accounts_with_budget: Option<i32>,
    pub last_updated_at: DateTime<Utc>,
}

impl ManagerMetricsCacheRow {
    /// Empty row for a manager that has never been synced.
    pub fn empty(manager_account_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            manager_account_id,
            total_clicks: 0,
            total_impressions: 0,
            total_cost: BigDecimal::from(0),
            total_conversions: BigDecimal::from(0),
            ctr: BigDecimal::from(0),
            avg_cpc: BigDecimal::from(0),
            account_count: 0,
            folder_count: 0,
            total_budget: None,
            total_spent: None,
            total_remaining: None,
            percent_used: None,
            accounts_with_budget: None,
            last_updated_at: now,
        }
    }

    pub fn apply_totals(&mut self, totals: &ManagerMetricsTotals) {
        self.total_clicks = totals.total_clicks;
        self.total_impressions = totals.total_impressions;
        self.total_cost = totals.total_cost.clone();
        self.total_conversions = totals.total_conversions.clone();
        self.ctr = totals.ctr.clone();
        self.avg_cpc = totals.avg_cpc.clone();
        self.account_count = totals.account_count;
        self.folder_count = totals.folder_count;
        self.last_updated_at = totals.last_updated_at;
    }

    pub fn apply_budget(&mut self, budget: &ManagerBudgetSummary) {
        self.total_budget = Some(budget.total_budget.clone());
        self.total_spent = Some(budget.total_spent.clone());
        self.total_remaining = Some(budget.total_remaining.clone());
        self.percent_used = Some(budget.percent_used);
        self.accounts_with_budget = Some(budget.accounts_with_budget);
        self.last_updated_at = budget.last_updated_at;
    }
}

/// Persisted structure snapshot for one manager.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct StructureCacheEntry {
    pub manager_account_id: Uuid,
    pub folders: Value,
    pub accounts: Value,
    pub total_accounts: i32,
    pub total_folders: i32,
    /// SHA-256 of the serialized folders + accounts payload.
    pub checksum: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Operator-visible audit trail entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityAction {
    CreateManager,
    DeleteManager,
    ConnectGoogle,
    DisconnectGoogle,
    CreateAccount,
    Transfer,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::CreateManager => "create_mss",
            ActivityAction::DeleteManager => "delete_mss",
            ActivityAction::ConnectGoogle => "connect_google",
            ActivityAction::DisconnectGoogle => "disconnect_google",
            ActivityAction::CreateAccount => "create_account",
            ActivityAction::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub action: ActivityAction,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<Value>,
}

impl NewActivity {
    /// Activity about a manager account.
    pub fn manager(action: ActivityAction, manager: &ManagerAccount, details: Value) -> Self {
        Self {
            action,
            entity_type: Some("mss_account".to_string()),
            entity_id: Some(manager.id.to_string()),
            entity_name: Some(manager.name.clone()),
            details: Some(details),
        }
    }
}

// ============ API Views ============

/// Manager account as returned to callers (secrets stripped).
#[derive(Debug, Clone, Serialize)]
pub struct ManagerAccountView {
    #[serde(flatten)]
    pub account: ManagerAccount,
    pub connected: bool,
}

impl From<ManagerAccount> for ManagerAccountView {
    fn from(account: ManagerAccount) -> Self {
        let connected = account.is_connected();
        Self { account, connected }
    }
}
