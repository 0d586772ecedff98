use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Body of a `googleAds:search` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

/// One page of search results.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<GoogleAdsRow>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A result row. Only the resources this service selects are modelled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAdsRow {
    #[serde(default)]
    pub customer_client: Option<CustomerClient>,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub account_budget: Option<AccountBudget>,
}

/// `customer_client` resource: a node of the manager hierarchy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerClient {
    #[serde(default, deserialize_with = "de_string_lenient")]
    pub id: String,
    #[serde(default)]
    pub descriptive_name: Option<String>,
    #[serde(default)]
    pub currency_code: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub manager: bool,
    #[serde(default)]
    pub test_account: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_i64_lenient")]
    pub level: i64,
}

/// Metric columns. The API encodes int64 values as JSON strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    #[serde(default, deserialize_with = "de_i64_lenient")]
    pub clicks: i64,
    #[serde(default, deserialize_with = "de_i64_lenient")]
    pub impressions: i64,
    #[serde(default, deserialize_with = "de_i64_lenient")]
    pub cost_micros: i64,
    #[serde(default, deserialize_with = "de_f64_lenient")]
    pub conversions: f64,
}

impl Metrics {
    /// Adds another row's metrics into this one.
    pub fn accumulate(&mut self, other: &Metrics) {
        self.clicks += other.clicks;
        self.impressions += other.impressions;
        self.cost_micros += other.cost_micros;
        self.conversions += other.conversions;
    }
}

/// `account_budget` resource (approved budgets only are queried).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBudget {
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pub approved_spending_limit_micros: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pub adjusted_spending_limit_micros: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pub amount_micros: Option<i64>,
}

impl AccountBudget {
    /// Spending limit in micros: approved limit first, adjusted limit as fallback.
    pub fn limit_micros(&self) -> i64 {
        self.approved_spending_limit_micros
            .filter(|v| *v > 0)
            .or(self.adjusted_spending_limit_micros)
            .unwrap_or(0)
    }
}

/// OAuth token endpoint response (both grant types).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Tokens obtained from an authorization-code exchange.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: Option<String>,
}

/// Response of `createCustomerClient`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCustomerClientResponse {
    #[serde(default)]
    pub resource_name: Option<String>,
}

impl CreateCustomerClientResponse {
    /// Customer id is the last path segment of `customers/{mcc}/customerClients/{id}`
    /// (or `customers/{id}`).
    pub fn customer_id(&self) -> Option<String> {
        self.resource_name
            .as_deref()
            .and_then(|name| name.rsplit('/').next())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
    }
}

/// Permission tier granted to an invited collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Admin,
    Standard,
    Read,
}

impl AccessLevel {
    /// Role name expected by `customerUserAccessInvitations:mutate`.
    pub fn remote_role(&self) -> &'static str {
        match self {
            AccessLevel::Admin => "ADMIN",
            AccessLevel::Standard => "STANDARD",
            AccessLevel::Read => "READ_ONLY",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Admin => "admin",
            AccessLevel::Standard => "standard",
            AccessLevel::Read => "read",
        }
    }
}

/// Leaf or folder account as presented to callers and stored in structure snapshots.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientAccount {
    pub id: String,
    pub name: String,
    pub currency: Option<String>,
    pub timezone: Option<String>,
    pub is_manager: bool,
    pub is_test: bool,
    pub status: Option<String>,
    pub level: i64,
    /// Set when this service provisioned the account.
    #[serde(default)]
    pub created_by_us: bool,
}

impl From<&CustomerClient> for ClientAccount {
    fn from(client: &CustomerClient) -> Self {
        Self {
            id: client.id.clone(),
            name: client
                .descriptive_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Account {}", client.id)),
            currency: client.currency_code.clone(),
            timezone: client.time_zone.clone(),
            is_manager: client.manager,
            is_test: client.test_account,
            status: client.status.clone(),
            level: client.level,
            created_by_us: false,
        }
    }
}

/// Strips the dashes operators type into customer ids (`123-456-7890`).
pub fn normalize_customer_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-' && !c.is_whitespace()).collect()
}

/// Pulls a readable message out of a Google Ads error body.
///
/// Prefers the per-error messages under `error.details[].errors[]`, then
/// `error.message`; returns `None` when the body is not JSON.
pub fn remote_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let error = parsed.get("error")?;

    if let Some(details) = error.get("details").and_then(|d| d.as_array()) {
        for detail in details {
            let messages: Vec<&str> = detail
                .get("errors")
                .and_then(|e| e.as_array())
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            if !messages.is_empty() {
                return Some(messages.join("; "));
            }
        }
    }

    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_i64(&value).unwrap_or(0))
}

fn de_opt_i64_lenient<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_i64(&value))
}

fn de_f64_lenient<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

fn de_string_lenient<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}
