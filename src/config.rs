use crate::models::OAuthClient;
use serde::Deserialize;

pub const DEFAULT_ADS_API_BASE_URL: &str = "https://googleads.googleapis.com/v22";
pub const DEFAULT_OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_OAUTH_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_OAUTH_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Versioned Google Ads REST base, e.g. `https://googleads.googleapis.com/v22`.
    pub ads_api_base_url: String,
    pub oauth_token_url: String,
    pub oauth_authorize_url: String,
    pub oauth_userinfo_url: String,
    /// OAuth client used when a manager account has no override.
    pub default_client_id: String,
    pub default_client_secret: String,
    /// Where the provider sends the user back after consent.
    pub oauth_redirect_uri: String,
    /// Front-end URL the OAuth callback redirects to.
    pub app_url: String,
    pub structure_cache_ttl_secs: u64,
    pub sync_interval_secs: u64,
    pub sync_schedule_enabled: bool,
}

/// Reads a required variable, rejecting blank values.
fn required(name: &str) -> anyhow::Result<String> {
    let value = std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))?;
    if value.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    Ok(value)
}

fn http_url(name: &str, value: String) -> anyhow::Result<String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn optional_url(name: &str, default: &str) -> anyhow::Result<String> {
    let value = std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    http_url(name, value)
}

fn optional_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a positive integer", name)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            ads_api_base_url: optional_url("GOOGLE_ADS_API_BASE_URL", DEFAULT_ADS_API_BASE_URL)?,
            oauth_token_url: optional_url("GOOGLE_OAUTH_TOKEN_URL", DEFAULT_OAUTH_TOKEN_URL)?,
            oauth_authorize_url: optional_url(
                "GOOGLE_OAUTH_AUTHORIZE_URL",
                DEFAULT_OAUTH_AUTHORIZE_URL,
            )?,
            oauth_userinfo_url: optional_url(
                "GOOGLE_OAUTH_USERINFO_URL",
                DEFAULT_OAUTH_USERINFO_URL,
            )?,
            default_client_id: required("GOOGLE_CLIENT_ID")?,
            default_client_secret: required("GOOGLE_CLIENT_SECRET")?,
            oauth_redirect_uri: required("GOOGLE_OAUTH_REDIRECT_URI")
                .and_then(|url| http_url("GOOGLE_OAUTH_REDIRECT_URI", url))?,
            app_url: optional_url("APP_URL", "http://localhost:8080")?,
            structure_cache_ttl_secs: optional_u64("STRUCTURE_CACHE_TTL_SECS", 3600)?,
            sync_interval_secs: optional_u64("SYNC_INTERVAL_SECS", 30 * 60)?,
            sync_schedule_enabled: std::env::var("SYNC_SCHEDULE_ENABLED")
                .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
        };

        if config.sync_interval_secs == 0 {
            anyhow::bail!("SYNC_INTERVAL_SECS must be greater than zero");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Google Ads API base: {}", config.ads_api_base_url);
        tracing::debug!("OAuth redirect URI: {}", config.oauth_redirect_uri);
        tracing::debug!(
            "Structure cache TTL: {}s, sync interval: {}s (scheduled: {})",
            config.structure_cache_ttl_secs,
            config.sync_interval_secs,
            config.sync_schedule_enabled
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// OAuth client used for managers without their own credentials.
    pub fn oauth_defaults(&self) -> OAuthClient {
        OAuthClient {
            client_id: self.default_client_id.clone(),
            client_secret: self.default_client_secret.clone(),
        }
    }
}
