use crate::backoff::{with_backoff, RetryPolicy, Sleeper, TokioSleeper};
use crate::config::Config;
use crate::errors::AppError;
use crate::google_ads_models::{
    normalize_customer_id, remote_error_message, CreateCustomerClientResponse, GoogleAdsRow,
    SearchRequest, SearchResponse, TokenResponse, TokenSet, UserInfo,
};
use crate::models::{ManagerAccount, OAuthClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Safety cap on pages followed by `query_all_pages`.
pub const MAX_PAGES: usize = 20;

/// Authenticated context for calls made on behalf of one manager account.
#[derive(Debug, Clone)]
pub struct AdsSession {
    pub access_token: String,
    pub developer_token: String,
    /// Manager (MCC) id sent as `login-customer-id`, without dashes.
    pub login_customer_id: String,
}

/// Client for the Google Ads REST API and the OAuth endpoints it depends on.
#[derive(Clone)]
pub struct GoogleAdsClient {
    client: reqwest::Client,
    api_base_url: String,
    token_url: String,
    userinfo_url: String,
    retry_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl GoogleAdsClient {
    /// Creates a client from the service configuration.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Self::with_endpoints(
            config.ads_api_base_url.clone(),
            config.oauth_token_url.clone(),
            config.oauth_userinfo_url.clone(),
        )
    }

    /// Creates a client against explicit endpoints.
    ///
    /// # Arguments
    ///
    /// * `api_base_url` - Versioned API base, e.g. `https://googleads.googleapis.com/v22`.
    /// * `token_url` - OAuth token endpoint.
    /// * `userinfo_url` - OAuth userinfo endpoint.
    pub fn with_endpoints(
        api_base_url: String,
        token_url: String,
        userinfo_url: String,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Google Ads client: {}", e))
            })?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token_url,
            userinfo_url,
            retry_policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sleeper shared with callers that pace their own request loops.
    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Exchanges a refresh token for a short-lived access token.
    ///
    /// # Returns
    ///
    /// * `Result<String, AppError>` - The access token, or `AuthError` carrying
    ///   the provider's `error_description` when the grant is rejected.
    pub async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<String, AppError> {
        tracing::debug!("Exchanging refresh token at {}", self.token_url);
        let tokens = self
            .token_request(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        tokens
            .access_token
            .ok_or_else(|| AppError::AuthError("token response missing access_token".to_string()))
    }

    /// Exchanges an authorization code from the consent redirect for tokens.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, AppError> {
        tracing::info!("Exchanging authorization code for tokens");
        let tokens = self
            .token_request(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .await?;

        let access_token = tokens
            .access_token
            .ok_or_else(|| AppError::AuthError("token response missing access_token".to_string()))?;

        Ok(TokenSet {
            access_token,
            refresh_token: tokens.refresh_token,
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AppError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("OAuth request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let tokens: TokenResponse = serde_json::from_str(&text).map_err(|_| {
            AppError::ExternalApiError(format!(
                "OAuth endpoint returned {} with unparseable body",
                status
            ))
        })?;

        if let Some(error) = tokens.error.as_deref() {
            let description = tokens
                .error_description
                .clone()
                .unwrap_or_else(|| error.to_string());
            tracing::warn!("OAuth token exchange rejected: {}", description);
            return Err(AppError::AuthError(description));
        }

        Ok(tokens)
    }

    /// Reads the email of the Google user that granted consent.
    pub async fn fetch_user_email(&self, access_token: &str) -> Result<Option<String>, AppError> {
        let response = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Userinfo request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::remote(status, &text));
        }

        let info: UserInfo = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse userinfo response: {}", e))
        })?;
        Ok(info.email)
    }

    /// Obtains an access token for `manager` and bundles it with its headers.
    ///
    /// Fails with `NotConnected` when the manager has no refresh token.
    pub async fn open_session(
        &self,
        manager: &ManagerAccount,
        defaults: &OAuthClient,
    ) -> Result<AdsSession, AppError> {
        let refresh_token = manager.google_refresh_token.as_deref().ok_or_else(|| {
            AppError::NotConnected(format!(
                "Google Ads is not connected for manager account {}",
                manager.name
            ))
        })?;

        let oauth = manager.oauth_client(defaults);
        let access_token = self
            .exchange_refresh_token(refresh_token, &oauth.client_id, &oauth.client_secret)
            .await?;

        Ok(AdsSession {
            access_token,
            developer_token: manager.developer_token.clone(),
            login_customer_id: manager.customer_id(),
        })
    }

    /// Runs one page of a GAQL query against `customer_id`.
    pub async fn query(
        &self,
        session: &AdsSession,
        customer_id: &str,
        gaql: &str,
        page_token: Option<&str>,
    ) -> Result<SearchResponse, AppError> {
        self.search(session, customer_id, gaql, page_token, None, &self.retry_policy)
            .await
    }

    /// Runs a GAQL query, following `nextPageToken` up to `MAX_PAGES` pages.
    pub async fn query_all_pages(
        &self,
        session: &AdsSession,
        customer_id: &str,
        gaql: &str,
        page_size: Option<u32>,
    ) -> Result<Vec<GoogleAdsRow>, AppError> {
        self.query_all_pages_with_policy(session, customer_id, gaql, page_size, &self.retry_policy)
            .await
    }

    /// `query_all_pages` with an explicit retry budget.
    pub async fn query_all_pages_with_policy(
        &self,
        session: &AdsSession,
        customer_id: &str,
        gaql: &str,
        page_size: Option<u32>,
        policy: &RetryPolicy,
    ) -> Result<Vec<GoogleAdsRow>, AppError> {
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        for page in 0..MAX_PAGES {
            let response = self
                .search(
                    session,
                    customer_id,
                    gaql,
                    page_token.as_deref(),
                    page_size,
                    policy,
                )
                .await?;
            rows.extend(response.results);

            match response.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(rows),
            }

            if page + 1 == MAX_PAGES {
                tracing::warn!(
                    "Stopped paging customer {} after {} pages ({} rows)",
                    customer_id,
                    MAX_PAGES,
                    rows.len()
                );
            }
        }

        Ok(rows)
    }

    async fn search(
        &self,
        session: &AdsSession,
        customer_id: &str,
        gaql: &str,
        page_token: Option<&str>,
        page_size: Option<u32>,
        policy: &RetryPolicy,
    ) -> Result<SearchResponse, AppError> {
        let customer_id = normalize_customer_id(customer_id);
        let url = format!(
            "{}/customers/{}/googleAds:search",
            self.api_base_url, customer_id
        );
        let body = SearchRequest {
            query: gaql,
            page_token,
            page_size,
        };

        let response = with_backoff(policy, self.sleeper.as_ref(), || {
            self.client
                .post(&url)
                .bearer_auth(&session.access_token)
                .header("developer-token", &session.developer_token)
                .header("login-customer-id", &session.login_customer_id)
                .json(&body)
                .send()
        })
        .await
        .map_err(|e| AppError::ExternalApiError(format!("Google Ads request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Search on {} returned {}", customer_id, status);
            return Err(AppError::remote(status, &text));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse search response: {}", e))
        })
    }

    /// Creates a sub-account under the session's manager.
    ///
    /// # Returns
    ///
    /// * `Result<String, AppError>` - The new customer id, taken from the
    ///   response's resource name.
    pub async fn create_customer_client(
        &self,
        session: &AdsSession,
        account_name: &str,
        currency_code: &str,
        time_zone: &str,
    ) -> Result<String, AppError> {
        let mcc_id = &session.login_customer_id;
        let url = format!(
            "{}/customers/{}:createCustomerClient",
            self.api_base_url, mcc_id
        );
        tracing::info!(
            "Creating account {} under MCC {} ({}, {})",
            account_name,
            mcc_id,
            currency_code,
            time_zone
        );

        let body = json!({
            "customerId": mcc_id,
            "customerClient": {
                "descriptiveName": account_name,
                "currencyCode": currency_code,
                "timeZone": time_zone,
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.access_token)
            .header("developer-token", &session.developer_token)
            .header("login-customer-id", mcc_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create account: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = remote_error_message(&text).unwrap_or(text);
            tracing::error!("Account creation failed {}: {}", status, message);
            return Err(AppError::remote(status.as_u16(), &message));
        }

        let created: CreateCustomerClientResponse = serde_json::from_str(&text).map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse account creation response: {}", e))
        })?;

        let customer_id = created.customer_id().ok_or_else(|| {
            AppError::ExternalApiError(
                "Account creation response missing resourceName".to_string(),
            )
        })?;

        tracing::info!("✓ Account created: {}", customer_id);
        Ok(customer_id)
    }

    /// Invites `email` to `customer_id` with the given remote role.
    pub async fn create_user_invitation(
        &self,
        session: &AdsSession,
        customer_id: &str,
        email: &str,
        access_role: &str,
    ) -> Result<(), AppError> {
        let url = format!(
            "{}/customers/{}/customerUserAccessInvitations:mutate",
            self.api_base_url,
            normalize_customer_id(customer_id)
        );
        tracing::info!("Sending invitation to {} ({})", email, access_role);

        let body = json!({
            "operation": {
                "create": {
                    "emailAddress": email,
                    "accessRole": access_role,
                }
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.access_token)
            .header("developer-token", &session.developer_token)
            .header("login-customer-id", &session.login_customer_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Failed to send invitation: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!("Invitation for {} failed with {}", email, status);
            return Err(AppError::remote(status, &text));
        }

        tracing::info!("✓ Invitation sent to {}", email);
        Ok(())
    }
}
