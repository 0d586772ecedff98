use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::google_ads_client::GoogleAdsClient;
use crate::models::{ActivityAction, ManagerAccount, ManagerConnection, NewActivity, OAuthClient};
use crate::store::{record_activity, Store};

/// OAuth scope granting access to the advertising API.
pub const ADS_SCOPE: &str = "https://www.googleapis.com/auth/adwords";

/// Query parameters of the consent redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Builds the consent URL for `client_id`. `state` carries the manager id.
pub fn build_authorize_url(
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> Result<String, AppError> {
    let url = Url::parse_with_params(
        authorize_endpoint,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", ADS_SCOPE),
            ("access_type", "offline"),
            ("prompt", "select_account consent"),
            ("state", state),
        ],
    )
    .map_err(|e| AppError::InternalError(format!("Invalid OAuth authorize URL: {}", e)))?;
    Ok(url.into())
}

/// Connects and disconnects manager accounts.
pub struct OAuthFlow {
    store: Arc<dyn Store>,
    client: GoogleAdsClient,
    oauth_defaults: OAuthClient,
    authorize_endpoint: String,
    redirect_uri: String,
    app_url: String,
}

impl OAuthFlow {
    pub fn new(store: Arc<dyn Store>, client: GoogleAdsClient, config: &Config) -> Self {
        Self {
            store,
            client,
            oauth_defaults: config.oauth_defaults(),
            authorize_endpoint: config.oauth_authorize_url.clone(),
            redirect_uri: config.oauth_redirect_uri.clone(),
            app_url: config.app_url.clone(),
        }
    }

    async fn manager(&self, id: Uuid) -> Result<ManagerAccount, AppError> {
        self.store
            .get_manager(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", id)))
    }

    /// Consent URL for a manager, using its own OAuth client when it has one.
    pub async fn authorization_url(&self, manager_id: Uuid) -> Result<String, AppError> {
        let manager = self.manager(manager_id).await?;
        let oauth = manager.oauth_client(&self.oauth_defaults);
        build_authorize_url(
            &self.authorize_endpoint,
            &oauth.client_id,
            &self.redirect_uri,
            &manager.id.to_string(),
        )
    }

    /// Exchanges the consent code and stores the refresh token on the manager.
    pub async fn complete(&self, code: &str, state: &str) -> Result<ManagerAccount, AppError> {
        let manager_id = Uuid::parse_str(state.trim())
            .map_err(|_| AppError::ValidationError(format!("Invalid state: {}", state)))?;
        let manager = self.manager(manager_id).await?;
        let oauth = manager.oauth_client(&self.oauth_defaults);

        let tokens = self
            .client
            .exchange_authorization_code(code, &oauth.client_id, &oauth.client_secret, &self.redirect_uri)
            .await?;
        let refresh_token = tokens.refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            AppError::AuthError("No refresh token returned; consent must be granted again".to_string())
        })?;

        let email = match self.client.fetch_user_email(&tokens.access_token).await {
            Ok(email) => email.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Could not read connected user email: {}", e);
                String::new()
            }
        };

        let connected = self
            .store
            .connect_manager(
                manager.id,
                &ManagerConnection {
                    google_client_id: None,
                    google_client_secret: None,
                    refresh_token,
                    connected_email: email.clone(),
                },
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", manager.id)))?;

        tracing::info!("✓ Google Ads connected for {} as {}", connected.name, email);
        record_activity(
            self.store.as_ref(),
            NewActivity::manager(
                ActivityAction::ConnectGoogle,
                &connected,
                json!({ "email": email, "method": "oauth" }),
            ),
        )
        .await;
        Ok(connected)
    }

    /// Handles the consent redirect and returns where to send the browser.
    pub async fn callback_redirect(&self, params: &CallbackParams) -> String {
        if let Some(error) = params.error.as_deref() {
            tracing::warn!("OAuth consent returned error: {}", error);
            return self.app_redirect("error", error);
        }

        let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
            return self.app_redirect("error", "missing_params");
        };

        match self.complete(code, state).await {
            Ok(_) => self.app_redirect("google_connected", "true"),
            Err(e) => {
                tracing::error!("OAuth callback failed: {}", e);
                self.app_redirect("error", &e.to_string())
            }
        }
    }

    fn app_redirect(&self, key: &str, value: &str) -> String {
        let base = format!("{}/accounts", self.app_url.trim_end_matches('/'));
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair(key, value);
                url.into()
            }
            Err(_) => base,
        }
    }

    /// Stores credentials entered by an operator.
    pub async fn connect_manual(
        &self,
        manager_id: Uuid,
        connection: &ManagerConnection,
    ) -> Result<ManagerAccount, AppError> {
        if connection.refresh_token.trim().is_empty() {
            return Err(AppError::ValidationError("refresh_token is required".to_string()));
        }
        if connection.connected_email.trim().is_empty() {
            return Err(AppError::ValidationError(
                "connected_email is required".to_string(),
            ));
        }

        let connected = self
            .store
            .connect_manager(manager_id, connection)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", manager_id)))?;

        record_activity(
            self.store.as_ref(),
            NewActivity::manager(
                ActivityAction::ConnectGoogle,
                &connected,
                json!({ "email": connection.connected_email, "method": "manual" }),
            ),
        )
        .await;
        Ok(connected)
    }

    /// Clears the stored token and connection details.
    pub async fn disconnect(&self, manager_id: Uuid) -> Result<ManagerAccount, AppError> {
        let manager = self
            .store
            .disconnect_manager(manager_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", manager_id)))?;

        tracing::info!("Google Ads disconnected for {}", manager.name);
        record_activity(
            self.store.as_ref(),
            NewActivity::manager(ActivityAction::DisconnectGoogle, &manager, json!({})),
        )
        .await;
        Ok(manager)
    }
}
