use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::google_ads_client::{AdsSession, GoogleAdsClient};
use crate::google_ads_models::AccessLevel;
use crate::models::{
    ActivityAction, Invitation, InvitationStatus, ManagerAccount, NewActivity, NewInvitation,
    NewSubAccount, OAuthClient, SubAccount,
};
use crate::store::{record_activity, Store};

/// Largest batch accepted by one provisioning request.
pub const MAX_EMAILS_PER_BATCH: usize = 20;

/// Timezone used when a display name is not recognised.
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$";
const CURRENCY_PATTERN: &str = r"^[A-Z]{3}$";

const TIMEZONES: &[(&str, &str)] = &[
    ("Kyiv", "Europe/Kiev"),
    ("Warsaw", "Europe/Warsaw"),
    ("New York", "America/New_York"),
    ("Los Angeles", "America/Los_Angeles"),
    ("London", "Europe/London"),
    ("Berlin", "Europe/Berlin"),
    ("Paris", "Europe/Paris"),
    ("Moscow", "Europe/Moscow"),
    ("Tokyo", "Asia/Tokyo"),
    ("Sydney", "Australia/Sydney"),
    ("Dubai", "Asia/Dubai"),
    ("Singapore", "Asia/Singapore"),
    ("Hong Kong", "Asia/Hong_Kong"),
    ("Istanbul", "Europe/Istanbul"),
    ("Toronto", "America/Toronto"),
];

/// Maps a timezone display name to its IANA id.
///
/// Values that already look like IANA ids pass through; anything else
/// falls back to `DEFAULT_TIMEZONE`.
pub fn resolve_timezone(name: &str) -> String {
    let name = name.trim();
    if let Some((_, iana)) = TIMEZONES
        .iter()
        .find(|(display, _)| display.eq_ignore_ascii_case(name))
    {
        return iana.to_string();
    }
    if name.contains('/') || name == "UTC" {
        return name.to_string();
    }
    DEFAULT_TIMEZONE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailInvitation {
    pub email: String,
    pub access_level: AccessLevel,
}

/// Batch of sub-accounts to create under one manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub currency: String,
    pub timezone: String,
    pub emails: Vec<EmailInvitation>,
}

impl ProvisionRequest {
    /// Checks batch size, email syntax and currency code.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.currency.trim().is_empty() || self.timezone.trim().is_empty() {
            return Err(AppError::ValidationError(
                "currency and timezone are required".to_string(),
            ));
        }
        if self.emails.is_empty() {
            return Err(AppError::ValidationError(
                "At least one email is required".to_string(),
            ));
        }
        if self.emails.len() > MAX_EMAILS_PER_BATCH {
            return Err(AppError::ValidationError(format!(
                "Maximum {} emails allowed",
                MAX_EMAILS_PER_BATCH
            )));
        }

        let currency_re = Regex::new(CURRENCY_PATTERN)
            .map_err(|e| AppError::InternalError(format!("Invalid currency pattern: {}", e)))?;
        if !currency_re.is_match(&self.currency.trim().to_uppercase()) {
            return Err(AppError::ValidationError(format!(
                "Invalid currency code: {}",
                self.currency
            )));
        }

        let email_re = Regex::new(EMAIL_PATTERN)
            .map_err(|e| AppError::InternalError(format!("Invalid email pattern: {}", e)))?;
        if let Some(bad) = self
            .emails
            .iter()
            .find(|e| !email_re.is_match(e.email.trim()))
        {
            return Err(AppError::ValidationError(format!(
                "Invalid email: {}",
                bad.email
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionError {
    pub email: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionSummary {
    pub manager: String,
    pub currency: String,
    pub timezone: String,
    pub total_requested: usize,
    pub accounts_created: usize,
    pub invitations_sent: usize,
    pub errors_count: usize,
}

/// Outcome of a provisioning batch. `success` is true when at least one
/// account was created.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionResult {
    pub success: bool,
    pub message: String,
    pub summary: ProvisionSummary,
    pub accounts: Vec<SubAccount>,
    pub invitations: Vec<Invitation>,
    pub errors: Vec<ProvisionError>,
}

impl ProvisionResult {
    pub fn accounts_created(&self) -> usize {
        self.summary.accounts_created
    }

    pub fn invitations_sent(&self) -> usize {
        self.summary.invitations_sent
    }
}

/// Generates batch-unique display names of the form `local-part_millis`.
///
/// Timestamps are forced to increase within one batch, so two emails sharing
/// a local part still get distinct names.
#[derive(Debug, Default)]
pub struct AccountNamer {
    last_millis: i64,
}

impl AccountNamer {
    pub fn next_name(&mut self, email: &str) -> String {
        self.name_at(email, Utc::now().timestamp_millis())
    }

    fn name_at(&mut self, email: &str, now_millis: i64) -> String {
        let millis = now_millis.max(self.last_millis + 1);
        self.last_millis = millis;
        let local = email.split('@').next().unwrap_or(email).trim();
        format!("{}_{}", local, millis)
    }
}

/// Creates sub-accounts and access invitations under a manager, one email at a time.
pub struct ProvisioningService {
    store: Arc<dyn Store>,
    client: GoogleAdsClient,
    oauth_defaults: OAuthClient,
}

impl ProvisioningService {
    pub fn new(store: Arc<dyn Store>, client: GoogleAdsClient, oauth_defaults: OAuthClient) -> Self {
        Self {
            store,
            client,
            oauth_defaults,
        }
    }

    /// Runs a provisioning batch.
    ///
    /// # Arguments
    ///
    /// * `manager_id` - Manager account to create the accounts under.
    /// * `request` - Currency, timezone and the emails to invite.
    ///
    /// # Returns
    ///
    /// * `Result<ProvisionResult, AppError>` - Per-email failures are listed in
    ///   `errors`; the call itself fails only on invalid input, an unknown or
    ///   unconnected manager, or a rejected token exchange.
    pub async fn provision(
        &self,
        manager_id: Uuid,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResult, AppError> {
        request.validate()?;

        let manager = self
            .store
            .get_manager(manager_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Manager account {}", manager_id)))?;
        if !manager.is_connected() {
            return Err(AppError::NotConnected(format!(
                "Google Ads is not connected for {}. Connect it first.",
                manager.name
            )));
        }

        let session = self
            .client
            .open_session(&manager, &self.oauth_defaults)
            .await?;
        let currency = request.currency.trim().to_uppercase();
        let timezone = resolve_timezone(&request.timezone);

        tracing::info!(
            "Provisioning {} account(s) under {} ({}, {})",
            request.emails.len(),
            manager.name,
            currency,
            timezone
        );

        let mut namer = AccountNamer::default();
        let mut accounts = Vec::new();
        let mut invitations = Vec::new();
        let mut invitations_sent = 0;
        let mut errors = Vec::new();

        for entry in &request.emails {
            let email = entry.email.trim();
            let name = namer.next_name(email);
            match self
                .provision_one(&session, &manager, email, entry.access_level, &name, &currency, &timezone)
                .await
            {
                Ok(provisioned) => {
                    if provisioned.invitation_sent {
                        invitations_sent += 1;
                    }
                    accounts.push(provisioned.account);
                    invitations.extend(provisioned.invitation);
                }
                Err(e) => {
                    tracing::error!("❌ Provisioning failed for {}: {}", email, e);
                    errors.push(ProvisionError {
                        email: email.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let message = if errors.is_empty() {
            format!("Created {} account(s)", accounts.len())
        } else {
            format!(
                "Created {} of {} account(s)",
                accounts.len(),
                request.emails.len()
            )
        };

        if !accounts.is_empty() {
            record_activity(
                self.store.as_ref(),
                NewActivity::manager(
                    ActivityAction::CreateAccount,
                    &manager,
                    json!({
                        "accounts_created": accounts.len(),
                        "customer_ids": accounts.iter().map(|a| a.customer_id.clone()).collect::<Vec<_>>(),
                        "currency": currency,
                        "timezone": timezone,
                    }),
                ),
            )
            .await;
        }

        Ok(ProvisionResult {
            success: !accounts.is_empty(),
            message,
            summary: ProvisionSummary {
                manager: manager.name.clone(),
                currency,
                timezone,
                total_requested: request.emails.len(),
                accounts_created: accounts.len(),
                invitations_sent,
                errors_count: errors.len(),
            },
            accounts,
            invitations,
            errors,
        })
    }

    /// Creates, records and invites one account.
    ///
    /// A failed invitation is recorded with status `failed` and is not an error.
    /// Neither is a failure to save the invitation row once the account exists.
    #[allow(clippy::too_many_arguments)]
    async fn provision_one(
        &self,
        session: &AdsSession,
        manager: &ManagerAccount,
        email: &str,
        access_level: AccessLevel,
        name: &str,
        currency: &str,
        timezone: &str,
    ) -> Result<Provisioned, AppError> {
        let customer_id = self
            .client
            .create_customer_client(session, name, currency, timezone)
            .await?;

        let account = self
            .store
            .insert_sub_account(&NewSubAccount {
                manager_account_id: manager.id,
                customer_id: customer_id.clone(),
                currency_code: currency.to_string(),
                timezone: timezone.to_string(),
            })
            .await
            .map_err(|e| {
                AppError::InternalError(format!(
                    "Account {} created remotely but not saved: {}",
                    customer_id, e
                ))
            })?;

        let status = match self
            .client
            .create_user_invitation(session, &customer_id, email, access_level.remote_role())
            .await
        {
            Ok(()) => InvitationStatus::Sent,
            Err(e) => {
                tracing::warn!("Invitation for {} on {} failed: {}", email, customer_id, e);
                InvitationStatus::Failed
            }
        };

        let invitation = match self
            .store
            .insert_invitation(&NewInvitation {
                manager_account_id: manager.id,
                sub_account_id: Some(account.id),
                email: email.to_string(),
                access_level,
                status,
            })
            .await
        {
            Ok(invitation) => Some(invitation),
            Err(e) => {
                tracing::warn!(
                    "Invitation for {} on {} not recorded: {}",
                    email,
                    customer_id,
                    e
                );
                None
            }
        };

        Ok(Provisioned {
            account,
            invitation,
            invitation_sent: status == InvitationStatus::Sent,
        })
    }
}

/// One successfully created account.
struct Provisioned {
    account: SubAccount,
    invitation: Option<Invitation>,
    invitation_sent: bool,
}
