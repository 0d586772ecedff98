//! In-process doubles used by unit and integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backoff::Sleeper;
use crate::errors::AppError;
use crate::models::{
    AccountMetricsCacheRow, ActivityEntry, Invitation, ManagerAccount, ManagerBudgetSummary,
    ManagerConnection, ManagerMetricsCacheRow, ManagerMetricsTotals, NewActivity, NewInvitation,
    NewManagerAccount, NewSubAccount, StructureCacheEntry, SubAccount,
};
use crate::store::Store;

/// Sleeper that returns immediately and remembers every requested wait.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.waits
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
    }
}

/// Builds a manager account row for tests.
pub fn manager_fixture(name: &str, mcc_number: &str, refresh_token: Option<&str>) -> ManagerAccount {
    ManagerAccount {
        id: Uuid::new_v4(),
        name: name.to_string(),
        mcc_number: mcc_number.to_string(),
        developer_token: "test-developer-token".to_string(),
        manager_email: format!("{}@example.com", name.to_lowercase()),
        google_client_id: None,
        google_client_secret: None,
        google_refresh_token: refresh_token.map(str::to_string),
        google_connected_email: refresh_token.map(|_| "ops@example.com".to_string()),
        google_connected_at: refresh_token.map(|_| Utc::now()),
        status: "active".to_string(),
        created_at: Utc::now(),
    }
}

#[derive(Default)]
struct MemoryState {
    managers: Vec<ManagerAccount>,
    sub_accounts: Vec<SubAccount>,
    invitations: Vec<Invitation>,
    account_metrics: Vec<AccountMetricsCacheRow>,
    manager_metrics: HashMap<Uuid, ManagerMetricsCacheRow>,
    structures: HashMap<Uuid, StructureCacheEntry>,
    activity: Vec<ActivityEntry>,
    rejected_customer_ids: HashSet<String>,
    rejected_invitation_emails: HashSet<String>,
}

/// `Store` kept in memory, with the same ordering and cascade rules as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_manager(&self, manager: ManagerAccount) {
        self.state.write().await.managers.push(manager);
    }

    pub async fn seed_account_metrics(&self, row: AccountMetricsCacheRow) {
        self.state.write().await.account_metrics.push(row);
    }

    /// Makes `insert_sub_account` fail for this external id.
    pub async fn reject_sub_account(&self, customer_id: &str) {
        self.state
            .write()
            .await
            .rejected_customer_ids
            .insert(customer_id.to_string());
    }

    pub async fn reject_invitation(&self, email: &str) {
        self.state
            .write()
            .await
            .rejected_invitation_emails
            .insert(email.to_string());
    }

    pub async fn activity_actions(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .activity
            .iter()
            .map(|a| a.action.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_managers(&self) -> Result<Vec<ManagerAccount>, AppError> {
        let mut managers = self.state.read().await.managers.clone();
        managers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(managers)
    }

    async fn get_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .managers
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn create_manager(&self, new: &NewManagerAccount) -> Result<ManagerAccount, AppError> {
        let manager = ManagerAccount {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            mcc_number: new.mcc_number.clone(),
            developer_token: new.developer_token.clone(),
            manager_email: new.manager_email.clone(),
            google_client_id: None,
            google_client_secret: None,
            google_refresh_token: None,
            google_connected_email: None,
            google_connected_at: None,
            status: "active".to_string(),
            created_at: Utc::now(),
        };
        self.state.write().await.managers.push(manager.clone());
        Ok(manager)
    }

    async fn delete_manager(&self, id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        let before = state.managers.len();
        state.managers.retain(|m| m.id != id);
        if state.managers.len() == before {
            return Ok(false);
        }
        state.sub_accounts.retain(|s| s.manager_account_id != id);
        state.invitations.retain(|i| i.manager_account_id != id);
        state.account_metrics.retain(|r| r.manager_account_id != id);
        state.manager_metrics.remove(&id);
        state.structures.remove(&id);
        Ok(true)
    }

    async fn connect_manager(
        &self,
        id: Uuid,
        connection: &ManagerConnection,
    ) -> Result<Option<ManagerAccount>, AppError> {
        let mut state = self.state.write().await;
        let Some(manager) = state.managers.iter_mut().find(|m| m.id == id) else {
            return Ok(None);
        };
        if connection.google_client_id.is_some() {
            manager.google_client_id = connection.google_client_id.clone();
        }
        if connection.google_client_secret.is_some() {
            manager.google_client_secret = connection.google_client_secret.clone();
        }
        manager.google_refresh_token = Some(connection.refresh_token.clone());
        manager.google_connected_email = Some(connection.connected_email.clone());
        manager.google_connected_at = Some(Utc::now());
        Ok(Some(manager.clone()))
    }

    async fn disconnect_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError> {
        let mut state = self.state.write().await;
        let Some(manager) = state.managers.iter_mut().find(|m| m.id == id) else {
            return Ok(None);
        };
        manager.google_refresh_token = None;
        manager.google_connected_email = None;
        manager.google_connected_at = None;
        Ok(Some(manager.clone()))
    }

    async fn list_connected_managers(
        &self,
        scope: Option<Uuid>,
    ) -> Result<Vec<ManagerAccount>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .managers
            .iter()
            .filter(|m| m.google_refresh_token.is_some())
            .filter(|m| scope.map(|id| id == m.id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn insert_sub_account(&self, new: &NewSubAccount) -> Result<SubAccount, AppError> {
        let mut state = self.state.write().await;
        if state.rejected_customer_ids.contains(&new.customer_id) {
            return Err(AppError::InternalError(format!(
                "insert rejected for {}",
                new.customer_id
            )));
        }
        let row = SubAccount {
            id: Uuid::new_v4(),
            manager_account_id: new.manager_account_id,
            customer_id: new.customer_id.clone(),
            currency_code: new.currency_code.clone(),
            timezone: new.timezone.clone(),
            status: "active".to_string(),
            created_at: Utc::now(),
        };
        state.sub_accounts.push(row.clone());
        Ok(row)
    }

    async fn list_sub_accounts(&self, manager_id: Uuid) -> Result<Vec<SubAccount>, AppError> {
        let mut rows: Vec<SubAccount> = self
            .state
            .read()
            .await
            .sub_accounts
            .iter()
            .filter(|s| s.manager_account_id == manager_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn transfer_sub_accounts(
        &self,
        ids: &[Uuid],
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let mut moved = 0;
        for row in state
            .sub_accounts
            .iter_mut()
            .filter(|s| s.manager_account_id == from && ids.contains(&s.id))
        {
            row.manager_account_id = to;
            moved += 1;
        }
        Ok(moved)
    }

    async fn insert_invitation(&self, new: &NewInvitation) -> Result<Invitation, AppError> {
        let mut state = self.state.write().await;
        if state.rejected_invitation_emails.contains(&new.email) {
            return Err(AppError::InternalError(format!(
                "insert rejected for {}",
                new.email
            )));
        }
        let row = Invitation {
            id: Uuid::new_v4(),
            manager_account_id: new.manager_account_id,
            sub_account_id: new.sub_account_id,
            email: new.email.clone(),
            access_level: new.access_level.as_str().to_string(),
            status: new.status.as_str().to_string(),
            invited_at: Utc::now(),
        };
        state.invitations.push(row.clone());
        Ok(row)
    }

    async fn list_invitations(&self, manager_id: Uuid) -> Result<Vec<Invitation>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .invitations
            .iter()
            .filter(|i| i.manager_account_id == manager_id)
            .cloned()
            .collect())
    }

    async fn replace_account_metrics(
        &self,
        manager_id: Uuid,
        rows: &[AccountMetricsCacheRow],
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state
            .account_metrics
            .retain(|r| r.manager_account_id != manager_id);
        state.account_metrics.extend(rows.iter().cloned().map(|mut r| {
            r.manager_account_id = manager_id;
            r
        }));
        Ok(())
    }

    async fn list_account_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Vec<AccountMetricsCacheRow>, AppError> {
        let mut rows: Vec<AccountMetricsCacheRow> = self
            .state
            .read()
            .await
            .account_metrics
            .iter()
            .filter(|r| r.manager_account_id == manager_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.clicks
                .cmp(&a.clicks)
                .then_with(|| a.customer_id.cmp(&b.customer_id))
        });
        Ok(rows)
    }

    async fn upsert_manager_totals(&self, totals: &ManagerMetricsTotals) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state
            .manager_metrics
            .entry(totals.manager_account_id)
            .or_insert_with(|| {
                ManagerMetricsCacheRow::empty(totals.manager_account_id, totals.last_updated_at)
            })
            .apply_totals(totals);
        Ok(())
    }

    async fn upsert_manager_budget(&self, budget: &ManagerBudgetSummary) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state
            .manager_metrics
            .entry(budget.manager_account_id)
            .or_insert_with(|| {
                ManagerMetricsCacheRow::empty(budget.manager_account_id, budget.last_updated_at)
            })
            .apply_budget(budget);
        Ok(())
    }

    async fn get_manager_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Option<ManagerMetricsCacheRow>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .manager_metrics
            .get(&manager_id)
            .cloned())
    }

    async fn list_manager_metrics(&self) -> Result<Vec<ManagerMetricsCacheRow>, AppError> {
        let mut rows: Vec<ManagerMetricsCacheRow> = self
            .state
            .read()
            .await
            .manager_metrics
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.total_clicks.cmp(&a.total_clicks));
        Ok(rows)
    }

    async fn get_structure(
        &self,
        manager_id: Uuid,
    ) -> Result<Option<StructureCacheEntry>, AppError> {
        Ok(self.state.read().await.structures.get(&manager_id).cloned())
    }

    async fn put_structure(&self, entry: &StructureCacheEntry) -> Result<(), AppError> {
        self.state
            .write()
            .await
            .structures
            .insert(entry.manager_account_id, entry.clone());
        Ok(())
    }

    async fn log_activity(&self, activity: &NewActivity) -> Result<(), AppError> {
        self.state.write().await.activity.push(ActivityEntry {
            id: Uuid::new_v4(),
            action: activity.action.as_str().to_string(),
            entity_type: activity.entity_type.clone(),
            entity_id: activity.entity_id.clone(),
            entity_name: activity.entity_name.clone(),
            details: activity.details.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .activity
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
