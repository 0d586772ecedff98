use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    AccountMetricsCacheRow, ActivityEntry, Invitation, ManagerAccount, ManagerBudgetSummary,
    ManagerConnection, ManagerMetricsCacheRow, ManagerMetricsTotals, NewActivity, NewInvitation,
    NewManagerAccount, NewSubAccount, StructureCacheEntry, SubAccount,
};

/// Rows per INSERT when replacing the account metrics snapshot.
pub const INSERT_BATCH_SIZE: usize = 100;

/// Persistence used by the sync pipeline, provisioning and the HTTP layer.
///
/// `PgStore` is the production implementation; `testing::MemoryStore` keeps
/// the same contract in process.
#[async_trait]
pub trait Store: Send + Sync {
    // Manager accounts
    async fn list_managers(&self) -> Result<Vec<ManagerAccount>, AppError>;
    async fn get_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError>;
    async fn create_manager(&self, new: &NewManagerAccount) -> Result<ManagerAccount, AppError>;
    /// Deletes the manager and everything owned by it. Returns false when absent.
    async fn delete_manager(&self, id: Uuid) -> Result<bool, AppError>;
    async fn connect_manager(
        &self,
        id: Uuid,
        connection: &ManagerConnection,
    ) -> Result<Option<ManagerAccount>, AppError>;
    async fn disconnect_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError>;
    /// Managers holding a refresh token, optionally narrowed to one id.
    async fn list_connected_managers(
        &self,
        scope: Option<Uuid>,
    ) -> Result<Vec<ManagerAccount>, AppError>;

    // Sub-accounts and invitations
    async fn insert_sub_account(&self, new: &NewSubAccount) -> Result<SubAccount, AppError>;
    async fn list_sub_accounts(&self, manager_id: Uuid) -> Result<Vec<SubAccount>, AppError>;
    /// Moves the given sub-accounts owned by `from` to `to`; returns how many moved.
    async fn transfer_sub_accounts(
        &self,
        ids: &[Uuid],
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, AppError>;
    async fn insert_invitation(&self, new: &NewInvitation) -> Result<Invitation, AppError>;
    async fn list_invitations(&self, manager_id: Uuid) -> Result<Vec<Invitation>, AppError>;

    // Metrics cache
    /// Deletes every account row of `manager_id`, then inserts `rows`.
    async fn replace_account_metrics(
        &self,
        manager_id: Uuid,
        rows: &[AccountMetricsCacheRow],
    ) -> Result<(), AppError>;
    /// Account rows of one manager, most clicks first.
    async fn list_account_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Vec<AccountMetricsCacheRow>, AppError>;
    async fn upsert_manager_totals(&self, totals: &ManagerMetricsTotals) -> Result<(), AppError>;
    async fn upsert_manager_budget(&self, budget: &ManagerBudgetSummary) -> Result<(), AppError>;
    async fn get_manager_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Option<ManagerMetricsCacheRow>, AppError>;
    async fn list_manager_metrics(&self) -> Result<Vec<ManagerMetricsCacheRow>, AppError>;

    // Structure cache
    async fn get_structure(&self, manager_id: Uuid)
        -> Result<Option<StructureCacheEntry>, AppError>;
    async fn put_structure(&self, entry: &StructureCacheEntry) -> Result<(), AppError>;

    // Activity log
    async fn log_activity(&self, activity: &NewActivity) -> Result<(), AppError>;
    async fn list_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, AppError>;
}

/// Records an activity, logging instead of failing when the write fails.
pub async fn record_activity(store: &dyn Store, activity: NewActivity) {
    if let Err(e) = store.log_activity(&activity).await {
        tracing::warn!(
            "Failed to log activity {}: {}",
            activity.action.as_str(),
            e
        );
    }
}
