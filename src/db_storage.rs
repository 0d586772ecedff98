use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{
    AccountMetricsCacheRow, ActivityEntry, Invitation, ManagerAccount, ManagerBudgetSummary,
    ManagerConnection, ManagerMetricsCacheRow, ManagerMetricsTotals, NewActivity, NewInvitation,
    NewManagerAccount, NewSubAccount, StructureCacheEntry, SubAccount,
};
use crate::store::{Store, INSERT_BATCH_SIZE};

const MANAGER_COLUMNS: &str = "id, name, mcc_number, developer_token, manager_email, \
     google_client_id, google_client_secret, google_refresh_token, \
     google_connected_email, google_connected_at, status, created_at";

const ACCOUNT_METRICS_COLUMNS: &str = "manager_account_id, customer_id, customer_name, \
     currency_code, timezone, status, clicks, impressions, cost_micros, cost, conversions, \
     ctr, avg_cpc, metrics_date_from, metrics_date_to, last_updated_at";

const MANAGER_METRICS_COLUMNS: &str = "manager_account_id, total_clicks, total_impressions, \
     total_cost, total_conversions, ctr, avg_cpc, account_count, folder_count, total_budget, \
     total_spent, total_remaining, percent_used, accounts_with_budget, last_updated_at";

/// Postgres-backed storage for managers, provisioning records and caches.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_managers(&self) -> Result<Vec<ManagerAccount>, AppError> {
        sqlx::query_as::<_, ManagerAccount>(&format!(
            "SELECT {} FROM manager_accounts ORDER BY created_at DESC",
            MANAGER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn get_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError> {
        sqlx::query_as::<_, ManagerAccount>(&format!(
            "SELECT {} FROM manager_accounts WHERE id = $1",
            MANAGER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn create_manager(&self, new: &NewManagerAccount) -> Result<ManagerAccount, AppError> {
        let manager = sqlx::query_as::<_, ManagerAccount>(&format!(
            r#"
            INSERT INTO manager_accounts (id, name, mcc_number, developer_token, manager_email)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            MANAGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.mcc_number)
        .bind(&new.developer_token)
        .bind(&new.manager_email)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        tracing::info!("Created manager account {} ({})", manager.name, manager.id);
        Ok(manager)
    }

    async fn delete_manager(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM manager_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn connect_manager(
        &self,
        id: Uuid,
        connection: &ManagerConnection,
    ) -> Result<Option<ManagerAccount>, AppError> {
        sqlx::query_as::<_, ManagerAccount>(&format!(
            r#"
            UPDATE manager_accounts
            SET google_client_id = COALESCE($2, google_client_id),
                google_client_secret = COALESCE($3, google_client_secret),
                google_refresh_token = $4,
                google_connected_email = $5,
                google_connected_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            MANAGER_COLUMNS
        ))
        .bind(id)
        .bind(&connection.google_client_id)
        .bind(&connection.google_client_secret)
        .bind(&connection.refresh_token)
        .bind(&connection.connected_email)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn disconnect_manager(&self, id: Uuid) -> Result<Option<ManagerAccount>, AppError> {
        sqlx::query_as::<_, ManagerAccount>(&format!(
            r#"
            UPDATE manager_accounts
            SET google_refresh_token = NULL,
                google_connected_email = NULL,
                google_connected_at = NULL
            WHERE id = $1
            RETURNING {}
            "#,
            MANAGER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn list_connected_managers(
        &self,
        scope: Option<Uuid>,
    ) -> Result<Vec<ManagerAccount>, AppError> {
        sqlx::query_as::<_, ManagerAccount>(&format!(
            r#"
            SELECT {} FROM manager_accounts
            WHERE google_refresh_token IS NOT NULL
              AND ($1::uuid IS NULL OR id = $1)
            ORDER BY created_at
            "#,
            MANAGER_COLUMNS
        ))
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn insert_sub_account(&self, new: &NewSubAccount) -> Result<SubAccount, AppError> {
        sqlx::query_as::<_, SubAccount>(
            r#"
            INSERT INTO sub_accounts (id, manager_account_id, customer_id, currency_code, timezone)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, manager_account_id, customer_id, currency_code, timezone, status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.manager_account_id)
        .bind(&new.customer_id)
        .bind(&new.currency_code)
        .bind(&new.timezone)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn list_sub_accounts(&self, manager_id: Uuid) -> Result<Vec<SubAccount>, AppError> {
        sqlx::query_as::<_, SubAccount>(
            r#"
            SELECT id, manager_account_id, customer_id, currency_code, timezone, status, created_at
            FROM sub_accounts
            WHERE manager_account_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn transfer_sub_accounts(
        &self,
        ids: &[Uuid],
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE sub_accounts SET manager_account_id = $3 \
             WHERE id = ANY($1) AND manager_account_id = $2",
        )
        .bind(ids)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected())
    }

    async fn insert_invitation(&self, new: &NewInvitation) -> Result<Invitation, AppError> {
        sqlx::query_as::<_, Invitation>(
            r#"
            INSERT INTO account_invitations (id, manager_account_id, sub_account_id, email, access_level, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, manager_account_id, sub_account_id, email, access_level, status, invited_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.manager_account_id)
        .bind(new.sub_account_id)
        .bind(&new.email)
        .bind(new.access_level.as_str())
        .bind(new.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn list_invitations(&self, manager_id: Uuid) -> Result<Vec<Invitation>, AppError> {
        sqlx::query_as::<_, Invitation>(
            r#"
            SELECT id, manager_account_id, sub_account_id, email, access_level, status, invited_at
            FROM account_invitations
            WHERE manager_account_id = $1
            ORDER BY invited_at DESC
            "#,
        )
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    /// Runs in one transaction so readers never observe a half-written snapshot.
    async fn replace_account_metrics(
        &self,
        manager_id: Uuid,
        rows: &[AccountMetricsCacheRow],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let deleted = sqlx::query("DELETE FROM account_metrics_cache WHERE manager_account_id = $1")
            .bind(manager_id)
            .execute(&mut *tx)
            .await
            .context("clearing account metrics")?;

        for (i, chunk) in rows.chunks(INSERT_BATCH_SIZE).enumerate() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO account_metrics_cache ({}) ",
                ACCOUNT_METRICS_COLUMNS
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(manager_id)
                    .push_bind(row.customer_id.clone())
                    .push_bind(row.customer_name.clone())
                    .push_bind(row.currency_code.clone())
                    .push_bind(row.timezone.clone())
                    .push_bind(row.status.clone())
                    .push_bind(row.clicks)
                    .push_bind(row.impressions)
                    .push_bind(row.cost_micros)
                    .push_bind(row.cost.clone())
                    .push_bind(row.conversions.clone())
                    .push_bind(row.ctr.clone())
                    .push_bind(row.avg_cpc.clone())
                    .push_bind(row.metrics_date_from)
                    .push_bind(row.metrics_date_to)
                    .push_bind(row.last_updated_at);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting account metrics batch {}", i + 1))?;
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;

        tracing::debug!(
            "Replaced account metrics for manager {}: {} removed, {} inserted",
            manager_id,
            deleted.rows_affected(),
            rows.len()
        );
        Ok(())
    }

    async fn list_account_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Vec<AccountMetricsCacheRow>, AppError> {
        sqlx::query_as::<_, AccountMetricsCacheRow>(&format!(
            "SELECT {} FROM account_metrics_cache WHERE manager_account_id = $1 \
             ORDER BY clicks DESC, customer_id",
            ACCOUNT_METRICS_COLUMNS
        ))
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn upsert_manager_totals(&self, totals: &ManagerMetricsTotals) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO manager_metrics_cache (
                manager_account_id, total_clicks, total_impressions, total_cost,
                total_conversions, ctr, avg_cpc, account_count, folder_count, last_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (manager_account_id) DO UPDATE
            SET total_clicks = EXCLUDED.total_clicks,
                total_impressions = EXCLUDED.total_impressions,
                total_cost = EXCLUDED.total_cost,
                total_conversions = EXCLUDED.total_conversions,
                ctr = EXCLUDED.ctr,
                avg_cpc = EXCLUDED.avg_cpc,
                account_count = EXCLUDED.account_count,
                folder_count = EXCLUDED.folder_count,
                last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(totals.manager_account_id)
        .bind(totals.total_clicks)
        .bind(totals.total_impressions)
        .bind(&totals.total_cost)
        .bind(&totals.total_conversions)
        .bind(&totals.ctr)
        .bind(&totals.avg_cpc)
        .bind(totals.account_count)
        .bind(totals.folder_count)
        .bind(totals.last_updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn upsert_manager_budget(&self, budget: &ManagerBudgetSummary) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO manager_metrics_cache (
                manager_account_id, total_budget, total_spent, total_remaining,
                percent_used, accounts_with_budget, last_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (manager_account_id) DO UPDATE
            SET total_budget = EXCLUDED.total_budget,
                total_spent = EXCLUDED.total_spent,
                total_remaining = EXCLUDED.total_remaining,
                percent_used = EXCLUDED.percent_used,
                accounts_with_budget = EXCLUDED.accounts_with_budget,
                last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(budget.manager_account_id)
        .bind(&budget.total_budget)
        .bind(&budget.total_spent)
        .bind(&budget.total_remaining)
        .bind(budget.percent_used)
        .bind(budget.accounts_with_budget)
        .bind(budget.last_updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn get_manager_metrics(
        &self,
        manager_id: Uuid,
    ) -> Result<Option<ManagerMetricsCacheRow>, AppError> {
        sqlx::query_as::<_, ManagerMetricsCacheRow>(&format!(
            "SELECT {} FROM manager_metrics_cache WHERE manager_account_id = $1",
            MANAGER_METRICS_COLUMNS
        ))
        .bind(manager_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn list_manager_metrics(&self) -> Result<Vec<ManagerMetricsCacheRow>, AppError> {
        sqlx::query_as::<_, ManagerMetricsCacheRow>(&format!(
            "SELECT {} FROM manager_metrics_cache ORDER BY total_clicks DESC",
            MANAGER_METRICS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn get_structure(
        &self,
        manager_id: Uuid,
    ) -> Result<Option<StructureCacheEntry>, AppError> {
        sqlx::query_as::<_, StructureCacheEntry>(
            r#"
            SELECT manager_account_id, folders, accounts, total_accounts, total_folders,
                   checksum, cached_at, expires_at
            FROM structure_cache
            WHERE manager_account_id = $1
            "#,
        )
        .bind(manager_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn put_structure(&self, entry: &StructureCacheEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO structure_cache (
                manager_account_id, folders, accounts, total_accounts, total_folders,
                checksum, cached_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (manager_account_id) DO UPDATE
            SET folders = EXCLUDED.folders,
                accounts = EXCLUDED.accounts,
                total_accounts = EXCLUDED.total_accounts,
                total_folders = EXCLUDED.total_folders,
                checksum = EXCLUDED.checksum,
                cached_at = EXCLUDED.cached_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(entry.manager_account_id)
        .bind(&entry.folders)
        .bind(&entry.accounts)
        .bind(entry.total_accounts)
        .bind(entry.total_folders)
        .bind(&entry.checksum)
        .bind(entry.cached_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn log_activity(&self, activity: &NewActivity) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, action, entity_type, entity_id, entity_name, details)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(activity.action.as_str())
        .bind(&activity.entity_type)
        .bind(&activity.entity_id)
        .bind(&activity.entity_name)
        .bind(&activity.details)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn list_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, AppError> {
        sqlx::query_as::<_, ActivityEntry>(
            r#"
            SELECT id, action, entity_type, entity_id, entity_name, details, created_at
            FROM activity_log
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }
}
