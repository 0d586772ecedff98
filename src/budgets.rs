use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::errors::AppError;
use crate::google_ads_client::{AdsSession, GoogleAdsClient};
use crate::metrics_math;
use crate::models::{ManagerAccount, ManagerBudgetSummary, OAuthClient};
use crate::store::Store;

/// Accounts queried concurrently per chunk.
pub const BUDGET_CHUNK_SIZE: usize = 50;
/// Chunks processed per refresh; accounts beyond this are not counted.
pub const MAX_BUDGET_CHUNKS: usize = 10;

const CHUNK_DELAY: Duration = Duration::from_millis(100);

const CUSTOMER_IDS_QUERY: &str =
    "SELECT customer_client.id FROM customer_client WHERE customer_client.manager = false";

const APPROVED_BUDGET_QUERY: &str = "SELECT account_budget.approved_spending_limit_micros, \
     account_budget.amount_micros, account_budget.adjusted_spending_limit_micros \
     FROM account_budget \
     WHERE account_budget.status = 'APPROVED'";

/// Limit and spend of one account's approved budget, in micros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetFigures {
    pub limit_micros: i64,
    pub spent_micros: i64,
}

/// Folds per-account budgets into the manager summary.
///
/// Accounts without a positive limit are ignored.
pub fn summarize(
    manager: &ManagerAccount,
    budgets: impl IntoIterator<Item = BudgetFigures>,
) -> ManagerBudgetSummary {
    let mut limit = 0i64;
    let mut spent = 0i64;
    let mut accounts = 0i32;
    for b in budgets.into_iter().filter(|b| b.limit_micros > 0) {
        limit += b.limit_micros;
        spent += b.spent_micros;
        accounts += 1;
    }

    ManagerBudgetSummary {
        manager_account_id: manager.id,
        total_budget: metrics_math::micros_to_currency(limit),
        total_spent: metrics_math::micros_to_currency(spent),
        total_remaining: metrics_math::micros_to_currency(limit - spent),
        percent_used: metrics_math::percent(spent, limit),
        accounts_with_budget: accounts,
        last_updated_at: Utc::now(),
    }
}

/// Refreshes the budget columns of the manager metrics cache.
pub struct BudgetService {
    store: Arc<dyn Store>,
    client: GoogleAdsClient,
    oauth_defaults: OAuthClient,
}

impl BudgetService {
    pub fn new(store: Arc<dyn Store>, client: GoogleAdsClient, oauth_defaults: OAuthClient) -> Self {
        Self {
            store,
            client,
            oauth_defaults,
        }
    }

    /// Sums approved budgets across the manager's leaf accounts and stores the result.
    ///
    /// Accounts are queried `BUDGET_CHUNK_SIZE` at a time, at most
    /// `MAX_BUDGET_CHUNKS` chunks. An account whose budget cannot be read is skipped.
    pub async fn refresh(&self, manager: &ManagerAccount) -> Result<ManagerBudgetSummary, AppError> {
        let session = self.client.open_session(manager, &self.oauth_defaults).await?;
        let mcc_id = manager.customer_id();

        let customer_ids: Vec<String> = self
            .client
            .query_all_pages(&session, &mcc_id, CUSTOMER_IDS_QUERY, None)
            .await?
            .into_iter()
            .filter_map(|row| row.customer_client.map(|c| c.id))
            .filter(|id| !id.is_empty())
            .collect();

        let chunk_count = customer_ids.len().div_ceil(BUDGET_CHUNK_SIZE);
        if chunk_count > MAX_BUDGET_CHUNKS {
            tracing::warn!(
                "MCC {} has {} accounts, budgets counted for the first {} only",
                mcc_id,
                customer_ids.len(),
                MAX_BUDGET_CHUNKS * BUDGET_CHUNK_SIZE
            );
        }

        let mut budgets = Vec::new();
        for (i, chunk) in customer_ids
            .chunks(BUDGET_CHUNK_SIZE)
            .take(MAX_BUDGET_CHUNKS)
            .enumerate()
        {
            if i > 0 {
                self.client.sleeper().sleep(CHUNK_DELAY).await;
            }
            budgets.extend(self.fetch_chunk(&session, chunk).await);
        }

        let summary = summarize(manager, budgets);
        self.store.upsert_manager_budget(&summary).await?;

        tracing::info!(
            "✓ Budgets for {}: {} accounts with budget, {}% used",
            manager.name,
            summary.accounts_with_budget,
            summary.percent_used
        );
        Ok(summary)
    }

    async fn fetch_chunk(&self, session: &AdsSession, chunk: &[String]) -> Vec<BudgetFigures> {
        let mut tasks = JoinSet::new();
        for customer_id in chunk {
            let client = self.client.clone();
            let session = session.clone();
            let customer_id = customer_id.clone();
            tasks.spawn(async move {
                let response = client
                    .query(&session, &customer_id, APPROVED_BUDGET_QUERY, None)
                    .await;
                (customer_id, response)
            });
        }

        let mut figures = Vec::with_capacity(chunk.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(response))) => {
                    if let Some(budget) = response
                        .results
                        .into_iter()
                        .find_map(|row| row.account_budget)
                    {
                        figures.push(BudgetFigures {
                            limit_micros: budget.limit_micros(),
                            spent_micros: budget.amount_micros.unwrap_or(0),
                        });
                    }
                }
                Ok((customer_id, Err(e))) => {
                    tracing::debug!("Budget unavailable for account {}: {}", customer_id, e);
                }
                Err(e) => tracing::warn!("Budget task failed: {}", e),
            }
        }
        figures
    }
}
