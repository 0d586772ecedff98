use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use moka::sync::Cache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::google_ads_client::{AdsSession, GoogleAdsClient};
use crate::google_ads_models::{ClientAccount, Metrics};
use crate::metrics_math::{self, DerivedMetrics, MetricsWindow};
use crate::models::{AccountMetricsCacheRow, ManagerAccount, ManagerMetricsTotals, OAuthClient};
use crate::store::Store;

/// Retry budget for one account's metrics fetch.
pub const ACCOUNT_FETCH_RETRIES: u32 = 2;

const LEAF_ACCOUNTS_QUERY: &str = "SELECT customer_client.id, customer_client.descriptive_name, \
     customer_client.currency_code, customer_client.time_zone, customer_client.manager, \
     customer_client.status \
     FROM customer_client \
     WHERE customer_client.manager = false";

/// Waits inserted between remote calls during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacing {
    /// Before every account after the first.
    pub account_delay: Duration,
    /// Extra wait before every `batch_every`-th account.
    pub batch_pause: Duration,
    pub batch_every: usize,
    /// Between managers of a multi-manager run.
    pub manager_pause: Duration,
}

impl Default for SyncPacing {
    fn default() -> Self {
        Self {
            account_delay: Duration::from_millis(200),
            batch_pause: Duration::from_secs(2),
            batch_every: 5,
            manager_pause: Duration::from_secs(5),
        }
    }
}

impl SyncPacing {
    /// No waits at all.
    pub fn none() -> Self {
        Self {
            account_delay: Duration::ZERO,
            batch_pause: Duration::ZERO,
            batch_every: 5,
            manager_pause: Duration::ZERO,
        }
    }

    /// Waits to perform before fetching the account at `index`.
    pub fn waits_before(&self, index: usize) -> Vec<Duration> {
        let mut waits = Vec::new();
        if index == 0 {
            return waits;
        }
        waits.push(self.account_delay);
        if self.batch_every > 0 && index % self.batch_every == 0 {
            waits.push(self.batch_pause);
        }
        waits.retain(|w| !w.is_zero());
        waits
    }
}

/// Marks a manager as being synced; the mark is released when this drops,
/// including when the owning future is cancelled.
struct InFlightGuard {
    in_flight: Cache<Uuid, ()>,
    manager_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.invalidate(&self.manager_id);
    }
}

/// Outcome of syncing one manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSyncResult {
    /// Manager display name.
    pub manager: String,
    pub manager_account_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_clicks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManagerSyncResult {
    fn failed(manager: &ManagerAccount, error: String) -> Self {
        Self {
            manager: manager.name.clone(),
            manager_account_id: manager.id,
            success: false,
            account_count: None,
            total_clicks: None,
            total_cost: None,
            error: Some(error),
        }
    }
}

/// Outcome of a sync run over one or more managers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub results: Vec<ManagerSyncResult>,
    pub synced_at: DateTime<Utc>,
}

/// Metrics of one account fetched on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveAccountMetrics {
    pub clicks: i64,
    pub impressions: i64,
    pub cost: BigDecimal,
    pub conversions: BigDecimal,
    pub ctr: BigDecimal,
    pub avg_cpc: BigDecimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveMetricsReport {
    /// Keyed by account id. Accounts that could not be read are absent.
    pub metrics: BTreeMap<String, LiveAccountMetrics>,
    pub totals: LiveAccountMetrics,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// Full-recompute metrics sync for connected manager accounts.
///
/// Each manager's account rows are replaced wholesale, so accounts that left
/// the hierarchy leave the cache on the next run. Only one sync per manager
/// runs at a time; overlapping requests fail fast instead of racing.
pub struct MetricsSyncService {
    store: Arc<dyn Store>,
    client: GoogleAdsClient,
    oauth_defaults: OAuthClient,
    pacing: SyncPacing,
    in_flight: Cache<Uuid, ()>,
}

impl MetricsSyncService {
    pub fn new(store: Arc<dyn Store>, client: GoogleAdsClient, oauth_defaults: OAuthClient) -> Self {
        let in_flight = Cache::builder().max_capacity(10_000).build();

        Self {
            store,
            client,
            oauth_defaults,
            pacing: SyncPacing::default(),
            in_flight,
        }
    }

    pub fn with_pacing(mut self, pacing: SyncPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Syncs every connected manager, or only `scope` when given.
    ///
    /// Managers are processed sequentially; one failing manager is reported
    /// in its result and the run moves on.
    pub async fn sync_all(&self, scope: Option<Uuid>) -> Result<SyncReport, AppError> {
        let managers = self.store.list_connected_managers(scope).await?;
        tracing::info!("Starting metrics sync for {} manager(s)", managers.len());

        let mut results = Vec::with_capacity(managers.len());
        for (i, manager) in managers.iter().enumerate() {
            if i > 0 {
                self.pause(self.pacing.manager_pause).await;
            }
            results.push(self.sync_manager(manager).await);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            "Metrics sync finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );

        Ok(SyncReport {
            success: true,
            results,
            synced_at: Utc::now(),
        })
    }

    /// Syncs one manager, converting any failure into a failed result.
    pub async fn sync_manager(&self, manager: &ManagerAccount) -> ManagerSyncResult {
        let Some(_guard) = self.try_acquire(manager.id) else {
            tracing::warn!("Sync already in progress for {}, skipping", manager.name);
            return ManagerSyncResult::failed(manager, "sync already in progress".to_string());
        };

        tracing::info!("📊 Syncing {}...", manager.name);
        match self.run_manager(manager).await {
            Ok(totals) => {
                tracing::info!(
                    "✓ {}: {} accounts, {} clicks, {}",
                    manager.name,
                    totals.account_count,
                    totals.total_clicks,
                    totals.total_cost
                );
                ManagerSyncResult {
                    manager: manager.name.clone(),
                    manager_account_id: manager.id,
                    success: true,
                    account_count: Some(totals.account_count as usize),
                    total_clicks: Some(totals.total_clicks),
                    total_cost: Some(totals.total_cost),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!("❌ {}: {}", manager.name, e);
                ManagerSyncResult::failed(manager, e.to_string())
            }
        }
    }

    fn try_acquire(&self, manager_id: Uuid) -> Option<InFlightGuard> {
        let entry = self.in_flight.entry(manager_id).or_insert(());
        entry.is_fresh().then(|| InFlightGuard {
            in_flight: self.in_flight.clone(),
            manager_id,
        })
    }

    async fn run_manager(&self, manager: &ManagerAccount) -> Result<ManagerMetricsTotals, AppError> {
        let session = self.client.open_session(manager, &self.oauth_defaults).await?;
        let mcc_id = manager.customer_id();

        let rows = self
            .client
            .query_all_pages(&session, &mcc_id, LEAF_ACCOUNTS_QUERY, None)
            .await
            .with_context(|| format!("listing accounts under MCC {}", mcc_id))?;
        let accounts: Vec<ClientAccount> = rows
            .iter()
            .filter_map(|row| row.customer_client.as_ref())
            .filter(|c| !c.manager)
            .map(ClientAccount::from)
            .collect();
        tracing::info!("Found {} accounts under MCC {}", accounts.len(), mcc_id);

        let window = MetricsWindow::ending_on(Utc::now().date_naive());
        let mut totals = Metrics::default();
        let mut cache_rows = Vec::with_capacity(accounts.len());

        for (i, account) in accounts.iter().enumerate() {
            for wait in self.pacing.waits_before(i) {
                self.client.sleeper().sleep(wait).await;
            }

            let metrics = self.fetch_account_metrics(&session, &account.id, &window).await;
            totals.accumulate(&metrics);
            cache_rows.push(account_row(manager.id, account, &metrics, &window));
        }

        self.store
            .replace_account_metrics(manager.id, &cache_rows)
            .await?;

        let derived = DerivedMetrics::from_metrics(&totals);
        let manager_totals = ManagerMetricsTotals {
            manager_account_id: manager.id,
            total_clicks: totals.clicks,
            total_impressions: totals.impressions,
            total_cost: derived.cost,
            total_conversions: derived.conversions,
            ctr: derived.ctr,
            avg_cpc: derived.avg_cpc,
            account_count: accounts.len() as i32,
            folder_count: 0,
            last_updated_at: Utc::now(),
        };
        self.store.upsert_manager_totals(&manager_totals).await?;

        Ok(manager_totals)
    }

    /// Sums the campaign metrics of one account. Any failure counts as zero.
    async fn fetch_account_metrics(
        &self,
        session: &AdsSession,
        customer_id: &str,
        window: &MetricsWindow,
    ) -> Metrics {
        match self.try_fetch_account_metrics(session, customer_id, window).await {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::debug!("Metrics unavailable for account {}: {}", customer_id, e);
                Metrics::default()
            }
        }
    }

    async fn try_fetch_account_metrics(
        &self,
        session: &AdsSession,
        customer_id: &str,
        window: &MetricsWindow,
    ) -> Result<Metrics, AppError> {
        let policy = self
            .client
            .retry_policy()
            .with_max_retries(ACCOUNT_FETCH_RETRIES);
        let rows = self
            .client
            .query_all_pages_with_policy(
                session,
                customer_id,
                &window.campaign_metrics_query(),
                None,
                &policy,
            )
            .await?;

        let mut metrics = Metrics::default();
        for m in rows.iter().filter_map(|row| row.metrics.as_ref()) {
            metrics.accumulate(m);
        }
        Ok(metrics)
    }

    /// Current 30-day metrics for specific accounts, without touching the cache.
    pub async fn fetch_live_metrics(
        &self,
        manager: &ManagerAccount,
        account_ids: &[String],
    ) -> Result<LiveMetricsReport, AppError> {
        let session = self.client.open_session(manager, &self.oauth_defaults).await?;
        let window = MetricsWindow::ending_on(Utc::now().date_naive());

        let mut metrics = BTreeMap::new();
        let mut totals = Metrics::default();
        for (i, customer_id) in account_ids.iter().enumerate() {
            for wait in self.pacing.waits_before(i) {
                self.client.sleeper().sleep(wait).await;
            }
            match self
                .try_fetch_account_metrics(&session, customer_id, &window)
                .await
            {
                Ok(m) => {
                    totals.accumulate(&m);
                    metrics.insert(customer_id.clone(), live_metrics(&m));
                }
                Err(e) => {
                    tracing::warn!("Live metrics failed for account {}: {}", customer_id, e);
                }
            }
        }

        Ok(LiveMetricsReport {
            metrics,
            totals: live_metrics(&totals),
            date_from: window.start,
            date_to: window.end,
        })
    }

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.client.sleeper().sleep(duration).await;
        }
    }
}

fn live_metrics(m: &Metrics) -> LiveAccountMetrics {
    let derived = DerivedMetrics::from_metrics(m);
    LiveAccountMetrics {
        clicks: m.clicks,
        impressions: m.impressions,
        cost: derived.cost,
        conversions: derived.conversions,
        ctr: derived.ctr,
        avg_cpc: derived.avg_cpc,
    }
}

fn account_row(
    manager_id: Uuid,
    account: &ClientAccount,
    metrics: &Metrics,
    window: &MetricsWindow,
) -> AccountMetricsCacheRow {
    let derived = DerivedMetrics::from_metrics(metrics);
    AccountMetricsCacheRow {
        manager_account_id: manager_id,
        customer_id: account.id.clone(),
        customer_name: account.name.clone(),
        currency_code: account.currency.clone(),
        timezone: account.timezone.clone(),
        status: account.status.clone(),
        clicks: metrics.clicks,
        impressions: metrics.impressions,
        cost_micros: metrics.cost_micros,
        cost: derived.cost,
        conversions: derived.conversions,
        ctr: derived.ctr,
        avg_cpc: derived.avg_cpc,
        metrics_date_from: window.start,
        metrics_date_to: window.end,
        last_updated_at: Utc::now(),
    }
}

/// Runs a fleet-wide sync every `interval`, starting one interval from now.
pub fn spawn_scheduler(
    service: Arc<MetricsSyncService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            tracing::info!("⏰ Scheduled metrics sync starting");
            match service.sync_all(None).await {
                Ok(report) => {
                    let failed = report.results.iter().filter(|r| !r.success).count();
                    tracing::info!(
                        "⏰ Scheduled sync done: {} manager(s), {} failed",
                        report.results.len(),
                        failed
                    );
                }
                Err(e) => tracing::error!("Scheduled sync could not start: {}", e),
            }
        }
    })
}

/// Total cost in currency units for a set of cache rows.
pub fn total_cost(rows: &[AccountMetricsCacheRow]) -> BigDecimal {
    let micros: i64 = rows.iter().map(|r| r.cost_micros).sum();
    metrics_math::micros_to_currency(micros)
}
