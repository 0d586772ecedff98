use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::cache_validator;
use crate::errors::AppError;
use crate::google_ads_client::GoogleAdsClient;
use crate::google_ads_models::{normalize_customer_id, ClientAccount};
use crate::models::{ManagerAccount, OAuthClient, StructureCacheEntry};
use crate::store::Store;

/// Default lifetime of a persisted structure snapshot.
pub const DEFAULT_STRUCTURE_TTL_SECS: u64 = 3600;

const FORBIDDEN: u16 = 403;

const HIERARCHY_QUERY: &str = "SELECT customer_client.id, customer_client.descriptive_name, \
     customer_client.currency_code, customer_client.time_zone, customer_client.manager, \
     customer_client.test_account, customer_client.status, customer_client.level \
     FROM customer_client \
     ORDER BY customer_client.level, customer_client.descriptive_name";

const LEAF_ACCOUNTS_QUERY: &str = "SELECT customer_client.id, customer_client.descriptive_name, \
     customer_client.currency_code, customer_client.time_zone, customer_client.manager, \
     customer_client.test_account, customer_client.status, customer_client.level \
     FROM customer_client \
     WHERE customer_client.manager = false";

/// Counts shown next to a structure listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureSummary {
    pub total: usize,
    pub created_by_us: usize,
    pub external: usize,
    pub folders: usize,
}

/// Folder and leaf-account listing of one manager.
#[derive(Debug, Clone, Serialize)]
pub struct CachedStructure {
    pub manager_account_id: Uuid,
    pub folders: Vec<ClientAccount>,
    pub accounts: Vec<ClientAccount>,
    pub total_accounts: i32,
    pub total_folders: i32,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// False when the listing was rebuilt from the remote API by this call.
    pub from_cache: bool,
}

impl CachedStructure {
    pub fn summary(&self) -> StructureSummary {
        let created_by_us = self.accounts.iter().filter(|a| a.created_by_us).count();
        StructureSummary {
            total: self.accounts.len(),
            created_by_us,
            external: self.accounts.len() - created_by_us,
            folders: self.folders.len(),
        }
    }

    fn from_entry(entry: StructureCacheEntry) -> Option<Self> {
        let folders: Vec<ClientAccount> = match serde_json::from_value(entry.folders) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unreadable folders in structure snapshot: {}", e);
                return None;
            }
        };
        let accounts: Vec<ClientAccount> = match serde_json::from_value(entry.accounts) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Unreadable accounts in structure snapshot: {}", e);
                return None;
            }
        };
        Some(Self {
            manager_account_id: entry.manager_account_id,
            folders,
            accounts,
            total_accounts: entry.total_accounts,
            total_folders: entry.total_folders,
            cached_at: entry.cached_at,
            expires_at: entry.expires_at,
            from_cache: true,
        })
    }
}

/// Splits a `customer_client` listing into folders and leaf accounts.
///
/// The manager itself is not a folder. Leaf accounts whose id appears in
/// `ours` are flagged as provisioned by this service.
pub fn split_hierarchy(
    manager_customer_id: &str,
    clients: Vec<ClientAccount>,
    ours: &HashSet<String>,
) -> (Vec<ClientAccount>, Vec<ClientAccount>) {
    let mut folders = Vec::new();
    let mut accounts = Vec::new();
    for mut client in clients {
        if client.is_manager {
            if client.id != manager_customer_id {
                folders.push(client);
            }
        } else {
            client.created_by_us = ours.contains(&client.id);
            accounts.push(client);
        }
    }
    (folders, accounts)
}

/// Persisted per-manager structure snapshots plus the session folder cache.
///
/// Snapshots live in the store with an expiry and a checksum. Folder contents
/// are resolved on demand and kept only in memory for the life of the process.
pub struct StructureCache {
    store: Arc<dyn Store>,
    client: GoogleAdsClient,
    oauth_defaults: OAuthClient,
    ttl: Duration,
    folder_accounts: Cache<(Uuid, String), Arc<Vec<ClientAccount>>>,
    generations: Mutex<HashMap<Uuid, u64>>,
}

impl StructureCache {
    pub fn new(
        store: Arc<dyn Store>,
        client: GoogleAdsClient,
        oauth_defaults: OAuthClient,
        ttl_secs: u64,
    ) -> Self {
        // Folder listings for the session. Evicted after the snapshot TTL.
        let folder_accounts = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(std::time::Duration::from_secs(ttl_secs.max(1)))
            .build();

        Self {
            store,
            client,
            oauth_defaults,
            ttl: Duration::seconds(ttl_secs as i64),
            folder_accounts,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stored snapshot when it is unexpired and intact.
    ///
    /// `None` means the caller must rebuild: no entry, an expired entry, a
    /// checksum mismatch, or `force_refresh`.
    pub async fn get(
        &self,
        manager_id: Uuid,
        force_refresh: bool,
    ) -> Result<Option<CachedStructure>, AppError> {
        if force_refresh {
            tracing::debug!("Structure cache bypassed for manager {}", manager_id);
            return Ok(None);
        }

        let Some(entry) = self.store.get_structure(manager_id).await? else {
            return Ok(None);
        };

        if entry.expires_at <= Utc::now() {
            tracing::debug!("Structure cache expired for manager {}", manager_id);
            return Ok(None);
        }

        if !cache_validator::is_valid(&entry) {
            return Ok(None);
        }

        Ok(CachedStructure::from_entry(entry))
    }

    /// Stores a snapshot that expires one TTL from now.
    pub async fn put(
        &self,
        manager_id: Uuid,
        folders: &[ClientAccount],
        accounts: &[ClientAccount],
        total_accounts: i32,
        total_folders: i32,
    ) -> Result<StructureCacheEntry, AppError> {
        let folders = serde_json::to_value(folders)?;
        let accounts = serde_json::to_value(accounts)?;
        let now = Utc::now();
        let entry = StructureCacheEntry {
            manager_account_id: manager_id,
            checksum: cache_validator::snapshot_checksum(&folders, &accounts),
            folders,
            accounts,
            total_accounts,
            total_folders,
            cached_at: now,
            expires_at: now + self.ttl,
        };
        self.store.put_structure(&entry).await?;
        Ok(entry)
    }

    /// Read-through listing: the cached snapshot when usable, else a rebuild
    /// from the remote hierarchy.
    ///
    /// Rebuilds are generation-stamped per manager. A rebuild that finishes
    /// after a newer one has started returns its data to its own caller but
    /// does not overwrite the snapshot.
    pub async fn load(
        &self,
        manager: &ManagerAccount,
        force_refresh: bool,
    ) -> Result<CachedStructure, AppError> {
        if let Some(cached) = self.get(manager.id, force_refresh).await? {
            tracing::debug!("✓ Structure cache hit for manager {}", manager.name);
            return Ok(cached);
        }

        let generation = self.begin_rebuild(manager.id);
        let mcc_id = manager.customer_id();

        let session = self.client.open_session(manager, &self.oauth_defaults).await?;
        tracing::info!("Fetching account hierarchy for MCC {}", mcc_id);
        let rows = self
            .client
            .query_all_pages(&session, &mcc_id, HIERARCHY_QUERY, None)
            .await?;

        let clients: Vec<ClientAccount> = rows
            .iter()
            .filter_map(|row| row.customer_client.as_ref())
            .map(ClientAccount::from)
            .collect();

        let ours: HashSet<String> = self
            .store
            .list_sub_accounts(manager.id)
            .await?
            .iter()
            .map(|s| normalize_customer_id(&s.customer_id))
            .collect();

        let (folders, accounts) = split_hierarchy(&mcc_id, clients, &ours);
        tracing::info!(
            "✓ Found {} folders, {} accounts under MCC {}",
            folders.len(),
            accounts.len(),
            mcc_id
        );

        let total_accounts = accounts.len() as i32;
        let total_folders = folders.len() as i32;
        let now = Utc::now();
        let mut structure = CachedStructure {
            manager_account_id: manager.id,
            folders,
            accounts,
            total_accounts,
            total_folders,
            cached_at: now,
            expires_at: now + self.ttl,
            from_cache: false,
        };

        if self.is_latest(manager.id, generation) {
            let entry = self
                .put(
                    manager.id,
                    &structure.folders,
                    &structure.accounts,
                    total_accounts,
                    total_folders,
                )
                .await?;
            structure.cached_at = entry.cached_at;
            structure.expires_at = entry.expires_at;
        } else {
            tracing::debug!(
                "Discarding stale structure rebuild for manager {} (generation {})",
                manager.id,
                generation
            );
        }

        Ok(structure)
    }

    /// Leaf accounts under one folder, queried with the manager as login context.
    ///
    /// A permission denial on the folder yields an empty list. Results are
    /// memoized for the session, empty ones included.
    pub async fn resolve_folder_accounts(
        &self,
        manager: &ManagerAccount,
        folder_id: &str,
    ) -> Result<Vec<ClientAccount>, AppError> {
        let folder_id = normalize_customer_id(folder_id);
        let key = (manager.id, folder_id.clone());

        if let Some(cached) = self.folder_accounts.get(&key).await {
            tracing::debug!("✓ Folder {} served from session cache", folder_id);
            return Ok(cached.as_ref().clone());
        }

        let session = self.client.open_session(manager, &self.oauth_defaults).await?;
        let accounts = match self
            .client
            .query_all_pages(&session, &folder_id, LEAF_ACCOUNTS_QUERY, None)
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.customer_client.as_ref())
                .filter(|c| !c.manager)
                .map(ClientAccount::from)
                .collect::<Vec<_>>(),
            Err(e) if e.remote_status() == Some(FORBIDDEN) => {
                tracing::warn!(
                    "No permission to list folder {} under MCC {}, treating as empty",
                    folder_id,
                    manager.customer_id()
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        self.folder_accounts
            .insert(key, Arc::new(accounts.clone()))
            .await;
        Ok(accounts)
    }

    fn begin_rebuild(&self, manager_id: Uuid) -> u64 {
        match self.generations.lock() {
            Ok(mut generations) => {
                let generation = generations.entry(manager_id).or_insert(0);
                *generation += 1;
                *generation
            }
            Err(_) => 0,
        }
    }

    fn is_latest(&self, manager_id: Uuid, generation: u64) -> bool {
        match self.generations.lock() {
            Ok(generations) => generations.get(&manager_id).copied().unwrap_or(0) == generation,
            Err(_) => true,
        }
    }
}
