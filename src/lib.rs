//! MCC Console Library
//!
//! Back end of a console for operators who run several Google Ads manager
//! (MCC) accounts: connecting them over OAuth, caching their account tree,
//! syncing 30-day metrics and budgets, and provisioning sub-accounts.
//!
//! # Modules
//!
//! - `api`: HTTP layer.
//! - `core`: Domain services, models and errors.
//! - `integrations`: Google Ads client and wire models.
//! - `backoff`: Retry policy and injectable sleeping.
//! - `budgets`: Budget aggregation per manager.
//! - `cache_validator`: Structure snapshot checksums.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Postgres implementation of `Store`.
//! - `errors`: Error handling types.
//! - `google_ads_client`: Google Ads REST and OAuth client.
//! - `google_ads_models`: Google Ads wire types.
//! - `handlers`: HTTP request handlers.
//! - `metrics_math`: Currency and ratio derivations.
//! - `metrics_sync`: Metrics sync pipeline and scheduler.
//! - `models`: Persisted records and API views.
//! - `oauth`: Connect and disconnect flows.
//! - `provisioning`: Sub-account creation and invitations.
//! - `store`: Persistence trait.
//! - `structure_cache`: Account tree snapshots and folder lookups.
//! - `testing`: In-memory store and test doubles.

pub mod api;
pub mod core;
pub mod integrations;

pub mod backoff;
pub mod budgets;
pub mod cache_validator;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod google_ads_client;
pub mod google_ads_models;
pub mod handlers;
pub mod metrics_math;
pub mod metrics_sync;
pub mod models;
pub mod oauth;
pub mod provisioning;
pub mod store;
pub mod structure_cache;
pub mod testing;
