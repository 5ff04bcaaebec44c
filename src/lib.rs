//! # kedi-sync
//!
//! Concurrent per-project fetch-and-reconcile engine behind the Kedi
//! dashboard: fans remote calls out over every project, merges the outcomes
//! into notification sections or webhook rows, and writes webhook
//! associations back into a shared project store.

pub mod config;
pub mod engine;
pub mod model;
pub mod notifications;
pub mod reconcile;
pub mod revenuecat;
pub mod store;
pub mod webhooks;
