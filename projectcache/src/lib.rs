//! Project config cache for the ingestion path.
//!
//! [`ProjectCache`] answers "is this project configured and admitted" from
//! memory and keeps the configs fresh in the background. Configs are resolved
//! from local override files, a shared cache, and the upstream, in that order.

pub mod admission;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod metrics_defs;
pub mod overrides;
pub mod service;
pub mod shared_cache;
pub mod types;
pub mod upstream;

#[cfg(test)]
mod testutils;

pub use service::{ProjectCache, ServiceError};
