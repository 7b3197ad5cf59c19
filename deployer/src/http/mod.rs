//! HTTP: provider API client and service health probes

pub mod client;
pub mod health;
