//! gpudeploy library
//!
//! Deploys containerized model servers onto rented GPU instances and keeps
//! one persisted, name-keyed record per deployment.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod infra;
pub mod logs;
pub mod models;
pub mod remote;
pub mod storage;
pub mod utils;
