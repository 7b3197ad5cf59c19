//! Data models

pub mod health;
pub mod preset;
pub mod record;
