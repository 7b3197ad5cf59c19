//! GPU cloud API models
//!
//! Wire types for the instances API consumed by the deployer. Only the
//! fields the deployer reads are modelled; unknown fields are ignored.

pub mod models;

pub use models::*;
