//! Infrastructure provisioning backends

pub mod backend;
pub mod lambda;
