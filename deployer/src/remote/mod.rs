//! Command execution on remote hosts

pub mod exec;
pub mod ssh;
