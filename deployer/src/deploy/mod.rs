//! Deployment pipeline

pub mod fsm;
pub mod launcher;
pub mod provisioner;
pub mod readiness;
pub mod reconciler;
