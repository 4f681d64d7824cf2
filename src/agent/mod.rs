//! The cluster-wide controller agent and the per-node agents.
//!
//! Both agents are built on the same engine: a watch over the relevant
//! objects feeds one managing task per object key, and each managing task
//! dispatches the decoded annotation state to the handler registered for it,
//! retrying after a delay on internal failures.

pub mod controller;
pub mod node;

mod provisioning;
mod staging;

pub(crate) use provisioning::{
    run_provisioning_engine, ProvisioningContext, ProvisioningHandler,
};
pub(crate) use staging::{run_staging_engine, StagingContext, StagingHandler};
