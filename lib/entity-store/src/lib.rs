//! Entity attribution for telemetry.
//!
//! The entity store discovers who and what the host is (its EC2 identity, auto-scaling group, IAM role, and service
//! name tags) and which Kubernetes workloads talk to it, and turns that into the entity descriptors attached to
//! outgoing logs and metrics.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod aws;
pub mod config;
pub mod ec2;
pub mod eks;
pub mod entity;
pub mod handle;
pub mod metadata;
pub mod retry;
pub mod service;

mod store;
pub use self::store::{
    EntityStore, StoreError, StoreState, CROSS_ACCOUNT_CHECK_FAILURE_INTERVAL, CROSS_ACCOUNT_CHECK_SUCCESS_INTERVAL,
};

#[cfg(test)]
mod test_util;
