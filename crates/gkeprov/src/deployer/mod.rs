//! This module provisions ephemeral GKE clusters for a test run.
//!
//! Projects are either given statically or leased from a shared resource broker (Boskos). Leased
//! projects are kept alive by a background heartbeat until the run releases them. Each requested
//! cluster is created by an external collaborator (`gcloud`), and when the creation fails with a
//! transient capacity error, it is retried in the next candidate zone/region. Successfully created
//! clusters and their instance groups are tracked in a topology registry, which is used to create
//! firewall rules and which is exported for the test steps that follow.
pub mod cluster;
pub mod config;
pub mod layout;
pub mod lease;
pub mod location;
pub mod options;
pub mod process;
pub mod retry;
pub mod run;
pub mod topology;

pub type DeployResult<T> = anyhow::Result<T>;

pub use process::{ClusterOutcome, Deployer, RunReport};
pub use topology::{ClusterRecord, InstanceGroupRecord, TopologyRegistry};
