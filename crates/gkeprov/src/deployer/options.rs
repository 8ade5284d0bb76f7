use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deployer::config::{
    DEFAULT_BOSKOS_ACQUIRE_TIMEOUT, DEFAULT_BOSKOS_HEARTBEAT_INTERVAL, DEFAULT_BOSKOS_LOCATION,
    DEFAULT_BOSKOS_RESOURCE_TYPE, DEFAULT_IMAGE, DEFAULT_MACHINE_TYPE, DEFAULT_NETWORK,
    DEFAULT_NODE_COUNT, DEFAULT_WINDOWS_IMAGE, DEFAULT_WINDOWS_NODE_COUNT,
    GCE_STOCKOUT_ERROR_PATTERN,
};
use crate::deployer::lease::HeartbeatPolicy;
use crate::deployer::retry::SubnetworkRanges;

/// Environment variable read by `gcloud` to override the GKE API endpoint.
pub const CONTAINER_ENDPOINT_ENV: &str = "CLOUDSDK_API_ENDPOINT_OVERRIDES_CONTAINER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub nodes: u32,
    pub machine_type: String,
}

impl NodePool {
    pub fn linux() -> Self {
        Self {
            nodes: DEFAULT_NODE_COUNT,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
        }
    }

    pub fn windows() -> Self {
        Self {
            nodes: DEFAULT_WINDOWS_NODE_COUNT,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
        }
    }
}

/// Reachability of the control plane of a private cluster.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivateClusterAccessLevel {
    /// Private nodes, the control plane has no public endpoint
    No,
    /// Private nodes, the control plane is reachable only from authorized networks
    Limited,
    /// Private nodes, the control plane is reachable from anywhere
    Unrestricted,
}

/// GKE API environment that the clusters are created in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    #[default]
    Prod,
    Staging,
    Test,
    /// Explicit endpoint URL
    Custom(String),
}

impl Environment {
    pub fn container_endpoint(&self) -> &str {
        match self {
            Environment::Prod => "https://container.googleapis.com/",
            Environment::Staging => "https://staging-container.sandbox.googleapis.com/",
            Environment::Test => "https://test-container.sandbox.googleapis.com/",
            Environment::Custom(url) => url,
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "prod" => Environment::Prod,
            "staging" => Environment::Staging,
            "test" => Environment::Test,
            url if url.starts_with("https://") || url.starts_with("http://") => {
                Environment::Custom(url.to_string())
            }
            _ => anyhow::bail!(
                "Invalid environment `{s}`, expected one of prod, staging, test or an endpoint URL"
            ),
        })
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Prod => f.write_str("prod"),
            Environment::Staging => f.write_str("staging"),
            Environment::Test => f.write_str("test"),
            Environment::Custom(url) => f.write_str(url),
        }
    }
}

/// Shape of every cluster created by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub node_pool: NodePool,
    /// Additional Windows node pool
    pub windows_pool: Option<NodePool>,
    pub image: String,
    pub windows_image: String,
    /// `None` uses the default version of GKE
    pub version: Option<String>,
    pub network: String,
    pub environment: Environment,
    /// `None` creates public clusters
    pub private_cluster_access_level: Option<PrivateClusterAccessLevel>,
    /// Additional arguments passed to `gcloud container clusters create`
    pub create_args: Vec<String>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            node_pool: NodePool::linux(),
            windows_pool: None,
            image: DEFAULT_IMAGE.to_string(),
            windows_image: DEFAULT_WINDOWS_IMAGE.to_string(),
            version: None,
            network: DEFAULT_NETWORK.to_string(),
            environment: Environment::Prod,
            private_cluster_access_level: None,
            create_args: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOptions {
    pub url: String,
    pub resource_type: String,
    /// Owner reported to the broker, the host name is used if unset
    pub owner: Option<String>,
    pub acquire_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Number of projects leased for the run
    pub project_count: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_BOSKOS_LOCATION.to_string(),
            resource_type: DEFAULT_BOSKOS_RESOURCE_TYPE.to_string(),
            owner: None,
            acquire_timeout: DEFAULT_BOSKOS_ACQUIRE_TIMEOUT,
            heartbeat_interval: DEFAULT_BOSKOS_HEARTBEAT_INTERVAL,
            project_count: 1,
        }
    }
}

/// Configuration of a single provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpOptions {
    pub zones: Vec<String>,
    pub regions: Vec<String>,
    /// Static projects; when empty, projects are leased from the broker
    pub projects: Vec<String>,
    /// Explicit cluster names; when empty, `cluster_count` names are generated
    pub cluster_names: Vec<String>,
    pub cluster_count: usize,
    pub cluster: ClusterSpec,
    pub retryable_error_patterns: Vec<String>,
    /// Maximum number of attempts per cluster, capped by the number of locations
    pub try_count: Option<usize>,
    /// Indexed by attempt
    pub subnetwork_ranges: Vec<SubnetworkRanges>,
    /// Indexed by attempt, then by cluster index
    pub master_ip_ranges: Vec<Vec<String>>,
    pub broker: BrokerOptions,
    pub heartbeat_policy: HeartbeatPolicy,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            zones: vec![],
            regions: vec![],
            projects: vec![],
            cluster_names: vec![],
            cluster_count: 1,
            cluster: ClusterSpec::default(),
            retryable_error_patterns: vec![GCE_STOCKOUT_ERROR_PATTERN.to_string()],
            try_count: None,
            subnetwork_ranges: vec![],
            master_ip_ranges: vec![],
            broker: BrokerOptions::default(),
            heartbeat_policy: HeartbeatPolicy::default(),
        }
    }
}

impl UpOptions {
    pub fn uses_broker(&self) -> bool {
        self.projects.is_empty()
    }
}
