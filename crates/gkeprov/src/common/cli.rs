use std::path::PathBuf;

use clap::Parser;

use crate::common::timeutils::ArgDuration;
use crate::deployer::config::{
    DEFAULT_BOSKOS_LOCATION, DEFAULT_BOSKOS_RESOURCE_TYPE, DEFAULT_ENVIRONMENT, DEFAULT_IMAGE,
    DEFAULT_MACHINE_TYPE, DEFAULT_NETWORK, DEFAULT_NODE_COUNT, DEFAULT_WINDOWS_IMAGE,
    DEFAULT_WINDOWS_NODE_COUNT, GCE_STOCKOUT_ERROR_PATTERN,
};
use crate::deployer::lease::HeartbeatPolicy;
use crate::deployer::options::{
    BrokerOptions, ClusterSpec, Environment, NodePool, PrivateClusterAccessLevel, UpOptions,
};
use crate::deployer::retry::SubnetworkRanges;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        env = "GKEPROV_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GKEPROV_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[allow(clippy::large_enum_variant)]
#[derive(Parser)]
pub enum SubCommand {
    /// Provision clusters, optionally run a test command and tear everything down
    Up(UpOpts),
    /// Check zone/region flags and print the location of every attempt
    CheckLocation(LocationOpts),
}

#[derive(Parser)]
pub struct LocationOpts {
    /// Zones that are tried in the given order
    #[arg(long = "zone", value_delimiter(','))]
    pub zones: Vec<String>,

    /// Regions that are tried in the given order
    #[arg(long = "region", value_delimiter(','))]
    pub regions: Vec<String>,
}

#[derive(Parser)]
pub struct BoskosOpts {
    /// URL of the Boskos server
    #[arg(long, env = "GKEPROV_BOSKOS_LOCATION", default_value = DEFAULT_BOSKOS_LOCATION)]
    pub boskos_location: String,

    /// Type of the resources leased from Boskos
    #[arg(
        long,
        env = "GKEPROV_BOSKOS_RESOURCE_TYPE",
        default_value = DEFAULT_BOSKOS_RESOURCE_TYPE
    )]
    pub boskos_resource_type: String,

    /// Owner reported to Boskos [default: host name]
    #[arg(long, env = "GKEPROV_BOSKOS_OWNER")]
    pub boskos_owner: Option<String>,

    /// How long to wait for a free project
    #[arg(long, env = "GKEPROV_BOSKOS_ACQUIRE_TIMEOUT", default_value = "5m")]
    pub boskos_acquire_timeout: ArgDuration,

    /// Interval between two lease renewals
    #[arg(long, env = "GKEPROV_BOSKOS_HEARTBEAT_INTERVAL", default_value = "5m")]
    pub boskos_heartbeat_interval: ArgDuration,

    /// Number of projects leased from Boskos
    #[arg(long, default_value_t = 1)]
    pub projects_requested: usize,

    /// Stop creating clusters after this many failed lease renewals in a row
    #[arg(long)]
    pub heartbeat_max_failures: Option<u32>,
}

#[derive(Parser)]
pub struct UpOpts {
    #[clap(flatten)]
    pub location: LocationOpts,

    #[clap(flatten)]
    pub boskos: BoskosOpts,

    /// Projects to use instead of leasing them from Boskos
    #[arg(long = "project", value_delimiter(','))]
    pub projects: Vec<String>,

    /// Names of the clusters. With several projects, use `<name>:<project index>`
    #[arg(long = "cluster-name", value_delimiter(','))]
    pub cluster_names: Vec<String>,

    /// Number of clusters with generated names, used when no cluster name is given
    #[arg(long, default_value_t = 1)]
    pub num_clusters: usize,

    /// Number of nodes of the Linux node pool
    #[arg(long, default_value_t = DEFAULT_NODE_COUNT)]
    pub num_nodes: u32,

    /// Machine type of the Linux node pool
    #[arg(long, default_value = DEFAULT_MACHINE_TYPE)]
    pub machine_type: String,

    /// Image type of the Linux node pool
    #[arg(long, default_value = DEFAULT_IMAGE)]
    pub image_type: String,

    /// GKE version of the clusters [default: GKE default version]
    #[arg(long)]
    pub cluster_version: Option<String>,

    /// Adds a Windows node pool to every cluster
    #[arg(long)]
    pub windows_enabled: bool,

    /// Number of nodes of the Windows node pool
    #[arg(long, default_value_t = DEFAULT_WINDOWS_NODE_COUNT)]
    pub windows_num_nodes: u32,

    /// Machine type of the Windows node pool
    #[arg(long, default_value = DEFAULT_MACHINE_TYPE)]
    pub windows_machine_type: String,

    /// Image type of the Windows node pool
    #[arg(long, default_value = DEFAULT_WINDOWS_IMAGE)]
    pub windows_image_type: String,

    /// Network of the clusters
    #[arg(long, default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// GKE API environment (prod, staging, test or an endpoint URL)
    #[arg(long, default_value = DEFAULT_ENVIRONMENT)]
    pub environment: Environment,

    /// Creates private clusters with the given control plane access, public clusters are
    /// created when unset
    #[arg(long, value_enum)]
    pub private_cluster_access_level: Option<PrivateClusterAccessLevel>,

    /// Control plane IP ranges of private clusters for a single attempt, one range per cluster
    /// separated by spaces. Repeat the flag for further attempts.
    #[arg(long = "private-cluster-master-ip-range")]
    pub master_ip_ranges: Vec<String>,

    /// Subnetwork ranges `<node> <pods> <services>` for a single attempt.
    /// Repeat the flag for further attempts.
    #[arg(long = "subnetwork-ranges")]
    pub subnetwork_ranges: Vec<SubnetworkRanges>,

    /// Regular expressions of errors that are retried in the next location
    /// [default: GCE stockout error]
    #[arg(long = "retryable-error-pattern")]
    pub retryable_error_patterns: Vec<String>,

    /// Maximum number of attempts per cluster [default: number of locations]
    #[arg(long)]
    pub try_count: Option<usize>,

    /// Additional arguments of `gcloud container clusters create`, separated by spaces
    #[arg(long, allow_hyphen_values(true))]
    pub create_args: Option<String>,

    /// Writes a JSON description of the created clusters into this file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub topology_file: Option<PathBuf>,

    /// Deletes the clusters and firewall rules before exiting
    #[arg(long)]
    pub down: bool,

    /// Command executed after the clusters are created, while the projects are still leased
    #[arg(last(true))]
    pub test_command: Vec<String>,
}

/// Part of the `up` command that is not related to provisioning.
pub struct RunOpts {
    pub topology_file: Option<PathBuf>,
    pub down: bool,
    pub test_command: Vec<String>,
}

impl UpOpts {
    pub fn into_options(self) -> (UpOptions, RunOpts) {
        let UpOpts {
            location,
            boskos,
            projects,
            cluster_names,
            num_clusters,
            num_nodes,
            machine_type,
            image_type,
            cluster_version,
            windows_enabled,
            windows_num_nodes,
            windows_machine_type,
            windows_image_type,
            network,
            environment,
            private_cluster_access_level,
            master_ip_ranges,
            subnetwork_ranges,
            retryable_error_patterns,
            try_count,
            create_args,
            topology_file,
            down,
            test_command,
        } = self;

        let retryable_error_patterns = if retryable_error_patterns.is_empty() {
            vec![GCE_STOCKOUT_ERROR_PATTERN.to_string()]
        } else {
            retryable_error_patterns
        };
        let options = UpOptions {
            zones: location.zones,
            regions: location.regions,
            projects,
            cluster_names,
            cluster_count: num_clusters,
            cluster: ClusterSpec {
                node_pool: NodePool {
                    nodes: num_nodes,
                    machine_type,
                },
                windows_pool: windows_enabled.then_some(NodePool {
                    nodes: windows_num_nodes,
                    machine_type: windows_machine_type,
                }),
                image: image_type,
                windows_image: windows_image_type,
                version: cluster_version,
                network,
                environment,
                private_cluster_access_level,
                create_args: create_args
                    .map(|args| args.split_whitespace().map(|a| a.to_string()).collect())
                    .unwrap_or_default(),
            },
            retryable_error_patterns,
            try_count,
            subnetwork_ranges,
            master_ip_ranges: master_ip_ranges
                .iter()
                .map(|ranges| ranges.split_whitespace().map(|r| r.to_string()).collect())
                .collect(),
            broker: BrokerOptions {
                url: boskos.boskos_location,
                resource_type: boskos.boskos_resource_type,
                owner: boskos.boskos_owner,
                acquire_timeout: boskos.boskos_acquire_timeout.unpack(),
                heartbeat_interval: boskos.boskos_heartbeat_interval.unpack(),
                project_count: boskos.projects_requested,
            },
            heartbeat_policy: HeartbeatPolicy {
                max_consecutive_failures: boskos.heartbeat_max_failures,
            },
        };
        let run = RunOpts {
            topology_file,
            down,
            test_command,
        };
        (options, run)
    }
}
