use std::time::Duration;

use crate::common::timeutils::get_duration_from_env;

/// Ports opened by the firewall rule of each cluster, required by the e2e tests.
pub const E2E_ALLOW: &str = "tcp:22,tcp:80,tcp:8080,tcp:30000-32767,udp:30000-32767";

/// Error reported by GCE when a zone runs out of capacity.
pub const GCE_STOCKOUT_ERROR_PATTERN: &str =
    ".*does not have enough resources available to fulfill.*";

pub const DEFAULT_IMAGE: &str = "cos";
pub const DEFAULT_WINDOWS_IMAGE: &str = "WINDOWS_LTSC";
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-2";
pub const DEFAULT_NODE_COUNT: u32 = 3;
pub const DEFAULT_WINDOWS_NODE_COUNT: u32 = 1;
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_ENVIRONMENT: &str = "prod";

pub const DEFAULT_BOSKOS_LOCATION: &str = "http://boskos.test-pods.svc.cluster.local.";
pub const DEFAULT_BOSKOS_RESOURCE_TYPE: &str = "gke-project";
pub const DEFAULT_BOSKOS_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BOSKOS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Prefix of generated cluster names.
pub const CLUSTER_NAME_PREFIX: &str = "kt2";

/// Name of the Windows node pool added to clusters when Windows is enabled.
pub const WINDOWS_NODE_POOL_NAME: &str = "windows-pool";

/// How long to wait between two acquisition requests when the broker has no free resource.
pub fn get_acquire_poll_interval() -> Duration {
    get_duration_from_env("GKEPROV_ACQUIRE_POLL_INTERVAL_MS")
        .unwrap_or_else(|| Duration::from_secs(5))
}

/// Timeout of a single HTTP request sent to the broker.
pub fn get_broker_request_timeout() -> Duration {
    get_duration_from_env("GKEPROV_BROKER_REQUEST_TIMEOUT_MS")
        .unwrap_or_else(|| Duration::from_secs(30))
}
