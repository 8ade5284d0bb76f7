pub mod gcloud;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::deployer::DeployResult;
use crate::deployer::config::E2E_ALLOW;
use crate::deployer::retry::SubnetworkRanges;
use crate::deployer::topology::InstanceGroupRecord;

pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = DeployResult<T>>>>;

/// A single attempt to create a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    pub project: String,
    pub name: String,
    /// Position of the cluster among all requested clusters of the run
    pub index: usize,
    pub attempt: usize,
    /// `--zone=<zone>` or `--region=<region>`
    pub location: String,
    /// Region that contains the location
    pub region: String,
    pub subnetwork_ranges: Option<SubnetworkRanges>,
    pub master_ip_range: Option<String>,
}

impl ClusterRequest {
    /// Subnetwork created for this attempt, if the attempt has its own ranges.
    pub fn subnetwork(&self) -> Option<Subnetwork> {
        self.subnetwork_ranges.as_ref().map(|_| Subnetwork {
            project: self.project.clone(),
            region: self.region.clone(),
            name: format!("{}-subnet-{}", self.name, self.attempt),
        })
    }
}

/// Subnetwork dedicated to a single creation attempt of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subnetwork {
    pub project: String,
    pub region: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ClusterCreation {
    pub instance_group_urls: Vec<String>,
}

/// Firewall rule that opens the ports used by e2e tests on the nodes of a single cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub project: String,
    pub name: String,
    pub network: String,
    pub allow: String,
    pub target_tag: String,
}

impl FirewallRule {
    pub fn for_cluster(
        project: &str,
        network: &str,
        cluster: &str,
        instance_group: &InstanceGroupRecord,
    ) -> Self {
        let hash = &instance_group.unique_hash;
        Self {
            project: project.to_string(),
            name: firewall_rule_name(hash),
            network: network.to_string(),
            allow: E2E_ALLOW.to_string(),
            target_tag: format!("gke-{cluster}-{hash}-node"),
        }
    }
}

pub fn firewall_rule_name(unique_hash: &str) -> String {
    format!("e2e-ports-{unique_hash}")
}

/// Handler that creates and deletes clusters and their firewall rules in some cloud provider.
pub trait ClusterHandler {
    /// Creates a cluster and returns the URLs of its instance groups.
    ///
    /// The returned error contains the output of the provider, which is used to decide if the
    /// creation can be retried at another location.
    fn create_cluster(&mut self, request: &ClusterRequest) -> HandlerFuture<ClusterCreation>;

    /// Removes a cluster, if it exists.
    fn delete_cluster(&self, project: &str, name: &str, location: &str) -> HandlerFuture<()>;

    fn create_firewall_rule(&self, rule: &FirewallRule) -> HandlerFuture<()>;

    fn delete_firewall_rule(&self, project: &str, name: &str) -> HandlerFuture<()>;

    /// Removes a subnetwork, the cluster that used it has to be deleted first.
    fn delete_subnetwork(&self, subnetwork: &Subnetwork) -> HandlerFuture<()>;
}

#[cfg(test)]
mod tests {
    use super::{ClusterRequest, FirewallRule, Subnetwork};
    use crate::deployer::topology::parse_instance_group_url;

    #[test]
    fn subnetwork_of_attempt() {
        let mut request = ClusterRequest {
            project: "p".to_string(),
            name: "c1".to_string(),
            index: 0,
            attempt: 2,
            location: "--zone=us-east1-b".to_string(),
            region: "us-east1".to_string(),
            subnetwork_ranges: None,
            master_ip_range: None,
        };
        assert_eq!(request.subnetwork(), None);

        request.subnetwork_ranges = Some("10.0.4.0/22 10.0.32.0/20 10.4.0.0/14".parse().unwrap());
        assert_eq!(
            request.subnetwork(),
            Some(Subnetwork {
                project: "p".to_string(),
                region: "us-east1".to_string(),
                name: "c1-subnet-2".to_string(),
            })
        );
    }

    #[test]
    fn firewall_rule_of_cluster() {
        let group = parse_instance_group_url(
            "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/instanceGroupManagers/gke-c1-default-pool-90fcb815-grp",
        )
        .unwrap();
        let rule = FirewallRule::for_cluster("p", "default", "c1", &group);
        assert_eq!(rule.name, "e2e-ports-90fcb815");
        assert_eq!(rule.target_tag, "gke-c1-90fcb815-node");
        assert_eq!(
            rule.allow,
            "tcp:22,tcp:80,tcp:8080,tcp:30000-32767,udp:30000-32767"
        );
    }
}
