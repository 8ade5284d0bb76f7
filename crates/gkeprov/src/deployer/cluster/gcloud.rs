use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::deployer::DeployResult;
use crate::deployer::cluster::{
    ClusterCreation, ClusterHandler, ClusterRequest, FirewallRule, HandlerFuture, Subnetwork,
};
use crate::deployer::config::WINDOWS_NODE_POOL_NAME;
use crate::deployer::options::{CONTAINER_ENDPOINT_ENV, ClusterSpec, PrivateClusterAccessLevel};

const GCLOUD: &str = "gcloud";
const PODS_RANGE_NAME: &str = "pods";
const SERVICES_RANGE_NAME: &str = "services";

/// Creates clusters through the `gcloud` CLI.
pub struct GcloudHandler {
    spec: ClusterSpec,
}

impl GcloudHandler {
    pub fn new(spec: ClusterSpec) -> Self {
        Self { spec }
    }
}

impl ClusterHandler for GcloudHandler {
    fn create_cluster(&mut self, request: &ClusterRequest) -> HandlerFuture<ClusterCreation> {
        let spec = self.spec.clone();
        let request = request.clone();

        Box::pin(async move {
            if let Some(args) = build_subnetwork_args(&spec, &request) {
                run_gcloud(&spec, args)
                    .await
                    .with_context(|| format!("Cannot create subnetwork for cluster {}", request.name))?;
            }

            let args = build_create_args(&spec, &request)?;
            run_gcloud(&spec, args)
                .await
                .with_context(|| format!("Cannot create cluster {}", request.name))?;

            if let Some(args) = build_windows_pool_args(&spec, &request) {
                run_gcloud(&spec, args).await.with_context(|| {
                    format!("Cannot create Windows node pool of cluster {}", request.name)
                })?;
            }

            let args = build_describe_args(&request.project, &request.name, &request.location);
            let output = run_gcloud(&spec, args)
                .await
                .with_context(|| format!("Cannot describe cluster {}", request.name))?;
            Ok(ClusterCreation {
                instance_group_urls: parse_instance_group_urls(&output),
            })
        })
    }

    fn delete_cluster(&self, project: &str, name: &str, location: &str) -> HandlerFuture<()> {
        let spec = self.spec.clone();
        let args = to_args(&[
            "container",
            "clusters",
            "delete",
            name,
            &format!("--project={project}"),
            location,
            "--quiet",
        ]);
        Box::pin(async move {
            run_gcloud(&spec, args).await?;
            Ok(())
        })
    }

    fn create_firewall_rule(&self, rule: &FirewallRule) -> HandlerFuture<()> {
        let spec = self.spec.clone();
        let args = build_firewall_rule_args(rule);
        Box::pin(async move {
            run_gcloud(&spec, args).await?;
            Ok(())
        })
    }

    fn delete_firewall_rule(&self, project: &str, name: &str) -> HandlerFuture<()> {
        let spec = self.spec.clone();
        let args = to_args(&[
            "compute",
            "firewall-rules",
            "delete",
            name,
            &format!("--project={project}"),
            "--quiet",
        ]);
        Box::pin(async move {
            run_gcloud(&spec, args).await?;
            Ok(())
        })
    }

    fn delete_subnetwork(&self, subnetwork: &Subnetwork) -> HandlerFuture<()> {
        let spec = self.spec.clone();
        let args = build_delete_subnetwork_args(subnetwork);
        Box::pin(async move {
            run_gcloud(&spec, args).await?;
            Ok(())
        })
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

pub fn build_subnetwork_args(spec: &ClusterSpec, request: &ClusterRequest) -> Option<Vec<String>> {
    let ranges = request.subnetwork_ranges.as_ref()?;
    let subnetwork = request.subnetwork()?;
    Some(to_args(&[
        "compute",
        "networks",
        "subnets",
        "create",
        &subnetwork.name,
        &format!("--project={}", subnetwork.project),
        &format!("--region={}", subnetwork.region),
        &format!("--network={}", spec.network),
        &format!("--range={}", ranges.node),
        &format!(
            "--secondary-range={PODS_RANGE_NAME}={},{SERVICES_RANGE_NAME}={}",
            ranges.pods, ranges.services
        ),
    ]))
}

pub fn build_delete_subnetwork_args(subnetwork: &Subnetwork) -> Vec<String> {
    to_args(&[
        "compute",
        "networks",
        "subnets",
        "delete",
        &subnetwork.name,
        &format!("--project={}", subnetwork.project),
        &format!("--region={}", subnetwork.region),
        "--quiet",
    ])
}

pub fn build_create_args(spec: &ClusterSpec, request: &ClusterRequest) -> DeployResult<Vec<String>> {
    let mut args = to_args(&[
        "container",
        "clusters",
        "create",
        &request.name,
        &format!("--project={}", request.project),
        &request.location,
        &format!("--machine-type={}", spec.node_pool.machine_type),
        &format!("--num-nodes={}", spec.node_pool.nodes),
        &format!("--image-type={}", spec.image),
        &format!("--network={}", spec.network),
        "--quiet",
    ]);
    if let Some(version) = &spec.version {
        args.push(format!("--cluster-version={version}"));
    }

    // Windows node pools need VPC-native networking
    let mut ip_alias = spec.windows_pool.is_some();
    if let Some(subnetwork) = request.subnetwork() {
        ip_alias = true;
        args.push(format!("--subnetwork={}", subnetwork.name));
        args.push(format!("--cluster-secondary-range-name={PODS_RANGE_NAME}"));
        args.push(format!("--services-secondary-range-name={SERVICES_RANGE_NAME}"));
    }
    if let Some(access_level) = spec.private_cluster_access_level {
        let Some(range) = &request.master_ip_range else {
            anyhow::bail!(
                "Private cluster {} needs a master IP range for attempt {}",
                request.name,
                request.attempt
            );
        };
        ip_alias = true;
        args.push("--enable-private-nodes".to_string());
        args.push(format!("--master-ipv4-cidr={range}"));
        match access_level {
            PrivateClusterAccessLevel::No => {
                args.push("--enable-master-authorized-networks".to_string());
                args.push("--enable-private-endpoint".to_string());
            }
            PrivateClusterAccessLevel::Limited => {
                args.push("--enable-master-authorized-networks".to_string());
            }
            PrivateClusterAccessLevel::Unrestricted => {
                args.push("--no-enable-master-authorized-networks".to_string());
            }
        }
    }
    if ip_alias {
        args.push("--enable-ip-alias".to_string());
    }
    args.extend(spec.create_args.iter().cloned());
    Ok(args)
}

pub fn build_windows_pool_args(spec: &ClusterSpec, request: &ClusterRequest) -> Option<Vec<String>> {
    let pool = spec.windows_pool.as_ref()?;
    Some(to_args(&[
        "container",
        "node-pools",
        "create",
        WINDOWS_NODE_POOL_NAME,
        &format!("--cluster={}", request.name),
        &format!("--project={}", request.project),
        &request.location,
        &format!("--image-type={}", spec.windows_image),
        &format!("--machine-type={}", pool.machine_type),
        &format!("--num-nodes={}", pool.nodes),
        "--quiet",
    ]))
}

pub fn build_describe_args(project: &str, name: &str, location: &str) -> Vec<String> {
    to_args(&[
        "container",
        "clusters",
        "describe",
        name,
        &format!("--project={project}"),
        location,
        "--format=value(instanceGroupUrls)",
    ])
}

pub fn build_firewall_rule_args(rule: &FirewallRule) -> Vec<String> {
    to_args(&[
        "compute",
        "firewall-rules",
        "create",
        &rule.name,
        &format!("--project={}", rule.project),
        &format!("--network={}", rule.network),
        &format!("--allow={}", rule.allow),
        &format!("--target-tags={}", rule.target_tag),
    ])
}

/// `gcloud` prints lists in the `value` format separated by semicolons.
pub fn parse_instance_group_urls(output: &str) -> Vec<String> {
    output
        .split(|c: char| c == ';' || c.is_whitespace())
        .filter(|url| !url.is_empty())
        .map(|url| url.to_string())
        .collect()
}

fn create_command(arguments: &[String], spec: &ClusterSpec) -> Command {
    let mut command = Command::new(GCLOUD);
    command.args(arguments);
    command.env(CONTAINER_ENDPOINT_ENV, spec.environment.container_endpoint());
    command.kill_on_drop(true);
    command
}

fn check_command_output(output: Output) -> DeployResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs `gcloud` with the given arguments and returns its standard output.
async fn run_gcloud(spec: &ClusterSpec, arguments: Vec<String>) -> DeployResult<String> {
    log::debug!("Running command `{GCLOUD} {}`", arguments.join(" "));
    let output = create_command(&arguments, spec)
        .output()
        .await
        .with_context(|| format!("{GCLOUD} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{GCLOUD} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {GCLOUD} output: {:?}", e))?;
    Ok(stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::{
        build_create_args, build_delete_subnetwork_args, build_describe_args,
        build_firewall_rule_args, build_subnetwork_args, build_windows_pool_args,
        parse_instance_group_urls,
    };
    use crate::deployer::cluster::{ClusterRequest, FirewallRule};
    use crate::deployer::options::{ClusterSpec, NodePool, PrivateClusterAccessLevel};

    fn request() -> ClusterRequest {
        ClusterRequest {
            project: "project-1".to_string(),
            name: "kt2-1234abcd-0".to_string(),
            index: 0,
            attempt: 1,
            location: "--zone=us-east1-b".to_string(),
            region: "us-east1".to_string(),
            subnetwork_ranges: None,
            master_ip_range: None,
        }
    }

    fn has(args: &[String], arg: &str) -> bool {
        args.iter().any(|a| a == arg)
    }

    #[test]
    fn create_public_cluster() {
        let args = build_create_args(&ClusterSpec::default(), &request()).unwrap();
        assert_eq!(&args[..4], &["container", "clusters", "create", "kt2-1234abcd-0"]);
        assert!(has(&args, "--project=project-1"));
        assert!(has(&args, "--zone=us-east1-b"));
        assert!(has(&args, "--num-nodes=3"));
        assert!(has(&args, "--machine-type=n1-standard-2"));
        assert!(has(&args, "--image-type=cos"));
        assert!(!has(&args, "--enable-ip-alias"));
        assert!(!has(&args, "--enable-private-nodes"));
        assert!(!args.iter().any(|a| a.starts_with("--cluster-version")));
    }

    #[test]
    fn create_private_cluster() {
        let spec = ClusterSpec {
            private_cluster_access_level: Some(PrivateClusterAccessLevel::Limited),
            ..Default::default()
        };
        let mut request = request();
        request.master_ip_range = Some("172.16.0.32/28".to_string());
        let args = build_create_args(&spec, &request).unwrap();
        assert!(has(&args, "--enable-private-nodes"));
        assert!(has(&args, "--master-ipv4-cidr=172.16.0.32/28"));
        assert!(has(&args, "--enable-master-authorized-networks"));
        assert!(!has(&args, "--enable-private-endpoint"));
        assert!(has(&args, "--enable-ip-alias"));
    }

    #[test]
    fn private_cluster_without_public_endpoint() {
        let spec = ClusterSpec {
            private_cluster_access_level: Some(PrivateClusterAccessLevel::No),
            ..Default::default()
        };
        let mut request = request();
        request.master_ip_range = Some("172.16.0.32/28".to_string());
        let args = build_create_args(&spec, &request).unwrap();
        assert!(has(&args, "--enable-private-nodes"));
        assert!(has(&args, "--master-ipv4-cidr=172.16.0.32/28"));
        assert!(has(&args, "--enable-master-authorized-networks"));
        assert!(has(&args, "--enable-private-endpoint"));
    }

    #[test]
    fn private_cluster_with_unrestricted_endpoint() {
        let spec = ClusterSpec {
            private_cluster_access_level: Some(PrivateClusterAccessLevel::Unrestricted),
            ..Default::default()
        };
        let mut request = request();
        request.master_ip_range = Some("172.16.0.32/28".to_string());
        let args = build_create_args(&spec, &request).unwrap();
        assert!(has(&args, "--enable-private-nodes"));
        assert!(has(&args, "--no-enable-master-authorized-networks"));
        assert!(!has(&args, "--enable-private-endpoint"));
    }

    #[test]
    fn private_cluster_without_master_range() {
        let spec = ClusterSpec {
            private_cluster_access_level: Some(PrivateClusterAccessLevel::No),
            ..Default::default()
        };
        assert!(build_create_args(&spec, &request()).is_err());
    }

    #[test]
    fn create_cluster_in_subnetwork() {
        let spec = ClusterSpec {
            version: Some("1.30".to_string()),
            create_args: vec!["--enable-autoupgrade".to_string()],
            ..Default::default()
        };
        let mut request = request();
        let ranges = "10.0.4.0/22 10.0.32.0/20 10.4.0.0/14".parse().unwrap();
        request.subnetwork_ranges = Some(ranges);

        let args = build_create_args(&spec, &request).unwrap();
        assert!(has(&args, "--subnetwork=kt2-1234abcd-0-subnet-1"));
        assert!(has(&args, "--cluster-version=1.30"));
        assert!(has(&args, "--enable-ip-alias"));
        assert_eq!(args.last().unwrap(), "--enable-autoupgrade");

        let args = build_subnetwork_args(&spec, &request).unwrap();
        assert_eq!(&args[..5], &["compute", "networks", "subnets", "create", "kt2-1234abcd-0-subnet-1"]);
        assert!(has(&args, "--region=us-east1"));
        assert!(has(&args, "--range=10.0.4.0/22"));
        assert!(has(
            &args,
            "--secondary-range=pods=10.0.32.0/20,services=10.4.0.0/14"
        ));

        let args = build_delete_subnetwork_args(&request.subnetwork().unwrap());
        assert_eq!(&args[..5], &["compute", "networks", "subnets", "delete", "kt2-1234abcd-0-subnet-1"]);
        assert!(has(&args, "--project=project-1"));
        assert!(has(&args, "--region=us-east1"));
        assert!(has(&args, "--quiet"));
    }

    #[test]
    fn no_subnetwork_without_ranges() {
        assert!(build_subnetwork_args(&ClusterSpec::default(), &request()).is_none());
        let args = build_create_args(&ClusterSpec::default(), &request()).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--subnetwork")));
    }

    #[test]
    fn windows_node_pool() {
        assert!(build_windows_pool_args(&ClusterSpec::default(), &request()).is_none());

        let spec = ClusterSpec {
            windows_pool: Some(NodePool::windows()),
            ..Default::default()
        };
        let args = build_windows_pool_args(&spec, &request()).unwrap();
        assert_eq!(&args[..4], &["container", "node-pools", "create", "windows-pool"]);
        assert!(has(&args, "--cluster=kt2-1234abcd-0"));
        assert!(has(&args, "--image-type=WINDOWS_LTSC"));
        assert!(has(&args, "--num-nodes=1"));
        assert!(has(
            &build_create_args(&spec, &request()).unwrap(),
            "--enable-ip-alias"
        ));
    }

    #[test]
    fn describe_instance_groups() {
        let args = build_describe_args("p", "c", "--region=us-central1");
        assert!(has(&args, "--format=value(instanceGroupUrls)"));
        assert!(has(&args, "--region=us-central1"));
    }

    #[test]
    fn firewall_rule_args() {
        let rule = FirewallRule {
            project: "p".to_string(),
            name: "e2e-ports-90fcb815".to_string(),
            network: "default".to_string(),
            allow: "tcp:22".to_string(),
            target_tag: "gke-c-90fcb815-node".to_string(),
        };
        let args = build_firewall_rule_args(&rule);
        assert!(has(&args, "e2e-ports-90fcb815"));
        assert!(has(&args, "--allow=tcp:22"));
        assert!(has(&args, "--target-tags=gke-c-90fcb815-node"));
    }

    #[test]
    fn parse_describe_output() {
        let urls = parse_instance_group_urls(
            "https://a/zones/z1/instanceGroupManagers/g1;https://a/zones/z2/instanceGroupManagers/g2\n",
        );
        assert_eq!(
            urls,
            vec![
                "https://a/zones/z1/instanceGroupManagers/g1",
                "https://a/zones/z2/instanceGroupManagers/g2"
            ]
        );
        assert!(parse_instance_group_urls("").is_empty());
    }
}
