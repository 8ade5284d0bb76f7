use std::future::Future;

use anyhow::Context;
use tokio::process::Command;

use crate::common::cli::RunOpts;
use crate::deployer::{ClusterOutcome, Deployer};

/// Environment variable with the projects of the run, passed to the test command.
pub const PROJECTS_ENV: &str = "GKEPROV_PROJECTS";

/// Provisions the clusters, runs the test command and optionally tears everything down.
///
/// When `abort` resolves first, the run is interrupted and its reason is returned as an error.
/// The leased projects are released on every path.
pub async fn run_until_aborted<A>(
    deployer: &mut Deployer,
    run: &RunOpts,
    abort: A,
) -> anyhow::Result<()>
where
    A: Future<Output = String>,
{
    let finished = tokio::select! {
        result = run_deployment(deployer, run) => Ok(result),
        reason = abort => Err(reason),
    };
    let result = match finished {
        Ok(result) => result,
        Err(reason) => {
            log::warn!("Received {reason}, stopping the run");
            if run.down {
                if let Err(error) = deployer.down().await {
                    log::error!("Cannot tear down clusters: {error:?}");
                }
            }
            Err(anyhow::anyhow!("Run was aborted by {reason}"))
        }
    };

    if let Err(error) = deployer.shutdown().await {
        log::error!("Cannot release leased projects: {error:?}");
    }
    result
}

async fn run_deployment(deployer: &mut Deployer, run: &RunOpts) -> anyhow::Result<()> {
    let report = deployer.up().await?;
    if let Some(path) = &run.topology_file {
        deployer
            .summary(&report)
            .write(path)
            .with_context(|| format!("Cannot write topology into {}", path.display()))?;
    }

    for cluster in report.failed_clusters() {
        if let ClusterOutcome::Exhausted { error, attempts } = &cluster.outcome {
            log::error!(
                "Cluster {} in project {} could not be created ({attempts} attempt(s)): {error:?}",
                cluster.name,
                cluster.project
            );
        }
    }
    let mut result = if report.is_success() {
        log::info!("All {} cluster(s) are ready", report.clusters.len());
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} of {} cluster(s) could not be provisioned, {} firewall rule(s) could not be created",
            report.failed_clusters().count(),
            report.clusters.len(),
            report.firewall_errors.len()
        ))
    };

    if result.is_ok() && !run.test_command.is_empty() {
        result = run_test_command(&run.test_command, &deployer.projects().join(",")).await;
    }
    if run.down {
        if let Err(error) = deployer.down().await {
            log::error!("Cannot tear down clusters: {error:?}");
            result = result.and(Err(error.into()));
        }
    }
    result
}

async fn run_test_command(arguments: &[String], projects: &str) -> anyhow::Result<()> {
    log::info!("Running test command `{}`", arguments.join(" "));
    let status = Command::new(&arguments[0])
        .args(&arguments[1..])
        .env(PROJECTS_ENV, projects)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("Cannot start test command `{}`", arguments[0]))?;
    if !status.success() {
        anyhow::bail!(
            "Test command has failed with exit code {}",
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::run_until_aborted;
    use crate::common::cli::RunOpts;
    use crate::deployer::{DeployResult, Deployer};
    use crate::deployer::cluster::{
        ClusterCreation, ClusterHandler, ClusterRequest, FirewallRule, HandlerFuture, Subnetwork,
    };
    use crate::deployer::lease::tests::TestBroker;
    use crate::deployer::options::UpOptions;

    /// Creates the first `successes` clusters, all further creations never finish.
    struct StallingHandler {
        successes: usize,
        deleted_clusters: Rc<RefCell<Vec<String>>>,
    }

    impl ClusterHandler for StallingHandler {
        fn create_cluster(&mut self, request: &ClusterRequest) -> HandlerFuture<ClusterCreation> {
            if self.successes == 0 {
                return Box::pin(std::future::pending::<DeployResult<ClusterCreation>>());
            }
            self.successes -= 1;
            let url = format!(
                "https://www.googleapis.com/compute/v1/projects/{}/zones/us-a/instanceGroupManagers/gke-{}-default-pool-0000abcd-grp",
                request.project, request.name
            );
            Box::pin(async move {
                Ok(ClusterCreation {
                    instance_group_urls: vec![url],
                })
            })
        }

        fn delete_cluster(&self, _project: &str, name: &str, _location: &str) -> HandlerFuture<()> {
            self.deleted_clusters.borrow_mut().push(name.to_string());
            Box::pin(async move { Ok(()) })
        }

        fn create_firewall_rule(&self, _rule: &FirewallRule) -> HandlerFuture<()> {
            Box::pin(async move { Ok(()) })
        }

        fn delete_firewall_rule(&self, _project: &str, _name: &str) -> HandlerFuture<()> {
            Box::pin(async move { Ok(()) })
        }

        fn delete_subnetwork(&self, _subnetwork: &Subnetwork) -> HandlerFuture<()> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn leased_deployer(
        broker: &TestBroker,
        successes: usize,
    ) -> (Deployer, Rc<RefCell<Vec<String>>>) {
        let mut options = UpOptions {
            zones: vec!["us-a".to_string()],
            cluster_names: vec!["c0".to_string(), "c1".to_string()],
            ..Default::default()
        };
        options.broker.heartbeat_interval = Duration::from_secs(10);
        options.broker.acquire_timeout = Duration::from_secs(30);
        let deleted_clusters = Rc::new(RefCell::new(vec![]));
        let handler = StallingHandler {
            successes,
            deleted_clusters: deleted_clusters.clone(),
        };
        let deployer = Deployer::new(options, Box::new(handler), Some(Arc::new(broker.clone())));
        (deployer, deleted_clusters)
    }

    fn run_opts(down: bool) -> RunOpts {
        RunOpts {
            topology_file: None,
            down,
            test_command: vec![],
        }
    }

    async fn signal_after(delay: Duration) -> String {
        tokio::time::sleep(delay).await;
        "SIGTERM".to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn abort_releases_leases() {
        let broker = TestBroker::with_projects(&["leased-1"]);
        let (mut deployer, _) = leased_deployer(&broker, 0);

        let result =
            run_until_aborted(&mut deployer, &run_opts(false), signal_after(Duration::from_secs(60)))
                .await;
        let error = result.unwrap_err();
        assert!(error.to_string().contains("SIGTERM"));
        assert_eq!(broker.released(), vec!["leased-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_tears_down_created_clusters() {
        let broker = TestBroker::with_projects(&["leased-1"]);
        let (mut deployer, deleted_clusters) = leased_deployer(&broker, 1);

        let result =
            run_until_aborted(&mut deployer, &run_opts(true), signal_after(Duration::from_secs(60)))
                .await;
        assert!(result.is_err());
        assert_eq!(*deleted_clusters.borrow(), vec!["c0"]);
        assert_eq!(broker.released(), vec!["leased-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_run_releases_leases() {
        let broker = TestBroker::with_projects(&["leased-1"]);
        let (mut deployer, deleted_clusters) = leased_deployer(&broker, 2);

        run_until_aborted(&mut deployer, &run_opts(true), std::future::pending::<String>())
            .await
            .unwrap();
        assert_eq!(*deleted_clusters.borrow(), vec!["c0", "c1"]);
        assert_eq!(broker.released(), vec!["leased-1"]);
    }
}
