use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::common::error::DeployerError;
use crate::deployer::cluster::{ClusterHandler, ClusterRequest, FirewallRule, Subnetwork};
use crate::deployer::layout::{
    PlannedCluster, ProjectClusters, build_project_clusters_layout, generate_cluster_names,
};
use crate::deployer::lease::{LeaseConfig, LeaseManager, ResourceBroker};
use crate::deployer::location::Locations;
use crate::deployer::options::UpOptions;
use crate::deployer::retry::{ErrorClassifier, RetryBudget, RetryState};
use crate::deployer::topology::{ClusterRecord, ProjectTopology, TopologyRegistry};
use crate::GKEPROV_VERSION;

#[derive(Debug)]
pub enum ClusterOutcome {
    Succeeded {
        record: ClusterRecord,
        /// Number of failed attempts before the successful one
        retries: usize,
    },
    /// No more attempts can be made, `error` is the error of the last attempt.
    Exhausted { error: anyhow::Error, attempts: usize },
}

impl ClusterOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClusterOutcome::Succeeded { .. })
    }
}

#[derive(Debug)]
pub struct ClusterReport {
    pub project: String,
    pub index: usize,
    pub name: String,
    pub outcome: ClusterOutcome,
}

/// Result of [`Deployer::up`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub clusters: Vec<ClusterReport>,
    pub firewall_errors: Vec<anyhow::Error>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.clusters.iter().all(|cluster| cluster.outcome.is_success())
            && self.firewall_errors.is_empty()
    }

    pub fn failed_clusters(&self) -> impl Iterator<Item = &ClusterReport> {
        self.clusters
            .iter()
            .filter(|cluster| !cluster.outcome.is_success())
    }
}

#[derive(Debug, Serialize)]
pub struct ClusterSummary {
    pub project: String,
    pub index: usize,
    pub name: String,
    pub succeeded: bool,
    pub location: Option<String>,
    pub attempts: usize,
    pub error: Option<String>,
}

/// Serializable description of a finished run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub version: &'static str,
    pub clusters: Vec<ClusterSummary>,
    pub topology: BTreeMap<String, ProjectTopology>,
    pub firewall_rules: Vec<FirewallRule>,
    pub firewall_errors: Vec<String>,
}

impl RunSummary {
    pub fn write(&self, path: &Path) -> crate::Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// State established once per run, before any cluster is created.
struct RunState {
    locations: Locations,
    retry: RetryState,
    layout: Vec<ProjectClusters>,
}

enum ProvisionState {
    Pending,
    Attempting(RetryBudget),
    Finished(ClusterOutcome),
}

/// Provisions the clusters of a single run.
pub struct Deployer {
    options: UpOptions,
    handler: Box<dyn ClusterHandler>,
    broker: Option<Arc<dyn ResourceBroker>>,
    leases: Option<LeaseManager>,
    run: Option<RunState>,
    registry: TopologyRegistry,
    firewall_rules: Vec<FirewallRule>,
    /// Subnetworks of successfully created clusters
    subnetworks: Vec<Subnetwork>,
    provisioned: bool,
    torn_down: bool,
}

impl Deployer {
    /// The broker is only used when `options` contain no static projects.
    pub fn new(
        options: UpOptions,
        handler: Box<dyn ClusterHandler>,
        broker: Option<Arc<dyn ResourceBroker>>,
    ) -> Self {
        Self {
            options,
            handler,
            broker,
            leases: None,
            run: None,
            registry: Default::default(),
            firewall_rules: Default::default(),
            subnetworks: Default::default(),
            provisioned: false,
            torn_down: false,
        }
    }

    pub fn options(&self) -> &UpOptions {
        &self.options
    }

    pub fn registry(&self) -> &TopologyRegistry {
        &self.registry
    }

    /// Projects used by the run. Empty before [`Deployer::init`] succeeds.
    pub fn projects(&self) -> Vec<&str> {
        self.run
            .as_ref()
            .map(|run| run.layout.iter().map(|p| p.project.as_str()).collect())
            .unwrap_or_default()
    }

    /// Validates the configuration, acquires projects and plans the clusters.
    ///
    /// Only the first successful call has an effect. When it fails, all leases taken so far are
    /// released.
    pub async fn init(&mut self) -> crate::Result<()> {
        if self.run.is_some() {
            return Ok(());
        }

        let locations = Locations::new(&self.options.regions, &self.options.zones)?;
        let classifier = ErrorClassifier::new(&self.options.retryable_error_patterns)
            .map_err(|error| DeployerError::Config(format!("{error:#}")))?;
        let cluster_count = if self.options.cluster_names.is_empty() {
            self.options.cluster_count
        } else {
            self.options.cluster_names.len()
        };
        let retry = RetryState::new(
            classifier,
            self.options.try_count,
            locations.len(),
            cluster_count,
            self.options.subnetwork_ranges.clone(),
            self.options.master_ip_ranges.clone(),
        )?;
        if self.options.cluster.private_cluster_access_level.is_some()
            && self.options.master_ip_ranges.is_empty()
        {
            return Err(DeployerError::Config(
                "private clusters need master IP ranges".to_string(),
            ));
        }

        let projects = self.acquire_projects().await?;
        let cluster_names = if self.options.cluster_names.is_empty() {
            generate_cluster_names(self.options.cluster_count, projects.len())
        } else {
            self.options.cluster_names.clone()
        };
        let layout = match build_project_clusters_layout(&projects, &cluster_names) {
            Ok(layout) => layout,
            Err(error) => {
                if let Err(error) = self.shutdown().await {
                    log::error!("Cannot release projects: {error:?}");
                }
                return Err(error);
            }
        };

        for project in &layout {
            let names: Vec<&str> = project.clusters.iter().map(|c| c.name.as_str()).collect();
            log::info!(
                "Project {} will contain cluster(s) {}",
                project.project,
                names.join(", ")
            );
        }
        self.run = Some(RunState {
            locations,
            retry,
            layout,
        });
        Ok(())
    }

    async fn acquire_projects(&mut self) -> crate::Result<Vec<String>> {
        if !self.options.uses_broker() {
            log::info!("Using project(s) {}", self.options.projects.join(", "));
            return Ok(self.options.projects.clone());
        }
        let Some(broker) = self.broker.clone() else {
            return Err(DeployerError::Config(
                "no project was given and no resource broker is configured".to_string(),
            ));
        };

        let broker_options = &self.options.broker;
        let mut leases = LeaseManager::new(
            broker,
            LeaseConfig::new(
                broker_options.heartbeat_interval,
                self.options.heartbeat_policy,
            ),
        );
        let mut projects = Vec::with_capacity(broker_options.project_count);
        for _ in 0..broker_options.project_count {
            match leases
                .acquire(&broker_options.resource_type, broker_options.acquire_timeout)
                .await
            {
                Ok(project) => projects.push(project.name().to_string()),
                Err(error) => {
                    if let Err(error) = leases.release().await {
                        log::error!("Cannot release projects: {error:?}");
                    }
                    return Err(error);
                }
            }
        }
        self.leases = Some(leases);
        Ok(projects)
    }

    /// Creates all planned clusters and the firewall rules of the successful ones.
    ///
    /// A cluster that cannot be created does not prevent the creation of the other clusters, the
    /// outcome of every cluster is returned in the report. Clusters are provisioned only once, a
    /// repeated call fails without touching any cluster.
    pub async fn up(&mut self) -> crate::Result<RunReport> {
        self.init().await?;
        if self.provisioned {
            return Err(DeployerError::AlreadyProvisioned);
        }
        let Some(run) = &self.run else {
            return crate::common::error::error("Deployer was not initialized".to_string());
        };
        self.provisioned = true;

        let mut report = RunReport::default();
        for project in &run.layout {
            for cluster in &project.clusters {
                let outcome = provision_cluster(
                    self.handler.as_mut(),
                    &mut self.registry,
                    &mut self.subnetworks,
                    run,
                    self.leases.as_ref(),
                    &project.project,
                    cluster,
                )
                .await;
                report.clusters.push(ClusterReport {
                    project: project.project.clone(),
                    index: cluster.index,
                    name: cluster.name.clone(),
                    outcome,
                });
            }
        }

        self.create_firewall_rules(&mut report).await;
        Ok(report)
    }

    async fn create_firewall_rules(&mut self, report: &mut RunReport) {
        for project in self.registry.projects() {
            for cluster in self.registry.clusters(project) {
                let Some(group) = self.registry.instance_groups(project, &cluster.name).first()
                else {
                    log::warn!(
                        "Cluster {} has no instance group, no firewall rule is created",
                        cluster.name
                    );
                    continue;
                };
                let rule = FirewallRule::for_cluster(
                    project,
                    &self.options.cluster.network,
                    &cluster.name,
                    group,
                );
                log::info!("Creating firewall rule {} in project {project}", rule.name);
                match self.handler.create_firewall_rule(&rule).await {
                    Ok(()) => self.firewall_rules.push(rule),
                    Err(error) => {
                        log::error!("Cannot create firewall rule {}: {error:?}", rule.name);
                        report.firewall_errors.push(
                            error.context(format!("Cannot create firewall rule {}", rule.name)),
                        );
                    }
                }
            }
        }
    }

    /// Deletes the firewall rules, clusters and subnetworks created by [`Deployer::up`].
    pub async fn down(&mut self) -> crate::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut failed = vec![];
        for rule in std::mem::take(&mut self.firewall_rules) {
            log::info!("Deleting firewall rule {}", rule.name);
            if let Err(error) = self
                .handler
                .delete_firewall_rule(&rule.project, &rule.name)
                .await
            {
                log::error!("Cannot delete firewall rule {}: {error:?}", rule.name);
                failed.push(rule.name);
            }
        }
        for project in self.registry.projects() {
            for cluster in self.registry.clusters(project) {
                log::info!("Deleting cluster {} in project {project}", cluster.name);
                if let Err(error) = self
                    .handler
                    .delete_cluster(project, &cluster.name, &cluster.location)
                    .await
                {
                    log::error!("Cannot delete cluster {}: {error:?}", cluster.name);
                    failed.push(cluster.name.clone());
                }
            }
        }
        for subnetwork in std::mem::take(&mut self.subnetworks) {
            log::info!("Deleting subnetwork {}", subnetwork.name);
            if let Err(error) = self.handler.delete_subnetwork(&subnetwork).await {
                log::error!("Cannot delete subnetwork {}: {error:?}", subnetwork.name);
                failed.push(subnetwork.name);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            crate::common::error::error(format!("Cannot delete {}", failed.join(", ")))
        }
    }

    /// Releases all leased projects. Can be called repeatedly.
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        match &mut self.leases {
            Some(leases) => leases.release().await,
            None => Ok(()),
        }
    }

    pub fn summary(&self, report: &RunReport) -> RunSummary {
        let clusters = report
            .clusters
            .iter()
            .map(|cluster| {
                let (location, attempts, error) = match &cluster.outcome {
                    ClusterOutcome::Succeeded { record, retries } => {
                        (Some(record.location.clone()), retries + 1, None)
                    }
                    ClusterOutcome::Exhausted { error, attempts } => {
                        (None, *attempts, Some(format!("{error:#}")))
                    }
                };
                ClusterSummary {
                    project: cluster.project.clone(),
                    index: cluster.index,
                    name: cluster.name.clone(),
                    succeeded: cluster.outcome.is_success(),
                    location,
                    attempts,
                    error,
                }
            })
            .collect();
        RunSummary {
            version: GKEPROV_VERSION,
            clusters,
            topology: self.registry.snapshot(),
            firewall_rules: self.firewall_rules.clone(),
            firewall_errors: report
                .firewall_errors
                .iter()
                .map(|error| format!("{error:#}"))
                .collect(),
        }
    }
}

/// Creates a single cluster, moving to the next location after each retryable failure.
///
/// Whatever a failed attempt has left behind is deleted, also when no further attempt follows.
async fn provision_cluster(
    handler: &mut dyn ClusterHandler,
    registry: &mut TopologyRegistry,
    subnetworks: &mut Vec<Subnetwork>,
    run: &RunState,
    leases: Option<&LeaseManager>,
    project: &str,
    cluster: &PlannedCluster,
) -> ClusterOutcome {
    let mut state = ProvisionState::Pending;
    loop {
        state = match state {
            ProvisionState::Pending => ProvisionState::Attempting(run.retry.new_budget()),
            ProvisionState::Attempting(mut budget) => {
                let attempt = budget.attempt();
                if let Some(Err(error)) = leases.map(|leases| leases.check_health()) {
                    log::error!("Not creating cluster {}: {error}", cluster.name);
                    return ClusterOutcome::Exhausted {
                        error: error.into(),
                        attempts: attempt,
                    };
                }

                let request = ClusterRequest {
                    project: project.to_string(),
                    name: cluster.name.clone(),
                    index: cluster.index,
                    attempt,
                    location: run.locations.location_arg(attempt),
                    region: run.locations.region(attempt),
                    subnetwork_ranges: run.retry.subnetwork_ranges(attempt).cloned(),
                    master_ip_range: run
                        .retry
                        .master_ip_range(attempt, cluster.index)
                        .map(|range| range.to_string()),
                };
                log::info!(
                    "Creating cluster {} in project {project} at {} (attempt {}/{})",
                    cluster.name,
                    request.location,
                    attempt + 1,
                    budget.total_try_count()
                );

                match handler.create_cluster(&request).await {
                    Ok(creation) => {
                        let record = ClusterRecord {
                            index: cluster.index,
                            name: cluster.name.clone(),
                            location: request.location.clone(),
                        };
                        match registry.record_cluster(
                            project,
                            record.index,
                            &record.name,
                            &record.location,
                        ) {
                            Ok(()) => {
                                let count = registry.register_instance_groups(
                                    project,
                                    &cluster.name,
                                    &creation.instance_group_urls,
                                );
                                log::info!(
                                    "Cluster {} was created at {} with {count} instance group(s)",
                                    cluster.name,
                                    request.location
                                );
                                subnetworks.extend(request.subnetwork());
                                ProvisionState::Finished(ClusterOutcome::Succeeded {
                                    record,
                                    retries: budget.retry_count(),
                                })
                            }
                            Err(error) => {
                                delete_failed_cluster(handler, &request).await;
                                ProvisionState::Finished(ClusterOutcome::Exhausted {
                                    error: error.into(),
                                    attempts: attempt + 1,
                                })
                            }
                        }
                    }
                    Err(error) => {
                        if run.retry.is_retryable(&error) && budget.try_consume_retry() {
                            log::warn!(
                                "Cluster {} cannot be created at {}, trying another location: {error:#}",
                                cluster.name,
                                request.location
                            );
                            delete_failed_cluster(handler, &request).await;
                            ProvisionState::Attempting(budget)
                        } else {
                            log::error!(
                                "Cluster {} cannot be created after {} attempt(s): {error:?}",
                                cluster.name,
                                attempt + 1
                            );
                            delete_failed_cluster(handler, &request).await;
                            ProvisionState::Finished(ClusterOutcome::Exhausted {
                                error,
                                attempts: attempt + 1,
                            })
                        }
                    }
                }
            }
            ProvisionState::Finished(outcome) => return outcome,
        };
    }
}

async fn delete_failed_cluster(handler: &mut dyn ClusterHandler, request: &ClusterRequest) {
    log::debug!(
        "Deleting cluster {} after a failed attempt at {}",
        request.name,
        request.location
    );
    if let Err(error) = handler
        .delete_cluster(&request.project, &request.name, &request.location)
        .await
    {
        log::debug!("Cluster {} could not be deleted: {error:#}", request.name);
    }
    if let Some(subnetwork) = request.subnetwork() {
        if let Err(error) = handler.delete_subnetwork(&subnetwork).await {
            log::debug!(
                "Subnetwork {} could not be deleted: {error:#}",
                subnetwork.name
            );
        }
    }
}
