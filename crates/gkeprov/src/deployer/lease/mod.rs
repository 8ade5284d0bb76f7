//! Leasing of projects from a shared resource broker.
//!
//! Every acquired project gets its own background heartbeat task, which renews the lease in
//! regular intervals until the lease is released. Releasing a lease first stops its heartbeat
//! (and waits until the task has really finished) and only then returns the project to the broker.
pub mod boskos;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::error::DeployerError;
use crate::deployer::DeployResult;
use crate::deployer::config::get_acquire_poll_interval;

pub type BrokerFuture<T> = Pin<Box<dyn Future<Output = DeployResult<T>> + Send>>;

/// Client of a shared resource broker that hands out cloud projects.
pub trait ResourceBroker: Send + Sync {
    /// Tries to acquire a free resource of the given type.
    /// Returns `None` if there is no free resource at the moment.
    fn acquire(&self, resource_type: &str) -> BrokerFuture<Option<String>>;

    /// Renews the lease of an acquired resource.
    fn heartbeat(&self, name: &str) -> BrokerFuture<()>;

    /// Returns an acquired resource to the broker.
    fn release(&self, name: &str) -> BrokerFuture<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeasedProject(String);

impl LeasedProject {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Display for LeasedProject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens when heartbeats of a lease keep failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPolicy {
    /// After this many failed renewals in a row, the lease is considered to be lost.
    /// `None` only logs the failures.
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_policy: HeartbeatPolicy,
    /// Delay between acquisition requests while no resource is free.
    pub poll_interval: Duration,
}

impl LeaseConfig {
    pub fn new(heartbeat_interval: Duration, heartbeat_policy: HeartbeatPolicy) -> Self {
        Self {
            heartbeat_interval,
            heartbeat_policy,
            poll_interval: get_acquire_poll_interval(),
        }
    }
}

/// Background renewal task of a single lease.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    failures: Arc<AtomicU32>,
}

impl HeartbeatHandle {
    fn start(broker: Arc<dyn ResourceBroker>, project: LeasedProject, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let failures = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(heartbeat_process(
            broker,
            project,
            interval,
            stop.clone(),
            failures.clone(),
        ));
        Self {
            stop,
            task: Some(task),
            failures,
        }
    }

    /// Token that stops the heartbeat when cancelled.
    /// It can be cancelled from anywhere, any number of times.
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the heartbeat and waits until the background task has finished.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                log::error!("Heartbeat task has crashed: {error:?}");
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn heartbeat_process(
    broker: Arc<dyn ResourceBroker>,
    project: LeasedProject,
    interval: Duration,
    stop: CancellationToken,
    failures: Arc<AtomicU32>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // The renewal request itself is also interrupted by the stop signal
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = broker.heartbeat(project.name()) => result,
        };
        match result {
            Ok(()) => {
                failures.store(0, Ordering::Relaxed);
                log::debug!("Heartbeat of project {project} was sent");
            }
            Err(error) => {
                let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Heartbeat of project {project} has failed ({count}x in a row): {error:?}");
            }
        }
    }
    log::debug!("Heartbeat of project {project} has stopped");
}

struct Lease {
    project: LeasedProject,
    heartbeat: HeartbeatHandle,
    released: bool,
}

/// Owns all projects leased by a single run.
pub struct LeaseManager {
    broker: Arc<dyn ResourceBroker>,
    config: LeaseConfig,
    leases: Vec<Lease>,
}

impl LeaseManager {
    pub fn new(broker: Arc<dyn ResourceBroker>, config: LeaseConfig) -> Self {
        Self {
            broker,
            config,
            leases: Default::default(),
        }
    }

    /// Waits up to `timeout` for a free resource of the given type and starts its heartbeat.
    pub async fn acquire(
        &mut self,
        resource_type: &str,
        timeout: Duration,
    ) -> crate::Result<LeasedProject> {
        let poll_interval = self.config.poll_interval;
        let broker = self.broker.clone();
        let acquisition = async {
            loop {
                match broker.acquire(resource_type).await {
                    Ok(Some(name)) => return Ok(name),
                    Ok(None) => {
                        log::debug!(
                            "No free `{resource_type}` resource, trying again in {poll_interval:?}"
                        );
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(error) => return Err(DeployerError::Acquisition(format!("{error:#}"))),
                }
            }
        };

        let name = match tokio::time::timeout(timeout, acquisition).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeployerError::AcquisitionTimeout {
                    resource_type: resource_type.to_string(),
                    timeout,
                });
            }
        };

        let project = LeasedProject(name);
        log::info!("Acquired project {project}");
        let heartbeat = HeartbeatHandle::start(
            self.broker.clone(),
            project.clone(),
            self.config.heartbeat_interval,
        );
        self.leases.push(Lease {
            project: project.clone(),
            heartbeat,
            released: false,
        });
        Ok(project)
    }

    /// Projects that are currently leased.
    pub fn projects(&self) -> impl Iterator<Item = &LeasedProject> {
        self.leases
            .iter()
            .filter(|lease| !lease.released)
            .map(|lease| &lease.project)
    }

    pub fn heartbeat(&self, project: &LeasedProject) -> Option<&HeartbeatHandle> {
        self.leases
            .iter()
            .find(|lease| !lease.released && &lease.project == project)
            .map(|lease| &lease.heartbeat)
    }

    /// Fails if the heartbeat of some lease has failed too many times in a row, according to the
    /// configured [`HeartbeatPolicy`].
    pub fn check_health(&self) -> crate::Result<()> {
        let Some(max_failures) = self.config.heartbeat_policy.max_consecutive_failures else {
            return Ok(());
        };
        match self
            .leases
            .iter()
            .filter(|lease| !lease.released)
            .find(|lease| lease.heartbeat.consecutive_failures() >= max_failures)
        {
            Some(lease) => Err(DeployerError::LeaseLost(lease.project.name().to_string())),
            None => Ok(()),
        }
    }

    /// Stops all heartbeats and returns all leased projects to the broker.
    ///
    /// Each lease is released at most once, calling this method again has no further effect.
    pub async fn release(&mut self) -> crate::Result<()> {
        let mut failed = vec![];
        for lease in self.leases.iter_mut().filter(|lease| !lease.released) {
            lease.heartbeat.stop().await;
            // The lease is considered to be released even if the broker fails to process the
            // request, it will expire on its own.
            lease.released = true;
            match self.broker.release(lease.project.name()).await {
                Ok(()) => log::info!("Released project {}", lease.project),
                Err(error) => {
                    log::error!("Could not release project {}: {error:?}", lease.project);
                    failed.push(lease.project.name().to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            crate::common::error::error(format!(
                "Could not release project(s) {}",
                failed.join(", ")
            ))
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        for lease in self.leases.iter().filter(|lease| !lease.released) {
            log::warn!(
                "Project {} was not released, it will stay leased until it expires",
                lease.project
            );
        }
    }
}
