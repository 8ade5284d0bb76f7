use std::collections::BTreeMap;

use nom::bytes::complete::{is_not, tag};
use nom::combinator::rest;
use nom::sequence::{delimited, pair};
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::DeployerError;
use crate::common::parser::{NomResult, consume_all};

const UNIQUE_HASH_LENGTH: usize = 8;
const INSTANCE_GROUP_SUFFIX: &str = "-grp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Position of the cluster among all requested clusters of the run, unique per project.
    pub index: usize,
    pub name: String,
    /// Location argument of the attempt that created the cluster.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupRecord {
    /// Resource path starting at `zones/`.
    pub path: String,
    pub zone: String,
    pub name: String,
    /// Nonce that GKE puts into the names of all resources of a cluster.
    pub unique_hash: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InstanceGroupParseError {
    #[error("`{0}` does not contain a `zones/<zone>/instanceGroupManagers/<name>` path")]
    MissingPath(String),
    #[error("Instance group name in `{0}` does not have the form `gk(e|3)-...-<8 hex>-grp`")]
    InvalidName(String),
}

fn p_instance_group_path(input: &str) -> NomResult<(&str, &str)> {
    pair(
        delimited(tag("zones/"), is_not("/"), tag("/instanceGroupManagers/")),
        rest,
    )(input)
}

/// Returns the unique hash of a GKE (`gke-`) or Autopilot (`gk3-`) instance group name.
fn unique_hash_of(name: &str) -> Option<&str> {
    let body = name
        .strip_prefix("gke-")
        .or_else(|| name.strip_prefix("gk3-"))?;
    let body = body.strip_suffix(INSTANCE_GROUP_SUFFIX)?;
    if body.len() <= UNIQUE_HASH_LENGTH {
        return None;
    }
    let (head, hash) = body.split_at(body.len() - UNIQUE_HASH_LENGTH);
    let is_hash = hash
        .bytes()
        .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c));
    if is_hash && head.ends_with('-') {
        Some(hash)
    } else {
        None
    }
}

/// Parses an instance group URL, such as
/// `https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/instanceGroupManagers/gke-c-default-pool-90fcb815-grp`.
///
/// The first `zones/` occurrence that is followed by a valid instance group path wins.
pub fn parse_instance_group_url(url: &str) -> Result<InstanceGroupRecord, InstanceGroupParseError> {
    let mut found_path = false;
    for (position, _) in url.match_indices("zones/") {
        let path = &url[position..];
        let Ok((zone, name)) = consume_all(p_instance_group_path, path) else {
            continue;
        };
        found_path = true;
        if let Some(hash) = unique_hash_of(name) {
            return Ok(InstanceGroupRecord {
                path: path.to_string(),
                zone: zone.to_string(),
                name: name.to_string(),
                unique_hash: hash.to_string(),
            });
        }
    }
    if found_path {
        Err(InstanceGroupParseError::InvalidName(url.to_string()))
    } else {
        Err(InstanceGroupParseError::MissingPath(url.to_string()))
    }
}

/// Exported view of a single project.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTopology {
    pub clusters: Vec<ClusterRecord>,
    /// Cluster name -> instance groups
    pub instance_groups: BTreeMap<String, Vec<InstanceGroupRecord>>,
}

/// Clusters and instance groups created by a run, grouped by project.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    clusters: Map<String, Vec<ClusterRecord>>,
    instance_groups: Map<String, Map<String, Vec<InstanceGroupRecord>>>,
}

impl TopologyRegistry {
    pub fn record_cluster(
        &mut self,
        project: &str,
        index: usize,
        name: &str,
        location: &str,
    ) -> crate::Result<()> {
        let clusters = self.clusters.entry_ref(project).or_default();
        match clusters.binary_search_by_key(&index, |record| record.index) {
            Ok(_) => Err(DeployerError::DuplicateIndex {
                project: project.to_string(),
                index,
            }),
            Err(position) => {
                clusters.insert(
                    position,
                    ClusterRecord {
                        index,
                        name: name.to_string(),
                        location: location.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Parses and stores the instance groups of a cluster, skipping URLs that cannot be parsed.
    /// Returns the number of stored instance groups.
    pub fn register_instance_groups<S: AsRef<str>>(
        &mut self,
        project: &str,
        cluster: &str,
        urls: &[S],
    ) -> usize {
        let records: Vec<InstanceGroupRecord> = urls
            .iter()
            .filter_map(|url| match parse_instance_group_url(url.as_ref()) {
                Ok(record) => Some(record),
                Err(error) => {
                    log::warn!("Skipping instance group of cluster {cluster}: {error}");
                    None
                }
            })
            .collect();
        let count = records.len();
        self.instance_groups
            .entry_ref(project)
            .or_default()
            .entry_ref(cluster)
            .or_default()
            .extend(records);
        count
    }

    pub fn projects(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(|project| project.as_str())
    }

    /// Clusters of a project, ordered by their index.
    pub fn clusters(&self, project: &str) -> &[ClusterRecord] {
        self.clusters
            .get(project)
            .map(|clusters| clusters.as_slice())
            .unwrap_or_default()
    }

    pub fn instance_groups(&self, project: &str, cluster: &str) -> &[InstanceGroupRecord] {
        self.instance_groups
            .get(project)
            .and_then(|clusters| clusters.get(cluster))
            .map(|groups| groups.as_slice())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.values().all(|clusters| clusters.is_empty())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProjectTopology> {
        self.clusters
            .iter()
            .map(|(project, clusters)| {
                let instance_groups = self
                    .instance_groups
                    .get(project)
                    .map(|groups| {
                        groups
                            .iter()
                            .map(|(cluster, groups)| (cluster.clone(), groups.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                (
                    project.clone(),
                    ProjectTopology {
                        clusters: clusters.clone(),
                        instance_groups,
                    },
                )
            })
            .collect()
    }
}
