use rand::Rng;

use crate::common::error::DeployerError;
use crate::deployer::config::CLUSTER_NAME_PREFIX;

/// Cluster that should be created in a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCluster {
    /// Position of the cluster among all requested clusters
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectClusters {
    pub project: String,
    pub clusters: Vec<PlannedCluster>,
}

/// Generates `count` cluster names that share a random run id.
///
/// With several projects, the clusters are spread over them in a round-robin fashion using the
/// `<name>:<project index>` form.
pub fn generate_cluster_names(count: usize, project_count: usize) -> Vec<String> {
    let run_id: [u8; 4] = rand::rng().random();
    let run_id = hex::encode(run_id);
    (0..count)
        .map(|index| {
            let name = format!("{CLUSTER_NAME_PREFIX}-{run_id}-{index}");
            if project_count > 1 {
                format!("{name}:{}", index % project_count)
            } else {
                name
            }
        })
        .collect()
}

/// Assigns clusters to projects.
///
/// A single project gets all clusters. With several projects, every cluster name has to have the
/// form `<name>:<project index>`.
pub fn build_project_clusters_layout(
    projects: &[String],
    cluster_names: &[String],
) -> crate::Result<Vec<ProjectClusters>> {
    if projects.is_empty() {
        return Err(DeployerError::Config("no project is available".to_string()));
    }
    if cluster_names.is_empty() {
        return Err(DeployerError::Config("no cluster was requested".to_string()));
    }

    let mut layout: Vec<ProjectClusters> = projects
        .iter()
        .map(|project| ProjectClusters {
            project: project.clone(),
            clusters: vec![],
        })
        .collect();

    for (index, cluster_name) in cluster_names.iter().enumerate() {
        let (name, project_index) = if projects.len() == 1 {
            (cluster_name.as_str(), 0)
        } else {
            parse_cluster_name(cluster_name, projects.len())?
        };
        if name.is_empty() {
            return Err(DeployerError::Config(format!(
                "cluster name `{cluster_name}` is empty"
            )));
        }
        let clusters = &mut layout[project_index].clusters;
        if clusters.iter().any(|cluster| cluster.name == name) {
            return Err(DeployerError::Config(format!(
                "cluster `{name}` is requested more than once in project {}",
                projects[project_index]
            )));
        }
        clusters.push(PlannedCluster {
            index,
            name: name.to_string(),
        });
    }
    Ok(layout)
}

fn parse_cluster_name(cluster_name: &str, project_count: usize) -> crate::Result<(&str, usize)> {
    let invalid = || {
        DeployerError::Config(format!(
            "cluster name `{cluster_name}` does not have the form <name>:<project index>"
        ))
    };
    let (name, project_index) = cluster_name.split_once(':').ok_or_else(invalid)?;
    let project_index: usize = project_index.parse().map_err(|_| invalid())?;
    if project_index >= project_count {
        return Err(DeployerError::Config(format!(
            "cluster `{name}` refers to project index {project_index}, but only {project_count} \
project(s) are available"
        )));
    }
    Ok((name, project_index))
}
