use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::error::DeployerError;

/// Decides whether a failed creation attempt is worth repeating in another location.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<Regex>,
}

impl ErrorClassifier {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(pattern)
                    .with_context(|| format!("Invalid retryable error pattern `{pattern}`"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if any pattern is found anywhere in `error_text`.
    pub fn is_retryable(&self, error_text: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(error_text))
    }
}

/// Secondary ranges of a subnetwork created for a cluster: `<node> <pods> <services>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetworkRanges {
    pub node: String,
    pub pods: String,
    pub services: String,
}

impl FromStr for SubnetworkRanges {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ranges: Vec<&str> = s.split_whitespace().collect();
        match ranges.as_slice() {
            [node, pods, services] => Ok(Self {
                node: node.to_string(),
                pods: pods.to_string(),
                services: services.to_string(),
            }),
            _ => anyhow::bail!(
                "Subnetwork ranges must contain exactly three space separated CIDR ranges \
(node, pods, services), got `{s}`"
            ),
        }
    }
}

impl Display for SubnetworkRanges {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.node, self.pods, self.services)
    }
}

/// Counts the attempts of a single cluster.
///
/// `retry_count` doubles as the index of the current location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    total_try_count: usize,
    retry_count: usize,
}

impl RetryBudget {
    pub fn new(total_try_count: usize) -> Self {
        assert!(total_try_count > 0);
        Self {
            total_try_count,
            retry_count: 0,
        }
    }

    pub fn attempt(&self) -> usize {
        self.retry_count
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn total_try_count(&self) -> usize {
        self.total_try_count
    }

    /// Moves to the next attempt, if the budget allows it.
    pub fn try_consume_retry(&mut self) -> bool {
        if self.retry_count + 1 < self.total_try_count {
            self.retry_count += 1;
            true
        } else {
            false
        }
    }
}

/// Retry configuration shared by all clusters of a run.
#[derive(Debug)]
pub struct RetryState {
    classifier: ErrorClassifier,
    total_try_count: usize,
    /// Indexed by attempt.
    subnetwork_ranges: Vec<SubnetworkRanges>,
    /// Indexed by attempt, then by cluster index.
    master_ip_ranges: Vec<Vec<String>>,
}

impl RetryState {
    /// The number of tries defaults to the number of candidate locations and it can never exceed
    /// it. Master IP ranges of every attempt have to cover all `cluster_count` clusters.
    pub fn new(
        classifier: ErrorClassifier,
        try_count: Option<usize>,
        location_count: usize,
        cluster_count: usize,
        subnetwork_ranges: Vec<SubnetworkRanges>,
        master_ip_ranges: Vec<Vec<String>>,
    ) -> crate::Result<Self> {
        let total_try_count = try_count.unwrap_or(location_count).min(location_count);
        if total_try_count == 0 {
            return Err(DeployerError::Config(
                "retry budget must allow at least one attempt".to_string(),
            ));
        }
        if !subnetwork_ranges.is_empty() && subnetwork_ranges.len() < total_try_count {
            return Err(DeployerError::Config(format!(
                "{} subnetwork range(s) given, but up to {total_try_count} attempt(s) can be made",
                subnetwork_ranges.len()
            )));
        }
        if !master_ip_ranges.is_empty() && master_ip_ranges.len() < total_try_count {
            return Err(DeployerError::Config(format!(
                "{} private cluster master IP range set(s) given, but up to {total_try_count} \
attempt(s) can be made",
                master_ip_ranges.len()
            )));
        }
        if let Some((attempt, ranges)) = master_ip_ranges
            .iter()
            .take(total_try_count)
            .enumerate()
            .find(|(_, ranges)| ranges.len() < cluster_count)
        {
            return Err(DeployerError::Config(format!(
                "{} private cluster master IP range(s) given for attempt {attempt}, but \
{cluster_count} cluster(s) are requested",
                ranges.len()
            )));
        }
        Ok(Self {
            classifier,
            total_try_count,
            subnetwork_ranges,
            master_ip_ranges,
        })
    }

    pub fn total_try_count(&self) -> usize {
        self.total_try_count
    }

    pub fn new_budget(&self) -> RetryBudget {
        RetryBudget::new(self.total_try_count)
    }

    /// Classifies the whole error chain, the provider message is usually wrapped in context.
    pub fn is_retryable(&self, error: &anyhow::Error) -> bool {
        self.classifier.is_retryable(&format!("{error:#}"))
    }

    pub fn subnetwork_ranges(&self, attempt: usize) -> Option<&SubnetworkRanges> {
        self.subnetwork_ranges.get(attempt)
    }

    pub fn master_ip_range(&self, attempt: usize, cluster_index: usize) -> Option<&str> {
        self.master_ip_ranges
            .get(attempt)
            .and_then(|ranges| ranges.get(cluster_index))
            .map(|range| range.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorClassifier, RetryBudget, RetryState, SubnetworkRanges};
    use crate::common::error::DeployerError;
    use crate::deployer::config::GCE_STOCKOUT_ERROR_PATTERN;

    fn stockout_classifier() -> ErrorClassifier {
        ErrorClassifier::new(&[GCE_STOCKOUT_ERROR_PATTERN]).unwrap()
    }

    const STOCKOUT: &str = "ERROR: (gcloud.container.clusters.create) Operation \
[<Operation\n name: 'operation-1'>] finished with error: The zone 'projects/p/zones/us-central1-a' \
does not have enough resources available to fulfill the request. Try a different zone, or try \
again later.";

    #[test]
    fn default_pattern_matches_stockout() {
        let classifier = stockout_classifier();
        assert!(classifier.is_retryable(STOCKOUT));
    }

    #[test]
    fn default_pattern_ignores_other_errors() {
        let classifier = stockout_classifier();
        assert!(!classifier.is_retryable(
            "ERROR: (gcloud.container.clusters.create) ResponseError: code=403, message=Permission denied"
        ));
        assert!(!classifier.is_retryable(""));
    }

    #[test]
    fn custom_patterns_match_substrings() {
        let classifier = ErrorClassifier::new(&["quota", "code=50[0-9]"]).unwrap();
        assert!(classifier.is_retryable("Insufficient regional quota to satisfy request"));
        assert!(classifier.is_retryable("ResponseError: code=503, message=backend unavailable"));
        assert!(!classifier.is_retryable("ResponseError: code=404"));
    }

    #[test]
    fn invalid_pattern() {
        assert!(ErrorClassifier::new(&["(unclosed"]).is_err());
    }

    #[test]
    fn budget_never_exceeds_total() {
        let mut budget = RetryBudget::new(3);
        assert!(budget.try_consume_retry());
        assert!(budget.try_consume_retry());
        assert!(!budget.try_consume_retry());
        assert_eq!(budget.retry_count(), 2);
        assert_eq!(budget.attempt(), 2);
    }

    #[test]
    fn single_try_budget() {
        let mut budget = RetryBudget::new(1);
        assert!(!budget.try_consume_retry());
        assert_eq!(budget.retry_count(), 0);
    }

    #[test]
    fn try_count_is_capped_by_locations() {
        let state = RetryState::new(stockout_classifier(), Some(10), 2, 1, vec![], vec![])
            .unwrap();
        assert_eq!(state.total_try_count(), 2);
        let state = RetryState::new(stockout_classifier(), None, 3, 1, vec![], vec![]).unwrap();
        assert_eq!(state.total_try_count(), 3);
    }

    #[test]
    fn zero_try_count() {
        assert!(matches!(
            RetryState::new(stockout_classifier(), Some(0), 3, 1, vec![], vec![]),
            Err(DeployerError::Config(_))
        ));
    }

    #[test]
    fn missing_subnetwork_ranges() {
        let ranges = vec!["10.0.4.0/22 10.0.32.0/20 10.4.0.0/14".parse().unwrap()];
        assert!(matches!(
            RetryState::new(stockout_classifier(), None, 2, 1, ranges, vec![]),
            Err(DeployerError::Config(_))
        ));
    }

    #[test]
    fn ranges_by_attempt() {
        let state = RetryState::new(
            stockout_classifier(),
            None,
            2,
            1,
            vec![
                "10.0.4.0/22 10.0.32.0/20 10.4.0.0/14".parse().unwrap(),
                "10.1.4.0/22 10.1.32.0/20 10.8.0.0/14".parse().unwrap(),
            ],
            vec![
                vec!["172.16.0.32/28".to_string(), "172.16.0.48/28".to_string()],
                vec!["172.16.1.32/28".to_string()],
            ],
        )
        .unwrap();
        assert_eq!(state.subnetwork_ranges(1).unwrap().node, "10.1.4.0/22");
        assert_eq!(state.master_ip_range(0, 1), Some("172.16.0.48/28"));
        assert_eq!(state.master_ip_range(1, 1), None);
    }

    #[test]
    fn master_ranges_cover_all_clusters() {
        let ranges = vec![
            vec!["172.16.0.32/28".to_string(), "172.16.0.48/28".to_string()],
            vec!["172.16.1.32/28".to_string()],
        ];
        assert!(matches!(
            RetryState::new(stockout_classifier(), None, 2, 2, vec![], ranges.clone()),
            Err(DeployerError::Config(_))
        ));
        // Ranges of attempts that can never be made are not checked
        assert!(RetryState::new(stockout_classifier(), Some(1), 2, 2, vec![], ranges).is_ok());
    }

    #[test]
    fn parse_subnetwork_ranges() {
        let ranges: SubnetworkRanges = "10.0.4.0/22 10.0.32.0/20 10.4.0.0/14".parse().unwrap();
        assert_eq!(ranges.pods, "10.0.32.0/20");
        assert!("10.0.4.0/22 10.0.32.0/20".parse::<SubnetworkRanges>().is_err());
    }
}
