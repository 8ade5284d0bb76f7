use crate::common::error::DeployerError;

/// Candidate locations of a run, in the order in which they are attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locations {
    Zones(Vec<String>),
    Regions(Vec<String>),
}

impl Locations {
    /// Checks that exactly one of `zones`/`regions` is configured.
    pub fn new(regions: &[String], zones: &[String]) -> crate::Result<Self> {
        verify_location_flags(regions, zones)?;
        Ok(if zones.is_empty() {
            Locations::Regions(regions.to_vec())
        } else {
            Locations::Zones(zones.to_vec())
        })
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Location argument passed to `gcloud` for the given attempt.
    pub fn location_arg(&self, attempt: usize) -> String {
        let (regions, zones) = self.split();
        location_arg(regions, zones, attempt)
    }

    /// Region containing the location of the given attempt.
    pub fn region(&self, attempt: usize) -> String {
        let (regions, zones) = self.split();
        region_from_location(regions, zones, attempt)
    }

    fn as_slice(&self) -> &[String] {
        match self {
            Locations::Zones(zones) => zones,
            Locations::Regions(regions) => regions,
        }
    }

    fn split(&self) -> (&[String], &[String]) {
        match self {
            Locations::Zones(zones) => (&[], zones.as_slice()),
            Locations::Regions(regions) => (regions.as_slice(), &[]),
        }
    }
}

pub fn verify_location_flags(regions: &[String], zones: &[String]) -> crate::Result<()> {
    if zones.is_empty() && regions.is_empty() {
        Err(DeployerError::LocationConfig(
            "--zone or --region must be set for GKE deployment".to_string(),
        ))
    } else if !zones.is_empty() && !regions.is_empty() {
        Err(DeployerError::LocationConfig(
            "--zone and --region cannot both be set".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Builds the zone/region flag used by `gcloud` commands.
///
/// Zones take precedence when both are given; [`verify_location_flags`] rejects such a
/// configuration before any attempt is made.
pub fn location_arg(regions: &[String], zones: &[String], attempt: usize) -> String {
    if !zones.is_empty() {
        format!("--zone={}", zones[attempt])
    } else {
        format!("--region={}", regions[attempt])
    }
}

/// Computes the region of the zone/region of the given attempt.
/// Used by commands (such as subnets) that do not support zones.
pub fn region_from_location(regions: &[String], zones: &[String], attempt: usize) -> String {
    if !zones.is_empty() {
        let zone = &zones[attempt];
        match zone.rfind('-') {
            Some(position) => zone[..position].to_string(),
            None => zone.clone(),
        }
    } else {
        regions[attempt].clone()
    }
}
