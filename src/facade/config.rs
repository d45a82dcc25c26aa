use std::collections::HashSet;

use crate::core::{Result, RuntimeError};

/// Feature profile of the runtime. Each profile enables a set of default
/// features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Release,
    Dev,
}

/// Tag naming an optional runtime feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureTag(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureRequestFlag {
    /// Fail construction when the feature is unknown or unavailable.
    Required,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatusFlag {
    On,
    Off,
}

/// Request for an optional feature.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRequest {
    pub tag: FeatureTag,
    pub flag: FeatureRequestFlag,
}

/// Status of an optional feature after construction.
#[derive(Debug, Clone, Copy)]
pub struct FeatureStatus {
    pub tag: FeatureTag,
    pub flag: FeatureStatusFlag,
}

/// Configuration of a module host.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub profile: Profile,
    pub features: Vec<FeatureRequest>,
}

impl RuntimeConfig {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, request: FeatureRequest) -> Self {
        self.features.push(request);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for request in &self.features {
            if !seen.insert(request.tag) {
                return Err(RuntimeError::AlreadyPresent(format!(
                    "feature request {:?}",
                    request.tag
                )));
            }
        }
        Ok(())
    }

    /// Resolves the requests against the features this build knows about.
    /// No optional features are currently defined, so a `Required` request
    /// cannot be satisfied and everything else resolves to `Off`.
    pub(crate) fn resolve_features(&self) -> Result<Vec<FeatureStatus>> {
        self.features
            .iter()
            .map(|request| match request.flag {
                FeatureRequestFlag::Required => Err(RuntimeError::NotFound(format!(
                    "feature {:?}",
                    request.tag
                ))),
                FeatureRequestFlag::On | FeatureRequestFlag::Off => Ok(FeatureStatus {
                    tag: request.tag,
                    flag: FeatureStatusFlag::Off,
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_feature_requests_are_rejected() {
        let config = RuntimeConfig::default()
            .with_feature(FeatureRequest {
                tag: FeatureTag(1),
                flag: FeatureRequestFlag::On,
            })
            .with_feature(FeatureRequest {
                tag: FeatureTag(1),
                flag: FeatureRequestFlag::Off,
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn required_unknown_feature_fails_resolution() {
        let config = RuntimeConfig::default().with_feature(FeatureRequest {
            tag: FeatureTag(7),
            flag: FeatureRequestFlag::Required,
        });
        assert!(config.validate().is_ok());
        assert!(config.resolve_features().is_err());
    }
}
