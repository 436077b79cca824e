//! Archive eligibility.
//!
//! `decide` is a pure function of its inputs: the file attributes, whether the
//! path is already in the index, the reference time, and the compiled policy.

use crate::error::{GlacioError, Result};
use crate::model::FileMetadata;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub min_size_bytes: u64,
    #[serde(default)]
    pub min_age_days: u32,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub recheck_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    TooSmall,
    TooRecent,
    ExcludedPattern,
    AlreadyArchived,
}

impl IneligibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooSmall => "too_small",
            Self::TooRecent => "too_recent",
            Self::ExcludedPattern => "excluded_pattern",
            Self::AlreadyArchived => "already_archived",
        }
    }
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityDecision {
    Eligible,
    Ineligible(IneligibleReason),
}

impl EligibilityDecision {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Everything `decide` looks at besides the policy itself.
#[derive(Debug, Clone)]
pub struct EligibilityInput<'a> {
    pub metadata: &'a FileMetadata,
    pub already_archived: bool,
    pub now: DateTime<Utc>,
}

/// A policy with its exclude patterns parsed.
#[derive(Debug, Clone)]
pub struct Policy {
    config: PolicyConfig,
    excludes: Vec<glob::Pattern>,
}

impl Policy {
    pub fn compile(config: PolicyConfig) -> Result<Self> {
        let excludes = config
            .exclude_globs
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| {
                    GlacioError::Config(format!("invalid exclude glob '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { config, excludes })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn recheck_existing(&self) -> bool {
        self.config.recheck_existing
    }

    fn is_excluded(&self, metadata: &FileMetadata) -> bool {
        let file_name = metadata.path.file_name().map(std::path::Path::new);
        self.excludes.iter().any(|pattern| {
            pattern.matches_path(&metadata.path)
                || file_name.is_some_and(|name| pattern.matches_path(name))
        })
    }
}

pub fn decide(input: &EligibilityInput<'_>, policy: &Policy) -> EligibilityDecision {
    let metadata = input.metadata;

    if policy.is_excluded(metadata) {
        return EligibilityDecision::Ineligible(IneligibleReason::ExcludedPattern);
    }

    if input.already_archived && !policy.config.recheck_existing {
        return EligibilityDecision::Ineligible(IneligibleReason::AlreadyArchived);
    }

    if metadata.size < policy.config.min_size_bytes {
        return EligibilityDecision::Ineligible(IneligibleReason::TooSmall);
    }

    if policy.config.min_age_days > 0 {
        // Timestamps ahead of the clock count as just touched.
        let age = (input.now - metadata.last_touched()).max(Duration::zero());
        if age < Duration::days(i64::from(policy.config.min_age_days)) {
            return EligibilityDecision::Ineligible(IneligibleReason::TooRecent);
        }
    }

    EligibilityDecision::Eligible
}
