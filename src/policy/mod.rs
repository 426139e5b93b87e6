//! Image cleanup policies
//!
//! A policy selects tags by the scheme they were published under and a glob
//! over their git reference (or tag name for custom tags), then bounds how
//! many of them survive (`keep_last`) and for how long (`expire_after`).
//!
//! Policies come from three places, highest precedence first: the
//! `--images-cleanup-policies` flag, the `[cleanup]` section of the project
//! config, and [`default_policies`].
//!
//! # Policy strings
//!
//! ```text
//! branch:*,keep=2,expire=30d;tag:v*,keep=10;commit:*,expire=7d;custom:nightly-*
//! ```

mod evaluator;

pub use evaluator::{Decision, PolicyEvaluator, Reason};

use crate::error::{KeelError, KeelResult};
use crate::registry::ImageTag;
use glob::Pattern;
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How an image tag was derived when it was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagScheme {
    /// Tag follows a git branch
    #[serde(alias = "branch")]
    GitBranch,
    /// Tag follows a git tag
    #[serde(alias = "tag")]
    GitTag,
    /// Tag follows a git commit
    #[serde(alias = "commit")]
    GitCommit,
    /// Free-form tag with no git reference
    Custom,
}

impl TagScheme {
    /// Whether tags of this scheme embed a git reference
    pub fn is_git(&self) -> bool {
        !matches!(self, Self::Custom)
    }

    /// Parse from the image label value or the short flag form
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "git-branch" | "git_branch" | "branch" => Some(Self::GitBranch),
            "git-tag" | "git_tag" | "tag" => Some(Self::GitTag),
            "git-commit" | "git_commit" | "commit" => Some(Self::GitCommit),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Convert to label value
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::GitBranch => "git-branch",
            Self::GitTag => "git-tag",
            Self::GitCommit => "git-commit",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TagScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// A single retention rule
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub scheme: TagScheme,
    pattern: Pattern,
    /// Number of most recent tags per reference that always survive
    pub keep_last: Option<usize>,
    /// Age below which a tag survives regardless of rank
    pub expire_after: Option<Duration>,
}

impl CleanupPolicy {
    pub fn new(
        scheme: TagScheme,
        pattern: &str,
        keep_last: Option<usize>,
        expire_after: Option<Duration>,
    ) -> KeelResult<Self> {
        let pattern = Pattern::new(pattern).map_err(|e| KeelError::PolicyInvalid {
            spec: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            scheme,
            pattern,
            keep_last,
            expire_after,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Whether this policy applies to the tag
    pub fn matches(&self, tag: &ImageTag) -> bool {
        tag.scheme == self.scheme && self.pattern.matches(tag.subject())
    }

    /// Parse a `;`-separated list of policies
    pub fn parse_list(spec: &str) -> KeelResult<Vec<Self>> {
        let policies = spec
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<KeelResult<Vec<Self>>>()?;

        if policies.is_empty() {
            return Err(KeelError::PolicyInvalid {
                spec: spec.to_string(),
                reason: "no policies given".to_string(),
            });
        }
        Ok(policies)
    }
}

impl FromStr for CleanupPolicy {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| KeelError::PolicyInvalid {
            spec: s.to_string(),
            reason,
        };

        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <scheme>:<pattern>".to_string()))?;
        let scheme = TagScheme::from_label(scheme.trim())
            .ok_or_else(|| invalid(format!("unknown scheme '{}'", scheme.trim())))?;

        let mut parts = rest.split(',').map(str::trim);
        let pattern = parts.next().filter(|p| !p.is_empty()).unwrap_or("*");

        let mut keep_last = None;
        let mut expire_after = None;
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{part}'")))?;
            match key.trim() {
                "keep" | "keep_last" | "keep-last" => {
                    let n = value
                        .trim()
                        .parse::<usize>()
                        .map_err(|e| invalid(format!("bad keep value '{value}': {e}")))?;
                    keep_last = Some(n);
                }
                "expire" | "expire_after" | "expire-after" => {
                    let d = humantime::parse_duration(value.trim())
                        .map_err(|e| invalid(format!("bad expire value '{value}': {e}")))?;
                    expire_after = Some(d);
                }
                other => return Err(invalid(format!("unknown option '{other}'"))),
            }
        }

        Self::new(scheme, pattern, keep_last, expire_after)
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = match self.scheme {
            TagScheme::GitBranch => "branch",
            TagScheme::GitTag => "tag",
            TagScheme::GitCommit => "commit",
            TagScheme::Custom => "custom",
        };
        write!(f, "{}:{}", short, self.pattern)?;
        if let Some(n) = self.keep_last {
            write!(f, ",keep={n}")?;
        }
        if let Some(d) = self.expire_after {
            write!(f, ",expire={}", humantime::format_duration(d))?;
        }
        Ok(())
    }
}

/// Policy as written in the project config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub scheme: TagScheme,

    #[serde(default = "default_pattern")]
    pub pattern: String,

    #[serde(default)]
    pub keep_last: Option<usize>,

    #[serde(default, with = "humantime_serde")]
    pub expire_after: Option<Duration>,
}

fn default_pattern() -> String {
    "*".to_string()
}

impl TryFrom<&PolicyConfig> for CleanupPolicy {
    type Error = KeelError;

    fn try_from(config: &PolicyConfig) -> Result<Self, Self::Error> {
        Self::new(
            config.scheme,
            &config.pattern,
            config.keep_last,
            config.expire_after,
        )
    }
}

/// Policies applied when neither the CLI nor the project config set any.
///
/// Tags of live branches are kept; git tags and commits keep a bounded
/// history for 30 days. Custom tags have no default and are removed.
pub const DEFAULT_POLICIES: &str = "branch:*;tag:*,keep=10,expire=30d;commit:*,keep=50,expire=30d";

/// Parsed [`DEFAULT_POLICIES`]
pub fn default_policies() -> KeelResult<Vec<CleanupPolicy>> {
    CleanupPolicy::parse_list(DEFAULT_POLICIES)
}
