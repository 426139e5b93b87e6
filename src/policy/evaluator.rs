//! Keep/delete decisions for image tags
//!
//! Pure: the same tags, snapshot, policies and `now` always produce the same
//! decisions, which is what makes a dry run classify exactly like a real run.

use super::CleanupPolicy;
use crate::git::GitRefSnapshot;
use crate::registry::ImageTag;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Why a tag was kept or deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    /// Among the `keep_last` most recent tags of its reference
    WithinKeepLast,
    /// Younger than `expire_after`
    WithinExpiry,
    /// Matching policy sets no limit
    Unlimited,
    /// Referenced by a workload running in the cluster
    ClusterProtected,
    /// Same registry manifest as a kept tag; deleting it would delete both
    SharedManifest,
    /// The git reference it was built from no longer exists
    Orphan,
    /// Older than `expire_after` and outside `keep_last`
    Expired,
    /// Outside `keep_last` with no expiry to fall back on
    OutOfLimit,
    /// No configured policy applies
    NoMatchingPolicy,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WithinKeepLast => "within keep-last",
            Self::WithinExpiry => "within expiry",
            Self::Unlimited => "no limit",
            Self::ClusterProtected => "used in cluster",
            Self::SharedManifest => "manifest shared with kept tag",
            Self::Orphan => "git reference gone",
            Self::Expired => "expired",
            Self::OutOfLimit => "beyond keep-last",
            Self::NoMatchingPolicy => "no matching policy",
        };
        f.pad(s)
    }
}

/// Outcome for a single tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub keep: bool,
    pub reason: Reason,
}

impl Decision {
    pub fn keep(reason: Reason) -> Self {
        Self { keep: true, reason }
    }

    pub fn delete(reason: Reason) -> Self {
        Self {
            keep: false,
            reason,
        }
    }
}

/// Evaluates tags against a frozen git snapshot and a fixed clock
pub struct PolicyEvaluator<'a> {
    snapshot: &'a GitRefSnapshot,
    policies: &'a [CleanupPolicy],
    now: DateTime<Utc>,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(
        snapshot: &'a GitRefSnapshot,
        policies: &'a [CleanupPolicy],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            policies,
            now,
        }
    }

    /// Decide every tag of one image; `tags` is also the ranking population
    pub fn evaluate(&self, tags: &[ImageTag]) -> Vec<Decision> {
        tags.iter().map(|tag| self.decide(tag, tags)).collect()
    }

    /// Decide one tag. Matching policies are OR'd: the first keep vote wins.
    pub fn decide(&self, tag: &ImageTag, peers: &[ImageTag]) -> Decision {
        let mut matched = false;
        let mut expired = None;

        for policy in self.policies.iter().filter(|p| p.matches(tag)) {
            matched = true;
            match self.vote(policy, tag, peers) {
                Decision { keep: true, reason } => return Decision::keep(reason),
                Decision { reason, .. } if reason != Reason::Orphan => expired = Some(reason),
                _ => {}
            }
        }

        if !matched {
            return Decision::delete(Reason::NoMatchingPolicy);
        }
        Decision::delete(expired.unwrap_or(Reason::Orphan))
    }

    fn vote(&self, policy: &CleanupPolicy, tag: &ImageTag, peers: &[ImageTag]) -> Decision {
        if policy.scheme.is_git() && self.snapshot.is_absent() {
            return match policy.expire_after {
                Some(expire_after) => self.by_expiry(tag, expire_after),
                None => Decision::delete(Reason::Orphan),
            };
        }

        if policy.scheme.is_git() {
            let exists = tag
                .git_ref
                .as_deref()
                .is_some_and(|r| self.snapshot.contains(policy.scheme, r));
            if !exists {
                return Decision::delete(Reason::Orphan);
            }
        }

        if let Some(keep_last) = policy.keep_last {
            if rank(tag, peers, policy) < keep_last {
                return Decision::keep(Reason::WithinKeepLast);
            }
        }

        match (policy.keep_last, policy.expire_after) {
            (None, None) => Decision::keep(Reason::Unlimited),
            (Some(_), None) => Decision::delete(Reason::OutOfLimit),
            (_, Some(expire_after)) => self.by_expiry(tag, expire_after),
        }
    }

    /// Kept while strictly younger than `expire_after`; a creation time in
    /// the future counts as age zero.
    fn by_expiry(&self, tag: &ImageTag, expire_after: std::time::Duration) -> Decision {
        let age = (self.now - tag.created_at).to_std().unwrap_or_default();
        if age < expire_after {
            Decision::keep(Reason::WithinExpiry)
        } else {
            Decision::delete(Reason::Expired)
        }
    }
}

/// Position of `tag` among the peers sharing its reference under `policy`,
/// newest first, ties broken by smaller digest then tag name
fn rank(tag: &ImageTag, peers: &[ImageTag], policy: &CleanupPolicy) -> usize {
    peers
        .iter()
        .filter(|p| policy.matches(p) && p.same_reference(tag))
        .filter(|p| recency_order(p, tag) == Ordering::Less)
        .count()
}

fn recency_order(a: &ImageTag, b: &ImageTag) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.final_stage_digest.cmp(&b.final_stage_digest))
        .then_with(|| a.tag.cmp(&b.tag))
}
