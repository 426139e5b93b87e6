//! Images phase: apply policy decisions to published tags

use super::report::{ImagesReport, ItemFailure, TagRecord};
use super::CleanupRunOptions;
use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KeelError, KeelResult};
use crate::git::GitRefSnapshot;
use crate::kube::LiveImageSet;
use crate::policy::{PolicyEvaluator, Reason};
use crate::registry::{ImageRegistry, ImageTag};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Deletes the tags that no policy keeps and no workload uses
pub struct ImagesCleaner<'a> {
    registry: &'a dyn ImageRegistry,
    audit: &'a AuditLog,
    workers: usize,
}

impl<'a> ImagesCleaner<'a> {
    pub fn new(registry: &'a dyn ImageRegistry, audit: &'a AuditLog, workers: usize) -> Self {
        Self {
            registry,
            audit,
            workers: workers.max(1),
        }
    }

    /// Run the phase, recording into `report` as it goes so a fatal error
    /// still leaves the work done so far in the report.
    pub async fn clean(
        &self,
        options: &CleanupRunOptions,
        snapshot: &GitRefSnapshot,
        live: &LiveImageSet,
        now: DateTime<Utc>,
        report: &mut ImagesReport,
    ) -> KeelResult<()> {
        let evaluator = PolicyEvaluator::new(snapshot, &options.policies, now);
        let repo = self.registry.address();
        let mut attempted = 0;
        let mut failed = 0;

        for image in &options.image_names {
            let listing = self.registry.list_tags(image).await?;
            let tags = listing.tags;
            debug!("Image '{}': {} tags", image, tags.len());

            for unreadable in listing.unreadable {
                let reference = unreadable.reference(repo);
                report.failures.push(ItemFailure {
                    item: reference.clone(),
                    reason: format!("cannot inspect: {}", unreadable.reason),
                });
                report.unreadable.push(reference);
            }

            let decisions = evaluator.evaluate(&tags);
            let mut kept: Vec<ImageTag> = Vec::new();
            let mut doomed = Vec::new();

            for (tag, decision) in tags.into_iter().zip(decisions) {
                let reference = tag.reference(repo);
                if decision.keep {
                    report.kept.push(TagRecord::new(&tag, reference, decision.reason));
                    kept.push(tag);
                } else if is_live(live, &tag, &reference, repo) {
                    debug!("{} is {} but used in cluster", reference, decision.reason);
                    report
                        .kept
                        .push(TagRecord::new(&tag, reference, Reason::ClusterProtected));
                    kept.push(tag);
                } else {
                    let record = TagRecord::new(&tag, reference, decision.reason);
                    doomed.push((tag, record));
                }
            }

            // Deleting a tag deletes its manifest and every tag pointing at it
            let pinned: HashSet<&str> = kept
                .iter()
                .filter_map(|tag| tag.manifest_digest.as_deref())
                .collect();
            let (shared, doomed): (Vec<_>, Vec<_>) = doomed.into_iter().partition(|(tag, _)| {
                tag.manifest_digest
                    .as_deref()
                    .is_some_and(|digest| pinned.contains(digest))
            });
            for (tag, mut record) in shared {
                debug!("{} shares its manifest with a kept tag", record.reference);
                record.reason = Reason::SharedManifest;
                report.kept.push(record);
                kept.push(tag);
            }
            report.survivors.extend(kept);

            if options.dry_run {
                report.deleted.extend(doomed.into_iter().map(|(_, record)| record));
                continue;
            }

            attempted += doomed.len();
            let registry = self.registry;
            let results: Vec<_> = stream::iter(doomed)
                .map(|(tag, record)| async move {
                    let result = registry.delete_tag(&tag).await;
                    (tag, record, result)
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

            let mut fatal = None;
            for (tag, record, result) in results {
                match result {
                    Ok(()) => {
                        info!("Deleted {} ({})", record.reference, record.reason);
                        self.audit
                            .record(&AuditEvent::TagDeleted {
                                reference: &record.reference,
                                reason: record.reason,
                            })
                            .await;
                        report.deleted.push(record);
                    }
                    Err(e) => {
                        warn!("{}", e);
                        failed += 1;
                        report.failures.push(ItemFailure {
                            item: record.reference,
                            reason: e.to_string(),
                        });
                        report.survivors.push(tag);
                        if e.is_fatal() && fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                }
            }

            if let Some(e) = fatal {
                return Err(e);
            }
        }

        report.kept.sort_by(|a, b| a.reference.cmp(&b.reference));
        report.deleted.sort_by(|a, b| a.reference.cmp(&b.reference));

        if attempted > 0 && failed == attempted {
            return Err(KeelError::PhaseFailed {
                phase: "images".to_string(),
                failed,
            });
        }
        Ok(())
    }
}

/// Used by a workload, by tag or by pinned manifest digest
fn is_live(live: &LiveImageSet, tag: &ImageTag, reference: &str, repo: &str) -> bool {
    live.contains(reference)
        || tag
            .digest_reference(repo)
            .is_some_and(|pinned| live.contains(&pinned))
}

/// Final stage digests of the surviving tags
pub fn surviving_digests(survivors: &[ImageTag]) -> impl Iterator<Item = &str> {
    survivors
        .iter()
        .map(|tag| tag.final_stage_digest.as_str())
        .filter(|digest| !digest.is_empty())
}
