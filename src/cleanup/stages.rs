//! Stages phase: enumerate the stage graph and collect unreachable stages
//!
//! Stages form a forest through their parent digests. A stage survives when
//! it is the final stage of a surviving tag or an ancestor of one; all other
//! stages are deleted children first. A stage whose child could not be
//! deleted is skipped, and so are its ancestors.

use super::images::surviving_digests;
use super::report::{ItemFailure, StageRecord, StagesReport};
use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KeelError, KeelResult};
use crate::registry::{ImageTag, Stage, StageStorage};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Parent-linked view of every stage in the storage
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    stages: HashMap<String, Stage>,
}

impl StageGraph {
    /// Index stages by digest and reject parent cycles.
    ///
    /// A parent digest that is not in the storage ends the chain.
    pub fn build(stages: Vec<Stage>) -> KeelResult<Self> {
        let mut indexed = HashMap::with_capacity(stages.len());
        for stage in stages {
            if indexed.contains_key(&stage.digest) {
                debug!("Duplicate stage {} at {}, ignored", stage.digest, stage.location);
                continue;
            }
            indexed.insert(stage.digest.clone(), stage);
        }

        let graph = Self { stages: indexed };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> KeelResult<()> {
        let mut verified: HashSet<&str> = HashSet::new();

        for start in self.stages.keys() {
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();
            let mut current = Some(start.as_str());

            while let Some(digest) = current {
                if verified.contains(digest) {
                    break;
                }
                if !on_path.insert(digest) {
                    return Err(KeelError::StageCycle {
                        digest: digest.to_string(),
                    });
                }
                path.push(digest);
                current = self.parent_of(digest);
            }

            verified.extend(path);
        }
        Ok(())
    }

    fn parent_of(&self, digest: &str) -> Option<&str> {
        self.stages
            .get(digest)?
            .parent_digest
            .as_deref()
            .filter(|parent| self.stages.contains_key(*parent))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<&Stage> {
        self.stages.get(digest)
    }

    /// Every stage reachable by walking parents from `roots`, roots included
    pub fn ancestor_closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut reachable = HashSet::new();

        for root in roots {
            let mut current = self.stages.get(root).map(|s| s.digest.as_str());
            while let Some(digest) = current {
                if !reachable.insert(digest.to_string()) {
                    break;
                }
                current = self.parent_of(digest);
            }
        }
        reachable
    }

    /// Group `doomed` stages into waves; every stage comes after all of its
    /// doomed children.
    pub fn deletion_waves(&self, doomed: &HashSet<String>) -> Vec<Vec<&Stage>> {
        let mut pending_children: HashMap<&str, usize> =
            doomed.iter().map(|d| (d.as_str(), 0)).collect();
        for digest in doomed {
            if let Some(parent) = self.parent_of(digest) {
                if let Some(count) = pending_children.get_mut(parent) {
                    *count += 1;
                }
            }
        }

        let mut wave: Vec<&str> = pending_children
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(digest, _)| *digest)
            .collect();
        let mut waves = Vec::new();

        while !wave.is_empty() {
            wave.sort_unstable();
            let mut next = Vec::new();
            for digest in &wave {
                if let Some(parent) = self.parent_of(digest) {
                    if let Some(count) = pending_children.get_mut(parent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(parent);
                        }
                    }
                }
            }
            waves.push(wave.iter().filter_map(|d| self.stages.get(*d)).collect());
            wave = next;
        }
        waves
    }
}

/// List every stage and build the graph
pub async fn enumerate(storage: &dyn StageStorage) -> KeelResult<StageGraph> {
    let stages = storage.list_stages().await?;
    debug!("Stages storage {}: {} stages", storage.address(), stages.len());
    StageGraph::build(stages)
}

/// Deletes stages no surviving tag depends on
pub struct StageCollector<'a> {
    storage: &'a dyn StageStorage,
    audit: &'a AuditLog,
    workers: usize,
}

impl<'a> StageCollector<'a> {
    pub fn new(storage: &'a dyn StageStorage, audit: &'a AuditLog, workers: usize) -> Self {
        Self {
            storage,
            audit,
            workers: workers.max(1),
        }
    }

    pub async fn collect(
        &self,
        graph: &StageGraph,
        survivors: &[ImageTag],
        dry_run: bool,
        report: &mut StagesReport,
    ) -> KeelResult<()> {
        let reachable = graph.ancestor_closure(surviving_digests(survivors));
        let doomed: HashSet<String> = graph
            .stages
            .keys()
            .filter(|digest| !reachable.contains(*digest))
            .cloned()
            .collect();

        report.retained = graph.len() - doomed.len();
        info!(
            "{} stages reachable, {} to delete",
            report.retained,
            doomed.len()
        );

        let waves = graph.deletion_waves(&doomed);

        if dry_run {
            report
                .deleted
                .extend(waves.iter().flatten().map(|stage| StageRecord::from(*stage)));
            return Ok(());
        }

        let storage = self.storage;
        let mut attempted = 0;
        let mut failed = 0;
        // parents of stages that are still present
        let mut blocked: HashSet<&str> = HashSet::new();

        for wave in waves {
            let (skipped, wave): (Vec<&Stage>, Vec<&Stage>) = wave
                .into_iter()
                .partition(|stage| blocked.contains(stage.digest.as_str()));
            for stage in skipped {
                debug!("Stage {} skipped, a child stage is still present", stage.digest);
                blocked.extend(graph.parent_of(&stage.digest));
                report.skipped.push(StageRecord::from(stage));
            }

            attempted += wave.len();
            let results: Vec<_> = stream::iter(wave)
                .map(|stage| async move { (stage, storage.delete_stage(stage).await) })
                .buffer_unordered(self.workers)
                .collect()
                .await;

            let mut fatal = None;
            for (stage, result) in results {
                match result {
                    Ok(()) => {
                        debug!("Deleted stage {}", stage.digest);
                        self.audit
                            .record(&AuditEvent::StageDeleted {
                                digest: &stage.digest,
                                location: &stage.location,
                            })
                            .await;
                        report.deleted.push(StageRecord::from(stage));
                    }
                    Err(e) => {
                        warn!("{}", e);
                        failed += 1;
                        blocked.extend(graph.parent_of(&stage.digest));
                        report.failures.push(ItemFailure {
                            item: stage.digest.clone(),
                            reason: e.to_string(),
                        });
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

        if attempted > 0 && failed == attempted {
            return Err(KeelError::PhaseFailed {
                phase: "stages".to_string(),
                failed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::fakes::{custom_tag, stage, FakeStorage};

    fn digests(records: &[StageRecord]) -> Vec<&str> {
        let mut out: Vec<&str> = records.iter().map(|r| r.digest.as_str()).collect();
        out.sort_unstable();
        out
    }

    /// root <- a <- b, root <- c, lone
    fn forest() -> Vec<Stage> {
        vec![
            stage("root", None),
            stage("a", Some("root")),
            stage("b", Some("a")),
            stage("c", Some("root")),
            stage("lone", None),
        ]
    }

    #[test]
    fn cycle_is_rejected() {
        let err = StageGraph::build(vec![
            stage("x", Some("z")),
            stage("y", Some("x")),
            stage("z", Some("y")),
        ])
        .unwrap_err();
        assert!(matches!(err, KeelError::StageCycle { .. }));
    }

    #[test]
    fn self_parent_is_a_cycle() {
        assert!(StageGraph::build(vec![stage("x", Some("x"))]).is_err());
    }

    #[test]
    fn dangling_parent_ends_chain() {
        let graph = StageGraph::build(vec![stage("a", Some("missing"))]).unwrap();
        let closure = graph.ancestor_closure(["a"]);
        assert_eq!(closure, HashSet::from(["a".to_string()]));
    }

    #[test]
    fn closure_walks_to_root() {
        let graph = StageGraph::build(forest()).unwrap();
        let closure = graph.ancestor_closure(["b", "unknown"]);
        assert_eq!(
            closure,
            HashSet::from(["b".to_string(), "a".to_string(), "root".to_string()])
        );
    }

    #[test]
    fn waves_delete_children_first() {
        let graph = StageGraph::build(forest()).unwrap();
        let doomed: HashSet<String> = ["root", "a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let waves: Vec<Vec<&str>> = graph
            .deletion_waves(&doomed)
            .into_iter()
            .map(|w| w.into_iter().map(|s| s.digest.as_str()).collect())
            .collect();

        assert_eq!(waves, vec![vec!["b", "c"], vec!["a"], vec!["root"]]);
    }

    #[tokio::test]
    async fn ancestors_of_survivors_are_kept() {
        let storage = FakeStorage::new(forest());
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[custom_tag("api", "a", "b", 0)], false, &mut report)
            .await
            .unwrap();

        assert_eq!(digests(&report.deleted), vec!["c", "lone"]);
        assert_eq!(report.retained, 3);
        assert_eq!(storage.remaining(), vec!["a", "b", "root"]);
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let storage = FakeStorage::new(forest());
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[], true, &mut report)
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 5);
        assert_eq!(storage.remaining().len(), 5);
    }

    #[tokio::test]
    async fn whole_chain_removed_in_order() {
        // FakeStorage refuses to delete a stage that still has children
        let storage = FakeStorage::new(forest());
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[], false, &mut report)
            .await
            .unwrap();

        assert!(report.failures.is_empty());
        assert!(storage.remaining().is_empty());
    }

    #[tokio::test]
    async fn failure_does_not_block_others() {
        let storage = FakeStorage::new(forest()).failing(&["lone"]);
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        StageCollector::new(&storage, &audit, 2)
            .collect(&graph, &[], false, &mut report)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "lone");
        assert_eq!(storage.remaining(), vec!["lone"]);
    }

    #[tokio::test]
    async fn failed_child_keeps_its_ancestors() {
        let storage = FakeStorage::new(forest()).failing(&["b"]);
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[], false, &mut report)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "b");
        assert_eq!(digests(&report.skipped), vec!["a", "root"]);
        assert_eq!(digests(&report.deleted), vec!["c", "lone"]);
        assert_eq!(storage.remaining(), vec!["a", "b", "root"]);
    }

    #[tokio::test]
    async fn only_failed_leaf_fails_the_phase() {
        let storage = FakeStorage::new(vec![stage("root", None), stage("a", Some("root"))])
            .failing(&["a"]);
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        let err = StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[], false, &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, KeelError::PhaseFailed { failed: 1, .. }));
        assert_eq!(digests(&report.skipped), vec!["root"]);
    }

    #[tokio::test]
    async fn missing_cli_is_fatal() {
        let storage = FakeStorage::new(vec![stage("lone", None)]).cli_missing();
        let graph = enumerate(&storage).await.unwrap();
        let audit = AuditLog::disabled();
        let mut report = StagesReport::default();

        let err = StageCollector::new(&storage, &audit, 4)
            .collect(&graph, &[], false, &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, KeelError::CliNotFound { .. }));
    }

    #[tokio::test]
    async fn unreachable_storage_is_fatal() {
        let storage = FakeStorage::new(Vec::new()).unreachable();
        let err = enumerate(&storage).await.unwrap_err();
        assert!(matches!(err, KeelError::StorageUnreachable { .. }));
    }
}
