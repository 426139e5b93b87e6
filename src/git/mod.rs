//! Git reference snapshots
//!
//! A cleanup run decides tag liveness against a single, frozen view of the
//! project repository: branch names (local and remote-tracking), tag names
//! and every commit reachable from them. The snapshot is taken once at run
//! start so decisions never observe a moving ref.

use crate::error::{KeelError, KeelResult};
use crate::policy::TagScheme;
use git2::{BranchType, Repository};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Minimum length accepted for an abbreviated commit id
const MIN_COMMIT_PREFIX: usize = 7;

/// Immutable view of the references of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRefSnapshot {
    branches: BTreeSet<String>,
    tags: BTreeSet<String>,
    commits: HashSet<String>,
    absent: bool,
}

impl GitRefSnapshot {
    /// Snapshot of a repository with no references
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of a project that has no repository at all.
    ///
    /// Git-scheme tags cannot be matched to a reference, so policies fall
    /// back to their expiry.
    pub fn absent() -> Self {
        Self {
            absent: true,
            ..Self::default()
        }
    }

    /// Build a snapshot from explicit reference lists
    pub fn new<B, T, C>(branches: B, tags: T, commits: C) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            branches: branches.into_iter().map(Into::into).collect(),
            tags: tags.into_iter().map(Into::into).collect(),
            commits: commits.into_iter().map(Into::into).collect(),
            absent: false,
        }
    }

    /// No repository was found when the snapshot was taken
    pub fn is_absent(&self) -> bool {
        self.absent
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.tags.is_empty() && self.commits.is_empty()
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(String::as_str)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.branches.contains(name)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains(name)
    }

    /// Whether a commit is reachable; accepts abbreviated ids
    pub fn has_commit(&self, id: &str) -> bool {
        if self.commits.contains(id) {
            return true;
        }
        id.len() >= MIN_COMMIT_PREFIX && self.commits.iter().any(|c| c.starts_with(id))
    }

    /// Whether the git reference a tag was published under still exists.
    ///
    /// Custom tags carry no git reference and always count as existing.
    pub fn contains(&self, scheme: TagScheme, reference: &str) -> bool {
        match scheme {
            TagScheme::GitBranch => self.has_branch(reference),
            TagScheme::GitTag => self.has_tag(reference),
            TagScheme::GitCommit => self.has_commit(reference),
            TagScheme::Custom => true,
        }
    }
}

/// Source of the per-run reference snapshot
pub trait RefSource: Send + Sync {
    fn snapshot(&self) -> KeelResult<GitRefSnapshot>;
}

/// A fixed snapshot, for embedding callers that already resolved refs
impl RefSource for GitRefSnapshot {
    fn snapshot(&self) -> KeelResult<GitRefSnapshot> {
        Ok(self.clone())
    }
}

/// Reads reference snapshots from a project directory
#[derive(Debug, Clone)]
pub struct GitResolver {
    project_dir: PathBuf,
}

impl GitResolver {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Take a snapshot of the project repository.
    ///
    /// A project without `.git` yields an absent snapshot. A repository that
    /// exists but cannot be read is fatal: liveness cannot be decided.
    pub fn snapshot(&self) -> KeelResult<GitRefSnapshot> {
        let git_dir = self.project_dir.join(".git");
        if !git_dir.exists() {
            debug!(
                "No git repository at {}, git-scheme tags fall back to expiry",
                self.project_dir.display()
            );
            return Ok(GitRefSnapshot::absent());
        }

        let corrupt = |source| KeelError::GitRepoCorrupt {
            path: self.project_dir.clone(),
            source,
        };

        let repo = Repository::open(&self.project_dir).map_err(corrupt)?;
        let snapshot = read_snapshot(&repo).map_err(corrupt)?;

        debug!(
            "Git snapshot: {} branches, {} tags, {} commits",
            snapshot.branches.len(),
            snapshot.tags.len(),
            snapshot.commits.len()
        );
        Ok(snapshot)
    }
}

impl RefSource for GitResolver {
    fn snapshot(&self) -> KeelResult<GitRefSnapshot> {
        GitResolver::snapshot(self)
    }
}

fn read_snapshot(repo: &Repository) -> Result<GitRefSnapshot, git2::Error> {
    let mut branches = BTreeSet::new();
    for entry in repo.branches(None)? {
        let (branch, kind) = entry?;
        let Some(name) = branch.name()? else {
            continue;
        };
        match kind {
            BranchType::Local => {
                branches.insert(name.to_string());
            }
            BranchType::Remote => {
                if let Some(name) = strip_remote(name) {
                    branches.insert(name.to_string());
                }
            }
        }
    }

    let tags: BTreeSet<String> = repo
        .tag_names(None)?
        .iter()
        .flatten()
        .map(str::to_string)
        .collect();

    let mut commits = HashSet::new();
    let mut walk = repo.revwalk()?;
    walk.push_glob("refs/heads/*")?;
    walk.push_glob("refs/remotes/*")?;
    walk.push_glob("refs/tags/*")?;
    for oid in walk {
        commits.insert(oid?.to_string());
    }

    Ok(GitRefSnapshot {
        branches,
        tags,
        commits,
        absent: false,
    })
}

/// `origin/feature/x` -> `feature/x`; the symbolic `origin/HEAD` is skipped
fn strip_remote(name: &str) -> Option<&str> {
    let (_, branch) = name.split_once('/')?;
    (branch != "HEAD").then_some(branch)
}
