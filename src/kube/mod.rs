//! Live workload scanning
//!
//! Collects the image references of every workload in the cluster so the
//! images phase never deletes a tag something is running. A namespace that
//! cannot be read is reported as a warning and loses protection; a cluster
//! that cannot even list namespaces aborts the run.

use crate::error::{KeelError, KeelResult};
use crate::exec::CommandRunner;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Parallel namespace queries
const NAMESPACE_CONCURRENCY: usize = 4;

/// Workload kinds whose pod templates are scanned
const WORKLOAD_KINDS: &str = "pods,replicasets,deployments,statefulsets,daemonsets,jobs,cronjobs";

/// Container list keys in pod specs
const CONTAINER_KEYS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

/// Image references in use by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveImageSet {
    images: HashSet<String>,
}

impl LiveImageSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Record a workload image. A reference pinned as `repo:tag@digest`
    /// protects both `repo:tag` and `repo@digest`.
    pub fn insert(&mut self, reference: &str) {
        let reference = normalize_reference(reference);
        if let Some((named, digest)) = reference.split_once('@') {
            if has_tag(named) {
                self.images.insert(named.to_string());
            }
            self.images
                .insert(format!("{}@{}", strip_tag(named), digest));
            return;
        }
        self.images.insert(reference);
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.images.contains(&normalize_reference(reference))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for LiveImageSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::empty();
        for reference in iter {
            set.insert(reference.as_ref());
        }
        set
    }
}

/// `docker.io/library/nginx:1` and `nginx:1` name the same image
fn normalize_reference(reference: &str) -> String {
    let reference = reference.trim();
    let reference = reference
        .strip_prefix("docker.io/library/")
        .or_else(|| reference.strip_prefix("docker.io/"))
        .unwrap_or(reference);
    reference.to_string()
}

/// Whether the last path component carries a `:tag` (a registry port
/// does not count)
fn has_tag(name: &str) -> bool {
    let last = name.rsplit('/').next().unwrap_or(name);
    last.contains(':')
}

fn strip_tag(name: &str) -> &str {
    if has_tag(name) {
        name.rsplit_once(':').map_or(name, |(repo, _)| repo)
    } else {
        name
    }
}

/// Result of a cluster scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub live: LiveImageSet,
    /// Namespaces that could not be scanned
    pub warnings: Vec<String>,
}

/// Read-only access to cluster workloads
#[async_trait]
pub trait WorkloadLister: Send + Sync {
    /// All namespaces visible to the client
    async fn namespaces(&self) -> KeelResult<Vec<String>>;

    /// Image references of every workload in a namespace
    async fn namespace_images(&self, namespace: &str) -> KeelResult<Vec<String>>;
}

/// Snapshot the images used by live workloads.
///
/// With `without_kube` the cluster is not contacted and nothing is
/// protected.
pub async fn scan(lister: &dyn WorkloadLister, without_kube: bool) -> KeelResult<ScanOutcome> {
    if without_kube {
        debug!("Cluster scan skipped (--without-kube)");
        return Ok(ScanOutcome::default());
    }

    let namespaces = lister.namespaces().await.map_err(|e| match e {
        e @ KeelError::CliNotFound { .. } => e,
        other => KeelError::KubeUnreachable(other.to_string()),
    })?;

    let results: Vec<(String, KeelResult<Vec<String>>)> = stream::iter(namespaces)
        .map(|ns| async move {
            let images = lister.namespace_images(&ns).await;
            (ns, images)
        })
        .buffer_unordered(NAMESPACE_CONCURRENCY)
        .collect()
        .await;

    let mut outcome = ScanOutcome::default();
    for (namespace, result) in results {
        match result {
            Ok(images) => {
                for image in images {
                    outcome.live.insert(&image);
                }
            }
            Err(e) => {
                let err = KeelError::NamespaceScan {
                    namespace,
                    reason: e.to_string(),
                };
                warn!("{}; its images are not protected", err);
                outcome.warnings.push(err.to_string());
            }
        }
    }

    debug!("Cluster uses {} images", outcome.live.len());
    Ok(outcome)
}

/// Parse `kubectl get namespaces -o json`
pub fn parse_namespaces(json: &str) -> KeelResult<Vec<String>> {
    let value: Value = serde_json::from_str(json)?;
    Ok(value["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["metadata"]["name"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

/// Collect every container image referenced anywhere in a kubectl list
pub fn parse_workload_images(json: &str) -> KeelResult<Vec<String>> {
    let value: Value = serde_json::from_str(json)?;
    let mut images = Vec::new();
    collect_images(&value, &mut images);
    images.sort();
    images.dedup();
    Ok(images)
}

fn collect_images(value: &Value, images: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if CONTAINER_KEYS.contains(&key.as_str()) {
                    if let Some(containers) = child.as_array() {
                        images.extend(
                            containers
                                .iter()
                                .filter_map(|c| c["image"].as_str())
                                .map(str::to_string),
                        );
                    }
                } else {
                    collect_images(child, images);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_images(item, images)),
        _ => {}
    }
}

/// Cluster access through the `kubectl` CLI
pub struct KubectlLister {
    runner: CommandRunner,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlLister {
    pub fn new(program: &str, kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            runner: CommandRunner::new(program),
            kubeconfig,
            context,
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref path) = self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        if let Some(ref context) = self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

#[async_trait]
impl WorkloadLister for KubectlLister {
    async fn namespaces(&self) -> KeelResult<Vec<String>> {
        let out = self
            .runner
            .run(&self.args(&["get", "namespaces", "-o", "json"]))
            .await?;
        parse_namespaces(&out)
    }

    async fn namespace_images(&self, namespace: &str) -> KeelResult<Vec<String>> {
        let out = self
            .runner
            .run(&self.args(&["get", WORKLOAD_KINDS, "-n", namespace, "-o", "json"]))
            .await?;
        parse_workload_images(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeCluster {
        namespaces: KeelResult<Vec<String>>,
        images: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl WorkloadLister for FakeCluster {
        async fn namespaces(&self) -> KeelResult<Vec<String>> {
            match &self.namespaces {
                Ok(ns) => Ok(ns.clone()),
                Err(e) => Err(KeelError::Internal(e.to_string())),
            }
        }

        async fn namespace_images(&self, namespace: &str) -> KeelResult<Vec<String>> {
            self.images
                .get(namespace)
                .cloned()
                .ok_or_else(|| KeelError::command_exec("kubectl get", "forbidden"))
        }
    }

    fn cluster() -> FakeCluster {
        FakeCluster {
            namespaces: Ok(vec!["prod".to_string(), "locked".to_string()]),
            images: HashMap::from([(
                "prod".to_string(),
                vec!["registry.example.com/shop/api:main".to_string()],
            )]),
        }
    }

    #[tokio::test]
    async fn without_kube_protects_nothing() {
        let outcome = scan(&cluster(), true).await.unwrap();
        assert!(outcome.live.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn failing_namespace_degrades_to_warning() {
        let outcome = scan(&cluster(), false).await.unwrap();

        assert!(outcome.live.contains("registry.example.com/shop/api:main"));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("locked"));
    }

    #[tokio::test]
    async fn unreachable_cluster_is_fatal() {
        let fake = FakeCluster {
            namespaces: Err(KeelError::Internal("connection refused".to_string())),
            images: HashMap::new(),
        };
        let err = scan(&fake, false).await.unwrap_err();
        assert!(matches!(err, KeelError::KubeUnreachable(_)));
    }

    #[test]
    fn parse_namespace_list() {
        let json = r#"{"kind": "List", "items": [{"metadata": {"name": "default"}}, {"metadata": {"name": "prod"}}]}"#;
        assert_eq!(parse_namespaces(json).unwrap(), vec!["default", "prod"]);
    }

    #[test]
    fn parse_images_from_every_kind() {
        let json = r#"{
            "items": [
                {"kind": "Pod", "spec": {
                    "initContainers": [{"name": "migrate", "image": "registry.example.com/shop/api:main"}],
                    "containers": [{"name": "api", "image": "registry.example.com/shop/api:main"}]
                }},
                {"kind": "Deployment", "spec": {"template": {"spec": {
                    "containers": [{"name": "web", "image": "registry.example.com/shop/web:v1.2.0"}]
                }}}},
                {"kind": "CronJob", "spec": {"jobTemplate": {"spec": {"template": {"spec": {
                    "containers": [{"name": "report", "image": "docker.io/library/busybox:1.36"}]
                }}}}}}
            ]
        }"#;

        let images = parse_workload_images(json).unwrap();
        assert_eq!(
            images,
            vec![
                "docker.io/library/busybox:1.36",
                "registry.example.com/shop/api:main",
                "registry.example.com/shop/web:v1.2.0",
            ]
        );
    }

    #[test]
    fn docker_hub_references_normalized() {
        let live: LiveImageSet = ["docker.io/library/busybox:1.36"].into_iter().collect();
        assert!(live.contains("busybox:1.36"));
        assert!(!live.contains("busybox:1.35"));
    }

    #[test]
    fn pinned_digest_protects_tag_and_digest() {
        let digest = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let live: LiveImageSet = [
            format!("registry.example.com:5000/shop/api:gone-1@{digest}"),
            "registry.example.com:5000/shop/web@sha256:feed".to_string(),
        ]
        .into_iter()
        .collect();

        assert!(live.contains("registry.example.com:5000/shop/api:gone-1"));
        assert!(live.contains(&format!("registry.example.com:5000/shop/api@{digest}")));
        assert!(live.contains("registry.example.com:5000/shop/web@sha256:feed"));
        assert!(!live.contains("registry.example.com:5000/shop/web"));
    }

    #[test]
    fn kubectl_args_include_context() {
        let lister = KubectlLister::new(
            "kubectl",
            Some(PathBuf::from("/etc/kube/config")),
            Some("staging".to_string()),
        );
        assert_eq!(
            lister.args(&["get", "namespaces"]),
            vec!["--kubeconfig", "/etc/kube/config", "--context", "staging", "get", "namespaces"]
        );
    }
}
