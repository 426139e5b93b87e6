//! Chart preparation for deploys
//!
//! Preparing a chart is split into a pure part and a single write:
//!
//! 1. [`SourceTree::read`] loads `.helm/`, `secret-values.yaml` and
//!    `secret/` from the project once.
//! 2. [`ChartPlan::from_source`] turns that into the files of the chart,
//!    decoding secrets through the [`SecretCapability`].
//! 3. [`ChartSession`] adds generated values files, numbered by its own
//!    counter.
//! 4. [`ChartSession::materialize`] writes everything under a target dir.
//!
//! Deploy shares the `project.<name>` lock key space with cleanup.

use crate::error::{KeelError, KeelResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

pub const HELM_DIR: &str = ".helm";
pub const DEFAULT_SECRET_VALUES_FILE: &str = "secret-values.yaml";
pub const SECRET_DIR: &str = "secret";
pub const DECODED_SECRET_DIR: &str = "decoded-secret";
pub const MORE_VALUES_DIR: &str = "more-values";

const HELPERS_TEMPLATE_PATH: &str = "templates/_keel_helpers.tpl";

const HELPERS_TEMPLATE: &str = r#"{{- define "keel_image" -}}
{{- $name := index . 0 -}}
{{- $context := index . 1 -}}
{{- index $context.Values.global.keel.images $name -}}
{{- end -}}

{{- define "keel_secret_file" -}}
{{- $path := index . 0 -}}
{{- $context := index . 1 -}}
{{- $context.Files.Get (print "decoded-secret/" $path) -}}
{{- end -}}
"#;

/// Key material for decoding secrets
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }

    /// Read a key from the first line of a file
    pub fn from_file(path: &Path) -> KeelResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KeelError::io(format!("reading secret key {}", path.display()), e))?;
        let key = raw.trim();
        if key.is_empty() {
            return Err(KeelError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: "secret key file is empty".to_string(),
            });
        }
        Ok(Self::new(key.as_bytes()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes>)", self.0.len())
    }
}

/// What the chart can do with encoded secrets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretCapability {
    /// No key: secret files become empty placeholders
    None,
    /// Decode with the given key material
    Provider(SecretKey),
}

impl SecretCapability {
    /// Decoded content of a file from `secret/`
    fn decode_file(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Provider(_) => trim_trailing_whitespace(data).to_vec(),
        }
    }

    /// Decoded content of the secret values file
    fn decode_values(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None | Self::Provider(_) => data.to_vec(),
        }
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &data[..end]
}

/// Project chart sources, read once
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    /// Files under `.helm/`, relative to it
    pub helm: BTreeMap<PathBuf, Vec<u8>>,
    /// Content of `secret-values.yaml`
    pub secret_values: Option<Vec<u8>>,
    /// Files under `secret/`, relative to it
    pub secrets: BTreeMap<PathBuf, Vec<u8>>,
}

impl SourceTree {
    pub fn read(project_dir: &Path) -> KeelResult<Self> {
        let helm_dir = project_dir.join(HELM_DIR);
        if !helm_dir.is_dir() {
            return Err(KeelError::PathNotFound(helm_dir));
        }

        let secret_values_path = project_dir.join(DEFAULT_SECRET_VALUES_FILE);
        let secret_values = if secret_values_path.is_file() {
            Some(read_file(&secret_values_path)?)
        } else {
            None
        };

        let secret_dir = project_dir.join(SECRET_DIR);
        let secrets = if secret_dir.is_dir() {
            read_dir(&secret_dir)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            helm: read_dir(&helm_dir)?,
            secret_values,
            secrets,
        })
    }
}

fn read_file(path: &Path) -> KeelResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| KeelError::io(format!("reading {}", path.display()), e))
}

fn read_dir(root: &Path) -> KeelResult<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", root.display());
            match e.into_io_error() {
                Some(io) => KeelError::io(context, io),
                None => KeelError::Internal(context),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| KeelError::Internal(e.to_string()))?
            .to_path_buf();
        files.insert(relative, read_file(entry.path())?);
    }
    Ok(files)
}

/// In-memory content of a chart directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartPlan {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl ChartPlan {
    /// Chart files for `source`; the secret values file is left to the
    /// session since it becomes a numbered values file.
    pub fn from_source(source: &SourceTree, capability: &SecretCapability) -> Self {
        let mut files = source.helm.clone();
        files.insert(
            PathBuf::from(HELPERS_TEMPLATE_PATH),
            HELPERS_TEMPLATE.as_bytes().to_vec(),
        );

        for (relative, data) in &source.secrets {
            files.insert(
                Path::new(DECODED_SECRET_DIR).join(relative),
                capability.decode_file(data),
            );
        }

        Self { files }
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files.get(path.as_ref()).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn insert(&mut self, path: PathBuf, data: Vec<u8>) {
        self.files.insert(path, data);
    }
}

/// A chart being prepared for one deploy
#[derive(Debug, Clone)]
pub struct ChartSession {
    plan: ChartPlan,
    more_values_counter: usize,
    values: Vec<PathBuf>,
    set: Vec<String>,
}

impl ChartSession {
    pub fn new(plan: ChartPlan) -> Self {
        Self {
            plan,
            more_values_counter: 0,
            values: Vec::new(),
            set: Vec::new(),
        }
    }

    /// Plan the chart for `source`, including the decoded secret values
    pub fn from_source(source: &SourceTree, capability: &SecretCapability) -> Self {
        let mut session = Self::new(ChartPlan::from_source(source, capability));
        if let Some(ref data) = source.secret_values {
            session.push_values_file(capability.decode_values(data));
        }
        session
    }

    /// Fresh directory name for a temporary chart
    pub fn tmp_chart_dir() -> PathBuf {
        std::env::temp_dir().join(format!("keel-chart-{}", Uuid::new_v4()))
    }

    /// Add a generated values file
    pub fn set_values<T: Serialize>(&mut self, values: &T) -> KeelResult<PathBuf> {
        let data = serde_yaml::to_string(values)?;
        Ok(self.push_values_file(data.into_bytes()))
    }

    /// Add an existing values file by path
    pub fn set_values_file(&mut self, path: impl Into<PathBuf>) {
        self.values.push(path.into());
    }

    /// Add a `key=value` override
    pub fn set_value(&mut self, set: impl Into<String>) {
        self.set.push(set.into());
    }

    fn push_values_file(&mut self, data: Vec<u8>) -> PathBuf {
        let path =
            Path::new(MORE_VALUES_DIR).join(format!("{}.yaml", self.more_values_counter));
        self.more_values_counter += 1;
        self.plan.insert(path.clone(), data);
        self.values.push(path.clone());
        path
    }

    pub fn plan(&self) -> &ChartPlan {
        &self.plan
    }

    /// Values files in order; generated ones are relative to the chart dir
    pub fn values_files(&self) -> &[PathBuf] {
        &self.values
    }

    /// `--values`/`--set` arguments for a chart materialized at `chart_dir`
    pub fn helm_args(&self, chart_dir: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for path in &self.values {
            args.push("--values".to_string());
            args.push(chart_dir.join(path).display().to_string());
        }
        for set in &self.set {
            args.push("--set".to_string());
            args.push(set.clone());
        }
        args
    }

    /// Write the planned chart under `target`
    pub async fn materialize(&self, target: &Path) -> KeelResult<()> {
        for (relative, data) in &self.plan.files {
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KeelError::io(format!("creating {}", parent.display()), e))?;
            }
            write_replacing(&path, data, is_sensitive(relative)).await?;
        }
        debug!(
            "Materialized chart with {} files at {}",
            self.plan.len(),
            target.display()
        );
        Ok(())
    }
}

/// Write through a temp file renamed over `path`, so a read-only file left
/// by an earlier materialization is replaced rather than reopened
async fn write_replacing(path: &Path, data: &[u8], sensitive: bool) -> KeelResult<()> {
    let tmp = path.with_file_name(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| KeelError::io(format!("writing {}", tmp.display()), e))?;
    if sensitive {
        restrict(&tmp).await?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| KeelError::io(format!("replacing {}", path.display()), e))
}

fn is_sensitive(relative: &Path) -> bool {
    relative.starts_with(DECODED_SECRET_DIR) || relative.starts_with(MORE_VALUES_DIR)
}

#[cfg(unix)]
async fn restrict(path: &Path) -> KeelResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
        .await
        .map_err(|e| KeelError::io(format!("restricting {}", path.display()), e))
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> KeelResult<()> {
    Ok(())
}
