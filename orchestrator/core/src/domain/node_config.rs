// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for a build node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Artifact cache location and optional remote tier
// - Local worker pool sizing
// - Build environment defaults
// - Repository URL aliases

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const API_VERSION: &str = "morph/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "morph/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: NodeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub repositories: RepositoriesConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local artifact directory
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Remote artifact cache consulted on local misses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            remote_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of local workers
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Concurrent steps per worker
    #[serde(default = "default_worker_slots")]
    pub slots: usize,

    /// Workers are named `<prefix>-<n>`
    #[serde(default = "default_worker_prefix")]
    pub name_prefix: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            slots: default_worker_slots(),
            name_prefix: default_worker_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Default `-j` for chunks that do not set `max-jobs`
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,

    /// Scratch space for step build directories
    #[serde(default = "default_tempdir")]
    pub tempdir: PathBuf,

    /// Keep building independent steps after a failure
    #[serde(default = "default_true")]
    pub keep_going: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            tempdir: default_tempdir(),
            keep_going: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    /// Directory holding local clones, one per repository name
    #[serde(default = "default_repo_dir")]
    pub base_dir: PathBuf,

    /// Prefix aliases, e.g. `upstream` -> `https://git.example.org/delta/%s`
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            base_dir: default_repo_dir(),
            aliases: HashMap::new(),
        }
    }
}

impl RepositoriesConfig {
    /// Expands an `alias:name` repository reference using the alias table
    pub fn expand(&self, repo: &str) -> String {
        if let Some((prefix, rest)) = repo.split_once(':') {
            if let Some(pattern) = self.aliases.get(prefix) {
                return pattern.replace("%s", rest);
            }
        }
        repo.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Buffered events per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("morph")
        .join("artifacts")
}

fn default_repo_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("morph")
        .join("gits")
}

fn default_tempdir() -> PathBuf {
    std::env::temp_dir().join("morph")
}

fn default_worker_count() -> usize {
    1
}

fn default_worker_slots() -> usize {
    1
}

fn default_worker_prefix() -> String {
    "worker".to_string()
}

fn default_max_jobs() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "morph-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. MORPH_CONFIG_PATH environment variable
    /// 2. ./morph-config.yaml (working directory)
    /// 3. ~/.morph/config.yaml (user home)
    /// 4. /etc/morph/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MORPH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./morph-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".morph").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/morph/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MORPH_CACHE_DIR") {
            tracing::info!("Environment override: MORPH_CACHE_DIR={}", val);
            self.spec.cache.dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MORPH_REMOTE_CACHE_URL") {
            tracing::info!("Environment override: MORPH_REMOTE_CACHE_URL={}", val);
            self.spec.cache.remote_url = (!val.is_empty()).then_some(val);
        }

        if let Ok(val) = std::env::var("MORPH_WORKERS") {
            match val.parse::<usize>() {
                Ok(count) => {
                    tracing::info!("Environment override: MORPH_WORKERS={}", count);
                    self.spec.workers.count = count;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for MORPH_WORKERS: '{}'. Expected a number. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("MORPH_MAX_JOBS") {
            match val.parse::<u32>() {
                Ok(jobs) => {
                    tracing::info!("Environment override: MORPH_MAX_JOBS={}", jobs);
                    self.spec.build.max_jobs = jobs;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for MORPH_MAX_JOBS: '{}'. Expected a number. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.cache.dir.as_os_str().is_empty() {
            anyhow::bail!("spec.cache.dir cannot be empty");
        }

        if self.spec.workers.count == 0 {
            anyhow::bail!("spec.workers.count must be at least 1");
        }

        if self.spec.workers.slots == 0 {
            anyhow::bail!("spec.workers.slots must be at least 1");
        }

        if self.spec.build.max_jobs == 0 {
            anyhow::bail!("spec.build.max_jobs must be at least 1");
        }

        if self.spec.coordinator.event_capacity == 0 {
            anyhow::bail!("spec.coordinator.event_capacity must be at least 1");
        }

        if let Some(url) = &self.spec.cache.remote_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("spec.cache.remote_url must be an http(s) URL, got '{}'", url);
            }
        }

        for (alias, pattern) in &self.spec.repositories.aliases {
            if !pattern.contains("%s") {
                anyhow::bail!("Repository alias '{}' pattern must contain %s", alias);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfigManifest::default();
        assert_eq!(manifest.api_version, "morph/v1");
        assert_eq!(manifest.kind, "NodeConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.workers.count, 1);
        assert!(manifest.spec.cache.remote_url.is_none());
    }

    #[test]
    fn test_parse_partial_spec() {
        let yaml = r#"
apiVersion: morph/v1
kind: NodeConfig
metadata:
  name: builder-1
spec:
  workers:
    count: 4
  cache:
    dir: /srv/morph/artifacts
    remote_url: http://cache.example.org:8080/
  repositories:
    aliases:
      upstream: "https://git.example.org/delta/%s"
"#;
        let manifest = NodeConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.workers.count, 4);
        assert_eq!(manifest.spec.workers.slots, 1);
        assert_eq!(manifest.spec.cache.dir, PathBuf::from("/srv/morph/artifacts"));
        assert!(manifest.validate().is_ok());
        assert_eq!(
            manifest.spec.repositories.expand("upstream:gcc"),
            "https://git.example.org/delta/gcc"
        );
        assert_eq!(manifest.spec.repositories.expand("/local/repo"), "/local/repo");
    }

    #[test]
    fn test_validation() {
        let mut manifest = NodeConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.workers.count = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.workers.count = 2;

        manifest.spec.cache.remote_url = Some("ftp://cache".to_string());
        assert!(manifest.validate().is_err());
        manifest.spec.cache.remote_url = None;

        manifest
            .spec
            .repositories
            .aliases
            .insert("bad".to_string(), "https://example.org/".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut manifest = NodeConfigManifest::default();
        manifest.metadata.name = "node-a".to_string();
        manifest.spec.build.keep_going = false;
        manifest.to_yaml_file(&path).unwrap();

        let loaded = NodeConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "node-a");
        assert!(!loaded.spec.build.keep_going);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let result = NodeConfigManifest::load_or_default(Some(PathBuf::from("/nonexistent/morph.yaml")));
        assert!(result.is_err());
    }
}
