//! Engine configuration
//!
//! Defaults live here; the environment (loaded via dotenv) and an optional
//! YAML file can override them, and CLI flags override both. Retry ceilings
//! and backoff constants are deliberately configuration, not hard-coded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable names
pub const ENV_BACKEND_URL: &str = "AUTOANALYST_BACKEND_URL";
pub const ENV_BACKEND_MODEL: &str = "AUTOANALYST_BACKEND_MODEL";
pub const ENV_API_KEY: &str = "AUTOANALYST_API_KEY";

/// Module roots the generated code may import. Everything else is a
/// policy violation before the code ever runs.
pub fn default_allowed_imports() -> Vec<String> {
    [
        "pandas",
        "numpy",
        "matplotlib",
        "seaborn",
        "scipy",
        "sklearn",
        "statsmodels",
        "math",
        "statistics",
        "json",
        "datetime",
        "collections",
        "itertools",
        "re",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// All tunables for one engine run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on analyses executed in a single run
    pub max_analyses: u64,
    /// Per-step ceiling on code repair attempts
    pub max_repair_attempts: u32,
    /// Retries for transient backend failures
    pub backend_max_retries: u32,
    /// Initial backoff delay in milliseconds, doubled per retry
    pub backend_backoff_ms: u64,
    /// Token budget for a single backend prompt
    pub context_budget: usize,
    /// Rendered-size threshold that triggers digest compaction
    pub digest_max_tokens: usize,
    /// Rounds whose insights survive compaction verbatim
    pub digest_keep_rounds: u64,
    /// Wall-clock limit for one sandboxed execution, in seconds
    pub exec_timeout_secs: u64,
    /// Simultaneous analyses in concurrent mode (1 = single-loop)
    pub max_concurrency: usize,
    /// Module roots importable by generated code
    pub allowed_imports: Vec<String>,
    /// Where figures, reports and the state database live
    pub output_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_analyses: 10,
            max_repair_attempts: 3,
            backend_max_retries: 3,
            backend_backoff_ms: 2000,
            context_budget: 6000,
            digest_max_tokens: 1200,
            digest_keep_rounds: 3,
            exec_timeout_secs: 300,
            max_concurrency: 1,
            allowed_imports: default_allowed_imports(),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// YAML overlay with every field optional, so a config file only has to
/// mention what it changes.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    pub max_analyses: Option<u64>,
    pub max_repair_attempts: Option<u32>,
    pub backend_max_retries: Option<u32>,
    pub backend_backoff_ms: Option<u64>,
    pub context_budget: Option<usize>,
    pub digest_max_tokens: Option<usize>,
    pub digest_keep_rounds: Option<u64>,
    pub exec_timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub allowed_imports: Option<Vec<String>>,
    pub output_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Load an overlay from a YAML file and apply it on top of `self`.
    pub fn apply_file(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let overlay: ConfigOverlay = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        self.apply(overlay);
        Ok(self)
    }

    pub fn apply(&mut self, overlay: ConfigOverlay) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = overlay.$field { self.$field = v; })*
            };
        }
        take!(
            max_analyses,
            max_repair_attempts,
            backend_max_retries,
            backend_backoff_ms,
            context_budget,
            digest_max_tokens,
            digest_keep_rounds,
            exec_timeout_secs,
            max_concurrency,
            allowed_imports,
            output_dir
        );
    }

    /// Directory figures are written into during execution
    pub fn figure_dir(&self) -> PathBuf {
        self.output_dir.join("figures")
    }

    /// Path of the snapshot database
    pub fn db_path(&self) -> PathBuf {
        self.output_dir.join("projects.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_analyses, 10);
        assert_eq!(config.max_repair_attempts, 3);
        assert_eq!(config.max_concurrency, 1);
        assert!(config.allowed_imports.contains(&"pandas".to_string()));
    }

    #[test]
    fn test_overlay_applies_only_present_fields() {
        let mut config = EngineConfig::default();
        let overlay: ConfigOverlay =
            serde_yaml::from_str("max_analyses: 25\nmax_concurrency: 5\n").unwrap();
        config.apply(overlay);
        assert_eq!(config.max_analyses, 25);
        assert_eq!(config.max_concurrency, 5);
        // untouched fields keep their defaults
        assert_eq!(config.max_repair_attempts, 3);
    }

    #[test]
    fn test_overlay_rejects_unknown_fields() {
        let parsed: Result<ConfigOverlay, _> = serde_yaml::from_str("no_such_knob: 1\n");
        assert!(parsed.is_err());
    }
}
