//! Layered configuration for conductor.
//!
//! Settings are read from `.conductor/conductor.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! The file always lives in `.conductor/`, whatever `state.state_dir` says:
//! that setting is read from the file, so it only moves the workflow
//! document, the review queue, the lock and the logs.
//!
//! # Configuration File Format
//!
//! ```toml
//! [state]
//! state_dir = ".conductor"
//! cache_ttl_ms = 200
//! update_retries = 3
//!
//! [review]
//! max_iterations = 10
//! max_stalls = 2
//! pass_timeout_secs = 300
//! fix_timeout_secs = 600
//! min_confidence = 0.0
//! digest = "full"
//! cleanup_pass = "slop-cleanup"
//! fixer = ["./scripts/apply-fix.sh"]
//! git_commit = true
//!
//! [[review.passes]]
//! id = "slop-cleanup"
//! command = ["./scripts/scan.sh", "--json"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::review::DigestMode;

/// Directory (relative to the project) holding `conductor.toml`.
/// Not affected by `state.state_dir`.
pub const CONFIG_DIR: &str = ".conductor";

/// File name of the configuration file.
pub const CONFIG_FILE: &str = "conductor.toml";

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// Directory (a single path component) under the project holding state files
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// How long a read stays cached, in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Optimistic-concurrency retries for `update`
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
}

fn default_state_dir() -> String {
    CONFIG_DIR.to_string()
}

fn default_cache_ttl_ms() -> u64 {
    200
}

fn default_update_retries() -> u32 {
    3
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cache_ttl_ms: default_cache_ttl_ms(),
            update_retries: default_update_retries(),
        }
    }
}

/// Convergence loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Iterations before the queue is blocked with `iteration-limit`
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Consecutive unchanged iterations before `stall-detected`
    #[serde(default = "default_max_stalls")]
    pub max_stalls: u32,
    /// Upper bound on a single analysis pass
    #[serde(default = "default_pass_timeout_secs")]
    pub pass_timeout_secs: u64,
    /// Upper bound on a single fix
    #[serde(default = "default_fix_timeout_secs")]
    pub fix_timeout_secs: u64,
    /// Findings below this confidence are recorded as false positives
    #[serde(default)]
    pub min_confidence: f64,
    /// Which finding fields feed the stall digest
    #[serde(default)]
    pub digest: DigestMode,
    /// Pass id run over touched files after each round of fixes
    #[serde(default)]
    pub cleanup_pass: Option<String>,
    /// Command that applies one fix; receives the finding as JSON on stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixer: Option<Vec<String>>,
    /// Commit each iteration's fixes to the project's git repository
    #[serde(default)]
    pub git_commit: bool,
    /// External analysis passes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passes: Vec<PassCommand>,
}

/// An analysis pass run as an external command.
///
/// The scope's files are appended to `command`; the process must print a
/// pass report as JSON on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCommand {
    pub id: String,
    pub command: Vec<String>,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_stalls() -> u32 {
    2
}

fn default_pass_timeout_secs() -> u64 {
    300
}

fn default_fix_timeout_secs() -> u64 {
    600
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_stalls: default_max_stalls(),
            pass_timeout_secs: default_pass_timeout_secs(),
            fix_timeout_secs: default_fix_timeout_secs(),
            min_confidence: 0.0,
            digest: DigestMode::default(),
            cleanup_pass: None,
            fixer: None,
            git_commit: false,
            passes: Vec::new(),
        }
    }
}

impl ReviewSection {
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub review: ReviewSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `.conductor/conductor.toml` under `project_dir`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONDUCTOR_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(v) = parsed("CONDUCTOR_MAX_ITERATIONS", lookup("CONDUCTOR_MAX_ITERATIONS")) {
            self.review.max_iterations = v;
        }
        if let Some(v) = parsed("CONDUCTOR_MAX_STALLS", lookup("CONDUCTOR_MAX_STALLS")) {
            self.review.max_stalls = v;
        }
        if let Some(v) = parsed("CONDUCTOR_CACHE_TTL_MS", lookup("CONDUCTOR_CACHE_TTL_MS")) {
            self.state.cache_ttl_ms = v;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.review.max_iterations == 0 {
            warnings.push("review.max_iterations must be at least 1".to_string());
        }
        if self.review.max_stalls == 0 {
            warnings.push("review.max_stalls must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.review.min_confidence) {
            warnings.push(format!(
                "review.min_confidence {} is outside 0.0..=1.0",
                self.review.min_confidence
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for pass in &self.review.passes {
            if pass.command.is_empty() {
                warnings.push(format!("review.passes '{}' has an empty command", pass.id));
            }
            if !seen.insert(pass.id.as_str()) {
                warnings.push(format!("review.passes id '{}' is duplicated", pass.id));
            }
        }
        if let Some(cleanup) = &self.review.cleanup_pass
            && !seen.contains(cleanup.as_str())
        {
            warnings.push(format!(
                "review.cleanup_pass '{}' does not name a configured pass",
                cleanup
            ));
        }
        if matches!(&self.review.fixer, Some(command) if command.is_empty()) {
            warnings.push("review.fixer must not be an empty command".to_string());
        }
        let dir = Path::new(&self.state.state_dir);
        let single_component = dir.components().count() == 1
            && matches!(dir.components().next(), Some(std::path::Component::Normal(_)));
        if !single_component {
            warnings.push(format!(
                "state.state_dir '{}' must be a single directory name",
                self.state.state_dir
            ));
        }

        warnings
    }
}

/// Runtime configuration: the parsed file plus the project it applies to.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub settings: ConductorToml,
    pub verbose: bool,
}

impl ConductorConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let mut settings = ConductorToml::load_or_default(&project_dir)?;
        settings.apply_env();
        Ok(Self {
            project_dir,
            settings,
            verbose: false,
        })
    }

    /// Load all layers, with CLI flags taking precedence.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_iterations: Option<u32>,
        max_stalls: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(n) = max_iterations {
            config.settings.review.max_iterations = n;
        }
        if let Some(n) = max_stalls {
            config.settings.review.max_stalls = n;
        }
        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(&self.settings.state.state_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.settings.state.cache_ttl_ms)
    }

    pub fn review(&self) -> &ReviewSection {
        &self.settings.review
    }
}
