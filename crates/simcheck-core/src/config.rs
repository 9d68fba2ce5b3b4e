use config::{Config, ConfigError, File as ConfigFile};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Application-level settings, loaded from an optional `Config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_blob_root")]
    pub blob_root: String,
}

fn default_db_path() -> String {
    "simcheck.db".to_string()
}

fn default_blob_root() -> String {
    ".simcheck/blobs".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_root: default_blob_root(),
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Relative contribution of each scoring signal to the final score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub fingerprint: f64,
    pub ast: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            fingerprint: 0.5,
            ast: 0.5,
        }
    }
}

/// Per-run configuration, persisted as the run's `config_json`.
///
/// Validated once at run creation; unknown and malformed fields are
/// rejected there, never mid-pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// k-gram length for fingerprinting.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Winnowing window size.
    #[serde(default = "default_w")]
    pub w: usize,
    #[serde(default = "default_algo_version")]
    pub algo_version: String,
    #[serde(default)]
    pub weights: ScoreWeights,
    /// When set, the first per-item failure fails the whole run.
    #[serde(default)]
    pub strict: bool,
    /// Minimum shared-fingerprint count for a pair to become a candidate.
    #[serde(default = "default_min_overlap")]
    pub min_overlap: usize,
    /// Fingerprints whose posting list exceeds this are dropped from
    /// candidate indexing (boilerplate guard).
    #[serde(default = "default_max_postings")]
    pub max_postings: usize,
    /// Subtrees smaller than this many tokens are not matched structurally.
    #[serde(default = "default_min_subtree_tokens")]
    pub min_subtree_tokens: usize,
}

fn default_k() -> usize {
    5
}

fn default_w() -> usize {
    4
}

fn default_algo_version() -> String {
    "winnow-v1".to_string()
}

fn default_min_overlap() -> usize {
    1
}

fn default_max_postings() -> usize {
    50
}

fn default_min_subtree_tokens() -> usize {
    8
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            w: default_w(),
            algo_version: default_algo_version(),
            weights: ScoreWeights::default(),
            strict: false,
            min_overlap: default_min_overlap(),
            max_postings: default_max_postings(),
            min_subtree_tokens: default_min_subtree_tokens(),
        }
    }
}

impl RunConfig {
    /// Parse and validate a `config_json` document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: RunConfig = serde_json::from_str(json)
            .map_err(|e| Error::ConfigurationInvalid(e.to_string()))?;
        config.validated()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("run config serializes")
    }

    /// Check value ranges and normalize score weights to sum 1.0.
    pub fn validated(mut self) -> Result<Self, Error> {
        if self.k == 0 || self.k > 256 {
            return Err(Error::ConfigurationInvalid(format!(
                "k must be in 1..=256, got {}",
                self.k
            )));
        }
        if self.w == 0 || self.w > 1024 {
            return Err(Error::ConfigurationInvalid(format!(
                "w must be in 1..=1024, got {}",
                self.w
            )));
        }
        if self.algo_version.is_empty() {
            return Err(Error::ConfigurationInvalid(
                "algo_version must not be empty".to_string(),
            ));
        }
        if self.min_overlap == 0 {
            return Err(Error::ConfigurationInvalid(
                "min_overlap must be at least 1".to_string(),
            ));
        }
        if self.max_postings < 2 {
            return Err(Error::ConfigurationInvalid(format!(
                "max_postings must be at least 2, got {}",
                self.max_postings
            )));
        }
        if self.min_subtree_tokens == 0 {
            return Err(Error::ConfigurationInvalid(
                "min_subtree_tokens must be at least 1".to_string(),
            ));
        }

        let ScoreWeights { fingerprint, ast } = self.weights;
        if !fingerprint.is_finite() || !ast.is_finite() || fingerprint < 0.0 || ast < 0.0 {
            return Err(Error::ConfigurationInvalid(format!(
                "weights must be non-negative, got fingerprint={fingerprint} ast={ast}"
            )));
        }
        let sum = fingerprint + ast;
        if sum <= 0.0 {
            return Err(Error::ConfigurationInvalid(
                "at least one score weight must be positive".to_string(),
            ));
        }
        self.weights = ScoreWeights {
            fingerprint: fingerprint / sum,
            ast: ast / sum,
        };

        Ok(self)
    }
}
