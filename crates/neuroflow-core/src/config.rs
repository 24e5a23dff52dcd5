use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level neuroflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub study: StudyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// What to analyse: the study layout, the run manifest and the contrasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Root directory the run manifest paths are relative to.
    pub data_root: PathBuf,
    /// Task name, used as the workflow name suffix.
    pub task: String,
    pub subjects: Vec<String>,
    /// Repetition time in seconds.
    #[serde(default = "default_tr")]
    pub tr: f64,
    #[serde(default = "default_high_pass_cutoff")]
    pub high_pass_cutoff: f64,
    /// JSON file holding the event table (array of `EventRow`).
    #[serde(default)]
    pub events_file: Option<PathBuf>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    #[serde(default)]
    pub contrasts: Vec<ContrastSpec>,
}

fn default_tr() -> f64 {
    2.0
}

fn default_high_pass_cutoff() -> f64 {
    100.0
}

/// One functional run in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub subject: String,
    pub number: u32,
    /// Functional image, relative to `data_root`.
    pub func_path: String,
    /// Brain mask, relative to `data_root`.
    pub mask_path: String,
}

/// Statistic computed by a contrast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContrastKind {
    #[default]
    T,
    F,
}

/// A linear contrast over model conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ContrastKind,
    pub conditions: Vec<String>,
    pub weights: Vec<f64>,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scratch directory for per-node work directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Where published outputs go. When unset, outputs are only reported.
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    /// Upper bound on concurrently executing nodes.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Default per-node timeout; nodes may override it.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            out_dir: None,
            max_parallel: default_max_parallel(),
            node_timeout_secs: None,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

/// Logging configuration. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let study = &self.study;
        if study.subjects.is_empty() {
            return Err(FlowError::Config("study.subjects must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for subject in &study.subjects {
            if !seen.insert(subject) {
                return Err(FlowError::Config(format!("duplicate subject '{}'", subject)));
            }
        }
        if !(study.tr > 0.0) {
            return Err(FlowError::Config(format!(
                "study.tr must be positive, got {}",
                study.tr
            )));
        }
        if study.contrasts.is_empty() {
            return Err(FlowError::Config("at least one contrast is required".into()));
        }
        for contrast in &study.contrasts {
            if contrast.conditions.len() != contrast.weights.len() {
                return Err(FlowError::Config(format!(
                    "contrast '{}' has {} conditions but {} weights",
                    contrast.name,
                    contrast.conditions.len(),
                    contrast.weights.len()
                )));
            }
        }
        for subject in &study.subjects {
            if !study.runs.iter().any(|r| &r.subject == subject) {
                return Err(FlowError::Config(format!(
                    "subject '{}' has no runs in the manifest",
                    subject
                )));
            }
        }
        if self.engine.max_parallel == 0 {
            return Err(FlowError::Config("engine.max_parallel must be at least 1".into()));
        }
        Ok(())
    }

    /// Contrast names in declaration order.
    pub fn contrast_names(&self) -> Vec<String> {
        self.study.contrasts.iter().map(|c| c.name.clone()).collect()
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[study]
data_root = "/data/bids"
task = "stroop"
subjects = ["01"]

[[study.runs]]
subject = "01"
number = 1
func_path = "sub-01/func/run-1_bold.nii.gz"
mask_path = "sub-01/func/brainmask.nii.gz"

[[study.contrasts]]
name = "congruent"
conditions = ["congruent"]
weights = [1.0]
"#;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.study.tr, 2.0);
        assert_eq!(config.study.high_pass_cutoff, 100.0);
        assert_eq!(config.engine.work_dir, PathBuf::from("work"));
        assert!(config.engine.max_parallel >= 1);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.study.contrasts[0].kind, ContrastKind::T);
        config.validate().unwrap();
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("NEUROFLOW_TEST_ROOT", "/mnt/study");
        let out = expand_env_vars("root = \"${NEUROFLOW_TEST_ROOT}/bids\"");
        assert_eq!(out, "root = \"/mnt/study/bids\"");

        let untouched = expand_env_vars("${NEUROFLOW_SURELY_UNSET_VAR}");
        assert_eq!(untouched, "${NEUROFLOW_SURELY_UNSET_VAR}");
    }

    #[test]
    fn test_validate_weight_mismatch() {
        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.study.contrasts[0].weights.push(0.5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1 conditions but 2 weights"));
    }

    #[test]
    fn test_validate_subject_without_runs() {
        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.study.subjects.push("02".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subject '02' has no runs"));
    }

    #[test]
    fn test_validate_non_positive_tr() {
        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.study.tr = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/neuroflow.toml")).unwrap_err();
        assert!(matches!(err, FlowError::ConfigNotFound(_)));
    }
}
