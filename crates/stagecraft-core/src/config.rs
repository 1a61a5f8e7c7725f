use crate::error::{Result, StageError};
use crate::paths;
use crate::types::Invalidation;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// IterationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    /// Generate/judge rounds before handing the result back to a human.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Extra tries for a failed or malformed generator or judge call, per
    /// attempt.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Extra tries for a failed commit after the write already landed.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
    #[serde(default)]
    pub invalidation: Invalidation,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_transient_retries() -> u32 {
    2
}

fn default_commit_retries() -> u32 {
    1
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            transient_retries: default_transient_retries(),
            commit_retries: default_commit_retries(),
            invalidation: Invalidation::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommitterKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitterKind {
    #[default]
    Snapshot,
    Git,
}

// ---------------------------------------------------------------------------
// CommandsConfig
// ---------------------------------------------------------------------------

/// External programs backing the generator, judge and differ.
///
/// Each is an argv list; the program receives a JSON request on stdin and
/// answers on stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differ: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_chapters")]
    pub default_chapters: u32,
    #[serde(default)]
    pub iteration: IterationConfig,
    #[serde(default)]
    pub committer: CommitterKind,
    #[serde(default)]
    pub commands: CommandsConfig,
}

fn default_version() -> u32 {
    1
}

fn default_chapters() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            default_chapters: default_chapters(),
            iteration: IterationConfig::default(),
            committer: CommitterKind::default(),
            commands: CommandsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(StageError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.iteration.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "iteration.max_attempts must be at least 1".to_string(),
            });
        } else if self.iteration.max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "iteration.max_attempts={} (>10 is unusual; every attempt is a generator and a judge call)",
                    self.iteration.max_attempts
                ),
            });
        }

        if self.iteration.transient_retries > 5 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "iteration.transient_retries={} (>5 is unusual)",
                    self.iteration.transient_retries
                ),
            });
        }

        if self.default_chapters == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "default_chapters=0: new projects start with no chapter stages"
                    .to_string(),
            });
        }

        for (name, argv) in [
            ("generator", &self.commands.generator),
            ("judge", &self.commands.judge),
            ("differ", &self.commands.differ),
        ] {
            if let Some(argv) = argv {
                if argv.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("commands.{name} has an empty program"),
                    });
                }
            }
        }

        if self.commands.timeout_secs == Some(0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "commands.timeout_secs must be greater than 0".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
