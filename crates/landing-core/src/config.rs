//! Configuration parsing for the landing daemon.
//!
//! key=value format, read from `.landing/config` in the workspace.
//! Precedence: CLI flags > `--config` file > `.landing/config` > defaults.

use crate::types::{RiskLevel, TaskWeight};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Workspace-relative location of the default config file.
pub const WORKSPACE_CONFIG_PATH: &str = ".landing/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Automation profile. Only `auto` and `fast` wait for CI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Auto,
    Fast,
    Safe,
    Strict,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fast => "fast",
            Self::Safe => "safe",
            Self::Strict => "strict",
        }
    }

    fn is_automated(self) -> bool {
        matches!(self, Self::Auto | Self::Fast)
    }
}

/// Finalize, CI and PR-polling configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,

    // Finalize
    pub finalize_enabled: bool,
    pub finalize_auto_trigger_on_approval: bool,
    pub finalize_risk_assessment: bool,
    pub finalize_rereview_threshold: RiskLevel,
    /// Commands run in the worktree after sync; all must pass.
    pub finalize_test_cmds: Vec<String>,
    pub target_branch: String,

    // Worktrees
    pub branch_prefix: String,
    pub worktree_dir: PathBuf,
    pub worktree_cleanup_on_complete: bool,

    // CI
    pub wait_for_ci: bool,
    pub merge_on_ci_pass: bool,
    pub ci_timeout_sec: u32,
    pub ci_poll_interval_sec: u32,

    // PR polling
    pub pr_poll_interval_sec: u32,
    /// Minimum age of `last_checked_at` before a PR is re-polled.
    /// Unset means half the poll interval.
    pub pr_min_recheck_sec: Option<u32>,

    // Tracker garbage collection
    pub finalize_retention_sec: u32,
    pub finalize_cleanup_interval_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Auto,
            finalize_enabled: true,
            finalize_auto_trigger_on_approval: true,
            finalize_risk_assessment: true,
            finalize_rereview_threshold: RiskLevel::High,
            finalize_test_cmds: Vec::new(),
            target_branch: "main".to_string(),
            branch_prefix: "landing".to_string(),
            worktree_dir: PathBuf::from(".landing/worktrees"),
            worktree_cleanup_on_complete: true,
            wait_for_ci: true,
            merge_on_ci_pass: true,
            ci_timeout_sec: 600,
            ci_poll_interval_sec: 30,
            pr_poll_interval_sec: 60,
            pr_min_recheck_sec: None,
            finalize_retention_sec: 300,
            finalize_cleanup_interval_sec: 60,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load the workspace config (if present) and then an explicit file on top.
    pub fn load(workspace_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let workspace_file = workspace_root.join(WORKSPACE_CONFIG_PATH);
        if workspace_file.exists() {
            config.load_file(&workspace_file)?;
        }
        if let Some(path) = explicit {
            config.load_file(path)?;
        }
        config.resolve_paths(workspace_root);
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single `key=value` setting, e.g. a command-line override.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "profile" => {
                self.profile = match value {
                    "auto" => Profile::Auto,
                    "fast" => Profile::Fast,
                    "safe" => Profile::Safe,
                    "strict" => Profile::Strict,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "profile must be 'auto', 'fast', 'safe', or 'strict', got '{value}'"
                        )))
                    }
                }
            }
            "finalize_enabled" => self.finalize_enabled = Self::parse_bool(key, value)?,
            "finalize_auto_trigger_on_approval" => {
                self.finalize_auto_trigger_on_approval = Self::parse_bool(key, value)?;
            }
            "finalize_risk_assessment" => {
                self.finalize_risk_assessment = Self::parse_bool(key, value)?;
            }
            "finalize_rereview_threshold" => {
                self.finalize_rereview_threshold = match RiskLevel::parse(value) {
                    Some(level) if level != RiskLevel::Unknown => level,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "finalize_rereview_threshold must be 'low', 'medium', 'high', or 'critical', got '{value}'"
                        )))
                    }
                }
            }
            "finalize_test_cmds" => {
                // Pipe-separated list of commands
                self.finalize_test_cmds = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "target_branch" => self.target_branch = value.to_string(),
            "branch_prefix" => self.branch_prefix = value.trim_end_matches('/').to_string(),
            "worktree_dir" => self.worktree_dir = PathBuf::from(value),
            "worktree_cleanup_on_complete" => {
                self.worktree_cleanup_on_complete = Self::parse_bool(key, value)?;
            }
            "wait_for_ci" => self.wait_for_ci = Self::parse_bool(key, value)?,
            "merge_on_ci_pass" => self.merge_on_ci_pass = Self::parse_bool(key, value)?,
            "ci_timeout_sec" => self.ci_timeout_sec = Self::parse_int(key, value)?,
            "ci_poll_interval_sec" => self.ci_poll_interval_sec = Self::parse_int(key, value)?,
            "pr_poll_interval_sec" => self.pr_poll_interval_sec = Self::parse_int(key, value)?,
            "pr_min_recheck_sec" => {
                self.pr_min_recheck_sec = if value.is_empty() {
                    None
                } else {
                    Some(Self::parse_int(key, value)?)
                };
            }
            "finalize_retention_sec" => {
                self.finalize_retention_sec = Self::parse_int(key, value)?;
            }
            "finalize_cleanup_interval_sec" => {
                self.finalize_cleanup_interval_sec = Self::parse_int(key, value)?;
            }
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.worktree_dir.is_relative() {
            self.worktree_dir = workspace_root.join(&self.worktree_dir);
        }
    }

    // --- Derived policy ---

    /// Trivial tasks never need finalize.
    pub fn should_run_finalize(&self, weight: TaskWeight) -> bool {
        self.finalize_enabled && weight != TaskWeight::Trivial
    }

    pub fn should_auto_trigger_finalize_on_approval(&self) -> bool {
        self.finalize_enabled && self.finalize_auto_trigger_on_approval
    }

    pub fn should_wait_for_ci(&self) -> bool {
        self.profile.is_automated() && self.wait_for_ci
    }

    /// Merging requires waiting for CI.
    pub fn should_merge_on_ci_pass(&self) -> bool {
        self.should_wait_for_ci() && self.merge_on_ci_pass
    }

    /// CI timeout, 10 minutes when unset.
    pub fn ci_timeout(&self) -> Duration {
        if self.ci_timeout_sec == 0 {
            Duration::from_secs(600)
        } else {
            Duration::from_secs(u64::from(self.ci_timeout_sec))
        }
    }

    /// CI polling interval, 30 seconds when unset.
    pub fn ci_poll_interval(&self) -> Duration {
        if self.ci_poll_interval_sec == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(u64::from(self.ci_poll_interval_sec))
        }
    }

    /// PR poll tick, 60 seconds when unset.
    pub fn pr_poll_interval(&self) -> Duration {
        if self.pr_poll_interval_sec == 0 {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(u64::from(self.pr_poll_interval_sec))
        }
    }

    pub fn pr_min_recheck(&self) -> Duration {
        match self.pr_min_recheck_sec {
            Some(secs) => Duration::from_secs(u64::from(secs)),
            None => self.pr_poll_interval() / 2,
        }
    }

    pub fn finalize_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.finalize_retention_sec.max(1)))
    }

    pub fn finalize_cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.finalize_cleanup_interval_sec.max(1)))
    }

    /// Branch holding a task's work, e.g. `landing/TASK-001`.
    pub fn task_branch(&self, task_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.profile, Profile::Auto);
        assert!(config.finalize_enabled);
        assert!(config.finalize_auto_trigger_on_approval);
        assert_eq!(config.target_branch, "main");
        assert_eq!(config.finalize_rereview_threshold, RiskLevel::High);
        assert_eq!(config.pr_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.pr_min_recheck(), Duration::from_secs(30));
        assert_eq!(config.finalize_retention(), Duration::from_secs(300));
        assert_eq!(config.finalize_cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# finalize policy
profile="safe"
finalize_auto_trigger_on_approval=no
target_branch='develop'
pr_poll_interval_sec=120
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.profile, Profile::Safe);
        assert!(!config.finalize_auto_trigger_on_approval);
        assert_eq!(config.target_branch, "develop");
        assert_eq!(config.pr_min_recheck(), Duration::from_secs(60));
    }

    #[test]
    fn parse_test_cmds() {
        let mut config = Config::default();
        config
            .parse_content(r#"finalize_test_cmds="cargo test | cargo clippy""#)
            .unwrap();
        assert_eq!(config.finalize_test_cmds, vec!["cargo test", "cargo clippy"]);
    }

    #[test]
    fn explicit_min_recheck_overrides_half_interval() {
        let mut config = Config::default();
        config.parse_content("pr_min_recheck_sec=5").unwrap();
        assert_eq!(config.pr_min_recheck(), Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_errors() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("wait_for_ci=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("ci_timeout_sec=ten"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("profile=yolo"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("just a line"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("not_a_key=1").unwrap();
    }

    #[test]
    fn finalize_eligibility_by_weight() {
        let mut config = Config::default();
        assert!(!config.should_run_finalize(TaskWeight::Trivial));
        assert!(config.should_run_finalize(TaskWeight::Small));
        assert!(config.should_run_finalize(TaskWeight::Large));
        config.finalize_enabled = false;
        assert!(!config.should_run_finalize(TaskWeight::Medium));
        assert!(!config.should_auto_trigger_finalize_on_approval());
    }

    #[test]
    fn ci_waiting_requires_automated_profile() {
        let mut config = Config::default();
        assert!(config.should_wait_for_ci());
        assert!(config.should_merge_on_ci_pass());

        config.profile = Profile::Strict;
        assert!(!config.should_wait_for_ci());
        assert!(!config.should_merge_on_ci_pass());

        config.profile = Profile::Fast;
        config.wait_for_ci = false;
        assert!(!config.should_merge_on_ci_pass());
    }

    #[test]
    fn load_merges_workspace_and_explicit_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".landing")).unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_PATH),
            "target_branch=develop\nbranch_prefix=agents/\n",
        )
        .unwrap();
        let explicit = dir.path().join("override.conf");
        std::fs::write(&explicit, "target_branch=release\n").unwrap();

        let config = Config::load(dir.path(), Some(&explicit)).unwrap();
        assert_eq!(config.target_branch, "release");
        assert_eq!(config.branch_prefix, "agents");
        assert_eq!(config.task_branch("TASK-1"), "agents/TASK-1");
        assert!(config.worktree_dir.starts_with(dir.path()));
    }
}
