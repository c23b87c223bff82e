use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MenderError, Result};

/// Top-level Mender configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub tui: TuiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            graph: GraphConfig::default(),
            monitor: MonitorConfig::default(),
            tui: TuiConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// What the controller does with a join whose upstream never delivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStallPolicy {
    /// Keep waiting until the run is reset.
    #[default]
    Block,
    /// Move the join to `error` after it has waited this many seconds.
    FailAfterSecs(u64),
}

/// What happens to in-flight work when an unresolved run is reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Results of the previous run are rejected as soon as they arrive.
    #[default]
    Abort,
    /// Previous work may finish; its results are logged and dropped.
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub join_stall: JoinStallPolicy,
    #[serde(default)]
    pub in_flight: InFlightPolicy,
    /// Capacity of the flow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            join_stall: JoinStallPolicy::default(),
            in_flight: InFlightPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Maximum failures returned by a list query.
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
    /// Rows kept visible in the collapsed list beside the detail panel.
    #[serde(default = "default_collapsed_rows")]
    pub collapsed_rows: usize,
    /// Bound on the activity log.
    #[serde(default = "default_max_activity")]
    pub max_activity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            list_limit: default_list_limit(),
            collapsed_rows: default_collapsed_rows(),
            max_activity: default_max_activity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuiConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Flow definition loaded on startup. Default: the built-in triage flow.
    #[serde(default)]
    pub flow: Option<String>,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            flow: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for TUI log files. Default: <workspace>/logs
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            dir: None,
        }
    }
}

fn default_workspace() -> String { "~/.mender".to_string() }
fn default_event_capacity() -> usize { 256 }
fn default_list_limit() -> usize { 50 }
fn default_collapsed_rows() -> usize { 5 }
fn default_max_activity() -> usize { 100 }
fn default_tick_ms() -> u64 { 100 }
fn default_log_filter() -> String { "mender=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MenderError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| MenderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot drive the runtime.
    pub fn validate(&self) -> Result<()> {
        if self.tui.tick_ms == 0 {
            return Err(MenderError::Config("tui.tick_ms must be at least 1".into()));
        }
        if self.graph.event_capacity == 0 {
            return Err(MenderError::Config(
                "graph.event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Resolve the log directory.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.dir {
            Some(ref dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
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

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_MENDER_LOG_DIR", "/var/log/mender");
        let result = expand_env_vars("dir = \"${TEST_MENDER_LOG_DIR}\"");
        assert_eq!(result, "dir = \"/var/log/mender\"");
        std::env::remove_var("TEST_MENDER_LOG_DIR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_MENDER_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_MENDER_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.workspace, "~/.mender");
        assert_eq!(config.graph.join_stall, JoinStallPolicy::Block);
        assert_eq!(config.graph.in_flight, InFlightPolicy::Abort);
        assert_eq!(config.monitor.list_limit, 50);
        assert_eq!(config.monitor.max_activity, 100);
        assert_eq!(config.tui.tick_ms, 100);
        assert_eq!(config.log.filter, "mender=info,warn");
    }

    #[test]
    fn test_stall_policy_forms() {
        let toml_str = r#"
[graph]
join_stall = { fail_after_secs = 30 }
in_flight = "discard"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.graph.join_stall, JoinStallPolicy::FailAfterSecs(30));
        assert_eq!(config.graph.in_flight, InFlightPolicy::Discard);

        let config: AppConfig = toml::from_str("[graph]\njoin_stall = \"block\"\n").unwrap();
        assert_eq!(config.graph.join_stall, JoinStallPolicy::Block);
    }

    #[test]
    fn test_log_dir_defaults_under_workspace() {
        let config: AppConfig = toml::from_str("workspace = \"/tmp/mender-ws\"").unwrap();
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/mender-ws/logs"));
    }
}
