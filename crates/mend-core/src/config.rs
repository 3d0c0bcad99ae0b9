//! Configuration parsing for repair sessions.
//!
//! Two file formats are accepted: `key=value` lines (the `.mend/config`
//! format) and YAML for files ending in `.yaml`/`.yml`.
//! Precedence: CLI flags > `--config` file > `.mend/config` > defaults.

use crate::types::StageMode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default location of the workspace config file, relative to the root.
pub const DEFAULT_CONFIG_PATH: &str = ".mend/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Repair session configuration.
///
/// Passed explicitly into the retry loop; nothing here is process-global.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Retry budget
    pub max_attempts: u32,

    // Verification
    pub test_cmd: String,
    pub test_targets: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub verify_timeout_sec: u32,
    pub stage_mode: StageMode,

    // Generation collaborator
    pub generator_cmd: Option<String>,
    pub generator_timeout_sec: u32,
    pub model: String,
    pub context_files: Vec<PathBuf>,
    pub feedback_tail_lines: usize,

    // Patch policy
    pub allow_empty_replacement: bool,

    // Artifacts
    pub log_dir: PathBuf,
    pub summary_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            test_cmd: "pytest -q --disable-warnings --maxfail=1 --color=no".to_string(),
            test_targets: Vec::new(),
            working_dir: None,
            verify_timeout_sec: 300,
            stage_mode: StageMode::Scratch,
            generator_cmd: None,
            generator_timeout_sec: 600,
            model: "gemini-2.5-flash".to_string(),
            context_files: Vec::new(),
            feedback_tail_lines: 160,
            allow_empty_replacement: true,
            log_dir: PathBuf::from("logs/mend"),
            summary_json: true,
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

    /// Load and merge values from a config file.
    ///
    /// Both formats override only the keys they name, so files can be
    /// layered on top of each other.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            self.parse_yaml(&content, &path.display().to_string())
        } else {
            self.parse_content(&content, &path.display().to_string())
        }
    }

    /// Load `.mend/config` under `root` when present.
    pub fn load_workspace_default(&mut self, root: &Path) -> Result<bool, ConfigError> {
        let path = root.join(DEFAULT_CONFIG_PATH);
        if !path.is_file() {
            return Ok(false);
        }
        self.load_file(&path)?;
        Ok(true)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Parse YAML config content, applying each top-level key in turn.
    fn parse_yaml(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        let mapping = match serde_yaml::from_str::<serde_yaml::Value>(content)? {
            serde_yaml::Value::Null => return Ok(()),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::InvalidLine(format!(
                    "{source}: yaml config must be a mapping"
                )))
            }
        };

        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                return Err(ConfigError::InvalidLine(format!(
                    "{source}: non-string key {key:?}"
                )));
            };
            match value {
                serde_yaml::Value::Sequence(items) => {
                    let items = items
                        .into_iter()
                        .map(|item| Self::yaml_scalar(key, item))
                        .collect::<Result<Vec<_>, _>>()?;
                    match key {
                        "test_targets" => {
                            self.test_targets = items.into_iter().map(PathBuf::from).collect();
                        }
                        "context_files" => {
                            self.context_files = items.into_iter().map(PathBuf::from).collect();
                        }
                        _ => self.apply_value(key, &items.join(" "), source)?,
                    }
                }
                scalar => self.apply_value(key, &Self::yaml_scalar(key, scalar)?, source)?,
            }
        }
        Ok(())
    }

    /// Render a YAML scalar the way it would appear in a `key=value` file.
    fn yaml_scalar(key: &str, value: serde_yaml::Value) -> Result<String, ConfigError> {
        match value {
            serde_yaml::Value::Null => Ok(String::new()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::String(s) => Ok(s),
            other => Err(ConfigError::InvalidLine(format!(
                "{key}: expected a scalar, got {other:?}"
            ))),
        }
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

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            "test_cmd" => self.test_cmd = value.to_string(),
            "test_targets" => {
                self.test_targets = value.split_whitespace().map(PathBuf::from).collect();
            }
            "working_dir" => {
                self.working_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "verify_timeout_sec" => self.verify_timeout_sec = Self::parse_int(key, value)?,
            "stage_mode" => {
                self.stage_mode = StageMode::parse(value).ok_or_else(|| {
                    ConfigError::InvalidLine(format!(
                        "stage_mode must be 'scratch' or 'in_place', got '{value}'"
                    ))
                })?;
            }
            "generator_cmd" => {
                self.generator_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "generator_timeout_sec" => self.generator_timeout_sec = Self::parse_int(key, value)?,
            "model" => self.model = value.to_string(),
            "context_files" => {
                self.context_files = value.split_whitespace().map(PathBuf::from).collect();
            }
            "feedback_tail_lines" => self.feedback_tail_lines = Self::parse_int(key, value)?,
            "allow_empty_replacement" => {
                self.allow_empty_replacement = Self::parse_bool(key, value)?;
            }
            "log_dir" => self.log_dir = PathBuf::from(value),
            "summary_json" => self.summary_json = Self::parse_bool(key, value)?,
            // Accepted for compatibility with older pipeline configs.
            "max_retries" => self.max_attempts = Self::parse_int(key, value)?,
            "mode" => {}
            _ => {
                // Warn but don't fail for unknown keys.
                warn!(key = %key, source = %source, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
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

    /// Whether no test targets are configured (patch-only mode).
    pub fn skip_tests(&self) -> bool {
        self.test_targets.is_empty()
    }

    /// Directory the test command runs in.
    pub fn effective_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        let resolve = |path: &Path| {
            if path.is_relative() {
                workspace_root.join(path)
            } else {
                path.to_path_buf()
            }
        };

        self.working_dir = Some(match &self.working_dir {
            Some(dir) => resolve(dir.as_path()),
            None => workspace_root.to_path_buf(),
        });
        self.test_targets = self.test_targets.iter().map(|p| resolve(p.as_path())).collect();
        self.context_files = self.context_files.iter().map(|p| resolve(p.as_path())).collect();
        self.log_dir = resolve(self.log_dir.as_path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_attempts, 4);
        assert!(config.test_cmd.starts_with("pytest"));
        assert!(config.test_targets.is_empty());
        assert!(config.skip_tests());
        assert_eq!(config.verify_timeout_sec, 300);
        assert_eq!(config.stage_mode, StageMode::Scratch);
        assert!(config.generator_cmd.is_none());
        assert_eq!(config.feedback_tail_lines, 160);
        assert!(config.allow_empty_replacement);
        assert!(config.summary_json);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# repair budget
max_attempts=3
test_cmd="python -m pytest -q"
test_targets=tests/test_add.py tests/test_sub.py
stage_mode=in_place
verify_timeout_sec=30
allow_empty_replacement=no
"#;
        config.parse_content(content, "test").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.test_cmd, "python -m pytest -q");
        assert_eq!(
            config.test_targets,
            vec![PathBuf::from("tests/test_add.py"), PathBuf::from("tests/test_sub.py")]
        );
        assert_eq!(config.stage_mode, StageMode::InPlace);
        assert_eq!(config.verify_timeout_sec, 30);
        assert!(!config.allow_empty_replacement);
        assert!(!config.skip_tests());
    }

    #[test]
    fn legacy_max_retries_sets_budget() {
        let mut config = Config::default();
        config.parse_content("mode=auto\nmax_retries=2", "test").unwrap();
        assert_eq!(config.max_attempts, 2);
    }

    #[test]
    fn parse_rejects_bad_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("max_attempts=-1", "test"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("summary_json=maybe", "test"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("stage_mode=elsewhere", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("no equals sign", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("colour=blue\nmax_attempts=2", "test").unwrap();
        assert_eq!(config.max_attempts, 2);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        for value in ["true", "1", "yes", "y", "on", "TRUE"] {
            assert!(Config::parse_bool("test", value).unwrap());
        }
        for value in ["false", "0", "no", "n", "off"] {
            assert!(!Config::parse_bool("test", value).unwrap());
        }
    }

    #[test]
    fn load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "max_attempts: 2\nstage_mode: in_place\ntest_targets:\n  - tests/test_add.py\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.stage_mode, StageMode::InPlace);
        assert_eq!(config.test_targets, vec![PathBuf::from("tests/test_add.py")]);
        // Unspecified keys keep their defaults.
        assert_eq!(config.feedback_tail_lines, 160);
    }

    #[test]
    fn partial_yaml_overrides_only_named_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".mend")).unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_PATH),
            "test_targets=tests/test_add.py\nverify_timeout_sec=30\n",
        )
        .unwrap();
        let override_path = dir.path().join("override.yaml");
        std::fs::write(&override_path, "max_attempts: 2\n").unwrap();

        let mut config = Config::default();
        config.load_workspace_default(dir.path()).unwrap();
        config.load_file(&override_path).unwrap();

        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.test_targets, vec![PathBuf::from("tests/test_add.py")]);
        assert_eq!(config.verify_timeout_sec, 30);
        assert!(!config.skip_tests());
    }

    #[test]
    fn yaml_values_are_validated_like_key_value_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yml");

        std::fs::write(&path, "summary_json: maybe\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::InvalidBool { .. })
        ));

        std::fs::write(&path, "- just\n- a list\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::InvalidLine(_))));

        std::fs::write(&path, "").unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn workspace_default_is_optional() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        assert!(!config.load_workspace_default(dir.path()).unwrap());

        std::fs::create_dir_all(dir.path().join(".mend")).unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_PATH), "max_attempts=7\n").unwrap();
        assert!(config.load_workspace_default(dir.path()).unwrap());
        assert_eq!(config.max_attempts, 7);
    }

    #[test]
    fn resolve_paths_anchors_relative_entries() {
        let mut config = Config {
            test_targets: vec![PathBuf::from("tests"), PathBuf::from("/abs/t.py")],
            context_files: vec![PathBuf::from("README.md")],
            ..Config::default()
        };
        config.resolve_paths(Path::new("/repo"));

        assert_eq!(config.working_dir, Some(PathBuf::from("/repo")));
        assert_eq!(
            config.test_targets,
            vec![PathBuf::from("/repo/tests"), PathBuf::from("/abs/t.py")]
        );
        assert_eq!(config.context_files, vec![PathBuf::from("/repo/README.md")]);
        assert_eq!(config.log_dir, PathBuf::from("/repo/logs/mend"));
    }
}
