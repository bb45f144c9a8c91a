use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::CliError;

const SETTINGS_PREFIX: &str = "JOBS_";

/// Process environment merged with optional `.env` files. File values win.
#[derive(Debug, Clone)]
pub struct EnvManager {
    vars: HashMap<String, String>,
    sensitive_patterns: Vec<String>,
}

impl EnvManager {
    pub fn new() -> Self {
        Self::from_vars(std::env::vars().collect())
    }

    fn from_vars(vars: HashMap<String, String>) -> Self {
        Self {
            vars,
            sensitive_patterns: Self::default_sensitive_patterns(),
        }
    }

    /// Load variables from a .env file
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CliError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read env file {}: {}", path.display(), e))
        })?;

        self.parse_env_content(&content)
    }

    /// Only the `JOBS_*` variables the orchestrator settings are built from.
    pub fn settings_vars(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .filter(|(key, _)| key.starts_with(SETTINGS_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// `JOBS_*` variables with secrets masked, sorted by key, for logging.
    pub fn redacted_settings(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .settings_vars()
            .into_iter()
            .map(|(key, value)| {
                let shown = if self.is_sensitive(&key) {
                    "****".to_string()
                } else {
                    value
                };
                (key, shown)
            })
            .collect();
        out.sort();
        out
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.sensitive_patterns.iter().any(|p| key.contains(p))
    }

    fn parse_env_content(&mut self, content: &str) -> Result<(), CliError> {
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid env file: malformed line {} (expected KEY=VALUE)",
                    line_num + 1
                )));
            };

            let key = key.trim().trim_start_matches("export ").trim();
            if key.is_empty() {
                return Err(CliError::Config(format!(
                    "Invalid env file: empty key at line {}",
                    line_num + 1
                )));
            }

            self.vars
                .insert(key.to_string(), Self::unquote_value(value));
        }

        Ok(())
    }

    fn unquote_value(value: &str) -> String {
        let value = value.trim();

        for quote in ['"', '\''] {
            if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
                return value[1..value.len() - 1].to_string();
            }
        }

        value.to_string()
    }

    fn default_sensitive_patterns() -> Vec<String> {
        ["password", "secret", "token", "key", "auth", "credential"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Default for EnvManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> EnvManager {
        EnvManager::from_vars(HashMap::new())
    }

    #[test]
    fn test_parse_basic_env() {
        let mut env = empty();
        let content = r#"
# Comment
JOBS_POLL_INTERVAL_MS=250
export JOBS_FAILURE_POLICY=fail
        "#;

        env.parse_env_content(content).unwrap();
        assert_eq!(env.vars.get("JOBS_POLL_INTERVAL_MS").unwrap(), "250");
        assert_eq!(env.vars.get("JOBS_FAILURE_POLICY").unwrap(), "fail");
    }

    #[test]
    fn test_parse_quoted_values() {
        let mut env = empty();
        let content = r#"
QUOTED="value with spaces"
SINGLE='single quoted'
UNQUOTED=no_spaces
        "#;

        env.parse_env_content(content).unwrap();
        assert_eq!(env.vars.get("QUOTED").unwrap(), "value with spaces");
        assert_eq!(env.vars.get("SINGLE").unwrap(), "single quoted");
        assert_eq!(env.vars.get("UNQUOTED").unwrap(), "no_spaces");
    }

    #[test]
    fn test_invalid_env_format() {
        let mut env = empty();
        assert!(env.parse_env_content("INVALID LINE WITHOUT EQUALS").is_err());
        assert!(env.parse_env_content("=value").is_err());
    }

    #[test]
    fn settings_vars_keep_prefix_only_and_mask_secrets() {
        let mut env = empty();
        env.parse_env_content(
            "JOBS_EXECUTOR_TOKEN=abc\nJOBS_UNIT_EXECUTOR_URL=http://x\nHOME=/root",
        )
        .unwrap();

        assert_eq!(env.settings_vars().len(), 2);
        assert_eq!(
            env.redacted_settings(),
            vec![
                ("JOBS_EXECUTOR_TOKEN".to_string(), "****".to_string()),
                ("JOBS_UNIT_EXECUTOR_URL".to_string(), "http://x".to_string()),
            ]
        );
    }

    #[test]
    fn file_overrides_process_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "JOBS_CURSOR_BATCH_SIZE=500\n").unwrap();

        let mut env = EnvManager::from_vars(HashMap::from([(
            "JOBS_CURSOR_BATCH_SIZE".to_string(),
            "100".to_string(),
        )]));
        env.load_from_file(&path).unwrap();

        assert_eq!(env.settings_vars()["JOBS_CURSOR_BATCH_SIZE"], "500");
    }
}
