//! Optional multi-format loader for [`crate::config::SolveOptions`],
//! gated behind the `config` feature. `spec.md` §1 places configuration
//! loading out of the core's scope, but a host embedding this crate still
//! benefits from the teacher's format-detection + env-substitution
//! pattern (`mofa-kernel::config`) instead of hand-rolling one; carried
//! here as an opt-in convenience, never exercised by the scheduler itself.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use std::path::Path;

use crate::config::SolveOptions;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parsing error: {0}")]
    Parse(String),

    #[error("unsupported config file extension: {0}")]
    UnsupportedFormat(String),
}

pub fn detect_format(path: &str) -> Result<FileFormat, ConfigLoadError> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigLoadError::UnsupportedFormat("no file extension".to_string()))?;
    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "json" => Ok(FileFormat::Json),
        "toml" => Ok(FileFormat::Toml),
        other => Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Substitute `${VAR}` / `$VAR` occurrences with process environment
/// values before handing the text to the format parser.
pub fn substitute_env(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
        std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

/// Load [`SolveOptions`] from a YAML/JSON/TOML file, with environment
/// variables substituted and overrides from `ROMA_` prefixed environment
/// variables layered on top.
pub fn load_solve_options(path: &str) -> Result<SolveOptions, ConfigLoadError> {
    let format = detect_format(path)?;
    let raw = std::fs::read_to_string(path)?;
    let substituted = substitute_env(&raw);
    let cfg = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(Environment::with_prefix("ROMA").separator("__"))
        .build()
        .map_err(|e| ConfigLoadError::Parse(e.to_string()))?;
    cfg.try_deserialize().map_err(|e| ConfigLoadError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_format_from_extension() {
        assert!(matches!(detect_format("x.yaml"), Ok(FileFormat::Yaml)));
        assert!(matches!(detect_format("x.toml"), Ok(FileFormat::Toml)));
        assert!(detect_format("x.exe").is_err());
    }

    #[test]
    fn substitute_env_replaces_braced_and_bare_vars() {
        std::env::set_var("ROMA_TEST_VAR", "42");
        assert_eq!(substitute_env("value: ${ROMA_TEST_VAR}"), "value: 42");
        assert_eq!(substitute_env("value: $ROMA_TEST_VAR"), "value: 42");
    }
}
