use std::path::{Path, PathBuf};

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "configs/devproxy.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{path} does not match the configuration schema: {errors}")]
    Schema { path: PathBuf, errors: String },
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default 127.0.0.1)
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Prefix all API routes live under (default /devproxy/api)
    #[serde(default)]
    pub api_base_path: Option<String>,
    /// Token required on admin routes
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory holding the route source files (`*.conf`)
    #[serde(default)]
    pub routes_dir: Option<String>,
    /// Derived bundle the proxy engine includes
    #[serde(default)]
    pub bundle_path: Option<String>,
    /// Where overrides and other service state are persisted
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Extra issue patterns (`*.toml`)
    #[serde(default)]
    pub knowledge_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AuditorConfig {
    /// Local auditor command, whitespace separated
    #[serde(default)]
    pub command: Option<String>,
    /// Hosts only reachable inside the proxy network
    #[serde(default)]
    pub internal_hosts: Option<Vec<String>>,
    /// Host those internal names are rewritten to for local runs
    #[serde(default)]
    pub local_alias: Option<String>,
    /// Container runtime binary, e.g. docker or podman
    #[serde(default)]
    pub container_runtime: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Pinned platform, e.g. linux/amd64
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub emulation_multiplier: Option<f64>,
    #[serde(default)]
    pub emulation_floor_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Command validating the bundle; the bundle path is appended
    #[serde(default)]
    pub validate_command: Option<String>,
    #[serde(default)]
    pub reload_command: Option<String>,
    #[serde(default)]
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HealConfig {
    #[serde(default)]
    pub max_passes: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
    /// "subset_or_equal" (default), "equal" or "disabled"
    #[serde(default)]
    pub convergence: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    #[serde(default)]
    pub retention_secs: Option<u64>,
    #[serde(default)]
    pub max_events: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Model name reported by the health endpoint
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub auditor: AuditorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub heal: HealConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content, path)
}

fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let raw: toml::Value = toml::from_str(content).map_err(parse_err)?;
    let json_value = serde_json::to_value(&raw).unwrap_or(serde_json::Value::Null);
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Schema {
            path: path.to_path_buf(),
            errors: validation_errors.join(", "),
        });
    }
    toml::from_str(content).map_err(parse_err)
}

/// Resolve the configuration file, if any.
///
/// `DEVPROXY_CONFIG` wins when set (and must exist). Otherwise
/// `configs/devproxy.toml` is looked up next to the executable, its parent,
/// and the current directory.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("DEVPROXY_CONFIG") {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            let p = PathBuf::from(explicit);
            return p.exists().then_some(p);
        }
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.to_path_buf());
            if let Some(parent) = exe_dir.parent() {
                candidates.push(parent.to_path_buf());
            }
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }
    candidates
        .into_iter()
        .map(|base| base.join(DEFAULT_CONFIG_PATH))
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxy.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8099
api_base_path = "/dp/api"

[auditor]
internal_hosts = ["dev-proxy", "edge"]
emulation_multiplier = 3.0

[heal]
max_passes = 4
convergence = "equal"
"#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, Some(8099));
        assert_eq!(cfg.server.api_base_path.as_deref(), Some("/dp/api"));
        assert_eq!(cfg.auditor.internal_hosts.as_ref().map(Vec::len), Some(2));
        assert_eq!(cfg.heal.max_passes, Some(4));
        assert!(cfg.paths.routes_dir.is_none());
    }

    #[test]
    fn schema_rejects_wrong_types_and_unknown_keys() {
        let path = Path::new("inline.toml");
        let err = parse_config("[server]\nport = \"eighty\"\n", path).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
        let err = parse_config("[heal]\nmax_pass = 3\n", path).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
        let err = parse_config("[server\n", path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn schema_json_lists_sections() {
        let schema = config_schema_json();
        let props = schema["properties"].as_object().expect("properties");
        for section in ["server", "paths", "auditor", "engine", "heal", "events", "ai"] {
            assert!(props.contains_key(section), "{section}");
        }
    }
}
