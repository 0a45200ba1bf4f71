//! Effective service settings: optional TOML file overlaid with `DEVPROXY_*`
//! environment variables, then defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use devproxy_core::config::{load_config, resolve_config_path, Config, ConfigError};
use devproxy_core::split_command;
use tracing::info;

use crate::session::ConvergenceRule;

pub(crate) const DEFAULT_API_BASE_PATH: &str = "/devproxy/api";
pub(crate) const DEFAULT_AUDITOR_COMMAND: &str = "node tools/site-auditor.js";
pub(crate) const DEFAULT_AUDITOR_IMAGE: &str = "devproxy/site-auditor:latest";
pub(crate) const DEFAULT_INTERNAL_HOSTS: &[&str] = &["dev-proxy", "proxy", "nginx"];

#[derive(Debug, thiserror::Error)]
pub(crate) enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub(crate) struct ContainerSettings {
    pub runtime: String,
    pub image: String,
    pub platform: String,
    pub network: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AuditorSettings {
    /// Empty disables the local strategy.
    pub command: Vec<String>,
    pub internal_hosts: Vec<String>,
    pub local_alias: String,
    /// `None` disables the container fallback.
    pub container: Option<ContainerSettings>,
    pub emulation_multiplier: f64,
    pub emulation_floor: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    /// `{bundle}` in any argument is replaced by the bundle path.
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct HealSettings {
    pub max_passes: u32,
    pub timeout: Duration,
    pub wait: Duration,
    pub convergence: ConvergenceRule,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub bind: String,
    pub port: u16,
    pub api_base_path: String,
    pub admin_token: Option<String>,
    pub routes_dir: PathBuf,
    pub bundle_path: PathBuf,
    pub state_dir: PathBuf,
    pub knowledge_dir: Option<PathBuf>,
    pub ai_enabled: bool,
    pub ai_model: String,
    pub auditor: AuditorSettings,
    pub engine: EngineSettings,
    pub heal: HealSettings,
    pub events_retention: Duration,
    pub events_max: usize,
}

impl Settings {
    /// Resolve the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self, SettingsError> {
        let cfg = match resolve_config_path() {
            Some(path) => {
                info!(path = %path.display(), "loading configuration file");
                load_config(&path)?
            }
            None => Config::default(),
        };
        Self::from_config(&cfg)
    }

    pub fn from_config(cfg: &Config) -> Result<Self, SettingsError> {
        let bind = env_str("DEVPROXY_BIND")
            .or_else(|| cfg.server.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".into());
        let port = env_parse("DEVPROXY_PORT")?
            .or(cfg.server.port)
            .unwrap_or(8095);
        let api_base_path = normalize_base_path(
            &env_str("DEVPROXY_API_BASE_PATH")
                .or_else(|| cfg.server.api_base_path.clone())
                .unwrap_or_else(|| DEFAULT_API_BASE_PATH.into()),
        );
        let admin_token = env_str("DEVPROXY_ADMIN_TOKEN")
            .or_else(|| cfg.server.admin_token.clone())
            .filter(|t| !t.is_empty());

        let path_of = |key: &'static str, file: &Option<String>, default: &str| {
            PathBuf::from(
                env_str(key)
                    .or_else(|| file.clone())
                    .unwrap_or_else(|| default.to_string()),
            )
        };
        let routes_dir = path_of("DEVPROXY_ROUTES_DIR", &cfg.paths.routes_dir, "routes");
        let bundle_path = path_of(
            "DEVPROXY_BUNDLE_PATH",
            &cfg.paths.bundle_path,
            "generated/devproxy-bundle.conf",
        );
        let state_dir = path_of("DEVPROXY_STATE_DIR", &cfg.paths.state_dir, ".devproxy");
        let knowledge_dir = env_str("DEVPROXY_KNOWLEDGE_DIR")
            .or_else(|| cfg.paths.knowledge_dir.clone())
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        let ai_enabled = match env_str("DEVPROXY_AI_ENABLED") {
            Some(raw) => parse_bool(&raw).ok_or(SettingsError::Invalid {
                key: "DEVPROXY_AI_ENABLED",
                value: raw,
            })?,
            None => cfg.ai.enabled.unwrap_or(true),
        };
        let ai_model = env_str("DEVPROXY_AI_MODEL")
            .or_else(|| cfg.ai.model.clone())
            .unwrap_or_else(|| "site-auditor".into());

        let auditor = {
            let a = &cfg.auditor;
            let command = split_command(
                &env_str_allow_empty("DEVPROXY_AUDITOR_CMD")
                    .or_else(|| a.command.clone())
                    .unwrap_or_else(|| DEFAULT_AUDITOR_COMMAND.into()),
            );
            let runtime = env_str_allow_empty("DEVPROXY_AUDITOR_CONTAINER_RUNTIME")
                .or_else(|| a.container_runtime.clone())
                .unwrap_or_else(|| "docker".into());
            let image = env_str_allow_empty("DEVPROXY_AUDITOR_IMAGE")
                .or_else(|| a.image.clone())
                .unwrap_or_else(|| DEFAULT_AUDITOR_IMAGE.into());
            let platform = env_str("DEVPROXY_AUDITOR_PLATFORM")
                .or_else(|| a.platform.clone())
                .unwrap_or_else(|| "linux/amd64".into());
            let network = env_str("DEVPROXY_AUDITOR_NETWORK")
                .or_else(|| a.network.clone())
                .filter(|n| !n.trim().is_empty());
            let container = (!runtime.trim().is_empty() && !image.trim().is_empty()).then(|| {
                ContainerSettings {
                    runtime: runtime.trim().to_string(),
                    image: image.trim().to_string(),
                    platform,
                    network,
                }
            });
            let emulation_multiplier = env_parse::<f64>("DEVPROXY_AUDITOR_EMULATION_MULTIPLIER")?
                .or(a.emulation_multiplier)
                .unwrap_or(2.5);
            if !emulation_multiplier.is_finite() || emulation_multiplier < 0.0 {
                return Err(SettingsError::Invalid {
                    key: "DEVPROXY_AUDITOR_EMULATION_MULTIPLIER",
                    value: emulation_multiplier.to_string(),
                });
            }
            let emulation_multiplier = emulation_multiplier.max(1.0);
            let emulation_floor = Duration::from_millis(
                env_parse("DEVPROXY_AUDITOR_EMULATION_FLOOR_MS")?
                    .or(a.emulation_floor_ms)
                    .unwrap_or(60_000),
            );
            AuditorSettings {
                command,
                internal_hosts: a.internal_hosts.clone().unwrap_or_else(|| {
                    DEFAULT_INTERNAL_HOSTS.iter().map(|h| h.to_string()).collect()
                }),
                local_alias: a.local_alias.clone().unwrap_or_else(|| "localhost".into()),
                container,
                emulation_multiplier,
                emulation_floor,
            }
        };

        let engine = EngineSettings {
            validate_command: split_command(
                &env_str_allow_empty("DEVPROXY_ENGINE_VALIDATE_CMD")
                    .or_else(|| cfg.engine.validate_command.clone())
                    .unwrap_or_else(|| "docker exec dev-proxy nginx -t".into()),
            ),
            reload_command: split_command(
                &env_str_allow_empty("DEVPROXY_ENGINE_RELOAD_CMD")
                    .or_else(|| cfg.engine.reload_command.clone())
                    .unwrap_or_else(|| "docker exec dev-proxy nginx -s reload".into()),
            ),
            probe_timeout: Duration::from_millis(cfg.engine.probe_timeout_ms.unwrap_or(5_000)),
        };

        let convergence = match env_str("DEVPROXY_HEAL_CONVERGENCE").or_else(|| cfg.heal.convergence.clone())
        {
            Some(raw) => ConvergenceRule::from_str(&raw).map_err(|_| SettingsError::Invalid {
                key: "DEVPROXY_HEAL_CONVERGENCE",
                value: raw,
            })?,
            None => ConvergenceRule::default(),
        };
        let heal = HealSettings {
            max_passes: env_parse("DEVPROXY_HEAL_MAX_PASSES")?
                .or(cfg.heal.max_passes)
                .unwrap_or(3),
            timeout: Duration::from_millis(
                env_parse("DEVPROXY_HEAL_TIMEOUT_MS")?
                    .or(cfg.heal.timeout_ms)
                    .unwrap_or(30_000),
            ),
            wait: Duration::from_millis(
                env_parse("DEVPROXY_HEAL_WAIT_MS")?
                    .or(cfg.heal.wait_ms)
                    .unwrap_or(2_000),
            ),
            convergence,
        };

        let events_retention = Duration::from_secs(
            env_parse("DEVPROXY_EVENTS_RETENTION_SECS")?
                .or(cfg.events.retention_secs)
                .unwrap_or(devproxy_events::DEFAULT_RETENTION.as_secs()),
        );
        let events_max = env_parse("DEVPROXY_EVENTS_MAX")?
            .or(cfg.events.max_events)
            .unwrap_or(devproxy_events::DEFAULT_MAX_EVENTS);

        Ok(Self {
            bind,
            port,
            api_base_path,
            admin_token,
            routes_dir,
            bundle_path,
            state_dir,
            knowledge_dir,
            ai_enabled,
            ai_model,
            auditor,
            engine,
            heal,
            events_retention,
            events_max,
        })
    }
}

/// Leading slash, no trailing slash; "/" collapses to "" (routes mounted at the root).
pub(crate) fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Like `env_str` but an explicitly empty value is kept (it disables a command).
fn env_str_allow_empty(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, SettingsError> {
    match env_str(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| SettingsError::Invalid { key, value: raw }),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
