//! Process configuration, read from the environment.
//!
//! `.env` is loaded by the binary before [`Config::from_env`] runs. Every
//! value has a default so an empty environment yields a runnable config.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_BIND: &str = "127.0.0.1:8318";
const DEFAULT_PROVIDER: &str = "glm";
const DEFAULT_RUNTIME_BIN: &str = "claude";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub home: PathBuf,
    pub plugins: PluginPaths,
    /// YAML file replacing the built-in provider set.
    pub providers_file: Option<PathBuf>,
    pub default_provider: String,
    pub runtime: RuntimeConfig,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PluginPaths {
    pub bundled: PathBuf,
    pub installed: PathBuf,
    pub external: Vec<PathBuf>,
    pub config_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub binary: PathBuf,
    pub cwd: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_raw = get("IRONRELAY_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: "IRONRELAY_BIND".to_string(),
            message: format!("{bind_raw}: {e}"),
        })?;

        let home = get("IRONRELAY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        let plugins_root = home.join("plugins");
        let plugins = PluginPaths {
            bundled: get("IRONRELAY_BUNDLED_PLUGINS")
                .map(PathBuf::from)
                .unwrap_or_else(|| plugins_root.join("bundled")),
            installed: get("IRONRELAY_INSTALLED_PLUGINS")
                .map(PathBuf::from)
                .unwrap_or_else(|| plugins_root.join("installed")),
            external: get("IRONRELAY_PLUGIN_PATHS")
                .map(|raw| std::env::split_paths(&raw).collect())
                .unwrap_or_default(),
            config_file: get("IRONRELAY_PLUGIN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| plugins_root.join("config.json")),
        };

        let session_ttl = Duration::from_secs(parse_secs(&get, "IRONRELAY_SESSION_TTL_SECS", 3600)?);
        let sweep_interval =
            Duration::from_secs(parse_secs(&get, "IRONRELAY_SWEEP_INTERVAL_SECS", 300)?);
        if sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "IRONRELAY_SWEEP_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let heartbeat = match parse_secs(&get, "IRONRELAY_HEARTBEAT_SECS", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            bind,
            plugins,
            providers_file: get("IRONRELAY_PROVIDERS_FILE").map(PathBuf::from),
            default_provider: get("DEFAULT_MODEL_CONFIG")
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            runtime: RuntimeConfig {
                binary: get("IRONRELAY_RUNTIME_BIN")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BIN)),
                cwd: get("IRONRELAY_AGENT_CWD").map(PathBuf::from),
            },
            session_ttl,
            sweep_interval,
            heartbeat,
            home,
        })
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ironrelay")
}

fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("IRONRELAY_HOME", "/srv/relay")]).unwrap();
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert_eq!(config.plugins.bundled, PathBuf::from("/srv/relay/plugins/bundled"));
        assert_eq!(
            config.plugins.config_file,
            PathBuf::from("/srv/relay/plugins/config.json")
        );
        assert!(config.plugins.external.is_empty());
        assert_eq!(config.default_provider, "glm");
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert!(config.heartbeat.is_none());
        assert!(config.providers_file.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("IRONRELAY_BIND", "0.0.0.0:9000"),
            ("IRONRELAY_PLUGIN_PATHS", "/opt/a:/opt/b"),
            ("DEFAULT_MODEL_CONFIG", "claude-router"),
            ("IRONRELAY_HEARTBEAT_SECS", "15"),
            ("IRONRELAY_AGENT_CWD", "/work"),
        ])
        .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(
            config.plugins.external,
            [PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
        assert_eq!(config.default_provider, "claude-router");
        assert_eq!(config.heartbeat, Some(Duration::from_secs(15)));
        assert_eq!(config.runtime.cwd, Some(PathBuf::from("/work")));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("DEFAULT_MODEL_CONFIG", "  ")]).unwrap();
        assert_eq!(config.default_provider, "glm");
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let err = config(&[("IRONRELAY_SESSION_TTL_SECS", "an hour")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "IRONRELAY_SESSION_TTL_SECS"));

        assert!(config(&[("IRONRELAY_SWEEP_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("IRONRELAY_BIND", "localhost")]).is_err());
    }
}
