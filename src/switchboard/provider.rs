//! Provider configuration values.
//!
//! A provider config names which backing model endpoint the runtime talks
//! to. Credentials are held by reference (an environment variable name) and
//! only resolved when an invocation needs them.

use std::collections::BTreeMap;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_TIMEOUT_MS: u64 = 600_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Immutable description of one model provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    /// Environment variable holding the auth token.
    pub auth_token_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub small_fast_model: Option<String>,
    #[serde(default)]
    pub sonnet_model: Option<String>,
    #[serde(default)]
    pub opus_model: Option<String>,
    #[serde(default)]
    pub haiku_model: Option<String>,
    /// Environment variable holding a proxy URL, if the provider needs one.
    #[serde(default)]
    pub proxy_env: Option<String>,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Minimal config; the remaining fields take their defaults.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        auth_token_env: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            base_url: base_url.into(),
            auth_token_env: auth_token_env.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            model: None,
            small_fast_model: None,
            sonnet_model: None,
            opus_model: None,
            haiku_model: None,
            proxy_env: None,
            extra_env: BTreeMap::new(),
        }
    }

    /// Resolve the credential reference. Empty values count as missing.
    pub fn credential(&self) -> Option<SecretString> {
        std::env::var(&self.auth_token_env)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }

    /// Resolve the proxy reference, if any.
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_env
            .as_deref()
            .and_then(|key| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }

    /// Check that the endpoint is an http(s) URL and the credential resolves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_endpoint()?;
        if self.credential().is_none() {
            return Err(ConfigError::InvalidConfig {
                name: self.name.clone(),
                reason: format!("auth token not found (env: {})", self.auth_token_env),
            });
        }
        Ok(())
    }

    pub(crate) fn validate_endpoint(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidConfig {
            name: self.name.clone(),
            reason: format!("invalid base_url {}: {}", self.base_url, e),
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::InvalidConfig {
                name: self.name.clone(),
                reason: format!("unsupported base_url scheme: {other}"),
            }),
        }
    }

    /// Environment handed to the runtime process for one invocation.
    ///
    /// The relay's own process environment is left untouched.
    pub fn runtime_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("ANTHROPIC_BASE_URL".to_string(), self.base_url.clone());
        if let Some(token) = self.credential() {
            let token = token.expose_secret().to_string();
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), token.clone());
            env.insert("ANTHROPIC_API_KEY".to_string(), token);
        }
        env.insert("API_TIMEOUT_MS".to_string(), self.timeout_ms.to_string());

        let models = [
            ("ANTHROPIC_MODEL", &self.model),
            ("ANTHROPIC_SMALL_FAST_MODEL", &self.small_fast_model),
            ("ANTHROPIC_DEFAULT_SONNET_MODEL", &self.sonnet_model),
            ("ANTHROPIC_DEFAULT_OPUS_MODEL", &self.opus_model),
            ("ANTHROPIC_DEFAULT_HAIKU_MODEL", &self.haiku_model),
        ];
        for (key, value) in models {
            if let Some(value) = value {
                env.insert(key.to_string(), value.clone());
            }
        }

        if let Some(proxy) = self.proxy_url() {
            env.insert("http_proxy".to_string(), proxy.clone());
            env.insert("https_proxy".to_string(), proxy);
        }

        for (key, value) in &self.extra_env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Providers available when no providers file is configured.
pub fn builtin_providers() -> Vec<ProviderConfig> {
    let mut glm = ProviderConfig::new(
        "glm",
        "https://open.bigmodel.cn/api/anthropic",
        "GLM_AUTH_TOKEN",
    );
    glm.description = "GLM-4 via Anthropic-compatible endpoint".to_string();
    glm.timeout_ms = 3_000_000;
    glm.extra_env.insert(
        "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC".to_string(),
        "1".to_string(),
    );

    let mut router = ProviderConfig::new(
        "claude-router",
        "http://127.0.0.1:3456",
        "CLAUDE_ROUTER_AUTH_TOKEN",
    );
    router.description = "Local Claude Code Router proxy".to_string();
    router.proxy_env = Some("CLAUDE_ROUTER_PROXY".to_string());
    router
        .extra_env
        .insert("DISABLE_TELEMETRY".to_string(), "true".to_string());
    router
        .extra_env
        .insert("DISABLE_COST_WARNINGS".to_string(), "true".to_string());

    vec![glm, router]
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProvidersFile {
    Wrapped { providers: Vec<ProviderConfig> },
    List(Vec<ProviderConfig>),
}

/// Load provider definitions from a YAML file.
///
/// Accepts either a bare list or a `providers:` key holding the list.
pub fn load_providers_file(path: &Path) -> Result<Vec<ProviderConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: ProvidersFile = serde_yaml::from_str(&raw)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
    let providers = match parsed {
        ProvidersFile::Wrapped { providers } => providers,
        ProvidersFile::List(list) => list,
    };
    for provider in &providers {
        provider.validate_endpoint()?;
    }
    Ok(providers)
}
