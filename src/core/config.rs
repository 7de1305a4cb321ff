//! Configuration management for the bridge server.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion and overrides.

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r#"["']?\$\{([^}:]+)(?::?-?([^}]*))?\}["']?"#).unwrap();
    static ref TRIGGER_PREFIX: Regex = Regex::new(r"^[A-Za-z]+$").unwrap();
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// The OpenAI-compatible upstream
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Function-call bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Upstream model used when the client enables extended thinking
    #[serde(default)]
    pub thinking_model: Option<String>,

    /// Lower bound applied to `max_tokens`
    #[serde(default = "default_min_tokens_limit")]
    pub min_tokens_limit: u32,

    /// Upper bound applied to `max_tokens`
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds for the upstream
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Upstream endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL, without the `/chat/completions` suffix
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bearer key sent upstream
    #[serde(default)]
    pub api_key: String,

    /// Model name mappings (client model -> upstream model). Keys may be
    /// `*` globs or regexes containing `.*`.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            model_mapping: HashMap::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    /// Map a client model name. Exact keys win over patterns; unmapped
    /// names pass through.
    pub fn map_model(&self, model: &str) -> String {
        if let Some(mapped) = self.model_mapping.get(model) {
            return mapped.clone();
        }

        let mut patterns: Vec<(&String, &String)> = self
            .model_mapping
            .iter()
            .filter(|(key, _)| is_pattern(key))
            .collect();
        // Deterministic choice when several patterns match.
        patterns.sort_by(|a, b| {
            b.0.len()
                .cmp(&a.0.len())
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });

        patterns
            .into_iter()
            .find(|(pattern, _)| pattern_matches(pattern, model))
            .map(|(_, mapped)| mapped.clone())
            .unwrap_or_else(|| model.to_string())
    }
}

/// Function-call bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Describe tools in the prompt instead of forwarding them natively
    #[serde(default = "default_bridge_enabled")]
    pub enabled: bool,

    /// Letters of the trigger signal, as in `<<CALL_x1y2z3>>`
    #[serde(default = "default_trigger_prefix")]
    pub trigger_prefix: String,

    /// Tool names recognized in every request, in addition to declared ones
    #[serde(default)]
    pub known_tools: Vec<String>,

    /// Tools whose `command` argument is re-parsed by a shell
    #[serde(default = "default_shell_tools")]
    pub shell_tools: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_bridge_enabled(),
            trigger_prefix: default_trigger_prefix(),
            known_tools: Vec::new(),
            shell_tools: default_shell_tools(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            bridge: BridgeConfig::default(),
            thinking_model: None,
            min_tokens_limit: default_min_tokens_limit(),
            max_tokens_limit: default_max_tokens_limit(),
            verify_ssl: default_verify_ssl(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_bridge_enabled() -> bool {
    true
}

fn default_trigger_prefix() -> String {
    "CALL".to_string()
}

fn default_shell_tools() -> Vec<String> {
    vec!["Bash".to_string()]
}

fn default_min_tokens_limit() -> u32 {
    100
}

fn default_max_tokens_limit() -> u32 {
    65536
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_bridge_rust::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        // Load .env file if it exists (skip in tests to avoid interference)
        #[cfg(not(test))]
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self> {
        #[cfg(not(test))]
        dotenvy::dotenv().ok();

        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to [`from_env`](Self::from_env).
    pub fn load_or_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path, "Config file not found, using environment");
            Self::from_env()
        }
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            self.server.port = port;
        }
        if let Ok(value) = std::env::var("VERIFY_SSL") {
            self.verify_ssl = str_to_bool(&value);
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout;
        }
        if let Ok(api_base) = std::env::var("UPSTREAM_API_BASE") {
            self.upstream.api_base = api_base;
        }
        if let Ok(api_key) = std::env::var("UPSTREAM_API_KEY") {
            self.upstream.api_key = api_key;
        }
        if let Ok(value) = std::env::var("FUNCTION_CALL_BRIDGE") {
            self.bridge.enabled = str_to_bool(&value);
        }
        if let Ok(model) = std::env::var("THINKING_MODEL") {
            self.thinking_model = Some(model).filter(|m| !m.trim().is_empty());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.upstream.api_base.trim().is_empty() {
            bail!("upstream.api_base must not be empty");
        }
        if self.min_tokens_limit > self.max_tokens_limit {
            bail!(
                "min_tokens_limit ({}) exceeds max_tokens_limit ({})",
                self.min_tokens_limit,
                self.max_tokens_limit
            );
        }
        if !TRIGGER_PREFIX.is_match(&self.bridge.trigger_prefix) {
            bail!(
                "bridge.trigger_prefix must be ASCII letters, got {:?}",
                self.bridge.trigger_prefix
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Whether a mapping key is a glob or regex rather than a literal name.
pub fn is_pattern(key: &str) -> bool {
    key.contains('*')
}

fn pattern_matches(pattern: &str, model: &str) -> bool {
    let source = if pattern.contains(".*") {
        pattern.to_string()
    } else {
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    };
    match Regex::new(&format!("^(?:{})$", source)) {
        Ok(re) => re.is_match(model),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Invalid model mapping pattern");
            false
        }
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const OVERRIDE_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "VERIFY_SSL",
        "REQUEST_TIMEOUT_SECS",
        "UPSTREAM_API_BASE",
        "UPSTREAM_API_KEY",
        "FUNCTION_CALL_BRIDGE",
        "THINKING_MODEL",
    ];

    fn clear_overrides() {
        for name in OVERRIDE_VARS {
            unsafe {
                std::env::remove_var(name);
            }
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("BRIDGE_TEST_VAR", "test_value");
        }
        assert_eq!(
            expand_env_vars("api_key: ${BRIDGE_TEST_VAR}"),
            "api_key: test_value"
        );
        unsafe {
            std::env::remove_var("BRIDGE_TEST_VAR");
        }
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_default() {
        unsafe {
            std::env::remove_var("BRIDGE_MISSING_VAR");
        }
        assert_eq!(
            expand_env_vars("api_key: ${BRIDGE_MISSING_VAR:-default_value}"),
            "api_key: default_value"
        );
        assert_eq!(
            expand_env_vars("api_key: ${BRIDGE_MISSING_VAR:default_value}"),
            "api_key: default_value"
        );
        assert_eq!(expand_env_vars("api_key: ${BRIDGE_MISSING_VAR:-}"), "api_key: ");
    }

    #[test]
    fn test_str_to_bool() {
        for value in ["true", "True", "1", "yes", "ON"] {
            assert!(str_to_bool(value), "{value}");
        }
        for value in ["false", "0", "no", "off", "", "invalid"] {
            assert!(!str_to_bool(value), "{value}");
        }
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 18000);
        assert!(config.bridge.enabled);
        assert_eq!(config.bridge.trigger_prefix, "CALL");
        assert_eq!(config.bridge.shell_tools, vec!["Bash".to_string()]);
        assert!(config.verify_ssl);
        assert_eq!(config.thinking_model, None);
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_overrides();
        let temp_file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080

upstream:
  api_base: http://localhost:8000/v1/
  api_key: test_key
  model_mapping:
    claude-sonnet-4: glm-4.6

bridge:
  enabled: false
  known_tools: [TodoWrite]

thinking_model: glm-4.6-thinking
max_tokens_limit: 8192
verify_ssl: false
"#,
        );

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(
            config.upstream.chat_completions_url(),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(config.upstream.api_key, "test_key");
        assert!(!config.bridge.enabled);
        assert_eq!(config.bridge.known_tools, vec!["TodoWrite".to_string()]);
        assert_eq!(config.thinking_model.as_deref(), Some("glm-4.6-thinking"));
        assert_eq!(config.max_tokens_limit, 8192);
        assert!(!config.verify_ssl);
    }

    #[test]
    #[serial]
    fn test_load_config_with_env_vars() {
        clear_overrides();
        unsafe {
            std::env::set_var("BRIDGE_TEST_API_KEY", "env_api_key");
        }
        let temp_file = write_config(
            r#"
upstream:
  api_key: ${BRIDGE_TEST_API_KEY}
"#,
        );

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.upstream.api_key, "env_api_key");

        unsafe {
            std::env::remove_var("BRIDGE_TEST_API_KEY");
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(AppConfig::load("nonexistent_file.yaml").is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let temp_file = write_config("invalid: yaml: content:");
        assert!(AppConfig::load(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_inverted_token_limits() {
        clear_overrides();
        let temp_file = write_config("min_tokens_limit: 500\nmax_tokens_limit: 100\n");
        let err = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("min_tokens_limit"));
    }

    #[test]
    #[serial]
    fn test_rejects_bad_trigger_prefix() {
        clear_overrides();
        let temp_file = write_config("bridge:\n  trigger_prefix: \"CALL<\"\n");
        assert!(AppConfig::load(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_overrides() {
        clear_overrides();
        unsafe {
            std::env::set_var("HOST", "192.168.1.1");
            std::env::set_var("PORT", "9999");
            std::env::set_var("VERIFY_SSL", "false");
            std::env::set_var("UPSTREAM_API_BASE", "http://upstream:9000/v1");
            std::env::set_var("FUNCTION_CALL_BRIDGE", "off");
            std::env::set_var("THINKING_MODEL", "deep-model");
        }

        let temp_file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
verify_ssl: true
"#,
        );
        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server.host, "192.168.1.1");
        assert_eq!(config.server.port, 9999);
        assert!(!config.verify_ssl);
        assert_eq!(config.upstream.api_base, "http://upstream:9000/v1");
        assert!(!config.bridge.enabled);
        assert_eq!(config.thinking_model.as_deref(), Some("deep-model"));

        clear_overrides();
    }

    #[test]
    #[serial]
    fn test_from_env_uses_defaults() {
        clear_overrides();
        unsafe {
            std::env::set_var("UPSTREAM_API_KEY", "sk-env");
        }
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.upstream.api_key, "sk-env");
        assert_eq!(config.upstream.api_base, "https://api.openai.com/v1");
        clear_overrides();
    }

    #[test]
    #[serial]
    fn test_load_or_env_without_file() {
        clear_overrides();
        let config = AppConfig::load_or_env("definitely_missing_config.yaml").unwrap();
        assert_eq!(config.server.port, 18000);
    }

    #[test]
    fn test_map_model() {
        let upstream = UpstreamConfig {
            model_mapping: HashMap::from([
                ("claude-opus-4-5-.*".to_string(), "opus-mapped".to_string()),
                ("claude-*".to_string(), "generic".to_string()),
                ("claude-haiku".to_string(), "haiku-exact".to_string()),
            ]),
            ..Default::default()
        };
        assert_eq!(upstream.map_model("claude-haiku"), "haiku-exact");
        assert_eq!(upstream.map_model("claude-opus-4-5-20251101"), "opus-mapped");
        assert_eq!(upstream.map_model("claude-sonnet-4"), "generic");
        assert_eq!(upstream.map_model("gpt-4"), "gpt-4");
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("gemini-*"));
        assert!(is_pattern("claude-.*"));
        assert!(!is_pattern("gpt-4"));
    }

    #[test]
    fn test_config_serialization() {
        let yaml = serde_yaml::to_string(&AppConfig::default()).unwrap();
        assert!(yaml.contains("api.openai.com"));
        assert!(yaml.contains("trigger_prefix: CALL"));
    }
}
