use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";
pub const DEFAULT_AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub gigachat: GigaChatConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the bearer token clients must present.
    #[serde(default = "default_bearer_token_env")]
    pub bearer_token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GigaChatConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_credentials_env")]
    pub credentials_env: String,
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profanity_check: Option<bool>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_ssl_certs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_bundle_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Speak HTTP/2 without ALPN negotiation. GigaChat only streams over HTTP/2.
    #[serde(default)]
    pub http2_prior_knowledge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

/// Secrets resolved from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct GigaChatSecrets {
    pub credentials: Option<String>,
    pub access_token: Option<String>,
    pub password: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_bearer_token_env() -> String {
    "BEARER_TOKEN".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_credentials_env() -> String {
    "GIGACHAT_CREDENTIALS".to_string()
}

fn default_access_token_env() -> String {
    "GIGACHAT_ACCESS_TOKEN".to_string()
}

fn default_password_env() -> String {
    "GIGACHAT_PASSWORD".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("kv_store.json")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_token_env: default_bearer_token_env(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for GigaChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_url: default_auth_url(),
            scope: default_scope(),
            credentials_env: default_credentials_env(),
            access_token_env: default_access_token_env(),
            user: None,
            password_env: default_password_env(),
            model: None,
            profanity_check: None,
            timeout_secs: default_timeout_secs(),
            verify_ssl_certs: true,
            ca_bundle_file: None,
            cert_file: None,
            key_file: None,
            http2_prior_knowledge: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            environment: default_environment(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            gigachat: GigaChatConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl AdapterConfig {
    /// Load config from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Resolve the bearer token clients must present. Required.
    pub fn resolve_bearer_token(&self) -> Result<String> {
        match std::env::var(&self.auth.bearer_token_env) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(AdapterError::config(format!(
                "Environment variable '{}' not set. A bearer token is required to authorize requests.",
                self.auth.bearer_token_env
            ))),
        }
    }

    pub fn resolve_gigachat_secrets(&self) -> GigaChatSecrets {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        GigaChatSecrets {
            credentials: read(&self.gigachat.credentials_env),
            access_token: read(&self.gigachat.access_token_env),
            password: read(&self.gigachat.password_env),
        }
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("gigachat-adapter.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("gigachat-adapter")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(
                PathBuf::from(xdg)
                    .join("gigachat-adapter")
                    .join("config.toml"),
            );
        }
        if let Some(home) = dirs_path() {
            paths.push(
                home.join(".config")
                    .join("gigachat-adapter")
                    .join("config.toml"),
            );
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".gigachat-adapter.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
