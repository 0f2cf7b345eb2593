use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// OIDC provider settings for token verification and offline-token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    pub enabled: bool,
    pub issuer_url: String,
    pub client_id: String,
    /// Extra audiences accepted in addition to `client_id`.
    pub allowed_audiences: Vec<String>,
    pub required_scopes: Vec<String>,
    /// TTL for the cached key set and discovery document, in seconds.
    pub jwks_cache_ttl: u64,
    /// Path prefixes that bypass authentication entirely.
    pub skip_paths: Vec<String>,
    pub verify_tls: bool,
    pub offline_token_enabled: bool,
    /// Client id used for refresh-token exchange; falls back to `client_id`.
    pub token_exchange_client_id: String,
    /// Seconds before expiry at which a cached access token is refreshed.
    pub access_token_cache_buffer: u64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer_url: String::new(),
            client_id: String::new(),
            allowed_audiences: Vec::new(),
            required_scopes: Vec::new(),
            jwks_cache_ttl: 3600,
            skip_paths: vec!["/health".to_string(), "/security".to_string()],
            verify_tls: true,
            offline_token_enabled: false,
            token_exchange_client_id: String::new(),
            access_token_cache_buffer: 60,
        }
    }
}

impl OidcConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("OIDC_ENABLED", defaults.enabled),
            issuer_url: std::env::var("OIDC_ISSUER_URL").unwrap_or(defaults.issuer_url),
            client_id: std::env::var("OIDC_CLIENT_ID").unwrap_or(defaults.client_id),
            allowed_audiences: env_list("OIDC_ALLOWED_AUDIENCES").unwrap_or_default(),
            required_scopes: env_list("OIDC_REQUIRED_SCOPES").unwrap_or_default(),
            jwks_cache_ttl: env_or("OIDC_JWKS_CACHE_TTL", defaults.jwks_cache_ttl),
            skip_paths: env_list("OIDC_SKIP_PATHS").unwrap_or(defaults.skip_paths),
            verify_tls: env_bool("OIDC_VERIFY_SSL", defaults.verify_tls),
            offline_token_enabled: env_bool(
                "OIDC_OFFLINE_TOKEN_ENABLED",
                defaults.offline_token_enabled,
            ),
            token_exchange_client_id: std::env::var("OIDC_TOKEN_EXCHANGE_CLIENT_ID")
                .unwrap_or(defaults.token_exchange_client_id),
            access_token_cache_buffer: env_or(
                "OIDC_ACCESS_TOKEN_CACHE_BUFFER",
                defaults.access_token_cache_buffer,
            ),
        }
    }

    /// Enabled and configured well enough to actually verify anything.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.issuer_url.is_empty() && !self.client_id.is_empty()
    }

    pub fn exchange_client_id(&self) -> &str {
        if self.token_exchange_client_id.is_empty() {
            &self.client_id
        } else {
            &self.token_exchange_client_id
        }
    }
}

/// Inbound HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: env_or("SERVER_PORT", defaults.port),
        }
    }
}

/// Limits applied to caller-supplied queries and their execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum accepted query length in bytes.
    pub max_length: usize,
    /// Default row limit passed to the executor when the caller omits one.
    pub default_row_limit: u32,
    /// Hard cap on the caller-supplied row limit.
    pub max_row_limit: u32,
    /// Executor timeout in seconds.
    pub execution_timeout: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            default_row_limit: 100,
            max_row_limit: 1000,
            execution_timeout: 60,
        }
    }
}

impl QueryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_length: env_or("QUERY_MAX_LENGTH", defaults.max_length),
            default_row_limit: env_or("QUERY_DEFAULT_ROW_LIMIT", defaults.default_row_limit),
            max_row_limit: env_or("QUERY_MAX_ROW_LIMIT", defaults.max_row_limit),
            execution_timeout: env_or("DB_QUERY_TIMEOUT", defaults.execution_timeout),
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }
}

/// Top-level gateway configuration, loaded from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub oidc: OidcConfig,
    pub query: QueryConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            oidc: OidcConfig::from_env(),
            query: QueryConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oidc_defaults() {
        let cfg = OidcConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.jwks_cache_ttl, 3600);
        assert_eq!(cfg.access_token_cache_buffer, 60);
        assert_eq!(cfg.skip_paths, vec!["/health", "/security"]);
        assert!(cfg.verify_tls);
        assert!(!cfg.is_active());
    }

    #[test]
    fn exchange_client_falls_back_to_main_client() {
        let mut cfg = OidcConfig {
            client_id: "devlake-mcp".to_string(),
            ..OidcConfig::default()
        };
        assert_eq!(cfg.exchange_client_id(), "devlake-mcp");

        cfg.token_exchange_client_id = "exchange-client".to_string();
        assert_eq!(cfg.exchange_client_id(), "exchange-client");
    }

    #[test]
    fn is_active_requires_issuer_and_client() {
        let cfg = OidcConfig {
            enabled: true,
            issuer_url: "https://sso.example.com/realms/main".to_string(),
            client_id: "devlake-mcp".to_string(),
            ..OidcConfig::default()
        };
        assert!(cfg.is_active());

        let missing_client = OidcConfig {
            enabled: true,
            issuer_url: "https://sso.example.com/realms/main".to_string(),
            ..OidcConfig::default()
        };
        assert!(!missing_client.is_active());
    }

    #[test]
    fn query_defaults() {
        let cfg = QueryConfig::default();
        assert_eq!(cfg.max_length, 10_000);
        assert_eq!(cfg.default_row_limit, 100);
        assert_eq!(cfg.execution_timeout(), Duration::from_secs(60));
    }
}
