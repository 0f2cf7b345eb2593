use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::OidcConfig;
use crate::security::discovery::ProviderDirectory;
use crate::security::error::AuthError;

/// Exchanged access token held until `expires_at`, refreshed once the
/// remaining lifetime drops inside the configured buffer.
#[derive(Debug, Clone)]
struct CachedAccessToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    300
}

/// A token is self-contained when it looks like a signed JWT: three
/// dot-separated segments whose first segment decodes to a JOSE header
/// naming an algorithm. Anything else is an opaque offline/refresh token.
///
/// Some providers issue offline tokens that parse as JWTs; their payload
/// carries `typ` of `Offline` or `Refresh`, and they must still be exchanged
/// rather than verified directly.
pub fn is_self_contained(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return false;
    }
    let Some(header) = decode_json_segment(parts[0]) else {
        return false;
    };
    if header.get("alg").and_then(|v| v.as_str()).is_none() {
        return false;
    }
    if let Some(payload) = decode_json_segment(parts[1]) {
        if let Some(typ) = payload.get("typ").and_then(|v| v.as_str()) {
            if typ.eq_ignore_ascii_case("offline") || typ.eq_ignore_ascii_case("refresh") {
                return false;
            }
        }
    }
    true
}

fn decode_json_segment(segment: &str) -> Option<serde_json::Value> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

/// Exchanges opaque offline/refresh tokens for short-lived access tokens,
/// caching results per offline token.
///
/// Exchanges are single-flighted per offline token: concurrent requests
/// carrying the same token share one provider call, while requests for other
/// tokens (and cache hits) proceed independently. Neither map lock is ever
/// held across the network call.
pub struct TokenExchanger {
    config: OidcConfig,
    directory: Arc<ProviderDirectory>,
    buffer: Duration,
    cache: RwLock<HashMap<String, CachedAccessToken>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenExchanger {
    pub fn new(config: OidcConfig, directory: Arc<ProviderDirectory>) -> Self {
        let buffer = Duration::from_secs(config.access_token_cache_buffer);
        Self {
            config,
            directory,
            buffer,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    async fn fresh(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|cached| Instant::now() + self.buffer < cached.expires_at)
            .map(|cached| cached.access_token.clone())
    }

    /// Resolve an opaque offline token to an access token, exchanging against
    /// the provider when the cache misses or the cached token is inside the
    /// refresh buffer. The returned token has NOT been verified; callers must
    /// always pass it through the credential verifier.
    pub async fn resolve(&self, offline_token: &str) -> Result<String, AuthError> {
        let key = hash_token(offline_token);

        if let Some(access_token) = self.fresh(&key).await {
            debug!("using cached exchanged access token");
            return Ok(access_token);
        }

        let entry_lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = entry_lock.lock().await;

        // Another task holding this key's lock may have exchanged while we
        // waited.
        if let Some(access_token) = self.fresh(&key).await {
            debug!("using access token exchanged by a concurrent request");
            return Ok(access_token);
        }

        let outcome = match self.exchange(offline_token).await {
            Ok((access_token, expires_in)) => {
                self.cache.write().await.insert(
                    key.clone(),
                    CachedAccessToken {
                        access_token: access_token.clone(),
                        expires_at: Instant::now() + Duration::from_secs(expires_in),
                    },
                );
                info!(expires_in = expires_in, "offline token exchanged");
                Ok(access_token)
            }
            Err(err) => {
                // A stale entry must not outlive a failed refresh.
                self.cache.write().await.remove(&key);
                Err(err)
            }
        };

        // Waiters already queued on this key's lock keep serializing among
        // themselves; dropping the entry just bounds the map.
        self.inflight.lock().await.remove(&key);
        outcome
    }

    async fn exchange(&self, offline_token: &str) -> Result<(String, u64), AuthError> {
        let metadata = self.directory.metadata().await?;
        let token_endpoint = metadata.token_endpoint.as_deref().ok_or_else(|| {
            AuthError::ServiceUnavailable("provider publishes no token endpoint".to_string())
        })?;

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.exchange_client_id()),
            ("refresh_token", offline_token),
        ];

        debug!(endpoint = %token_endpoint, "exchanging offline token");
        let response = self
            .directory
            .http()
            .post(token_endpoint)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "token exchange request failed");
                AuthError::ServiceUnavailable(format!("token exchange request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            // The provider rejected the grant; no raw body detail is
            // forwarded to the caller.
            warn!(status = %status, "token exchange rejected by provider");
            return Err(AuthError::ExchangeFailed);
        }

        let body: TokenResponse = response.json().await.map_err(|err| {
            warn!(error = %err, "token exchange returned an unreadable body");
            AuthError::ExchangeFailed
        })?;

        let access_token = body.access_token.ok_or_else(|| {
            warn!("token exchange response carried no access_token");
            AuthError::ExchangeFailed
        })?;
        Ok((access_token, body.expires_in))
    }
}
