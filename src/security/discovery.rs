use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::config::OidcConfig;
use crate::security::error::AuthError;

/// Bounded retries for provider fetches before surfacing `ServiceUnavailable`.
const FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Subset of the provider's well-known configuration document we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: Option<String>,
    pub jwks_uri: String,
    pub token_endpoint: Option<String>,
}

/// Cached provider metadata shared across requests.
///
/// The discovery document is fetched lazily, cached for the key-set TTL, and
/// refreshed under a single-flight lock: a second task that needs a refresh
/// while one is in flight awaits the lock and then re-reads the cache instead
/// of issuing a duplicate fetch.
#[derive(Debug)]
pub struct ProviderDirectory {
    issuer_url: String,
    ttl: Duration,
    http: Client,
    cache: RwLock<Option<(Arc<ProviderMetadata>, Instant)>>,
    refresh: Mutex<()>,
}

impl ProviderDirectory {
    pub fn new(config: &OidcConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            issuer_url: config.issuer_url.trim_end_matches('/').to_string(),
            ttl: Duration::from_secs(config.jwks_cache_ttl),
            http,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    /// Shared outbound HTTP client, reused by the key-set and exchange paths.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    async fn fresh(&self) -> Option<Arc<ProviderMetadata>> {
        let guard = self.cache.read().await;
        guard
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(meta, _)| Arc::clone(meta))
    }

    /// Current provider metadata, fetching the well-known document on a cache
    /// miss. Concurrent misses result in exactly one outbound fetch.
    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>, AuthError> {
        if let Some(meta) = self.fresh().await {
            return Ok(meta);
        }

        let _guard = self.refresh.lock().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(meta) = self.fresh().await {
            return Ok(meta);
        }

        let url = format!("{}/.well-known/openid-configuration", self.issuer_url);
        debug!(url = %url, "fetching provider discovery document");
        let meta: ProviderMetadata = get_json_with_retry(&self.http, &url).await?;
        let meta = Arc::new(meta);
        *self.cache.write().await = Some((Arc::clone(&meta), Instant::now()));
        Ok(meta)
    }
}

/// GET a JSON document with bounded, jittered retries.
///
/// Transport errors and non-success statuses are retried; exhaustion surfaces
/// as `ServiceUnavailable`, which callers must keep distinct from credential
/// rejections.
pub(crate) async fn get_json_with_retry<T: DeserializeOwned>(
    client: &Client,
    url: &str,
) -> Result<T, AuthError> {
    let mut last_error = String::new();

    for attempt in 1..=FETCH_ATTEMPTS {
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.json::<T>().await {
                        Ok(parsed) => return Ok(parsed),
                        Err(err) => {
                            last_error = format!("invalid response body: {err}");
                        }
                    }
                } else {
                    last_error = format!("provider returned status {status}");
                }
            }
            Err(err) => {
                last_error = format!("request failed: {err}");
            }
        }

        if attempt < FETCH_ATTEMPTS {
            let jitter = rand::thread_rng().gen_range(0..100);
            let backoff = Duration::from_millis(BACKOFF_BASE_MS * u64::from(attempt) + jitter);
            warn!(
                url = %url,
                attempt = attempt,
                error = %last_error,
                "provider fetch failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    error!(url = %url, error = %last_error, "provider fetch exhausted retries");
    Err(AuthError::ServiceUnavailable(last_error))
}
