use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::security::discovery::{get_json_with_retry, ProviderDirectory};
use crate::security::error::AuthError;

/// A verification key published by the provider.
pub struct VerificationKey {
    pub algorithm: Algorithm,
    pub decoding_key: DecodingKey,
}

/// Immutable snapshot of the provider's published signing keys.
///
/// Replaced wholesale on refresh; existing requests keep reading the snapshot
/// they resolved.
pub struct KeySet {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

impl KeySet {
    pub fn find(&self, kid: Option<&str>, algorithm: Algorithm) -> Option<&VerificationKey> {
        match kid {
            Some(kid) => self.keys.get(kid).filter(|k| k.algorithm == algorithm),
            // Tokens without a kid fall back to any key declaring the same
            // algorithm, matching provider behavior for single-key realms.
            None => self.keys.values().find(|k| k.algorithm == algorithm),
        }
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn from_jwks(jwks: &JwkSet) -> Self {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("skipping published key without kid");
                continue;
            };
            // RSA keys without an explicit alg default to RS256, the scheme
            // this gateway expects.
            let algorithm = match jwk.common.key_algorithm {
                Some(KeyAlgorithm::RS256) | None => Algorithm::RS256,
                Some(KeyAlgorithm::RS384) => Algorithm::RS384,
                Some(KeyAlgorithm::RS512) => Algorithm::RS512,
                Some(other) => {
                    debug!(kid = %kid, alg = ?other, "skipping key with unsupported algorithm");
                    continue;
                }
            };
            if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
                debug!(kid = %kid, "skipping non-RSA key");
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(decoding_key) => {
                    keys.insert(
                        kid,
                        VerificationKey {
                            algorithm,
                            decoding_key,
                        },
                    );
                }
                Err(err) => {
                    warn!(kid = %kid, error = %err, "failed to build decoding key from JWK");
                }
            }
        }
        Self {
            keys,
            fetched_at: Instant::now(),
        }
    }
}

/// Shared key-set cache with TTL expiry and single-flighted refresh.
pub struct KeyCache {
    ttl: Duration,
    inner: RwLock<Option<Arc<KeySet>>>,
    refresh: Mutex<()>,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    async fn fresh(&self) -> Option<Arc<KeySet>> {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .filter(|ks| ks.fetched_at.elapsed() < self.ttl)
            .map(Arc::clone)
    }

    /// Current key set, fetching from the provider on miss or expiry.
    ///
    /// Concurrent misses are single-flighted: one task fetches while the rest
    /// await the refresh lock and then re-read the cache.
    pub async fn get(&self, directory: &ProviderDirectory) -> Result<Arc<KeySet>, AuthError> {
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }

        let _guard = self.refresh.lock().await;
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }
        self.fetch_locked(directory).await
    }

    /// Force one refresh for a token whose kid is absent from the cache.
    ///
    /// If another task already replaced the snapshot the caller observed, the
    /// newer snapshot is returned without a second outbound fetch.
    pub async fn refresh_if_observed(
        &self,
        directory: &ProviderDirectory,
        observed: &KeySet,
    ) -> Result<Arc<KeySet>, AuthError> {
        let _guard = self.refresh.lock().await;
        {
            let guard = self.inner.read().await;
            if let Some(current) = guard.as_ref() {
                if current.fetched_at > observed.fetched_at {
                    return Ok(Arc::clone(current));
                }
            }
        }
        self.fetch_locked(directory).await
    }

    /// Fetch and install a new snapshot. Caller must hold the refresh lock.
    async fn fetch_locked(&self, directory: &ProviderDirectory) -> Result<Arc<KeySet>, AuthError> {
        let metadata = directory.metadata().await?;
        debug!(jwks_uri = %metadata.jwks_uri, "fetching provider key set");
        let jwks: JwkSet = get_json_with_retry(directory.http(), &metadata.jwks_uri).await?;
        let keys = Arc::new(KeySet::from_jwks(&jwks));
        info!(key_count = keys.len(), "provider key set refreshed");
        *self.inner.write().await = Some(Arc::clone(&keys));
        Ok(keys)
    }
}
