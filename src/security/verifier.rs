use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OidcConfig;
use crate::security::discovery::ProviderDirectory;
use crate::security::error::{from_jwt_error, AuthError};
use crate::security::keys::{KeyCache, VerificationKey};
use crate::security::principal::Principal;

/// Claims extracted from a verified access token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(default)]
    scope: String,
    exp: i64,
}

/// Keycloak-style nested role container.
#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// Verifies bearer tokens against the provider's published signing keys.
pub struct CredentialVerifier {
    config: OidcConfig,
    directory: Arc<ProviderDirectory>,
    keys: KeyCache,
}

impl CredentialVerifier {
    pub fn new(config: OidcConfig, directory: Arc<ProviderDirectory>) -> Self {
        let keys = KeyCache::new(Duration::from_secs(config.jwks_cache_ttl));
        Self {
            config,
            directory,
            keys,
        }
    }

    /// Verify a token's signature and claims and derive the caller Principal.
    ///
    /// A token naming a kid absent from the cached key set forces exactly one
    /// key-set refresh before failing `UnknownKey`.
    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(|err| {
            debug!(error = %err, "failed to decode token header");
            AuthError::MalformedToken
        })?;

        if !matches!(
            header.alg,
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512
        ) {
            warn!(alg = ?header.alg, "token declares a non-RSA algorithm");
            return Err(AuthError::InvalidSignature);
        }

        let kid = header.kid.as_deref();
        let mut keyset = self.keys.get(&self.directory).await?;
        if keyset.find(kid, header.alg).is_none() {
            // The provider may have rotated keys since the last fetch; allow
            // one forced refresh, never a verification bypass.
            debug!(kid = ?kid, "kid not in cached key set, forcing refresh");
            keyset = self
                .keys
                .refresh_if_observed(&self.directory, &keyset)
                .await?;
        }
        let key = keyset
            .find(kid, header.alg)
            .ok_or(AuthError::UnknownKey)?;

        let claims = self.decode_claims(token, key, header.alg)?;
        self.check_scopes(&claims)?;

        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or(AuthError::MalformedToken)?;

        let groups = if claims.groups.is_empty() {
            claims.realm_access.map(|ra| ra.roles).unwrap_or_default()
        } else {
            claims.groups
        };

        let principal = Principal {
            user_id: claims.sub,
            username: claims.preferred_username.or(claims.username),
            email: claims.email,
            groups,
            scopes: claims
                .scope
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            expires_at,
        };

        debug!(
            user_id = %principal.user_id,
            username = ?principal.username,
            "token verified"
        );
        Ok(principal)
    }

    fn decode_claims(
        &self,
        token: &str,
        key: &VerificationKey,
        algorithm: Algorithm,
    ) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.directory.issuer_url()]);
        let mut audiences: Vec<&str> = vec![self.config.client_id.as_str()];
        audiences.extend(self.config.allowed_audiences.iter().map(String::as_str));
        validation.set_audience(&audiences);
        validation.validate_nbf = true;

        let decoded =
            jsonwebtoken::decode::<TokenClaims>(token, &key.decoding_key, &validation)
                .map_err(|err| {
                    let mapped = from_jwt_error(&err);
                    warn!(error = %err, reason = mapped.code(), "token validation failed");
                    mapped
                })?;
        Ok(decoded.claims)
    }

    fn check_scopes(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        if self.config.required_scopes.is_empty() {
            return Ok(());
        }
        let granted: Vec<&str> = claims.scope.split_whitespace().collect();
        let missing: Vec<String> = self
            .config
            .required_scopes
            .iter()
            .filter(|required| !granted.contains(&required.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            warn!(missing = ?missing, "token lacks required scopes");
            Err(AuthError::InsufficientScope { missing })
        }
    }
}
