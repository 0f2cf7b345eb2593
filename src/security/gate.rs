use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::OidcConfig;
use crate::security::discovery::ProviderDirectory;
use crate::security::error::AuthError;
use crate::security::exchange::{is_self_contained, TokenExchanger};
use crate::security::principal::Principal;
use crate::security::verifier::CredentialVerifier;

/// Structured denial body returned on 401/403/503.
#[derive(Debug, Serialize)]
pub struct DenialBody {
    pub error: &'static str,
    pub error_description: String,
}

/// Per-request authorization: skip-list check, bearer extraction, offline
/// token exchange, credential verification, Principal attachment.
pub struct AuthGateway {
    config: OidcConfig,
    directory: Arc<ProviderDirectory>,
    verifier: CredentialVerifier,
    exchanger: TokenExchanger,
}

impl AuthGateway {
    pub fn new(config: OidcConfig) -> anyhow::Result<Self> {
        let directory = Arc::new(ProviderDirectory::new(&config)?);
        let verifier = CredentialVerifier::new(config.clone(), Arc::clone(&directory));
        let exchanger = TokenExchanger::new(config.clone(), Arc::clone(&directory));
        Ok(Self {
            config,
            directory,
            verifier,
            exchanger,
        })
    }

    pub fn should_skip(&self, path: &str) -> bool {
        self.config
            .skip_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Authenticate an Authorization header value into a Principal.
    ///
    /// Opaque tokens are exchanged first when offline-token support is
    /// enabled; the exchanged token is always verified afterwards, because
    /// exchange alone is never sufficient proof of identity.
    pub async fn authenticate(&self, auth_header: Option<&str>) -> Result<Principal, AuthError> {
        let token = extract_bearer(auth_header)?;

        if is_self_contained(token) {
            return self.verifier.verify(token).await;
        }

        if !self.config.offline_token_enabled {
            warn!("received an opaque token but offline token support is disabled");
            return Err(AuthError::MalformedToken);
        }

        let access_token = self.exchanger.resolve(token).await?;
        self.verifier.verify(&access_token).await
    }

    /// Provider reachability probe for the security health endpoint.
    pub async fn health(&self) -> serde_json::Value {
        match self.directory.metadata().await {
            Ok(_) => json!({
                "status": "healthy",
                "issuer": self.directory.issuer_url(),
                "client_id": self.config.client_id,
            }),
            Err(err) => json!({
                "status": "unhealthy",
                "error": err.code(),
            }),
        }
    }
}

fn extract_bearer(auth_header: Option<&str>) -> Result<&str, AuthError> {
    let header = auth_header.ok_or(AuthError::MissingToken)?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(AuthError::MalformedToken),
    }
}

fn denial(err: &AuthError) -> Response {
    let body = DenialBody {
        error: err.code(),
        error_description: err.to_string(),
    };
    (
        err.status(),
        [(WWW_AUTHENTICATE, r#"Bearer realm="querygate""#)],
        Json(body),
    )
        .into_response()
}

/// Axum middleware enforcing authentication on every non-skip-listed path.
pub async fn require_auth(
    State(gateway): State<Arc<AuthGateway>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if gateway.should_skip(&path) {
        debug!(path = %path, "skipping authentication for path");
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match gateway.authenticate(auth_header.as_deref()).await {
        Ok(principal) => {
            debug!(path = %path, user_id = %principal.user_id, "request authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => {
            warn!(path = %path, reason = err.code(), "authentication denied");
            denial(&err)
        }
    }
}
