use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use querygate::config::OidcConfig;
use querygate::security::{AuthError, AuthGateway};

struct TestKey {
    kid: &'static str,
    pem: String,
    n: String,
    e: String,
}

fn generate_key(kid: &'static str) -> TestKey {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pem = private
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap()
        .to_string();
    let public = private.to_public_key();
    TestKey {
        kid,
        pem,
        n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    }
}

// Key generation is slow; share one pair of keypairs across the test binary.
fn keys() -> &'static (TestKey, TestKey) {
    static KEYS: OnceLock<(TestKey, TestKey)> = OnceLock::new();
    KEYS.get_or_init(|| (generate_key("primary"), generate_key("rogue")))
}

fn mint(key: &TestKey, kid: &str, mut claims: Value) -> String {
    let now = Utc::now().timestamp();
    let base = claims.as_object_mut().unwrap();
    base.entry("iat").or_insert(json!(now));
    base.entry("exp").or_insert(json!(now + 300));
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let encoding_key = EncodingKey::from_rsa_pem(key.pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, &claims, &encoding_key).unwrap()
}

#[derive(Clone)]
enum TokenReply {
    Grant { token: String, expires_in: u64 },
    Reject,
}

struct ProviderState {
    issuer: String,
    jwks: Value,
    token_reply: std::sync::Mutex<TokenReply>,
    jwks_hits: AtomicUsize,
    token_hits: AtomicUsize,
}

struct FakeProvider {
    state: Arc<ProviderState>,
}

impl FakeProvider {
    fn issuer(&self) -> &str {
        &self.state.issuer
    }

    fn jwks_hits(&self) -> usize {
        self.state.jwks_hits.load(Ordering::SeqCst)
    }

    fn token_hits(&self) -> usize {
        self.state.token_hits.load(Ordering::SeqCst)
    }

    /// The issuer URL is only known after binding, so grants that must carry
    /// a token minted for this provider are installed after spawn.
    fn set_token_reply(&self, reply: TokenReply) {
        *self.state.token_reply.lock().unwrap() = reply;
    }
}

async fn discovery(State(state): State<Arc<ProviderState>>) -> impl IntoResponse {
    Json(json!({
        "issuer": state.issuer,
        "jwks_uri": format!("{}/protocol/openid-connect/certs", state.issuer),
        "token_endpoint": format!("{}/protocol/openid-connect/token", state.issuer),
    }))
}

async fn certs(State(state): State<Arc<ProviderState>>) -> impl IntoResponse {
    state.jwks_hits.fetch_add(1, Ordering::SeqCst);
    Json(state.jwks.clone())
}

async fn token(State(state): State<Arc<ProviderState>>) -> axum::response::Response {
    state.token_hits.fetch_add(1, Ordering::SeqCst);
    let reply = state.token_reply.lock().unwrap().clone();
    match &reply {
        TokenReply::Grant { token, expires_in } => Json(json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        }))
        .into_response(),
        TokenReply::Reject => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response(),
    }
}

async fn spawn_provider(jwks: Value, token_reply: TokenReply) -> FakeProvider {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let issuer = format!("http://{addr}/realms/test");

    let state = Arc::new(ProviderState {
        issuer,
        jwks,
        token_reply: std::sync::Mutex::new(token_reply),
        jwks_hits: AtomicUsize::new(0),
        token_hits: AtomicUsize::new(0),
    });

    let router = Router::new()
        .route(
            "/realms/test/.well-known/openid-configuration",
            get(discovery),
        )
        .route("/realms/test/protocol/openid-connect/certs", get(certs))
        .route("/realms/test/protocol/openid-connect/token", post(token))
        .with_state(Arc::clone(&state));

    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    FakeProvider { state }
}

fn primary_jwks() -> Value {
    let (primary, _) = keys();
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": primary.kid,
            "alg": "RS256",
            "use": "sig",
            "n": primary.n,
            "e": primary.e,
        }]
    })
}

fn gateway_config(issuer: &str) -> OidcConfig {
    OidcConfig {
        enabled: true,
        issuer_url: issuer.to_string(),
        client_id: "devlake-mcp".to_string(),
        ..OidcConfig::default()
    }
}

fn standard_claims(issuer: &str) -> Value {
    json!({
        "sub": "user-42",
        "iss": issuer,
        "aud": "devlake-mcp",
        "preferred_username": "jdoe",
        "email": "jdoe@example.com",
        "groups": ["platform"],
        "scope": "openid profile",
    })
}

#[tokio::test]
async fn valid_token_yields_principal() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let token = mint(primary, primary.kid, standard_claims(provider.issuer()));

    let principal = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap();
    assert_eq!(principal.user_id, "user-42");
    assert_eq!(principal.username.as_deref(), Some("jdoe"));
    assert_eq!(principal.email.as_deref(), Some("jdoe@example.com"));
    assert_eq!(principal.groups, vec!["platform"]);
    assert!(principal.has_scope("openid"));
    assert!(principal.expires_at > Utc::now());
}

#[tokio::test]
async fn realm_roles_back_fill_missing_groups() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let mut claims = standard_claims(provider.issuer());
    claims.as_object_mut().unwrap().remove("groups");
    claims["realm_access"] = json!({"roles": ["viewer", "reporter"]});
    let token = mint(primary, primary.kid, claims);

    let principal = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap();
    assert_eq!(principal.groups, vec!["viewer", "reporter"]);
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let mut claims = standard_claims(provider.issuer());
    // Beyond the default validation leeway.
    claims["exp"] = json!(Utc::now().timestamp() - 120);
    let token = mint(primary, primary.kid, claims);

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Expired);
}

#[tokio::test]
async fn wrong_audience_is_rejected() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let mut claims = standard_claims(provider.issuer());
    claims["aud"] = json!("some-other-service");
    let token = mint(primary, primary.kid, claims);

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidAudience);
}

#[tokio::test]
async fn secondary_audience_is_accepted() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let mut config = gateway_config(provider.issuer());
    config.allowed_audiences = vec!["reporting-api".to_string()];
    let gateway = AuthGateway::new(config).unwrap();

    let (primary, _) = keys();
    let mut claims = standard_claims(provider.issuer());
    claims["aud"] = json!("reporting-api");
    let token = mint(primary, primary.kid, claims);

    assert!(gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .is_ok());
}

#[tokio::test]
async fn wrong_issuer_is_rejected() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let mut claims = standard_claims(provider.issuer());
    claims["iss"] = json!("https://evil.example.com/realms/test");
    let token = mint(primary, primary.kid, claims);

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidIssuer);
}

#[tokio::test]
async fn token_signed_by_unpublished_key_is_rejected() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    // Same kid as the published key, different private key.
    let (primary, rogue) = keys();
    let token = mint(rogue, primary.kid, standard_claims(provider.issuer()));

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidSignature);
}

#[tokio::test]
async fn unknown_kid_forces_exactly_one_refresh() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = AuthGateway::new(gateway_config(provider.issuer())).unwrap();

    let (primary, _) = keys();
    let token = mint(primary, "rotated-away", standard_claims(provider.issuer()));

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::UnknownKey);
    // Initial fetch plus the single forced refresh.
    assert_eq!(provider.jwks_hits(), 2);
}

#[tokio::test]
async fn missing_scopes_are_reported() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let mut config = gateway_config(provider.issuer());
    config.required_scopes = vec!["mcp:read".to_string()];
    let gateway = AuthGateway::new(config).unwrap();

    let (primary, _) = keys();
    let token = mint(primary, primary.kid, standard_claims(provider.issuer()));

    let err = gateway
        .authenticate(Some(&format!("Bearer {token}")))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::InsufficientScope {
            missing: vec!["mcp:read".to_string()],
        }
    );
}

#[tokio::test]
async fn concurrent_verifies_share_one_key_fetch() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let gateway = Arc::new(AuthGateway::new(gateway_config(provider.issuer())).unwrap());

    let (primary, _) = keys();
    let token = mint(primary, primary.kid, standard_claims(provider.issuer()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = Arc::clone(&gateway);
        let header = format!("Bearer {token}");
        handles.push(tokio::spawn(async move {
            gateway.authenticate(Some(&header)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(provider.jwks_hits(), 1);
}

#[tokio::test]
async fn offline_token_is_exchanged_then_verified() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let (primary, _) = keys();
    let access_token = mint(primary, primary.kid, standard_claims(provider.issuer()));
    provider.set_token_reply(TokenReply::Grant {
        token: access_token,
        expires_in: 300,
    });

    let mut config = gateway_config(provider.issuer());
    config.offline_token_enabled = true;
    let gateway = AuthGateway::new(config).unwrap();

    let principal = gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(principal.user_id, "user-42");
    assert_eq!(provider.token_hits(), 1);

    // Same offline token again: served from the exchange cache.
    gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(provider.token_hits(), 1);
}

#[tokio::test]
async fn concurrent_offline_resolves_share_one_exchange() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let (primary, _) = keys();
    let access_token = mint(primary, primary.kid, standard_claims(provider.issuer()));
    provider.set_token_reply(TokenReply::Grant {
        token: access_token,
        expires_in: 300,
    });

    let mut config = gateway_config(provider.issuer());
    config.offline_token_enabled = true;
    let gateway = Arc::new(AuthGateway::new(config).unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway.authenticate(Some("Bearer opaque-offline-token")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(provider.token_hits(), 1);
}

#[tokio::test]
async fn grant_inside_refresh_buffer_is_exchanged_again() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let (primary, _) = keys();
    let access_token = mint(primary, primary.kid, standard_claims(provider.issuer()));
    // Granted lifetime shorter than the refresh buffer: the cached token is
    // already inside the buffer, so the next resolve must exchange again.
    provider.set_token_reply(TokenReply::Grant {
        token: access_token,
        expires_in: 30,
    });

    let mut config = gateway_config(provider.issuer());
    config.offline_token_enabled = true;
    config.access_token_cache_buffer = 60;
    let gateway = AuthGateway::new(config).unwrap();

    gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(provider.token_hits(), 1);

    gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(provider.token_hits(), 2);
}

#[tokio::test]
async fn failed_refresh_evicts_cached_token() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let (primary, _) = keys();
    let access_token = mint(primary, primary.kid, standard_claims(provider.issuer()));
    provider.set_token_reply(TokenReply::Grant {
        token: access_token.clone(),
        expires_in: 30,
    });

    let mut config = gateway_config(provider.issuer());
    config.offline_token_enabled = true;
    config.access_token_cache_buffer = 60;
    let gateway = AuthGateway::new(config).unwrap();

    gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(provider.token_hits(), 1);

    // The stale entry forces a refresh; the provider now rejects the grant
    // and the entry must not survive the failure.
    provider.set_token_reply(TokenReply::Reject);
    let err = gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::ExchangeFailed);
    assert_eq!(provider.token_hits(), 2);

    // Once the provider grants again the same offline token resolves.
    provider.set_token_reply(TokenReply::Grant {
        token: access_token,
        expires_in: 30,
    });
    gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap();
    assert_eq!(provider.token_hits(), 3);
}

#[tokio::test]
async fn rejected_grant_surfaces_exchange_failure() {
    let provider = spawn_provider(primary_jwks(), TokenReply::Reject).await;
    let mut config = gateway_config(provider.issuer());
    config.offline_token_enabled = true;
    let gateway = AuthGateway::new(config).unwrap();

    let err = gateway
        .authenticate(Some("Bearer opaque-offline-token"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::ExchangeFailed);
    assert_eq!(provider.token_hits(), 1);
}
