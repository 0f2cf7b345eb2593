use axum::http::StatusCode;
use thiserror::Error;

/// Authentication failures surfaced to callers as structured denials.
///
/// Every variant maps to a specific reason code; raw detail from the JWT or
/// HTTP libraries never crosses this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization header is required")]
    MissingToken,
    #[error("malformed bearer token")]
    MalformedToken,
    #[error("no signing key matches the token")]
    UnknownKey,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("invalid token issuer")]
    InvalidIssuer,
    #[error("invalid token audience")]
    InvalidAudience,
    #[error("missing required scopes: {missing:?}")]
    InsufficientScope { missing: Vec<String> },
    #[error("offline token exchange failed")]
    ExchangeFailed,
    #[error("authentication provider unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AuthError {
    /// HTTP status for the denial response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InsufficientScope { .. } => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Stable machine-readable code for the `error` field of denial bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken => "malformed_token",
            Self::UnknownKey => "unknown_key",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::ExchangeFailed => "exchange_failed",
            Self::ServiceUnavailable(_) => "service_unavailable",
        }
    }
}

/// Map a `jsonwebtoken` failure to the specific denial it represents.
pub(crate) fn from_jwt_error(err: &jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            AuthError::MalformedToken
        }
        _ => AuthError::InvalidSignature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(AuthError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Expired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::InsufficientScope { missing: vec![] }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::ServiceUnavailable("jwks fetch failed".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidSignature.code(), "invalid_signature");
        assert_eq!(AuthError::ExchangeFailed.code(), "exchange_failed");
    }
}
