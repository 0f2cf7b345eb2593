use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verified caller identity derived from a validated token.
///
/// Built once per request and attached to the request extensions; immutable
/// and discarded when the request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Subject id (`sub` claim).
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    /// Group membership, falling back to realm roles for providers that nest
    /// them under `realm_access.roles`.
    pub groups: Vec<String>,
    /// Scopes granted to the token.
    pub scopes: Vec<String>,
    /// Token expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}
