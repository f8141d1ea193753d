//! Authentication middleware and capability enforcement.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::Instrument;
use uuid::Uuid;
use vreg_core::checksum::to_hex;
use vreg_core::config::AuthConfig;
use vreg_core::{Actor, Capability, Decision, Resource, TokenIdentity, TokenScope};

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value, keeping at most
    /// `MAX_TRACE_ID_LEN` printable ASCII characters.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configured tokens indexed by the SHA-256 of their secret.
#[derive(Clone, Debug, Default)]
pub struct TokenTable {
    by_hash: HashMap<String, TokenIdentity>,
}

impl TokenTable {
    pub fn from_config(config: &AuthConfig) -> Result<Self, String> {
        let mut by_hash = HashMap::with_capacity(config.tokens.len());
        for token in &config.tokens {
            let scopes = token
                .scopes
                .iter()
                .map(|s| TokenScope::parse(s))
                .collect::<Result<HashSet<_>, _>>()
                .map_err(|e| format!("token {}: {e}", token.name))?;
            let hash = token
                .token_hash
                .trim_start_matches("sha256:")
                .to_ascii_lowercase();
            let identity = TokenIdentity {
                name: token.name.clone(),
                scopes,
                group_id: token.group_id,
            };
            if by_hash.insert(hash, identity).is_some() {
                return Err(format!("token {} duplicates another token's hash", token.name));
            }
        }
        Ok(Self { by_hash })
    }

    /// Find the identity for a presented bearer secret.
    pub fn lookup(&self, secret: &str) -> Option<&TokenIdentity> {
        self.by_hash.get(&hash_token(secret))
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

fn hash_token(token: &str) -> String {
    to_hex(&Sha256::digest(token.as_bytes()))
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("bearer "))
                .map(|_| v[7..].trim())
        })
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Resolve the caller and set up the request span.
///
/// Requests without a bearer token proceed as [`Actor::Anonymous`]; whether
/// that is enough is decided per operation. An unknown token is rejected here.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    let actor = match extract_bearer_token(&req) {
        Some(secret) => match state.tokens.lookup(secret) {
            Some(identity) => Actor::Token(identity.clone()),
            None => return Err(ApiError::Unauthorized("invalid token".to_string())),
        },
        None => Actor::Anonymous,
    };
    let actor_name = actor.display_name().to_string();
    req.extensions_mut().insert(actor);

    let response = next
        .run(req)
        .instrument(tracing::info_span!(
            "request",
            trace_id = %trace_id_str,
            actor = %actor_name
        ))
        .await;

    Ok(response)
}

/// Enforce `capability` on a group's resource.
///
/// An undecided chain is a denial: anonymous callers get 401, tokens 403.
pub fn authorize(
    state: &AppState,
    actor: &Actor,
    capability: Capability,
    group_id: Uuid,
) -> ApiResult<()> {
    match state
        .policy
        .authorize(actor, capability, &Resource { group_id })
    {
        Decision::Allow => Ok(()),
        Decision::Deny(reason) => match actor {
            Actor::Anonymous => Err(ApiError::Unauthorized(reason)),
            Actor::Token(_) => Err(ApiError::Forbidden(reason)),
        },
        Decision::Absent => match actor {
            Actor::Anonymous => Err(ApiError::Unauthorized(
                "authentication required".to_string(),
            )),
            Actor::Token(_) => Err(ApiError::Forbidden(format!(
                "not permitted: {capability:?}"
            ))),
        },
    }
}

/// Reject anonymous callers up front when anonymous reads are off, before any
/// lookup that could reveal whether a resource exists.
pub fn reject_anonymous_unless_allowed(state: &AppState, actor: &Actor) -> ApiResult<()> {
    if matches!(actor, Actor::Anonymous) && !state.config.auth.allow_anonymous_read {
        return Err(ApiError::Unauthorized(
            "authentication required".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vreg_core::config::TokenConfig;

    #[test]
    fn test_token_table_lookup() {
        let table = TokenTable::from_config(&AuthConfig::for_testing()).unwrap();
        assert_eq!(table.len(), 2);
        let admin = table.lookup("test-admin-token").unwrap();
        assert_eq!(admin.name, "test-admin");
        assert!(admin.has_scope(TokenScope::Cleanup));
        assert!(table.lookup("wrong").is_none());
    }

    #[test]
    fn test_token_table_accepts_prefixed_uppercase_hash() {
        let config = AuthConfig {
            allow_anonymous_read: false,
            tokens: vec![TokenConfig {
                name: "ci".to_string(),
                token_hash: format!("sha256:{}", hash_token("s3cret").to_uppercase()),
                scopes: vec!["registry:read".to_string()],
                group_id: None,
            }],
        };
        let table = TokenTable::from_config(&config).unwrap();
        assert!(table.lookup("s3cret").is_some());
    }

    #[test]
    fn test_token_table_rejects_unknown_scope() {
        let mut config = AuthConfig::for_testing();
        config.tokens[0].scopes = vec!["registry:write".to_string()];
        assert!(TokenTable::from_config(&config).is_err());
    }

    #[test]
    fn test_trace_id_sanitized() {
        let id = TraceId::from_client("abc\n\u{7}def");
        assert_eq!(id.as_str(), "abcdef");
        let long = "x".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);
        assert!(!TraceId::from_client("\n").as_str().is_empty());
    }
}
