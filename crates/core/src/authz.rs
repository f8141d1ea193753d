//! Actors, token scopes and capability checks.
//!
//! Authorization is a chain of plain check functions. Each check looks at an
//! actor, the capability requested and the resource, and either decides
//! (`Allow`/`Deny`) or abstains (`Absent`). The first decision wins; a chain
//! in which every check abstains yields `Absent`, which callers must handle
//! explicitly.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Token scopes for authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenScope {
    /// Pull artifacts through virtual registries.
    #[serde(rename = "registry:read")]
    Read,
    /// Run and configure cleanup policies.
    #[serde(rename = "registry:cleanup")]
    Cleanup,
    /// Manage registries, upstreams, rules and cache entries.
    #[serde(rename = "registry:admin")]
    Admin,
}

impl TokenScope {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "registry:read" => Ok(Self::Read),
            "registry:cleanup" => Ok(Self::Cleanup),
            "registry:admin" => Ok(Self::Admin),
            _ => Err(crate::Error::InvalidToken(format!("unknown scope: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "registry:read",
            Self::Cleanup => "registry:cleanup",
            Self::Admin => "registry:admin",
        }
    }

    /// Check if this scope implies another scope.
    pub fn implies(&self, other: &Self) -> bool {
        match self {
            Self::Admin => true,
            Self::Cleanup => matches!(other, Self::Cleanup | Self::Read),
            Self::Read => matches!(other, Self::Read),
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Something a caller wants to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ReadArtifacts,
    ManageRegistries,
    ManageCleanup,
}

impl Capability {
    /// Scope a token needs for this capability.
    pub fn required_scope(&self) -> TokenScope {
        match self {
            Self::ReadArtifacts => TokenScope::Read,
            Self::ManageRegistries => TokenScope::Admin,
            Self::ManageCleanup => TokenScope::Cleanup,
        }
    }
}

/// An authenticated token.
#[derive(Clone, Debug)]
pub struct TokenIdentity {
    /// Operator-facing name from configuration.
    pub name: String,
    pub scopes: HashSet<TokenScope>,
    /// Restricts the token to a single group when set.
    pub group_id: Option<Uuid>,
}

impl TokenIdentity {
    /// Check if the token has a specific scope.
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.iter().any(|s| s.implies(&scope))
    }
}

/// The caller of an operation.
#[derive(Clone, Debug)]
pub enum Actor {
    Anonymous,
    Token(TokenIdentity),
}

impl Actor {
    /// Name used in logs.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Token(t) => &t.name,
        }
    }
}

/// Object being accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resource {
    pub group_id: Uuid,
}

/// Result of a single check or a whole chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    /// The check has no opinion.
    Absent,
}

/// A capability check.
pub type Check = Box<dyn Fn(&Actor, Capability, &Resource) -> Decision + Send + Sync>;

/// Ordered chain of capability checks.
#[derive(Default)]
pub struct Policy {
    checks: Vec<Check>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check to the chain.
    pub fn with(
        mut self,
        check: impl Fn(&Actor, Capability, &Resource) -> Decision + Send + Sync + 'static,
    ) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// The standard chain: group isolation, then token scopes, then anonymous read.
    pub fn standard(allow_anonymous_read: bool) -> Self {
        Self::new()
            .with(token_group_check)
            .with(token_scope_check)
            .with(anonymous_read_check(allow_anonymous_read))
    }

    /// Evaluate checks in order; the first non-`Absent` decision wins.
    pub fn authorize(&self, actor: &Actor, capability: Capability, resource: &Resource) -> Decision {
        self.checks
            .iter()
            .map(|check| check(actor, capability, resource))
            .find(|d| *d != Decision::Absent)
            .unwrap_or(Decision::Absent)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("checks", &self.checks.len())
            .finish()
    }
}

/// Tokens bound to a group may not touch other groups.
pub fn token_group_check(actor: &Actor, _: Capability, resource: &Resource) -> Decision {
    match actor {
        Actor::Token(TokenIdentity {
            group_id: Some(group),
            ..
        }) if *group != resource.group_id => {
            Decision::Deny("token is not valid for this group".to_string())
        }
        _ => Decision::Absent,
    }
}

/// Tokens are allowed when a scope implies the capability, denied otherwise.
pub fn token_scope_check(actor: &Actor, capability: Capability, _: &Resource) -> Decision {
    match actor {
        Actor::Token(token) => {
            let scope = capability.required_scope();
            if token.has_scope(scope) {
                Decision::Allow
            } else {
                Decision::Deny(format!("missing required scope: {scope}"))
            }
        }
        Actor::Anonymous => Decision::Absent,
    }
}

/// Anonymous callers may read artifacts when enabled; otherwise no opinion.
pub fn anonymous_read_check(
    enabled: bool,
) -> impl Fn(&Actor, Capability, &Resource) -> Decision + Send + Sync + 'static {
    move |actor, capability, _| match (actor, capability) {
        (Actor::Anonymous, Capability::ReadArtifacts) if enabled => Decision::Allow,
        _ => Decision::Absent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(scopes: &[TokenScope], group_id: Option<Uuid>) -> Actor {
        Actor::Token(TokenIdentity {
            name: "ci".to_string(),
            scopes: scopes.iter().copied().collect(),
            group_id,
        })
    }

    #[test]
    fn test_scope_implies() {
        assert!(TokenScope::Admin.implies(&TokenScope::Read));
        assert!(TokenScope::Admin.implies(&TokenScope::Cleanup));
        assert!(TokenScope::Cleanup.implies(&TokenScope::Read));
        assert!(!TokenScope::Cleanup.implies(&TokenScope::Admin));
        assert!(!TokenScope::Read.implies(&TokenScope::Cleanup));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(TokenScope::parse("registry:read").unwrap(), TokenScope::Read);
        assert_eq!(
            TokenScope::parse("registry:admin").unwrap(),
            TokenScope::Admin
        );
        assert!(TokenScope::parse("cache:read").is_err());
    }

    #[test]
    fn test_empty_policy_is_absent() {
        let resource = Resource {
            group_id: Uuid::new_v4(),
        };
        assert_eq!(
            Policy::new().authorize(&Actor::Anonymous, Capability::ReadArtifacts, &resource),
            Decision::Absent
        );
    }

    #[test]
    fn test_anonymous_read_toggle() {
        let resource = Resource {
            group_id: Uuid::new_v4(),
        };
        let open = Policy::standard(true);
        let closed = Policy::standard(false);
        assert_eq!(
            open.authorize(&Actor::Anonymous, Capability::ReadArtifacts, &resource),
            Decision::Allow
        );
        assert_eq!(
            closed.authorize(&Actor::Anonymous, Capability::ReadArtifacts, &resource),
            Decision::Absent
        );
        assert_eq!(
            open.authorize(&Actor::Anonymous, Capability::ManageRegistries, &resource),
            Decision::Absent
        );
    }

    #[test]
    fn test_group_bound_token_denied_elsewhere() {
        let home = Uuid::new_v4();
        let actor = token(&[TokenScope::Admin], Some(home));
        let policy = Policy::standard(false);

        assert_eq!(
            policy.authorize(&actor, Capability::ManageRegistries, &Resource { group_id: home }),
            Decision::Allow
        );
        assert!(matches!(
            policy.authorize(
                &actor,
                Capability::ManageRegistries,
                &Resource {
                    group_id: Uuid::new_v4()
                }
            ),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn test_read_token_cannot_manage() {
        let actor = token(&[TokenScope::Read], None);
        let policy = Policy::standard(true);
        let resource = Resource {
            group_id: Uuid::new_v4(),
        };
        assert!(matches!(
            policy.authorize(&actor, Capability::ManageCleanup, &resource),
            Decision::Deny(_)
        ));
        assert_eq!(
            policy.authorize(&actor, Capability::ReadArtifacts, &resource),
            Decision::Allow
        );
    }
}
