//! Upstream rule repository.

use crate::error::MetadataResult;
use crate::models::RuleRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for allow/deny rules. Positions are 1-based and contiguous per
/// upstream; inserting or deleting re-indexes the rest.
#[async_trait]
pub trait RuleRepo: Send + Sync {
    /// Insert a rule at a 1-based position, or at the end. `rule.position`
    /// is ignored. Returns the stored row with its final position.
    async fn create_rule(&self, rule: &RuleRow, position: Option<u32>) -> MetadataResult<RuleRow>;

    async fn get_rule(&self, rule_id: Uuid) -> MetadataResult<Option<RuleRow>>;

    /// Rules of an upstream in position order.
    async fn list_rules(&self, upstream_id: Uuid) -> MetadataResult<Vec<RuleRow>>;

    /// Update pattern, type, action and target, and move the rule when a
    /// new position is given.
    async fn update_rule(&self, rule: &RuleRow, position: Option<u32>) -> MetadataResult<RuleRow>;

    /// Returns false if the rule did not exist.
    async fn delete_rule(&self, rule_id: Uuid) -> MetadataResult<bool>;
}
