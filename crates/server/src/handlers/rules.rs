//! Upstream rule administration.

use super::common::{actor, read_json, rfc3339, upstream_for};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::rule::compile_pattern;
use vreg_core::{Actor, Capability, PatternType, RuleAction, TargetCoordinate};
use vreg_metadata::models::RuleRow;

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub pattern: String,
    #[serde(default)]
    pub pattern_type: Option<String>,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    /// 1-based; appended when omitted.
    pub position: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub pattern: Option<String>,
    pub pattern_type: Option<String>,
    pub action: Option<String>,
    pub target: Option<String>,
    pub position: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RuleResponse {
    pub rule_id: String,
    pub upstream_id: String,
    pub position: i32,
    pub pattern: String,
    pub pattern_type: String,
    pub action: String,
    pub target: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<RuleRow> for RuleResponse {
    fn from(row: RuleRow) -> Self {
        Self {
            rule_id: row.rule_id.to_string(),
            upstream_id: row.upstream_id.to_string(),
            position: row.position,
            pattern: row.pattern,
            pattern_type: row.pattern_type,
            action: row.action,
            target: row.target,
            created_at: rfc3339(row.created_at),
            updated_at: rfc3339(row.updated_at),
        }
    }
}

/// Parse the optional enum fields and make sure the pattern compiles, so a
/// stored rule is always evaluable.
fn checked_fields(
    pattern: &str,
    pattern_type: Option<&str>,
    target: Option<&str>,
) -> ApiResult<(PatternType, TargetCoordinate)> {
    let pattern_type = pattern_type
        .map(PatternType::parse)
        .transpose()?
        .unwrap_or_default();
    let target = target
        .map(TargetCoordinate::parse)
        .transpose()?
        .unwrap_or_default();
    compile_pattern(pattern, pattern_type)?;
    Ok((pattern_type, target))
}

fn check_position(position: Option<u32>) -> ApiResult<()> {
    if position == Some(0) {
        return Err(ApiError::BadRequest("position is 1-based".to_string()));
    }
    Ok(())
}

/// POST /v1/upstreams/{upstream_id}/rules
pub async fn create_rule(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<(StatusCode, Json<RuleResponse>)> {
    let actor = actor(&req);
    upstream_for(&state, &actor, upstream_id, Capability::ManageRegistries).await?;
    let body: CreateRuleRequest = read_json(&state, req).await?;

    let action = RuleAction::parse(&body.action)?;
    let (pattern_type, target) = checked_fields(
        &body.pattern,
        body.pattern_type.as_deref(),
        body.target.as_deref(),
    )?;
    check_position(body.position)?;

    let now = OffsetDateTime::now_utc();
    let row = RuleRow {
        rule_id: Uuid::new_v4(),
        upstream_id,
        position: 0,
        pattern: body.pattern,
        pattern_type: pattern_type.as_str().to_string(),
        action: action.as_str().to_string(),
        target: target.as_str().to_string(),
        created_at: now,
        updated_at: now,
    };
    let stored = state.metadata.create_rule(&row, body.position).await?;

    tracing::info!(
        upstream_id = %upstream_id,
        rule_id = %stored.rule_id,
        position = stored.position,
        actor = actor.display_name(),
        "rule created"
    );
    Ok((StatusCode::CREATED, Json(stored.into())))
}

/// GET /v1/upstreams/{upstream_id}/rules
pub async fn list_rules(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<Vec<RuleResponse>>> {
    upstream_for(
        &state,
        &actor(&req),
        upstream_id,
        Capability::ManageRegistries,
    )
    .await?;
    let rows = state.metadata.list_rules(upstream_id).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn rule_for(state: &AppState, actor: &Actor, rule_id: Uuid) -> ApiResult<RuleRow> {
    let rule = state
        .metadata
        .get_rule(rule_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule {rule_id} not found")))?;
    upstream_for(state, actor, rule.upstream_id, Capability::ManageRegistries).await?;
    Ok(rule)
}

/// GET /v1/rules/{rule_id}
pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RuleResponse>> {
    Ok(Json(rule_for(&state, &actor(&req), rule_id).await?.into()))
}

/// PATCH /v1/rules/{rule_id}
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RuleResponse>> {
    let actor = actor(&req);
    let mut rule = rule_for(&state, &actor, rule_id).await?;
    let body: UpdateRuleRequest = read_json(&state, req).await?;

    if let Some(action) = body.action {
        rule.action = RuleAction::parse(&action)?.as_str().to_string();
    }
    let pattern = body.pattern.unwrap_or(rule.pattern);
    let (pattern_type, target) = checked_fields(
        &pattern,
        Some(body.pattern_type.as_deref().unwrap_or(&rule.pattern_type)),
        Some(body.target.as_deref().unwrap_or(&rule.target)),
    )?;
    check_position(body.position)?;
    rule.pattern = pattern;
    rule.pattern_type = pattern_type.as_str().to_string();
    rule.target = target.as_str().to_string();
    rule.updated_at = OffsetDateTime::now_utc();

    let stored = state.metadata.update_rule(&rule, body.position).await?;
    tracing::info!(
        rule_id = %rule_id,
        position = stored.position,
        actor = actor.display_name(),
        "rule updated"
    );
    Ok(Json(stored.into()))
}

/// DELETE /v1/rules/{rule_id}
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    req: Request,
) -> ApiResult<StatusCode> {
    let actor = actor(&req);
    rule_for(&state, &actor, rule_id).await?;
    if !state.metadata.delete_rule(rule_id).await? {
        return Err(ApiError::NotFound(format!("rule {rule_id} not found")));
    }
    tracing::info!(rule_id = %rule_id, actor = actor.display_name(), "rule deleted");
    Ok(StatusCode::NO_CONTENT)
}
