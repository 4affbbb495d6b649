use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::db::WarningFilter;
use crate::error::{AppError, AppResult};
use crate::models::{
    ActionTaken, AddBlockedWordsRequest, CheckMessageRequest, CheckMessageResponse, FilterMatch,
    IssueWarningRequest, ModerationAction, Page, PageQuery, RemoveBlockedWordsRequest, RevokeWarningRequest,
    SyncActionRequest, UserQuery, WarningListQuery, WarningRecord,
};
use crate::security::gatekeeper::validate_check;
use crate::security::{ConfigPatch, EscalationState, SecurityConfig, ValidationError};
use crate::state::AppState;
use crate::telemetry::HealthStatus;

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Request(format!("{field} is required")));
    }
    Ok(())
}

pub async fn check_message(
    State(state): State<AppState>,
    payload: Result<Json<CheckMessageRequest>, JsonRejection>,
) -> AppResult<Json<CheckMessageResponse>> {
    let Json(request) = payload?;
    validate_check(&request)?;
    Ok(Json(state.gatekeeper.check_message(&request).await))
}

pub async fn get_config(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
) -> Json<SecurityConfig> {
    let config = state.gatekeeper.configs().get(&community_id).await;
    Json(config.as_ref().clone())
}

pub async fn put_config(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> AppResult<Json<SecurityConfig>> {
    let Json(patch) = payload?;
    let config = state.gatekeeper.configs().put(&community_id, patch).await?;
    Ok(Json(config.as_ref().clone()))
}

pub async fn add_blocked_words(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<AddBlockedWordsRequest>, JsonRejection>,
) -> AppResult<Json<SecurityConfig>> {
    let Json(request) = payload?;
    if request.words.is_empty() {
        return Err(ValidationError::Request("words must not be empty".into()).into());
    }
    let config = state
        .gatekeeper
        .configs()
        .add_blocked_words(&community_id, request.words)
        .await?;
    Ok(Json(config.as_ref().clone()))
}

pub async fn remove_blocked_words(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<RemoveBlockedWordsRequest>, JsonRejection>,
) -> AppResult<Json<SecurityConfig>> {
    let Json(request) = payload?;
    let config = state
        .gatekeeper
        .configs()
        .remove_blocked_words(&community_id, &request.words)
        .await?;
    Ok(Json(config.as_ref().clone()))
}

pub async fn list_warnings(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    query: Result<Query<WarningListQuery>, QueryRejection>,
) -> AppResult<Json<Page<WarningRecord>>> {
    let Query(query) = query?;
    let page = query.page_query();
    let filter = WarningFilter {
        status: query.status,
        platform: query.platform,
        platform_user_id: query.platform_user_id,
    };
    let (items, total) = state
        .gatekeeper
        .ledger()
        .list(&community_id, &filter, page.limit(), page.offset())
        .await?;
    Ok(Json(Page::new(items, &page, total)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueWarningResponse {
    pub warning: WarningRecord,
    pub active_count: u32,
    pub state: EscalationState,
    pub action_taken: ActionTaken,
}

pub async fn issue_warning(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<IssueWarningRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<IssueWarningResponse>)> {
    let Json(request) = payload?;
    require("platform", &request.platform)?;
    require("platformUserId", &request.platform_user_id)?;
    require("reason", &request.reason)?;

    let issued = state
        .gatekeeper
        .issue_manual_warning(
            &community_id,
            &request.platform,
            &request.platform_user_id,
            &request.reason,
            request.issued_by.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(IssueWarningResponse {
            warning: issued.warning,
            active_count: issued.evaluation.active_count,
            state: issued.evaluation.state,
            action_taken: issued.enforcement.into(),
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningStatusResponse {
    pub platform: String,
    pub platform_user_id: String,
    pub active_count: u32,
    pub state: EscalationState,
}

pub async fn warning_status(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> AppResult<Json<WarningStatusResponse>> {
    let Query(query) = query?;
    let config = state.gatekeeper.configs().get(&community_id).await;
    let evaluation = state
        .gatekeeper
        .ledger()
        .evaluate(&community_id, &query.platform, &query.platform_user_id, &config)
        .await?;

    Ok(Json(WarningStatusResponse {
        platform: query.platform,
        platform_user_id: query.platform_user_id,
        active_count: evaluation.active_count,
        state: evaluation.state,
    }))
}

pub async fn revoke_warning(
    Path((community_id, warning_id)): Path<(String, String)>,
    State(state): State<AppState>,
    payload: Result<Json<RevokeWarningRequest>, JsonRejection>,
) -> AppResult<Json<WarningRecord>> {
    let Json(request) = payload?;
    require("revokedBy", &request.revoked_by)?;
    let warning = state
        .gatekeeper
        .ledger()
        .revoke_warning(&community_id, &warning_id, &request.revoked_by, &request.reason)
        .await?;
    Ok(Json(warning))
}

pub async fn list_filter_matches(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> AppResult<Json<Page<FilterMatch>>> {
    let Query(page) = query?;
    let (items, total) = state
        .db
        .audit()
        .list_filter_matches(&community_id, page.limit(), page.offset())
        .await?;
    Ok(Json(Page::new(items, &page, total)))
}

pub async fn moderation_log(
    Path(community_id): Path<String>,
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> AppResult<Json<Page<ModerationAction>>> {
    let Query(page) = query?;
    let (items, total) = state
        .db
        .audit()
        .list_actions(&community_id, page.limit(), page.offset())
        .await?;
    Ok(Json(Page::new(items, &page, total)))
}

pub async fn sync_action(
    State(state): State<AppState>,
    payload: Result<Json<SyncActionRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<ModerationAction>)> {
    let Json(request) = payload?;
    let action = state.gatekeeper.sync_action(request).await?;
    Ok((StatusCode::ACCEPTED, Json(action)))
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let health = HealthStatus::check(state.store.as_ref(), &state.db).await;
    (health.http_status(), Json(health))
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

pub async fn not_found() -> AppError {
    AppError::NotFound("route".into())
}
