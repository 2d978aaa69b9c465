use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{AppError, AppState};
use crate::model::Group;

/// Request body for creating or re-parenting a group.
#[derive(Debug, Deserialize)]
pub struct GroupPayload {
    pub name: String,
    pub group_id: Option<i64>,
}

/// GET /api/groups — list all groups.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Group>>, AppError> {
    let mut groups = state.groups.all().await?;
    groups.sort_by_key(|g| g.id);
    Ok(Json(groups))
}

/// POST /api/groups — create a group. Rejected with 400 if the parent chain
/// would contain a cycle.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<GroupPayload>,
) -> Result<(StatusCode, Json<Group>), AppError> {
    let group = state
        .groups
        .add(Group {
            id: 0,
            name: body.name,
            group_id: body.group_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// PATCH /api/groups/:id — update name/parent. Rejected with 400 if the new
/// parent would introduce a cycle; the group is left unchanged in that case.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<GroupPayload>,
) -> Result<Json<Group>, AppError> {
    // Warm the cache on cold starts so existence checks are meaningful.
    state.groups.all().await?;
    if state.groups.get(id).await.is_none() {
        return Err(AppError::NotFound);
    }

    let group = state
        .groups
        .update(Group {
            id,
            name: body.name,
            group_id: body.group_id,
        })
        .await?;
    Ok(Json(group))
}
