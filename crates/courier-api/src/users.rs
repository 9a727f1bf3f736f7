use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use courier_types::api::{Claims, SearchQuery, UpdateProfileRequest};

use crate::error::ApiError;
use crate::SharedState;

const SEARCH_LIMIT: i64 = 20;

pub async fn get_me(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.users.get(claims.user_id)?;
    Ok(Json(user))
}

pub async fn update_me(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.users.update(claims.user_id, req)?;
    let user = state.users.get(claims.user_id)?;
    Ok(Json(user))
}

pub async fn search(
    State(state): State<SharedState>,
    Extension(_claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.q.is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }
    let users = state.users.search(&query.q, SEARCH_LIMIT)?;
    Ok(Json(users))
}

pub async fn get_by_id(
    State(state): State<SharedState>,
    Extension(_claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.users.get(user_id)?;
    Ok(Json(user))
}
