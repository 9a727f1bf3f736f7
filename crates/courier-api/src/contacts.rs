use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use courier_types::api::{AddContactRequest, Claims};

use crate::error::ApiError;
use crate::SharedState;

pub async fn list(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let contacts = state.users.contacts(claims.user_id)?;
    Ok(Json(contacts))
}

pub async fn add(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .users
        .add_contact(claims.user_id, req.contact_id, req.display_name.as_deref())?;
    Ok(StatusCode::CREATED)
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(contact_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.users.remove_contact(claims.user_id, contact_id)?;
    Ok(StatusCode::NO_CONTENT)
}
