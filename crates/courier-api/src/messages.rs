use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use courier_db::MessageDraft;
use courier_types::api::{Claims, PageQuery, SendMessageRequest, UpdateStatusRequest};
use courier_types::frames::ServerFrame;

use crate::error::ApiError;
use crate::SharedState;

/// REST send path: same persistence as the socket dispatcher, delivery is
/// best-effort fan-out to whatever sessions the recipient has right now.
pub async fn send(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }

    let conversation = state
        .messages
        .get_or_create_conversation(&[claims.user_id, req.recipient_id])?;

    let message = state.messages.create_message(MessageDraft {
        conversation_id: conversation.id,
        sender_id: claims.user_id,
        content: req.content,
        kind: req.kind,
        media: None,
        replied_to: None,
        forwarded: false,
        recipients: vec![req.recipient_id],
    })?;

    state
        .manager
        .send_to_user(
            req.recipient_id,
            ServerFrame::NewMessage {
                message: message.clone(),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_conversations(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.messages.get_conversations(claims.user_id)?;
    Ok(Json(conversations))
}

pub async fn get_messages(
    State(state): State<SharedState>,
    Extension(_claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .messages
        .get_messages(conversation_id, page.limit, page.skip)?;
    Ok(Json(messages))
}

pub async fn update_status(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .messages
        .update_status(message_id, claims.user_id, req.status)?;
    Ok(Json(serde_json::json!({
        "message": "status updated successfully"
    })))
}
