//! `POST /chat/send`, `GET /chat/messages`, `PATCH /chat/messages` (spec
//! §6, §4.10).

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::dm::{self, MessageBody, SendInput};
use crate::error::NodeError;
use crate::http::session;
use crate::signed_action::SignedAction;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub content: Option<String>,
    #[serde(rename = "encryptedContent")]
    pub encrypted_content: Option<String>,
    #[serde(rename = "senderChatPublicKey")]
    pub sender_chat_public_key: Option<String>,
    /// Required for cross-node sends: the outer payload must itself be a
    /// user-SignedAction (spec §4.10 step 1).
    #[serde(rename = "crossNodeEnvelope")]
    pub cross_node_envelope: Option<SignedAction>,
}

pub async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, NodeError> {
    let sender = session::authenticate(&state.pool, &headers).await?;

    let body = match (req.encrypted_content, req.sender_chat_public_key) {
        (Some(ciphertext), Some(key)) => MessageBody::Encrypted {
            ciphertext,
            sender_chat_public_key: key,
        },
        _ => MessageBody::Plain(
            req.content
                .ok_or_else(|| NodeError::Validation("missing content or encryptedContent".into()))?,
        ),
    };

    let message = dm::send_message(
        &state,
        &sender,
        SendInput {
            recipient: req.recipient,
            body,
            cross_node_envelope: req.cross_node_envelope,
        },
    )
    .await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub cursor: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, NodeError> {
    session::authenticate(&state.pool, &headers).await?;
    let messages = dm::list_messages(&state.pool, &query.conversation_id, query.cursor).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, NodeError> {
    session::authenticate(&state.pool, &headers).await?;
    dm::mark_conversation_read(&state.pool, &req.conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}
