use axum::{Extension, Json, extract::State};

use talkmore_types::api::{
    ApiResponse, ChatListRequest, GetMessagesRequest, OutgoingMessage, SendMessageResponse,
};
use talkmore_types::models::{ConversationSummary, Message};

use crate::auth::AppState;
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::middleware::AuthUser;

/// Largest page a client may ask for.
const MAX_PAGE: u32 = 200;

pub async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<OutgoingMessage>,
) -> ApiResult<Json<ApiResponse<SendMessageResponse>>> {
    let message = state.fanout.send(&user.profile, req).await?;

    Ok(Json(ApiResponse::ok(
        "message sent",
        SendMessageResponse {
            sender: user.profile,
            message,
        },
    )))
}

/// The caller's conversations, most recent activity first. An unknown or
/// empty record is an empty page.
pub async fn chat_list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<ChatListRequest>,
) -> ApiResult<Json<ApiResponse<Vec<ConversationSummary>>>> {
    let chats = state
        .store
        .list_conversations(&user.profile.user_id, req.skip, req.limit.min(MAX_PAGE))
        .await?;

    Ok(Json(ApiResponse::ok("chat list", chats)))
}

/// One conversation's messages, newest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<GetMessagesRequest>,
) -> ApiResult<Json<ApiResponse<Vec<Message>>>> {
    let sub_id = req.sub_id.trim();
    if sub_id.is_empty() {
        return Err(ApiError::Validation("sub_id is required".into()));
    }

    let messages = state
        .store
        .get_messages(&user.profile.user_id, sub_id, req.skip, req.limit.min(MAX_PAGE))
        .await?;

    Ok(Json(ApiResponse::ok("messages", messages)))
}
