use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: String,
    pub did: String,
    pub handle: String,
    pub email: Option<String>,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key_encrypted: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub chat_public_key: Option<String>,
    #[serde(skip_serializing)]
    pub chat_private_key_encrypted: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub dm_privacy: String,
    pub is_suspended: bool,
    pub is_silenced: bool,
    pub is_bot: bool,
    pub is_remote: bool,
    pub node_domain: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmPrivacy {
    Everyone,
    Following,
    None,
}

impl DmPrivacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmPrivacy::Everyone => "everyone",
            DmPrivacy::Following => "following",
            DmPrivacy::None => "none",
        }
    }

    pub fn parse(s: &str) -> DmPrivacy {
        match s {
            "following" => DmPrivacy::Following,
            "none" => DmPrivacy::None,
            _ => DmPrivacy::Everyone,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub repost_of_id: Option<String>,
    pub ap_id: String,
    pub likes_count: i64,
    pub reposts_count: i64,
    pub replies_count: i64,
    pub is_removed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RemoteIdentityCacheRow {
    pub did: String,
    pub public_key: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SwarmNode {
    pub domain: String,
    pub public_key: Option<String>,
    pub software_version: Option<String>,
    pub capabilities: String,
    pub user_count: i64,
    pub post_count: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub priority: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HandleRegistryRow {
    pub handle: String,
    pub node_domain: String,
    pub did: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ChatConversation {
    pub id: String,
    pub participant1_id: String,
    pub participant2_handle: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_handle: String,
    pub sender_did: String,
    pub sender_node_domain: Option<String>,
    pub content: Option<String>,
    pub encrypted_content: Option<String>,
    pub sender_chat_public_key: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub post_id: Option<String>,
    pub actor_handle: String,
    pub actor_node_domain: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
