use crate::marketplace::Attachment;
use crate::store::{MessageRow, ThreadRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub counterparty: Option<String>,
    pub reference_item_id: Option<String>,
    pub reference_order_id: Option<String>,
    pub is_flagged: bool,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ThreadRow> for ThreadSummary {
    fn from(row: ThreadRow) -> Self {
        Self {
            thread_id: row.thread_id,
            counterparty: row.counterparty,
            reference_item_id: row.reference_item_id,
            reference_order_id: row.reference_order_id,
            is_flagged: row.is_flagged,
            message_count: row.message_count,
            unread_count: row.unread_count,
            last_message_preview: row.last_message_preview,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message_id: String,
    pub thread_id: String,
    pub sender_class: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub detected_language: Option<String>,
    pub translated_content: Option<String>,
    pub external_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageResponse {
    fn from(row: MessageRow) -> Self {
        let attachments = row.attachment_list();
        Self {
            message_id: row.message_id,
            thread_id: row.thread_id,
            sender_class: row.sender_class,
            sender_name: row.sender_name,
            subject: row.subject,
            content: row.content,
            attachments,
            is_read: row.is_read,
            detected_language: row.detected_language,
            translated_content: row.translated_content,
            external_created_at: row.external_created_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub summary: ThreadSummary,
    pub messages: Vec<MessageResponse>,
}

#[derive(Debug, Deserialize)]
pub struct SyncParams {
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Deserialize)]
pub struct ThreadListParams {
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    pub is_flagged: bool,
}

#[derive(Debug, Serialize)]
pub struct FlagResponse {
    pub thread_id: String,
    pub is_flagged: bool,
}

#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    #[serde(default)]
    pub extra_instructions: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DraftResponse {
    pub draft: String,
}
