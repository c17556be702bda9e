use crate::http::build_client;
use crate::marketplace::MarketplaceError;
use crate::marketplace::config::{MESSAGE_API_BASE, ROOT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use urlencoding::encode;

/// Conversation class on the marketplace side. The member channel carries
/// buyer<->seller chat and accepts a `start_time` activity filter; the system
/// channel carries platform notifications and is offset-paginated only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Member,
    System,
}

impl Channel {
    pub fn as_query(&self) -> &'static str {
        match self {
            Channel::Member => "FROM_MEMBERS",
            Channel::System => "FROM_EBAY",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Channel::Member => "member",
            Channel::System => "system",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPage {
    #[serde(default)]
    pub conversations: Vec<RemoteConversation>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConversation {
    pub conversation_id: Option<String>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub created_date: Option<String>,
    #[serde(default)]
    pub latest_message: Option<LatestMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub sender_username: Option<String>,
    pub recipient_username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MessagesPage {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub message_id: Option<String>,
    pub sender_username: Option<String>,
    pub subject: Option<String>,
    pub message_body: Option<String>,
    #[serde(default)]
    pub message_media: Vec<RawMedia>,
    #[serde(default)]
    pub read_status: bool,
    pub created_date: Option<String>,
}

impl RemoteMessage {
    /// Parsed external timestamp, or `None` when absent/unparsable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_marketplace_timestamp(self.created_date.as_deref())
    }
}

/// Attachment metadata exactly as the wire carries it; alternate key spellings
/// have been observed, hence the aliases.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMedia {
    #[serde(alias = "name")]
    pub media_name: Option<String>,
    #[serde(alias = "type")]
    pub media_type: Option<String>,
    #[serde(alias = "mediaURL")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentKind {
    Image,
    Doc,
    Pdf,
    Txt,
    Other,
}

impl AttachmentKind {
    fn from_wire(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "IMAGE" => AttachmentKind::Image,
            "DOC" => AttachmentKind::Doc,
            "PDF" => AttachmentKind::Pdf,
            "TXT" => AttachmentKind::Txt,
            _ => AttachmentKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "IMAGE",
            AttachmentKind::Doc => "DOC",
            AttachmentKind::Pdf => "PDF",
            AttachmentKind::Txt => "TXT",
            AttachmentKind::Other => "OTHER",
        }
    }
}

/// Normalized attachment stored alongside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub kind: AttachmentKind,
    pub url: Option<String>,
}

/// Collapse raw media entries into the stored `{name, kind, url}` shape.
/// Unknown kinds fall back to `OTHER`; empty names get a positional default.
pub fn normalize_attachments(raw: &[RawMedia]) -> Vec<Attachment> {
    raw.iter()
        .enumerate()
        .map(|(i, media)| {
            let name = media
                .media_name
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
                .unwrap_or_else(|| format!("attachment_{}", i + 1));
            let kind = media
                .media_type
                .as_deref()
                .map(AttachmentKind::from_wire)
                .unwrap_or(AttachmentKind::Other);
            let url = media
                .media_url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string());
            Attachment { name, kind, url }
        })
        .collect()
}

pub fn parse_marketplace_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_start_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

async fn map_status(response: reqwest::Response) -> Result<reqwest::Response, MarketplaceError> {
    if response.status() == 403 {
        return Err(MarketplaceError::Forbidden);
    }
    if !response.status().is_success() {
        return Err(MarketplaceError::Request(format!(
            "HTTP {}",
            response.status()
        )));
    }
    Ok(response)
}

/// Fetch one page of conversations. `start_time` filters by activity and is
/// honored by the member channel only; the caller never passes it for system.
pub async fn fetch_conversations_page(
    access_token: &str,
    channel: Channel,
    start_time: Option<DateTime<Utc>>,
    limit: u32,
    offset: u32,
) -> Result<ConversationPage, MarketplaceError> {
    let client = build_client();
    let url = format!("{}{}/conversation", *ROOT, MESSAGE_API_BASE);
    let mut params: Vec<(&str, String)> = vec![
        ("conversation_type", channel.as_query().to_string()),
        ("limit", limit.min(50).to_string()),
        ("offset", offset.to_string()),
    ];
    if let Some(at) = start_time {
        params.push(("start_time", format_start_time(at)));
    }
    let response = client
        .get(url)
        .bearer_auth(access_token)
        .query(&params)
        .send()
        .await
        .map_err(|err| MarketplaceError::Request(err.to_string()))?;
    let response = map_status(response).await?;
    response
        .json()
        .await
        .map_err(|err| MarketplaceError::Decode(err.to_string()))
}

/// Paginate the member channel until exhausted.
pub async fn fetch_all_conversations(
    access_token: &str,
    channel: Channel,
    start_time: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<RemoteConversation>, MarketplaceError> {
    let mut all = Vec::new();
    let mut offset = 0u32;
    loop {
        let page =
            fetch_conversations_page(access_token, channel, start_time, limit, offset).await?;
        let count = page.conversations.len() as u32;
        all.extend(page.conversations);
        offset += limit;
        if page.next.is_none() || count == 0 || offset >= page.total {
            break;
        }
    }
    Ok(all)
}

async fn fetch_conversation_messages_page(
    access_token: &str,
    conversation_id: &str,
    channel: Channel,
    limit: u32,
    offset: u32,
) -> Result<MessagesPage, MarketplaceError> {
    let client = build_client();
    let url = format!(
        "{}{}/conversation/{}",
        *ROOT,
        MESSAGE_API_BASE,
        encode(conversation_id)
    );
    let params: Vec<(&str, String)> = vec![
        ("conversation_type", channel.as_query().to_string()),
        ("limit", limit.min(50).to_string()),
        ("offset", offset.to_string()),
    ];
    let response = client
        .get(url)
        .bearer_auth(access_token)
        .query(&params)
        .send()
        .await
        .map_err(|err| MarketplaceError::Request(err.to_string()))?;
    let response = map_status(response).await?;
    response
        .json()
        .await
        .map_err(|err| MarketplaceError::Decode(err.to_string()))
}

/// Fetch every message in a conversation, paginating internally.
pub async fn fetch_all_conversation_messages(
    access_token: &str,
    conversation_id: &str,
    channel: Channel,
) -> Result<Vec<RemoteMessage>, MarketplaceError> {
    let page_size = 50u32;
    let mut all: Vec<RemoteMessage> = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = fetch_conversation_messages_page(
            access_token,
            conversation_id,
            channel,
            page_size,
            offset,
        )
        .await?;
        let count = page.messages.len() as u32;
        all.extend(page.messages);
        if page.next.is_none() || offset + count >= page.total || count == 0 {
            break;
        }
        offset += page_size;
    }
    Ok(all)
}

/// Flip a conversation's read flag on the marketplace. Returns 204 on success.
pub async fn update_conversation_read(
    access_token: &str,
    conversation_id: &str,
    channel: Channel,
    read: bool,
) -> Result<(), MarketplaceError> {
    let client = build_client();
    let url = format!("{}{}/update_conversation", *ROOT, MESSAGE_API_BASE);
    let payload = serde_json::json!({
        "conversationId": conversation_id,
        "conversationType": channel.as_query(),
        "read": read,
    });
    let response = client
        .post(url)
        .bearer_auth(access_token)
        .json(&payload)
        .send()
        .await
        .map_err(|err| MarketplaceError::Request(err.to_string()))?;
    map_status(response).await?;
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: Option<String>,
    pub sender_username: Option<String>,
    pub created_date: Option<String>,
    #[serde(default)]
    pub message_media: Vec<RawMedia>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMediaPayload<'a> {
    media_name: &'a str,
    media_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
}

/// Send a message in an existing conversation. The marketplace enforces a
/// 2000-character body; callers validate before reaching this point.
pub async fn send_message(
    access_token: &str,
    conversation_id: &str,
    message_text: &str,
    reference_id: Option<&str>,
    media: &[Attachment],
) -> Result<SentMessage, MarketplaceError> {
    let client = build_client();
    let url = format!("{}{}/send_message", *ROOT, MESSAGE_API_BASE);
    let mut payload = serde_json::json!({
        "conversationId": conversation_id,
        "messageText": truncate_chars(message_text, 2000),
    });
    if let Some(reference) = reference_id {
        payload["reference"] = serde_json::json!({
            "referenceId": reference,
            "referenceType": "LISTING",
        });
    }
    if !media.is_empty() {
        let items: Vec<SendMediaPayload<'_>> = media
            .iter()
            .map(|item| SendMediaPayload {
                media_name: &item.name,
                media_type: item.kind.as_str(),
                media_url: item.url.as_deref(),
            })
            .collect();
        payload["messageMedia"] = serde_json::json!(items);
    }
    let response = client
        .post(url)
        .bearer_auth(access_token)
        .json(&payload)
        .send()
        .await
        .map_err(|err| MarketplaceError::Request(err.to_string()))?;
    let response = map_status(response).await?;
    response
        .json()
        .await
        .map_err(|err| MarketplaceError::Decode(err.to_string()))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Live client handle; the engine talks to it through the
/// `ConversationSource` seam so tests can substitute a fake.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketplaceClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_kind_falls_back_to_other() {
        let raw = vec![RawMedia {
            media_name: Some("invoice.xlsx".into()),
            media_type: Some("SPREADSHEET".into()),
            media_url: Some("https://cdn.example/invoice.xlsx".into()),
        }];
        let normalized = normalize_attachments(&raw);
        assert_eq!(normalized[0].kind, AttachmentKind::Other);
        assert_eq!(normalized[0].name, "invoice.xlsx");
    }

    #[test]
    fn attachment_name_defaults_positionally() {
        let raw = vec![
            RawMedia::default(),
            RawMedia {
                media_name: Some("  ".into()),
                media_type: Some("image".into()),
                media_url: Some("".into()),
            },
        ];
        let normalized = normalize_attachments(&raw);
        assert_eq!(normalized[0].name, "attachment_1");
        assert_eq!(normalized[1].name, "attachment_2");
        assert_eq!(normalized[1].kind, AttachmentKind::Image);
        assert_eq!(normalized[1].url, None);
    }

    #[test]
    fn timestamp_parse_handles_zulu_and_garbage() {
        let parsed = parse_marketplace_timestamp(Some("2026-03-01T10:30:00.000Z"));
        assert!(parsed.is_some());
        assert!(parse_marketplace_timestamp(Some("not-a-date")).is_none());
        assert!(parse_marketplace_timestamp(None).is_none());
        assert!(parse_marketplace_timestamp(Some("   ")).is_none());
    }
}
