use crate::marketplace::config::SELLER_USERNAME;
use crate::marketplace::conversations::{
    self, Channel, ConversationPage, MarketplaceClient, RemoteConversation, RemoteMessage,
    normalize_attachments, parse_marketplace_timestamp,
};
use crate::marketplace::{Attachment, MarketplaceError, auth};
use crate::store::{
    CursorKey, MessageStore, NewMessage, NewThread, SenderClass, StoreError,
};
use crate::textnorm;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Display name used for system-channel threads, which have no buyer party.
const SYSTEM_COUNTERPARTY: &str = "eBay";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("marketplace is not connected; connect it in settings first")]
    NotConnected,
    #[error("marketplace denied access to messages; reconnect and re-grant the message scope")]
    Forbidden,
    #[error("marketplace request failed: {0}")]
    Transport(String),
    #[error("sync conflict (duplicate write), safe to retry")]
    Conflict,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("a sync is already running")]
    AlreadyRunning,
}

impl From<MarketplaceError> for SyncError {
    fn from(err: MarketplaceError) -> Self {
        match err {
            MarketplaceError::NotConnected => SyncError::NotConnected,
            MarketplaceError::Forbidden => SyncError::Forbidden,
            MarketplaceError::Request(detail) => SyncError::Transport(detail),
            MarketplaceError::Decode(detail) => SyncError::Transport(detail),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => SyncError::Conflict,
            other => SyncError::Storage(other.to_string()),
        }
    }
}

/// Policy knobs for a sync pass. The staleness window and system-channel page
/// caps come from the source deployment and are env-tunable rather than fixed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_limit: u32,
    pub fan_out: usize,
    pub full_sync_staleness: Duration,
    pub system_pages_per_sync: u32,
    pub system_pages_per_full_sync: u32,
    pub content_max: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_limit: 50,
            fan_out: 10,
            full_sync_staleness: Duration::minutes(10),
            system_pages_per_sync: 1,
            system_pages_per_full_sync: 5,
            content_max: textnorm::DEFAULT_MAX_LEN,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_limit: env_u32("MESSAGE_PAGE_LIMIT").unwrap_or(defaults.page_limit),
            fan_out: env_u32("SYNC_FAN_OUT")
                .map(|v| v as usize)
                .unwrap_or(defaults.fan_out),
            full_sync_staleness: env_u32("FULL_SYNC_STALENESS_MINS")
                .map(|v| Duration::minutes(v as i64))
                .unwrap_or(defaults.full_sync_staleness),
            system_pages_per_sync: env_u32("SYSTEM_PAGES_PER_SYNC")
                .unwrap_or(defaults.system_pages_per_sync),
            system_pages_per_full_sync: env_u32("SYSTEM_PAGES_PER_FULL_SYNC")
                .unwrap_or(defaults.system_pages_per_full_sync),
            content_max: defaults.content_max,
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
}

/// Who counts as "us". Injected into the engine so sender classification is
/// testable and swappable instead of ad hoc string compares.
#[derive(Debug, Clone, Default)]
pub struct SellerIdentity {
    username: Option<String>,
}

impl SellerIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into().trim().to_lowercase();
        Self {
            username: (!username.is_empty()).then_some(username),
        }
    }

    pub fn from_env() -> Self {
        Self::new(SELLER_USERNAME.as_str())
    }

    pub fn is_seller(&self, name: &str) -> bool {
        match &self.username {
            Some(seller) => name.trim().eq_ignore_ascii_case(seller),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub threads_synced: u64,
    pub messages_synced: u64,
    pub system_threads_synced: u64,
    pub system_messages_synced: u64,
    pub message: String,
}

impl SyncReport {
    fn finalize(mut self) -> Self {
        let threads = self.threads_synced + self.system_threads_synced;
        let messages = self.messages_synced + self.system_messages_synced;
        self.message = if threads > 0 || messages > 0 {
            format!("Synced {threads} thread(s), {messages} message(s).")
        } else {
            "No new conversations or messages to sync.".to_string()
        };
        self
    }
}

/// The engine's view of the marketplace. Trait-shaped so scenario tests run
/// against an in-memory fake; the live implementation delegates to the
/// conversations module.
pub trait ConversationSource: Send + Sync {
    fn access_token(&self) -> impl Future<Output = Result<String, MarketplaceError>> + Send;

    fn conversations_page(
        &self,
        token: &str,
        channel: Channel,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<ConversationPage, MarketplaceError>> + Send;

    fn all_conversations(
        &self,
        token: &str,
        channel: Channel,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<RemoteConversation>, MarketplaceError>> + Send;

    fn conversation_messages(
        &self,
        token: &str,
        conversation_id: &str,
        channel: Channel,
    ) -> impl Future<Output = Result<Vec<RemoteMessage>, MarketplaceError>> + Send;
}

impl ConversationSource for MarketplaceClient {
    fn access_token(&self) -> impl Future<Output = Result<String, MarketplaceError>> + Send {
        auth::get_user_access_token()
    }

    fn conversations_page(
        &self,
        token: &str,
        channel: Channel,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<ConversationPage, MarketplaceError>> + Send {
        conversations::fetch_conversations_page(token, channel, start_time, limit, offset)
    }

    fn all_conversations(
        &self,
        token: &str,
        channel: Channel,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<RemoteConversation>, MarketplaceError>> + Send {
        conversations::fetch_all_conversations(token, channel, start_time, limit)
    }

    fn conversation_messages(
        &self,
        token: &str,
        conversation_id: &str,
        channel: Channel,
    ) -> impl Future<Output = Result<Vec<RemoteMessage>, MarketplaceError>> + Send {
        conversations::fetch_all_conversation_messages(token, conversation_id, channel)
    }
}

/// Incremental reconciliation of marketplace conversations into the store.
///
/// One invocation is one pass: placeholder purge, member channel (incremental
/// or full, plus a periodic full fallback when the last full pass is stale),
/// then a bounded slice of the system channel. Cursor writes happen only after
/// the data they describe is committed.
pub struct SyncEngine<C: ConversationSource> {
    store: MessageStore,
    source: C,
    seller: SellerIdentity,
    config: Arc<SyncConfig>,
}

impl<C: ConversationSource> SyncEngine<C> {
    pub fn new(store: MessageStore, source: C, seller: SellerIdentity, config: SyncConfig) -> Self {
        Self {
            store,
            source,
            seller,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub async fn run(&self, full: bool) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let sync_start = Utc::now();
        info!(target = "sellerdesk.sync", full, "messages sync: start");

        self.store.purge_placeholder_threads().await?;
        let token = self.source.access_token().await?;

        let mut report = SyncReport::default();
        let mut ran_full = full;

        if full {
            let (threads, messages) = self.member_full_pass(&token).await?;
            report.threads_synced += threads;
            report.messages_synced += messages;
        } else {
            let need_periodic_full = match self
                .store
                .get_time_cursor(CursorKey::LastFullSyncAt)
                .await?
            {
                None => true,
                Some(at) => sync_start - at > self.config.full_sync_staleness,
            };
            let since = self
                .store
                .get_time_cursor(CursorKey::MemberHighWater)
                .await?;
            if since.is_none() {
                info!(
                    target = "sellerdesk.sync",
                    "first run: baseline member fetch with no activity filter"
                );
            }
            // The activity filter only surfaces buyer-side activity; seller-only
            // replies are invisible to it, which the periodic full pass below
            // papers over.
            let convs = self
                .source
                .all_conversations(&token, Channel::Member, since, self.config.page_limit)
                .await?;
            info!(
                target = "sellerdesk.sync",
                count = convs.len(),
                start_time = ?since,
                "incremental: member conversations with activity"
            );
            let (threads, messages) = self.reconcile_member_batch(&token, &convs).await?;
            report.threads_synced += threads;
            report.messages_synced += messages;

            if need_periodic_full {
                info!(
                    target = "sellerdesk.sync",
                    "periodic full pass due (last full sync stale or absent)"
                );
                let (threads, messages) = self.member_full_pass(&token).await?;
                report.threads_synced += threads;
                report.messages_synced += messages;
                ran_full = true;
            }
        }
        crate::metrics::sync_elapsed("member", started.elapsed().as_millis());

        // System channel always runs after member work. Its failures are
        // local: committed pages stay and the invocation still succeeds.
        // Storage conflicts are the exception and propagate as retryable.
        let system_started = Instant::now();
        match self.system_pass(&token, full, &mut report).await {
            Ok(()) => {}
            Err(SyncError::Conflict) => return Err(SyncError::Conflict),
            Err(err) => warn!(
                target = "sellerdesk.sync",
                error = %err,
                "system-channel sync failed; partial progress from committed pages kept"
            ),
        }
        crate::metrics::sync_elapsed("system", system_started.elapsed().as_millis());

        let finished = Utc::now();
        self.store
            .set_time_cursor(CursorKey::LastSyncAt, finished)
            .await?;
        self.store
            .set_time_cursor(CursorKey::MemberHighWater, sync_start)
            .await?;
        if ran_full {
            self.store
                .set_time_cursor(CursorKey::LastFullSyncAt, finished)
                .await?;
        }

        let report = report.finalize();
        info!(
            target = "sellerdesk.sync",
            full,
            threads = report.threads_synced,
            messages = report.messages_synced,
            system_threads = report.system_threads_synced,
            system_messages = report.system_messages_synced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "messages sync: done"
        );
        Ok(report)
    }

    /// Re-fetch and upsert a single member conversation; used after a local
    /// send instead of a full pass.
    pub async fn refresh_thread(&self, thread_id: &str) -> Result<(), SyncError> {
        let token = self.source.access_token().await?;
        let messages = self
            .source
            .conversation_messages(&token, thread_id, Channel::Member)
            .await?;
        let mut batch: Vec<RemoteMessage> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for message in messages {
            if let Some(mid) = message.message_id.clone()
                && seen.insert(mid)
            {
                batch.push(message);
            }
        }
        batch.sort_by_key(|m| m.created_at());

        let mut tx = self.store.begin().await?;
        let ids: Vec<String> = batch.iter().filter_map(|m| m.message_id.clone()).collect();
        let existing = MessageStore::existing_message_ids(&mut tx, &ids).await?;
        self.apply_messages(&mut tx, thread_id, Channel::Member, &batch, &existing)
            .await?;
        MessageStore::recompute_thread_rollup(&mut tx, thread_id).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Full member pass: offset-paginate every conversation with no activity
    /// filter. One transaction across the whole pass; a crash loses it, which
    /// is fine because full mode is re-runnable from scratch.
    async fn member_full_pass(&self, token: &str) -> Result<(u64, u64), SyncError> {
        let limit = self.config.page_limit;
        let mut offset = 0u32;
        let mut threads_created = 0u64;
        let mut messages_created = 0u64;
        let mut tx = self.store.begin().await?;
        loop {
            let page = self
                .source
                .conversations_page(token, Channel::Member, None, limit, offset)
                .await?;
            if page.conversations.is_empty() {
                break;
            }
            let merged = self
                .fetch_and_merge(token, &page.conversations, Channel::Member)
                .await;
            let (threads, messages) = self
                .upsert_batch(&mut tx, &page.conversations, &merged, Channel::Member)
                .await?;
            threads_created += threads;
            messages_created += messages;
            offset += limit;
            if page.next.is_none() || offset >= page.total {
                break;
            }
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok((threads_created, messages_created))
    }

    /// Incremental member batch: fan out, merge, upsert, commit once.
    async fn reconcile_member_batch(
        &self,
        token: &str,
        convs: &[RemoteConversation],
    ) -> Result<(u64, u64), SyncError> {
        if convs.is_empty() {
            return Ok((0, 0));
        }
        let merged = self.fetch_and_merge(token, convs, Channel::Member).await;
        let mut tx = self.store.begin().await?;
        let counts = self
            .upsert_batch(&mut tx, convs, &merged, Channel::Member)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(counts)
    }

    /// System channel: resume offset-pagination from the persisted cursor,
    /// bounded pages per invocation. Each page commits in its own transaction
    /// together with the advanced offset, so a mid-run timeout keeps every
    /// finished page. Reaching the end resets the offset for a fresh
    /// historical pass next time.
    async fn system_pass(
        &self,
        token: &str,
        full: bool,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let limit = self.config.page_limit;
        let max_pages = if full {
            self.config.system_pages_per_full_sync
        } else {
            self.config.system_pages_per_sync
        };
        let mut offset = self
            .store
            .get_offset_cursor(CursorKey::SystemPageOffset)
            .await?;
        let mut pages_fetched = 0u32;
        let mut reached_end = false;

        while pages_fetched < max_pages {
            let page = self
                .source
                .conversations_page(token, Channel::System, None, limit, offset)
                .await?;
            pages_fetched += 1;
            if page.conversations.is_empty() {
                reached_end = true;
                break;
            }

            // Existing system threads never get their messages re-fetched;
            // only newly observed conversation ids pay for a fetch.
            let mut fresh: Vec<RemoteConversation> = Vec::new();
            for conv in &page.conversations {
                let Some(cid) = conv.conversation_id.as_deref() else {
                    continue;
                };
                if self.store.get_thread(cid).await?.is_none() {
                    fresh.push(conv.clone());
                }
            }

            let merged = self.fetch_and_merge(token, &fresh, Channel::System).await;
            let mut tx = self.store.begin().await?;
            let (threads, messages) = self
                .upsert_batch(&mut tx, &fresh, &merged, Channel::System)
                .await?;
            offset += limit;
            MessageStore::set_cursor_tx(&mut tx, CursorKey::SystemPageOffset, &offset.to_string())
                .await?;
            tx.commit().await.map_err(StoreError::from)?;

            report.system_threads_synced += threads;
            report.system_messages_synced += messages;
            info!(
                target = "sellerdesk.sync",
                page = pages_fetched,
                offset,
                threads,
                messages,
                "system-channel page committed"
            );

            if page.next.is_none() || offset >= page.total {
                reached_end = true;
                break;
            }
        }

        if reached_end {
            self.store
                .set_cursor(CursorKey::SystemPageOffset, "0")
                .await?;
            info!(
                target = "sellerdesk.sync",
                "system-channel history exhausted, offset reset"
            );
        }
        Ok(())
    }

    /// Bounded fan-out of per-conversation message fetches, followed by an
    /// explicit merge: one deduplicated, time-sorted list per conversation id.
    /// A failed fetch drops that conversation from this batch (logged) rather
    /// than failing the pass.
    async fn fetch_and_merge(
        &self,
        token: &str,
        conversations: &[RemoteConversation],
        channel: Channel,
    ) -> HashMap<String, Vec<RemoteMessage>> {
        let ids: Vec<String> = conversations
            .iter()
            .filter_map(|c| c.conversation_id.clone())
            .collect();
        let source = &self.source;
        let results: Vec<(String, Result<Vec<RemoteMessage>, MarketplaceError>)> =
            stream::iter(ids.into_iter().map(|cid| async move {
                let outcome = source.conversation_messages(token, &cid, channel).await;
                (cid, outcome)
            }))
            .buffer_unordered(self.config.fan_out)
            .collect()
            .await;

        let mut merged: HashMap<String, Vec<RemoteMessage>> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (cid, outcome) in results {
            match outcome {
                Ok(messages) => {
                    let bucket = merged.entry(cid).or_default();
                    for message in messages {
                        let Some(mid) = message.message_id.clone() else {
                            continue;
                        };
                        if seen.insert(mid) {
                            bucket.push(message);
                        }
                    }
                }
                Err(err) => warn!(
                    target = "sellerdesk.sync",
                    conversation = %cid,
                    channel = channel.label(),
                    error = %err,
                    "message fetch failed, conversation skipped this pass"
                ),
            }
        }
        for bucket in merged.values_mut() {
            bucket.sort_by_key(|m| m.created_at());
        }
        merged
    }

    /// Upsert one batch of conversations plus their merged message lists into
    /// an open transaction. Returns (threads created, messages created).
    async fn upsert_batch(
        &self,
        conn: &mut SqliteConnection,
        conversations: &[RemoteConversation],
        merged: &HashMap<String, Vec<RemoteMessage>>,
        channel: Channel,
    ) -> Result<(u64, u64), SyncError> {
        let all_ids: Vec<String> = merged
            .values()
            .flatten()
            .filter_map(|m| m.message_id.clone())
            .collect();
        let existing = MessageStore::existing_message_ids(conn, &all_ids).await?;

        let mut threads_created = 0u64;
        let mut messages_created = 0u64;
        for conv in conversations {
            let Some(cid) = conv.conversation_id.as_deref() else {
                continue;
            };
            let Some(messages) = merged.get(cid) else {
                // Message fetch failed for this conversation; leave it for the
                // next pass instead of creating an empty thread.
                continue;
            };

            let counterparty = match channel {
                Channel::Member => self.counterparty_of(conv),
                Channel::System => Some(SYSTEM_COUNTERPARTY.to_string()),
            };
            let new_thread = NewThread {
                thread_id: cid.to_string(),
                counterparty,
                reference_item_id: reference_of(conv, "LISTING"),
                reference_order_id: reference_of(conv, "ORDER"),
                created_at: parse_marketplace_timestamp(conv.created_date.as_deref())
                    .unwrap_or_else(Utc::now),
            };
            if MessageStore::upsert_thread(conn, &new_thread).await? {
                threads_created += 1;
            }

            messages_created += self
                .apply_messages(conn, cid, channel, messages, &existing)
                .await?;
            if !messages.is_empty() {
                MessageStore::recompute_thread_rollup(conn, cid).await?;
            }
        }
        Ok((threads_created, messages_created))
    }

    /// Insert unseen messages and refresh volatile fields of known ones.
    async fn apply_messages(
        &self,
        conn: &mut SqliteConnection,
        thread_id: &str,
        channel: Channel,
        messages: &[RemoteMessage],
        existing: &HashSet<String>,
    ) -> Result<u64, SyncError> {
        let mut created = 0u64;
        for message in messages {
            let Some(mid) = message.message_id.as_deref() else {
                continue;
            };
            let attachments = normalize_attachments(&message.message_media);
            if existing.contains(mid) {
                MessageStore::refresh_message_volatile(
                    conn,
                    mid,
                    message.read_status,
                    &attachments,
                )
                .await?;
                continue;
            }
            let row = self.build_message_row(thread_id, mid, message, &attachments, channel);
            MessageStore::insert_message(conn, &row).await?;
            created += 1;
        }
        Ok(created)
    }

    fn build_message_row(
        &self,
        thread_id: &str,
        message_id: &str,
        message: &RemoteMessage,
        attachments: &[Attachment],
        channel: Channel,
    ) -> NewMessage {
        let raw_body = message.message_body.clone().unwrap_or_default();
        let (content, sender_class, sender_name) = match channel {
            Channel::System => {
                let body = if textnorm::looks_like_html(&raw_body) {
                    textnorm::strip_html_to_text(&raw_body, self.config.content_max)
                } else {
                    raw_body
                };
                let sender = message
                    .sender_username
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(SYSTEM_COUNTERPARTY)
                    .to_string();
                (body, SenderClass::System, Some(sender))
            }
            Channel::Member => {
                let mut body = raw_body;
                if !attachments.is_empty() {
                    let tags: Vec<String> = attachments
                        .iter()
                        .map(|a| format!("[{}: {}]", a.kind.as_str(), a.name))
                        .collect();
                    body = if body.is_empty() {
                        tags.join(" ")
                    } else {
                        format!("{body}\n{}", tags.join(" "))
                    };
                }
                let sender = message
                    .sender_username
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let class = match sender {
                    Some(name) if self.seller.is_seller(name) => SenderClass::Seller,
                    _ => SenderClass::Buyer,
                };
                (body, class, sender.map(String::from))
            }
        };
        NewMessage {
            message_id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            sender_class,
            sender_name,
            subject: message
                .subject
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            content,
            attachments: attachments.to_vec(),
            is_read: message.read_status,
            // Unresolvable timestamps fall back to now; accepted approximation.
            external_created_at: message.created_at().unwrap_or_else(Utc::now),
        }
    }

    /// The buyer is whichever party of the latest message is not the seller.
    /// A conversation where both parties are the seller stays buyer-less.
    fn counterparty_of(&self, conv: &RemoteConversation) -> Option<String> {
        let latest = conv.latest_message.as_ref()?;
        [
            latest.sender_username.as_deref(),
            latest.recipient_username.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty() && !self.seller.is_seller(name))
        .map(String::from)
    }
}

fn reference_of(conv: &RemoteConversation, kind: &str) -> Option<String> {
    if conv.reference_type.as_deref() == Some(kind) {
        conv.reference_id.clone()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::conversations::{LatestMessage, RawMedia};
    use std::sync::Mutex;

    const SELLER: &str = "shoplyne_uk";

    fn conv(id: &str, buyer: Option<&str>) -> RemoteConversation {
        RemoteConversation {
            conversation_id: Some(id.to_string()),
            reference_id: Some("item-9".to_string()),
            reference_type: Some("LISTING".to_string()),
            created_date: Some("2026-02-01T08:00:00.000Z".to_string()),
            latest_message: buyer.map(|name| LatestMessage {
                sender_username: Some(name.to_string()),
                recipient_username: Some(SELLER.to_string()),
            }),
        }
    }

    fn msg(id: &str, sender: &str, minute: u32) -> RemoteMessage {
        RemoteMessage {
            message_id: Some(id.to_string()),
            sender_username: Some(sender.to_string()),
            subject: None,
            message_body: Some(format!("hello from {id}")),
            message_media: Vec::new(),
            read_status: false,
            created_date: Some(format!("2026-02-01T08:{minute:02}:00.000Z")),
        }
    }

    #[derive(Default)]
    struct FakeData {
        member: Vec<(RemoteConversation, Vec<RemoteMessage>)>,
        system: Vec<(RemoteConversation, Vec<RemoteMessage>)>,
        member_forbidden: bool,
        token_missing: bool,
        fail_system_page: Option<u32>,
        fail_messages_for: HashSet<String>,
        message_fetch_calls: HashMap<String, u32>,
    }

    #[derive(Default)]
    struct FakeSource {
        data: Mutex<FakeData>,
    }

    impl FakeSource {
        fn new(data: FakeData) -> Self {
            Self {
                data: Mutex::new(data),
            }
        }

        fn fetch_calls(&self, cid: &str) -> u32 {
            self.data
                .lock()
                .unwrap()
                .message_fetch_calls
                .get(cid)
                .copied()
                .unwrap_or(0)
        }

        fn set_read_everywhere(&self) {
            let mut data = self.data.lock().unwrap();
            for (_, msgs) in data.member.iter_mut() {
                for m in msgs.iter_mut() {
                    m.read_status = true;
                    m.message_body = Some("REWRITTEN UPSTREAM".to_string());
                }
            }
        }

        fn push_member_message(&self, cid: &str, message: RemoteMessage) {
            let mut data = self.data.lock().unwrap();
            if let Some((_, msgs)) = data
                .member
                .iter_mut()
                .find(|(c, _)| c.conversation_id.as_deref() == Some(cid))
            {
                msgs.push(message);
            }
        }

        fn page_of(
            rows: &[(RemoteConversation, Vec<RemoteMessage>)],
            limit: u32,
            offset: u32,
        ) -> ConversationPage {
            let total = rows.len() as u32;
            let start = (offset as usize).min(rows.len());
            let end = (offset as usize + limit as usize).min(rows.len());
            let conversations: Vec<RemoteConversation> =
                rows[start..end].iter().map(|(c, _)| c.clone()).collect();
            let next = (end < rows.len()).then(|| "next-page".to_string());
            ConversationPage {
                conversations,
                total,
                next,
            }
        }
    }

    impl ConversationSource for FakeSource {
        fn access_token(&self) -> impl Future<Output = Result<String, MarketplaceError>> + Send {
            let missing = self.data.lock().unwrap().token_missing;
            async move {
                if missing {
                    Err(MarketplaceError::NotConnected)
                } else {
                    Ok("test-token".to_string())
                }
            }
        }

        fn conversations_page(
            &self,
            _token: &str,
            channel: Channel,
            _start_time: Option<DateTime<Utc>>,
            limit: u32,
            offset: u32,
        ) -> impl Future<Output = Result<ConversationPage, MarketplaceError>> + Send {
            let data = self.data.lock().unwrap();
            let result = match channel {
                Channel::Member => {
                    if data.member_forbidden {
                        Err(MarketplaceError::Forbidden)
                    } else {
                        Ok(Self::page_of(&data.member, limit, offset))
                    }
                }
                Channel::System => {
                    let page_index = offset / limit.max(1);
                    if data.fail_system_page == Some(page_index) {
                        Err(MarketplaceError::Request("HTTP 504".to_string()))
                    } else {
                        Ok(Self::page_of(&data.system, limit, offset))
                    }
                }
            };
            async move { result }
        }

        fn all_conversations(
            &self,
            _token: &str,
            channel: Channel,
            start_time: Option<DateTime<Utc>>,
            _limit: u32,
        ) -> impl Future<Output = Result<Vec<RemoteConversation>, MarketplaceError>> + Send
        {
            let data = self.data.lock().unwrap();
            let result = if data.member_forbidden {
                Err(MarketplaceError::Forbidden)
            } else if channel == Channel::Member && start_time.is_some() {
                // Activity filter: nothing new since the high-water mark.
                Ok(Vec::new())
            } else {
                Ok(data.member.iter().map(|(c, _)| c.clone()).collect())
            };
            async move { result }
        }

        fn conversation_messages(
            &self,
            _token: &str,
            conversation_id: &str,
            _channel: Channel,
        ) -> impl Future<Output = Result<Vec<RemoteMessage>, MarketplaceError>> + Send {
            let mut data = self.data.lock().unwrap();
            *data
                .message_fetch_calls
                .entry(conversation_id.to_string())
                .or_insert(0) += 1;
            let result = if data.fail_messages_for.contains(conversation_id) {
                Err(MarketplaceError::Request("HTTP 500".to_string()))
            } else {
                let found = data
                    .member
                    .iter()
                    .chain(data.system.iter())
                    .find(|(c, _)| c.conversation_id.as_deref() == Some(conversation_id))
                    .map(|(_, msgs)| msgs.clone())
                    .unwrap_or_default();
                Ok(found)
            };
            async move { result }
        }
    }

    async fn engine_with(data: FakeData, config: SyncConfig) -> SyncEngine<FakeSource> {
        let store = MessageStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store");
        SyncEngine::new(
            store,
            FakeSource::new(data),
            SellerIdentity::new(SELLER),
            config,
        )
    }

    fn three_member_conversations() -> Vec<(RemoteConversation, Vec<RemoteMessage>)> {
        vec![
            (
                conv("c1", Some("alice")),
                vec![msg("m1", "alice", 1), msg("m2", SELLER, 2)],
            ),
            (
                conv("c2", Some("bob")),
                vec![msg("m3", "bob", 3), msg("m4", "bob", 4)],
            ),
            (
                conv("c3", Some("carol")),
                vec![msg("m5", "carol", 5), msg("m6", SELLER, 6)],
            ),
        ]
    }

    #[tokio::test]
    async fn first_sync_builds_baseline_and_sets_cursors() {
        let before = Utc::now();
        let engine = engine_with(
            FakeData {
                member: three_member_conversations(),
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;

        let report = engine.run(false).await.expect("sync");
        assert_eq!(report.threads_synced, 3);
        assert_eq!(report.messages_synced, 6);
        assert_eq!(report.system_threads_synced, 0);
        assert!(report.message.contains("3 thread(s)"));

        let store = engine.store();
        let threads = store.list_threads(crate::store::ThreadFilter::All).await.unwrap();
        assert_eq!(threads.len(), 3);
        for thread in &threads {
            assert_eq!(thread.message_count, 2);
        }
        let hwm = store
            .get_time_cursor(CursorKey::MemberHighWater)
            .await
            .unwrap()
            .expect("high-water mark set");
        assert!(hwm >= before);
        // First run had no full-sync cursor, so the baseline also counts as a
        // full pass and records one.
        assert!(
            store
                .get_time_cursor(CursorKey::LastFullSyncAt)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .get_time_cursor(CursorKey::LastSyncAt)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn empty_incremental_window_still_advances_cursor() {
        let engine = engine_with(
            FakeData {
                member: three_member_conversations(),
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("baseline");
        let first_sync_at = engine
            .store()
            .get_time_cursor(CursorKey::LastSyncAt)
            .await
            .unwrap()
            .unwrap();

        // Second run: activity filter yields nothing, full pass not yet stale.
        let report = engine.run(false).await.expect("second sync");
        assert_eq!(report.threads_synced, 0);
        assert_eq!(report.messages_synced, 0);
        assert_eq!(report.message, "No new conversations or messages to sync.");
        let second_sync_at = engine
            .store()
            .get_time_cursor(CursorKey::LastSyncAt)
            .await
            .unwrap()
            .unwrap();
        assert!(second_sync_at >= first_sync_at);
    }

    #[tokio::test]
    async fn resync_updates_volatile_fields_without_duplicating() {
        let engine = engine_with(
            FakeData {
                member: three_member_conversations(),
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("baseline");

        // Upstream flips read state and (hostilely) rewrites bodies.
        {
            let source = &engine.source;
            source.set_read_everywhere();
        }
        let report = engine.run(true).await.expect("full resync");
        assert_eq!(report.messages_synced, 0, "no new rows on resync");

        let rows = engine.store().thread_messages("c1").await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(row.is_read, "read status refreshed");
            assert!(
                row.content.starts_with("hello from"),
                "content never overwritten on resync"
            );
        }
        let thread = engine.store().get_thread("c1").await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 0);
        assert_eq!(thread.message_count, 2);
    }

    #[tokio::test]
    async fn sender_classification_and_counterparty() {
        let engine = engine_with(
            FakeData {
                member: vec![(
                    conv("c1", Some("alice")),
                    vec![msg("m1", "alice", 1), msg("m2", "SHOPLYNE_UK", 2)],
                )],
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("sync");

        let rows = engine.store().thread_messages("c1").await.unwrap();
        assert_eq!(rows[0].sender_class, "buyer");
        assert_eq!(rows[1].sender_class, "seller", "case-insensitive match");
        let thread = engine.store().get_thread("c1").await.unwrap().unwrap();
        assert_eq!(thread.counterparty.as_deref(), Some("alice"));
        assert_eq!(thread.reference_item_id.as_deref(), Some("item-9"));
    }

    #[tokio::test]
    async fn seller_only_conversation_stays_buyerless() {
        let engine = engine_with(
            FakeData {
                member: vec![(
                    RemoteConversation {
                        latest_message: Some(LatestMessage {
                            sender_username: Some(SELLER.to_string()),
                            recipient_username: Some(SELLER.to_string()),
                        }),
                        ..conv("c1", None)
                    },
                    vec![msg("m1", SELLER, 1)],
                )],
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("sync");
        let thread = engine.store().get_thread("c1").await.unwrap().unwrap();
        assert!(thread.counterparty.is_none());
    }

    #[tokio::test]
    async fn failed_message_fetch_skips_only_that_conversation() {
        let mut data = FakeData {
            member: three_member_conversations(),
            ..Default::default()
        };
        data.fail_messages_for.insert("c2".to_string());
        let engine = engine_with(data, SyncConfig::default()).await;

        let report = engine.run(false).await.expect("sync succeeds regardless");
        assert_eq!(report.threads_synced, 2);
        assert_eq!(report.messages_synced, 4);
        assert!(engine.store().get_thread("c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forbidden_member_fetch_fails_whole_invocation() {
        let engine = engine_with(
            FakeData {
                member_forbidden: true,
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        let err = engine.run(false).await.expect_err("must fail");
        assert!(matches!(err, SyncError::Forbidden));
        // No cursor may advance when the member pass failed.
        assert!(
            engine
                .store()
                .get_time_cursor(CursorKey::LastSyncAt)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn missing_token_is_a_precondition_failure() {
        let engine = engine_with(
            FakeData {
                token_missing: true,
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        let err = engine.run(false).await.expect_err("must fail");
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test]
    async fn system_channel_strips_html_and_labels_threads() {
        let engine = engine_with(
            FakeData {
                system: vec![(
                    conv("s1", None),
                    vec![RemoteMessage {
                        message_body: Some(
                            "<p>Your case is closed</p><script>evil()</script>".to_string(),
                        ),
                        ..msg("sm1", "", 1)
                    }],
                )],
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        let report = engine.run(false).await.expect("sync");
        assert_eq!(report.system_threads_synced, 1);
        assert_eq!(report.system_messages_synced, 1);

        let rows = engine.store().thread_messages("s1").await.unwrap();
        assert_eq!(rows[0].sender_class, "system");
        assert_eq!(rows[0].content, "Your case is closed");
        let thread = engine.store().get_thread("s1").await.unwrap().unwrap();
        assert_eq!(thread.counterparty.as_deref(), Some("eBay"));
    }

    #[tokio::test]
    async fn system_interruption_keeps_committed_pages_and_offset() {
        // Two system conversations per page, three pages, second page fails.
        let system: Vec<(RemoteConversation, Vec<RemoteMessage>)> = (0..6)
            .map(|i| {
                (
                    conv(&format!("s{i}"), None),
                    vec![msg(&format!("sm{i}"), "", i as u32 % 60)],
                )
            })
            .collect();
        let config = SyncConfig {
            page_limit: 2,
            system_pages_per_full_sync: 5,
            ..SyncConfig::default()
        };
        let engine = engine_with(
            FakeData {
                system,
                fail_system_page: Some(1),
                ..Default::default()
            },
            config,
        )
        .await;

        // The invocation still succeeds: member work is empty, system failure
        // is local, page 1 is durable.
        let report = engine.run(true).await.expect("sync reports success");
        assert_eq!(report.system_threads_synced, 2);
        assert_eq!(report.system_messages_synced, 2);
        assert!(engine.store().get_thread("s0").await.unwrap().is_some());
        assert!(engine.store().get_thread("s1").await.unwrap().is_some());
        assert!(engine.store().get_thread("s2").await.unwrap().is_none());
        assert_eq!(
            engine
                .store()
                .get_offset_cursor(CursorKey::SystemPageOffset)
                .await
                .unwrap(),
            2,
            "offset reflects the last committed page, not zero"
        );
    }

    #[tokio::test]
    async fn system_end_of_history_resets_offset_and_skips_known_threads() {
        let engine = engine_with(
            FakeData {
                system: vec![(conv("s1", None), vec![msg("sm1", "", 1)])],
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("first sync");
        assert_eq!(
            engine
                .store()
                .get_offset_cursor(CursorKey::SystemPageOffset)
                .await
                .unwrap(),
            0,
            "offset reset after reaching the end"
        );
        let calls_after_first = engine.source.fetch_calls("s1");
        assert_eq!(calls_after_first, 1);

        engine.run(false).await.expect("second sync");
        assert_eq!(
            engine.source.fetch_calls("s1"),
            calls_after_first,
            "existing system threads are not re-fetched"
        );
    }

    #[tokio::test]
    async fn refresh_thread_picks_up_new_messages() {
        let engine = engine_with(
            FakeData {
                member: three_member_conversations(),
                ..Default::default()
            },
            SyncConfig::default(),
        )
        .await;
        engine.run(false).await.expect("baseline");

        engine.source.push_member_message(
            "c1",
            RemoteMessage {
                message_media: vec![RawMedia {
                    media_name: Some("receipt.pdf".to_string()),
                    media_type: Some("PDF".to_string()),
                    media_url: Some("https://cdn.example/receipt.pdf".to_string()),
                }],
                ..msg("m99", "alice", 30)
            },
        );
        engine.refresh_thread("c1").await.expect("refresh");

        let rows = engine.store().thread_messages("c1").await.unwrap();
        assert_eq!(rows.len(), 3);
        let newest = rows.last().unwrap();
        assert_eq!(newest.message_id, "m99");
        assert!(newest.content.contains("[PDF: receipt.pdf]"));
        let thread = engine.store().get_thread("c1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 3);
    }

    #[tokio::test]
    async fn placeholder_threads_are_purged_at_sync_start() {
        let engine = engine_with(FakeData::default(), SyncConfig::default()).await;
        {
            let mut tx = engine.store().begin().await.unwrap();
            MessageStore::upsert_thread(
                &mut tx,
                &NewThread {
                    thread_id: "stub-old".to_string(),
                    counterparty: None,
                    reference_item_id: None,
                    reference_order_id: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        engine.run(false).await.expect("sync");
        assert!(engine.store().get_thread("stub-old").await.unwrap().is_none());
    }
}
