use crate::store::{CursorKey, MessageStore};
use crate::sync::{ConversationSource, SyncEngine, SyncError, SyncReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    pub total_unread_count: i64,
}

/// Owns the single-flight guard around the engine. Exactly one sync runs at a
/// time process-wide; a concurrent attempt is rejected immediately rather than
/// queued. The guard is a scoped `MutexGuard`, so it releases on every exit
/// path including panics.
pub struct SyncCoordinator<C: ConversationSource> {
    engine: SyncEngine<C>,
    guard: Mutex<()>,
}

impl<C: ConversationSource> SyncCoordinator<C> {
    pub fn new(engine: SyncEngine<C>) -> Self {
        Self {
            engine,
            guard: Mutex::new(()),
        }
    }

    pub async fn sync(&self, full: bool) -> Result<SyncReport, SyncError> {
        let Ok(_permit) = self.guard.try_lock() else {
            debug!(target = "sellerdesk.sync", "sync rejected: already running");
            return Err(SyncError::AlreadyRunning);
        };
        self.engine.run(full).await
    }

    /// Single-conversation refresh; cheap enough that it does not take the
    /// sync guard and relies on the same upsert/rollup primitives instead.
    pub async fn refresh_thread(&self, thread_id: &str) -> Result<(), SyncError> {
        self.engine.refresh_thread(thread_id).await
    }

    pub fn is_syncing(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let store = self.engine.store();
        let last_sync_at = store.get_time_cursor(CursorKey::LastSyncAt).await?;
        let total_unread_count = store.total_unread().await?;
        Ok(SyncStatus {
            last_sync_at,
            is_syncing: self.is_syncing(),
            total_unread_count,
        })
    }

    pub fn store(&self) -> &MessageStore {
        self.engine.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::MarketplaceError;
    use crate::marketplace::conversations::{
        Channel, ConversationPage, RemoteConversation, RemoteMessage,
    };
    use crate::sync::{SellerIdentity, SyncConfig};
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    /// Token acquisition stalls, then fails: long enough to observe the lock,
    /// and an error path to prove the guard releases on failure too.
    struct SlowSource;

    impl ConversationSource for SlowSource {
        fn access_token(&self) -> impl Future<Output = Result<String, MarketplaceError>> + Send {
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(MarketplaceError::NotConnected)
            }
        }

        fn conversations_page(
            &self,
            _token: &str,
            _channel: Channel,
            _start_time: Option<DateTime<Utc>>,
            _limit: u32,
            _offset: u32,
        ) -> impl Future<Output = Result<ConversationPage, MarketplaceError>> + Send {
            async { Ok(ConversationPage::default()) }
        }

        fn all_conversations(
            &self,
            _token: &str,
            _channel: Channel,
            _start_time: Option<DateTime<Utc>>,
            _limit: u32,
        ) -> impl Future<Output = Result<Vec<RemoteConversation>, MarketplaceError>> + Send
        {
            async { Ok(Vec::new()) }
        }

        fn conversation_messages(
            &self,
            _token: &str,
            _conversation_id: &str,
            _channel: Channel,
        ) -> impl Future<Output = Result<Vec<RemoteMessage>, MarketplaceError>> + Send {
            async { Ok(Vec::new()) }
        }
    }

    async fn slow_coordinator() -> Arc<SyncCoordinator<SlowSource>> {
        let store = MessageStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store");
        let engine = SyncEngine::new(
            store,
            SlowSource,
            SellerIdentity::default(),
            SyncConfig::default(),
        );
        Arc::new(SyncCoordinator::new(engine))
    }

    #[tokio::test]
    async fn concurrent_sync_is_rejected_and_guard_releases_on_failure() {
        let coordinator = slow_coordinator().await;
        assert!(!coordinator.is_syncing());

        let background = coordinator.clone();
        let handle = tokio::spawn(async move { background.sync(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.is_syncing());
        let err = coordinator.sync(false).await.expect_err("second must fail");
        assert!(matches!(err, SyncError::AlreadyRunning));

        // The in-flight sync fails (no token), yet the guard must release.
        let inner = handle.await.expect("join");
        assert!(matches!(inner, Err(SyncError::NotConnected)));
        assert!(!coordinator.is_syncing());

        // And a later attempt gets the lock again.
        let err = coordinator.sync(false).await.expect_err("still no token");
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test]
    async fn status_reads_cursor_and_unread_count() {
        let coordinator = slow_coordinator().await;
        let status = coordinator.status().await.expect("status");
        assert!(status.last_sync_at.is_none());
        assert!(!status.is_syncing);
        assert_eq!(status.total_unread_count, 0);

        coordinator
            .store()
            .set_time_cursor(CursorKey::LastSyncAt, Utc::now())
            .await
            .unwrap();
        let status = coordinator.status().await.expect("status");
        assert!(status.last_sync_at.is_some());
    }
}
