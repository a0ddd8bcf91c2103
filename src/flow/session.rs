use crate::flow::state::{keys, StateValue, WorkflowContext};
use async_trait::async_trait;
use moka::future::Cache;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The conversation a set of topics works for.
///
/// The orchestration core reads and writes through this trait but never owns
/// how a conversation is persisted.
#[async_trait]
pub trait ConversationContext: Send + Sync + Debug {
    fn conversation_id(&self) -> &str;

    /// Shared key/value store of the conversation.
    fn workflow(&self) -> Arc<WorkflowContext>;

    fn get_value(&self, key: &str) -> Option<StateValue> {
        self.workflow().value(key)
    }

    fn set_value(&self, key: &str, value: StateValue) {
        self.workflow().set(key, value);
    }

    fn current_topic_name(&self) -> Option<String> {
        self.workflow().try_get(keys::CURRENT_TOPIC)
    }

    fn set_current_topic_name(&self, name: Option<&str>) {
        self.workflow().set(keys::CURRENT_TOPIC, name);
    }

    fn add_topic_to_history(&self, topic: &str) {
        self.workflow().push_topic_history(topic);
    }

    fn add_topic_to_chain(&self, topic: &str) {
        self.workflow().push_topic_chain(topic);
    }

    fn is_terminated(&self) -> bool;

    /// Ends the conversation. Calling it twice is a no-op.
    fn terminate(&self);

    async fn terminate_async(&self, cancel: &CancellationToken);
}

pub type SharedConversation = Arc<dyn ConversationContext>;

/// In-memory conversation used by the CLI, the store and tests.
#[derive(Debug)]
pub struct Conversation {
    id: String,
    workflow: Arc<WorkflowContext>,
    terminated: AtomicBool,
}

impl Conversation {
    pub fn new(id: &str) -> Arc<Self> {
        let workflow = WorkflowContext::new();
        workflow.set_conversation_active(true);
        Arc::new(Self {
            id: id.to_string(),
            workflow,
            terminated: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ConversationContext for Conversation {
    fn conversation_id(&self) -> &str {
        &self.id
    }

    fn workflow(&self) -> Arc<WorkflowContext> {
        self.workflow.clone()
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(conversation_id = %self.id, "conversation already terminated");
            return;
        }
        self.workflow.set_conversation_active(false);
        info!(conversation_id = %self.id, "conversation terminated");
    }

    async fn terminate_async(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            debug!(conversation_id = %self.id, "terminate requested with a cancelled token");
        }
        self.terminate();
    }
}

pub type ConversationStore = Arc<dyn ConversationStoreType>;

/// Factory and cache for per-conversation contexts.
#[async_trait]
pub trait ConversationStoreType: Send + Sync + Debug {
    async fn get(&self, conversation_id: &str) -> Option<SharedConversation>;
    /// Returns an existing conversation or starts a fresh one.
    async fn get_or_create(&self, conversation_id: &str) -> SharedConversation;
    async fn remove(&self, conversation_id: &str);
    fn clear(&self);
}

#[derive(Clone, Debug)]
pub struct InMemoryConversationStore {
    cache: Cache<String, Arc<Conversation>>,
}

impl InMemoryConversationStore {
    /// Conversations idle for longer than `ttl_secs` are evicted.
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, value: Arc<Conversation>, cause| {
                value.terminate();
                info!("Conversation evicted: key={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl ConversationStoreType for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Option<SharedConversation> {
        self.cache
            .get(conversation_id)
            .await
            .map(|c| c as SharedConversation)
    }

    async fn get_or_create(&self, conversation_id: &str) -> SharedConversation {
        let conversation = self
            .cache
            .get_with(conversation_id.to_string(), async { Conversation::new(conversation_id) })
            .await;
        conversation as SharedConversation
    }

    async fn remove(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id).await;
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_create_and_retrieve() {
        let store = InMemoryConversationStore::new(60);

        let conv = store.get_or_create("abc123").await;
        conv.set_value("foo", StateValue::String("bar".into()));

        let again = store.get_or_create("abc123").await;
        assert_eq!(again.get_value("foo"), Some(StateValue::String("bar".into())));
        assert!(store.get("abc123").await.is_some());
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_store_remove() {
        let store = InMemoryConversationStore::new(60);
        store.get_or_create("gone").await;
        store.remove("gone").await;
        assert!(store.get("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_store_expiry() {
        let store = InMemoryConversationStore::new(1);
        let conv = store.get_or_create("short").await;
        conv.set_value("k", StateValue::Integer(1));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        store.cache.run_pending_tasks().await;

        assert!(store.get("short").await.is_none());
    }

    #[test]
    fn test_current_topic_and_history() {
        let conv = Conversation::new("c1");
        assert_eq!(conv.current_topic_name(), None);
        conv.set_current_topic_name(Some("Profile"));
        assert_eq!(conv.current_topic_name(), Some("Profile".to_string()));
        conv.set_current_topic_name(None);
        assert_eq!(conv.current_topic_name(), None);

        conv.add_topic_to_history("Greeting");
        conv.add_topic_to_chain("Feedback");
        assert_eq!(conv.workflow().topic_history(), vec!["Greeting"]);
        assert_eq!(conv.workflow().topic_chain(), vec!["Feedback"]);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let conv = Conversation::new("c2");
        assert!(conv.workflow().conversation_active());
        conv.terminate();
        conv.terminate();
        conv.terminate_async(&CancellationToken::new()).await;
        assert!(conv.is_terminated());
        assert!(!conv.workflow().conversation_active());
    }
}
