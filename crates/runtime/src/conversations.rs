//! Per-chat message histories: bounded LRU with per-entry TTL.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use vigil_llm::ChatMessage;

const DEFAULT_MAX_CONVERSATIONS: usize = 200;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    inserted_at: Instant,
    messages: Vec<ChatMessage>,
}

pub struct ConversationStore {
    ttl: Duration,
    cache: Mutex<LruCache<String, Entry>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONVERSATIONS, DEFAULT_TTL)
    }
}

impl ConversationStore {
    pub fn new(max_conversations: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_conversations.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the stored history and refreshes its LRU position. Expired
    /// entries are removed on read.
    pub fn get(&self, key: Option<&str>) -> Option<Vec<ChatMessage>> {
        let key = key?;
        let mut cache = self.cache.lock();
        let expired = match cache.get(key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            cache.pop(key);
            return None;
        }
        cache.get(key).map(|entry| entry.messages.clone())
    }

    /// Insert or refresh; a `None` key is a no-op. Least-recently-used
    /// entries fall off once the cap is reached.
    pub fn put(&self, key: Option<&str>, messages: Vec<ChatMessage>) {
        let Some(key) = key else { return };
        let entry = Entry {
            inserted_at: Instant::now(),
            messages,
        };
        self.cache.lock().put(key.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    #[tokio::test]
    async fn get_unknown_key_is_none() {
        let store = ConversationStore::default();
        assert!(store.get(Some("unknown")).is_none());
    }

    #[tokio::test]
    async fn none_key_is_noop() {
        let store = ConversationStore::default();
        store.put(None, msgs("hi"));
        assert!(store.get(None).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = ConversationStore::default();
        store.put(Some("telegram:123"), msgs("hi"));
        assert_eq!(store.get(Some("telegram:123")).unwrap(), msgs("hi"));
    }

    #[tokio::test]
    async fn put_updates_existing_entry() {
        let store = ConversationStore::default();
        store.put(Some("k"), msgs("one"));
        store.put(Some("k"), msgs("two"));
        assert_eq!(store.get(Some("k")).unwrap(), msgs("two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lru_eviction() {
        let store = ConversationStore::new(2, DEFAULT_TTL);
        store.put(Some("a"), msgs("1"));
        store.put(Some("b"), msgs("2"));
        store.put(Some("c"), msgs("3")); // evicts "a"
        assert!(store.get(Some("a")).is_none());
        assert!(store.get(Some("b")).is_some());
        assert!(store.get(Some("c")).is_some());
    }

    #[tokio::test]
    async fn get_refreshes_lru_order() {
        let store = ConversationStore::new(2, DEFAULT_TTL);
        store.put(Some("a"), msgs("1"));
        store.put(Some("b"), msgs("2"));
        store.get(Some("a")); // "a" becomes most recent
        store.put(Some("c"), msgs("3")); // evicts "b"
        assert!(store.get(Some("a")).is_some());
        assert!(store.get(Some("b")).is_none());
        assert!(store.get(Some("c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_removes_on_read() {
        let store = ConversationStore::new(10, Duration::from_secs(1));
        store.put(Some("k"), msgs("hi"));
        assert!(store.get(Some("k")).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(Some("k")).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_access_is_safe() {
        use std::sync::Arc;
        let store = Arc::new(ConversationStore::new(50, DEFAULT_TTL));
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("t{t}:{i}");
                    store.put(Some(&key), msgs(&key));
                    store.get(Some(&key));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(store.len() <= 50);
    }
}
