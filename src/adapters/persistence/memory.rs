//! In-memory stores. Sessions live for the process lifetime (minus evictions).
//!
//! `compare_and_swap` runs under the map's per-shard write lock, which makes it
//! linearizable per chat without any lock held across an await.

use crate::domain::{ChatId, DomainError, Session, UserId};
use crate::ports::{CredentialStore, InFlightCheck, SessionStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<ChatId, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored copy, without creating one.
    pub fn peek(&self, chat_id: ChatId) -> Option<Session> {
        self.sessions.get(&chat_id).map(|s| s.clone())
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, chat_id: ChatId) -> Result<Session, DomainError> {
        let session = self
            .sessions
            .entry(chat_id)
            .or_insert_with(|| Session::new(chat_id, Utc::now()));
        Ok(session.clone())
    }

    async fn compare_and_swap(
        &self,
        chat_id: ChatId,
        expected_version: u64,
        mut new: Session,
    ) -> Result<bool, DomainError> {
        match self.sessions.get_mut(&chat_id) {
            Some(mut current) if current.version == expected_version => {
                new.chat_id = chat_id;
                new.version = expected_version + 1;
                *current = new;
                Ok(true)
            }
            Some(current) => {
                debug!(chat_id, expected_version, stored_version = current.version, "version conflict");
                Ok(false)
            }
            // Evicted since it was read; the caller re-reads a fresh session.
            None => Ok(false),
        }
    }

    async fn evict_idle(
        &self,
        cutoff: DateTime<Utc>,
        in_flight: InFlightCheck<'_>,
    ) -> Result<Vec<ChatId>, DomainError> {
        let candidates: Vec<ChatId> = self
            .sessions
            .iter()
            .filter(|s| s.last_active_at <= cutoff)
            .map(|s| *s.key())
            .collect();
        let mut evicted = Vec::with_capacity(candidates.len());
        for chat_id in candidates {
            let removed = self.sessions.remove_if(&chat_id, |_, s| {
                s.last_active_at <= cutoff && !in_flight(chat_id)
            });
            if removed.is_some() {
                evicted.push(chat_id);
            }
        }
        Ok(evicted)
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    keys: DashMap<UserId, String>,
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn save_api_key(&self, user_id: UserId, api_key: &str) -> Result<(), DomainError> {
        self.keys.insert(user_id, api_key.to_string());
        Ok(())
    }

    async fn api_key(&self, user_id: UserId) -> Result<Option<String>, DomainError> {
        Ok(self.keys.get(&user_id).map(|k| k.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StateTag;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lazy_create_and_version_bump() {
        let store = InMemorySessionStore::new();
        let s = store.get_or_create(5).await.unwrap();
        assert_eq!((s.state, s.version), (StateTag::New, 0));

        let mut next = s.clone();
        next.state = StateTag::Ready;
        assert!(store.compare_and_swap(5, 0, next.clone()).await.unwrap());
        assert_eq!(store.peek(5).unwrap().version, 1);
        // Stale writer loses.
        assert!(!store.compare_and_swap(5, 0, next).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_exactly_one_wins() {
        let store = Arc::new(InMemorySessionStore::new());
        let base = store.get_or_create(1).await.unwrap();
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let mut s = base.clone();
                tokio::spawn(async move {
                    s.set_attr("writer", i as i64);
                    store.compare_and_swap(1, 0, s).await.unwrap()
                })
            })
            .collect();
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.peek(1).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_eviction_yields_fresh_session() {
        let store = InMemorySessionStore::new();
        let mut s = store.get_or_create(5).await.unwrap();
        s.state = StateTag::Ready;
        s.set_attr("name", "stale");
        assert!(store.compare_and_swap(5, 0, s).await.unwrap());

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let evicted = store.evict_idle(cutoff, &|_| false).await.unwrap();
        assert_eq!(evicted, vec![5]);

        let fresh = store.get_or_create(5).await.unwrap();
        assert_eq!(fresh.state, StateTag::New);
        assert_eq!(fresh.version, 0);
        assert!(fresh.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_chat_not_evicted() {
        let store = InMemorySessionStore::new();
        store.get_or_create(1).await.unwrap();
        store.get_or_create(2).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let evicted = store.evict_idle(cutoff, &|chat| chat == 1).await.unwrap();
        assert_eq!(evicted, vec![2]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_cas_after_eviction_fails() {
        let store = InMemorySessionStore::new();
        let s = store.get_or_create(3).await.unwrap();
        store
            .evict_idle(Utc::now() + chrono::Duration::seconds(1), &|_| false)
            .await
            .unwrap();
        assert!(!store.compare_and_swap(3, 0, s).await.unwrap());
    }

    #[tokio::test]
    async fn test_credentials() {
        let store = InMemoryCredentialStore::default();
        assert_eq!(store.api_key(1).await.unwrap(), None);
        store.save_api_key(1, "k").await.unwrap();
        assert_eq!(store.api_key(1).await.unwrap().as_deref(), Some("k"));
    }
}
