// Message persistence for consultation chat.
//
// Durability is best-effort by contract: the relay delivers messages in
// real time whether or not the store is reachable. The `*_best_effort`
// wrappers make that policy visible at every call site.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use consulta_common::types::{ChatMessage, Role};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::warn;

use crate::metrics;

/// Append/history access to consultation messages.
///
/// The memory variant backs tests and the degraded no-database mode;
/// its contents live only as long as the process.
#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryMessages>>),
}

#[derive(Debug, Default)]
pub struct MemoryMessages {
    next_id: i64,
    by_session: HashMap<i64, Vec<ChatMessage>>,
    fail_appends: bool,
}

impl MessageStore {
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryMessages::default())))
    }

    pub async fn append(&self, message: &ChatMessage) -> Result<i64> {
        match self {
            Self::Postgres(pool) => {
                let created_at = message.created_at.unwrap_or_else(Utc::now);
                let id = sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO consultation_messages
                        (session_id, text, sender_role, sender_user_id, sender_display_name, created_at, read)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id
                    "#,
                )
                .bind(message.session_id)
                .bind(&message.text)
                .bind(message.sender_role.as_str())
                .bind(message.sender_user_id)
                .bind(&message.sender_display_name)
                .bind(created_at)
                .bind(message.read)
                .fetch_one(pool)
                .await
                .context("failed to append consultation message")?;
                Ok(id)
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if guard.fail_appends {
                    return Err(anyhow!("memory message store is configured to fail appends"));
                }
                guard.next_id += 1;
                let id = guard.next_id;
                let mut stored = message.clone();
                stored.id = id;
                guard.by_session.entry(message.session_id).or_default().push(stored);
                Ok(id)
            }
        }
    }

    pub async fn history(&self, session_id: i64) -> Result<Vec<ChatMessage>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT id, session_id, text, sender_role, sender_user_id, sender_display_name, created_at, read
                    FROM consultation_messages
                    WHERE session_id = $1
                    ORDER BY created_at, id
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .context("failed to fetch consultation history")?;

                rows.into_iter().map(row_to_message).collect()
            }
            Self::Memory(store) => Ok(store
                .read()
                .await
                .by_session
                .get(&session_id)
                .cloned()
                .unwrap_or_default()),
        }
    }

    /// Append that never fails the caller: a store error is counted,
    /// logged, and reported as `None` so the message can be delivered
    /// with a locally synthesized id.
    pub async fn append_best_effort(&self, message: &ChatMessage) -> Option<i64> {
        match self.append(message).await {
            Ok(id) => Some(id),
            Err(error) => {
                metrics::increment_message_append_failures();
                warn!(
                    error = ?error,
                    session_id = message.session_id,
                    sender_user_id = message.sender_user_id,
                    "message append failed; delivering without durability"
                );
                None
            }
        }
    }

    /// History fetch that never fails the caller: a store error is
    /// logged and reported as an empty history, so joining stays
    /// possible while persistence is down.
    pub async fn history_best_effort(&self, session_id: i64) -> Vec<ChatMessage> {
        match self.history(session_id).await {
            Ok(messages) => messages,
            Err(error) => {
                warn!(error = ?error, session_id, "history fetch failed; joining with empty history");
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn fail_appends_for_tests(&self, fail: bool) {
        if let Self::Memory(store) = self {
            store.write().await.fail_appends = fail;
        }
    }
}

fn row_to_message(row: sqlx::postgres::PgRow) -> Result<ChatMessage> {
    let sender_role = row.try_get::<String, _>("sender_role")?.parse::<Role>()?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        text: row.try_get("text")?,
        sender_role,
        sender_user_id: row.try_get("sender_user_id")?,
        sender_display_name: row.try_get("sender_display_name")?,
        created_at: Some(row.try_get::<DateTime<Utc>, _>("created_at")?),
        read: row.try_get("read")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(session_id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            id: 0,
            session_id,
            text: text.to_string(),
            sender_role: Role::Patient,
            sender_user_id: 7,
            sender_display_name: "Ana".to_string(),
            created_at: Some(Utc::now()),
            read: false,
        }
    }

    #[tokio::test]
    async fn memory_append_assigns_increasing_ids() {
        let store = MessageStore::in_memory();
        let first = store.append(&draft(42, "hola")).await.expect("append should succeed");
        let second = store.append(&draft(42, "buenas")).await.expect("append should succeed");
        assert!(second > first);

        let history = store.history(42).await.expect("history should succeed");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first);
        assert_eq!(history[0].text, "hola");
        assert_eq!(history[1].text, "buenas");
    }

    #[tokio::test]
    async fn history_of_unknown_session_is_empty() {
        let store = MessageStore::in_memory();
        assert!(store.history(404).await.expect("history should succeed").is_empty());
    }

    #[tokio::test]
    async fn failing_append_degrades_to_none() {
        let store = MessageStore::in_memory();
        store.fail_appends_for_tests(true).await;

        assert!(store.append(&draft(42, "hola")).await.is_err());
        assert_eq!(store.append_best_effort(&draft(42, "hola")).await, None);
        // Nothing was stored for the failed appends.
        assert!(store.history(42).await.expect("history should succeed").is_empty());
    }

    #[tokio::test]
    async fn best_effort_append_returns_store_id_on_success() {
        let store = MessageStore::in_memory();
        let id = store.append_best_effort(&draft(42, "hola")).await;
        assert_eq!(id, Some(1));
    }
}
