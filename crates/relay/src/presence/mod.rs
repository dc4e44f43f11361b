// Presence tracking for live consultation connections.
//
// The connection registry (user -> connection) and the session roster
// (session -> member user ids) share a single RwLock, so register,
// unregister, join, leave and a broadcast's membership snapshot are
// atomic with respect to each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use consulta_common::protocol::chat::ChatFrame;
use consulta_common::types::Role;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One live, identified connection.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Which transport owns this registry entry. Unregister checks it so
    /// a stale socket closing cannot evict a newer registration.
    pub conn_id: Uuid,
    pub role: Role,
    pub display_name: String,
    /// The consultation this user currently belongs to, if any.
    pub session_id: Option<i64>,
    /// Outbound handle; only the broadcaster pushes frames through it.
    pub outbound: mpsc::UnboundedSender<ChatFrame>,
}

/// `user_id -> ConnectedClient` for all identified connections.
#[derive(Debug, Default)]
struct ConnectionRegistry {
    clients: HashMap<i64, ConnectedClient>,
}

/// `session_id -> member user ids`.
///
/// An entry exists only while its member set is non-empty; an empty
/// session is indistinguishable from a nonexistent one.
#[derive(Debug, Default)]
struct SessionRoster {
    members: HashMap<i64, HashSet<i64>>,
}

impl SessionRoster {
    fn join(&mut self, session_id: i64, user_id: i64) {
        self.members.entry(session_id).or_default().insert(user_id);
    }

    fn leave(&mut self, session_id: i64, user_id: i64) {
        if let Some(members) = self.members.get_mut(&session_id) {
            members.remove(&user_id);
            if members.is_empty() {
                self.members.remove(&session_id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct PresenceInner {
    registry: ConnectionRegistry,
    roster: SessionRoster,
}

/// Shared presence state, owned by the composition root and handed to
/// the websocket router.
#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    inner: Arc<RwLock<PresenceInner>>,
}

impl PresenceState {
    /// Insert or replace the registry entry for `user_id`.
    ///
    /// Policy: last registration wins. A duplicate identify (second tab,
    /// reconnect racing the old socket's close) overwrites the mapping;
    /// the superseded transport stays open but no longer receives
    /// broadcasts. Any session membership the user already holds is
    /// carried over to the new connection.
    pub async fn register(
        &self,
        user_id: i64,
        role: Role,
        display_name: String,
        conn_id: Uuid,
        outbound: mpsc::UnboundedSender<ChatFrame>,
    ) {
        let mut guard = self.inner.write().await;
        let session_id = guard
            .registry
            .clients
            .get(&user_id)
            .and_then(|existing| existing.session_id);
        guard.registry.clients.insert(
            user_id,
            ConnectedClient { conn_id, role, display_name, session_id, outbound },
        );
    }

    /// Remove the registry entry owned by `conn_id` and cascade a leave
    /// from whichever session the user belonged to.
    ///
    /// A mismatched `conn_id` means the user re-registered on another
    /// transport in the meantime; the entry is left alone.
    pub async fn unregister(&self, user_id: i64, conn_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        let owns_entry =
            guard.registry.clients.get(&user_id).is_some_and(|client| client.conn_id == conn_id);
        if !owns_entry {
            return false;
        }

        if let Some(removed) = guard.registry.clients.remove(&user_id) {
            if let Some(session_id) = removed.session_id {
                guard.roster.leave(session_id, user_id);
            }
        }
        true
    }

    /// Add `user_id` to `session_id`, leaving any previous session first
    /// so a user belongs to at most one session at a time.
    ///
    /// Returns false when the user has no registry entry (never
    /// identified, or already unregistered).
    pub async fn join(&self, user_id: i64, session_id: i64) -> bool {
        let mut guard = self.inner.write().await;
        let previous = match guard.registry.clients.get_mut(&user_id) {
            Some(client) => client.session_id.replace(session_id),
            None => return false,
        };

        if let Some(previous_session) = previous {
            if previous_session != session_id {
                guard.roster.leave(previous_session, user_id);
            }
        }
        guard.roster.join(session_id, user_id);
        true
    }

    /// Remove `user_id` from `session_id`.
    ///
    /// Returns false (no-op) when the user is not currently a member of
    /// that session.
    pub async fn leave(&self, user_id: i64, session_id: i64) -> bool {
        let mut guard = self.inner.write().await;
        match guard.registry.clients.get_mut(&user_id) {
            Some(client) if client.session_id == Some(session_id) => {
                client.session_id = None;
            }
            _ => return false,
        }
        guard.roster.leave(session_id, user_id);
        true
    }

    /// Point-in-time snapshot of a session's member user ids (empty when
    /// the session does not exist).
    pub async fn members_of(&self, session_id: i64) -> Vec<i64> {
        let guard = self.inner.read().await;
        let mut members = guard
            .roster
            .members
            .get(&session_id)
            .map(|members| members.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub async fn session_of(&self, user_id: i64) -> Option<i64> {
        self.inner.read().await.registry.clients.get(&user_id).and_then(|c| c.session_id)
    }

    /// Registered role and display name, used to stamp outgoing
    /// messages with the server-side identity.
    pub async fn profile_of(&self, user_id: i64) -> Option<(Role, String)> {
        self.inner
            .read()
            .await
            .registry
            .clients
            .get(&user_id)
            .map(|client| (client.role, client.display_name.clone()))
    }

    /// Deliver `frame` to every connection registered for a member of
    /// `session_id`, as of one membership snapshot.
    ///
    /// Members without a registry entry and entries whose receiver is
    /// gone are skipped silently; this is a fire-and-forget relay, not a
    /// durable queue. Returns the number of recipients reached.
    pub async fn broadcast(&self, session_id: i64, frame: &ChatFrame) -> usize {
        let mut recipients = Vec::new();
        {
            let guard = self.inner.read().await;
            let Some(members) = guard.roster.members.get(&session_id) else {
                return 0;
            };
            for user_id in members {
                if let Some(client) = guard.registry.clients.get(user_id) {
                    recipients.push(client.outbound.clone());
                }
            }
        }

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(frame.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }

    /// Currently identified connections, for the metrics gauge.
    pub async fn connected_clients(&self) -> usize {
        self.inner.read().await.registry.clients.len()
    }

    /// Sessions with at least one member, for the metrics gauge.
    pub async fn occupied_sessions(&self) -> usize {
        self.inner.read().await.roster.members.len()
    }
}
