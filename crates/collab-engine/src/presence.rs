/// Live presence tracking for collaborative editing
/// Shows who is in a document, where their cursor is and what they look at
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    ActorId, BlockId, CollabError, CollabEvent, DocumentId, EventBroadcaster, LeaveReason,
    PresenceChange, PresenceConfig, PresenceEvent, Result, SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Joining,
    Active,
    Away,
    Closed,
}

/// Color assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: ActorId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }
}

/// Caret position inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub block_id: BlockId,
    pub offset: u32,
}

/// Selection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Cursor,
    pub head: Cursor,
}

/// Viewport state (what the user is looking at)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub first_visible_block: Option<BlockId>,
    pub scroll_offset: f32,
    pub height: f32,
    pub zoom: f32,
}

/// Device and connection metadata reported at join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub client: Option<String>,
    pub device: Option<String>,
    pub remote_addr: Option<String>,
}

/// One connection's presence in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSession {
    pub id: SessionId,
    pub user_id: ActorId,
    pub document_id: DocumentId,
    pub status: PresenceStatus,
    pub color: UserColor,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub viewport: Option<Viewport>,
    pub connection: ConnectionInfo,
    pub joined_at: DateTime<Utc>,
    /// Last cursor, selection or viewport change
    pub last_seen_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Partial presence write; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub viewport: Option<Viewport>,
}

impl PresenceUpdate {
    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.selection.is_none() && self.viewport.is_none()
    }
}

/// Sessions changed by one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub went_away: Vec<SessionId>,
    pub pruned: Vec<(SessionId, LeaveReason)>,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Presence registry, sharded by session and by document
pub struct PresenceTracker {
    config: PresenceConfig,
    sessions: DashMap<SessionId, PresenceSession>,
    by_document: DashMap<DocumentId, HashSet<SessionId>>,
    broadcaster: Arc<EventBroadcaster>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            by_document: DashMap::new(),
            broadcaster,
        }
    }

    fn publish(&self, session: &PresenceSession, change: PresenceChange) {
        self.broadcaster.publish(
            session.document_id,
            Some(session.id),
            CollabEvent::Presence(PresenceEvent {
                session: session.clone(),
                change,
            }),
        );
    }

    pub fn join(
        &self,
        user_id: ActorId,
        document_id: DocumentId,
        connection: ConnectionInfo,
    ) -> PresenceSession {
        self.join_at(user_id, document_id, connection, Utc::now())
    }

    pub fn join_at(
        &self,
        user_id: ActorId,
        document_id: DocumentId,
        connection: ConnectionInfo,
        now: DateTime<Utc>,
    ) -> PresenceSession {
        let session = PresenceSession {
            id: SessionId::new(),
            user_id,
            document_id,
            status: PresenceStatus::Joining,
            color: UserColor::from_user_id(user_id),
            cursor: None,
            selection: None,
            viewport: None,
            connection,
            joined_at: now,
            last_seen_at: now,
            last_heartbeat_at: now,
        };
        self.sessions.insert(session.id, session.clone());
        self.by_document
            .entry(document_id)
            .or_default()
            .insert(session.id);
        info!(
            "User {} joined document {} (session {})",
            user_id, document_id, session.id
        );
        self.publish(&session, PresenceChange::Joined);
        session
    }

    pub fn update(&self, session_id: SessionId, update: PresenceUpdate) -> Result<PresenceSession> {
        self.update_at(session_id, update, Utc::now())
    }

    /// Apply a presence write. The first one activates a joining session.
    pub fn update_at(
        &self,
        session_id: SessionId,
        update: PresenceUpdate,
        now: DateTime<Utc>,
    ) -> Result<PresenceSession> {
        if update.is_empty() {
            return Err(CollabError::Validation(
                "presence update carries no cursor, selection or viewport".to_string(),
            ));
        }
        let (session, previous) = {
            let mut entry = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| CollabError::not_found("presence session", session_id))?;
            let previous = entry.status;
            if let Some(cursor) = update.cursor {
                entry.cursor = Some(cursor);
            }
            if let Some(selection) = update.selection {
                entry.selection = Some(selection);
            }
            if let Some(viewport) = update.viewport {
                entry.viewport = Some(viewport);
            }
            entry.status = PresenceStatus::Active;
            entry.last_seen_at = now;
            entry.last_heartbeat_at = now;
            (entry.clone(), previous)
        };

        if previous != PresenceStatus::Active {
            self.publish(
                &session,
                PresenceChange::StatusChanged {
                    from: previous,
                    to: PresenceStatus::Active,
                },
            );
        }
        self.publish(&session, PresenceChange::Updated);
        Ok(session)
    }

    pub fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        self.heartbeat_at(session_id, Utc::now())
    }

    pub fn heartbeat_at(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::not_found("presence session", session_id))?;
        entry.last_heartbeat_at = now;
        Ok(())
    }

    pub fn leave(&self, session_id: SessionId) -> Result<PresenceSession> {
        self.close(session_id, LeaveReason::Explicit)
            .ok_or_else(|| CollabError::not_found("presence session", session_id))
    }

    fn close(&self, session_id: SessionId, reason: LeaveReason) -> Option<PresenceSession> {
        let (_, mut session) = self.sessions.remove(&session_id)?;
        if let Some(mut ids) = self.by_document.get_mut(&session.document_id) {
            ids.remove(&session_id);
        }
        self.by_document
            .remove_if(&session.document_id, |_, ids| ids.is_empty());
        session.status = PresenceStatus::Closed;
        info!(
            "Session {} of user {} left document {} ({:?})",
            session_id, session.user_id, session.document_id, reason
        );
        self.publish(&session, PresenceChange::Left { reason });
        Some(session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<PresenceSession> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Live sessions of a document
    pub fn sessions(&self, document_id: DocumentId) -> Vec<PresenceSession> {
        let ids: Vec<SessionId> = self
            .by_document
            .get(&document_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut sessions: Vec<_> = ids.into_iter().filter_map(|id| self.get(id)).collect();
        sessions.sort_by_key(|s| s.joined_at);
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the user still holds a session in any document
    pub fn has_sessions(&self, user_id: ActorId) -> bool {
        self.sessions.iter().any(|s| s.user_id == user_id)
    }

    /// Move idle sessions to Away and prune timed-out ones
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let idle_threshold = chrono_duration(self.config.idle_threshold);
        let heartbeat_timeout = chrono_duration(self.config.heartbeat_timeout);
        let prune_after = idle_threshold + chrono_duration(self.config.away_grace);

        let snapshot: Vec<PresenceSession> = self.sessions.iter().map(|s| s.clone()).collect();
        let mut report = SweepReport::default();

        for session in snapshot {
            let idle = now - session.last_seen_at;
            if now - session.last_heartbeat_at > heartbeat_timeout {
                if self.close(session.id, LeaveReason::HeartbeatTimeout).is_some() {
                    report.pruned.push((session.id, LeaveReason::HeartbeatTimeout));
                }
                continue;
            }
            match session.status {
                PresenceStatus::Joining | PresenceStatus::Active if idle > idle_threshold => {
                    let updated = self.sessions.get_mut(&session.id).map(|mut entry| {
                        entry.status = PresenceStatus::Away;
                        entry.clone()
                    });
                    if let Some(updated) = updated {
                        self.publish(
                            &updated,
                            PresenceChange::StatusChanged {
                                from: session.status,
                                to: PresenceStatus::Away,
                            },
                        );
                        report.went_away.push(session.id);
                    }
                }
                PresenceStatus::Away if idle > prune_after => {
                    if self.close(session.id, LeaveReason::Idle).is_some() {
                        report.pruned.push((session.id, LeaveReason::Idle));
                    }
                }
                _ => {}
            }
        }

        if !report.went_away.is_empty() || !report.pruned.is_empty() {
            debug!(
                "Presence sweep: {} away, {} pruned",
                report.went_away.len(),
                report.pruned.len()
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) periodically until `cancel` fires,
    /// handing each report to `on_sweep`
    pub fn spawn_sweeper<F>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_sweep: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(SweepReport) + Send + 'static,
    {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Presence sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        on_sweep(tracker.sweep(Utc::now()));
                    }
                }
            }
        })
    }
}
