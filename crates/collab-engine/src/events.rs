/// Events published on a document topic
use serde::{Deserialize, Serialize};

use crate::{
    ActivityEvent, ActorId, BranchId, Comment, DocumentId, DocumentVersion, EventId, Operation,
    PresenceSession, PresenceStatus, SessionId, VectorClock, VersionId, VersionNumber,
};

/// Independent streams multiplexed on one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Content,
    Version,
    Presence,
    Comment,
    Activity,
}

/// Operations newly applied to a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEvent {
    pub branch_id: BranchId,
    /// Subscribers deduplicate by operation id
    pub operations: Vec<Operation>,
    pub vector_clock: VectorClock,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEvent {
    pub version_id: VersionId,
    pub branch_id: BranchId,
    pub number: VersionNumber,
    pub author_id: ActorId,
    pub is_major: bool,
    pub merged_from_version_id: Option<VersionId>,
}

impl From<&DocumentVersion> for VersionEvent {
    fn from(version: &DocumentVersion) -> Self {
        Self {
            version_id: version.id,
            branch_id: version.branch_id,
            number: version.number,
            author_id: version.author_id,
            is_major: version.is_major,
            merged_from_version_id: version.merged_from_version_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Explicit,
    HeartbeatTimeout,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceChange {
    Joined,
    Updated,
    StatusChanged {
        from: PresenceStatus,
        to: PresenceStatus,
    },
    Left {
        reason: LeaveReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub session: PresenceSession,
    pub change: PresenceChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentChange {
    Added,
    Resolved,
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub change: CommentChange,
    /// Every comment the change touched, root first for thread cascades
    pub comments: Vec<Comment>,
}

/// Closed set of event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum CollabEvent {
    Content(ContentEvent),
    Version(VersionEvent),
    Presence(PresenceEvent),
    Comment(CommentEvent),
    Activity(ActivityEvent),
}

impl CollabEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CollabEvent::Content(_) => EventKind::Content,
            CollabEvent::Version(_) => EventKind::Version,
            CollabEvent::Presence(_) => EventKind::Presence,
            CollabEvent::Comment(_) => EventKind::Comment,
            CollabEvent::Activity(_) => EventKind::Activity,
        }
    }

    /// Whether the session that caused the event also receives it
    pub fn echoes_to_origin(&self) -> bool {
        !matches!(self, CollabEvent::Content(_) | CollabEvent::Presence(_))
    }
}

/// Event as delivered to one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub document_id: DocumentId,
    /// Per-topic publish order
    pub sequence: u64,
    pub origin_session: Option<SessionId>,
    pub emitted_at: chrono::DateTime<chrono::Utc>,
    pub event: CollabEvent,
}

impl EventEnvelope {
    /// Delivery predicate for a subscriber bound to `session`
    pub fn delivers_to(&self, session: Option<SessionId>) -> bool {
        if self.event.echoes_to_origin() {
            return true;
        }
        match (self.origin_session, session) {
            (Some(origin), Some(session)) => origin != session,
            _ => true,
        }
    }
}
