//! JSON frames exchanged with clients

use collab_engine::{
    ActorId, BranchId, CommentAnchor, CommentId, ConflictResolution, Document, DocumentId,
    DocumentSnapshot, EventEnvelope, MergeOutcome, MergeResult, MergeStrategy, Operation,
    PresenceSession, PresenceUpdate, VectorClock, VersionEvent,
};
use serde::{Deserialize, Serialize};

/// Messages sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a document owned by `actor_id`; does not join it
    CreateDocument { actor_id: ActorId, name: String },

    /// Bind this connection to a document, optionally on a non-default branch
    Join {
        document_id: DocumentId,
        actor_id: ActorId,
        #[serde(default)]
        branch_id: Option<BranchId>,
        #[serde(default)]
        client: Option<String>,
    },

    Submit {
        operations: Vec<Operation>,
        base_clock: VectorClock,
        #[serde(default)]
        strategy: MergeStrategy,
        #[serde(default)]
        resolutions: Vec<ConflictResolution>,
    },

    Presence { update: PresenceUpdate },

    Heartbeat,

    Comment {
        #[serde(default)]
        anchor: Option<CommentAnchor>,
        body: String,
        #[serde(default)]
        parent_comment_id: Option<CommentId>,
    },

    ResolveComment {
        comment_id: CommentId,
        #[serde(default)]
        resolution: Option<String>,
        #[serde(default)]
        resolve_thread: bool,
    },

    ReopenComment { comment_id: CommentId },

    CreateVersion {
        #[serde(default)]
        is_major: bool,
    },

    CreateBranch { name: String },

    Merge {
        source_branch: BranchId,
        target_branch: BranchId,
        #[serde(default)]
        strategy: MergeStrategy,
        #[serde(default)]
        resolutions: Vec<ConflictResolution>,
    },

    Snapshot {
        #[serde(default)]
        branch_id: Option<BranchId>,
    },

    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    DocumentCreated {
        document: Document,
    },

    Joined {
        session: PresenceSession,
        snapshot: DocumentSnapshot,
    },

    Outcome {
        outcome: MergeOutcome,
    },

    Version {
        version: VersionEvent,
    },

    BranchCreated {
        branch_id: BranchId,
        name: String,
    },

    MergeResult {
        result: MergeResult,
    },

    Snapshot {
        snapshot: DocumentSnapshot,
    },

    /// Event from the document topic
    Event {
        envelope: EventEnvelope,
    },

    Error {
        code: String,
        message: String,
    },

    Pong,
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
