/// Real-time collaborative document engine
/// Causally ordered merge engine, version history, presence, comments and
/// per-document event delivery behind narrow access and persistence ports.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clock;
pub use clock::*;

mod operations;
pub use operations::*;

mod crdt;
pub use crdt::*;

mod conflict;
pub use conflict::*;

mod merge;
pub use merge::*;

mod document;
pub use document::*;

mod version;
pub use version::*;

mod presence;
pub use presence::*;

mod comments;
pub use comments::*;

mod events;
pub use events::*;

mod broadcast;
pub use broadcast::*;

mod activity;
pub use activity::*;

mod access;
pub use access::*;

mod persistence;
pub use persistence::*;

mod records;
pub use records::*;

mod rate_limit;
pub use rate_limit::*;

mod config;
pub use config::*;

mod service;
pub use service::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: uuid::Uuid },

    #[error("permission denied: actor {actor} lacks {capability:?} on document {document}")]
    PermissionDenied {
        actor: ActorId,
        document: DocumentId,
        capability: Capability,
    },

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("stale position: {0}")]
    StalePosition(String),

    #[error("document {0} kept advancing while merging, retry exceeded")]
    ConflictRetryExceeded(DocumentId),

    #[error("rate limited: actor {actor} may retry in {retry_after_ms}ms")]
    RateLimited { actor: ActorId, retry_after_ms: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CollabError {
    pub fn not_found(entity: &'static str, id: impl Into<uuid::Uuid>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Short machine-readable code, used by transports
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::StaleState(_) => "stale_state",
            Self::StalePosition(_) => "stale_position",
            Self::ConflictRetryExceeded(_) => "conflict_retry_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<bincode::Error> for CollabError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<$name> for uuid::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type!(
    /// Collaborative document
    DocumentId
);
id_type!(
    /// Editing user; also the actor component of every clock entry
    ActorId
);
id_type!(
    /// One live connection's presence session
    SessionId
);
id_type!(VersionId);
id_type!(BranchId);
id_type!(CommentId);
id_type!(ThreadId);
id_type!(
    /// Client-assigned operation identity, used for idempotent re-delivery
    OperationId
);
id_type!(
    /// Client-assigned block identity
    BlockId
);
id_type!(EventId);
id_type!(OrganizationId);
id_type!(SubscriptionId);
id_type!(MergeId);
id_type!(ConflictId);
