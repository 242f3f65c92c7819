/// Authorization port
///
/// The engine never decides who may do what; it asks an [`AccessGate`] at
/// every mutating call, at subscribe time, and again on every event delivery.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ActorId, CollabError, DocumentId, Result};

/// Capabilities in increasing order of privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Comment,
    Edit,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDecision {
    Allow,
    Deny,
}

/// Synchronous authorization check supplied by the host
pub trait AccessGate: Send + Sync {
    fn check_access(
        &self,
        actor: ActorId,
        document: DocumentId,
        capability: Capability,
    ) -> AccessDecision;
}

/// Check and map a denial to [`CollabError::PermissionDenied`]
pub fn require(
    gate: &dyn AccessGate,
    actor: ActorId,
    document: DocumentId,
    capability: Capability,
) -> Result<()> {
    match gate.check_access(actor, document, capability) {
        AccessDecision::Allow => Ok(()),
        AccessDecision::Deny => Err(CollabError::PermissionDenied {
            actor,
            document,
            capability,
        }),
    }
}

/// Gate that allows everything, for hosts that authorize upstream
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

impl AccessGate for AllowAllGate {
    fn check_access(&self, _: ActorId, _: DocumentId, _: Capability) -> AccessDecision {
        AccessDecision::Allow
    }
}

/// In-memory grant table. A grant implies every lower capability.
#[derive(Debug, Default)]
pub struct StaticAccessGate {
    grants: RwLock<HashMap<(ActorId, DocumentId), Capability>>,
}

impl StaticAccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, actor: ActorId, document: DocumentId, capability: Capability) {
        self.grants.write().insert((actor, document), capability);
    }

    pub fn revoke(&self, actor: ActorId, document: DocumentId) {
        self.grants.write().remove(&(actor, document));
    }

    pub fn capability(&self, actor: ActorId, document: DocumentId) -> Option<Capability> {
        self.grants.read().get(&(actor, document)).copied()
    }
}

impl AccessGate for StaticAccessGate {
    fn check_access(
        &self,
        actor: ActorId,
        document: DocumentId,
        capability: Capability,
    ) -> AccessDecision {
        match self.capability(actor, document) {
            Some(granted) if granted >= capability => AccessDecision::Allow,
            _ => AccessDecision::Deny,
        }
    }
}
