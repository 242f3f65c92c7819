/// Append-only activity log
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{ActorId, DocumentId, EventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Document,
    Content,
    Version,
    Branch,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Major,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactScope {
    /// A span inside one block
    Local,
    /// A whole block or thread
    Block,
    /// The document or one of its branches
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityImpact {
    pub severity: Severity,
    pub scope: ImpactScope,
    pub affected_users: Vec<ActorId>,
    pub changes_count: u64,
}

impl ActivityImpact {
    pub fn minor(changes_count: u64) -> Self {
        Self {
            severity: Severity::Minor,
            scope: ImpactScope::Local,
            affected_users: Vec::new(),
            changes_count,
        }
    }

    pub fn new(severity: Severity, scope: ImpactScope, changes_count: u64) -> Self {
        Self {
            severity,
            scope,
            affected_users: Vec::new(),
            changes_count,
        }
    }

    pub fn affecting(mut self, users: impl IntoIterator<Item = ActorId>) -> Self {
        self.affected_users.extend(users);
        self.affected_users.sort();
        self.affected_users.dedup();
        self
    }
}

/// Record of one mutating operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: EventId,
    pub document_id: DocumentId,
    pub activity_type: ActivityType,
    pub action: String,
    pub actor_id: ActorId,
    pub target_type: String,
    pub target_id: uuid::Uuid,
    pub impact: ActivityImpact,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ActivityEvent {
    pub fn new(
        document_id: DocumentId,
        actor_id: ActorId,
        activity_type: ActivityType,
        action: &str,
        target: (&str, uuid::Uuid),
        impact: ActivityImpact,
    ) -> Self {
        Self {
            id: EventId::new(),
            document_id,
            activity_type,
            action: action.to_string(),
            actor_id,
            target_type: target.0.to_string(),
            target_id: target.1,
            impact,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Per-document activity history, sharded by document
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: DashMap<DocumentId, Vec<ActivityEvent>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: ActivityEvent) {
        self.entries
            .entry(event.document_id)
            .or_default()
            .push(event);
    }

    /// Most recent `limit` events, oldest first
    pub fn recent(&self, document: DocumentId, limit: usize) -> Vec<ActivityEvent> {
        self.entries
            .get(&document)
            .map(|events| {
                let start = events.len().saturating_sub(limit);
                events[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, document: DocumentId) -> usize {
        self.entries.get(&document).map(|e| e.len()).unwrap_or(0)
    }
}
