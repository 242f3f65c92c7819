/// Document edit operations
/// These operations represent changes that are replicated across clients
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{ActorId, BlockId, ClockEntry, CollabError, DocumentId, OperationId, Result, VectorClock};

/// Identity of a text character or block slot in the sequence CRDT.
///
/// Ordering is by causal rank first, so an element created later in causal
/// history always sorts above the elements it was anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionId {
    pub rank: u64,
    pub seq: u64,
    pub actor: ActorId,
    /// Character offset within the inserting operation's text
    pub offset: u32,
}

impl PositionId {
    pub fn entry(&self) -> ClockEntry {
        ClockEntry::new(self.actor, self.seq)
    }
}

/// Structural kind of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading,
    ListItem,
    Quote,
    Code,
}

/// Document operation that can be replicated across clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID (client assigned)
    pub id: OperationId,

    pub document_id: DocumentId,

    /// Actor who created this operation
    pub actor_id: ActorId,

    /// Per-actor sequence number, starting at 1
    pub seq: u64,

    /// Causal dependencies: everything the actor had observed when emitting
    pub deps: VectorClock,

    /// The actual operation
    pub kind: OperationKind,

    /// Timestamp when operation was created (client time)
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Operation {
    pub fn new(
        document_id: DocumentId,
        actor_id: ActorId,
        seq: u64,
        deps: VectorClock,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: OperationId::new(),
            document_id,
            actor_id,
            seq,
            deps,
            kind,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn entry(&self) -> ClockEntry {
        ClockEntry::new(self.actor_id, self.seq)
    }

    pub fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    /// Structural checks that do not depend on document state
    pub fn validate(&self) -> Result<()> {
        if self.seq == 0 {
            return Err(CollabError::Validation(format!(
                "operation {} has sequence 0",
                self.id
            )));
        }
        if self.deps.get(self.actor_id) >= self.seq {
            return Err(CollabError::Validation(format!(
                "operation {} depends on its own future",
                self.id
            )));
        }
        self.kind.validate()
    }
}

/// Coarse operation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Delete,
    Format,
    Move,
}

/// Types of operations that can be performed on a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InsertBlock {
        block: BlockId,
        /// Place after this block, or at the start when `None`
        after: Option<BlockId>,
        kind: BlockKind,
    },
    InsertText {
        block: BlockId,
        /// Place after this character, or at the start of the block when `None`
        after: Option<PositionId>,
        text: String,
    },
    DeleteText {
        block: BlockId,
        elements: Vec<PositionId>,
    },
    DeleteBlock {
        block: BlockId,
    },
    Format {
        block: BlockId,
        elements: Vec<PositionId>,
        attribute: String,
        /// `None` clears the attribute
        value: Option<String>,
    },
    MoveBlock {
        block: BlockId,
        after: Option<BlockId>,
    },
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationKind::InsertBlock { .. } | OperationKind::InsertText { .. } => {
                OperationType::Insert
            }
            OperationKind::DeleteText { .. } | OperationKind::DeleteBlock { .. } => {
                OperationType::Delete
            }
            OperationKind::Format { .. } => OperationType::Format,
            OperationKind::MoveBlock { .. } => OperationType::Move,
        }
    }

    /// Block this operation targets
    pub fn block(&self) -> BlockId {
        match self {
            OperationKind::InsertBlock { block, .. }
            | OperationKind::InsertText { block, .. }
            | OperationKind::DeleteText { block, .. }
            | OperationKind::DeleteBlock { block }
            | OperationKind::Format { block, .. }
            | OperationKind::MoveBlock { block, .. } => *block,
        }
    }

    /// Existing text elements this operation acts on
    pub fn targets(&self) -> BTreeSet<PositionId> {
        match self {
            OperationKind::DeleteText { elements, .. } | OperationKind::Format { elements, .. } => {
                elements.iter().copied().collect()
            }
            _ => BTreeSet::new(),
        }
    }

    /// Number of visible units this operation changes
    pub fn change_count(&self) -> usize {
        match self {
            OperationKind::InsertText { text, .. } => text.chars().count(),
            OperationKind::DeleteText { elements, .. } | OperationKind::Format { elements, .. } => {
                elements.len()
            }
            _ => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            OperationKind::InsertText { text, .. } if text.is_empty() => Err(
                CollabError::Validation("insert_text requires non-empty text".to_string()),
            ),
            OperationKind::DeleteText { elements, .. } if elements.is_empty() => Err(
                CollabError::Validation("delete_text requires at least one element".to_string()),
            ),
            OperationKind::Format {
                elements,
                attribute,
                ..
            } => {
                if elements.is_empty() {
                    return Err(CollabError::Validation(
                        "format requires at least one element".to_string(),
                    ));
                }
                if attribute.trim().is_empty() {
                    return Err(CollabError::Validation(
                        "format requires an attribute name".to_string(),
                    ));
                }
                Ok(())
            }
            OperationKind::MoveBlock { block, after } if Some(*block) == *after => Err(
                CollabError::Validation(format!("block {block} cannot be moved after itself")),
            ),
            OperationKind::InsertBlock { block, after, .. } if Some(*block) == *after => Err(
                CollabError::Validation(format!("block {block} cannot be inserted after itself")),
            ),
            _ => Ok(()),
        }
    }
}

/// Builds a causally consistent stream of operations for one actor.
///
/// Tracks the actor's own sequence and the clock it has observed, the way an
/// editor client would before submitting.
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    document_id: DocumentId,
    actor_id: ActorId,
    observed: VectorClock,
}

impl OperationBuilder {
    pub fn new(document_id: DocumentId, actor_id: ActorId) -> Self {
        Self {
            document_id,
            actor_id,
            observed: VectorClock::new(),
        }
    }

    /// Start from a clock already observed (e.g. from a snapshot)
    pub fn with_clock(mut self, clock: &VectorClock) -> Self {
        self.observed.merge(clock);
        self
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn clock(&self) -> &VectorClock {
        &self.observed
    }

    /// Observe operations received from elsewhere
    pub fn observe(&mut self, clock: &VectorClock) {
        self.observed.merge(clock);
    }

    pub fn build(&mut self, kind: OperationKind) -> Operation {
        let deps = self.observed.clone();
        let seq = self.observed.increment(self.actor_id);
        Operation::new(self.document_id, self.actor_id, seq, deps, kind)
    }
}
