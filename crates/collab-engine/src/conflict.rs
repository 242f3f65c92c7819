/// Conflict detection and resolution for concurrent operations
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{BlockId, ConflictId, LoggedOperation, Operation, OperationId, OperationKind, Stamp};

/// Namespace for deterministic conflict ids
const CONFLICT_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6c0f_5a6e_8f21_4c1e_9b7d_3e2a_1f40_c9d7);

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both operations delete the same text or block
    DuplicateDelete,

    /// One operation formats text the other deletes
    DeleteFormat,

    /// Both operations set the same attribute to different values
    ConcurrentFormat,

    /// Text inserted right after a character the other operation deletes
    InsertIntoDeleted,

    /// The same block moved to different places
    ConcurrentMove,

    /// A block edited while the other operation deletes it
    BlockDeleted,
}

/// How a merge treats conflicts nobody resolved explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Deterministic tie-break, losers recorded for information
    #[default]
    AutoMerge,

    /// Unresolved conflicts reject the whole batch
    Manual,

    /// Keep what the target already has
    Ours,

    /// Keep what the incoming side brings
    Theirs,
}

impl MergeStrategy {
    pub fn default_choice(&self, conflict: &ConflictInfo) -> Option<ResolutionChoice> {
        match self {
            MergeStrategy::AutoMerge => Some(conflict.suggested_resolution),
            MergeStrategy::Manual => None,
            MergeStrategy::Ours => Some(ResolutionChoice::KeepExisting),
            MergeStrategy::Theirs => Some(ResolutionChoice::KeepIncoming),
        }
    }
}

/// Outcome chosen for one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// The already-applied operation wins where the two overlap
    KeepExisting,

    /// The incoming operation wins where the two overlap
    KeepIncoming,

    /// Both take effect as the CRDT merges them
    KeepBoth,
}

/// Caller-supplied resolution for a previously reported conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: ConflictId,
    pub choice: ResolutionChoice,
}

pub type ResolutionMap = HashMap<ConflictId, ResolutionChoice>;

pub fn resolution_map(resolutions: &[ConflictResolution]) -> ResolutionMap {
    resolutions
        .iter()
        .map(|resolution| (resolution.conflict_id, resolution.choice))
        .collect()
}

/// A conflict between an applied operation and an incoming one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_id: ConflictId,
    /// Operation already applied on the branch
    pub operation_a: OperationId,
    /// Incoming operation
    pub operation_b: OperationId,
    pub block_id: BlockId,
    pub kind: ConflictKind,
    pub suggested_resolution: ResolutionChoice,
    pub resolved: bool,
    pub resolution: Option<ResolutionChoice>,
    pub winner: Option<OperationId>,
}

impl ConflictInfo {
    pub fn resolve(&mut self, choice: ResolutionChoice) {
        self.resolved = true;
        self.resolution = Some(choice);
        self.winner = match choice {
            ResolutionChoice::KeepExisting => Some(self.operation_a),
            ResolutionChoice::KeepIncoming => Some(self.operation_b),
            ResolutionChoice::KeepBoth => None,
        };
    }
}

/// Stable id for the conflict between two operations, independent of order
pub fn conflict_id(a: OperationId, b: OperationId) -> ConflictId {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(low.0.as_bytes());
    name[16..].copy_from_slice(high.0.as_bytes());
    ConflictId(uuid::Uuid::new_v5(&CONFLICT_NAMESPACE, &name))
}

fn overlaps(left: &[crate::PositionId], right: &[crate::PositionId]) -> bool {
    let left: BTreeSet<_> = left.iter().collect();
    right.iter().any(|id| left.contains(id))
}

fn is_block_edit(kind: &OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::InsertText { .. }
            | OperationKind::DeleteText { .. }
            | OperationKind::Format { .. }
            | OperationKind::MoveBlock { .. }
    )
}

fn classify(existing: &OperationKind, incoming: &OperationKind) -> Option<ConflictKind> {
    use OperationKind::*;

    if existing.block() != incoming.block() {
        return None;
    }

    match (existing, incoming) {
        (DeleteText { elements: e1, .. }, DeleteText { elements: e2, .. }) if overlaps(e1, e2) => {
            Some(ConflictKind::DuplicateDelete)
        }

        (DeleteText { elements: e1, .. }, Format { elements: e2, .. })
        | (Format { elements: e1, .. }, DeleteText { elements: e2, .. })
            if overlaps(e1, e2) =>
        {
            Some(ConflictKind::DeleteFormat)
        }

        (
            Format {
                elements: e1,
                attribute: a1,
                value: v1,
                ..
            },
            Format {
                elements: e2,
                attribute: a2,
                value: v2,
                ..
            },
        ) if a1 == a2 && v1 != v2 && overlaps(e1, e2) => Some(ConflictKind::ConcurrentFormat),

        (
            DeleteText { elements, .. },
            InsertText {
                after: Some(anchor),
                ..
            },
        )
        | (
            InsertText {
                after: Some(anchor),
                ..
            },
            DeleteText { elements, .. },
        ) if elements.contains(anchor) => Some(ConflictKind::InsertIntoDeleted),

        (MoveBlock { after: a1, .. }, MoveBlock { after: a2, .. }) if a1 != a2 => {
            Some(ConflictKind::ConcurrentMove)
        }

        (DeleteBlock { .. }, DeleteBlock { .. }) => Some(ConflictKind::DuplicateDelete),

        (DeleteBlock { .. }, other) | (other, DeleteBlock { .. }) if is_block_edit(other) => {
            Some(ConflictKind::BlockDeleted)
        }

        _ => None,
    }
}

/// Detect whether an incoming operation conflicts with a concurrent applied one
pub fn detect_conflict(
    existing: &LoggedOperation,
    incoming: &Operation,
    incoming_stamp: Stamp,
) -> Option<ConflictInfo> {
    let kind = classify(&existing.operation.kind, &incoming.kind)?;

    let suggested_resolution = match kind {
        ConflictKind::DuplicateDelete | ConflictKind::InsertIntoDeleted => {
            ResolutionChoice::KeepBoth
        }
        _ if incoming_stamp > existing.stamp => ResolutionChoice::KeepIncoming,
        _ => ResolutionChoice::KeepExisting,
    };

    Some(ConflictInfo {
        conflict_id: conflict_id(existing.id(), incoming.id),
        operation_a: existing.id(),
        operation_b: incoming.id,
        block_id: incoming.kind.block(),
        kind,
        suggested_resolution,
        resolved: false,
        resolution: None,
        winner: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ActorId, BlockKind, DocumentId, DocumentState, Disposition, OperationBuilder, VectorClock,
    };

    struct Fixture {
        state: DocumentState,
        block: BlockId,
        left: OperationBuilder,
        right: OperationBuilder,
    }

    fn fixture() -> Fixture {
        let doc = DocumentId::new();
        let mut setup = OperationBuilder::new(doc, ActorId::new());
        let block = BlockId::new();
        let mut state = DocumentState::new();
        for kind in [
            OperationKind::InsertBlock {
                block,
                after: None,
                kind: BlockKind::Paragraph,
            },
            OperationKind::InsertText {
                block,
                after: None,
                text: "abcdef".to_string(),
            },
        ] {
            state
                .integrate(setup.build(kind), Disposition::Applied)
                .unwrap();
        }
        let clock: VectorClock = state.clock().clone();
        Fixture {
            state,
            block,
            left: OperationBuilder::new(doc, ActorId::new()).with_clock(&clock),
            right: OperationBuilder::new(doc, ActorId::new()).with_clock(&clock),
        }
    }

    #[test]
    fn test_conflict_id_is_order_independent() {
        let a = OperationId::new();
        let b = OperationId::new();
        assert_eq!(conflict_id(a, b), conflict_id(b, a));
        assert_ne!(conflict_id(a, b), conflict_id(a, OperationId::new()));
    }

    #[test]
    fn test_delete_format_overlap_detected() {
        let mut f = fixture();
        let range = f.state.position_range(f.block, 0, 3).unwrap();
        let delete = f.left.build(OperationKind::DeleteText {
            block: f.block,
            elements: range.clone(),
        });
        let format = f.right.build(OperationKind::Format {
            block: f.block,
            elements: range,
            attribute: "italic".to_string(),
            value: Some("true".to_string()),
        });

        let applied = f.state.integrate(delete, Disposition::Applied).unwrap().clone();
        let (stamp, _) = f.state.prepare(&format).unwrap();
        let conflict = detect_conflict(&applied, &format, stamp).unwrap();
        assert_eq!(conflict.kind, ConflictKind::DeleteFormat);
        assert_eq!(conflict.operation_a, applied.id());
        assert!(!conflict.resolved);
    }

    #[test]
    fn test_disjoint_ranges_do_not_conflict() {
        let mut f = fixture();
        let head = f.state.position_range(f.block, 0, 2).unwrap();
        let tail = f.state.position_range(f.block, 4, 6).unwrap();
        let delete = f.left.build(OperationKind::DeleteText {
            block: f.block,
            elements: head,
        });
        let format = f.right.build(OperationKind::Format {
            block: f.block,
            elements: tail,
            attribute: "bold".to_string(),
            value: Some("true".to_string()),
        });

        let applied = f.state.integrate(delete, Disposition::Applied).unwrap().clone();
        let (stamp, _) = f.state.prepare(&format).unwrap();
        assert!(detect_conflict(&applied, &format, stamp).is_none());
    }

    #[test]
    fn test_strategy_defaults() {
        let mut info = ConflictInfo {
            conflict_id: ConflictId::new(),
            operation_a: OperationId::new(),
            operation_b: OperationId::new(),
            block_id: BlockId::new(),
            kind: ConflictKind::ConcurrentFormat,
            suggested_resolution: ResolutionChoice::KeepIncoming,
            resolved: false,
            resolution: None,
            winner: None,
        };
        assert_eq!(MergeStrategy::Manual.default_choice(&info), None);
        assert_eq!(
            MergeStrategy::Ours.default_choice(&info),
            Some(ResolutionChoice::KeepExisting)
        );

        info.resolve(ResolutionChoice::KeepExisting);
        assert!(info.resolved);
        assert_eq!(info.winner, Some(info.operation_a));
    }
}
