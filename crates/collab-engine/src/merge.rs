/// Operation merge engine
///
/// Applies batches of operations to a branch replica in causal order,
/// buffering anything whose dependencies have not arrived yet and
/// classifying overlaps with concurrent operations as conflicts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::{
    detect_conflict, ActorId, BranchId, CollabError, ConflictInfo, DocumentContent, DocumentId,
    DocumentState, Disposition, EngineConfig, MergeStrategy, Operation, OperationId,
    ResolutionChoice, ResolutionMap, Result, VectorClock,
};

#[derive(Debug, Clone)]
struct PendingOperation {
    operation: Operation,
    buffered_at: DateTime<Utc>,
}

/// Live state of one branch plus operations waiting on their dependencies
#[derive(Debug, Clone, Default)]
pub struct BranchReplica {
    state: DocumentState,
    pending: Vec<PendingOperation>,
    /// Actors whose buffered operations were dropped; their next submission is stale
    expired: HashMap<ActorId, Vec<OperationId>>,
    /// Bumped on every change, including ones that leave the clock alone
    revision: u64,
}

impl BranchReplica {
    pub fn new(state: DocumentState) -> Self {
        Self {
            state,
            pending: Vec::new(),
            expired: HashMap::new(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn clock(&self) -> &VectorClock {
        self.state.clock()
    }

    pub fn pending_ids(&self) -> Vec<OperationId> {
        self.pending.iter().map(|p| p.operation.id).collect()
    }

    fn is_buffered(&self, id: OperationId) -> bool {
        self.pending.iter().any(|p| p.operation.id == id)
    }

    /// Drop buffered operations older than `ttl`
    fn expire_pending(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now - p.buffered_at > ttl);
        self.pending = kept;
        if !expired.is_empty() {
            self.revision += 1;
        }
        for dropped in expired {
            warn!(
                "Buffered operation {} from actor {} expired waiting for dependencies",
                dropped.operation.id, dropped.operation.actor_id
            );
            self.expired
                .entry(dropped.operation.actor_id)
                .or_default()
                .push(dropped.operation.id);
        }
    }
}

/// What one batch did to a replica
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// False when unresolved conflicts rejected the batch
    pub accepted: bool,
    pub applied: Vec<Operation>,
    pub duplicates: Vec<OperationId>,
    pub pending: Vec<OperationId>,
    pub conflicts: Vec<ConflictInfo>,
}

impl ApplyReport {
    pub fn unresolved(&self) -> Vec<ConflictInfo> {
        self.conflicts
            .iter()
            .filter(|conflict| !conflict.resolved)
            .cloned()
            .collect()
    }
}

/// Result of submitting operations to a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub document_id: DocumentId,
    pub branch_id: BranchId,
    /// False when unresolved conflicts rejected the batch; nothing was applied
    pub accepted: bool,
    pub new_content: DocumentContent,
    pub new_checksum: String,
    pub vector_clock: VectorClock,
    pub applied_operations: Vec<Operation>,
    /// Operations already applied earlier and ignored
    pub duplicates: Vec<OperationId>,
    /// Operations buffered until their dependencies arrive
    pub pending: Vec<OperationId>,
    pub conflicts: Vec<ConflictInfo>,
}

/// Where a batch comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Client submissions: buffering, rebase distance and conflict window apply
    Live,
    /// Branch delta replay: every operation must become ready, whole log is examined
    Replay,
}

/// Causal-order merge engine
#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: EngineConfig,
}

impl MergeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply a client batch against a branch replica.
    ///
    /// The replica is only changed when the batch is accepted; validation
    /// errors and rejected batches leave it as it was.
    pub fn apply(
        &self,
        replica: &mut BranchReplica,
        document_id: DocumentId,
        operations: Vec<Operation>,
        base_clock: &VectorClock,
        strategy: MergeStrategy,
        resolutions: &ResolutionMap,
    ) -> Result<ApplyReport> {
        self.apply_at(
            replica,
            document_id,
            operations,
            base_clock,
            strategy,
            resolutions,
            Utc::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn apply_at(
        &self,
        replica: &mut BranchReplica,
        document_id: DocumentId,
        operations: Vec<Operation>,
        base_clock: &VectorClock,
        strategy: MergeStrategy,
        resolutions: &ResolutionMap,
        now: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        if operations.len() > self.config.max_batch_size {
            return Err(CollabError::Validation(format!(
                "batch of {} operations exceeds the limit of {}",
                operations.len(),
                self.config.max_batch_size
            )));
        }

        let ttl = chrono::Duration::from_std(self.config.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        replica.expire_pending(now, ttl);

        let actors: HashSet<ActorId> = operations.iter().map(|op| op.actor_id).collect();
        for actor in actors {
            if let Some(dropped) = replica.expired.remove(&actor) {
                replica.revision += 1;
                return Err(CollabError::StaleState(format!(
                    "{} buffered operation(s) from actor {actor} expired; resync required",
                    dropped.len()
                )));
            }
        }

        let lag = base_clock.lag_behind(replica.clock());
        if lag > self.config.max_rebase_distance {
            return Err(CollabError::StaleState(format!(
                "client is {lag} operations behind (limit {})",
                self.config.max_rebase_distance
            )));
        }

        self.run(replica, document_id, operations, strategy, resolutions, Mode::Live, now)
    }

    /// Replay another branch's operations onto a replica during a merge.
    ///
    /// Buffered client operations that the replayed ones make ready are
    /// applied too; the rest stay buffered.
    pub fn replay(
        &self,
        replica: &mut BranchReplica,
        document_id: DocumentId,
        operations: Vec<Operation>,
        strategy: MergeStrategy,
        resolutions: &ResolutionMap,
    ) -> Result<ApplyReport> {
        self.run(
            replica,
            document_id,
            operations,
            strategy,
            resolutions,
            Mode::Replay,
            Utc::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        replica: &mut BranchReplica,
        document_id: DocumentId,
        operations: Vec<Operation>,
        strategy: MergeStrategy,
        resolutions: &ResolutionMap,
        mode: Mode,
        now: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport {
            accepted: true,
            ..Default::default()
        };

        let mut incoming = Vec::with_capacity(operations.len());
        let mut incoming_ids = HashSet::new();
        let mut batch_ids = HashSet::new();
        for op in operations {
            op.validate()?;
            if op.document_id != document_id {
                return Err(CollabError::Validation(format!(
                    "operation {} targets document {}, not {document_id}",
                    op.id, op.document_id
                )));
            }
            if replica.state.contains_operation(op.id)
                || replica.is_buffered(op.id)
                || !batch_ids.insert(op.id)
            {
                report.duplicates.push(op.id);
                continue;
            }
            let entry_taken = replica.state.operation_at(op.entry()).is_some()
                || replica.state.clock().contains(op.entry())
                || replica
                    .pending
                    .iter()
                    .any(|p| p.operation.entry() == op.entry());
            if entry_taken {
                return Err(CollabError::Validation(format!(
                    "actor {} already used sequence {} for another operation",
                    op.actor_id, op.seq
                )));
            }
            incoming_ids.insert(op.id);
            incoming.push(PendingOperation {
                operation: op,
                buffered_at: now,
            });
        }

        let window = match mode {
            Mode::Live => self.config.conflict_window,
            Mode::Replay => usize::MAX,
        };

        let mut work = replica.clone();
        let mut queue: Vec<PendingOperation> = std::mem::take(&mut work.pending);
        queue.extend(incoming);

        let mut unresolved = false;
        loop {
            let mut progressed = false;
            let mut waiting = Vec::with_capacity(queue.len());
            for pending in queue {
                if !work.state.is_ready(&pending.operation) {
                    waiting.push(pending);
                    continue;
                }
                let op = pending.operation;
                unresolved |= self.integrate(
                    &mut work.state,
                    op.clone(),
                    strategy,
                    resolutions,
                    window,
                    &mut report.conflicts,
                )?;
                report.applied.push(op);
                progressed = true;
            }
            queue = waiting;
            if !progressed || queue.is_empty() {
                break;
            }
        }

        if !queue.is_empty() {
            let stuck = queue
                .iter()
                .filter(|p| incoming_ids.contains(&p.operation.id))
                .count();
            if mode == Mode::Replay && stuck > 0 {
                return Err(CollabError::Validation(format!(
                    "{stuck} replayed operation(s) never became causally ready"
                )));
            }
            while queue.len() > self.config.max_pending_per_branch {
                let dropped = queue.remove(0);
                warn!(
                    "Pending buffer full; dropping operation {} from actor {}",
                    dropped.operation.id, dropped.operation.actor_id
                );
                work.expired
                    .entry(dropped.operation.actor_id)
                    .or_default()
                    .push(dropped.operation.id);
            }
            work.pending = queue;
        }
        report.pending = work.pending_ids();

        if unresolved {
            debug!(
                "Rejecting batch for document {}: {} unresolved conflict(s)",
                document_id,
                report.unresolved().len()
            );
            report.accepted = false;
            report.applied.clear();
            report.pending = replica.pending_ids();
            return Ok(report);
        }

        debug!(
            "Applied {} operation(s) to document {} ({} pending, {} conflict(s))",
            report.applied.len(),
            document_id,
            report.pending.len(),
            report.conflicts.len()
        );
        let changed = !report.applied.is_empty() || report.pending != replica.pending_ids();
        work.revision = replica.revision + u64::from(changed);
        *replica = work;
        Ok(report)
    }

    /// Integrate one ready operation, returning whether a conflict went unresolved
    fn integrate(
        &self,
        state: &mut DocumentState,
        op: Operation,
        strategy: MergeStrategy,
        resolutions: &ResolutionMap,
        window: usize,
        conflicts: &mut Vec<ConflictInfo>,
    ) -> Result<bool> {
        let (stamp, past) = state.prepare(&op)?;

        let mut unresolved = false;
        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for existing in state.concurrent_operations(&past, window) {
            let Some(mut conflict) = detect_conflict(existing, &op, stamp) else {
                continue;
            };
            let choice = resolutions
                .get(&conflict.conflict_id)
                .copied()
                .or_else(|| strategy.default_choice(&conflict));
            match choice {
                Some(choice) => {
                    conflict.resolve(choice);
                    match choice {
                        ResolutionChoice::KeepExisting => winners.push(existing.id()),
                        ResolutionChoice::KeepIncoming => losers.push(existing.id()),
                        ResolutionChoice::KeepBoth => {}
                    }
                }
                None => unresolved = true,
            }
            conflicts.push(conflict);
        }

        let disposition = if winners.is_empty() && losers.is_empty() {
            Disposition::Applied
        } else {
            Disposition::Contested { winners, losers }
        };
        state.integrate(op, disposition)?;
        Ok(unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolution_map, BlockId, BlockKind, ConflictKind, ConflictResolution, OperationBuilder,
        OperationKind,
    };

    fn engine() -> MergeEngine {
        MergeEngine::new(EngineConfig::for_testing())
    }

    fn seeded(doc: DocumentId, text: &str) -> (BranchReplica, BlockId, VectorClock) {
        let mut setup = OperationBuilder::new(doc, ActorId::new());
        let block = BlockId::new();
        let ops = vec![
            setup.build(OperationKind::InsertBlock {
                block,
                after: None,
                kind: BlockKind::Paragraph,
            }),
            setup.build(OperationKind::InsertText {
                block,
                after: None,
                text: text.to_string(),
            }),
        ];
        let mut replica = BranchReplica::default();
        engine()
            .apply(
                &mut replica,
                doc,
                ops,
                &VectorClock::new(),
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        let clock = replica.clock().clone();
        (replica, block, clock)
    }

    fn text(replica: &BranchReplica) -> String {
        replica.state().content().unwrap().plain_text()
    }

    #[test]
    fn test_out_of_order_operations_are_buffered() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "ab");
        let mut alice = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let anchor = replica.state().insertion_anchor(block, 2).unwrap();
        let first = alice.build(OperationKind::InsertText {
            block,
            after: anchor,
            text: "c".to_string(),
        });
        let second = alice.build(OperationKind::DeleteBlock { block });

        let report = engine()
            .apply(
                &mut replica,
                doc,
                vec![second.clone()],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.pending, vec![second.id]);

        let report = engine()
            .apply(
                &mut replica,
                doc,
                vec![first],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert!(report.pending.is_empty());
        assert_eq!(text(&replica), "");
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "ab");
        let mut alice = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let op = alice.build(OperationKind::InsertText {
            block,
            after: None,
            text: "x".to_string(),
        });

        for _ in 0..2 {
            engine()
                .apply(
                    &mut replica,
                    doc,
                    vec![op.clone()],
                    &clock,
                    MergeStrategy::AutoMerge,
                    &ResolutionMap::new(),
                )
                .unwrap();
        }
        assert_eq!(text(&replica), "xab");
        assert_eq!(replica.clock().get(alice.actor_id()), 1);
    }

    #[test]
    fn test_reused_sequence_is_rejected() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "ab");
        let mut alice = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let op = alice.build(OperationKind::DeleteBlock { block });
        let mut forged = op.clone();
        forged.id = OperationId::new();

        engine()
            .apply(
                &mut replica,
                doc,
                vec![op],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        let err = engine()
            .apply(
                &mut replica,
                doc,
                vec![forged],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
    }

    #[test]
    fn test_stale_base_clock_is_rejected() {
        let doc = DocumentId::new();
        let mut setup = OperationBuilder::new(doc, ActorId::new());
        let block = BlockId::new();
        let mut ops = vec![setup.build(OperationKind::InsertBlock {
            block,
            after: None,
            kind: BlockKind::Paragraph,
        })];
        for _ in 0..120 {
            ops.push(setup.build(OperationKind::InsertText {
                block,
                after: None,
                text: "z".to_string(),
            }));
        }
        let mut replica = BranchReplica::default();
        engine()
            .apply(
                &mut replica,
                doc,
                ops,
                &VectorClock::new(),
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();

        let mut late = OperationBuilder::new(doc, ActorId::new());
        let op = late.build(OperationKind::InsertBlock {
            block: BlockId::new(),
            after: None,
            kind: BlockKind::Paragraph,
        });
        let err = engine()
            .apply(
                &mut replica,
                doc,
                vec![op],
                &VectorClock::new(),
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::StaleState(_)));
    }

    #[test]
    fn test_expired_buffer_makes_next_submission_stale() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "ab");
        let mut alice = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let _lost = alice.build(OperationKind::DeleteBlock { block });
        let orphan = alice.build(OperationKind::DeleteBlock { block });
        let start = Utc::now();

        engine()
            .apply_at(
                &mut replica,
                doc,
                vec![orphan],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
                start,
            )
            .unwrap();

        let next = alice.build(OperationKind::DeleteBlock { block });
        let err = engine()
            .apply_at(
                &mut replica,
                doc,
                vec![next],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
                start + chrono::Duration::seconds(5),
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::StaleState(_)));
        assert!(replica.pending_ids().is_empty());
    }

    #[test]
    fn test_replay_applies_buffered_operations_it_unblocks() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "ab");
        let mut alice = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let mut bob = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let anchor = replica.state().insertion_anchor(block, 2).unwrap();
        let merged = alice.build(OperationKind::InsertText {
            block,
            after: anchor,
            text: "c".to_string(),
        });
        let waiting = alice.build(OperationKind::DeleteBlock { block });
        let _never_sent = bob.build(OperationKind::DeleteBlock { block });
        let orphan = bob.build(OperationKind::DeleteBlock { block });

        let before = replica.revision();
        engine()
            .apply(
                &mut replica,
                doc,
                vec![waiting.clone(), orphan.clone()],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        // Buffering alone moves the revision, not the clock
        assert_eq!(replica.clock(), &clock);
        assert!(replica.revision() > before);

        let report = engine()
            .replay(
                &mut replica,
                doc,
                vec![merged.clone()],
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        let applied: Vec<_> = report.applied.iter().map(|op| op.id).collect();
        assert_eq!(applied, vec![merged.id, waiting.id]);
        assert_eq!(replica.pending_ids(), vec![orphan.id]);
        assert_eq!(text(&replica), "");
    }

    #[test]
    fn test_manual_conflicts_reject_then_resolve() {
        let doc = DocumentId::new();
        let (mut replica, block, clock) = seeded(doc, "abcdef");
        let range = replica.state().position_range(block, 0, 3).unwrap();
        let mut left = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let mut right = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let delete = left.build(OperationKind::DeleteText {
            block,
            elements: range.clone(),
        });
        let format = right.build(OperationKind::Format {
            block,
            elements: range,
            attribute: "bold".to_string(),
            value: Some("true".to_string()),
        });

        engine()
            .apply(
                &mut replica,
                doc,
                vec![delete],
                &clock,
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();

        let before = replica.state().content().unwrap();
        let report = engine()
            .apply(
                &mut replica,
                doc,
                vec![format.clone()],
                &clock,
                MergeStrategy::Manual,
                &ResolutionMap::new(),
            )
            .unwrap();
        assert!(!report.accepted);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, ConflictKind::DeleteFormat);
        assert_eq!(replica.state().content().unwrap(), before);

        let resolutions = resolution_map(&[ConflictResolution {
            conflict_id: report.conflicts[0].conflict_id,
            choice: ResolutionChoice::KeepIncoming,
        }]);
        let report = engine()
            .apply(
                &mut replica,
                doc,
                vec![format],
                &clock,
                MergeStrategy::Manual,
                &resolutions,
            )
            .unwrap();
        assert!(report.accepted);
        assert!(report.conflicts[0].resolved);
        // The winning format revives the deleted characters
        assert_eq!(text(&replica), "abcdef");
    }

    #[test]
    fn test_auto_merge_converges_in_either_order() {
        let doc = DocumentId::new();
        let (base, block, clock) = seeded(doc, "abcdef");
        let range = base.state().position_range(block, 1, 4).unwrap();
        let mut left = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let mut right = OperationBuilder::new(doc, ActorId::new()).with_clock(&clock);
        let delete = left.build(OperationKind::DeleteText {
            block,
            elements: range.clone(),
        });
        let format = right.build(OperationKind::Format {
            block,
            elements: range,
            attribute: "bold".to_string(),
            value: Some("true".to_string()),
        });

        let mut one = base.clone();
        let mut two = base;
        for (replica, ops) in [
            (&mut one, vec![delete.clone(), format.clone()]),
            (&mut two, vec![format, delete]),
        ] {
            for op in ops {
                engine()
                    .apply(
                        replica,
                        doc,
                        vec![op],
                        &clock,
                        MergeStrategy::AutoMerge,
                        &ResolutionMap::new(),
                    )
                    .unwrap();
            }
        }
        assert_eq!(
            one.state().content().unwrap().checksum,
            two.state().content().unwrap().checksum
        );
    }

    fn actor(n: u128) -> ActorId {
        ActorId(uuid::Uuid::from_u128(n))
    }

    /// Apply single-operation batches in the given order on a copy of `base`
    fn play(base: &BranchReplica, doc: DocumentId, clock: &VectorClock, ops: &[&Operation]) -> BranchReplica {
        let mut replica = base.clone();
        for op in ops {
            engine()
                .apply(
                    &mut replica,
                    doc,
                    vec![(*op).clone()],
                    clock,
                    MergeStrategy::AutoMerge,
                    &ResolutionMap::new(),
                )
                .unwrap();
        }
        replica
    }

    #[test]
    fn test_partially_overlapping_delete_and_format_commute() {
        let doc = DocumentId::new();
        let (base, block, clock) = seeded(doc, "abcdef");
        let deleted = base.state().position_range(block, 1, 4).unwrap();
        let bolded = base.state().position_range(block, 3, 6).unwrap();

        // (delete actor, format actor, surviving text, bold run)
        let cases = [(actor(1), actor(2), "adef", (1, 4)), (actor(2), actor(1), "aef", (1, 3))];
        for (delete_actor, format_actor, expected, (start, end)) in cases {
            let delete = OperationBuilder::new(doc, delete_actor)
                .with_clock(&clock)
                .build(OperationKind::DeleteText {
                    block,
                    elements: deleted.clone(),
                });
            let format = OperationBuilder::new(doc, format_actor)
                .with_clock(&clock)
                .build(OperationKind::Format {
                    block,
                    elements: bolded.clone(),
                    attribute: "bold".to_string(),
                    value: Some("true".to_string()),
                });

            let one = play(&base, doc, &clock, &[&delete, &format]);
            let two = play(&base, doc, &clock, &[&format, &delete]);
            let left = one.state().content().unwrap();
            let right = two.state().content().unwrap();
            assert_eq!(left.plain_text(), expected);
            assert_eq!(right.plain_text(), expected);
            assert_eq!(left.checksum, right.checksum);
            let marks = &left.blocks[0].marks;
            assert_eq!(marks.len(), 1);
            assert_eq!((marks[0].start, marks[0].end), (start, end));
        }
    }

    #[test]
    fn test_concurrent_formats_keep_highest_stamp() {
        let doc = DocumentId::new();
        let (base, block, clock) = seeded(doc, "abcdef");
        let head = base.state().position_range(block, 0, 4).unwrap();
        let tail = base.state().position_range(block, 2, 6).unwrap();
        let red = OperationBuilder::new(doc, actor(1))
            .with_clock(&clock)
            .build(OperationKind::Format {
                block,
                elements: head,
                attribute: "color".to_string(),
                value: Some("red".to_string()),
            });
        let blue = OperationBuilder::new(doc, actor(2))
            .with_clock(&clock)
            .build(OperationKind::Format {
                block,
                elements: tail,
                attribute: "color".to_string(),
                value: Some("blue".to_string()),
            });

        let one = play(&base, doc, &clock, &[&red, &blue]);
        let two = play(&base, doc, &clock, &[&blue, &red]);
        let content = one.state().content().unwrap();
        assert_eq!(content, two.state().content().unwrap());
        let marks: Vec<_> = content.blocks[0]
            .marks
            .iter()
            .map(|m| (m.start, m.end, m.value.as_str()))
            .collect();
        assert_eq!(marks, vec![(0, 2, "red"), (2, 6, "blue")]);
    }

    #[test]
    fn test_concurrent_moves_and_later_inserts_converge() {
        let doc = DocumentId::new();
        let mut setup = OperationBuilder::new(doc, actor(9));
        let blocks = [BlockId::new(), BlockId::new(), BlockId::new()];
        let mut ops = Vec::new();
        let mut after = None;
        for block in blocks {
            ops.push(setup.build(OperationKind::InsertBlock {
                block,
                after,
                kind: BlockKind::Paragraph,
            }));
            after = Some(block);
        }
        let mut base = BranchReplica::default();
        engine()
            .apply(
                &mut base,
                doc,
                ops,
                &VectorClock::new(),
                MergeStrategy::AutoMerge,
                &ResolutionMap::new(),
            )
            .unwrap();
        let clock = base.clock().clone();

        let mut left = OperationBuilder::new(doc, actor(1)).with_clock(&clock);
        let mut right = OperationBuilder::new(doc, actor(2)).with_clock(&clock);
        let to_end = left.build(OperationKind::MoveBlock {
            block: blocks[0],
            after: Some(blocks[2]),
        });
        // Built on top of the losing move
        let follower = BlockId::new();
        let after_moved = left.build(OperationKind::InsertBlock {
            block: follower,
            after: Some(blocks[0]),
            kind: BlockKind::Paragraph,
        });
        let to_middle = right.build(OperationKind::MoveBlock {
            block: blocks[0],
            after: Some(blocks[1]),
        });

        let one = play(&base, doc, &clock, &[&to_end, &after_moved, &to_middle]);
        let two = play(&base, doc, &clock, &[&to_middle, &to_end, &after_moved]);
        assert_eq!(one.state().block_order(), two.state().block_order());
        assert_eq!(
            one.state().block_order(),
            vec![blocks[1], blocks[0], blocks[2], follower]
        );
    }
}
