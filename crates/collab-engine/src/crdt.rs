/// Sequence CRDT backing a branch's live document state
///
/// Blocks and characters are both ordered with a replicated growable array:
/// every element remembers the element it was inserted after (its origin),
/// siblings under one origin are ordered by descending [`PositionId`], and the
/// visible order is a pre-order walk of that tree. Deletes leave tombstones.
/// Moving a block adds a new slot for it; the highest live slot wins.
///
/// Conflict losers are withdrawn only where a winner overlaps them. Effects
/// are kept as sets keyed by operation, so the result of a contested pair is
/// the same whichever side arrives first.
///
/// The operation log is the source of truth: a serialized state is just its
/// log, and deserializing replays it.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::{
    Block, BlockId, BlockKind, ClockEntry, CollabError, DocumentContent, Mark, Operation,
    OperationId, OperationKind, PositionId, Result, Stamp, VectorClock,
};

/// How an accepted operation took effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Applied,
    /// Took part in conflicts: yields to `winners` and withdraws `losers`
    /// where their footprints overlap
    Contested {
        winners: Vec<OperationId>,
        losers: Vec<OperationId>,
    },
}

/// Operation as recorded in a branch's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedOperation {
    pub operation: Operation,
    pub stamp: Stamp,
    /// Transitive causal past, excluding the operation itself
    pub causal_past: VectorClock,
    pub disposition: Disposition,
}

impl LoggedOperation {
    pub fn id(&self) -> OperationId {
        self.operation.id
    }

    pub fn entry(&self) -> ClockEntry {
        self.operation.entry()
    }

    /// Positions created by this operation
    pub fn created_positions(&self) -> Vec<PositionId> {
        match &self.operation.kind {
            OperationKind::InsertText { text, .. } => (0..text.chars().count() as u32)
                .map(|offset| self.position(offset))
                .collect(),
            OperationKind::InsertBlock { .. } | OperationKind::MoveBlock { .. } => {
                vec![self.position(0)]
            }
            _ => Vec::new(),
        }
    }

    /// Existing characters this operation claims when it wins a conflict
    pub fn footprint(&self) -> BTreeSet<PositionId> {
        let mut footprint = self.operation.kind.targets();
        if let OperationKind::InsertText {
            after: Some(after), ..
        } = &self.operation.kind
        {
            footprint.insert(*after);
        }
        footprint
    }

    fn position(&self, offset: u32) -> PositionId {
        PositionId {
            rank: self.stamp.rank,
            seq: self.stamp.seq,
            actor: self.stamp.actor,
            offset,
        }
    }
}

#[derive(Debug, Clone)]
struct TextElement {
    ch: char,
    deleted_by: BTreeSet<OperationId>,
    /// Every surviving assignment per attribute; the highest stamp shows
    marks: BTreeMap<String, BTreeMap<Stamp, Option<String>>>,
}

impl TextElement {
    fn mark(&self, attribute: &str) -> Option<&str> {
        self.marks
            .get(attribute)
            .and_then(|assignments| assignments.values().next_back())
            .and_then(|value| value.as_deref())
    }
}

#[derive(Debug, Clone)]
struct BlockNode {
    kind: BlockKind,
    created: ClockEntry,
    /// Slot from the inserting operation
    origin: PositionId,
    slots: BTreeSet<PositionId>,
    /// Slots of moves that lost a conflict
    dead_slots: BTreeSet<PositionId>,
    deleted_by: BTreeSet<OperationId>,
    elements: HashMap<PositionId, TextElement>,
    children: HashMap<Option<PositionId>, Vec<PositionId>>,
}

impl BlockNode {
    fn is_deleted(&self) -> bool {
        !self.deleted_by.is_empty()
    }

    /// Winning placement
    fn slot(&self) -> PositionId {
        self.slots
            .iter()
            .rev()
            .find(|slot| !self.dead_slots.contains(slot))
            .copied()
            .unwrap_or(self.origin)
    }

    /// Pre-order walk of the character tree
    fn ordered(&self) -> Vec<PositionId> {
        let mut out = Vec::with_capacity(self.elements.len());
        let mut stack: Vec<PositionId> = self
            .children
            .get(&None)
            .map(|children| children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(children) = self.children.get(&Some(id)) {
                stack.extend(children.iter().rev().copied());
            }
        }
        out
    }

    fn visible(&self) -> Vec<PositionId> {
        self.ordered()
            .into_iter()
            .filter(|id| {
                self.elements
                    .get(id)
                    .map(|element| element.deleted_by.is_empty())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Slot to anchor after, as seen from `past`
    fn slot_in(&self, past: &VectorClock) -> PositionId {
        self.slots
            .iter()
            .rev()
            .find(|slot| past.contains(slot.entry()))
            .copied()
            .unwrap_or(self.origin)
    }
}

fn insert_sorted(siblings: &mut Vec<PositionId>, id: PositionId) {
    let index = siblings.partition_point(|existing| *existing > id);
    siblings.insert(index, id);
}

/// Live CRDT state of one branch of a document
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    clock: VectorClock,
    log: Vec<LoggedOperation>,
    by_id: HashMap<OperationId, usize>,
    by_entry: HashMap<ClockEntry, usize>,
    blocks: HashMap<BlockId, BlockNode>,
    slots: HashMap<PositionId, BlockId>,
    slot_children: HashMap<Option<PositionId>, Vec<PositionId>>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a state by replaying a recorded log
    pub fn replay(log: Vec<LoggedOperation>) -> Result<Self> {
        let mut state = Self::new();
        for logged in log {
            if !state.is_ready(&logged.operation) {
                return Err(CollabError::Validation(format!(
                    "log replay out of causal order at operation {}",
                    logged.id()
                )));
            }
            state.commit(logged)?;
        }
        Ok(state)
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn log(&self) -> &[LoggedOperation] {
        &self.log
    }

    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    pub fn contains_operation(&self, id: OperationId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get_operation(&self, id: OperationId) -> Option<&LoggedOperation> {
        self.by_id.get(&id).map(|&index| &self.log[index])
    }

    pub fn operation_at(&self, entry: ClockEntry) -> Option<&LoggedOperation> {
        self.by_entry.get(&entry).map(|&index| &self.log[index])
    }

    /// Every dependency is applied and the op is the actor's next in sequence
    pub fn is_ready(&self, op: &Operation) -> bool {
        self.clock.get(op.actor_id) + 1 == op.seq && op.deps.iter().all(|e| self.clock.contains(e))
    }

    /// Transitive causal past of a ready operation
    pub fn causal_past(&self, op: &Operation) -> VectorClock {
        let mut past = op.deps.clone();
        past.observe(op.actor_id, op.seq.saturating_sub(1));
        let tops: Vec<ClockEntry> = past.iter().collect();
        for entry in tops {
            if let Some(logged) = self.operation_at(entry) {
                past.merge(&logged.causal_past);
            }
        }
        past
    }

    /// Operations applied since `clock`, in log order
    pub fn operations_since(&self, clock: &VectorClock) -> Vec<&LoggedOperation> {
        self.log
            .iter()
            .filter(|logged| !clock.contains(logged.entry()))
            .collect()
    }

    /// Recent operations concurrent with an operation whose causal past is `past`
    pub fn concurrent_operations<'a>(
        &'a self,
        past: &'a VectorClock,
        window: usize,
    ) -> impl Iterator<Item = &'a LoggedOperation> + 'a {
        let start = self.log.len().saturating_sub(window);
        self.log[start..]
            .iter()
            .filter(move |logged| !past.contains(logged.entry()))
    }

    /// Stamp and causal past an operation would be integrated with
    pub fn prepare(&self, op: &Operation) -> Result<(Stamp, VectorClock)> {
        let past = self.causal_past(op);
        self.check_references(op, &past)?;
        Ok((Stamp::for_operation(&past, op.entry()), past))
    }

    /// Integrate a ready operation. Callers check readiness and idempotence.
    pub fn integrate(&mut self, op: Operation, disposition: Disposition) -> Result<&LoggedOperation> {
        let (stamp, causal_past) = self.prepare(&op)?;
        let index = self.log.len();
        self.commit(LoggedOperation {
            operation: op,
            stamp,
            causal_past,
            disposition,
        })?;
        Ok(&self.log[index])
    }

    fn commit(&mut self, logged: LoggedOperation) -> Result<()> {
        self.apply_effects(&logged)?;
        let index = self.log.len();
        self.clock.observe(logged.operation.actor_id, logged.operation.seq);
        self.by_id.insert(logged.id(), index);
        self.by_entry.insert(logged.entry(), index);
        self.log.push(logged);
        Ok(())
    }

    fn block_in_past(&self, block: BlockId, past: &VectorClock) -> Result<&BlockNode> {
        match self.blocks.get(&block) {
            Some(node) if past.contains(node.created) => Ok(node),
            _ => Err(CollabError::Validation(format!(
                "block {block} is not in the operation's causal past"
            ))),
        }
    }

    fn check_references(&self, op: &Operation, past: &VectorClock) -> Result<()> {
        match &op.kind {
            OperationKind::InsertBlock { block, after, .. } => {
                if self.blocks.contains_key(block) {
                    return Err(CollabError::Validation(format!(
                        "block {block} already exists"
                    )));
                }
                if let Some(after) = after {
                    self.block_in_past(*after, past)?;
                }
            }
            OperationKind::InsertText { block, after, .. } => {
                let node = self.block_in_past(*block, past)?;
                if let Some(after) = after {
                    if !node.elements.contains_key(after) || !past.contains(after.entry()) {
                        return Err(CollabError::Validation(format!(
                            "anchor {after:?} is not in block {block}"
                        )));
                    }
                }
            }
            OperationKind::DeleteText {
                block, elements, ..
            }
            | OperationKind::Format {
                block, elements, ..
            } => {
                let node = self.block_in_past(*block, past)?;
                if let Some(missing) = elements
                    .iter()
                    .find(|id| !node.elements.contains_key(id) || !past.contains(id.entry()))
                {
                    return Err(CollabError::Validation(format!(
                        "element {missing:?} is not in block {block}"
                    )));
                }
            }
            OperationKind::DeleteBlock { block } => {
                self.block_in_past(*block, past)?;
            }
            OperationKind::MoveBlock { block, after } => {
                self.block_in_past(*block, past)?;
                if let Some(after) = after {
                    self.block_in_past(*after, past)?;
                }
            }
        }
        Ok(())
    }

    fn apply_effects(&mut self, logged: &LoggedOperation) -> Result<()> {
        let op = &logged.operation;
        let stamp = logged.stamp;

        match &op.kind {
            OperationKind::InsertBlock { block, after, kind } => {
                let slot = self.place_slot(*after, logged)?;
                self.blocks.insert(
                    *block,
                    BlockNode {
                        kind: *kind,
                        created: op.entry(),
                        origin: slot,
                        slots: BTreeSet::from([slot]),
                        dead_slots: BTreeSet::new(),
                        deleted_by: BTreeSet::new(),
                        elements: HashMap::new(),
                        children: HashMap::new(),
                    },
                );
                self.slots.insert(slot, *block);
            }
            OperationKind::InsertText { block, after, text } => {
                let positions = logged.created_positions();
                let node = self.node_mut(*block)?;
                let mut origin = *after;
                for (id, ch) in positions.into_iter().zip(text.chars()) {
                    node.elements.insert(
                        id,
                        TextElement {
                            ch,
                            deleted_by: BTreeSet::new(),
                            marks: BTreeMap::new(),
                        },
                    );
                    insert_sorted(node.children.entry(origin).or_default(), id);
                    origin = Some(id);
                }
            }
            OperationKind::DeleteText { block, elements } => {
                let node = self.node_mut(*block)?;
                for id in elements {
                    if let Some(element) = node.elements.get_mut(id) {
                        element.deleted_by.insert(op.id);
                    }
                }
            }
            OperationKind::DeleteBlock { block } => {
                self.node_mut(*block)?.deleted_by.insert(op.id);
            }
            OperationKind::Format {
                block,
                elements,
                attribute,
                value,
            } => {
                let node = self.node_mut(*block)?;
                for id in elements {
                    if let Some(element) = node.elements.get_mut(id) {
                        element
                            .marks
                            .entry(attribute.clone())
                            .or_default()
                            .insert(stamp, value.clone());
                    }
                }
            }
            OperationKind::MoveBlock { block, after } => {
                let slot = self.place_slot(*after, logged)?;
                self.slots.insert(slot, *block);
                self.node_mut(*block)?.slots.insert(slot);
            }
        }

        if let Disposition::Contested { winners, losers } = &logged.disposition {
            for winner in winners {
                if let Some(winner) = self.get_operation(*winner).cloned() {
                    self.withdraw(logged, &winner)?;
                }
            }
            for loser in losers {
                if let Some(loser) = self.get_operation(*loser).cloned() {
                    self.withdraw(&loser, logged)?;
                }
            }
        }
        Ok(())
    }

    /// Add a block slot after `after` (or at the top) in the block tree
    fn place_slot(&mut self, after: Option<BlockId>, logged: &LoggedOperation) -> Result<PositionId> {
        let anchor = match after {
            Some(after) => Some(
                self.block_in_past(after, &logged.causal_past)?
                    .slot_in(&logged.causal_past),
            ),
            None => None,
        };
        let slot = logged.position(0);
        insert_sorted(self.slot_children.entry(anchor).or_default(), slot);
        Ok(slot)
    }

    /// Withdraw a losing operation's effect where the winner overlaps it.
    ///
    /// Every arm only removes entries keyed by the loser (or adds ones keyed
    /// by the winner), so repeating it or running it before other winners
    /// changes nothing.
    fn withdraw(&mut self, loser: &LoggedOperation, winner: &LoggedOperation) -> Result<()> {
        use OperationKind::*;

        match (&loser.operation.kind, &winner.operation.kind) {
            (DeleteBlock { block }, _) => {
                self.node_mut(*block)?.deleted_by.remove(&loser.id());
            }
            (DeleteText { block, elements }, DeleteText { .. } | Format { .. } | InsertText { .. }) => {
                let footprint = winner.footprint();
                let node = self.node_mut(*block)?;
                for id in elements.iter().filter(|id| footprint.contains(id)) {
                    if let Some(element) = node.elements.get_mut(id) {
                        element.deleted_by.remove(&loser.id());
                    }
                }
            }
            (
                Format {
                    block,
                    elements,
                    attribute,
                    ..
                },
                DeleteText { .. } | Format { .. },
            ) => {
                let footprint = winner.footprint();
                let node = self.node_mut(*block)?;
                for id in elements.iter().filter(|id| footprint.contains(id)) {
                    let Some(element) = node.elements.get_mut(id) else {
                        continue;
                    };
                    if let Some(assignments) = element.marks.get_mut(attribute) {
                        assignments.remove(&loser.stamp);
                        if assignments.is_empty() {
                            element.marks.remove(attribute);
                        }
                    }
                }
            }
            (InsertText { block, .. }, DeleteText { .. } | DeleteBlock { .. }) => {
                let created = loser.created_positions();
                let node = self.node_mut(*block)?;
                for id in created {
                    if let Some(element) = node.elements.get_mut(&id) {
                        element.deleted_by.insert(winner.id());
                    }
                }
            }
            (MoveBlock { block, .. }, MoveBlock { .. }) => {
                let slot = loser.position(0);
                self.node_mut(*block)?.dead_slots.insert(slot);
            }
            _ => {}
        }
        Ok(())
    }

    fn node_mut(&mut self, block: BlockId) -> Result<&mut BlockNode> {
        self.blocks
            .get_mut(&block)
            .ok_or_else(|| CollabError::Validation(format!("block {block} does not exist")))
    }

    /// Visible block ids in document order
    pub fn block_order(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack: Vec<PositionId> = self
            .slot_children
            .get(&None)
            .map(|children| children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(slot) = stack.pop() {
            if let Some(block) = self.slots.get(&slot) {
                if let Some(node) = self.blocks.get(block) {
                    if node.slot() == slot && !node.is_deleted() {
                        out.push(*block);
                    }
                }
            }
            if let Some(children) = self.slot_children.get(&Some(slot)) {
                stack.extend(children.iter().rev().copied());
            }
        }
        out
    }

    pub fn has_visible_block(&self, block: BlockId) -> bool {
        self.blocks
            .get(&block)
            .map(|node| !node.is_deleted())
            .unwrap_or(false)
    }

    /// Visible character positions of a block, in order
    pub fn visible_positions(&self, block: BlockId) -> Option<Vec<PositionId>> {
        self.blocks
            .get(&block)
            .filter(|node| !node.is_deleted())
            .map(BlockNode::visible)
    }

    /// Positions covering visible offsets `[start, end)` of a block
    pub fn position_range(&self, block: BlockId, start: usize, end: usize) -> Result<Vec<PositionId>> {
        let positions = self
            .visible_positions(block)
            .ok_or_else(|| CollabError::StalePosition(format!("block {block} is not visible")))?;
        if start > end || end > positions.len() {
            return Err(CollabError::StalePosition(format!(
                "range {start}..{end} exceeds block {block} of length {}",
                positions.len()
            )));
        }
        Ok(positions[start..end].to_vec())
    }

    /// Anchor for inserting at visible offset `offset` of a block
    pub fn insertion_anchor(&self, block: BlockId, offset: usize) -> Result<Option<PositionId>> {
        if offset == 0 {
            if !self.has_visible_block(block) {
                return Err(CollabError::StalePosition(format!(
                    "block {block} is not visible"
                )));
            }
            return Ok(None);
        }
        Ok(self.position_range(block, offset - 1, offset)?.first().copied())
    }

    /// Every visible character across visible blocks
    pub fn visible_elements(&self) -> HashSet<PositionId> {
        self.blocks
            .values()
            .filter(|node| !node.is_deleted())
            .flat_map(|node| {
                node.elements
                    .iter()
                    .filter(|(_, element)| element.deleted_by.is_empty())
                    .map(|(id, _)| *id)
            })
            .collect()
    }

    /// Materialize the visible document
    pub fn blocks(&self) -> Vec<Block> {
        self.block_order()
            .into_iter()
            .filter_map(|id| self.blocks.get(&id).map(|node| (id, node)))
            .map(|(id, node)| {
                let visible = node.visible();
                let mut text = String::with_capacity(visible.len());
                let mut runs: BTreeMap<&str, Vec<(u32, &str)>> = BTreeMap::new();
                for (offset, position) in visible.iter().enumerate() {
                    let Some(element) = node.elements.get(position) else {
                        continue;
                    };
                    text.push(element.ch);
                    for attribute in element.marks.keys() {
                        if let Some(value) = element.mark(attribute) {
                            runs.entry(attribute.as_str())
                                .or_default()
                                .push((offset as u32, value));
                        }
                    }
                }
                Block {
                    id,
                    kind: node.kind,
                    text,
                    marks: collapse_runs(runs),
                }
            })
            .collect()
    }

    pub fn content(&self) -> Result<DocumentContent> {
        DocumentContent::from_blocks(self.blocks())
    }
}

fn collapse_runs(runs: BTreeMap<&str, Vec<(u32, &str)>>) -> Vec<Mark> {
    let mut marks = Vec::new();
    for (attribute, points) in runs {
        let mut current: Option<Mark> = None;
        for (offset, value) in points {
            match current.as_mut() {
                Some(mark) if mark.end == offset && mark.value == value => mark.end = offset + 1,
                _ => {
                    if let Some(done) = current.take() {
                        marks.push(done);
                    }
                    current = Some(Mark {
                        start: offset,
                        end: offset + 1,
                        attribute: attribute.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }
        marks.extend(current);
    }
    marks.sort_by(|a, b| (a.start, &a.attribute).cmp(&(b.start, &b.attribute)));
    marks
}

#[derive(Serialize)]
struct StateSnapshotRef<'a> {
    log: &'a [LoggedOperation],
}

#[derive(Deserialize)]
struct StateSnapshot {
    log: Vec<LoggedOperation>,
}

impl Serialize for DocumentState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        StateSnapshotRef { log: &self.log }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let snapshot = StateSnapshot::deserialize(deserializer)?;
        DocumentState::replay(snapshot.log).map_err(serde::de::Error::custom)
    }
}

impl PartialEq for DocumentState {
    fn eq(&self, other: &Self) -> bool {
        self.log == other.log
    }
}
