//! Service facade over the collaboration engine.
//!
//! Documents live in a sharded registry; each one owns a runtime behind a FIFO
//! async mutex, which is the single-writer token for content, versions, merges
//! and comments of that document. Presence and event delivery never take it.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    plan_merge, require, resolution_map, AccessGate, ActivityEvent, ActivityImpact, ActivityLog,
    ActivityType, ActorId, BatchLoader, BlockId, BranchId, BranchReplica, BranchStateRecord,
    Capability, CollabConfig, CollabError, CollabEvent, Comment, CommentBoard, CommentChange,
    CommentEvent, CommentId, ConflictResolution, ConnectionInfo, ContentEvent, CrdtSummary,
    Document, DocumentBranch, DocumentContent, DocumentId, DocumentRecord, DocumentState,
    DocumentStatus, DocumentVersion, EventBroadcaster, ImpactScope, MergeEngine, MergeId,
    MergeOutcome, MergePlan, MergeResult, MergeStrategy, NewComment, NewDocument, Operation,
    OperationId, OperationKind, PermissionSummary, PersistencePort, PersistenceWriter,
    PositionId, PresenceSession, PresenceTracker, PresenceUpdate, RateLimiter, Record, Result,
    SessionId, Severity, SnapshotRequest, StoredRow, SubscribeOptions, Subscription, ThreadId,
    VectorClock, VersionEvent, VersionHistory, VersionId,
};

const DEFAULT_BRANCH: &str = "main";

/// Everything the write token guards for one document
struct DocumentRuntime {
    document: Document,
    history: VersionHistory,
    replicas: HashMap<BranchId, BranchReplica>,
    comments: CommentBoard,
}

impl DocumentRuntime {
    fn default_branch(&self) -> BranchId {
        self.document.default_branch_id
    }

    fn replica(&self, branch: BranchId) -> Result<&BranchReplica> {
        self.replicas
            .get(&branch)
            .ok_or_else(|| CollabError::not_found("branch", branch))
    }

    fn replica_mut(&mut self, branch: BranchId) -> Result<&mut BranchReplica> {
        self.replicas
            .get_mut(&branch)
            .ok_or_else(|| CollabError::not_found("branch", branch))
    }

    fn record(&self, comments: &CommentBoard) -> DocumentRecord {
        let mut branch_ids: Vec<_> = self.replicas.keys().copied().collect();
        branch_ids.sort();
        DocumentRecord {
            document: self.document.clone(),
            branch_ids,
            version_ids: self.history.versions().iter().map(|v| v.id).collect(),
            comment_ids: comments.ids(),
        }
    }

    fn document_row(&self) -> Result<StoredRow> {
        self.record(&self.comments).to_row()
    }

    /// Row for the live state of one branch
    fn branch_state_row(&self, branch: BranchId) -> Result<StoredRow> {
        BranchStateRecord {
            document_id: self.document.id,
            branch_id: branch,
            state: self.replica(branch)?.state().clone(),
        }
        .to_row()
    }

    /// Mirror the default branch into the document metadata
    fn refresh_document(&mut self) -> Result<()> {
        let replica = self.replica(self.default_branch())?;
        let content = replica.state().content()?;
        let crdt = CrdtSummary {
            vector_clock: replica.clock().clone(),
            operation_count: replica.state().operation_count() as u64,
        };
        self.document.content = content;
        self.document.crdt = crdt;
        self.document.updated_at = Utc::now();
        if self.document.status == DocumentStatus::Draft {
            self.document.status = DocumentStatus::Active;
        }
        Ok(())
    }
}

type SharedRuntime = Arc<Mutex<DocumentRuntime>>;

/// Knobs for one submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Defaults to the document's default branch
    pub branch_id: Option<BranchId>,
    pub strategy: MergeStrategy,
    pub resolutions: Vec<ConflictResolution>,
    /// Session the batch came from; it does not get the content event back
    pub session_id: Option<SessionId>,
}

/// Full state for a client that has to resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document: Document,
    pub branch_id: BranchId,
    pub content: DocumentContent,
    pub vector_clock: VectorClock,
    pub head_version_id: VersionId,
    pub pending: Vec<OperationId>,
    pub sessions: Vec<PresenceSession>,
}

fn content_impact(operations: &[Operation]) -> ActivityImpact {
    let changes: u64 = operations
        .iter()
        .map(|op| op.kind.change_count() as u64)
        .sum();
    let structural = operations.iter().any(|op| {
        matches!(
            op.kind,
            OperationKind::InsertBlock { .. }
                | OperationKind::DeleteBlock { .. }
                | OperationKind::MoveBlock { .. }
        )
    });
    let (severity, scope) = if structural {
        (Severity::Moderate, ImpactScope::Block)
    } else if changes > 100 {
        (Severity::Moderate, ImpactScope::Local)
    } else {
        (Severity::Minor, ImpactScope::Local)
    };
    ActivityImpact::new(severity, scope, changes)
        .affecting(operations.iter().map(|op| op.actor_id))
}

/// Collaboration service: the surface exposed to transports
pub struct CollabService {
    config: CollabConfig,
    gate: Arc<dyn AccessGate>,
    engine: MergeEngine,
    writer: Arc<PersistenceWriter>,
    loader: BatchLoader,
    documents: DashMap<DocumentId, SharedRuntime>,
    broadcaster: Arc<EventBroadcaster>,
    presence: Arc<PresenceTracker>,
    activity: ActivityLog,
    limiter: Arc<RateLimiter>,
}

impl CollabService {
    pub fn new(
        config: CollabConfig,
        gate: Arc<dyn AccessGate>,
        store: Arc<dyn PersistencePort>,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(
            config.broadcast.clone(),
            gate.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            config.presence.clone(),
            broadcaster.clone(),
        ));
        Self {
            engine: MergeEngine::new(config.engine.clone()),
            writer: Arc::new(PersistenceWriter::new(
                store.clone(),
                config.persistence.clone(),
            )),
            loader: BatchLoader::new(store),
            documents: DashMap::new(),
            limiter: Arc::new(RateLimiter::new(
                config.engine.ops_per_second,
                config.engine.burst,
            )),
            activity: ActivityLog::new(),
            broadcaster,
            presence,
            gate,
            config,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn writer(&self) -> &Arc<PersistenceWriter> {
        &self.writer
    }

    fn check(&self, actor: ActorId, document: DocumentId, capability: Capability) -> Result<()> {
        require(self.gate.as_ref(), actor, document, capability)
    }

    fn runtime(&self, document: DocumentId) -> Result<SharedRuntime> {
        self.documents
            .get(&document)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollabError::not_found("document", document))
    }

    /// Write token with a bounded wait, for versioning and merges
    async fn lock_bounded<'a>(
        &self,
        document: DocumentId,
        runtime: &'a Mutex<DocumentRuntime>,
    ) -> Result<MutexGuard<'a, DocumentRuntime>> {
        let attempts = self.config.engine.merge_retries + 1;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.engine.lock_timeout, runtime.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => warn!(
                    "Timed out waiting for document {} (attempt {}/{})",
                    document, attempt, attempts
                ),
            }
        }
        Err(CollabError::ConflictRetryExceeded(document))
    }

    fn emit_activity(&self, event: ActivityEvent) {
        let document = event.document_id;
        self.activity.append(event.clone());
        self.broadcaster
            .publish(document, None, CollabEvent::Activity(event));
    }

    fn publish_version(&self, version: &DocumentVersion) {
        self.broadcaster.publish(
            version.document_id,
            None,
            CollabEvent::Version(VersionEvent::from(version)),
        );
    }

    /// Create an empty document with its first version on a `main` branch
    pub async fn create_document(&self, owner: ActorId, new: NewDocument) -> Result<Document> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(CollabError::Validation("document name is empty".to_string()));
        }

        let document_id = DocumentId::new();
        let branch_id = BranchId::new();
        let state = DocumentState::new();
        let (history, version) =
            VersionHistory::bootstrap(document_id, branch_id, DEFAULT_BRANCH, owner, &state)?;
        let now = Utc::now();
        let document = Document {
            id: document_id,
            name,
            doc_type: new.doc_type,
            status: DocumentStatus::Draft,
            owner_id: owner,
            organization_id: new.organization_id,
            current_version_id: version.id,
            default_branch_id: branch_id,
            content: version.content.clone(),
            crdt: CrdtSummary::default(),
            permissions: PermissionSummary {
                owner_id: owner,
                organization_default: None,
            },
            sharing: new.sharing,
            created_at: now,
            updated_at: now,
        };
        let runtime = DocumentRuntime {
            document: document.clone(),
            history,
            replicas: HashMap::from([(branch_id, BranchReplica::new(state))]),
            comments: CommentBoard::new(),
        };

        let activity = ActivityEvent::new(
            document_id,
            owner,
            ActivityType::Document,
            "created",
            ("document", document_id.into()),
            ActivityImpact::new(Severity::Major, ImpactScope::Document, 0).affecting([owner]),
        );
        let rows = vec![
            runtime.document_row()?,
            runtime.branch_state_row(branch_id)?,
            version.to_row()?,
            runtime.history.branch(branch_id)?.to_row()?,
            activity.to_row()?,
        ];
        self.writer.write_strict(rows).await?;

        self.documents
            .insert(document_id, Arc::new(Mutex::new(runtime)));
        self.emit_activity(activity);
        info!("Created document {} ({})", document_id, document.name);
        Ok(document)
    }

    /// Apply a batch to the default branch with automatic conflict resolution
    pub async fn submit_operations(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        operations: Vec<Operation>,
        base_clock: &VectorClock,
    ) -> Result<MergeOutcome> {
        self.submit_to_branch(
            actor,
            document_id,
            operations,
            base_clock,
            SubmitOptions::default(),
        )
        .await
    }

    pub async fn submit_to_branch(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        operations: Vec<Operation>,
        base_clock: &VectorClock,
        options: SubmitOptions,
    ) -> Result<MergeOutcome> {
        self.check(actor, document_id, Capability::Edit)?;
        if let Some(foreign) = operations.iter().find(|op| op.actor_id != actor) {
            return Err(CollabError::Validation(format!(
                "operation {} was authored by {}, not {}",
                foreign.id, foreign.actor_id, actor
            )));
        }
        let cost = u32::try_from(operations.len().max(1)).unwrap_or(u32::MAX);
        self.limiter.check(actor, cost)?;

        let runtime = self.runtime(document_id)?;
        let mut guard = runtime.lock().await;
        let rt = &mut *guard;
        let branch_id = options.branch_id.unwrap_or(rt.default_branch());
        let resolutions = resolution_map(&options.resolutions);

        let replica = rt.replica_mut(branch_id)?;
        let report = self.engine.apply(
            replica,
            document_id,
            operations,
            base_clock,
            options.strategy,
            &resolutions,
        )?;
        let new_content = replica.state().content()?;
        let outcome = MergeOutcome {
            document_id,
            branch_id,
            accepted: report.accepted,
            new_checksum: new_content.checksum.clone(),
            new_content,
            vector_clock: replica.clock().clone(),
            applied_operations: report.applied,
            duplicates: report.duplicates,
            pending: report.pending,
            conflicts: report.conflicts,
        };

        if !outcome.accepted {
            debug!(
                "Batch from {} on document {} rejected with {} conflicts",
                actor,
                document_id,
                outcome.conflicts.len()
            );
            return Ok(outcome);
        }
        if outcome.applied_operations.is_empty() {
            return Ok(outcome);
        }

        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Content,
            "edited",
            ("branch", branch_id.into()),
            content_impact(&outcome.applied_operations),
        );
        let mut rows = vec![rt.branch_state_row(branch_id)?, activity.to_row()?];
        if branch_id == rt.default_branch() {
            rt.refresh_document()?;
            rows.push(rt.document_row()?);
        }
        self.writer.enqueue(rows);

        self.emit_activity(activity);
        self.broadcaster.publish(
            document_id,
            options.session_id,
            CollabEvent::Content(ContentEvent {
                branch_id,
                operations: outcome.applied_operations.clone(),
                vector_clock: outcome.vector_clock.clone(),
                checksum: outcome.new_checksum.clone(),
            }),
        );
        debug!(
            "Applied {} operations from {} to document {} branch {}",
            outcome.applied_operations.len(),
            actor,
            document_id,
            branch_id
        );
        Ok(outcome)
    }

    /// Snapshot a branch (default: the default branch) as a new version
    pub async fn create_version(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        branch: Option<BranchId>,
        is_major: bool,
    ) -> Result<Arc<DocumentVersion>> {
        self.check(actor, document_id, Capability::Edit)?;
        let runtime = self.runtime(document_id)?;
        let mut guard = self.lock_bounded(document_id, &runtime).await?;
        let rt = &mut *guard;
        let branch_id = branch.unwrap_or(rt.default_branch());

        let state = rt.replica(branch_id)?.state().clone();
        let version = rt.history.snapshot(SnapshotRequest {
            branch_id,
            author_id: actor,
            is_major,
            state: &state,
            merged_from: None,
        })?;
        if branch_id == rt.default_branch() {
            rt.document.current_version_id = version.id;
            rt.document.updated_at = Utc::now();
        }

        let stats = version.diff_stats;
        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Version,
            "version_created",
            ("version", version.id.into()),
            ActivityImpact::new(
                if is_major {
                    Severity::Major
                } else {
                    Severity::Moderate
                },
                ImpactScope::Document,
                stats.additions + stats.deletions + stats.modifications,
            ),
        );
        let rows = vec![
            version.to_row()?,
            rt.history.branch(branch_id)?.to_row()?,
            rt.document_row()?,
            activity.to_row()?,
        ];
        self.writer.enqueue(rows);

        self.emit_activity(activity);
        self.publish_version(&version);
        info!(
            "Created version {} ({}) of document {}",
            version.number, version.id, document_id
        );
        Ok(version)
    }

    /// Fork a branch at a version (default: head of the default branch)
    pub async fn create_branch(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        name: &str,
        from_version: Option<VersionId>,
    ) -> Result<DocumentBranch> {
        self.check(actor, document_id, Capability::Edit)?;
        let runtime = self.runtime(document_id)?;
        let mut guard = runtime.lock().await;
        let rt = &mut *guard;

        let from = match from_version {
            Some(id) => id,
            None => rt.history.head(rt.default_branch())?.id,
        };
        let version = rt.history.version(from)?;
        let branch = rt.history.create_branch(name, from, actor)?;
        rt.replicas
            .insert(branch.id, BranchReplica::new(version.state.clone()));

        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Branch,
            "branch_created",
            ("branch", branch.id.into()),
            ActivityImpact::new(Severity::Moderate, ImpactScope::Document, 0),
        );
        let rows = vec![
            branch.to_row()?,
            rt.branch_state_row(branch.id)?,
            rt.document_row()?,
            activity.to_row()?,
        ];
        self.writer.enqueue(rows);

        self.emit_activity(activity);
        info!(
            "Created branch {} ({}) of document {} at version {}",
            branch.name, branch.id, document_id, from
        );
        Ok(branch)
    }

    /// Merge the head of `source` into `target`.
    ///
    /// The merge is computed on a snapshot of the target outside the write
    /// token. If the target moved in the meantime the merge is recomputed once
    /// on the refreshed state before giving up.
    pub async fn merge_branches(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        source: BranchId,
        target: BranchId,
        strategy: MergeStrategy,
        resolutions: Vec<ConflictResolution>,
    ) -> Result<MergeResult> {
        self.check(actor, document_id, Capability::Edit)?;
        if source == target {
            return Err(CollabError::Validation(
                "cannot merge a branch into itself".to_string(),
            ));
        }
        let runtime = self.runtime(document_id)?;
        let resolutions = resolution_map(&resolutions);
        let attempts = self.config.engine.merge_retries + 1;

        for attempt in 1..=attempts {
            let (source_head, ancestor, target_replica, target_head) = {
                let guard = self.lock_bounded(document_id, &runtime).await?;
                let source_head = guard.history.head(source)?;
                let target_head = guard.history.head(target)?;
                let ancestor_id = guard
                    .history
                    .common_ancestor(source_head.id, target_head.id)
                    .ok_or_else(|| {
                        CollabError::Validation(format!(
                            "branches {} and {} share no history",
                            source, target
                        ))
                    })?;
                let ancestor = guard.history.version(ancestor_id)?;
                let replica = guard.replica(target)?.clone();
                (source_head, ancestor, replica, target_head.id)
            };
            let snapshot_revision = target_replica.revision();
            let plan = plan_merge(
                &self.engine,
                document_id,
                &source_head,
                &ancestor,
                target_replica,
                strategy,
                &resolutions,
            )?;

            let mut guard = self.lock_bounded(document_id, &runtime).await?;
            let moved = guard.history.branch(target)?.head_version_id != target_head
                || guard.replica(target)?.revision() != snapshot_revision
                || guard.history.branch(source)?.head_version_id != source_head.id;
            if moved {
                warn!(
                    "Branch moved while merging {} into {} (attempt {}/{})",
                    source, target, attempt, attempts
                );
                continue;
            }
            return self.finish_merge(&mut guard, actor, source, target, plan);
        }
        Err(CollabError::ConflictRetryExceeded(document_id))
    }

    fn finish_merge(
        &self,
        rt: &mut DocumentRuntime,
        actor: ActorId,
        source: BranchId,
        target: BranchId,
        plan: MergePlan,
    ) -> Result<MergeResult> {
        let document_id = rt.document.id;
        let MergePlan {
            ancestor,
            source_head,
            replica,
            report,
        } = plan;
        let mut result = MergeResult {
            merge_id: MergeId::new(),
            document_id,
            source_branch: source,
            target_branch: target,
            success: report.accepted,
            common_ancestor_version_id: ancestor,
            applied_operations: Vec::new(),
            conflicts: Vec::new(),
            conflict_count: 0,
            new_head_version_id: None,
        };

        if !report.accepted {
            result.conflicts = report.unresolved();
            result.conflict_count = result.conflicts.len();
            info!(
                "Merge of {} into {} left {} conflicts unresolved",
                source, target, result.conflict_count
            );
            return Ok(result);
        }
        result.applied_operations = report.applied.iter().map(|op| op.id).collect();
        result.conflict_count = report.conflicts.len();
        result.conflicts = report.conflicts;
        if report.applied.is_empty() {
            debug!("Merge of {} into {} had nothing to apply", source, target);
            return Ok(result);
        }

        *rt.replica_mut(target)? = replica;
        let state = rt.replica(target)?.state().clone();
        let version = rt.history.snapshot(SnapshotRequest {
            branch_id: target,
            author_id: actor,
            is_major: false,
            state: &state,
            merged_from: Some(source_head),
        })?;
        if target == rt.default_branch() {
            rt.refresh_document()?;
            rt.document.current_version_id = version.id;
        }
        result.new_head_version_id = Some(version.id);

        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Branch,
            "merged",
            ("branch", target.into()),
            ActivityImpact::new(
                Severity::Major,
                ImpactScope::Document,
                report.applied.len() as u64,
            )
            .affecting(report.applied.iter().map(|op| op.actor_id)),
        );
        let rows = vec![
            version.to_row()?,
            rt.history.branch(target)?.to_row()?,
            rt.branch_state_row(target)?,
            rt.document_row()?,
            activity.to_row()?,
        ];
        self.writer.enqueue(rows);

        self.emit_activity(activity);
        self.broadcaster.publish(
            document_id,
            None,
            CollabEvent::Content(ContentEvent {
                branch_id: target,
                operations: report.applied,
                vector_clock: state.clock().clone(),
                checksum: version.checksum.clone(),
            }),
        );
        self.publish_version(&version);
        info!(
            "Merged {} into {} on document {}: {} operations, {} conflicts",
            source,
            target,
            document_id,
            result.applied_operations.len(),
            result.conflict_count
        );
        Ok(result)
    }

    pub fn join_document(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        connection: ConnectionInfo,
    ) -> Result<PresenceSession> {
        self.check(actor, document_id, Capability::View)?;
        self.runtime(document_id)?;
        Ok(self.presence.join(actor, document_id, connection))
    }

    pub fn update_presence(
        &self,
        session_id: SessionId,
        update: PresenceUpdate,
    ) -> Result<PresenceSession> {
        let session = self
            .presence
            .get(session_id)
            .ok_or_else(|| CollabError::not_found("presence session", session_id))?;
        self.check(session.user_id, session.document_id, Capability::View)?;
        self.presence.update(session_id, update)
    }

    pub fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        self.presence.heartbeat(session_id)
    }

    pub fn leave_document(&self, session_id: SessionId) -> Result<PresenceSession> {
        let session = self.presence.leave(session_id)?;
        if !self.presence.has_sessions(session.user_id) {
            self.limiter.forget(session.user_id);
        }
        Ok(session)
    }

    pub fn sessions(&self, actor: ActorId, document_id: DocumentId) -> Result<Vec<PresenceSession>> {
        self.check(actor, document_id, Capability::View)?;
        Ok(self.presence.sessions(document_id))
    }

    /// Add a comment or reply. Persisted before it becomes visible.
    pub async fn add_comment(
        &self,
        actor: ActorId,
        new: NewComment,
        origin: Option<SessionId>,
    ) -> Result<Comment> {
        let document_id = new.document_id;
        self.check(actor, document_id, Capability::Comment)?;
        let runtime = self.runtime(document_id)?;
        let mut guard = runtime.lock().await;
        let rt = &mut *guard;
        if !rt.document.sharing.allow_comments {
            return Err(CollabError::Validation(format!(
                "comments are disabled on document {}",
                document_id
            )));
        }

        let planned = rt
            .comments
            .plan_add(actor, new, &rt.document.content, Utc::now())?;
        let comment = planned
            .first()
            .cloned()
            .ok_or_else(|| CollabError::Validation("empty comment plan".to_string()))?;
        let mut board = rt.comments.clone();
        board.commit(planned.clone());

        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Comment,
            if comment.is_root() {
                "comment_added"
            } else {
                "reply_added"
            },
            ("comment", comment.id.into()),
            ActivityImpact::new(Severity::Minor, ImpactScope::Block, 1)
                .affecting(planned.iter().map(|c| c.author_id)),
        );
        let mut rows = planned
            .iter()
            .map(|c| c.to_row())
            .collect::<Result<Vec<_>>>()?;
        rows.push(rt.record(&board).to_row()?);
        rows.push(activity.to_row()?);
        self.writer.write_strict(rows).await?;

        rt.comments = board;
        self.emit_activity(activity);
        self.broadcaster.publish(
            document_id,
            origin,
            CollabEvent::Comment(CommentEvent {
                change: CommentChange::Added,
                comments: planned,
            }),
        );
        Ok(comment)
    }

    /// Resolve a comment, or with `resolve_thread` its whole thread in one
    /// atomic write. Returns every comment that changed.
    pub async fn resolve_comment(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        comment_id: CommentId,
        resolution: Option<String>,
        resolve_thread: bool,
        origin: Option<SessionId>,
    ) -> Result<Vec<Comment>> {
        self.check(actor, document_id, Capability::Comment)?;
        let runtime = self.runtime(document_id)?;
        let mut guard = runtime.lock().await;
        let changed = guard.comments.plan_resolve(
            actor,
            comment_id,
            resolution,
            resolve_thread,
            Utc::now(),
        )?;
        self.commit_comments(
            &mut guard,
            actor,
            changed,
            CommentChange::Resolved,
            origin,
        )
        .await
    }

    pub async fn reopen_comment(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        comment_id: CommentId,
        origin: Option<SessionId>,
    ) -> Result<Vec<Comment>> {
        self.check(actor, document_id, Capability::Comment)?;
        let runtime = self.runtime(document_id)?;
        let mut guard = runtime.lock().await;
        let changed = guard.comments.plan_reopen(comment_id, Utc::now())?;
        self.commit_comments(
            &mut guard,
            actor,
            changed,
            CommentChange::Reopened,
            origin,
        )
        .await
    }

    async fn commit_comments(
        &self,
        rt: &mut DocumentRuntime,
        actor: ActorId,
        changed: Vec<Comment>,
        change: CommentChange,
        origin: Option<SessionId>,
    ) -> Result<Vec<Comment>> {
        let document_id = rt.document.id;
        if changed.is_empty() {
            return Ok(changed);
        }
        let thread_id = changed[0].thread_id;
        let activity = ActivityEvent::new(
            document_id,
            actor,
            ActivityType::Comment,
            match change {
                CommentChange::Added => "comment_added",
                CommentChange::Resolved => "comment_resolved",
                CommentChange::Reopened => "comment_reopened",
            },
            ("thread", thread_id.into()),
            ActivityImpact::new(Severity::Minor, ImpactScope::Block, changed.len() as u64)
                .affecting(changed.iter().map(|c| c.author_id)),
        );
        let mut rows = changed
            .iter()
            .map(|c| c.to_row())
            .collect::<Result<Vec<_>>>()?;
        rows.push(activity.to_row()?);
        self.writer.write_strict(rows).await?;

        rt.comments.commit(changed.clone());
        self.emit_activity(activity);
        self.broadcaster.publish(
            document_id,
            origin,
            CollabEvent::Comment(CommentEvent {
                change,
                comments: changed.clone(),
            }),
        );
        Ok(changed)
    }

    pub async fn thread(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        thread_id: ThreadId,
    ) -> Result<Vec<Comment>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        guard.comments.thread(thread_id)
    }

    pub async fn comments(&self, actor: ActorId, document_id: DocumentId) -> Result<Vec<Comment>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        Ok(guard.comments.comments())
    }

    /// Subscribe to a document's events; requires VIEW now and on every delivery
    pub fn subscribe(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.runtime(document_id)?;
        self.broadcaster.subscribe(actor, document_id, options)
    }

    pub async fn document_snapshot(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        branch: Option<BranchId>,
    ) -> Result<DocumentSnapshot> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        let branch_id = branch.unwrap_or(guard.default_branch());
        let replica = guard.replica(branch_id)?;
        Ok(DocumentSnapshot {
            document: guard.document.clone(),
            branch_id,
            content: replica.state().content()?,
            vector_clock: replica.clock().clone(),
            head_version_id: guard.history.branch(branch_id)?.head_version_id,
            pending: replica.pending_ids(),
            sessions: self.presence.sessions(document_id),
        })
    }

    /// Visible element ids of a block in reading order, for building anchors
    pub async fn block_positions(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        branch: Option<BranchId>,
        block: BlockId,
    ) -> Result<Vec<PositionId>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        let branch_id = branch.unwrap_or(guard.default_branch());
        guard
            .replica(branch_id)?
            .state()
            .visible_positions(block)
            .ok_or_else(|| CollabError::StalePosition(format!("block {} is not visible", block)))
    }

    pub async fn list_versions(
        &self,
        actor: ActorId,
        document_id: DocumentId,
    ) -> Result<Vec<Arc<DocumentVersion>>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        Ok(guard.history.versions())
    }

    pub async fn get_version(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        version_id: VersionId,
    ) -> Result<Arc<DocumentVersion>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        guard.history.version(version_id)
    }

    pub async fn list_branches(
        &self,
        actor: ActorId,
        document_id: DocumentId,
    ) -> Result<Vec<DocumentBranch>> {
        self.check(actor, document_id, Capability::View)?;
        let runtime = self.runtime(document_id)?;
        let guard = runtime.lock().await;
        Ok(guard.history.branches())
    }

    pub fn recent_activity(
        &self,
        actor: ActorId,
        document_id: DocumentId,
        limit: usize,
    ) -> Result<Vec<ActivityEvent>> {
        self.check(actor, document_id, Capability::View)?;
        Ok(self.activity.recent(document_id, limit))
    }

    /// Hydrate a document from persistence with one batched load per entity kind
    pub async fn load_document(&self, actor: ActorId, document_id: DocumentId) -> Result<Document> {
        self.check(actor, document_id, Capability::View)?;
        if let Ok(runtime) = self.runtime(document_id) {
            return Ok(runtime.lock().await.document.clone());
        }

        let record: DocumentRecord = self.loader.load_one(document_id.into()).await?;
        let version_ids: Vec<Uuid> = record.version_ids.iter().map(|id| (*id).into()).collect();
        let branch_ids: Vec<Uuid> = record.branch_ids.iter().map(|id| (*id).into()).collect();
        let comment_ids: Vec<Uuid> = record.comment_ids.iter().map(|id| (*id).into()).collect();

        let versions: Vec<DocumentVersion> = self.loader.load_all(&version_ids).await?;
        let branches: Vec<DocumentBranch> = self.loader.load_all(&branch_ids).await?;
        let states: Vec<BranchStateRecord> = self.loader.load_all(&branch_ids).await?;
        let comments: Vec<Comment> = self.loader.load_all(&comment_ids).await?;

        let foreign = versions
            .iter()
            .map(|v| v.document_id)
            .chain(branches.iter().map(|b| b.document_id))
            .chain(states.iter().map(|s| s.document_id))
            .chain(comments.iter().map(|c| c.document_id))
            .any(|owner| owner != document_id);
        if foreign {
            return Err(CollabError::Validation(format!(
                "document {} references records of another document",
                document_id
            )));
        }

        let history = VersionHistory::restore(document_id, versions, branches);
        history.version(record.document.current_version_id)?;
        for branch in &record.branch_ids {
            history.branch(*branch)?;
        }
        let runtime = DocumentRuntime {
            document: record.document,
            history,
            replicas: states
                .into_iter()
                .map(|b| (b.branch_id, BranchReplica::new(b.state)))
                .collect(),
            comments: CommentBoard::restore(comments),
        };

        let runtime = self
            .documents
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(runtime)))
            .value()
            .clone();
        info!("Loaded document {} from persistence", document_id);
        let document = runtime.lock().await.document.clone();
        Ok(document)
    }

    /// Retry persistence writes that exhausted their retries earlier
    pub async fn flush_dirty(&self) -> Result<usize> {
        self.writer.flush_dirty().await
    }

    /// Periodic presence sweep, which also drops refilled rate-limit buckets
    pub fn spawn_presence_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        self.presence.spawn_sweeper(cancel, move |report| {
            let dropped = limiter.prune_refilled();
            if !report.pruned.is_empty() || dropped > 0 {
                debug!(
                    "Presence sweep pruned {} sessions and {} rate buckets",
                    report.pruned.len(),
                    dropped
                );
            }
        })
    }
}
