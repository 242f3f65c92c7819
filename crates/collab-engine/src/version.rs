/// Version history and branches
///
/// Versions are immutable snapshots shared behind `Arc`; only a branch's
/// head pointer moves. Merges find the lowest common ancestor over the
/// version DAG (parents and merge parents) and replay the source delta.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::{
    ActorId, ApplyReport, BranchId, BranchReplica, CollabError, ConflictInfo, DocumentContent,
    DocumentId, DocumentState, MergeEngine, MergeId, MergeStrategy, OperationId, ResolutionMap,
    Result, VersionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
}

impl VersionNumber {
    pub const INITIAL: VersionNumber = VersionNumber { major: 1, minor: 0 };

    pub fn next(&self, is_major: bool) -> Self {
        if is_major {
            Self {
                major: self.major + 1,
                minor: 0,
            }
        } else {
            Self {
                major: self.major,
                minor: self.minor + 1,
            }
        }
    }
}

impl std::fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Size of the change between a version and its parent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Characters and blocks that became visible
    pub additions: u64,
    /// Characters and blocks that stopped being visible
    pub deletions: u64,
    /// Blocks present on both sides whose kind, text or formatting changed
    pub modifications: u64,
}

impl DiffStats {
    pub fn between(
        parent: &DocumentState,
        parent_content: &DocumentContent,
        current: &DocumentState,
        current_content: &DocumentContent,
    ) -> Self {
        let before = parent.visible_elements();
        let after = current.visible_elements();

        let old_blocks: HashMap<_, _> = parent_content.blocks.iter().map(|b| (b.id, b)).collect();
        let old_ids: HashSet<_> = old_blocks.keys().copied().collect();
        let new_ids: HashSet<_> = current_content.blocks.iter().map(|b| b.id).collect();

        let added_blocks = new_ids.difference(&old_ids).count();
        let removed_blocks = old_ids.difference(&new_ids).count();
        let modifications = current_content
            .blocks
            .iter()
            .filter(|block| {
                old_blocks
                    .get(&block.id)
                    .map(|old| *old != *block)
                    .unwrap_or(false)
            })
            .count();

        Self {
            additions: (after.difference(&before).count() + added_blocks) as u64,
            deletions: (before.difference(&after).count() + removed_blocks) as u64,
            modifications: modifications as u64,
        }
    }
}

/// Immutable snapshot of a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: VersionId,
    pub document_id: DocumentId,
    pub number: VersionNumber,
    pub author_id: ActorId,
    pub parent_version_id: Option<VersionId>,
    /// Second parent when this version records a branch merge
    pub merged_from_version_id: Option<VersionId>,
    pub branch_id: BranchId,
    pub content: DocumentContent,
    pub state: DocumentState,
    pub checksum: String,
    pub diff_stats: DiffStats,
    pub is_major: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBranch {
    pub id: BranchId,
    pub document_id: DocumentId,
    pub name: String,
    pub base_version_id: VersionId,
    pub head_version_id: VersionId,
    pub created_by: ActorId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result of merging one branch into another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub merge_id: MergeId,
    pub document_id: DocumentId,
    pub source_branch: BranchId,
    pub target_branch: BranchId,
    pub success: bool,
    pub common_ancestor_version_id: VersionId,
    pub applied_operations: Vec<OperationId>,
    /// All conflicts on success; only the unresolved ones on failure
    pub conflicts: Vec<ConflictInfo>,
    pub conflict_count: usize,
    pub new_head_version_id: Option<VersionId>,
}

/// Inputs for a new snapshot
pub struct SnapshotRequest<'a> {
    pub branch_id: BranchId,
    pub author_id: ActorId,
    pub is_major: bool,
    pub state: &'a DocumentState,
    pub merged_from: Option<VersionId>,
}

/// Version DAG and branch table of one document
#[derive(Debug, Clone)]
pub struct VersionHistory {
    document_id: DocumentId,
    versions: HashMap<VersionId, Arc<DocumentVersion>>,
    branches: HashMap<BranchId, DocumentBranch>,
    latest: VersionNumber,
}

impl VersionHistory {
    /// Start a history with its first version on a fresh default branch
    pub fn bootstrap(
        document_id: DocumentId,
        branch_id: BranchId,
        branch_name: &str,
        author_id: ActorId,
        state: &DocumentState,
    ) -> Result<(Self, Arc<DocumentVersion>)> {
        let content = state.content()?;
        let now = chrono::Utc::now();
        let version = Arc::new(DocumentVersion {
            id: VersionId::new(),
            document_id,
            number: VersionNumber::INITIAL,
            author_id,
            parent_version_id: None,
            merged_from_version_id: None,
            branch_id,
            checksum: content.checksum.clone(),
            content,
            state: state.clone(),
            diff_stats: DiffStats::default(),
            is_major: true,
            created_at: now,
        });
        let branch = DocumentBranch {
            id: branch_id,
            document_id,
            name: branch_name.to_string(),
            base_version_id: version.id,
            head_version_id: version.id,
            created_by: author_id,
            created_at: now,
        };

        let mut history = Self::restore(document_id, Vec::new(), Vec::new());
        history.versions.insert(version.id, version.clone());
        history.branches.insert(branch_id, branch);
        history.latest = VersionNumber::INITIAL;
        Ok((history, version))
    }

    /// Rebuild from persisted versions and branches
    pub fn restore(
        document_id: DocumentId,
        versions: Vec<DocumentVersion>,
        branches: Vec<DocumentBranch>,
    ) -> Self {
        let latest = versions
            .iter()
            .map(|version| version.number)
            .max()
            .unwrap_or(VersionNumber::INITIAL);
        Self {
            document_id,
            versions: versions
                .into_iter()
                .map(|version| (version.id, Arc::new(version)))
                .collect(),
            branches: branches
                .into_iter()
                .map(|branch| (branch.id, branch))
                .collect(),
            latest,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn latest_number(&self) -> VersionNumber {
        self.latest
    }

    pub fn version(&self, id: VersionId) -> Result<Arc<DocumentVersion>> {
        self.versions
            .get(&id)
            .cloned()
            .ok_or_else(|| CollabError::not_found("version", id))
    }

    /// All versions ordered by number
    pub fn versions(&self) -> Vec<Arc<DocumentVersion>> {
        let mut versions: Vec<_> = self.versions.values().cloned().collect();
        versions.sort_by_key(|version| (version.number, version.created_at));
        versions
    }

    pub fn branch(&self, id: BranchId) -> Result<&DocumentBranch> {
        self.branches
            .get(&id)
            .ok_or_else(|| CollabError::not_found("branch", id))
    }

    pub fn branches(&self) -> Vec<DocumentBranch> {
        let mut branches: Vec<_> = self.branches.values().cloned().collect();
        branches.sort_by_key(|branch| branch.created_at);
        branches
    }

    pub fn head(&self, branch: BranchId) -> Result<Arc<DocumentVersion>> {
        self.version(self.branch(branch)?.head_version_id)
    }

    /// Snapshot a branch's state as its new head
    pub fn snapshot(&mut self, request: SnapshotRequest<'_>) -> Result<Arc<DocumentVersion>> {
        let parent = self.head(request.branch_id)?;
        let content = request.state.content()?;
        let diff_stats = DiffStats::between(&parent.state, &parent.content, request.state, &content);
        let number = self.latest.next(request.is_major);

        let version = Arc::new(DocumentVersion {
            id: VersionId::new(),
            document_id: self.document_id,
            number,
            author_id: request.author_id,
            parent_version_id: Some(parent.id),
            merged_from_version_id: request.merged_from,
            branch_id: request.branch_id,
            checksum: content.checksum.clone(),
            content,
            state: request.state.clone(),
            diff_stats,
            is_major: request.is_major,
            created_at: chrono::Utc::now(),
        });

        self.versions.insert(version.id, version.clone());
        self.latest = number;
        if let Some(branch) = self.branches.get_mut(&request.branch_id) {
            branch.head_version_id = version.id;
        }
        Ok(version)
    }

    /// Fork a branch at an existing version
    pub fn create_branch(
        &mut self,
        name: &str,
        from_version: VersionId,
        created_by: ActorId,
    ) -> Result<DocumentBranch> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CollabError::Validation("branch name is empty".to_string()));
        }
        if self.branches.values().any(|branch| branch.name == name) {
            return Err(CollabError::Validation(format!(
                "branch {name:?} already exists"
            )));
        }
        self.version(from_version)?;

        let branch = DocumentBranch {
            id: BranchId::new(),
            document_id: self.document_id,
            name: name.to_string(),
            base_version_id: from_version,
            head_version_id: from_version,
            created_by,
            created_at: chrono::Utc::now(),
        };
        self.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    fn parents(&self, id: VersionId) -> impl Iterator<Item = VersionId> + '_ {
        self.versions.get(&id).into_iter().flat_map(|version| {
            version
                .parent_version_id
                .into_iter()
                .chain(version.merged_from_version_id)
        })
    }

    fn ancestors(&self, start: VersionId) -> HashMap<VersionId, usize> {
        let mut seen = HashMap::new();
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((id, depth)) = queue.pop_front() {
            if seen.contains_key(&id) {
                continue;
            }
            seen.insert(id, depth);
            for parent in self.parents(id) {
                queue.push_back((parent, depth + 1));
            }
        }
        seen
    }

    /// Lowest common ancestor of two versions, nearest to `b` first
    pub fn common_ancestor(&self, a: VersionId, b: VersionId) -> Option<VersionId> {
        let of_a = self.ancestors(a);
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if of_a.contains_key(&id) {
                return Some(id);
            }
            queue.extend(self.parents(id));
        }
        None
    }
}

/// A merge computed against a snapshot of the target branch
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub ancestor: VersionId,
    pub source_head: VersionId,
    pub replica: BranchReplica,
    pub report: ApplyReport,
}

/// Replay the source delta since the common ancestor onto a copy of the target
pub fn plan_merge(
    engine: &MergeEngine,
    document_id: DocumentId,
    source_head: &DocumentVersion,
    ancestor: &DocumentVersion,
    mut target: BranchReplica,
    strategy: MergeStrategy,
    resolutions: &ResolutionMap,
) -> Result<MergePlan> {
    let delta: Vec<_> = source_head
        .state
        .operations_since(ancestor.state.clock())
        .into_iter()
        .map(|logged| logged.operation.clone())
        .collect();
    let report = engine.replay(&mut target, document_id, delta, strategy, resolutions)?;
    Ok(MergePlan {
        ancestor: ancestor.id,
        source_head: source_head.id,
        replica: target,
        report,
    })
}
