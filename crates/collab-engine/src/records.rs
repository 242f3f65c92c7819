/// Typed records at the persistence boundary
///
/// Rows are validated here on the way in and on the way out; nothing past this
/// module sees raw payload bytes.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ActivityEvent, BranchId, CollabError, Comment, CommentId, Document, DocumentBranch,
    DocumentId, DocumentState, DocumentVersion, EntityKind, Result, StoredRow, VersionId,
};

pub trait Record: Serialize + DeserializeOwned + Sized {
    const KIND: EntityKind;
    const ENTITY: &'static str;

    fn record_id(&self) -> Uuid;

    fn document_id(&self) -> DocumentId;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn to_row(&self) -> Result<StoredRow> {
        self.validate()?;
        Ok(StoredRow {
            kind: Self::KIND,
            id: self.record_id(),
            document_id: self.document_id().into(),
            payload: bincode::serialize(self)?,
            updated_at: chrono::Utc::now(),
        })
    }

    fn from_row(row: &StoredRow) -> Result<Self> {
        if row.kind != Self::KIND {
            return Err(CollabError::Serialization(format!(
                "expected a {:?} row, got {:?}",
                Self::KIND,
                row.kind
            )));
        }
        let record: Self = bincode::deserialize(&row.payload)?;
        if record.record_id() != row.id {
            return Err(CollabError::Serialization(format!(
                "{} row {} holds record {}",
                Self::ENTITY,
                row.id,
                record.record_id()
            )));
        }
        record.validate()?;
        Ok(record)
    }
}

/// Live state of one branch, stored in its own row so an edit rewrites only
/// the branch it touched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStateRecord {
    pub document_id: DocumentId,
    pub branch_id: BranchId,
    pub state: DocumentState,
}

impl Record for BranchStateRecord {
    const KIND: EntityKind = EntityKind::BranchState;
    const ENTITY: &'static str = "branch state";

    fn record_id(&self) -> Uuid {
        self.branch_id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document_id
    }
}

/// Document row: metadata and child record ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document: Document,
    pub branch_ids: Vec<BranchId>,
    pub version_ids: Vec<VersionId>,
    pub comment_ids: Vec<CommentId>,
}

impl Record for DocumentRecord {
    const KIND: EntityKind = EntityKind::Document;
    const ENTITY: &'static str = "document";

    fn record_id(&self) -> Uuid {
        self.document.id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document.id
    }

    fn validate(&self) -> Result<()> {
        if self.document.name.trim().is_empty() {
            return Err(CollabError::Validation("document name is empty".to_string()));
        }
        if !self.branch_ids.contains(&self.document.default_branch_id) {
            return Err(CollabError::Validation(format!(
                "document {} has no state for its default branch",
                self.document.id
            )));
        }
        if !self.version_ids.contains(&self.document.current_version_id) {
            return Err(CollabError::Validation(format!(
                "document {} does not list its current version",
                self.document.id
            )));
        }
        Ok(())
    }
}

impl Record for DocumentVersion {
    const KIND: EntityKind = EntityKind::Version;
    const ENTITY: &'static str = "version";

    fn record_id(&self) -> Uuid {
        self.id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The snapshot must still materialize to the recorded checksum
    fn validate(&self) -> Result<()> {
        let content = self.state.content()?;
        if content.checksum != self.checksum || self.content.checksum != self.checksum {
            return Err(CollabError::Validation(format!(
                "version {} checksum mismatch",
                self.id
            )));
        }
        Ok(())
    }
}

impl Record for DocumentBranch {
    const KIND: EntityKind = EntityKind::Branch;
    const ENTITY: &'static str = "branch";

    fn record_id(&self) -> Uuid {
        self.id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CollabError::Validation("branch name is empty".to_string()));
        }
        Ok(())
    }
}

impl Record for Comment {
    const KIND: EntityKind = EntityKind::Comment;
    const ENTITY: &'static str = "comment";

    fn record_id(&self) -> Uuid {
        self.id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn validate(&self) -> Result<()> {
        self.check_consistency()
    }
}

impl Record for ActivityEvent {
    const KIND: EntityKind = EntityKind::Activity;
    const ENTITY: &'static str = "activity event";

    fn record_id(&self) -> Uuid {
        self.id.into()
    }

    fn document_id(&self) -> DocumentId {
        self.document_id
    }
}
