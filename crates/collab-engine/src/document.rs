/// Document metadata and its materialized content
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    ActorId, BlockId, BlockKind, BranchId, Capability, DocumentId, OrganizationId, Result,
    VectorClock, VersionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Active,
    Archived,
}

/// Visible block as seen by readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    pub text: String,
    pub marks: Vec<Mark>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Formatting run over `[start, end)` character offsets of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub start: u32,
    pub end: u32,
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    BlocksJson,
}

/// Materialized document content with its checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub format: ContentFormat,
    /// Serialized block list, the exact bytes the checksum covers
    pub data: String,
    pub blocks: Vec<Block>,
    /// Hex-encoded SHA-256 of `data`
    pub checksum: String,
}

impl DocumentContent {
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        let data = serde_json::to_string(&blocks)?;
        let checksum = hex::encode(Sha256::digest(data.as_bytes()));
        Ok(Self {
            format: ContentFormat::BlocksJson,
            data,
            blocks,
            checksum,
        })
    }

    pub fn empty() -> Self {
        let data = "[]".to_string();
        let checksum = hex::encode(Sha256::digest(data.as_bytes()));
        Self {
            format: ContentFormat::BlocksJson,
            data,
            blocks: Vec::new(),
            checksum,
        }
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == id)
    }

    /// Plain text of every block joined by newlines
    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for DocumentContent {
    fn default() -> Self {
        Self::empty()
    }
}

/// Summary of the live CRDT state of the default branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtSummary {
    pub vector_clock: VectorClock,
    pub operation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSummary {
    pub owner_id: ActorId,
    /// Capability granted to organization members without an explicit grant
    pub organization_default: Option<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingConfig {
    /// Capability granted to anyone holding the share link
    pub link_access: Option<Capability>,
    pub allow_comments: bool,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            link_access: None,
            allow_comments: true,
        }
    }
}

/// Collaborative document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub doc_type: String,
    pub status: DocumentStatus,
    pub owner_id: ActorId,
    pub organization_id: OrganizationId,
    pub current_version_id: VersionId,
    pub default_branch_id: BranchId,
    pub content: DocumentContent,
    pub crdt: CrdtSummary,
    pub permissions: PermissionSummary,
    pub sharing: SharingConfig,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Parameters for creating a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub name: String,
    pub doc_type: String,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub sharing: SharingConfig,
}

impl NewDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc_type: "document".to_string(),
            organization_id: OrganizationId::new(),
            sharing: SharingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_tracks_content() {
        let block = Block {
            id: BlockId::new(),
            kind: BlockKind::Paragraph,
            text: "hello".to_string(),
            marks: Vec::new(),
        };
        let first = DocumentContent::from_blocks(vec![block.clone()]).unwrap();
        let same = DocumentContent::from_blocks(vec![block.clone()]).unwrap();
        assert_eq!(first.checksum, same.checksum);

        let mut edited = block;
        edited.text.push('!');
        let changed = DocumentContent::from_blocks(vec![edited]).unwrap();
        assert_ne!(first.checksum, changed.checksum);
        assert_eq!(first.checksum.len(), 64);
    }

    #[test]
    fn test_empty_matches_empty_block_list() {
        let built = DocumentContent::from_blocks(Vec::new()).unwrap();
        assert_eq!(built, DocumentContent::empty());
    }
}
