/// Threaded, anchored comments with a resolution workflow
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    ActorId, BlockId, CollabError, CommentId, DocumentContent, DocumentId, Result, ThreadId,
};

const MAX_BODY_CHARS: usize = 10_000;

/// Text range a comment is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub block_id: BlockId,
    /// Character offsets into the block text, `start <= end`
    pub start: u32,
    pub end: u32,
}

impl CommentAnchor {
    /// Check the anchor against current content
    pub fn check(&self, content: &DocumentContent) -> Result<()> {
        let block = content.block(self.block_id).ok_or_else(|| {
            CollabError::StalePosition(format!("block {} no longer exists", self.block_id))
        })?;
        if self.start > self.end || self.end as usize > block.len() {
            return Err(CollabError::StalePosition(format!(
                "range {}..{} outside block {} of length {}",
                self.start,
                self.end,
                self.block_id,
                block.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub document_id: DocumentId,
    pub thread_id: ThreadId,
    pub author_id: ActorId,
    /// None for the root of a thread
    pub parent_comment_id: Option<CommentId>,
    pub anchor: Option<CommentAnchor>,
    pub body: String,
    pub status: CommentStatus,
    pub is_resolved: bool,
    pub resolved_by: Option<ActorId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    /// Direct replies
    pub reply_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_comment_id.is_none()
    }

    pub(crate) fn check_consistency(&self) -> Result<()> {
        check_body(&self.body)?;
        let resolved = self.status == CommentStatus::Resolved;
        if resolved != self.is_resolved
            || resolved != self.resolved_by.is_some()
            || resolved != self.resolved_at.is_some()
        {
            return Err(CollabError::Validation(format!(
                "comment {} has inconsistent resolution fields",
                self.id
            )));
        }
        if let Some(anchor) = self.anchor {
            if anchor.start > anchor.end {
                return Err(CollabError::Validation(format!(
                    "comment {} has an inverted anchor",
                    self.id
                )));
            }
        }
        Ok(())
    }

    fn mark_resolved(&mut self, actor: ActorId, resolution: Option<String>, now: DateTime<Utc>) {
        self.status = CommentStatus::Resolved;
        self.is_resolved = true;
        self.resolved_by = Some(actor);
        self.resolved_at = Some(now);
        self.resolution = resolution;
        self.updated_at = now;
    }

    fn mark_open(&mut self, now: DateTime<Utc>) {
        self.status = CommentStatus::Open;
        self.is_resolved = false;
        self.resolved_by = None;
        self.resolved_at = None;
        self.resolution = None;
        self.updated_at = now;
    }
}

fn check_body(body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(CollabError::Validation("comment body is empty".to_string()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(CollabError::Validation(format!(
            "comment body exceeds {} characters",
            MAX_BODY_CHARS
        )));
    }
    Ok(())
}

/// Input for a new comment or reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub document_id: DocumentId,
    /// Ignored for replies, which inherit the thread anchor
    pub anchor: Option<CommentAnchor>,
    pub body: String,
    pub parent_comment_id: Option<CommentId>,
}

/// Comments of one document grouped by thread.
///
/// Mutations are planned first and committed once the changed records are
/// persisted, so a failed write leaves the board untouched.
#[derive(Debug, Clone, Default)]
pub struct CommentBoard {
    comments: HashMap<CommentId, Comment>,
    /// Root first, then replies in creation order
    threads: HashMap<ThreadId, Vec<CommentId>>,
}

impl CommentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(comments: Vec<Comment>) -> Self {
        let mut comments = comments;
        comments.sort_by_key(|c| (!c.is_root(), c.created_at));
        let mut board = Self::new();
        board.commit(comments);
        board
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn ids(&self) -> Vec<CommentId> {
        self.comments().into_iter().map(|c| c.id).collect()
    }

    pub fn get(&self, id: CommentId) -> Result<&Comment> {
        self.comments
            .get(&id)
            .ok_or_else(|| CollabError::not_found("comment", id))
    }

    pub fn thread(&self, thread_id: ThreadId) -> Result<Vec<Comment>> {
        let ids = self
            .threads
            .get(&thread_id)
            .ok_or_else(|| CollabError::not_found("thread", thread_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| self.comments.get(id).cloned())
            .collect())
    }

    /// Every comment ordered by creation
    pub fn comments(&self) -> Vec<Comment> {
        let mut comments: Vec<_> = self.comments.values().cloned().collect();
        comments.sort_by_key(|c| (c.created_at, c.id));
        comments
    }

    fn root_of(&self, thread_id: ThreadId) -> Result<&Comment> {
        let root = self
            .threads
            .get(&thread_id)
            .and_then(|ids| ids.first())
            .ok_or_else(|| CollabError::not_found("thread", thread_id))?;
        self.get(*root)
    }

    /// New comment plus its updated parent, if any
    pub fn plan_add(
        &self,
        author_id: ActorId,
        new: NewComment,
        content: &DocumentContent,
        now: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        check_body(&new.body)?;

        let mut comment = Comment {
            id: CommentId::new(),
            document_id: new.document_id,
            thread_id: ThreadId::new(),
            author_id,
            parent_comment_id: new.parent_comment_id,
            anchor: new.anchor,
            body: new.body,
            status: CommentStatus::Open,
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution: None,
            reply_count: 0,
            created_at: now,
            updated_at: now,
        };

        let Some(parent_id) = new.parent_comment_id else {
            if let Some(anchor) = comment.anchor {
                anchor.check(content)?;
            }
            return Ok(vec![comment]);
        };

        let parent = self.get(parent_id)?;
        if parent.document_id != new.document_id {
            return Err(CollabError::Validation(format!(
                "comment {} belongs to another document",
                parent_id
            )));
        }
        if self.root_of(parent.thread_id)?.is_resolved {
            return Err(CollabError::Validation(format!(
                "thread {} is resolved; reopen it before replying",
                parent.thread_id
            )));
        }
        if let Some(anchor) = parent.anchor {
            anchor.check(content)?;
        }
        comment.thread_id = parent.thread_id;
        comment.anchor = parent.anchor;

        let mut parent = parent.clone();
        parent.reply_count += 1;
        parent.updated_at = now;
        Ok(vec![comment, parent])
    }

    /// Comments changed by resolving `id`; with `resolve_thread` the root and
    /// every open reply resolve together
    pub fn plan_resolve(
        &self,
        actor: ActorId,
        id: CommentId,
        resolution: Option<String>,
        resolve_thread: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        let target = self.get(id)?;
        let targets: Vec<&Comment> = if resolve_thread {
            self.threads
                .get(&target.thread_id)
                .map(|ids| ids.iter().filter_map(|id| self.comments.get(id)).collect())
                .unwrap_or_default()
        } else {
            vec![target]
        };

        let changed: Vec<Comment> = targets
            .into_iter()
            .filter(|c| !c.is_resolved)
            .map(|c| {
                let mut c = c.clone();
                c.mark_resolved(actor, resolution.clone(), now);
                c
            })
            .collect();
        if changed.is_empty() {
            return Err(CollabError::Validation(format!(
                "comment {} is already resolved",
                id
            )));
        }
        Ok(changed)
    }

    /// Comments changed by reopening `id`. Reopening a root reopens its thread.
    pub fn plan_reopen(&self, id: CommentId, now: DateTime<Utc>) -> Result<Vec<Comment>> {
        let target = self.get(id)?;
        if !target.is_resolved {
            return Err(CollabError::Validation(format!(
                "comment {} is not resolved",
                id
            )));
        }
        let targets: Vec<&Comment> = if target.is_root() {
            self.threads
                .get(&target.thread_id)
                .map(|ids| ids.iter().filter_map(|id| self.comments.get(id)).collect())
                .unwrap_or_default()
        } else {
            if self.root_of(target.thread_id)?.is_resolved {
                return Err(CollabError::Validation(format!(
                    "thread {} is resolved; reopen its root comment",
                    target.thread_id
                )));
            }
            vec![target]
        };

        Ok(targets
            .into_iter()
            .filter(|c| c.is_resolved)
            .map(|c| {
                let mut c = c.clone();
                c.mark_open(now);
                c
            })
            .collect())
    }

    /// Install planned records
    pub fn commit(&mut self, changed: Vec<Comment>) {
        for comment in changed {
            if !self.comments.contains_key(&comment.id) {
                let thread = self.threads.entry(comment.thread_id).or_default();
                if comment.is_root() {
                    thread.insert(0, comment.id);
                } else {
                    thread.push(comment.id);
                }
            }
            self.comments.insert(comment.id, comment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Block, BlockKind};

    fn content() -> (DocumentContent, BlockId) {
        let block = Block {
            id: BlockId::new(),
            kind: BlockKind::Paragraph,
            text: "hello world".to_string(),
            marks: Vec::new(),
        };
        let id = block.id;
        (DocumentContent::from_blocks(vec![block]).unwrap(), id)
    }

    fn new_comment(doc: DocumentId, block: BlockId, parent: Option<CommentId>) -> NewComment {
        NewComment {
            document_id: doc,
            anchor: Some(CommentAnchor {
                block_id: block,
                start: 0,
                end: 5,
            }),
            body: "looks off".to_string(),
            parent_comment_id: parent,
        }
    }

    fn add(board: &mut CommentBoard, new: NewComment, content: &DocumentContent) -> Comment {
        let planned = board
            .plan_add(ActorId::new(), new, content, Utc::now())
            .unwrap();
        let comment = planned[0].clone();
        board.commit(planned);
        comment
    }

    #[test]
    fn test_anchor_outside_block_is_stale() {
        let (content, block) = content();
        let board = CommentBoard::new();
        let mut new = new_comment(DocumentId::new(), block, None);
        new.anchor = Some(CommentAnchor {
            block_id: block,
            start: 4,
            end: 40,
        });
        assert!(matches!(
            board.plan_add(ActorId::new(), new.clone(), &content, Utc::now()),
            Err(CollabError::StalePosition(_))
        ));
        new.anchor = Some(CommentAnchor {
            block_id: BlockId::new(),
            start: 0,
            end: 1,
        });
        assert!(matches!(
            board.plan_add(ActorId::new(), new, &content, Utc::now()),
            Err(CollabError::StalePosition(_))
        ));
    }

    #[test]
    fn test_reply_inherits_thread_and_anchor() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);

        let mut reply = new_comment(doc, block, Some(root.id));
        reply.anchor = None;
        let reply = add(&mut board, reply, &content);

        assert_eq!(reply.thread_id, root.thread_id);
        assert_eq!(reply.anchor, root.anchor);
        assert_eq!(board.get(root.id).unwrap().reply_count, 1);
        let thread = board.thread(root.thread_id).unwrap();
        assert_eq!(thread[0].id, root.id);
        assert_eq!(thread[1].id, reply.id);
    }

    #[test]
    fn test_reply_to_thread_on_deleted_block_is_stale() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);

        let emptied = DocumentContent::from_blocks(Vec::new()).unwrap();
        let mut reply = new_comment(doc, block, Some(root.id));
        reply.anchor = None;
        assert!(matches!(
            board.plan_add(ActorId::new(), reply, &emptied, Utc::now()),
            Err(CollabError::StalePosition(_))
        ));
        assert_eq!(board.get(root.id).unwrap().reply_count, 0);
    }

    #[test]
    fn test_thread_cascade_and_reply_into_resolved() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);
        add(&mut board, new_comment(doc, block, Some(root.id)), &content);
        add(&mut board, new_comment(doc, block, Some(root.id)), &content);

        let resolver = ActorId::new();
        let changed = board
            .plan_resolve(resolver, root.id, Some("fixed".into()), true, Utc::now())
            .unwrap();
        assert_eq!(changed.len(), 3);
        board.commit(changed);
        assert!(board
            .thread(root.thread_id)
            .unwrap()
            .iter()
            .all(|c| c.is_resolved && c.resolved_by == Some(resolver)));

        let reply = new_comment(doc, block, Some(root.id));
        assert!(matches!(
            board.plan_add(ActorId::new(), reply, &content, Utc::now()),
            Err(CollabError::Validation(_))
        ));
        assert!(board
            .plan_resolve(resolver, root.id, None, true, Utc::now())
            .is_err());
    }

    #[test]
    fn test_reopen_root_reopens_thread() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);
        let reply = add(&mut board, new_comment(doc, block, Some(root.id)), &content);
        let changed = board
            .plan_resolve(ActorId::new(), root.id, None, true, Utc::now())
            .unwrap();
        board.commit(changed);

        assert!(board.plan_reopen(reply.id, Utc::now()).is_err());
        let reopened = board.plan_reopen(root.id, Utc::now()).unwrap();
        assert_eq!(reopened.len(), 2);
        board.commit(reopened);
        assert!(board.comments().iter().all(|c| !c.is_resolved));
    }

    #[test]
    fn test_planning_does_not_mutate() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);
        board
            .plan_resolve(ActorId::new(), root.id, None, true, Utc::now())
            .unwrap();
        assert!(!board.get(root.id).unwrap().is_resolved);
    }

    #[test]
    fn test_restore_keeps_root_first() {
        let (content, block) = content();
        let doc = DocumentId::new();
        let mut board = CommentBoard::new();
        let root = add(&mut board, new_comment(doc, block, None), &content);
        add(&mut board, new_comment(doc, block, Some(root.id)), &content);

        let mut all = board.comments();
        all.reverse();
        let restored = CommentBoard::restore(all);
        assert_eq!(restored.thread(root.thread_id).unwrap()[0].id, root.id);
        assert_eq!(restored.len(), 2);
    }
}
