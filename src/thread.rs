//! Comment thread engine.
//!
//! A bug's comments live in one flat vector whose order is splice order: each
//! reply is inserted right after the comment it answers. From that vector we
//! rebuild the nested reply tree for display and compute where new replies go.
//!
//! Trees are built on an index arena (`nodes` + child index lists) and only
//! materialized into owned [`TreeNode`]s at the end, so no builder ever holds
//! a mutable borrow into a nested child list.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::attachments;
use crate::models::{Attachment, Comment, ParentType, UNKNOWN_USER};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ThreadError {
    #[error("reply text must not be empty")]
    EmptyText,
}

/// A comment placed in the reply tree.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TreeNode {
    /// Position of the comment in the bug's flat comment list.
    pub original_index: usize,
    pub comment: Comment,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Pre-order walk of this node and its descendants.
    pub fn flatten_into(&self, out: &mut Vec<usize>) {
        out.push(self.original_index);
        for c in &self.children {
            c.flatten_into(out);
        }
    }
}

/// Pre-order original indices of a whole forest.
pub fn flatten(forest: &[TreeNode]) -> Vec<usize> {
    let mut out = Vec::new();
    for n in forest {
        n.flatten_into(&mut out);
    }
    out
}

type NodeId = usize;

struct ArenaNode<'a> {
    original_index: usize,
    comment: &'a Comment,
    children: Vec<NodeId>,
}

#[derive(Default)]
struct Arena<'a> {
    nodes: Vec<ArenaNode<'a>>,
    roots: Vec<NodeId>,
}

impl<'a> Arena<'a> {
    fn push(&mut self, original_index: usize, comment: &'a Comment, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(ArenaNode { original_index, comment, children: Vec::new() });
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    fn materialize(&self, id: NodeId) -> TreeNode {
        let n = &self.nodes[id];
        TreeNode {
            original_index: n.original_index,
            comment: n.comment.clone(),
            children: n.children.iter().map(|c| self.materialize(*c)).collect(),
        }
    }

    fn into_forest(self) -> Vec<TreeNode> {
        self.roots.iter().map(|r| self.materialize(*r)).collect()
    }
}

/// Level → most recent node registered at that level. A level that was never
/// seen (or `-1`) resolves to the root list. Deeper levels are not cleared when
/// a shallower comment arrives; a later comment jumping levels attaches to
/// whatever was last registered there.
#[derive(Default)]
struct LevelHandlers(HashMap<u32, NodeId>);

impl LevelHandlers {
    fn parent_for(&self, level: u32) -> Option<NodeId> {
        level.checked_sub(1).and_then(|l| self.0.get(&l).copied())
    }
    fn register(&mut self, level: u32, node: NodeId) {
        self.0.insert(level, node);
    }
}

/// Rebuild the reply forest from a flat list using only `level`.
pub fn build_tree(comments: &[Comment]) -> Vec<TreeNode> {
    build_tree_indexed(comments.iter().enumerate())
}

/// Like [`build_tree`] but with caller-supplied original indices, for views
/// built over a filtered subset of the thread.
pub fn build_tree_indexed<'a, I>(entries: I) -> Vec<TreeNode>
where
    I: IntoIterator<Item = (usize, &'a Comment)>,
{
    let mut arena = Arena::default();
    let mut handlers = LevelHandlers::default();
    for (idx, c) in entries {
        let parent = handlers.parent_for(c.level);
        let node = arena.push(idx, c, parent);
        handlers.register(c.level, node);
    }
    arena.into_forest()
}

/// Rebuild the reply forest following explicit `parent_id` links.
///
/// Comments without a `parent_id` (top-level entries and rows predating ids)
/// fall back to the level rule. A `parent_id` that does not resolve to an
/// earlier entry of this view makes the comment a root.
pub fn thread_forest<'a, I>(entries: I) -> Vec<TreeNode>
where
    I: IntoIterator<Item = (usize, &'a Comment)>,
{
    let mut arena = Arena::default();
    let mut handlers = LevelHandlers::default();
    let mut by_id: HashMap<Uuid, NodeId> = HashMap::new();
    for (idx, c) in entries {
        let parent = match c.parent_id {
            Some(pid) => by_id.get(&pid).copied(),
            None => handlers.parent_for(c.level),
        };
        let node = arena.push(idx, c, parent);
        handlers.register(c.level, node);
        if let Some(id) = c.id {
            by_id.insert(id, node);
        }
    }
    arena.into_forest()
}

/// Where a reply is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyTarget {
    /// The bug's description thread. No index: reply to the description
    /// itself; with an index: reply to that description reply.
    Description { index: Option<usize> },
    /// The comment thread. No index: a new top-level comment.
    Comment { index: Option<usize> },
}

impl ReplyTarget {
    pub fn parent_type(&self) -> ParentType {
        match self {
            ReplyTarget::Description { .. } => ParentType::Description,
            ReplyTarget::Comment { .. } => ParentType::Comment,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            ReplyTarget::Description { index } | ReplyTarget::Comment { index } => *index,
        }
    }
}

/// Result of [`submit_reply`]: the new thread and where the reply landed.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub comments: Vec<Comment>,
    pub position: usize,
}

impl Submitted {
    pub fn reply(&self) -> &Comment {
        &self.comments[self.position]
    }
}

/// Compute the thread after adding a reply. `comments` is left untouched.
///
/// A reply to an existing entry is spliced directly after it one level deeper
/// and records the parent's index and id. Everything else (description
/// replies, new top-level comments, and replies whose target index is out of
/// range) is appended at level 0.
pub fn submit_reply(
    comments: &[Comment],
    target: ReplyTarget,
    text: &str,
    author: &str,
    now: DateTime<Utc>,
) -> Result<Submitted, ThreadError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ThreadError::EmptyText);
    }
    let user = match author.trim() {
        "" => UNKNOWN_USER.to_string(),
        a => a.to_string(),
    };
    let mut reply = Comment {
        id: Some(Uuid::new_v4()),
        text: text.to_string(),
        user,
        timestamp: now,
        level: 0,
        parent_type: target.parent_type(),
        parent_index: None,
        parent_id: None,
        is_reply: !matches!(target, ReplyTarget::Comment { index: None }),
    };

    let mut out = comments.to_vec();
    let position = match target.index().and_then(|i| comments.get(i).map(|p| (i, p))) {
        Some((i, parent)) => {
            reply.level = parent.level.saturating_add(1);
            reply.parent_index = Some(i);
            reply.parent_id = parent.id;
            i + 1
        }
        None => {
            if let Some(i) = target.index() {
                tracing::warn!(index = i, len = comments.len(), "reply target out of range, appending");
            }
            out.len()
        }
    };
    out.insert(position, reply);
    Ok(Submitted { comments: out, position })
}

/// Give every comment lacking one a stable id. Returns how many were assigned.
pub fn ensure_comment_ids(comments: &mut [Comment]) -> usize {
    let mut assigned = 0;
    for c in comments.iter_mut().filter(|c| c.id.is_none()) {
        c.id = Some(Uuid::new_v4());
        assigned += 1;
    }
    assigned
}

// ---------------------------------------------------------------- views ---

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CommentView {
    pub original_index: usize,
    pub comment: Comment,
    pub attachment: Option<Attachment>,
    pub children: Vec<CommentView>,
}

impl CommentView {
    fn from_node(node: TreeNode, comments: &[Comment], files: &[Attachment]) -> Self {
        let attachment = attachments::attachment_for_comment(files, comments, node.original_index).cloned();
        Self {
            original_index: node.original_index,
            attachment,
            children: node
                .children
                .into_iter()
                .map(|c| CommentView::from_node(c, comments, files))
                .collect(),
            comment: node.comment,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DescriptionReplyView {
    pub original_index: usize,
    pub comment: Comment,
    pub attachment: Option<Attachment>,
}

/// Everything a bug page renders below the description.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ThreadView {
    pub description_attachment: Option<Attachment>,
    /// Comment section: newest top-level thread first, replies in insert order.
    pub comments: Vec<CommentView>,
    /// Description replies, flattened, newest first.
    pub description_replies: Vec<DescriptionReplyView>,
}

impl ThreadView {
    pub fn build(comments: &[Comment], files: &[Attachment]) -> Self {
        let comment_section = comments
            .iter()
            .enumerate()
            .filter(|(_, c)| c.parent_type != ParentType::Description);
        let mut forest = thread_forest(comment_section);
        forest.reverse();

        let mut description_replies: Vec<_> = comments
            .iter()
            .enumerate()
            .filter(|(_, c)| c.parent_type == ParentType::Description)
            .map(|(i, c)| DescriptionReplyView {
                original_index: i,
                comment: c.clone(),
                attachment: attachments::attachment_for_comment(files, comments, i).cloned(),
            })
            .collect();
        description_replies.reverse();

        Self {
            description_attachment: attachments::description_attachment(files).cloned(),
            comments: forest
                .into_iter()
                .map(|n| CommentView::from_node(n, comments, files))
                .collect(),
            description_replies,
        }
    }
}
