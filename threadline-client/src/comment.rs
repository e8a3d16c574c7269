use std::slice;

use crate::api::{CommentId, CommentRecord};

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub record: CommentRecord,

    /// Direct replies, in the order of the active sort mode
    pub children: Vec<CommentNode>,
}

impl From<CommentRecord> for CommentNode {
    fn from(record: CommentRecord) -> CommentNode {
        CommentNode {
            record,
            children: Vec::new(),
        }
    }
}

impl CommentNode {
    pub fn id(&self) -> &CommentId {
        &self.record.id
    }

    pub fn find_in<'a>(comments: &'a [CommentNode], id: &CommentId) -> Option<&'a CommentNode> {
        for c in comments {
            if c.record.id == *id {
                return Some(c);
            }
            if let Some(res) = CommentNode::find_in(&c.children, id) {
                return Some(res);
            }
        }
        None
    }

    pub fn find_in_mut<'a>(
        comments: &'a mut [CommentNode],
        id: &CommentId,
    ) -> Option<&'a mut CommentNode> {
        CommentNode::find_in_mut_by(comments, &|c| c.record.id == *id)
    }

    /// Pre-order search, so the first match is the one closest to the top of the forest
    pub fn find_in_mut_by<'a, F>(comments: &'a mut [CommentNode], pred: &F) -> Option<&'a mut CommentNode>
    where
        F: Fn(&CommentNode) -> bool,
    {
        for c in comments.iter_mut() {
            if pred(c) {
                return Some(c);
            }
            if let Some(res) = CommentNode::find_in_mut_by(&mut c.children, pred) {
                return Some(res);
            }
        }
        None
    }

    /// Detaches the comment and its whole subtree
    pub fn remove_from(comments: &mut Vec<CommentNode>, id: &CommentId) -> Option<CommentNode> {
        if let Some(pos) = comments.iter().position(|c| c.record.id == *id) {
            return Some(comments.remove(pos));
        }
        comments
            .iter_mut()
            .find_map(|c| CommentNode::remove_from(&mut c.children, id))
    }

    /// Detaches the comment, moving its replies up to its own level. The
    /// returned node has no children left.
    pub fn remove_promoting(comments: &mut Vec<CommentNode>, id: &CommentId) -> Option<CommentNode> {
        if let Some(pos) = comments.iter().position(|c| c.record.id == *id) {
            let mut removed = comments.remove(pos);
            let grandparent = removed.record.parent_id.clone();
            let promoted = std::mem::take(&mut removed.children)
                .into_iter()
                .map(|mut c| {
                    c.record.parent_id = grandparent.clone();
                    c
                });
            comments.splice(pos..pos, promoted);
            return Some(removed);
        }
        comments
            .iter_mut()
            .find_map(|c| CommentNode::remove_promoting(&mut c.children, id))
    }

    /// Attaches `node` under its parent, or as a root if the parent is not in
    /// the forest. Returns `false` if the node had to be demoted to a root.
    pub fn insert_into(comments: &mut Vec<CommentNode>, node: CommentNode) -> bool {
        let parent_id = match &node.record.parent_id {
            None => {
                comments.push(node);
                return true;
            }
            Some(p) => p.clone(),
        };
        if let Some(parent) = CommentNode::find_in_mut(comments, &parent_id) {
            parent.children.push(node);
            return true;
        }
        comments.push(node);
        false
    }

    /// Moves the roots that were demoted for lack of `parent` under it
    pub fn adopt_orphans(comments: &mut Vec<CommentNode>, parent: &CommentId) -> usize {
        let (orphans, rest): (Vec<_>, Vec<_>) = std::mem::take(comments)
            .into_iter()
            .partition(|c| c.record.parent_id.as_ref() == Some(parent));
        *comments = rest;
        let adopted = orphans.len();
        if adopted == 0 {
            return 0;
        }
        match CommentNode::find_in_mut(comments, parent) {
            Some(p) => p.children.extend(orphans),
            None => comments.extend(orphans),
        }
        adopted
    }

    pub fn count(comments: &[CommentNode]) -> usize {
        comments
            .iter()
            .map(|c| 1 + CommentNode::count(&c.children))
            .sum()
    }

    /// Pre-order iterator over the whole forest
    pub fn flatten(comments: &[CommentNode]) -> Flatten<'_> {
        Flatten {
            stack: vec![comments.iter()],
        }
    }
}

pub struct Flatten<'a> {
    stack: Vec<slice::Iter<'a, CommentNode>>,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = &'a CommentNode;

    fn next(&mut self) -> Option<&'a CommentNode> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(c) => {
                    self.stack.push(c.children.iter());
                    return Some(c);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
