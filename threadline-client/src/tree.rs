use std::collections::{HashMap, HashSet};

use crate::{
    api::{CommentId, CommentRecord},
    CommentNode,
};

/// Links a flat list of comments into a forest. Sibling lists keep the input
/// order; comments whose parent is not part of the input become roots.
pub fn build_tree<I>(records: I) -> Vec<CommentNode>
where
    I: IntoIterator<Item = CommentRecord>,
{
    let mut seen = HashSet::new();
    let mut slots: Vec<Option<CommentRecord>> = Vec::new();
    for r in records {
        if seen.insert(r.id.clone()) {
            slots.push(Some(r));
        } else {
            tracing::warn!(id = ?r.id, "duplicate comment in input, keeping the first one");
        }
    }

    let index: HashMap<CommentId, usize> = slots
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().map(|r| (r.id.clone(), i)))
        .collect();

    let mut children = vec![Vec::new(); slots.len()];
    let mut roots = Vec::new();
    for (i, r) in slots.iter().enumerate() {
        let r = match r {
            Some(r) => r,
            None => continue,
        };
        match r.parent_id.as_ref().map(|p| (p, index.get(p))) {
            None => roots.push(i),
            Some((_, Some(&p))) if p != i => children[p].push(i),
            Some((parent, _)) => {
                tracing::debug!(id = ?r.id, ?parent, "parent not found, demoting comment to root");
                roots.push(i);
            }
        }
    }

    let mut forest = Vec::with_capacity(roots.len());
    for i in roots {
        forest.extend(assemble(i, &mut slots, &children));
    }

    // Whatever is left over only references itself through a parent cycle
    for i in 0..slots.len() {
        if slots[i].is_some() {
            tracing::warn!(id = ?slots[i].as_ref().map(|r| &r.id), "comment is part of a parent cycle, demoting it to root");
            forest.extend(assemble(i, &mut slots, &children));
        }
    }

    forest
}

fn assemble(
    i: usize,
    slots: &mut [Option<CommentRecord>],
    children: &[Vec<usize>],
) -> Option<CommentNode> {
    let record = slots[i].take()?;
    let children = children[i]
        .iter()
        .filter_map(|&c| assemble(c, slots, children))
        .collect();
    Some(CommentNode { record, children })
}
