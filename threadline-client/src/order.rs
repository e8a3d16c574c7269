use std::cmp::Reverse;

use crate::{
    api::{CommentRecord, SortMode},
    CommentNode,
};

pub trait SortExt {
    /// Sorts every sibling list of the forest, at all depths
    fn sort(&self, comments: &mut [CommentNode]);

    /// Same as `sort`, leaving `comments` untouched
    fn sorted(&self, comments: &[CommentNode]) -> Vec<CommentNode> {
        let mut res = comments.to_vec();
        self.sort(&mut res);
        res
    }

    /// Whether going from `before` to `after` can move the comment among its siblings
    fn key_changed(&self, before: &CommentRecord, after: &CommentRecord) -> bool;
}

impl SortExt for SortMode {
    fn sort(&self, comments: &mut [CommentNode]) {
        // Stable sorts only: equal keys must keep their relative order, or
        // every re-sort would shuffle ties around
        match self {
            SortMode::Best => comments.sort_by_key(|c| Reverse(c.record.like_count)),
            SortMode::Newest => comments.sort_by_key(|c| Reverse(c.record.created_at)),
            SortMode::Oldest => comments.sort_by_key(|c| c.record.created_at),
        }
        for c in comments.iter_mut() {
            self.sort(&mut c.children);
        }
    }

    fn key_changed(&self, before: &CommentRecord, after: &CommentRecord) -> bool {
        match self {
            SortMode::Best => before.like_count != after.like_count,
            SortMode::Newest | SortMode::Oldest => before.created_at != after.created_at,
        }
    }
}
