use std::fmt;

use crate::{CommentId, CommentPatch, CommentRecord, PostId, COMMENTS_TABLE};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Raw notification, as pushed by the change transport
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn comment(kind: ChangeKind, record: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            kind,
            table: String::from(COMMENTS_TABLE),
            record,
        }
    }
}

/// Restricts a subscription to the rows of one post, or lets everything through
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChangeFilter {
    pub post_id: Option<PostId>,
}

impl ChangeFilter {
    pub fn post(post_id: PostId) -> ChangeFilter {
        ChangeFilter {
            post_id: Some(post_id),
        }
    }

    pub fn global() -> ChangeFilter {
        ChangeFilter { post_id: None }
    }

    /// A missing post id on the row is accepted: delete notifications often
    /// only carry the primary key
    pub fn accepts(&self, post_id: Option<&PostId>) -> bool {
        match (&self.post_id, post_id) {
            (None, _) | (_, None) => true,
            (Some(want), Some(got)) => want == got,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct TopicKey(pub String);

impl TopicKey {
    pub fn for_post(post_id: &PostId) -> TopicKey {
        TopicKey(format!("{COMMENTS_TABLE}:{post_id}"))
    }

    pub fn global() -> TopicKey {
        TopicKey(format!("{COMMENTS_TABLE}:*"))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized change, ready to be applied to a comment forest
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteChange {
    Insert(CommentRecord),
    Update(CommentPatch),
    Delete(CommentId),
}

impl RemoteChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            RemoteChange::Insert(_) => ChangeKind::Insert,
            RemoteChange::Update(_) => ChangeKind::Update,
            RemoteChange::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn comment_id(&self) -> &CommentId {
        match self {
            RemoteChange::Insert(r) => &r.id,
            RemoteChange::Update(p) => &p.id,
            RemoteChange::Delete(id) => id,
        }
    }
}
