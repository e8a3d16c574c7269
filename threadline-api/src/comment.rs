use std::fmt;

use chrono::Utc;
use uuid::Uuid;

use crate::{Error, Time, TEMP_ID_PREFIX};

macro_rules! string_id {
    ( $name:ident ) => {
        #[derive(
            Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> $name {
                $name(String::from(s))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> $name {
                $name(s)
            }
        }
    };
}

string_id!(CommentId);
string_id!(PostId);
string_id!(UserId);

impl CommentId {
    /// Fresh id for an optimistic comment, disjoint from server-issued ids
    pub fn temporary() -> CommentId {
        CommentId(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthorProfile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentRecord {
    pub id: CommentId,
    pub post_id: PostId,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
    pub author_id: UserId,
    pub body: String,
    pub created_at: Time,
    #[serde(default)]
    pub like_count: u32,

    /// Number of direct replies, as counted by the server
    #[serde(default)]
    pub reply_count: u32,

    /// Display data of the author, attached at read time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_profile: Option<AuthorProfile>,

    /// Only ever true for locally-created comments the server did not confirm yet
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_pending: bool,
}

impl CommentRecord {
    /// Builds the optimistic version of a comment that is about to be submitted
    pub fn pending(
        post_id: PostId,
        author_id: UserId,
        body: String,
        parent_id: Option<CommentId>,
        author_profile: Option<AuthorProfile>,
    ) -> CommentRecord {
        CommentRecord {
            id: CommentId::temporary(),
            post_id,
            parent_id,
            author_id,
            body,
            created_at: Utc::now(),
            like_count: 0,
            reply_count: 0,
            author_profile,
            is_pending: true,
        }
    }

    /// Whether `other` describes the same logical comment as `self`, judging
    /// only by what the author submitted
    pub fn same_submission(&self, other: &CommentRecord) -> bool {
        self.author_id == other.author_id
            && self.parent_id == other.parent_id
            && self.body.trim() == other.body.trim()
    }

    /// Shallow-merges the fields present in `patch`, returning whether anything changed
    pub fn merge(&mut self, patch: &CommentPatch) -> bool {
        let before = self.clone();
        if let Some(body) = &patch.body {
            self.body = body.clone();
        }
        if let Some(likes) = patch.like_count {
            self.like_count = likes;
        }
        if let Some(replies) = patch.reply_count {
            self.reply_count = replies;
        }
        if let Some(profile) = &patch.author_profile {
            self.author_profile = Some(profile.clone());
        }
        *self != before
    }
}

/// Partial comment row, as carried by update notifications
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentPatch {
    pub id: CommentId,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub like_count: Option<u32>,
    #[serde(default)]
    pub reply_count: Option<u32>,
    #[serde(default)]
    pub author_profile: Option<AuthorProfile>,
}

impl CommentPatch {
    pub fn likes(id: CommentId, like_count: u32) -> CommentPatch {
        CommentPatch {
            id,
            body: None,
            like_count: Some(like_count),
            reply_count: None,
            author_profile: None,
        }
    }
}

impl From<CommentRecord> for CommentPatch {
    fn from(r: CommentRecord) -> CommentPatch {
        CommentPatch {
            id: r.id,
            body: Some(r.body),
            like_count: Some(r.like_count),
            reply_count: Some(r.reply_count),
            author_profile: r.author_profile,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub post_id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub parent_id: Option<CommentId>,
}

impl NewComment {
    // See comments on `validate_string` in lib.rs
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_body(&self.body)?;
        if let Some(parent) = &self.parent_id {
            if parent.is_temporary() {
                return Err(Error::Validation(format!(
                    "parent {parent} has not been confirmed by the server yet"
                )));
            }
        }
        Ok(())
    }
}
