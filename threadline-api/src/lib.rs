use chrono::Utc;

pub use uuid::Uuid;
pub type Time = chrono::DateTime<Utc>;

/// Prefix of locally generated comment ids, never issued by the server
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Table name the change feed uses for comment rows
pub const COMMENTS_TABLE: &str = "comments";

mod change;
pub use change::{ChangeEvent, ChangeFilter, ChangeKind, RemoteChange, TopicKey};

mod comment;
pub use comment::{
    AuthorProfile, CommentId, CommentPatch, CommentRecord, NewComment, PostId, UserId,
};

mod db;
pub use db::{ChangeTransport, Persistence, Subscription, SubscriptionHandle};

mod error;
pub use error::Error;

mod sort;
pub use sort::SortMode;

// Validation functions live here and are called from the `validate` methods of
// the individual types. They only check what the server would reject anyway,
// so that the client can refuse before doing any optimistic update.

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

/// Returns the trimmed body if it is acceptable as a comment body
pub fn validate_body(body: &str) -> Result<&str, Error> {
    validate_string(body)?;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(String::from("comment body is empty")));
    }
    Ok(trimmed)
}
