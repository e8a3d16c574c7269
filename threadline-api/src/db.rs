use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{
    AuthorProfile, ChangeEvent, ChangeFilter, CommentId, CommentRecord, Error, NewComment, PostId,
    TopicKey, UserId,
};

/// Query and mutation API of the hosted store
#[async_trait]
pub trait Persistence: Send + Sync {
    /// All comments of a post, flat and in no particular order
    async fn list_comments(&self, post: &PostId) -> Result<Vec<CommentRecord>, Error>;

    async fn list_author_profiles(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, AuthorProfile>, Error>;

    /// The server assigns `id` and `created_at`, and starts `like_count` at 0
    async fn create_comment(&self, c: NewComment) -> Result<CommentRecord, Error>;

    async fn update_comment(&self, id: &CommentId, body: String) -> Result<(), Error>;

    async fn delete_comment(&self, id: &CommentId) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SubscriptionHandle(pub Uuid);

/// A live subscription; the stream ending or yielding an error means the
/// connection was lost
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: BoxStream<'static, anyhow::Result<ChangeEvent>>,
}

/// Push-notification transport of the hosted store
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Resolves once the transport confirmed the subscription is ready
    async fn subscribe(
        &self,
        topic: &TopicKey,
        filter: &ChangeFilter,
    ) -> anyhow::Result<Subscription>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()>;
}
