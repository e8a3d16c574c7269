mod comment;
pub use comment::{CommentNode, Flatten};

mod feed;
pub use feed::{normalize_event, FeedConfig, FeedManager, FeedState};

mod order;
pub use order::SortExt;

mod reconcile;
pub use reconcile::{OrphanPolicy, Reconciler};

mod store;
pub use store::{CommentStore, StatusMessage, StoreAction, StoreConfig};

mod tree;
pub use tree::build_tree;

pub mod api {
    pub use threadline_api::*;
}

pub mod prelude {
    pub use crate::SortExt;
}
