use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    api::{
        self, AuthorProfile, ChangeFilter, ChangeTransport, CommentId, CommentRecord, Error,
        Persistence, PostId, RemoteChange, SortMode, TopicKey, UserId,
    },
    CommentNode, FeedConfig, FeedManager, FeedState, OrphanPolicy, Reconciler,
};

pub const STATUS_CAPACITY: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sort_mode: SortMode,
    pub orphan_policy: OrphanPolicy,
    pub feed: FeedConfig,

    /// Status messages kept for slow readers before they start missing some
    pub status_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            sort_mode: SortMode::default(),
            orphan_policy: OrphanPolicy::default(),
            feed: FeedConfig::default(),
            status_capacity: STATUS_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreAction {
    Post,
    Update,
    Delete,
    Load,
}

/// Outcome of a user action, for display in toasts and the like
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StatusMessage {
    Posted { id: CommentId },
    Updated { id: CommentId },
    Deleted { id: CommentId },
    Failed { action: StoreAction, error: Error },
}

#[derive(Clone, Default)]
struct ProfileCache(Arc<Mutex<HashMap<UserId, Option<AuthorProfile>>>>);

impl ProfileCache {
    fn get(&self, user: &UserId) -> Option<AuthorProfile> {
        self.0.lock().get(user).cloned().flatten()
    }

    fn insert(&self, user: UserId, profile: AuthorProfile) {
        self.0.lock().insert(user, Some(profile));
    }

    /// Fetches the profiles not cached yet. Users without a profile are
    /// remembered too, so they are not asked for again.
    async fn fetch<P: ?Sized + Persistence>(
        &self,
        persistence: &P,
        users: impl IntoIterator<Item = UserId>,
    ) -> Result<(), Error> {
        let missing = {
            let cache = self.0.lock();
            users
                .into_iter()
                .filter(|u| !cache.contains_key(u))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let mut found = persistence.list_author_profiles(&missing).await?;
        let mut cache = self.0.lock();
        for u in missing {
            let profile = found.remove(&u);
            cache.insert(u, profile);
        }
        Ok(())
    }

    fn attach(&self, records: &mut [CommentRecord]) {
        let cache = self.0.lock();
        for r in records.iter_mut().filter(|r| r.author_profile.is_none()) {
            r.author_profile = cache.get(&r.author_id).cloned().flatten();
        }
    }

    async fn resolve<P: ?Sized + Persistence>(&self, persistence: &P, record: &mut CommentRecord) {
        if record.author_profile.is_some() {
            return;
        }
        if let Err(err) = self
            .fetch(persistence, Some(record.author_id.clone()))
            .await
        {
            tracing::warn!(author = ?record.author_id, ?err, "failed fetching author profile");
        }
        self.attach(std::slice::from_mut(record));
    }
}

/// Live, sorted comment thread of one post: the initial load, the change feed
/// and the user's own writes, all merged into one forest
pub struct CommentStore<P: ?Sized, T: ?Sized> {
    post_id: PostId,
    topic: TopicKey,
    persistence: Arc<P>,
    reconciler: Reconciler<P>,
    feeds: FeedManager<T>,
    profiles: ProfileCache,
    loading: watch::Sender<bool>,
    load_lock: tokio::sync::Mutex<()>,
    statuses: broadcast::Sender<StatusMessage>,
    listener: JoinHandle<()>,
}

impl<P, T> CommentStore<P, T>
where
    P: ?Sized + Persistence + 'static,
    T: ?Sized + ChangeTransport + 'static,
{
    /// Subscribes to the post's changes and loads its comments
    pub async fn open(
        post_id: PostId,
        persistence: Arc<P>,
        transport: Arc<T>,
        config: StoreConfig,
    ) -> Result<CommentStore<P, T>, Error> {
        let store = CommentStore::new(post_id, persistence, transport, config);
        store.feed_ready().await;
        match store.load().await {
            Ok(()) => Ok(store),
            Err(err) => {
                store.close().await;
                Err(err)
            }
        }
    }

    /// Subscribes to the post's changes without loading anything. Changes are
    /// held back until the first `load`.
    pub fn new(
        post_id: PostId,
        persistence: Arc<P>,
        transport: Arc<T>,
        config: StoreConfig,
    ) -> CommentStore<P, T> {
        let reconciler = Reconciler::new(persistence.clone(), config.sort_mode, config.orphan_policy);
        reconciler.begin_reload();
        let profiles = ProfileCache::default();

        let (sink, changes) = mpsc::unbounded();
        let listener = tokio::spawn(apply_changes(
            reconciler.clone(),
            persistence.clone(),
            profiles.clone(),
            changes,
        ));
        let topic = TopicKey::for_post(&post_id);
        let feeds = FeedManager::new(transport, config.feed);
        feeds.subscribe(topic.clone(), ChangeFilter::post(post_id.clone()), sink);

        CommentStore {
            post_id,
            topic,
            persistence,
            reconciler,
            feeds,
            profiles,
            loading: watch::channel(false).0,
            load_lock: tokio::sync::Mutex::new(()),
            statuses: broadcast::channel(config.status_capacity.max(1)).0,
            listener,
        }
    }

    pub fn post_id(&self) -> &PostId {
        &self.post_id
    }

    /// Sorted forest, with pending comments included
    pub fn comments(&self) -> Arc<Vec<CommentNode>> {
        self.reconciler.snapshot()
    }

    pub fn find(&self, id: &CommentId) -> Option<CommentRecord> {
        self.reconciler.find(id)
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    pub fn loading_changes(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    /// Bumped each time `comments` would return something new
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.reconciler.changes()
    }

    pub fn statuses(&self) -> broadcast::Receiver<StatusMessage> {
        self.statuses.subscribe()
    }

    pub fn feed_state(&self) -> FeedState {
        self.feeds.state(&self.topic).unwrap_or(FeedState::Closed)
    }

    pub fn sort_mode(&self) -> SortMode {
        self.reconciler.sort_mode()
    }

    pub fn set_sort_mode(&self, mode: SortMode) {
        tracing::debug!(post = %self.post_id, %mode, "changing sort mode");
        self.reconciler.set_sort_mode(mode);
    }

    /// Replaces the forest with the server's current list, keeping the
    /// comments still pending and the changes received meanwhile
    pub async fn load(&self) -> Result<(), Error> {
        let _lock = self.load_lock.lock().await;
        self.loading.send_replace(true);
        self.reconciler.begin_reload();
        let res = self.fetch().await;
        let res = match res {
            Ok(records) => {
                tracing::info!(post = %self.post_id, count = records.len(), "loaded comments");
                self.reconciler.finish_reload(records);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(post = %self.post_id, ?err, "failed loading comments");
                self.reconciler.abort_reload();
                self.report(StatusMessage::Failed {
                    action: StoreAction::Load,
                    error: err.clone(),
                });
                Err(err)
            }
        };
        self.loading.send_replace(false);
        res
    }

    /// Restarts the change feed if it gave up, then reloads. The reload
    /// happens even if the feed cannot be restarted, but the result is then
    /// an `Error::Subscription`.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.restart_feed().await;
        self.load().await?;
        match self.feed_state() {
            FeedState::Failed | FeedState::Closed => {
                let err = Error::Subscription(format!("change feed {} is down", self.topic));
                self.report(StatusMessage::Failed {
                    action: StoreAction::Load,
                    error: err.clone(),
                });
                Err(err)
            }
            _ => Ok(()),
        }
    }

    async fn restart_feed(&self) {
        if matches!(self.feed_state(), FeedState::Failed | FeedState::Closed) {
            tracing::info!(post = %self.post_id, "restarting change feed");
            let (sink, changes) = mpsc::unbounded();
            if self.feeds.subscribe(
                self.topic.clone(),
                ChangeFilter::post(self.post_id.clone()),
                sink,
            ) {
                tokio::spawn(apply_changes(
                    self.reconciler.clone(),
                    self.persistence.clone(),
                    self.profiles.clone(),
                    changes,
                ));
                self.feed_ready().await;
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<CommentRecord>, Error> {
        let mut records = self.persistence.list_comments(&self.post_id).await?;
        let authors = records.iter().map(|r| r.author_id.clone()).collect::<Vec<_>>();
        if let Err(err) = self.profiles.fetch(&*self.persistence, authors).await {
            tracing::warn!(post = %self.post_id, ?err, "failed fetching author profiles, showing comments without them");
        }
        self.profiles.attach(&mut records);
        Ok(records)
    }

    /// Waits until the feed either connected or failed its first attempt
    async fn feed_ready(&self) {
        let mut state = match self.feeds.state_changes(&self.topic) {
            Some(state) => state,
            None => return,
        };
        while *state.borrow_and_update() == FeedState::Connecting {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn add_comment(
        &self,
        author_id: UserId,
        body: &str,
        parent_id: Option<CommentId>,
        author_profile: Option<AuthorProfile>,
    ) -> Result<CommentRecord, Error> {
        let author_profile = match author_profile {
            Some(p) => {
                self.profiles.insert(author_id.clone(), p.clone());
                Some(p)
            }
            None => self.profiles.get(&author_id),
        };
        let res = self
            .reconciler
            .add_comment(self.post_id.clone(), author_id, body, parent_id, author_profile)
            .await;
        self.report(match &res {
            Ok(r) => StatusMessage::Posted { id: r.id.clone() },
            Err(err) => StatusMessage::Failed {
                action: StoreAction::Post,
                error: err.clone(),
            },
        });
        res
    }

    /// Edits the body of a confirmed comment. The forest only changes once
    /// the server pushes the update back.
    pub async fn update_comment(&self, id: &CommentId, body: &str) -> Result<(), Error> {
        let res = match api::validate_body(body) {
            Ok(_) if id.is_temporary() => Err(not_confirmed(id)),
            Ok(body) => self.persistence.update_comment(id, body.to_string()).await,
            Err(err) => Err(err),
        };
        self.report(match &res {
            Ok(()) => StatusMessage::Updated { id: id.clone() },
            Err(err) => StatusMessage::Failed {
                action: StoreAction::Update,
                error: err.clone(),
            },
        });
        res
    }

    /// Deletes a confirmed comment. The forest only changes once the server
    /// pushes the deletion back.
    pub async fn delete_comment(&self, id: &CommentId) -> Result<(), Error> {
        let res = match id.is_temporary() {
            true => Err(not_confirmed(id)),
            false => self.persistence.delete_comment(id).await,
        };
        self.report(match &res {
            Ok(()) => StatusMessage::Deleted { id: id.clone() },
            Err(err) => StatusMessage::Failed {
                action: StoreAction::Delete,
                error: err.clone(),
            },
        });
        res
    }

    fn report(&self, status: StatusMessage) {
        tracing::debug!(post = %self.post_id, ?status, "reporting status");
        // nobody listening is fine
        let _ = self.statuses.send(status);
    }

    /// Stops listening for changes
    pub async fn close(self) {
        self.feeds.unsubscribe_all().await;
        if let Err(err) = self.listener.await {
            tracing::error!(post = %self.post_id, ?err, "change listener crashed");
        }
    }
}

fn not_confirmed(id: &CommentId) -> Error {
    Error::Validation(format!("comment {id} is not confirmed by the server yet"))
}

async fn apply_changes<P: ?Sized + Persistence>(
    reconciler: Reconciler<P>,
    persistence: Arc<P>,
    profiles: ProfileCache,
    mut changes: mpsc::UnboundedReceiver<RemoteChange>,
) {
    while let Some(change) = changes.next().await {
        let change = match change {
            RemoteChange::Insert(mut record) => {
                profiles.resolve(&*persistence, &mut record).await;
                RemoteChange::Insert(record)
            }
            change => change,
        };
        reconciler.apply_remote_change(change);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use threadline_mock_server::{MockOp, MockServer};

    use super::*;
    use crate::test_util::{init_tracing, record};

    type TestStore = CommentStore<MockServer, MockServer>;

    fn profile(name: &str) -> AuthorProfile {
        AuthorProfile {
            display_name: String::from(name),
            avatar_url: None,
        }
    }

    async fn open(server: &MockServer) -> TestStore {
        init_tracing();
        let config = StoreConfig {
            feed: FeedConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                max_attempts: 2,
                ..FeedConfig::default()
            },
            ..StoreConfig::default()
        };
        CommentStore::open(
            PostId::from("post"),
            Arc::new(server.clone()),
            Arc::new(server.clone()),
            config,
        )
        .await
        .unwrap()
    }

    async fn wait_until(store: &TestStore, pred: impl Fn(&[CommentNode]) -> bool) {
        let mut changes = store.changes();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                changes.borrow_and_update();
                if pred(&store.comments()) {
                    return;
                }
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("store never reached the expected state");
    }

    #[test]
    fn config_defaults() {
        let c: StoreConfig = serde_json::from_str(r#"{"sort_mode":"newest"}"#).unwrap();
        assert_eq!(c.sort_mode, SortMode::Newest);
        assert_eq!(c.orphan_policy, OrphanPolicy::Drop);
        assert_eq!(c.status_capacity, STATUS_CAPACITY);
        assert_eq!(c.feed, FeedConfig::default());
    }

    #[tokio::test]
    async fn open_loads_the_thread_with_profiles() {
        let server = MockServer::new();
        server.add_profile(UserId::from("author"), profile("Ann"));
        server.seed(vec![
            record("a", None, 1, 1),
            record("b", Some("a"), 0, 2),
            record("c", None, 3, 3),
        ]);
        let store = open(&server).await;
        assert!(!store.is_loading());
        assert_eq!(store.feed_state(), FeedState::Connected);
        let comments = store.comments();
        assert_eq!(comments[0].id().as_str(), "c");
        assert_eq!(comments[1].children[0].id().as_str(), "b");
        assert!(CommentNode::flatten(&comments)
            .all(|c| c.record.author_profile == Some(profile("Ann"))));
        store.close().await;
        assert_eq!(server.num_feeds(), 0);
    }

    #[tokio::test]
    async fn failed_initial_load_is_reported() {
        let server = MockServer::new();
        server.fail_next(MockOp::List, Error::PermissionDenied);
        let res = CommentStore::open(
            PostId::from("post"),
            Arc::new(server.clone()),
            Arc::new(server.clone()),
            StoreConfig::default(),
        )
        .await;
        assert_eq!(res.err(), Some(Error::PermissionDenied));
        assert_eq!(server.num_feeds(), 0);
    }

    #[tokio::test]
    async fn own_comment_shows_once_despite_the_echo() {
        let server = MockServer::new();
        let store = open(&server).await;
        let mut statuses = store.statuses();
        let me = UserId::from("me");
        let c = store
            .add_comment(me.clone(), "first!", None, Some(profile("Me")))
            .await
            .unwrap();
        assert_eq!(statuses.recv().await.unwrap(), StatusMessage::Posted { id: c.id.clone() });

        // the echo of our own insert must not duplicate it
        let reply = store
            .add_comment(me, "second", Some(c.id.clone()), None)
            .await
            .unwrap();
        wait_until(&store, |f| {
            CommentNode::find_in(f, &c.id).map_or(false, |c| c.record.reply_count == 1)
        })
        .await;
        let comments = store.comments();
        assert_eq!(CommentNode::count(&comments), 2);
        assert_eq!(comments[0].children[0].record.id, reply.id);
        assert_eq!(
            comments[0].children[0].record.author_profile,
            Some(profile("Me"))
        );
        store.close().await;
    }

    #[tokio::test]
    async fn pushed_comments_get_their_author_profile() {
        let server = MockServer::new();
        server.add_profile(UserId::from("other"), profile("Otto"));
        let store = open(&server).await;
        server
            .create_comment(api::NewComment {
                post_id: PostId::from("post"),
                author_id: UserId::from("other"),
                body: String::from("hey"),
                parent_id: None,
            })
            .await
            .unwrap();
        wait_until(&store, |f| f.len() == 1).await;
        assert_eq!(store.comments()[0].record.author_profile, Some(profile("Otto")));
        store.close().await;
    }

    #[tokio::test]
    async fn update_and_delete_go_through_the_feed() {
        let server = MockServer::new();
        server.seed(vec![record("a", None, 0, 1), record("b", Some("a"), 0, 2)]);
        let store = open(&server).await;
        let mut statuses = store.statuses();

        store.update_comment(&CommentId::from("b"), " edited ").await.unwrap();
        assert_eq!(
            statuses.recv().await.unwrap(),
            StatusMessage::Updated { id: CommentId::from("b") }
        );
        wait_until(&store, |f| f[0].children[0].record.body == "edited").await;

        server.like(&CommentId::from("a"), 4).unwrap();
        wait_until(&store, |f| f[0].record.like_count == 4).await;

        store.delete_comment(&CommentId::from("b")).await.unwrap();
        wait_until(&store, |f| f[0].children.is_empty()).await;
        store.close().await;
    }

    #[tokio::test]
    async fn rejected_mutations_leave_the_forest_alone() {
        let server = MockServer::new();
        server.seed(vec![record("a", None, 0, 1)]);
        let store = open(&server).await;
        let mut statuses = store.statuses();
        let before = store.comments();

        let temp = CommentId::temporary();
        assert!(store.update_comment(&temp, "x").await.unwrap_err().is_validation());
        assert!(store.delete_comment(&temp).await.unwrap_err().is_validation());
        assert!(store
            .update_comment(&CommentId::from("a"), "  ")
            .await
            .unwrap_err()
            .is_validation());
        server.fail_next(MockOp::Delete, Error::PermissionDenied);
        assert_eq!(
            store.delete_comment(&CommentId::from("a")).await,
            Err(Error::PermissionDenied)
        );
        assert_eq!(store.comments(), before);

        for _ in 0..3 {
            assert!(matches!(
                statuses.recv().await.unwrap(),
                StatusMessage::Failed { error, .. } if error.is_validation()
            ));
        }
        assert_eq!(
            statuses.recv().await.unwrap(),
            StatusMessage::Failed {
                action: StoreAction::Delete,
                error: Error::PermissionDenied
            }
        );
        store.close().await;
    }

    #[tokio::test]
    async fn refresh_restarts_a_failed_feed() {
        let server = MockServer::new();
        let store = open(&server).await;
        server.fail_subscriptions(100);
        server.disconnect_feeds();
        let mut state = store.feeds.state_changes(&store.topic).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != FeedState::Failed {
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(store.feed_state(), FeedState::Failed);

        server.fail_subscriptions(0);
        server.seed(vec![record("late", None, 0, 1)]);
        store.refresh().await.unwrap();
        assert_eq!(store.feed_state(), FeedState::Connected);
        assert_eq!(store.comments().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn sort_mode_can_change_while_open() {
        let server = MockServer::new();
        server.seed(vec![record("old", None, 9, 1), record("new", None, 0, 2)]);
        let store = open(&server).await;
        assert_eq!(store.sort_mode(), SortMode::Best);
        assert_eq!(store.comments()[0].id().as_str(), "old");
        store.set_sort_mode(SortMode::Newest);
        assert_eq!(store.comments()[0].id().as_str(), "new");
        store.close().await;
    }
}
