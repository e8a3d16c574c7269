use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use threadline_api::{
    self as api, AuthorProfile, ChangeEvent, ChangeFilter, ChangeKind, ChangeTransport, CommentId,
    CommentRecord, Error, NewComment, Persistence, PostId, Subscription, SubscriptionHandle, Time,
    TopicKey, UserId, Uuid,
};
use tokio::sync::Semaphore;

/// In-memory stand-in for the hosted store, implementing both the query API
/// and the change feed, with knobs to inject failures and delays
#[derive(Clone, Default)]
pub struct MockServer(Arc<Mutex<State>>);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MockOp {
    List,
    Profiles,
    Create,
    Update,
    Delete,
}

/// Holds back the responses to `create_comment` until opened. The comment is
/// committed and relayed before the wait, like a response lost in transit.
pub struct CreateGate(Arc<Semaphore>);

impl CreateGate {
    pub fn open(&self) {
        self.0.add_permits(1);
    }
}

#[derive(Default)]
struct State {
    comments: Vec<CommentRecord>,
    profiles: HashMap<UserId, AuthorProfile>,
    next_id: u64,
    ticks: i64,
    feeds: Vec<Feed>,
    failures: HashMap<MockOp, VecDeque<Error>>,
    failed_subscriptions: usize,
    create_gate: Option<Arc<Semaphore>>,
}

struct Feed {
    handle: SubscriptionHandle,
    filter: ChangeFilter,
    sender: mpsc::UnboundedSender<anyhow::Result<ChangeEvent>>,
}

impl State {
    fn fail(&mut self, op: MockOp) -> Result<(), Error> {
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                tracing::debug!(?op, ?err, "injecting failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn now(&mut self) -> Time {
        self.ticks += 1;
        Utc.timestamp_opt(1_640_995_200 + self.ticks, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn relay(&mut self, kind: ChangeKind, post_id: Option<&PostId>, record: serde_json::Value) {
        let evt = ChangeEvent::comment(kind, record);
        self.feeds.retain(|f| {
            !f.filter.accepts(post_id) || f.sender.unbounded_send(Ok(evt.clone())).is_ok()
        });
    }

    fn find_mut(&mut self, id: &CommentId) -> Result<&mut CommentRecord, Error> {
        self.comments
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    fn bump_replies(&mut self, parent: &CommentId, by: i64) {
        if let Ok(p) = self.find_mut(parent) {
            p.reply_count = (p.reply_count as i64 + by).max(0) as u32;
            let (post_id, record) = (
                p.post_id.clone(),
                json!({"id": p.id, "post_id": p.post_id, "reply_count": p.reply_count}),
            );
            self.relay(ChangeKind::Update, Some(&post_id), record);
        }
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer::default()
    }

    pub fn add_profile(&self, user: UserId, profile: AuthorProfile) {
        self.0.lock().profiles.insert(user, profile);
    }

    /// Adds comments as if they had always been there, without notifying anyone
    pub fn seed(&self, records: impl IntoIterator<Item = CommentRecord>) {
        self.0.lock().comments.extend(records);
    }

    pub fn comments(&self, post: &PostId) -> Vec<CommentRecord> {
        self.0
            .lock()
            .comments
            .iter()
            .filter(|c| c.post_id == *post)
            .cloned()
            .collect()
    }

    /// Sets the like count of a comment, as if other users voted on it
    pub fn like(&self, id: &CommentId, like_count: u32) -> Result<(), Error> {
        let mut state = self.0.lock();
        let c = state.find_mut(id)?;
        c.like_count = like_count;
        let (post_id, record) = (
            c.post_id.clone(),
            json!({"id": c.id, "post_id": c.post_id, "like_count": like_count}),
        );
        state.relay(ChangeKind::Update, Some(&post_id), record);
        Ok(())
    }

    /// Sends a notification as-is to every open feed
    pub fn push_raw(&self, evt: ChangeEvent) {
        self.0
            .lock()
            .feeds
            .retain(|f| f.sender.unbounded_send(Ok(evt.clone())).is_ok());
    }

    /// Drops every open feed, as a network outage would
    pub fn disconnect_feeds(&self) {
        let dropped = std::mem::take(&mut self.0.lock().feeds);
        tracing::debug!(count = dropped.len(), "disconnecting all feeds");
    }

    pub fn num_feeds(&self) -> usize {
        self.0.lock().feeds.len()
    }

    /// Makes the next call to `op` fail with `err`; calls queue up
    pub fn fail_next(&self, op: MockOp, err: Error) {
        self.0
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Refuses the next `count` subscription attempts
    pub fn fail_subscriptions(&self, count: usize) {
        self.0.lock().failed_subscriptions = count;
    }

    pub fn gate_creates(&self) -> CreateGate {
        let gate = Arc::new(Semaphore::new(0));
        self.0.lock().create_gate = Some(gate.clone());
        CreateGate(gate)
    }
}

#[async_trait]
impl Persistence for MockServer {
    async fn list_comments(&self, post: &PostId) -> Result<Vec<CommentRecord>, Error> {
        self.0.lock().fail(MockOp::List)?;
        Ok(self.comments(post))
    }

    async fn list_author_profiles(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, AuthorProfile>, Error> {
        let mut state = self.0.lock();
        state.fail(MockOp::Profiles)?;
        Ok(users
            .iter()
            .filter_map(|u| state.profiles.get(u).map(|p| (u.clone(), p.clone())))
            .collect())
    }

    async fn create_comment(&self, c: NewComment) -> Result<CommentRecord, Error> {
        c.validate()?;
        let (res, gate) = {
            let mut state = self.0.lock();
            let gate = state.create_gate.clone();
            let res = state.fail(MockOp::Create).map(|()| {
                state.next_id += 1;
                let record = CommentRecord {
                    id: CommentId(format!("c{}", state.next_id)),
                    post_id: c.post_id,
                    parent_id: c.parent_id,
                    author_id: c.author_id,
                    body: String::from(c.body.trim()),
                    created_at: state.now(),
                    like_count: 0,
                    reply_count: 0,
                    author_profile: None,
                    is_pending: false,
                };
                state.comments.push(record.clone());
                let row = serde_json::to_value(&record).unwrap_or_default();
                state.relay(ChangeKind::Insert, Some(&record.post_id), row);
                if let Some(parent) = &record.parent_id {
                    state.bump_replies(parent, 1);
                }
                record
            });
            (res, gate)
        };
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        res
    }

    async fn update_comment(&self, id: &CommentId, body: String) -> Result<(), Error> {
        let body = String::from(api::validate_body(&body)?);
        let mut state = self.0.lock();
        state.fail(MockOp::Update)?;
        let c = state.find_mut(id)?;
        c.body = body;
        let (post_id, row) = (c.post_id.clone(), serde_json::to_value(&*c).unwrap_or_default());
        state.relay(ChangeKind::Update, Some(&post_id), row);
        Ok(())
    }

    async fn delete_comment(&self, id: &CommentId) -> Result<(), Error> {
        let mut state = self.0.lock();
        state.fail(MockOp::Delete)?;
        let pos = state
            .comments
            .iter()
            .position(|c| c.id == *id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let removed = state.comments.remove(pos);
        // Deletions only carry the primary key
        state.relay(ChangeKind::Delete, None, json!({ "id": removed.id }));
        if let Some(parent) = &removed.parent_id {
            state.bump_replies(parent, -1);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeTransport for MockServer {
    async fn subscribe(
        &self,
        topic: &TopicKey,
        filter: &ChangeFilter,
    ) -> anyhow::Result<Subscription> {
        let mut state = self.0.lock();
        if state.failed_subscriptions > 0 {
            state.failed_subscriptions -= 1;
            return Err(anyhow!("subscription to {topic} refused"));
        }
        let (sender, receiver) = mpsc::unbounded();
        let handle = SubscriptionHandle(Uuid::new_v4());
        state.feeds.push(Feed {
            handle,
            filter: filter.clone(),
            sender,
        });
        tracing::debug!(%topic, ?handle, "opened feed");
        Ok(Subscription {
            handle,
            events: receiver.boxed(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()> {
        self.0.lock().feeds.retain(|f| f.handle != handle);
        Ok(())
    }
}
