use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::api::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeTransport, CommentId, CommentRecord, PostId,
    RemoteChange, TopicKey, COMMENTS_TABLE,
};

pub const INITIAL_BACKOFF_MS: u64 = 250;
pub const MAX_BACKOFF_MS: u64 = 10_000;
pub const MAX_ATTEMPTS: u32 = 8;
pub const STABLE_AFTER_MS: u64 = 5_000;

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FeedConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Consecutive failed subscription attempts before giving up
    pub max_attempts: u32,

    /// A connection dropped sooner than this counts as a failed attempt
    pub stable_after_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> FeedConfig {
        FeedConfig {
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            max_attempts: MAX_ATTEMPTS,
            stable_after_ms: STABLE_AFTER_MS,
        }
    }
}

impl FeedConfig {
    /// Delay before reconnection attempt number `attempt`, counting from 0
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FeedState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up after too many failed attempts
    Failed,
    Closed,
}

/// Turns a raw notification into a change for the comment forest.
///
/// Returns `Ok(None)` for notifications that are none of our business: other
/// tables, or rows the filter rejects. Returns an error for notifications that
/// should concern us but cannot be understood.
pub fn normalize_event(
    evt: &ChangeEvent,
    filter: &ChangeFilter,
) -> anyhow::Result<Option<RemoteChange>> {
    if evt.table != COMMENTS_TABLE {
        return Ok(None);
    }
    let post_id = match evt.record.get("post_id") {
        None | Some(serde_json::Value::Null) => None,
        Some(p) => Some(
            serde_json::from_value::<PostId>(p.clone()).context("parsing post id of change")?,
        ),
    };
    if !filter.accepts(post_id.as_ref()) {
        return Ok(None);
    }
    let change = match evt.kind {
        ChangeKind::Insert => {
            let mut record: CommentRecord = serde_json::from_value(evt.record.clone())
                .context("parsing inserted comment")?;
            record.is_pending = false;
            RemoteChange::Insert(record)
        }
        ChangeKind::Update => RemoteChange::Update(
            serde_json::from_value(evt.record.clone()).context("parsing comment update")?,
        ),
        ChangeKind::Delete => {
            let id = evt
                .record
                .get("id")
                .cloned()
                .ok_or_else(|| anyhow!("delete notification carries no id"))?;
            RemoteChange::Delete(
                serde_json::from_value::<CommentId>(id).context("parsing deleted comment id")?,
            )
        }
    };
    Ok(Some(change))
}

struct ActiveFeed {
    cancel: oneshot::Sender<()>,
    state: watch::Receiver<FeedState>,
    task: JoinHandle<()>,
}

/// Keeps at most one live subscription per topic, reconnecting with
/// exponential backoff when the connection drops
pub struct FeedManager<T: ?Sized> {
    transport: Arc<T>,
    config: FeedConfig,
    feeds: Arc<Mutex<HashMap<TopicKey, ActiveFeed>>>,
}

impl<T: ?Sized> Clone for FeedManager<T> {
    fn clone(&self) -> Self {
        FeedManager {
            transport: self.transport.clone(),
            config: self.config.clone(),
            feeds: self.feeds.clone(),
        }
    }
}

impl<T: ?Sized + ChangeTransport + 'static> FeedManager<T> {
    pub fn new(transport: Arc<T>, config: FeedConfig) -> FeedManager<T> {
        FeedManager {
            transport,
            config,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts relaying the changes of `topic` into `sink`. Returns `false`,
    /// dropping `sink`, if the topic already has a live feed.
    pub fn subscribe(
        &self,
        topic: TopicKey,
        filter: ChangeFilter,
        sink: mpsc::UnboundedSender<RemoteChange>,
    ) -> bool {
        let mut feeds = self.feeds.lock();
        if let Some(feed) = feeds.get(&topic) {
            if !feed.task.is_finished() {
                tracing::debug!(%topic, "change feed already active");
                return false;
            }
        }
        let (cancel, cancelled) = oneshot::channel();
        let (state_sender, state) = watch::channel(FeedState::Connecting);
        let task = tokio::spawn(run_feed(
            self.transport.clone(),
            self.config.clone(),
            topic.clone(),
            filter,
            sink,
            state_sender,
            cancelled,
        ));
        feeds.insert(
            topic,
            ActiveFeed {
                cancel,
                state,
                task,
            },
        );
        true
    }

    /// Stops the feed and releases its subscription. Returns `false` if there
    /// was no feed for this topic.
    pub async fn unsubscribe(&self, topic: &TopicKey) -> bool {
        let feed = match self.feeds.lock().remove(topic) {
            Some(feed) => feed,
            None => return false,
        };
        let _ = feed.cancel.send(());
        if let Err(err) = feed.task.await {
            tracing::error!(%topic, ?err, "change feed task crashed");
        }
        true
    }

    pub async fn unsubscribe_all(&self) {
        let topics = self.topics();
        for t in topics {
            self.unsubscribe(&t).await;
        }
    }

    pub fn state(&self, topic: &TopicKey) -> Option<FeedState> {
        self.feeds.lock().get(topic).map(|f| *f.state.borrow())
    }

    pub fn state_changes(&self, topic: &TopicKey) -> Option<watch::Receiver<FeedState>> {
        self.feeds.lock().get(topic).map(|f| f.state.clone())
    }

    pub fn topics(&self) -> Vec<TopicKey> {
        self.feeds.lock().keys().cloned().collect()
    }
}

async fn run_feed<T: ?Sized + ChangeTransport>(
    transport: Arc<T>,
    config: FeedConfig,
    topic: TopicKey,
    filter: ChangeFilter,
    sink: mpsc::UnboundedSender<RemoteChange>,
    state: watch::Sender<FeedState>,
    mut cancelled: oneshot::Receiver<()>,
) {
    // Dropping the manager's end counts as a cancellation too
    macro_rules! close {
        ( $handle:expr ) => {{
            if let Some(handle) = $handle {
                if let Err(err) = transport.unsubscribe(handle).await {
                    tracing::warn!(%topic, ?err, "failed releasing subscription");
                }
            }
            tracing::info!(%topic, "closed change feed");
            let _ = state.send(FeedState::Closed);
            return;
        }};
    }

    let mut failures = 0;
    'reconnect: loop {
        let res = tokio::select! {
            _ = &mut cancelled => close!(None),
            res = transport.subscribe(&topic, &filter) => res,
        };
        let mut sub = match res {
            Ok(sub) => sub,
            Err(err) => {
                failures += 1;
                if failures >= config.max_attempts {
                    tracing::error!(%topic, ?err, failures, "giving up on change feed");
                    let _ = state.send(FeedState::Failed);
                    return;
                }
                tracing::warn!(%topic, ?err, failures, "failed subscribing to change feed");
                let _ = state.send(FeedState::Reconnecting {
                    attempt: failures + 1,
                });
                tokio::select! {
                    _ = &mut cancelled => close!(None),
                    _ = tokio::time::sleep(config.backoff(failures)) => continue 'reconnect,
                }
            }
        };

        let connected_at = tokio::time::Instant::now();
        tracing::info!(%topic, "subscribed to change feed");
        let _ = state.send(FeedState::Connected);
        loop {
            tokio::select! {
                _ = &mut cancelled => close!(Some(sub.handle)),
                evt = sub.events.next() => match evt {
                    None => {
                        tracing::warn!(%topic, "lost change feed connection");
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(%topic, ?err, "change feed errored out");
                        break;
                    }
                    Some(Ok(evt)) => match normalize_event(&evt, &filter) {
                        Ok(Some(change)) => {
                            tracing::trace!(%topic, kind = ?change.kind(), id = ?change.comment_id(), "received change");
                            if sink.unbounded_send(change).is_err() {
                                tracing::debug!(%topic, "nobody listens to the change feed anymore");
                                close!(Some(sub.handle));
                            }
                        }
                        Ok(None) => tracing::trace!(%topic, ?evt, "ignoring unrelated notification"),
                        Err(err) => tracing::warn!(%topic, ?err, ?evt, "dropping malformed notification"),
                    },
                },
            }
        }

        if let Err(err) = transport.unsubscribe(sub.handle).await {
            tracing::debug!(%topic, ?err, "failed releasing dead subscription");
        }
        match connected_at.elapsed() >= config.stable_after() {
            true => failures = 0,
            false => {
                failures += 1;
                tracing::debug!(%topic, failures, "change feed dropped right after connecting");
                if failures >= config.max_attempts {
                    tracing::error!(%topic, failures, "giving up on flapping change feed");
                    let _ = state.send(FeedState::Failed);
                    return;
                }
            }
        }
        let _ = state.send(FeedState::Reconnecting {
            attempt: failures + 1,
        });
        tokio::select! {
            _ = &mut cancelled => close!(None),
            _ = tokio::time::sleep(config.backoff(failures)) => (),
        }
    }
}
