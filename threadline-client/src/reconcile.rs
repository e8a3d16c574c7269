use std::{
    collections::{HashMap, HashSet, VecDeque},
    slice,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::{
    api::{
        self, AuthorProfile, CommentId, CommentRecord, Error, NewComment, Persistence, PostId,
        RemoteChange, SortMode, UserId,
    },
    build_tree, CommentNode, SortExt,
};

/// What happens to the replies of a comment deleted by someone else
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Replies disappear along with their parent
    #[default]
    Drop,
    /// Replies move up to the level of their deleted parent
    Promote,
}

/// Owns the comment forest of one view, and merges into it the local
/// optimistic writes, their confirmations and the changes pushed by the server.
///
/// Every mutation of the forest happens in a short critical section that is
/// never held across an `.await`, so concurrent tasks see each mutation as
/// atomic, in the order they reach the lock.
pub struct Reconciler<P: ?Sized> {
    persistence: Arc<P>,
    forest: Arc<Mutex<Forest>>,
}

impl<P: ?Sized> Clone for Reconciler<P> {
    fn clone(&self) -> Self {
        Reconciler {
            persistence: self.persistence.clone(),
            forest: self.forest.clone(),
        }
    }
}

impl<P: ?Sized> Reconciler<P> {
    pub fn new(persistence: Arc<P>, sort_mode: SortMode, orphan_policy: OrphanPolicy) -> Self {
        Reconciler {
            persistence,
            forest: Arc::new(Mutex::new(Forest::new(sort_mode, orphan_policy))),
        }
    }

    /// Sorted forest, as of now
    pub fn snapshot(&self) -> Arc<Vec<CommentNode>> {
        self.forest.lock().roots.clone()
    }

    /// Revision counter, bumped after every visible change of the forest
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.forest.lock().revision.subscribe()
    }

    pub fn find(&self, id: &CommentId) -> Option<CommentRecord> {
        CommentNode::find_in(&self.forest.lock().roots, id).map(|c| c.record.clone())
    }

    pub fn sort_mode(&self) -> SortMode {
        self.forest.lock().sort_mode
    }

    pub fn set_sort_mode(&self, mode: SortMode) {
        let mut forest = self.forest.lock();
        forest.sort_mode = mode;
        forest.notify(true);
    }

    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.forest.lock().orphan_policy
    }

    pub fn set_orphan_policy(&self, policy: OrphanPolicy) {
        self.forest.lock().orphan_policy = policy;
    }

    /// Returns whether the forest changed
    pub fn apply_remote_change(&self, change: RemoteChange) -> bool {
        self.forest.lock().apply_remote(change)
    }

    /// Starts holding back remote changes until the matching `finish_reload`,
    /// so that a refetch cannot erase changes that happened while it was in flight
    pub fn begin_reload(&self) {
        let mut forest = self.forest.lock();
        if forest.held_back.is_none() {
            forest.held_back = Some(VecDeque::new());
        }
    }

    /// Replaces the forest with a freshly fetched list of comments, keeps the
    /// comments still pending, then replays the changes held back meanwhile
    pub fn finish_reload(&self, records: Vec<CommentRecord>) {
        let mut forest = self.forest.lock();
        let held = forest.held_back.take().unwrap_or_default();
        forest.replace_all(records);
        for change in held {
            forest.apply(change);
        }
        forest.prune_aliases();
    }

    /// Gives up on a reload, applying the changes held back in the meantime
    pub fn abort_reload(&self) {
        let mut forest = self.forest.lock();
        let held = forest.held_back.take().unwrap_or_default();
        forest.landed.clear();
        for change in held {
            forest.apply(change);
        }
        forest.prune_aliases();
    }

    pub fn replace_all(&self, records: Vec<CommentRecord>) {
        self.begin_reload();
        self.finish_reload(records);
    }
}

impl<P: ?Sized + Persistence> Reconciler<P> {
    /// Shows the comment right away as pending, then submits it. Resolves to
    /// the confirmed record, or to the submission error once the pending
    /// comment was removed again.
    pub async fn add_comment(
        &self,
        post_id: PostId,
        author_id: UserId,
        body: &str,
        parent_id: Option<CommentId>,
        author_profile: Option<AuthorProfile>,
    ) -> Result<CommentRecord, Error> {
        let body = api::validate_body(body)?.to_string();
        let pending = CommentRecord::pending(post_id, author_id, body, parent_id, author_profile);
        self.forest.lock().insert_pending(pending.clone());
        tracing::debug!(id = ?pending.id, parent = ?pending.parent_id, "inserted pending comment");

        let res = match self.submit(&pending).await {
            Ok(record) => {
                let confirmed = self.forest.lock().confirm(&pending.id, record);
                Ok(confirmed)
            }
            Err(err) => {
                tracing::warn!(id = ?pending.id, ?err, "comment submission failed, rolling back");
                self.forest.lock().rollback(&pending);
                Err(err)
            }
        };
        self.forest.lock().settle(&pending.id);
        res
    }

    async fn submit(&self, pending: &CommentRecord) -> Result<CommentRecord, Error> {
        let parent_id = self.confirmed_parent(pending).await?;
        let new = NewComment {
            post_id: pending.post_id.clone(),
            author_id: pending.author_id.clone(),
            body: pending.body.clone(),
            parent_id,
        };
        new.validate()?;
        self.persistence.create_comment(new).await
    }

    /// Server id of the parent, waiting for it if the parent is itself pending
    async fn confirmed_parent(&self, pending: &CommentRecord) -> Result<Option<CommentId>, Error> {
        let parent = match &pending.parent_id {
            Some(p) if p.is_temporary() => p.clone(),
            other => return Ok(other.clone()),
        };
        let state = self.forest.lock().parent_state(&parent);
        let confirmed = match state {
            ParentState::Confirmed(id) => Some(id),
            ParentState::Pending(waiter) => waiter.await.ok().flatten(),
            ParentState::Gone => None,
        };
        match confirmed {
            Some(id) => Ok(Some(id)),
            None => Err(Error::Persistence(format!(
                "parent comment {parent} was never confirmed"
            ))),
        }
    }
}

enum ParentState {
    Confirmed(CommentId),
    Pending(oneshot::Receiver<Option<CommentId>>),
    Gone,
}

struct Forest {
    roots: Arc<Vec<CommentNode>>,
    sort_mode: SortMode,
    orphan_policy: OrphanPolicy,

    /// Temporary id -> server id of the same comment, kept while something
    /// may still refer to the temporary id
    confirmed: HashMap<CommentId, CommentId>,

    /// Submissions not answered yet: temporary id -> parent as submitted
    in_flight: HashMap<CommentId, Option<CommentId>>,

    /// Our comments confirmed while a reload is in flight, which the refetch
    /// may predate
    landed: Vec<CommentId>,

    /// Pending reply -> parent whose reply count it bumped
    bumped: HashMap<CommentId, CommentId>,

    /// Replies submitted under a pending comment, waiting for its server id
    waiters: HashMap<CommentId, Vec<oneshot::Sender<Option<CommentId>>>>,

    held_back: Option<VecDeque<RemoteChange>>,
    revision: watch::Sender<u64>,
}

impl Forest {
    fn new(sort_mode: SortMode, orphan_policy: OrphanPolicy) -> Forest {
        Forest {
            roots: Arc::new(Vec::new()),
            sort_mode,
            orphan_policy,
            confirmed: HashMap::new(),
            in_flight: HashMap::new(),
            landed: Vec::new(),
            bumped: HashMap::new(),
            waiters: HashMap::new(),
            held_back: None,
            revision: watch::channel(0).0,
        }
    }

    fn notify(&mut self, resort: bool) {
        if resort {
            let mode = self.sort_mode;
            let roots = Arc::make_mut(&mut self.roots);
            mode.sort(roots);
        }
        self.revision.send_modify(|r| *r += 1);
    }

    fn contains(&self, id: &CommentId) -> bool {
        CommentNode::find_in(&self.roots, id).is_some()
    }

    fn insert_pending(&mut self, record: CommentRecord) {
        let temp = record.id.clone();
        let parent = record.parent_id.clone();
        self.in_flight.insert(temp.clone(), parent.clone());
        let roots = Arc::make_mut(&mut self.roots);
        let attached = CommentNode::insert_into(roots, CommentNode::from(record));
        if let (true, Some(parent)) = (attached, parent) {
            if let Some(p) = CommentNode::find_in_mut(roots, &parent) {
                p.record.reply_count += 1;
            }
            self.bumped.insert(temp, parent);
        }
        self.notify(true);
    }

    fn confirm(&mut self, temp: &CommentId, record: CommentRecord) -> CommentRecord {
        let record = match self.contains(&record.id) && self.contains(temp) {
            true => self.drop_stale(temp, record),
            false => self.receive(Some(temp), record),
        };
        self.resolve(temp, &record.id);
        if self.held_back.is_some() {
            self.landed.push(record.id.clone());
        }
        self.notify(true);
        record
    }

    /// The submission of `temp` got its answer, confirmed or not
    fn settle(&mut self, temp: &CommentId) {
        self.in_flight.remove(temp);
        self.prune_aliases();
    }

    /// Forgets the aliases of temporary ids nothing refers to anymore: not a
    /// submission in flight, not the parent of one, not the parent of a
    /// pending comment
    fn prune_aliases(&mut self) {
        if self.held_back.is_some() || self.confirmed.is_empty() {
            return;
        }
        let mut referenced = self
            .in_flight
            .iter()
            .flat_map(|(temp, parent)| std::iter::once(temp).chain(parent))
            .chain(self.bumped.values())
            .cloned()
            .collect::<HashSet<_>>();
        referenced.extend(
            CommentNode::flatten(&self.roots)
                .filter(|c| c.record.is_pending)
                .filter_map(|c| c.record.parent_id.clone()),
        );
        let before = self.confirmed.len();
        self.confirmed.retain(|temp, _| referenced.contains(temp));
        tracing::trace!(pruned = before - self.confirmed.len(), "pruned confirmed aliases");
    }

    /// The change feed delivered the comment without recognizing it as ours,
    /// eg. because the server rewrote its body: the pending version goes, its
    /// replies move over to the confirmed one
    fn drop_stale(&mut self, temp: &CommentId, record: CommentRecord) -> CommentRecord {
        let roots = Arc::make_mut(&mut self.roots);
        let mut stale = match CommentNode::remove_from(roots, temp) {
            Some(stale) => stale,
            None => return record,
        };
        tracing::debug!(pending = ?temp, id = ?record.id, "comment already received through the change feed");
        for c in stale.children.iter_mut() {
            c.record.parent_id = Some(record.id.clone());
        }
        match CommentNode::find_in_mut(roots, &record.id) {
            Some(confirmed) => {
                confirmed.record.reply_count =
                    confirmed.record.reply_count.max(stale.record.reply_count);
                if confirmed.record.author_profile.is_none() {
                    confirmed.record.author_profile = stale.record.author_profile.take();
                }
                confirmed.children.append(&mut stale.children);
                confirmed.record.clone()
            }
            None => {
                roots.append(&mut stale.children);
                record
            }
        }
    }

    /// Brings a confirmed record into the forest, replacing the pending
    /// comment it stands for if there is one. Returns the record as it now
    /// stands in the forest.
    fn receive(&mut self, temp: Option<&CommentId>, mut record: CommentRecord) -> CommentRecord {
        record.is_pending = false;
        if let Some(existing) = CommentNode::find_in(&self.roots, &record.id) {
            tracing::debug!(id = ?record.id, "comment already known, not inserting it again");
            return existing.record.clone();
        }

        // The local temporary id wins, then the first identical submission
        let stand_in = temp
            .filter(|t| {
                CommentNode::find_in(&self.roots, t).map_or(false, |c| c.record.is_pending)
            })
            .cloned()
            .or_else(|| {
                CommentNode::flatten(&self.roots)
                    .find(|c| c.record.is_pending && c.record.same_submission(&record))
                    .map(|c| c.id().clone())
            });

        let id = record.id.clone();
        let roots = Arc::make_mut(&mut self.roots);
        let target = match &stand_in {
            Some(p) => CommentNode::find_in_mut(roots, p),
            None => None,
        };
        let res = match target {
            Some(node) => {
                let profile = node.record.author_profile.take();
                let local_replies = node.record.reply_count;
                node.record = record;
                if node.record.author_profile.is_none() {
                    node.record.author_profile = profile;
                }
                // replies attached while pending are not counted by the server yet
                node.record.reply_count = node.record.reply_count.max(local_replies);
                for c in node.children.iter_mut() {
                    c.record.parent_id = Some(id.clone());
                }
                node.record.clone()
            }
            None => {
                if !CommentNode::insert_into(roots, CommentNode::from(record.clone())) {
                    tracing::debug!(?id, parent = ?record.parent_id, "parent not found, demoting comment to root");
                }
                record
            }
        };
        let adopted = CommentNode::adopt_orphans(roots, &id);
        if adopted > 0 {
            tracing::debug!(?id, adopted, "reattached replies that arrived before their parent");
        }

        if let Some(pending) = stand_in {
            tracing::debug!(?pending, ?id, "pending comment confirmed");
            self.resolve(&pending, &id);
        }
        res
    }

    /// Records that `temp` is now known as `id`, and wakes up its replies
    fn resolve(&mut self, temp: &CommentId, id: &CommentId) {
        self.confirmed.insert(temp.clone(), id.clone());
        self.bumped.remove(temp);
        for waiter in self.waiters.remove(temp).into_iter().flatten() {
            let _ = waiter.send(Some(id.clone()));
        }
    }

    fn rollback(&mut self, pending: &CommentRecord) {
        let temp = &pending.id;
        let victim = if self.contains(temp) {
            Some(temp.clone())
        } else if self.confirmed.contains_key(temp) {
            // Our comment was taken over by the confirmation of an identical
            // submission; the one still pending stands for this failed one
            CommentNode::flatten(&self.roots)
                .find(|c| c.record.is_pending && c.record.same_submission(pending))
                .map(|c| c.id().clone())
        } else {
            None
        };
        let roots = Arc::make_mut(&mut self.roots);
        let removed = match victim {
            Some(v) => CommentNode::remove_from(roots, &v),
            None => None,
        };
        let removed = match removed {
            Some(r) => r,
            None => {
                tracing::debug!(id = ?temp, "failed comment is already gone");
                return;
            }
        };

        if let Some(parent) = self.bumped.remove(removed.id()) {
            let parent = self.confirmed.get(&parent).cloned().unwrap_or(parent);
            let roots = Arc::make_mut(&mut self.roots);
            if let Some(p) = CommentNode::find_in_mut(roots, &parent) {
                p.record.reply_count = p.record.reply_count.saturating_sub(1);
            }
        }
        self.release(&removed);
        self.notify(false);
    }

    /// Fails the replies waiting on any pending comment of a removed subtree
    fn release(&mut self, removed: &CommentNode) {
        for c in CommentNode::flatten(slice::from_ref(removed)) {
            if !c.record.is_pending {
                continue;
            }
            self.bumped.remove(c.id());
            for waiter in self.waiters.remove(c.id()).into_iter().flatten() {
                let _ = waiter.send(None);
            }
        }
    }

    fn parent_state(&mut self, temp: &CommentId) -> ParentState {
        if let Some(id) = self.confirmed.get(temp) {
            return ParentState::Confirmed(id.clone());
        }
        match CommentNode::find_in(&self.roots, temp) {
            Some(c) if c.record.is_pending => {
                let (sender, receiver) = oneshot::channel();
                self.waiters.entry(temp.clone()).or_default().push(sender);
                ParentState::Pending(receiver)
            }
            _ => ParentState::Gone,
        }
    }

    fn apply_remote(&mut self, change: RemoteChange) -> bool {
        if let Some(held) = &mut self.held_back {
            held.push_back(change);
            return false;
        }
        self.apply(change)
    }

    fn apply(&mut self, change: RemoteChange) -> bool {
        match change {
            RemoteChange::Insert(record) => {
                if self.contains(&record.id) {
                    tracing::debug!(id = ?record.id, "ignoring redelivered insert");
                    return false;
                }
                self.receive(None, record);
                self.notify(true);
                true
            }
            RemoteChange::Update(patch) => {
                if !self.contains(&patch.id) {
                    tracing::debug!(id = ?patch.id, "dropping update for a comment not shown here");
                    return false;
                }
                let mode = self.sort_mode;
                let roots = Arc::make_mut(&mut self.roots);
                let resort = match CommentNode::find_in_mut(roots, &patch.id) {
                    Some(c) => {
                        let before = c.record.clone();
                        if !c.record.merge(&patch) {
                            return false;
                        }
                        mode.key_changed(&before, &c.record)
                    }
                    None => return false,
                };
                self.notify(resort);
                true
            }
            RemoteChange::Delete(id) => {
                if !self.contains(&id) {
                    tracing::debug!(?id, "ignoring delete of a comment not shown here");
                    return false;
                }
                let policy = self.orphan_policy;
                let roots = Arc::make_mut(&mut self.roots);
                let removed = match policy {
                    OrphanPolicy::Drop => CommentNode::remove_from(roots, &id),
                    OrphanPolicy::Promote => CommentNode::remove_promoting(roots, &id),
                };
                if let Some(removed) = removed {
                    self.release(&removed);
                }
                self.notify(policy == OrphanPolicy::Promote);
                true
            }
        }
    }

    fn replace_all(&mut self, records: Vec<CommentRecord>) {
        let known = CommentNode::flatten(&self.roots)
            .map(|c| c.id().clone())
            .collect::<HashSet<_>>();
        // pre-order, so pending parents come before their pending replies
        let pending = CommentNode::flatten(&self.roots)
            .filter(|c| c.record.is_pending)
            .map(|c| c.record.clone())
            .collect::<Vec<_>>();

        // confirmed after the refetch started, in confirmation order so
        // parents come before their replies
        let landed_ids = std::mem::take(&mut self.landed);
        let landed = landed_ids
            .iter()
            .filter_map(|id| CommentNode::find_in(&self.roots, id))
            .map(|c| c.record.clone())
            .collect::<Vec<_>>();

        let mut roots = build_tree(records.into_iter().map(|mut r| {
            r.is_pending = false;
            r
        }));
        for r in landed {
            if CommentNode::find_in(&roots, &r.id).is_some() {
                continue;
            }
            tracing::debug!(id = ?r.id, "keeping comment confirmed after the refetch started");
            let parent = r.parent_id.clone();
            let attached = CommentNode::insert_into(&mut roots, CommentNode::from(r));
            // a parent confirmed in the same window already counts its replies
            match parent {
                Some(p) if attached && !landed_ids.contains(&p) => {
                    if let Some(c) = CommentNode::find_in_mut(&mut roots, &p) {
                        c.record.reply_count += 1;
                    }
                }
                _ => (),
            }
        }
        let mut claimed = HashSet::new();
        for mut p in pending {
            if let Some(real) = p.parent_id.as_ref().and_then(|id| self.confirmed.get(id)) {
                p.parent_id = Some(real.clone());
            }
            // a comment we never saw before that looks exactly like ours is ours
            let confirmation = CommentNode::flatten(&roots)
                .find(|c| {
                    !known.contains(c.id())
                        && !claimed.contains(c.id())
                        && c.record.same_submission(&p)
                })
                .map(|c| c.id().clone());
            match confirmation {
                Some(id) => {
                    if let Some(c) = CommentNode::find_in_mut(&mut roots, &id) {
                        if c.record.author_profile.is_none() {
                            c.record.author_profile = p.author_profile.clone();
                        }
                    }
                    claimed.insert(id.clone());
                    self.resolve(&p.id, &id);
                }
                None => {
                    let parent = p.parent_id.clone();
                    let bumps = self.bumped.contains_key(&p.id);
                    if CommentNode::insert_into(&mut roots, CommentNode::from(p)) && bumps {
                        if let Some(c) = parent
                            .as_ref()
                            .and_then(|id| CommentNode::find_in_mut(&mut roots, id))
                        {
                            c.record.reply_count += 1;
                        }
                    }
                }
            }
        }
        tracing::debug!(count = CommentNode::count(&roots), "rebuilt comment forest");
        self.roots = Arc::new(roots);
        self.notify(true);
    }
}
