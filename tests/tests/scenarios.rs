use std::{sync::Arc, time::Duration};

use threadline_api::{
    AuthorProfile, CommentId, CommentRecord, Error, NewComment, Persistence, PostId, SortMode,
    UserId,
};
use threadline_client::{
    CommentNode, CommentStore, FeedConfig, FeedState, StatusMessage, StoreAction, StoreConfig,
};
use threadline_mock_server::{MockOp, MockServer};

type Store = CommentStore<MockServer, MockServer>;

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }
}

fn post() -> PostId {
    PostId::from("post")
}

async fn open(server: &MockServer) -> Store {
    init_tracing();
    let config = StoreConfig {
        feed: FeedConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: 3,
            ..FeedConfig::default()
        },
        ..StoreConfig::default()
    };
    CommentStore::open(
        post(),
        Arc::new(server.clone()),
        Arc::new(server.clone()),
        config,
    )
    .await
    .unwrap()
}

async fn wait_until(store: &Store, what: &str, pred: impl Fn(&[CommentNode]) -> bool) {
    let mut changes = store.changes();
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            changes.borrow_and_update();
            if pred(&store.comments()) {
                return;
            }
            changes.changed().await.unwrap();
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {what}");
}

fn find<'a>(forest: &'a [CommentNode], id: &CommentId) -> Option<&'a CommentNode> {
    CommentNode::find_in(forest, id)
}

fn is_sorted(forest: &[CommentNode], mode: SortMode) -> bool {
    let ok = forest.windows(2).all(|w| match mode {
        SortMode::Best => w[0].record.like_count >= w[1].record.like_count,
        SortMode::Newest => w[0].record.created_at >= w[1].record.created_at,
        SortMode::Oldest => w[0].record.created_at <= w[1].record.created_at,
    });
    ok && forest.iter().all(|c| is_sorted(&c.children, mode))
}

fn seeded(id: &str, parent: Option<&str>, likes: u32, minutes: i64) -> CommentRecord {
    CommentRecord {
        id: CommentId::from(id),
        post_id: post(),
        parent_id: parent.map(CommentId::from),
        author_id: UserId::from("user0"),
        body: format!("comment {id}"),
        created_at: tests::start_time() + chrono::Duration::minutes(minutes),
        like_count: likes,
        reply_count: 0,
        author_profile: None,
        is_pending: false,
    }
}

#[tokio::test]
async fn generated_thread_loads_in_every_sort_mode() {
    let server = MockServer::new();
    for (user, profile) in tests::gen_profiles() {
        server.add_profile(user, profile);
    }
    let thread = tests::gen_thread(&mut rand::thread_rng(), &post(), 500);
    server.seed(thread.clone());
    let store = open(&server).await;

    let forest = store.comments();
    assert_eq!(CommentNode::count(&forest), thread.len());
    for c in &thread {
        let node = find(&forest, &c.id).expect("comment missing from the forest");
        assert_eq!(node.children.len(), c.reply_count as usize);
        assert!(node.record.author_profile.is_some());
        assert!(node
            .children
            .iter()
            .all(|child| child.record.parent_id.as_ref() == Some(&c.id)));
    }
    for mode in SortMode::ALL {
        store.set_sort_mode(mode);
        assert!(is_sorted(&store.comments(), mode), "not sorted by {mode}");
        assert_eq!(CommentNode::count(&store.comments()), thread.len());
    }
    store.close().await;
}

#[tokio::test]
async fn two_readers_converge() {
    let server = MockServer::new();
    let alice = open(&server).await;
    let bob = open(&server).await;
    let alice_profile = AuthorProfile {
        display_name: String::from("Alice"),
        avatar_url: None,
    };
    server.add_profile(UserId::from("alice"), alice_profile.clone());

    let question = alice
        .add_comment(UserId::from("alice"), "why?", None, Some(alice_profile.clone()))
        .await
        .unwrap();
    wait_until(&bob, "bob to see the question", |f| find(f, &question.id).is_some()).await;
    assert_eq!(
        bob.find(&question.id).unwrap().author_profile,
        Some(alice_profile)
    );

    let answer = bob
        .add_comment(UserId::from("bob"), "because", Some(question.id.clone()), None)
        .await
        .unwrap();
    wait_until(&alice, "alice to see the answer", |f| {
        find(f, &question.id).map_or(false, |q| {
            q.children.len() == 1 && q.children[0].record.id == answer.id
        })
    })
    .await;

    server.like(&answer.id, 3).unwrap();
    for store in [&alice, &bob] {
        wait_until(store, "the like", |f| {
            find(f, &answer.id).map_or(false, |a| a.record.like_count == 3)
        })
        .await;
        let forest = store.comments();
        assert_eq!(CommentNode::count(&forest), 2);
        assert!(CommentNode::flatten(&forest).all(|c| !c.record.is_pending));
    }

    alice.delete_comment(&question.id).await.unwrap();
    for store in [&alice, &bob] {
        wait_until(store, "the deletion", |f| f.is_empty()).await;
    }
    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn network_failure_leaves_no_trace() {
    let server = MockServer::new();
    let store = open(&server).await;
    let mut statuses = store.statuses();
    server.fail_next(MockOp::Create, Error::Persistence(String::from("connection reset")));

    let res = store
        .add_comment(UserId::from("user1"), "hello", None, None)
        .await;
    assert!(res.unwrap_err().is_persistence());
    assert_eq!(
        statuses.recv().await.unwrap(),
        StatusMessage::Failed {
            action: StoreAction::Post,
            error: Error::Persistence(String::from("connection reset")),
        }
    );
    assert!(CommentNode::flatten(&store.comments()).all(|c| c.record.body != "hello"));
    assert!(server.comments(&post()).is_empty());
    store.close().await;
}

#[tokio::test]
async fn echo_arriving_before_the_response() {
    let server = MockServer::new();
    let store = Arc::new(open(&server).await);
    let gate = server.gate_creates();

    let task = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .add_comment(UserId::from("user1"), "fast echo", None, None)
                .await
        })
    };
    // the echo replaces the pending comment while the response is held back
    wait_until(&store, "the echo", |f| {
        f.len() == 1 && !f[0].record.is_pending && !f[0].record.id.is_temporary()
    })
    .await;
    let echoed = store.comments()[0].record.id.clone();

    gate.open();
    let confirmed = task.await.unwrap().unwrap();
    assert_eq!(confirmed.id, echoed);
    assert_eq!(CommentNode::count(&store.comments()), 1);
}

#[tokio::test]
async fn best_and_newest_orders() {
    let server = MockServer::new();
    server.seed(vec![
        seeded("a", None, 5, 1),
        seeded("b", Some("a"), 10, 2),
    ]);
    let store = open(&server).await;
    let shape = |store: &Store| {
        store
            .comments()
            .iter()
            .map(|c| {
                (
                    c.id().to_string(),
                    c.children.iter().map(|c| c.id().to_string()).collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>()
    };
    let expected = vec![(String::from("a"), vec![String::from("b")])];
    assert_eq!(shape(&store), expected);
    store.set_sort_mode(SortMode::Newest);
    assert_eq!(shape(&store), expected);

    let c = server
        .create_comment(NewComment {
            post_id: post(),
            author_id: UserId::from("user2"),
            body: String::from("comment c"),
            parent_id: None,
        })
        .await
        .unwrap();
    server.like(&c.id, 1).unwrap();
    wait_until(&store, "comment c and its like", |f| {
        find(f, &c.id).map_or(false, |c| c.record.like_count == 1)
    })
    .await;
    store.set_sort_mode(SortMode::Best);
    let roots = store
        .comments()
        .iter()
        .map(|c| c.id().clone())
        .collect::<Vec<_>>();
    assert_eq!(roots, vec![CommentId::from("a"), c.id]);
    store.close().await;
}

#[tokio::test]
async fn refresh_catches_up_after_an_outage() {
    let server = MockServer::new();
    let store = open(&server).await;
    server.fail_subscriptions(100);
    server.disconnect_feeds();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.feed_state() != FeedState::Failed {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("feed never gave up");

    // written while nobody was listening
    let missed = server
        .create_comment(NewComment {
            post_id: post(),
            author_id: UserId::from("user2"),
            body: String::from("missed"),
            parent_id: None,
        })
        .await
        .unwrap();
    assert!(store.find(&missed.id).is_none());

    server.fail_subscriptions(0);
    store.refresh().await.unwrap();
    assert_eq!(store.feed_state(), FeedState::Connected);
    assert!(store.find(&missed.id).is_some());

    server.like(&missed.id, 7).unwrap();
    wait_until(&store, "the like after reconnecting", |f| {
        find(f, &missed.id).map_or(false, |c| c.record.like_count == 7)
    })
    .await;
    store.close().await;
}
