use asupersync::runtime::RuntimeBuilder;
use countercache::{Change, CounterCache, Declaration, Hop, Registry, Snapshot};
use countercache_core::{Connection, Cx, Executor, Outcome, TransactionOps, Value};
use countercache_sqlite::SqliteConnection;

fn unwrap_outcome<T, E: std::fmt::Display>(outcome: Outcome<T, E>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

fn blog_schema(conn: &SqliteConnection) {
    conn.execute_raw(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, blog_id INTEGER, comments_count INTEGER NOT NULL DEFAULT 0, updated_at TEXT);
         CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER, body TEXT);
         INSERT INTO posts (id, comments_count) VALUES (1, 0), (2, 0);",
    )
    .expect("create schema");
}

fn comments_cache() -> CounterCache {
    let mut registry = Registry::new();
    registry
        .register(
            "comments",
            Declaration::belongs_to("post_id", "posts", "comments_count"),
        )
        .expect("register");
    CounterCache::new(registry)
}

async fn counter(cx: &Cx, conn: &impl Executor, sql: &str, id: i64) -> i64 {
    let row = unwrap_outcome(conn.query_one(cx, sql, &[Value::BigInt(id)]).await)
        .expect("target row exists");
    row.get(0).and_then(Value::as_i64).expect("numeric counter")
}

async fn comments_count(cx: &Cx, conn: &impl Executor, post: i64) -> i64 {
    counter(cx, conn, "SELECT comments_count FROM posts WHERE id = $1", post).await
}

async fn insert_comment(cx: &Cx, exec: &impl Executor, id: i64, post: i64) -> Snapshot {
    unwrap_outcome(
        exec.execute(
            cx,
            "INSERT INTO comments (id, post_id) VALUES ($1, $2)",
            &[Value::BigInt(id), Value::BigInt(post)],
        )
        .await,
    );
    Snapshot::new("comments")
        .with("id", id)
        .with("post_id", post)
}

#[test]
fn comments_scenario_create_destroy_reassign() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let cache = comments_cache();

        let mut comments = Vec::new();
        for id in 1..=3 {
            let comment = insert_comment(&cx, &conn, id, 1).await;
            unwrap_outcome(cache.on_created(&cx, &conn, None, &comment).await);
            comments.push(comment);
        }
        assert_eq!(comments_count(&cx, &conn, 1).await, 3);

        let destroyed = comments.remove(0);
        unwrap_outcome(
            conn.execute(&cx, "DELETE FROM comments WHERE id = 1", &[])
                .await,
        );
        unwrap_outcome(cache.on_destroyed(&cx, &conn, None, &destroyed).await);
        assert_eq!(comments_count(&cx, &conn, 1).await, 2);

        unwrap_outcome(
            conn.execute(&cx, "UPDATE comments SET post_id = 2 WHERE id = 2", &[])
                .await,
        );
        let moved = Change::from_snapshots(
            &comments[0],
            comments[0].clone().with("post_id", 2_i64),
        );
        unwrap_outcome(cache.on_updated(&cx, &conn, None, &moved).await);
        assert_eq!(comments_count(&cx, &conn, 1).await, 1);
        assert_eq!(comments_count(&cx, &conn, 2).await, 1);
    });
}

#[test]
fn reassignment_preserves_combined_total() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        conn.execute_raw(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY, post_id INTEGER, weight INTEGER)",
        )
        .expect("create ledger");
        let mut registry = Registry::new();
        registry
            .register(
                "ledger",
                Declaration::belongs_to("post_id", "posts", "comments_count")
                    .delta_column("weight"),
            )
            .expect("register");
        let cache = CounterCache::new(registry);

        let entry = Snapshot::new("ledger")
            .with("id", 1_i64)
            .with("post_id", 1_i64)
            .with("weight", 5_i64);
        unwrap_outcome(cache.on_created(&cx, &conn, None, &entry).await);
        let other = entry.clone().with("id", 2_i64).with("post_id", 2_i64).with("weight", 2_i64);
        unwrap_outcome(cache.on_created(&cx, &conn, None, &other).await);

        let before = comments_count(&cx, &conn, 1).await + comments_count(&cx, &conn, 2).await;
        let moved = Change::new(entry.clone().with("post_id", 2_i64)).changed("post_id", 1_i64);
        unwrap_outcome(cache.on_updated(&cx, &conn, None, &moved).await);

        assert_eq!(comments_count(&cx, &conn, 1).await, 0);
        assert_eq!(comments_count(&cx, &conn, 2).await, 7);
        let after = comments_count(&cx, &conn, 1).await + comments_count(&cx, &conn, 2).await;
        assert_eq!(before, after);
    });
}

#[test]
fn sum_cache_scenario() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        conn.execute_raw(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, total_amount INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE transactions (id INTEGER PRIMARY KEY, account_id INTEGER, amount INTEGER);
             INSERT INTO accounts (id) VALUES (1);",
        )
        .expect("create schema");
        let mut registry = Registry::new();
        registry
            .register(
                "transactions",
                Declaration::belongs_to("account_id", "accounts", "total_amount")
                    .delta_column("amount"),
            )
            .expect("register");
        let cache = CounterCache::new(registry);

        let mut created = Vec::new();
        for (id, amount) in [(1_i64, 10_i64), (2, -3), (3, 7)] {
            let tx = Snapshot::new("transactions")
                .with("id", id)
                .with("account_id", 1_i64)
                .with("amount", amount);
            unwrap_outcome(cache.on_created(&cx, &conn, None, &tx).await);
            created.push(tx);
        }
        let total = "SELECT total_amount FROM accounts WHERE id = $1";
        assert_eq!(counter(&cx, &conn, total, 1).await, 14);

        let change = Change::new(created[0].clone().with("amount", 20_i64)).changed("amount", 10_i64);
        let summary = unwrap_outcome(cache.on_updated(&cx, &conn, None, &change).await);
        assert_eq!(summary.applied, 1);
        assert_eq!(counter(&cx, &conn, total, 1).await, 24);
    });
}

#[test]
fn polymorphic_multi_level_scenario() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        conn.execute_raw(
            "CREATE TABLE blogs (id INTEGER PRIMARY KEY, comments_count INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE posts (id INTEGER PRIMARY KEY, blog_id INTEGER);
             CREATE TABLE videos (id INTEGER PRIMARY KEY);
             CREATE TABLE comments (id INTEGER PRIMARY KEY, commentable_type TEXT, commentable_id INTEGER);
             INSERT INTO blogs (id) VALUES (1), (2);
             INSERT INTO posts (id, blog_id) VALUES (10, 2);
             INSERT INTO videos (id) VALUES (20);",
        )
        .expect("create schema");
        let mut registry = Registry::new();
        registry
            .register(
                "comments",
                Declaration::new(
                    [
                        Hop::polymorphic("commentable_type", "commentable_id")
                            .target("Post", "posts"),
                        Hop::belongs_to("blog_id", "blogs"),
                    ],
                    "comments_count",
                ),
            )
            .expect("register");
        let cache = CounterCache::new(registry);
        let blog_count = "SELECT comments_count FROM blogs WHERE id = $1";

        let on_post = Snapshot::new("comments")
            .with("id", 1_i64)
            .with("commentable_type", "Post")
            .with("commentable_id", 10_i64);
        let summary = unwrap_outcome(cache.on_created(&cx, &conn, None, &on_post).await);
        assert_eq!(summary.applied, 1);
        assert_eq!(counter(&cx, &conn, blog_count, 2).await, 1);

        let on_video = Snapshot::new("comments")
            .with("id", 2_i64)
            .with("commentable_type", "Video")
            .with("commentable_id", 20_i64);
        let summary = unwrap_outcome(cache.on_created(&cx, &conn, None, &on_video).await);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.applied, 0);
        assert_eq!(counter(&cx, &conn, blog_count, 1).await, 0);
        assert_eq!(counter(&cx, &conn, blog_count, 2).await, 1);
    });
}

#[test]
fn attaching_an_uncaptured_key_increments_new_target() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let cache = comments_cache();

        let before = Snapshot::new("comments").with("id", 1_i64);
        let after = before.clone().with("post_id", 2_i64);
        let change = Change::from_snapshots(&before, after);
        assert!(change.is_changed("post_id"));

        let summary = unwrap_outcome(cache.on_updated(&cx, &conn, None, &change).await);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(comments_count(&cx, &conn, 2).await, 1);
        assert_eq!(comments_count(&cx, &conn, 1).await, 0);
    });
}

#[test]
fn batch_coalesces_into_one_statement() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let cache = comments_cache();

        let tx = unwrap_outcome(conn.begin(&cx).await);
        let mut batch = cache.begin_batch();
        for id in 1..=5 {
            let comment = insert_comment(&cx, &tx, id, 1).await;
            unwrap_outcome(cache.on_created(&cx, &tx, Some(&mut batch), &comment).await);
        }
        let destroyed = Snapshot::new("comments").with("id", 5_i64).with("post_id", 1_i64);
        unwrap_outcome(cache.on_destroyed(&cx, &tx, Some(&mut batch), &destroyed).await);
        assert_eq!(comments_count(&cx, &tx, 1).await, 0);

        let flushed = unwrap_outcome(cache.end_batch(&cx, &tx, batch, true).await);
        assert_eq!(flushed.statements, 1);
        assert_eq!(flushed.events, 6);
        unwrap_outcome(tx.commit(&cx).await);

        assert_eq!(comments_count(&cx, &conn, 1).await, 4);
    });
}

#[test]
fn rolled_back_increments_leave_counter_unchanged() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let cache = comments_cache();
        let comment = Snapshot::new("comments").with("post_id", 1_i64);

        // Unbatched: statements run inside the transaction and roll back with it.
        let tx = unwrap_outcome(conn.begin(&cx).await);
        for _ in 0..5 {
            unwrap_outcome(cache.on_created(&cx, &tx, None, &comment).await);
        }
        assert_eq!(comments_count(&cx, &tx, 1).await, 5);
        unwrap_outcome(tx.rollback(&cx).await);
        assert_eq!(comments_count(&cx, &conn, 1).await, 0);

        // Batched: the batch is discarded and nothing is issued.
        let tx = unwrap_outcome(conn.begin(&cx).await);
        let mut batch = cache.begin_batch();
        for _ in 0..5 {
            unwrap_outcome(cache.on_created(&cx, &tx, Some(&mut batch), &comment).await);
        }
        unwrap_outcome(cache.end_batch(&cx, &tx, batch, false).await);
        unwrap_outcome(tx.rollback(&cx).await);
        assert_eq!(comments_count(&cx, &conn, 1).await, 0);
    });
}

#[test]
fn missing_target_is_not_an_error() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let cache = comments_cache();
        let orphan = Snapshot::new("comments").with("post_id", 404_i64);
        let summary = unwrap_outcome(cache.on_created(&cx, &conn, None, &orphan).await);
        assert_eq!(summary.missing, 1);
    });
}

#[test]
fn touch_sets_timestamp() {
    let cx = Cx::for_testing();
    block_on(async {
        let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
        blog_schema(&conn);
        let mut registry = Registry::new();
        registry
            .register(
                "comments",
                Declaration::belongs_to("post_id", "posts", "comments_count")
                    .touch(countercache::Touch::UpdatedAt),
            )
            .expect("register");
        let cache = CounterCache::new(registry);
        let comment = Snapshot::new("comments").with("post_id", 1_i64);
        unwrap_outcome(cache.on_created(&cx, &conn, None, &comment).await);

        let row = unwrap_outcome(
            conn.query_one(&cx, "SELECT updated_at FROM posts WHERE id = 1", &[])
                .await,
        )
        .expect("post exists");
        assert!(
            row.get(0)
                .and_then(Value::as_str)
                .is_some_and(|ts| ts.len() >= 10)
        );
        let untouched = unwrap_outcome(
            conn.query_one(&cx, "SELECT updated_at FROM posts WHERE id = 2", &[])
                .await,
        )
        .expect("post exists");
        assert_eq!(untouched.get(0), Some(&Value::Null));
    });
}
