use dashmap::DashSet;
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use courier::database::models::{EventDbModel, NotificationDbModel};
use courier::database::repositories::{
    IngestTxOps, NotificationRepository, SqlxNotificationRepository,
};
use courier::database::{DbPool, run_migrations};
use courier::domain::{Channel, NewEvent, Priority, TriggerType};

async fn init_stress_pool(database_url: &str) -> DbPool {
    let connect_options = SqliteConnectOptions::from_str(database_url)
        .unwrap()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Surface SQLITE_BUSY quickly so the busy retry path runs.
        .busy_timeout(Duration::from_millis(5))
        .foreign_keys(true)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA wal_autocheckpoint = 100")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .unwrap()
}

async fn seed(pool: &DbPool, repo: &SqlxNotificationRepository, count: usize) {
    let now = chrono::Utc::now();
    let event = NewEvent::new("new_match")
        .with_actor("alice")
        .with_subject("bob")
        .validate(now)
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    IngestTxOps::insert_event(&mut conn, &EventDbModel::from_event(&event, 0).unwrap())
        .await
        .unwrap();
    drop(conn);

    let priorities = [Priority::Low, Priority::Medium, Priority::High, Priority::Critical];
    for i in 0..count {
        let n = NotificationDbModel::new(
            &event.id,
            &format!("user-{}", i % 17),
            TriggerType::NewMatch,
            Channel::Push,
            priorities[i % priorities.len()],
            &serde_json::json!({"seq": i}),
            3,
            0,
        );
        repo.enqueue(&n).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to check lease exclusivity under contention"]
async fn lease_stress_no_double_leases_or_lost_acks() {
    const NOTIFICATIONS: usize = 300;
    const WORKERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_stress_pool(&db_url).await;
    run_migrations(&pool).await.unwrap();

    let repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));
    seed(&pool, &repo, NOTIFICATIONS).await;

    // Hold the write lock in short bursts to force SQLITE_BUSY.
    let locker_pool = pool.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE notification SET updated_at = updated_at WHERE id IN (SELECT id FROM notification LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(3)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let leased_ids = Arc::new(DashSet::<String>::new());

    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let repo = repo.clone();
        let leased_ids = leased_ids.clone();
        workers.spawn(async move {
            loop {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let batch = repo
                    .lease(Channel::Push, 4, Duration::from_secs(300), now_ms)
                    .await
                    .unwrap();
                if batch.is_empty() {
                    if repo.stats().await.unwrap().pending == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for n in batch {
                    assert!(
                        leased_ids.insert(n.id.clone()),
                        "notification {} leased twice",
                        n.id
                    );
                    assert_eq!(n.attempts, 1);

                    if random::<u8>() % 3 == 0 {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                    }

                    let token = n.lease_token.clone().unwrap();
                    repo.ack(&n.id, &token, chrono::Utc::now().timestamp_millis())
                        .await
                        .unwrap_or_else(|e| panic!("ack of {} was lost: {e}", n.id));
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    let _ = locker.await;

    assert_eq!(leased_ids.len(), NOTIFICATIONS, "not every notification was leased");

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.pending, 0, "pending notifications remain");
    assert_eq!(stats.sending, 0, "leases were left open");
    assert_eq!(stats.sent, NOTIFICATIONS as i64);

    let over_attempted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notification WHERE attempts > max_attempts")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(over_attempted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lapsed_lease_is_reclaimed_once() {
    let dir = TempDir::new().unwrap();
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("reclaim.db").to_string_lossy().replace('\\', "/")
    );
    let pool = courier::database::init_pool_with_size(&db_url, 4)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    let repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));
    seed(&pool, &repo, 1).await;

    let first = repo
        .lease(Channel::Push, 1, Duration::from_secs(10), 1_000)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // Two workers race for the lapsed lease; exactly one wins.
    let after_lapse = 1_000 + 10_001;
    let (a, b) = tokio::join!(
        repo.lease(Channel::Push, 1, Duration::from_secs(10), after_lapse),
        repo.lease(Channel::Push, 1, Duration::from_secs(10), after_lapse),
    );
    let reclaimed: Vec<_> = a.unwrap().into_iter().chain(b.unwrap()).collect();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);

    // The original holder lost its lease.
    let stale_token = first[0].lease_token.clone().unwrap();
    assert!(repo.ack(&first[0].id, &stale_token, after_lapse).await.is_err());

    let token = reclaimed[0].lease_token.clone().unwrap();
    repo.ack(&reclaimed[0].id, &token, after_lapse).await.unwrap();
    assert_eq!(repo.stats().await.unwrap().sent, 1);
}
