use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_core::{
    store::{PublicationStore, RequeuePolicy, RequeueReport},
    types::{
        DeliveryAttempt, DestinationId, DestinationStatus, DueDestination, NewPlatform, NewPost,
        Platform, PlatformId, PlatformLookup, Post, PostContent, PostDestination, PostId,
        PostStatus, PostsByStatus, UserId,
    },
    StoreError,
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::{DbError, Result},
};

const DESTINATION_COLUMNS: &str = "id, post_id, platform_id, scheduled_for, published_at, status,
     error_message, event_sent, event_sent_at, attempts, claimed_at, retry_at, created_at";

/// Publication store over a single SQLite connection.
///
/// The connection sits behind a `Mutex`; every public operation holds the
/// lock for exactly one statement or transaction and never across an
/// `.await`. Cross-process exclusion comes from SQLite itself.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| DbError::Poisoned)
    }

    // --- CRUD surface (gateway) --------------------------------------------

    /// Register a platform account for a user.
    #[instrument(skip(self, new), fields(user_id = new.user_id, platform = %new.name))]
    pub fn create_platform(&self, new: &NewPlatform) -> Result<Platform> {
        let config = serde_json::to_string(&new.credentials)
            .map_err(|e| DbError::Invalid(format!("credentials: {e}")))?;
        let db = self.conn()?;
        db.execute(
            "INSERT INTO platforms (user_id, platform_name, api_config, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new.user_id, new.name, config, new.is_active, ts(Utc::now())],
        )?;
        let id = db.last_insert_rowid();
        info!(platform_id = id, "platform registered");
        Ok(Platform {
            id,
            user_id: new.user_id,
            name: new.name.clone(),
            credentials: new.credentials.clone(),
            is_active: new.is_active,
        })
    }

    /// Switch a platform account on or off.
    pub fn set_platform_active(&self, id: PlatformId, active: bool) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE platforms SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound {
                entity: "platform",
                id,
            });
        }
        Ok(())
    }

    /// Insert a post and, when it carries a schedule, one destination per platform.
    ///
    /// A post without `scheduled_for` is stored as a draft with no destinations.
    #[instrument(skip(self, new), fields(user_id = new.user_id))]
    pub fn create_post(&self, new: &NewPost) -> Result<(Post, Vec<PostDestination>)> {
        if new.scheduled_for.is_some() && new.platform_ids.is_empty() {
            return Err(DbError::Invalid(
                "a scheduled post needs at least one platform".to_string(),
            ));
        }

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let now = Utc::now();
        let status = if new.scheduled_for.is_some() {
            PostStatus::Scheduled
        } else {
            PostStatus::Draft
        };

        tx.execute(
            "INSERT INTO posts (user_id, title, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new.user_id, new.title, new.content, status.to_string(), ts(now)],
        )?;
        let post_id = tx.last_insert_rowid();

        let mut destination_ids = Vec::new();
        if let Some(scheduled_for) = new.scheduled_for {
            for &platform_id in &new.platform_ids {
                let owner: Option<UserId> = tx
                    .query_row(
                        "SELECT user_id FROM platforms WHERE id = ?1",
                        [platform_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if owner != Some(new.user_id) {
                    return Err(DbError::NotFound {
                        entity: "platform",
                        id: platform_id,
                    });
                }
                tx.execute(
                    "INSERT INTO post_destinations (post_id, platform_id, scheduled_for, status, created_at)
                     VALUES (?1, ?2, ?3, 'scheduled', ?4)",
                    params![post_id, platform_id, ts(scheduled_for), ts(now)],
                )?;
                destination_ids.push(tx.last_insert_rowid());
            }
        }

        let post = tx.query_row(
            "SELECT id, user_id, title, content, status, created_at FROM posts WHERE id = ?1",
            [post_id],
            row_to_post,
        )?;
        let mut destinations = Vec::with_capacity(destination_ids.len());
        for id in destination_ids {
            destinations.push(select_destination(&tx, id)?.ok_or(DbError::NotFound {
                entity: "destination",
                id,
            })?);
        }
        tx.commit()?;

        info!(post_id, destinations = destinations.len(), %status, "post created");
        Ok((post, destinations))
    }

    /// All posts grouped by lifecycle status, oldest first within each group.
    pub fn list_posts(&self) -> Result<PostsByStatus> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, user_id, title, content, status, created_at FROM posts ORDER BY id",
        )?;
        let mut groups = PostsByStatus::default();
        for post in stmt.query_map([], row_to_post)? {
            groups.push(post?);
        }
        Ok(groups)
    }

    pub fn destination(&self, id: DestinationId) -> Result<Option<PostDestination>> {
        let db = self.conn()?;
        select_destination(&db, id)
    }

    /// Delivery attempts recorded for a destination, in insertion order.
    pub fn attempts(&self, id: DestinationId) -> Result<Vec<DeliveryAttempt>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT destination_id, channel_id, attempt, succeeded, error, attempted_at
             FROM delivery_attempts WHERE destination_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(DeliveryAttempt {
                destination_id: row.get(0)?,
                channel_id: row.get(1)?,
                attempt: row.get(2)?,
                succeeded: row.get(3)?,
                error: row.get(4)?,
                attempted_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- pipeline operations -------------------------------------------------

    fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DueDestination>> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_str = ts(now);

        let due: Vec<DueDestination> = {
            let mut stmt = tx.prepare(
                "SELECT pd.id, pd.post_id, p.user_id, p.title, p.content,
                        pd.platform_id, pl.platform_name, pd.scheduled_for
                 FROM post_destinations pd
                 JOIN posts p ON p.id = pd.post_id
                 JOIN platforms pl ON pl.id = pd.platform_id
                 WHERE pd.status = 'scheduled'
                   AND pd.event_sent = 0
                   AND pd.scheduled_for <= ?1
                   AND (pd.retry_at IS NULL OR pd.retry_at <= ?1)
                 ORDER BY pd.scheduled_for ASC, pd.id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_str, limit as i64], |row| {
                Ok(DueDestination {
                    destination_id: row.get(0)?,
                    post_id: row.get(1)?,
                    user_id: row.get(2)?,
                    title: row.get(3)?,
                    content: row.get(4)?,
                    platform_id: row.get(5)?,
                    platform_name: row.get(6)?,
                    scheduled_for: parse_ts(7, &row.get::<_, String>(7)?)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        // The IMMEDIATE transaction holds the write lock, so every selected
        // row is still 'scheduled' here.
        for d in &due {
            tx.execute(
                "UPDATE post_destinations SET status = 'processing', claimed_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![now_str, d.destination_id],
            )?;
        }
        tx.commit()?;
        Ok(due)
    }

    fn platform_for(
        &self,
        platform_name: &str,
        user_id: UserId,
        platform_id: PlatformId,
    ) -> Result<PlatformLookup> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT id, user_id, platform_name, api_config, is_active FROM platforms
                 WHERE id = ?1 AND user_id = ?2 AND platform_name = ?3 COLLATE NOCASE",
                params![platform_id, user_id, platform_name],
                |row| {
                    Ok((
                        row.get::<_, PlatformId>(0)?,
                        row.get::<_, UserId>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, user_id, name, config, is_active)) = row else {
            return Ok(PlatformLookup::NotFound);
        };
        let credentials: BTreeMap<String, String> =
            serde_json::from_str(&config).map_err(|e| DbError::Corrupt {
                table: "platforms",
                reason: format!("api_config of platform {id}: {e}"),
            })?;
        let platform = Platform {
            id,
            user_id,
            name,
            credentials,
            is_active,
        };
        Ok(if is_active {
            PlatformLookup::Found(platform)
        } else {
            PlatformLookup::Inactive(platform)
        })
    }

    fn content_for(&self, user_id: UserId, post_id: PostId) -> Result<Option<PostContent>> {
        let db = self.conn()?;
        let content = db
            .query_row(
                "SELECT title, content FROM posts WHERE id = ?1 AND user_id = ?2",
                params![post_id, user_id],
                |row| {
                    Ok(PostContent {
                        title: row.get(0)?,
                        body: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(content)
    }

    fn transition(&self, sql: &str, params: impl rusqlite::Params) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(sql, params)?;
        Ok(n == 1)
    }

    /// Terminal write plus post roll-up in one transaction.
    fn finish(&self, id: DestinationId, outcome: Terminal<'_>) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let now = ts(Utc::now());
        let n = match outcome {
            Terminal::Published => tx.execute(
                "UPDATE post_destinations
                 SET status = 'published', published_at = ?1, error_message = NULL
                 WHERE id = ?2 AND status = 'kafka_processed' AND event_sent = 1",
                params![now, id],
            )?,
            Terminal::Failed(error) => tx.execute(
                "UPDATE post_destinations SET status = 'failed', error_message = ?1
                 WHERE id = ?2 AND status NOT IN ('published', 'failed')",
                params![error, id],
            )?,
        };
        if n == 1 {
            refresh_post_status(&tx, id)?;
        }
        tx.commit()?;
        Ok(n == 1)
    }

    fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO delivery_attempts
             (destination_id, channel_id, attempt, succeeded, error, attempted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt.destination_id,
                attempt.channel_id,
                attempt.attempt,
                attempt.succeeded,
                attempt.error,
                ts(attempt.attempted_at)
            ],
        )?;
        Ok(())
    }

    fn sweep(&self, policy: &RequeuePolicy, now: DateTime<Utc>) -> Result<RequeueReport> {
        let claim_cutoff = ts(now - to_chrono(policy.claim_timeout)?);
        let redeliver_cutoff = ts(now - to_chrono(policy.redeliver_after)?);

        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Vec<(DestinationId, String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, status, attempts FROM post_destinations
                 WHERE (status = 'processing' AND event_sent = 0 AND claimed_at <= ?1)
                    OR (status IN ('kafka_ready', 'kafka_processed')
                        AND event_sent = 1 AND event_sent_at <= ?2)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![claim_cutoff, redeliver_cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut report = RequeueReport::default();
        for (id, status, attempts) in stale {
            let next = attempts + 1;
            if policy.retry.is_exhausted(next) {
                let error = format!("gave up after {next} dispatch attempts (stuck in {status})");
                let n = tx.execute(
                    "UPDATE post_destinations SET status = 'failed', attempts = ?1, error_message = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![next, error, id, status],
                )?;
                if n == 1 {
                    refresh_post_status(&tx, id)?;
                    report.failed.push(id);
                }
            } else {
                let retry_at = now + to_chrono(policy.retry.delay_after(next))?;
                let n = tx.execute(
                    "UPDATE post_destinations
                     SET status = 'scheduled', event_sent = 0, event_sent_at = NULL,
                         claimed_at = NULL, attempts = ?1, retry_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![next, ts(retry_at), id, status],
                )?;
                if n == 1 {
                    debug!(destination_id = id, from = %status, attempts = next, "destination requeued");
                    report.requeued.push(id);
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }
}

enum Terminal<'a> {
    Published,
    Failed(&'a str),
}

#[async_trait]
impl PublicationStore for SqliteStore {
    #[instrument(skip(self))]
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<DueDestination>, StoreError> {
        let due = self.claim_due(limit, now)?;
        if !due.is_empty() {
            debug!(claimed = due.len(), "destinations claimed");
        }
        Ok(due)
    }

    #[instrument(skip(self))]
    async fn fetch_credentials(
        &self,
        platform_name: &str,
        user_id: UserId,
        platform_id: PlatformId,
    ) -> std::result::Result<PlatformLookup, StoreError> {
        Ok(self.platform_for(platform_name, user_id, platform_id)?)
    }

    #[instrument(skip(self))]
    async fn fetch_content(
        &self,
        user_id: UserId,
        post_id: PostId,
    ) -> std::result::Result<Option<PostContent>, StoreError> {
        Ok(self.content_for(user_id, post_id)?)
    }

    #[instrument(skip(self))]
    async fn mark_kafka_ready(&self, id: DestinationId) -> std::result::Result<bool, StoreError> {
        Ok(self.transition(
            "UPDATE post_destinations SET status = 'kafka_ready', event_sent = 1, event_sent_at = ?1
             WHERE id = ?2 AND status = 'processing'",
            params![ts(Utc::now()), id],
        )?)
    }

    #[instrument(skip(self))]
    async fn mark_kafka_processed(
        &self,
        id: DestinationId,
    ) -> std::result::Result<bool, StoreError> {
        Ok(self.transition(
            "UPDATE post_destinations SET status = 'kafka_processed'
             WHERE id = ?1 AND status = 'kafka_ready' AND event_sent = 1",
            [id],
        )?)
    }

    #[instrument(skip(self))]
    async fn mark_sent(&self, id: DestinationId) -> std::result::Result<bool, StoreError> {
        Ok(self.finish(id, Terminal::Published)?)
    }

    #[instrument(skip(self, error))]
    async fn mark_failed(
        &self,
        id: DestinationId,
        error: &str,
    ) -> std::result::Result<bool, StoreError> {
        let changed = self.finish(id, Terminal::Failed(error))?;
        if changed {
            warn!(destination_id = id, %error, "destination failed");
        }
        Ok(changed)
    }

    async fn record_attempt(
        &self,
        attempt: &DeliveryAttempt,
    ) -> std::result::Result<(), StoreError> {
        Ok(self.insert_attempt(attempt)?)
    }

    #[instrument(skip(self, policy))]
    async fn requeue_stale(
        &self,
        policy: &RequeuePolicy,
        now: DateTime<Utc>,
    ) -> std::result::Result<RequeueReport, StoreError> {
        Ok(self.sweep(policy, now)?)
    }
}

// --- private helpers ---------------------------------------------------------

/// Fixed-width UTC timestamp; lexical order equals chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|_| DbError::Invalid(format!("duration {d:?} out of range")))
}

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let status: String = row.get(4)?;
    Ok(Post {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
    })
}

fn row_to_destination(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostDestination> {
    let status: String = row.get(5)?;
    Ok(PostDestination {
        id: row.get(0)?,
        post_id: row.get(1)?,
        platform_id: row.get(2)?,
        scheduled_for: parse_ts(3, &row.get::<_, String>(3)?)?,
        published_at: parse_opt_ts(4, row.get(4)?)?,
        status: status.parse::<DestinationStatus>().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into())
        })?,
        error_message: row.get(6)?,
        event_sent: row.get(7)?,
        event_sent_at: parse_opt_ts(8, row.get(8)?)?,
        attempts: row.get(9)?,
        claimed_at: parse_opt_ts(10, row.get(10)?)?,
        retry_at: parse_opt_ts(11, row.get(11)?)?,
        created_at: parse_ts(12, &row.get::<_, String>(12)?)?,
    })
}

fn select_destination(conn: &Connection, id: DestinationId) -> Result<Option<PostDestination>> {
    let sql = format!("SELECT {DESTINATION_COLUMNS} FROM post_destinations WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_destination).optional()?)
}

/// Roll the parent post up once all of its destinations are terminal.
fn refresh_post_status(tx: &Transaction<'_>, destination_id: DestinationId) -> Result<()> {
    tx.execute(
        "UPDATE posts SET status = CASE
             WHEN EXISTS (SELECT 1 FROM post_destinations d
                          WHERE d.post_id = posts.id AND d.status NOT IN ('published', 'failed'))
                 THEN posts.status
             WHEN EXISTS (SELECT 1 FROM post_destinations d
                          WHERE d.post_id = posts.id AND d.status = 'failed')
                 THEN 'failed'
             ELSE 'published'
         END
         WHERE id = (SELECT post_id FROM post_destinations WHERE id = ?1)",
        [destination_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn telegram(store: &SqliteStore, user_id: UserId, active: bool) -> Platform {
        store
            .create_platform(&NewPlatform {
                user_id,
                name: "Telegram".into(),
                credentials: BTreeMap::from([("@news".to_string(), "token-1".to_string())]),
                is_active: active,
            })
            .unwrap()
    }

    fn schedule(
        store: &SqliteStore,
        platform: &Platform,
        at: DateTime<Utc>,
    ) -> (Post, PostDestination) {
        let (post, mut dests) = store
            .create_post(&NewPost {
                user_id: platform.user_id,
                title: "Hello".into(),
                content: "World".into(),
                platform_ids: vec![platform.id],
                scheduled_for: Some(at),
            })
            .unwrap();
        (post, dests.remove(0))
    }

    fn status(store: &SqliteStore, id: DestinationId) -> DestinationStatus {
        store.destination(id).unwrap().unwrap().status
    }

    #[test]
    fn draft_post_has_no_destinations() {
        let store = store();
        let (post, dests) = store
            .create_post(&NewPost {
                user_id: 1,
                title: "Draft".into(),
                content: "later".into(),
                platform_ids: vec![],
                scheduled_for: None,
            })
            .unwrap();
        assert_eq!(post.status, PostStatus::Draft);
        assert!(dests.is_empty());
    }

    #[test]
    fn scheduled_post_rejects_foreign_platform() {
        let store = store();
        let other = telegram(&store, 2, true);
        let err = store
            .create_post(&NewPost {
                user_id: 1,
                title: "Hello".into(),
                content: "World".into(),
                platform_ids: vec![other.id],
                scheduled_for: Some(Utc::now()),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { entity: "platform", .. }));
        assert!(store.list_posts().unwrap().scheduled.is_empty());
    }

    #[tokio::test]
    async fn fetch_due_claims_earliest_first() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let now = Utc::now();
        let (_, later) = schedule(&store, &tg, now - ChronoDuration::minutes(1));
        let (_, earlier) = schedule(&store, &tg, now - ChronoDuration::minutes(5));
        let (_, future) = schedule(&store, &tg, now + ChronoDuration::minutes(5));

        let due = store.fetch_due(10, now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|d| d.destination_id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
        assert_eq!(due[0].title, "Hello");
        assert_eq!(due[0].platform_name, "Telegram");

        assert_eq!(status(&store, earlier.id), DestinationStatus::Processing);
        assert_eq!(status(&store, future.id), DestinationStatus::Scheduled);
        assert!(store.fetch_due(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_due_respects_limit() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let now = Utc::now();
        for i in 0..5 {
            schedule(&store, &tg, now - ChronoDuration::minutes(i));
        }
        assert_eq!(store.fetch_due(2, now).await.unwrap().len(), 2);
        assert_eq!(store.fetch_due(10, now).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn credentials_distinguish_found_inactive_and_missing() {
        let store = store();
        let active = telegram(&store, 1, true);
        let inactive = telegram(&store, 2, false);

        match store.fetch_credentials("Telegram", 1, active.id).await.unwrap() {
            PlatformLookup::Found(p) => {
                assert_eq!(p.id, active.id);
                assert_eq!(p.credentials.get("@news").map(String::as_str), Some("token-1"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(matches!(
            store.fetch_credentials("telegram", 2, inactive.id).await.unwrap(),
            PlatformLookup::Inactive(_)
        ));
        assert_eq!(
            store.fetch_credentials("Discord", 1, active.id).await.unwrap(),
            PlatformLookup::NotFound
        );
        // Another user's account is never handed out.
        assert_eq!(
            store.fetch_credentials("Telegram", 1, inactive.id).await.unwrap(),
            PlatformLookup::NotFound
        );
    }

    #[tokio::test]
    async fn credentials_resolve_each_account_of_a_user() {
        let store = store();
        let first = telegram(&store, 1, true);
        let second = telegram(&store, 1, true);

        for account in [&first, &second] {
            match store.fetch_credentials("Telegram", 1, account.id).await.unwrap() {
                PlatformLookup::Found(p) => assert_eq!(p.id, account.id),
                other => panic!("expected Found, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn content_is_scoped_to_owner() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (post, _) = schedule(&store, &tg, Utc::now());

        let content = store.fetch_content(1, post.id).await.unwrap().unwrap();
        assert_eq!(content.text(), "Hello\nWorld");
        assert!(store.fetch_content(2, post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_publishes_destination_and_post() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (post, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::minutes(1));

        store.fetch_due(10, Utc::now()).await.unwrap();
        assert!(store.mark_kafka_ready(dest.id).await.unwrap());
        let row = store.destination(dest.id).unwrap().unwrap();
        assert!(row.event_sent);
        assert!(row.event_sent_at.is_some());

        assert!(store.mark_kafka_processed(dest.id).await.unwrap());
        assert!(store.mark_sent(dest.id).await.unwrap());

        let row = store.destination(dest.id).unwrap().unwrap();
        assert_eq!(row.status, DestinationStatus::Published);
        assert!(row.published_at.is_some());
        let groups = store.list_posts().unwrap();
        assert_eq!(groups.published.len(), 1);
        assert_eq!(groups.published[0].id, post.id);
    }

    #[tokio::test]
    async fn cannot_publish_without_event_sent() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::minutes(1));
        store.fetch_due(10, Utc::now()).await.unwrap();

        assert!(!store.mark_kafka_processed(dest.id).await.unwrap());
        assert!(!store.mark_sent(dest.id).await.unwrap());
        assert_eq!(status(&store, dest.id), DestinationStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_state_is_reached_once() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::minutes(1));
        store.fetch_due(10, Utc::now()).await.unwrap();
        store.mark_kafka_ready(dest.id).await.unwrap();
        store.mark_kafka_processed(dest.id).await.unwrap();

        assert!(store.mark_sent(dest.id).await.unwrap());
        assert!(!store.mark_sent(dest.id).await.unwrap());
        assert!(!store.mark_failed(dest.id, "late failure").await.unwrap());
        assert!(!store.mark_kafka_processed(dest.id).await.unwrap());

        let row = store.destination(dest.id).unwrap().unwrap();
        assert_eq!(row.status, DestinationStatus::Published);
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn post_fails_once_all_destinations_are_terminal() {
        let store = store();
        let a = telegram(&store, 1, true);
        let b = telegram(&store, 1, true);
        let (post, dests) = store
            .create_post(&NewPost {
                user_id: 1,
                title: "Two".into(),
                content: "targets".into(),
                platform_ids: vec![a.id, b.id],
                scheduled_for: Some(Utc::now() - ChronoDuration::minutes(1)),
            })
            .unwrap();

        store.mark_failed(dests[0].id, "boom").await.unwrap();
        assert_eq!(store.list_posts().unwrap().scheduled[0].id, post.id);

        store.mark_failed(dests[1].id, "boom").await.unwrap();
        let groups = store.list_posts().unwrap();
        assert_eq!(groups.failed.len(), 1);
        assert_eq!(
            store.destination(dests[0].id).unwrap().unwrap().error_message.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn attempts_are_recorded_in_order() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now());
        for (n, ok) in [(1, false), (2, true)] {
            store
                .record_attempt(&DeliveryAttempt {
                    destination_id: dest.id,
                    channel_id: "@news".into(),
                    attempt: n,
                    succeeded: ok,
                    error: (!ok).then(|| "timeout".to_string()),
                    attempted_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let attempts = store.attempts(dest.id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].succeeded);
        assert_eq!(attempts[0].error.as_deref(), Some("timeout"));
        assert!(attempts[1].succeeded);
    }

    #[tokio::test]
    async fn stuck_claim_is_requeued_with_backoff() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let claimed_at = Utc::now() - ChronoDuration::minutes(10);
        let (_, dest) = schedule(&store, &tg, claimed_at - ChronoDuration::minutes(1));
        store.fetch_due(10, claimed_at).await.unwrap();

        let now = Utc::now();
        let policy = RequeuePolicy::default();
        let report = store.requeue_stale(&policy, now).await.unwrap();
        assert_eq!(report.requeued, vec![dest.id]);

        let row = store.destination(dest.id).unwrap().unwrap();
        assert_eq!(row.status, DestinationStatus::Scheduled);
        assert_eq!(row.attempts, 1);
        assert!(!row.event_sent);
        assert!(row.retry_at.unwrap() > now);

        // Not claimable until the backoff has elapsed.
        assert!(store.fetch_due(10, now).await.unwrap().is_empty());
        let later = now + ChronoDuration::minutes(2);
        assert_eq!(store.fetch_due(10, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fresh_claim_is_left_alone() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::minutes(1));
        store.fetch_due(10, Utc::now()).await.unwrap();

        let report = store
            .requeue_stale(&RequeuePolicy::default(), Utc::now())
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(status(&store, dest.id), DestinationStatus::Processing);
    }

    #[tokio::test]
    async fn exhausted_destination_is_failed() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::hours(3));
        let policy = RequeuePolicy::default();

        let mut now = Utc::now() - ChronoDuration::hours(2);
        for _ in 0..policy.retry.max_attempts {
            store.fetch_due(10, now).await.unwrap();
            now += ChronoDuration::minutes(10);
            store.requeue_stale(&policy, now).await.unwrap();
            now += ChronoDuration::minutes(10);
        }

        let row = store.destination(dest.id).unwrap().unwrap();
        assert_eq!(row.status, DestinationStatus::Failed);
        assert_eq!(row.attempts, policy.retry.max_attempts);
        assert!(row.error_message.unwrap().contains("gave up"));
    }

    #[tokio::test]
    async fn undelivered_event_is_redelivered() {
        let store = store();
        let tg = telegram(&store, 1, true);
        let (_, dest) = schedule(&store, &tg, Utc::now() - ChronoDuration::minutes(1));
        store.fetch_due(10, Utc::now()).await.unwrap();
        store.mark_kafka_ready(dest.id).await.unwrap();

        let later = Utc::now() + ChronoDuration::minutes(30);
        let report = store
            .requeue_stale(&RequeuePolicy::default(), later)
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![dest.id]);
        let row = store.destination(dest.id).unwrap().unwrap();
        assert_eq!(row.status, DestinationStatus::Scheduled);
        assert!(!row.event_sent);
        assert!(row.event_sent_at.is_none());
    }
}
