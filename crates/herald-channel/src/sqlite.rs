//! Durable event channel stored in a SQLite file.
//!
//! The default backend. Messages are appended to a per-partition log inside an
//! IMMEDIATE transaction, which is the acknowledgement; consumer groups keep
//! their next offset per partition in `channel_offsets`. Consumers poll.
//!
//! Commits prune the log: rows every known group has committed past are
//! deleted, except the newest row of each partition, which keeps offsets
//! monotonic across restarts.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_core::{config::ChannelConfig, PublicationEvent};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::{
    channel::{ChannelMessage, Delivered, EventConsumer, EventProducer},
    codec::encode_event,
    error::{ChannelError, Result},
    partition::partition_for,
};

fn init_channel_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS channel_messages (
            topic         TEXT    NOT NULL,
            partition_id  INTEGER NOT NULL,
            msg_offset    INTEGER NOT NULL,
            msg_key       TEXT,
            payload       BLOB    NOT NULL,
            created_at    TEXT    NOT NULL,
            PRIMARY KEY (topic, partition_id, msg_offset)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS channel_offsets (
            group_id      TEXT    NOT NULL,
            topic         TEXT    NOT NULL,
            partition_id  INTEGER NOT NULL,
            next_offset   INTEGER NOT NULL,
            PRIMARY KEY (group_id, topic, partition_id)
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteChannel {
    topic: String,
    partitions: u32,
    poll_interval: Duration,
    db: Arc<Mutex<Connection>>,
}

impl SqliteChannel {
    pub fn new(
        conn: Connection,
        topic: impl Into<String>,
        partitions: u32,
        poll_interval: Duration,
    ) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init_channel_db(&conn)?;
        Ok(Self {
            topic: topic.into(),
            partitions: partitions.max(1),
            poll_interval,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(
        path: impl AsRef<Path>,
        topic: impl Into<String>,
        partitions: u32,
        poll_interval: Duration,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::new(conn, topic, partitions, poll_interval)
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        if let Some(dir) = Path::new(&config.path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ChannelError::Config(format!("cannot create {}: {e}", dir.display()))
                })?;
            }
        }
        let channel = Self::open(
            &config.path,
            config.topic.clone(),
            config.partitions,
            config.poll_interval(),
        )?;
        info!(path = %config.path, topic = %config.topic, partitions = config.partitions, "sqlite channel opened");
        Ok(channel)
    }

    /// A consumer for `group`, starting at the group's committed offsets.
    pub fn consumer(&self, group: impl Into<String>) -> Result<SqliteConsumer> {
        let group = group.into();
        let mut positions = vec![0_i64; self.partitions as usize];
        {
            let db = self.lock()?;
            let mut stmt = db.prepare(
                "SELECT partition_id, next_offset FROM channel_offsets
                 WHERE group_id = ?1 AND topic = ?2",
            )?;
            let rows = stmt.query_map(params![group, self.topic], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (partition, next) = row?;
                if let Some(slot) = positions.get_mut(partition as usize) {
                    *slot = next;
                }
            }
        }
        Ok(SqliteConsumer {
            channel: self.clone(),
            group,
            positions,
            cursor: 0,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| ChannelError::Storage("channel connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventProducer for SqliteChannel {
    async fn publish(&self, event: &PublicationEvent) -> Result<Delivered> {
        let payload = encode_event(event)?;
        let key = event.key();
        let partition = partition_for(key.as_bytes(), self.partitions);

        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let offset: i64 = tx.query_row(
            "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM channel_messages
             WHERE topic = ?1 AND partition_id = ?2",
            params![self.topic, partition],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO channel_messages (topic, partition_id, msg_offset, msg_key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.topic,
                partition,
                offset,
                key,
                payload,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        tx.commit()?;

        debug!(destination_id = event.destination_id(), partition, offset, "event appended");
        Ok(Delivered { partition, offset })
    }
}

pub struct SqliteConsumer {
    channel: SqliteChannel,
    group: String,
    positions: Vec<i64>,
    cursor: usize,
}

impl SqliteConsumer {
    fn next_ready(&mut self) -> Result<Option<ChannelMessage>> {
        let db = self.channel.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT msg_offset, msg_key, payload, created_at FROM channel_messages
             WHERE topic = ?1 AND partition_id = ?2 AND msg_offset >= ?3
             ORDER BY msg_offset
             LIMIT 1",
        )?;
        let count = self.positions.len();
        for step in 0..count {
            let p = (self.cursor + step) % count;
            let row = stmt
                .query_row(params![self.channel.topic, p as i64, self.positions[p]], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .optional()?;
            if let Some((offset, key, payload, created_at)) = row {
                self.positions[p] = offset + 1;
                self.cursor = (p + 1) % count;
                let timestamp = DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| ChannelError::Storage(format!("bad created_at: {e}")))?;
                return Ok(Some(ChannelMessage {
                    topic: self.channel.topic.clone(),
                    partition: p as i32,
                    offset,
                    key,
                    payload,
                    timestamp,
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventConsumer for SqliteConsumer {
    async fn recv(&mut self) -> Result<ChannelMessage> {
        loop {
            if let Some(msg) = self.next_ready()? {
                return Ok(msg);
            }
            tokio::time::sleep(self.channel.poll_interval).await;
        }
    }

    async fn commit(&mut self, msg: &ChannelMessage) -> Result<()> {
        let mut db = self.channel.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO channel_offsets (group_id, topic, partition_id, next_offset)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (group_id, topic, partition_id)
             DO UPDATE SET next_offset = MAX(next_offset, excluded.next_offset)",
            params![self.group, msg.topic, msg.partition, msg.offset + 1],
        )?;
        let pruned = tx.execute(
            "DELETE FROM channel_messages
             WHERE topic = ?1 AND partition_id = ?2
               AND msg_offset < (SELECT MIN(next_offset) FROM channel_offsets
                                 WHERE topic = ?1 AND partition_id = ?2)
               AND msg_offset < (SELECT MAX(msg_offset) FROM channel_messages
                                 WHERE topic = ?1 AND partition_id = ?2)",
            params![msg.topic, msg.partition],
        )?;
        tx.commit()?;

        if pruned > 0 {
            debug!(partition = msg.partition, pruned, "committed events pruned");
        }
        Ok(())
    }
}
