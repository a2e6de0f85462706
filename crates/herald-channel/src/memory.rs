//! In-process event channel for single-process runs and tests.
//!
//! Partitioned append-only log shared through `Clone`. Each consumer keeps
//! its own read positions; commits are stored per group on the shared log so
//! a consumer created later resumes where its group left off. Nothing
//! survives the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use herald_core::PublicationEvent;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    channel::{ChannelMessage, Delivered, EventConsumer, EventProducer},
    codec::encode_event,
    error::{ChannelError, Result},
    partition::partition_for,
};

struct Log {
    partitions: Vec<Vec<ChannelMessage>>,
    /// (group, partition) → next offset to read.
    committed: HashMap<(String, i32), i64>,
}

struct Shared {
    log: Mutex<Log>,
    appended: Notify,
}

#[derive(Clone)]
pub struct MemoryChannel {
    topic: String,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            topic: topic.into(),
            shared: Arc::new(Shared {
                log: Mutex::new(Log {
                    partitions: vec![Vec::new(); partitions],
                    committed: HashMap::new(),
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// A consumer for `group`, starting at the group's committed positions.
    pub fn consumer(&self, group: impl Into<String>) -> Result<MemoryConsumer> {
        let group = group.into();
        let positions = {
            let log = self.lock()?;
            (0..log.partitions.len())
                .map(|p| {
                    log.committed
                        .get(&(group.clone(), p as i32))
                        .copied()
                        .unwrap_or(0)
                })
                .collect()
        };
        Ok(MemoryConsumer {
            channel: self.clone(),
            group,
            positions,
            cursor: 0,
        })
    }

    /// Every message in the log, partition by partition.
    pub fn messages(&self) -> Result<Vec<ChannelMessage>> {
        let log = self.lock()?;
        Ok(log.partitions.iter().flatten().cloned().collect())
    }

    /// Next offset `group` will read from `partition`, if it ever committed.
    pub fn committed(&self, group: &str, partition: i32) -> Result<Option<i64>> {
        let log = self.lock()?;
        Ok(log.committed.get(&(group.to_string(), partition)).copied())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Log>> {
        self.shared
            .log
            .lock()
            .map_err(|_| ChannelError::Storage("memory log lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventProducer for MemoryChannel {
    async fn publish(&self, event: &PublicationEvent) -> Result<Delivered> {
        let delivered = self.publish_raw(&event.key(), encode_event(event)?)?;
        debug!(
            destination_id = event.destination_id(),
            partition = delivered.partition,
            offset = delivered.offset,
            "event appended"
        );
        Ok(delivered)
    }
}

impl MemoryChannel {
    /// Append an arbitrary payload under `key`, bypassing event encoding.
    pub fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<Delivered> {
        let delivered = {
            let mut log = self.lock()?;
            let partition = partition_for(key.as_bytes(), log.partitions.len() as u32);
            let slot = &mut log.partitions[partition as usize];
            let offset = slot.len() as i64;
            slot.push(ChannelMessage {
                topic: self.topic.clone(),
                partition,
                offset,
                key: Some(key.to_string()),
                payload,
                timestamp: Utc::now(),
            });
            Delivered { partition, offset }
        };
        self.shared.appended.notify_waiters();
        Ok(delivered)
    }
}

pub struct MemoryConsumer {
    channel: MemoryChannel,
    group: String,
    positions: Vec<i64>,
    /// Partition to look at first on the next `recv`, for round-robin fairness.
    cursor: usize,
}

impl MemoryConsumer {
    fn next_ready(&mut self) -> Result<Option<ChannelMessage>> {
        let log = self.channel.lock()?;
        let count = self.positions.len();
        for step in 0..count {
            let p = (self.cursor + step) % count;
            if let Some(msg) = log.partitions[p].get(self.positions[p] as usize) {
                self.positions[p] += 1;
                self.cursor = (p + 1) % count;
                return Ok(Some(msg.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Result<ChannelMessage> {
        let shared = Arc::clone(&self.channel.shared);
        loop {
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            // Register before checking so an append in between is not missed.
            appended.as_mut().enable();
            if let Some(msg) = self.next_ready()? {
                return Ok(msg);
            }
            appended.await;
        }
    }

    async fn commit(&mut self, msg: &ChannelMessage) -> Result<()> {
        let mut log = self.channel.lock()?;
        let next = log
            .committed
            .entry((self.group.clone(), msg.partition))
            .or_insert(0);
        *next = (*next).max(msg.offset + 1);
        Ok(())
    }
}
