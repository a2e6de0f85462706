//! Apache Kafka backend (feature `kafka`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{config::ChannelConfig, PublicationEvent};
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Offset, TopicPartitionList,
};
use tracing::{debug, info};

use crate::{
    channel::{ChannelMessage, Delivered, EventConsumer, EventProducer},
    codec::encode_event,
    error::{ChannelError, Result},
};

fn broker_error(err: rdkafka::error::KafkaError) -> ChannelError {
    ChannelError::Broker(err.to_string())
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// Producer acknowledged by the partition leader (`acks=1`), keyed with
    /// the murmur2 partitioner Kafka's Java clients use.
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let brokers = config.broker_list().join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("acks", "1")
            .set("partitioner", "murmur2_random")
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .create()
            .map_err(broker_error)?;
        info!(%brokers, topic = %config.topic, "kafka producer created");
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            send_timeout: config.send_timeout(),
        })
    }
}

#[async_trait]
impl EventProducer for KafkaProducer {
    async fn publish(&self, event: &PublicationEvent) -> Result<Delivered> {
        let payload = encode_event(event)?;
        let key = event.key();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| broker_error(err))?;
        debug!(destination_id = event.destination_id(), partition, offset, "event acknowledged");
        Ok(Delivered { partition, offset })
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// Group consumer with manual commits, starting at the earliest offset
    /// when the group has no committed position.
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.broker_list().join(","))
            .set("group.id", &config.group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(broker_error)?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(broker_error)?;
        info!(group = %config.group, topic = %config.topic, "kafka consumer subscribed");
        Ok(Self { consumer })
    }
}

#[async_trait]
impl EventConsumer for KafkaConsumer {
    async fn recv(&mut self) -> Result<ChannelMessage> {
        let msg = self.consumer.recv().await.map_err(broker_error)?;
        let timestamp = msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Ok(ChannelMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: msg.payload().unwrap_or_default().to_vec(),
            timestamp,
        })
    }

    async fn commit(&mut self, msg: &ChannelMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(broker_error)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(broker_error)
    }
}
