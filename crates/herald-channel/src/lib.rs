//! `herald-channel`: the durable, partitioned event channel between the
//! scheduler and the delivery workers.
//!
//! # Backends
//!
//! | Backend           | Durability            | Use                         |
//! |-------------------|-----------------------|-----------------------------|
//! | [`SqliteChannel`] | SQLite file (WAL)     | default, single host        |
//! | [`MemoryChannel`] | process lifetime      | tests, demos                |
//! | `KafkaProducer` / `KafkaConsumer` | broker | feature `kafka`             |
//!
//! All backends place a key on the same partition (Kafka murmur2), so events
//! for one content id are consumed in publish order.

pub mod channel;
pub mod codec;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod partition;
pub mod sqlite;

use std::sync::Arc;

use herald_core::config::{ChannelBackend, ChannelConfig};

pub use channel::{ChannelMessage, Delivered, EventConsumer, EventProducer};
pub use codec::{decode_event, encode_event};
pub use error::{ChannelError, Result};
pub use memory::{MemoryChannel, MemoryConsumer};
pub use sqlite::{SqliteChannel, SqliteConsumer};

/// Producer and consumer halves of a configured channel.
pub struct ChannelPair {
    pub producer: Arc<dyn EventProducer>,
    pub consumer: Box<dyn EventConsumer>,
}

/// Build both halves of the channel selected by `config.backend`.
pub fn connect(config: &ChannelConfig) -> Result<ChannelPair> {
    match config.backend {
        ChannelBackend::Sqlite => {
            let channel = SqliteChannel::from_config(config)?;
            let consumer = channel.consumer(config.group.clone())?;
            Ok(ChannelPair {
                producer: Arc::new(channel),
                consumer: Box::new(consumer),
            })
        }
        ChannelBackend::Memory => {
            let channel = MemoryChannel::new(config.topic.clone(), config.partitions);
            let consumer = channel.consumer(config.group.clone())?;
            Ok(ChannelPair {
                producer: Arc::new(channel),
                consumer: Box::new(consumer),
            })
        }
        #[cfg(feature = "kafka")]
        ChannelBackend::Kafka => Ok(ChannelPair {
            producer: Arc::new(kafka::KafkaProducer::new(config)?),
            consumer: Box::new(kafka::KafkaConsumer::new(config)?),
        }),
        #[cfg(not(feature = "kafka"))]
        ChannelBackend::Kafka => Err(ChannelError::Config(
            "kafka backend requested but herald-channel was built without the `kafka` feature"
                .to_string(),
        )),
    }
}
