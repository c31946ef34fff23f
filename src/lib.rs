//! Pulsar Producer Core
//!
//! A per-partition producer actor for the Apache Pulsar binary protocol:
//! connection state machine, batching/sequencing against the broker, and a
//! durable outbound spool that survives reconnects and process restarts.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pulsar_producer_core::{Message, ProducerOptionsBuilder, PartitionProducer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let opts = ProducerOptionsBuilder::new().batch_size(100).build();
//!     let producer = PartitionProducer::spawn(
//!         "persistent://public/default/orders-partition-0".to_string(),
//!         "pulsar://localhost:6650".to_string(),
//!         opts,
//!     )?;
//!
//!     let sequence_id = producer
//!         .send_sync(vec![Message::new(b"hello".to_vec())], std::time::Duration::from_secs(5))
//!         .await?;
//!     println!("acked as sequence_id {sequence_id}");
//!
//!     producer.close().await;
//!     Ok(())
//! }
//! ```

mod actor;
mod error;
mod legacy;
mod message;
mod options;
mod queue;
mod registry;
mod request_table;
mod wire;

pub use actor::{ConnectionState, PartitionProducer, PartitionProducerHandle};
pub use error::{ProducerError, QueueError, TransportError};
pub use legacy::{LegacyInflightEntry, LegacyProducerState};
pub use message::Message;
pub use options::{
    DurableQueueOptions, DurableQueueOptionsBuilder, MessageBatch, ProducerOptions,
    ProducerOptionsBuilder, RoutingStrategy, SendCallback, SendOutcome, TcpOpts,
};
pub use queue::{AckRef, DurableQueue, MemQueue, QueueItem, SegmentedQueue};
pub use registry::ProducerRegistry;
pub use request_table::{InflightRequest, RequestTable};
pub use wire::{BrokerFrame, Command, PulsarFrameCodec, WireCodec};
