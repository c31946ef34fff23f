//! Supervised multi-partition façade over [`PartitionProducer`] (spec §4.4).

use crate::actor::{PartitionProducer, PartitionProducerHandle};
use crate::error::ProducerError;
use crate::options::{ProducerOptions, RoutingStrategy};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Owns one [`PartitionProducerHandle`] per partition topic and routes
/// incoming batches across them according to the configured
/// [`RoutingStrategy`]. Mirrors the teacher's `MultiTopicProducer`
/// fan-out shape, generalized from "one handle per topic" to "one handle
/// per partition of a single topic".
pub struct ProducerRegistry {
    broker_url: String,
    opts: ProducerOptions,
    producers: HashMap<String, PartitionProducerHandle>,
    partition_order: Vec<String>,
    round_robin_cursor: usize,
}

impl ProducerRegistry {
    pub fn new(broker_url: String, opts: ProducerOptions) -> Self {
        Self {
            broker_url,
            opts,
            producers: HashMap::new(),
            partition_order: Vec::new(),
            round_robin_cursor: 0,
        }
    }

    /// Spawns (or returns the existing) actor for `partition_topic`.
    pub fn get_or_create(
        &mut self,
        partition_topic: &str,
    ) -> Result<PartitionProducerHandle, ProducerError> {
        if let Some(handle) = self.producers.get(partition_topic) {
            return Ok(handle.clone());
        }

        let handle = PartitionProducer::spawn(
            partition_topic.to_string(),
            self.broker_url.clone(),
            self.opts.clone(),
        )?;
        self.producers.insert(partition_topic.to_string(), handle.clone());
        self.partition_order.push(partition_topic.to_string());
        Ok(handle)
    }

    /// Selects a partition per the registry's `RoutingStrategy`, creating
    /// its actor on first use. Returns `None` if no partitions have been
    /// registered yet and `key` doesn't resolve to one directly.
    pub fn pick_producer(
        &mut self,
        key: Option<&[u8]>,
    ) -> Result<Option<PartitionProducerHandle>, ProducerError> {
        if self.partition_order.is_empty() {
            return Ok(None);
        }

        let index = match self.opts.strategy {
            RoutingStrategy::RoundRobin => {
                let index = self.round_robin_cursor % self.partition_order.len();
                self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
                index
            }
            RoutingStrategy::Random => (rand::random::<u64>() as usize) % self.partition_order.len(),
            RoutingStrategy::KeyDispatch => match key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() as usize) % self.partition_order.len()
                }
                None => 0,
            },
        };

        let partition_topic = self.partition_order[index].clone();
        self.get_or_create(&partition_topic).map(Some)
    }

    /// Closes and forgets the actor for `partition_topic`, per spec §4.4's
    /// `stop_and_delete`. A no-op if the partition was never created.
    pub async fn stop_and_delete(&mut self, partition_topic: &str) {
        if let Some(handle) = self.producers.remove(partition_topic) {
            handle.close().await;
        }
        self.partition_order.retain(|t| t != partition_topic);
    }

    pub fn partition_count(&self) -> usize {
        self.partition_order.len()
    }
}
