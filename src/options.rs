//! Producer and durable-queue configuration.

use crate::error::ProducerError;
use crate::message::Message;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How the supervising façade should route batches across partitions.
///
/// Used by the façade (§4.4), not interpreted by the partition actor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    Random,
    KeyDispatch,
}

/// Callback invoked once per completed batch on the async (`send`) path.
pub type SendCallback = Arc<dyn Fn(Result<SendOutcome, ProducerError>) + Send + Sync>;

/// What the user callback receives for a completed batch.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub sequence_id: u64,
    pub message_count: usize,
}

/// Additional TCP socket options merged over the connection defaults.
#[derive(Debug, Clone, Default)]
pub struct TcpOpts {
    pub nodelay: Option<bool>,
    pub reuseaddr: Option<bool>,
    pub send_timeout: Option<Duration>,
    pub recv_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
}

/// Retention/persistence configuration for the durable queue.
#[derive(Debug, Clone)]
pub struct DurableQueueOptions {
    pub dir: Option<PathBuf>,
    pub seg_bytes: u64,
    pub offload_mode: bool,
    pub max_total_bytes: Option<u64>,
    pub retention_period: Option<Duration>,
}

impl Default for DurableQueueOptions {
    fn default() -> Self {
        Self {
            dir: None,
            seg_bytes: 20 * 1024 * 1024,
            offload_mode: false,
            max_total_bytes: None,
            retention_period: None,
        }
    }
}

impl DurableQueueOptions {
    pub fn is_mem_only(&self) -> bool {
        self.dir.is_none()
    }
}

/// Builder for [`DurableQueueOptions`].
#[must_use = "builders do nothing unless you call .build()"]
#[derive(Debug, Clone, Default)]
pub struct DurableQueueOptionsBuilder {
    opts: DurableQueueOptions,
}

impl DurableQueueOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.dir = Some(dir.into());
        self
    }

    pub fn seg_bytes(mut self, bytes: u64) -> Self {
        self.opts.seg_bytes = bytes;
        self
    }

    pub fn offload_mode(mut self, enabled: bool) -> Self {
        self.opts.offload_mode = enabled;
        self
    }

    pub fn max_total_bytes(mut self, bytes: u64) -> Self {
        self.opts.max_total_bytes = Some(bytes);
        self
    }

    /// `None` (the default) means infinity: messages never age out.
    pub fn retention_period(mut self, period: Duration) -> Self {
        self.opts.retention_period = Some(period);
        self
    }

    pub fn build(self) -> DurableQueueOptions {
        self.opts
    }
}

/// Producer options enumerated in spec §6.
#[derive(Clone)]
pub struct ProducerOptions {
    pub batch_size: usize,
    pub strategy: RoutingStrategy,
    pub callback: Option<SendCallback>,
    pub tcp_opts: TcpOpts,
    pub queue_opts: DurableQueueOptions,
    pub sync_call_timeout: Duration,
}

impl std::fmt::Debug for ProducerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerOptions")
            .field("batch_size", &self.batch_size)
            .field("strategy", &self.strategy)
            .field("has_callback", &self.callback.is_some())
            .field("tcp_opts", &self.tcp_opts)
            .field("queue_opts", &self.queue_opts)
            .field("sync_call_timeout", &self.sync_call_timeout)
            .finish()
    }
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            batch_size: 0,
            strategy: RoutingStrategy::default(),
            callback: None,
            tcp_opts: TcpOpts::default(),
            queue_opts: DurableQueueOptions::default(),
            sync_call_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for [`ProducerOptions`].
#[must_use = "builders do nothing unless you call .build()"]
#[derive(Default)]
pub struct ProducerOptionsBuilder {
    opts: ProducerOptions,
}

impl ProducerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft maximum of messages coalesced per send. `0` disables coalescing.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.opts.batch_size = batch_size;
        self
    }

    pub fn strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.opts.strategy = strategy;
        self
    }

    /// Set the async-path result sink.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Result<SendOutcome, ProducerError>) + Send + Sync + 'static,
    {
        self.opts.callback = Some(Arc::new(callback));
        self
    }

    pub fn tcp_opts(mut self, tcp_opts: TcpOpts) -> Self {
        self.opts.tcp_opts = tcp_opts;
        self
    }

    pub fn queue_opts(mut self, queue_opts: DurableQueueOptions) -> Self {
        self.opts.queue_opts = queue_opts;
        self
    }

    pub fn sync_call_timeout(mut self, timeout: Duration) -> Self {
        self.opts.sync_call_timeout = timeout;
        self
    }

    pub fn build(self) -> ProducerOptions {
        self.opts
    }
}

/// A batch of messages accepted together from one `send`/`send_sync` call.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
}

impl From<Vec<Message>> for MessageBatch {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_options_default_sync_call_timeout_is_five_seconds() {
        assert_eq!(ProducerOptions::default().sync_call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides_sync_call_timeout() {
        let opts = ProducerOptionsBuilder::new()
            .sync_call_timeout(Duration::from_secs(30))
            .build();
        assert_eq!(opts.sync_call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn a_bare_vec_of_messages_converts_into_a_message_batch() {
        let messages = vec![Message::new(Vec::from(*b"a")), Message::new(Vec::from(*b"b"))];
        let batch: MessageBatch = messages.clone().into();
        assert_eq!(batch.messages.len(), messages.len());
    }
}
