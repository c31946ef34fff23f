//! The producer actor: connection state machine, batching/sequencing, and
//! reconciliation of broker acknowledgements against the request table and
//! durable queue (spec §4.1 — the 55% share of this core).

use crate::error::{ProducerError, TransportError};
use crate::message::Message;
use crate::options::{MessageBatch, ProducerOptions, SendOutcome};
use crate::queue::{self, AckRef, DurableQueue, QueueItem};
use crate::request_table::{InflightRequest, RequestTable};
use crate::wire::{BrokerFrame, Command, PulsarFrameCodec, WireCodec};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_ID_WRAP: u64 = 65_535;
const SEQUENCE_ID_WRAP: u64 = 4_294_836_225;
const CLIENT_VERSION: &str = concat!("pulsar-producer-core/", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: i32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

/// A handle-visible snapshot of actor state that doesn't require routing
/// through the mailbox — mirrors the teacher's pattern of exposing a
/// `parking_lot`-guarded snapshot (`ProducerState`) alongside the
/// message-driven hot path.
#[derive(Debug, Default)]
struct Snapshot {
    state: Option<ConnectionState>,
    producer_name: Option<String>,
}

/// Messages accepted by the actor's mailbox.
enum ActorMessage {
    Send(Vec<Message>),
    SendSync(
        Vec<Message>,
        oneshot::Sender<Result<u64, ProducerError>>,
        Duration,
    ),
    Shutdown(oneshot::Sender<()>),
}

enum SocketEvent {
    Data(BytesMut),
    Closed,
}

/// Cloneable handle to a running partition producer actor.
#[derive(Clone)]
pub struct PartitionProducerHandle {
    cmd_tx: mpsc::UnboundedSender<ActorMessage>,
    shared: Arc<Mutex<Snapshot>>,
    sync_call_timeout: Duration,
}

impl PartitionProducerHandle {
    /// Fire-and-forget submission (spec §4.1, `connected on user send`).
    ///
    /// Silently dropped if the actor has already shut down, matching the
    /// teacher's `Producer::append` "silent failure when closed" contract.
    pub fn send(&self, messages: impl Into<MessageBatch>) {
        let _ = self.cmd_tx.send(ActorMessage::Send(messages.into().messages));
    }

    /// Awaitable submission (spec §4.1, `connected on user send_sync`).
    ///
    /// `timeout` bounds only the caller's wait; the actor keeps processing
    /// the batch and will still deliver the receipt to the durable queue
    /// even if this call already returned `SendTimedOut` (spec §5, §8
    /// scenario 6).
    pub async fn send_sync(
        &self,
        messages: impl Into<MessageBatch>,
        timeout: Duration,
    ) -> Result<u64, ProducerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorMessage::SendSync(messages.into().messages, tx, timeout))
            .map_err(|_| ProducerError::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(ProducerError::Closed),
            Err(_elapsed) => Err(ProducerError::SendTimedOut),
        }
    }

    /// Like [`Self::send_sync`], bounded by `ProducerOptions::sync_call_timeout`
    /// instead of a per-call value.
    pub async fn send_sync_default(
        &self,
        messages: impl Into<MessageBatch>,
    ) -> Result<u64, ProducerError> {
        self.send_sync(messages.into(), self.sync_call_timeout).await
    }

    /// Flushes and closes the durable queue, then terminates the actor.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ActorMessage::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.shared.lock().state
    }

    pub fn producer_name(&self) -> Option<String> {
        self.shared.lock().producer_name.clone()
    }
}

/// Owns the TCP connection, batching policy, sequence allocation, and the
/// in-flight request table for one `(client, topic-partition)`.
pub struct PartitionProducer {
    partition_topic: String,
    broker_url: String,
    opts: ProducerOptions,
    codec: Box<dyn PulsarFrameCodec>,
    durable_queue: Box<dyn DurableQueue>,

    producer_id: u64,
    producer_name: Option<String>,
    next_request_id: u64,
    next_sequence_id: u64,
    requests: RequestTable,

    state: ConnectionState,
    write_half: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    carry_buffer: BytesMut,
    reconnect_timer: Option<Duration>,
    keepalive_deadline: Option<Instant>,
    shutting_down: bool,
    /// Sync callers whose message has been durably queued but not yet
    /// batched onto the wire, because the actor was `idle`/`connecting`
    /// at append time (spec §1: the queue accepts messages even while
    /// disconnected). Matched against `ack_ref` once `drain_queue_backlog`
    /// forms a batch containing that item.
    pending_sync_replies: Vec<(AckRef, oneshot::Sender<Result<u64, ProducerError>>)>,

    cmd_rx: mpsc::UnboundedReceiver<ActorMessage>,
    sock_tx: mpsc::UnboundedSender<SocketEvent>,
    sock_rx: mpsc::UnboundedReceiver<SocketEvent>,
    shared: Arc<Mutex<Snapshot>>,
}

impl PartitionProducer {
    /// Spawns the actor task and returns a handle to it. Mirrors spec
    /// §4.4's "startup call with (partition_topic, broker_url, opts)".
    pub fn spawn(
        partition_topic: String,
        broker_url: String,
        opts: ProducerOptions,
    ) -> Result<PartitionProducerHandle, ProducerError> {
        let durable_queue = queue::build_queue(&opts.queue_opts)?;
        Self::spawn_with(partition_topic, broker_url, opts, durable_queue, Box::new(WireCodec))
    }

    /// As [`spawn`], but with an injected queue/codec — the seam used by
    /// the code-change (upgrade/downgrade) flow in §4.3 and by tests.
    pub fn spawn_with(
        partition_topic: String,
        broker_url: String,
        opts: ProducerOptions,
        durable_queue: Box<dyn DurableQueue>,
        codec: Box<dyn PulsarFrameCodec>,
    ) -> Result<PartitionProducerHandle, ProducerError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sock_tx, sock_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Snapshot {
            state: Some(ConnectionState::Idle),
            producer_name: None,
        }));

        let producer_id: u64 = rand::random();
        let sync_call_timeout = opts.sync_call_timeout;

        let actor = PartitionProducer {
            partition_topic,
            broker_url,
            opts,
            codec,
            durable_queue,
            producer_id,
            producer_name: None,
            next_request_id: 1,
            next_sequence_id: 1,
            requests: RequestTable::new(),
            state: ConnectionState::Idle,
            write_half: None,
            reader_task: None,
            carry_buffer: BytesMut::new(),
            reconnect_timer: Some(Duration::ZERO),
            keepalive_deadline: None,
            shutting_down: false,
            pending_sync_replies: Vec::new(),
            cmd_rx,
            sock_tx,
            sock_rx,
            shared: shared.clone(),
        };

        tokio::spawn(actor.run());

        Ok(PartitionProducerHandle {
            cmd_tx,
            shared,
            sync_call_timeout,
        })
    }

    fn effective_batch_size(&self) -> usize {
        if self.opts.batch_size == 0 {
            1
        } else {
            self.opts.batch_size
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.shared.lock().state = Some(state);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            partition_topic = %self.partition_topic,
            broker_url = %self.broker_url,
            ?state,
            "state transition"
        );
    }

    fn alloc_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = if id >= REQUEST_ID_WRAP { 1 } else { id + 1 };
        id
    }

    /// Returns `None` if the candidate would collide with a still-in-flight
    /// `sequence_id` (invariant 3) — the caller must refuse to allocate
    /// rather than overwrite an existing entry.
    fn alloc_sequence_id(&mut self) -> Option<u64> {
        let candidate = self.next_sequence_id;
        if self.requests.contains(candidate) {
            return None;
        }
        self.next_sequence_id = if candidate >= SEQUENCE_ID_WRAP {
            1
        } else {
            candidate + 1
        };
        Some(candidate)
    }

    async fn run(mut self) {
        loop {
            let reconnect_sleep = self.reconnect_timer.map(sleep);
            let keepalive_sleep = self
                .keepalive_deadline
                .map(|deadline| sleep(deadline.saturating_duration_since(Instant::now())));

            tokio::select! {
                biased;

                msg = self.cmd_rx.recv() => {
                    match msg {
                        Some(other) => {
                            self.handle_command(other).await;
                            if self.shutting_down {
                                return;
                            }
                        }
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                event = self.sock_rx.recv() => {
                    if let Some(event) = event {
                        if self.handle_socket_event(event).await {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                _ = conditional_sleep(reconnect_sleep) => {
                    self.reconnect_timer = None;
                    self.attempt_connect().await;
                }

                _ = conditional_sleep(keepalive_sleep) => {
                    self.send_ping().await;
                    self.keepalive_deadline = Some(Instant::now() + KEEPALIVE_INTERVAL);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.write_half = None;
        let _ = self.durable_queue.close().await;
        #[cfg(feature = "tracing")]
        tracing::info!(partition_topic = %self.partition_topic, "producer actor shut down");
    }

    async fn handle_command(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Send(messages) => self.handle_send(messages).await,
            ActorMessage::SendSync(messages, reply, _timeout) => {
                self.handle_send_sync(messages, reply).await
            }
            ActorMessage::Shutdown(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
                self.shutting_down = true;
            }
        }
    }

    /// The durable queue accepts messages in every state (spec §1, §4.3:
    /// "the actor never treats the queue as optional in its hot path"); only
    /// framing onto the wire is gated on `Connected`. While `idle`/
    /// `connecting`, the message is appended and left for
    /// `drain_queue_backlog` to pick up once `ProducerSuccess` arrives.
    async fn handle_send(&mut self, first: Vec<Message>) {
        let item = queue::item_now(first);
        let ack_ref = match self.durable_queue.append(item.clone()).await {
            Ok(r) => r,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "durable queue append failed on async path");
                return;
            }
        };

        if self.state != ConnectionState::Connected {
            return;
        }

        let mut entries = vec![(Instant::now(), item.messages)];
        let mut last_ack_ref = ack_ref;

        let budget = self.effective_batch_size().saturating_sub(1);
        for _ in 0..budget {
            let next = match self.cmd_rx.try_recv() {
                Ok(ActorMessage::Send(more)) => more,
                Ok(other) => {
                    // Not a cast: requeue isn't possible on an mpsc
                    // receiver, so handle it inline and stop draining —
                    // a sync call always starts its own batch (spec §4.1).
                    self.handle_command(other).await;
                    break;
                }
                Err(_) => break,
            };

            let item = queue::item_now(next);
            match self.durable_queue.append(item.clone()).await {
                Ok(r) => {
                    last_ack_ref = r;
                    entries.push((Instant::now(), item.messages));
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "durable queue append failed while coalescing");
                    break;
                }
            }
        }

        self.send_batch(entries, last_ack_ref, Vec::new()).await;
    }

    /// As [`handle_send`], but the caller is awaiting a reply. If the actor
    /// isn't `Connected` yet, the message is still durably queued and the
    /// reply is parked in `pending_sync_replies` until `drain_queue_backlog`
    /// batches it after the next `ProducerSuccess` — the caller's own
    /// `send_sync` timeout is what gives up, not this handler (spec §5
    /// cancellation semantics).
    async fn handle_send_sync(
        &mut self,
        messages: Vec<Message>,
        reply: oneshot::Sender<Result<u64, ProducerError>>,
    ) {
        let item = queue::item_now(messages);
        let ack_ref = match self.durable_queue.append(item.clone()).await {
            Ok(r) => r,
            Err(e) => {
                let _ = reply.send(Err(ProducerError::from(e)));
                return;
            }
        };

        if self.state != ConnectionState::Connected {
            self.pending_sync_replies.push((ack_ref, reply));
            return;
        }

        let entries = vec![(Instant::now(), item.messages)];
        self.send_batch(entries, ack_ref, vec![reply]).await;
    }

    /// Assigns a `sequence_id`, records the in-flight entry, frames, and
    /// writes. Shared by the cast path, the call path, and reconnect's
    /// queue-backlog drain.
    async fn send_batch(
        &mut self,
        entries: Vec<(Instant, Vec<Message>)>,
        ack_ref: AckRef,
        replies: Vec<oneshot::Sender<Result<u64, ProducerError>>>,
    ) {
        let Some(sequence_id) = self.alloc_sequence_id() else {
            #[cfg(feature = "tracing")]
            tracing::warn!("sequence_id allocation blocked: wrap would collide with in-flight entry");
            for reply in replies {
                let _ = reply.send(Err(ProducerError::SequenceIdExhausted));
            }
            return;
        };

        let messages: Vec<Message> = entries.iter().flat_map(|(_, m)| m.clone()).collect();

        // Marks the cursor past `ack_ref` regardless of whether this batch
        // came from a direct hot-path `append` or from `drain_queue_backlog`'s
        // `peek` (which already advanced it) — see `DurableQueue::mark_sent`.
        // Without this, a reconnect's backlog drain would peek this same
        // entry again and double-send it under a second `sequence_id`.
        self.durable_queue.mark_sent(ack_ref);

        self.requests.insert(
            sequence_id,
            InflightRequest {
                ack_ref,
                replies,
                entries,
            },
        );

        self.write_send_frame(self.producer_id, sequence_id, messages).await;
    }

    async fn write_send_frame(&mut self, producer_id: u64, sequence_id: u64, messages: Vec<Message>) {
        #[cfg(feature = "tracing")]
        tracing::trace!(sequence_id, count = messages.len(), "framing send");

        let frame = self.codec.encode(Command::Send {
            producer_id,
            sequence_id,
            messages,
        });
        self.write_frame(frame.to_vec()).await;
    }

    async fn write_frame(&mut self, frame: Vec<u8>) {
        let Some(write_half) = self.write_half.as_mut() else {
            return;
        };
        let send_timeout = self.opts.tcp_opts.send_timeout.unwrap_or(CONNECTION_TIMEOUT);
        let result = tokio::time::timeout(send_timeout, write_half.write_all(&frame)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.on_transport_error(TransportError::from(e)).await,
            Err(_) => self.on_transport_error(TransportError::Timeout).await,
        }
    }

    async fn on_transport_error(&mut self, err: TransportError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %err, "transport error, tearing down connection");
        self.tcp_closed().await;
    }

    async fn tcp_closed(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.write_half = None;
        self.carry_buffer.clear();
        self.shared.lock().producer_name = None;
        self.keepalive_deadline = None;
        self.reconnect_timer = Some(RECONNECT_DELAY);
        self.set_state(ConnectionState::Idle);
        // `requests` is retained per spec §4.1 — it is re-transmitted once
        // `connected` is reached again.
    }

    /// Opens the TCP connection per spec §4.1: `{nodelay, reuseaddr,
    /// send_timeout=60s}` plus a buffer sized to `max(recbuf, sndbuf)`, all
    /// overridable via `opts.tcp_opts`. `reuseaddr`/the buffer sizes must be
    /// set on the unconnected socket, which is why this goes through
    /// `TcpSocket` instead of `TcpStream::connect` directly.
    async fn attempt_connect(&mut self) {
        self.set_state(ConnectionState::Idle);

        let connect_timeout = self.opts.tcp_opts.send_timeout.unwrap_or(CONNECTION_TIMEOUT);
        let (host, port) = parse_broker_url(&self.broker_url);

        let addr = match tokio::time::timeout(connect_timeout, lookup_host((host.as_str(), port))).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(broker_url = %self.broker_url, "dns lookup returned no addresses, retrying in 5s");
                    self.reconnect_timer = Some(RECONNECT_DELAY);
                    return;
                }
            },
            Ok(Err(_)) | Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(broker_url = %self.broker_url, "dns lookup failed, retrying in 5s");
                self.reconnect_timer = Some(RECONNECT_DELAY);
                return;
            }
        };

        let socket = match if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        } {
            Ok(socket) => socket,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "failed to create tcp socket, retrying in 5s");
                self.reconnect_timer = Some(RECONNECT_DELAY);
                return;
            }
        };
        if let Err(e) = apply_pre_connect_tcp_opts(&socket, &self.opts.tcp_opts) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to apply tcp socket options, proceeding with defaults");
        }

        let stream = match tokio::time::timeout(connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) | Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %TransportError::ConnectFailed { broker_url: self.broker_url.clone() },
                    "connect failed, retrying in 5s"
                );
                self.reconnect_timer = Some(RECONNECT_DELAY);
                return;
            }
        };

        if let Err(e) = apply_post_connect_tcp_opts(&stream, &self.opts.tcp_opts) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to apply tcp options, proceeding with defaults");
        }

        let (mut read_half, write_half) = stream.into_split();
        self.write_half = Some(write_half);

        let sock_tx = self.sock_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = sock_tx.send(SocketEvent::Closed);
                        return;
                    }
                    Ok(n) => {
                        if sock_tx
                            .send(SocketEvent::Data(BytesMut::from(&buf[..n])))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = sock_tx.send(SocketEvent::Closed);
                        return;
                    }
                }
            }
        }));

        let connect_frame = self.codec.encode(Command::Connect {
            client_version: CLIENT_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
        });
        self.write_frame(connect_frame.to_vec()).await;
        self.set_state(ConnectionState::Connecting);
    }

    /// Returns `true` if the actor should terminate (broker closed the
    /// producer), in which case the caller is responsible for shutting down.
    async fn handle_socket_event(&mut self, event: SocketEvent) -> bool {
        match event {
            SocketEvent::Closed => {
                self.tcp_closed().await;
                false
            }
            SocketEvent::Data(data) => {
                self.carry_buffer.extend_from_slice(&data);
                loop {
                    match self.codec.decode(&mut self.carry_buffer) {
                        Ok(Some(frame)) => {
                            if self.handle_broker_frame(frame).await {
                                return true;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "malformed frame, dropping carry buffer");
                            self.carry_buffer.clear();
                            break;
                        }
                    }
                }
                false
            }
        }
    }

    /// Returns `true` if the broker told us to terminate this producer.
    async fn handle_broker_frame(&mut self, frame: BrokerFrame) -> bool {
        match (self.state, frame) {
            (ConnectionState::Connecting, BrokerFrame::Connected) => {
                let request_id = self.alloc_request_id();
                let topic = self.partition_topic.clone();
                let producer_id = self.producer_id;
                let frame = self.codec.encode(Command::CreateProducer {
                    topic,
                    producer_id,
                    request_id,
                });
                self.write_frame(frame.to_vec()).await;
                false
            }
            (ConnectionState::Connecting, BrokerFrame::ProducerSuccess { producer_name, .. }) => {
                self.producer_name = Some(producer_name.clone());
                self.shared.lock().producer_name = Some(producer_name.clone());
                #[cfg(feature = "tracing")]
                tracing::info!(%producer_name, "producer ready");

                self.keepalive_deadline = Some(Instant::now() + KEEPALIVE_INTERVAL);
                self.set_state(ConnectionState::Connected);

                self.redrive_inflight().await;
                self.drain_queue_backlog().await;
                false
            }
            (ConnectionState::Connected, BrokerFrame::SendReceipt { sequence_id, .. }) => {
                self.complete_receipt(sequence_id).await;
                false
            }
            (ConnectionState::Connected, BrokerFrame::Ping) => {
                let frame = self.codec.encode(Command::Pong);
                self.write_frame(frame.to_vec()).await;
                false
            }
            (ConnectionState::Connected, BrokerFrame::Pong) => {
                self.keepalive_deadline = Some(Instant::now() + KEEPALIVE_INTERVAL);
                false
            }
            (ConnectionState::Connected, BrokerFrame::CloseProducer { .. }) => {
                // The actor terminates here; a real deployment's supervisor
                // restarts a fresh actor into `idle` (spec §4.1, §4.4).
                #[cfg(feature = "tracing")]
                tracing::info!("broker closed producer");
                self.fail_all_pending(ProducerError::BrokerClosed);
                true
            }
            (_, BrokerFrame::Unknown { tag }) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(tag, "unknown broker command, ignoring");
                false
            }
            (state, frame) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?state, ?frame, "unexpected broker frame for current state, ignoring");
                false
            }
        }
    }

    /// Replies to every synchronous caller, then fires the callback exactly
    /// once for the whole batch (spec §5 ordering guarantee, §8 scenario
    /// 2), then acks the durable queue, then drops the entry.
    async fn complete_receipt(&mut self, sequence_id: u64) {
        let Some(entry) = self.requests.take(sequence_id) else {
            // Receipt for an entry we no longer track (e.g. a duplicate
            // receipt after an earlier reconnect already completed it).
            return;
        };

        for reply in entry.replies {
            let _ = reply.send(Ok(sequence_id));
        }

        if let Some(callback) = &self.opts.callback {
            callback(Ok(SendOutcome {
                sequence_id,
                message_count: entry.message_count(),
            }));
        }

        if let Err(e) = self.durable_queue.ack(entry.ack_ref).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to ack durable queue after receipt");
        }
    }

    /// Re-sends every still-unacked in-flight entry with its original
    /// `sequence_id`, in ascending order, before anything newly queued
    /// (spec invariant 4).
    async fn redrive_inflight(&mut self) {
        let pending = self.requests.drain_sorted();
        for (sequence_id, entry) in pending {
            let messages: Vec<Message> = entry.entries.iter().flat_map(|(_, m)| m.clone()).collect();
            self.requests.insert(sequence_id, entry);
            self.write_send_frame(self.producer_id, sequence_id, messages).await;
        }
    }

    /// Pulls anything appended to the queue while disconnected that never
    /// made it into a batch, forming new batches up to `batch_size`.
    async fn drain_queue_backlog(&mut self) {
        loop {
            let peeked = match self.durable_queue.peek(self.effective_batch_size()).await {
                Ok(items) => items,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "failed to peek durable queue backlog");
                    return;
                }
            };
            if peeked.is_empty() {
                return;
            }

            let last_ack_ref = peeked.last().map(|(ack_ref, _)| *ack_ref).expect("non-empty");
            let peeked_ack_refs: Vec<AckRef> = peeked.iter().map(|(ack_ref, _)| *ack_ref).collect();
            let entries: Vec<(Instant, Vec<Message>)> = peeked
                .into_iter()
                .map(|(_, item): (AckRef, QueueItem)| (Instant::now(), item.messages))
                .collect();

            // Any sync callers whose message landed in this batch were
            // parked by `handle_send_sync` while disconnected; reunite them
            // with their now-forming batch rather than leaving them stranded.
            let (matched, unmatched): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_sync_replies)
                .into_iter()
                .partition(|(ack_ref, _)| peeked_ack_refs.contains(ack_ref));
            self.pending_sync_replies = unmatched;
            let replies = matched.into_iter().map(|(_, reply)| reply).collect();

            self.send_batch(entries, last_ack_ref, replies).await;
        }
    }

    /// Delivers `err` to every caller still waiting on a reply: sync
    /// callers whose batch is already in flight, sync callers still parked
    /// in `pending_sync_replies` because their message hasn't been batched
    /// yet, and the async callback for any in-flight batch that has no sync
    /// replies of its own. Used when the broker terminates the producer out
    /// from under callers who would otherwise just hang until their own
    /// local timeout fires.
    fn fail_all_pending(&mut self, err: ProducerError) {
        for (_, entry) in self.requests.drain_sorted() {
            if entry.replies.is_empty() {
                if let Some(callback) = &self.opts.callback {
                    callback(Err(err.clone()));
                }
            }
            for reply in entry.replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
        for (_, reply) in std::mem::take(&mut self.pending_sync_replies) {
            let _ = reply.send(Err(err.clone()));
        }
    }

    async fn send_ping(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let frame = self.codec.encode(Command::Ping);
        self.write_frame(frame.to_vec()).await;
    }
}

async fn conditional_sleep(sleep: Option<tokio::time::Sleep>) {
    match sleep {
        Some(s) => s.await,
        None => std::future::pending().await,
    }
}

/// `pulsar://host:port` per spec §6; anything else falls back to the
/// standalone default.
fn parse_broker_url(url: &str) -> (String, u16) {
    if let Some(rest) = url.strip_prefix("pulsar://") {
        if let Some((host, port)) = rest.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    ("127.0.0.1".to_string(), 6650)
}

/// Socket options that must be set before `connect()` is called.
/// `reuseaddr` defaults to on, matching spec §4.1's `{nodelay, reuseaddr,
/// send_timeout=60s}` default set. Buffer size is a single value applied to
/// both directions, sized to `max(recv_buffer_size, send_buffer_size)` per
/// spec §4.1 — the kernel buffer backs both reads and writes on the same
/// socket, so the larger of the two requirements covers both.
fn apply_pre_connect_tcp_opts(socket: &TcpSocket, opts: &crate::options::TcpOpts) -> std::io::Result<()> {
    if opts.reuseaddr.unwrap_or(true) {
        socket.set_reuseaddr(true)?;
    }
    let buf_size = opts.recv_buffer_size.unwrap_or(0).max(opts.send_buffer_size.unwrap_or(0));
    if buf_size > 0 {
        socket.set_recv_buffer_size(buf_size)?;
        socket.set_send_buffer_size(buf_size)?;
    }
    Ok(())
}

/// Socket options that only make sense once the connection is established.
fn apply_post_connect_tcp_opts(stream: &TcpStream, opts: &crate::options::TcpOpts) -> std::io::Result<()> {
    if opts.nodelay.unwrap_or(true) {
        stream.set_nodelay(true)?;
    }
    Ok(())
}
