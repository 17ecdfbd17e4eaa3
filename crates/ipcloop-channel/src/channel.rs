use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ipcloop_frame::{encode_to_bytes, FrameDecoder, FrameError, Message, MessageType};
use ipcloop_transport::{Transport, UdsTransport};
use tracing::{debug, trace, warn};

use crate::binding::{Binding, DisconnectReason, Interest, Readiness};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::event::{Event, SubscriptionId};
use crate::event_loop::EventLoop;
use crate::lock;

/// Identifies a channel within its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Which end of the connection a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Listens on the address and serves one client at a time.
    Server,
    /// Connects to a listening server.
    Client,
}

/// Connection lifecycle. Only the event loop thread changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications raised by a channel, always on the event loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    ConnectedToClient,
    ConnectedToServer,
    DisconnectedFromClient,
    DisconnectedFromServer,
    /// Decoded messages were added to the inbound queue.
    NewMessages,
}

/// Result of [`Channel::wait_for_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Messages arrived (and were processed), or the channel is not connected.
    Ready,
    /// The timeout elapsed with nothing to process.
    TimedOut,
}

#[derive(Debug, Default)]
struct OutboundQueue {
    frames: VecDeque<Bytes>,
    flush_scheduled: bool,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    address: PathBuf,
    mode: Mode,
    config: ChannelConfig,
    event_loop: EventLoop,
    state: Mutex<ConnectionState>,
    outbound: Mutex<OutboundQueue>,
    frames_written: AtomicU64,
    inbound: Mutex<VecDeque<Message>>,
    inbound_signal: Condvar,
    accumulator: Mutex<FrameDecoder>,
    // Taken only on the event loop thread. Lock order: io, then any other lock.
    io: Mutex<Binding>,
    events: Event<ChannelEvent>,
    messages: Event<Message>,
}

/// One end of a framed, bidirectional IPC connection.
///
/// All socket work happens on the [`EventLoop`] the channel was created with;
/// the methods here only touch queues and return immediately, except
/// [`wait_for_messages`](Channel::wait_for_messages).
///
/// Dropping a channel unregisters it from its loop. Queued outbound messages
/// are discarded and the connection is closed.
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a Unix domain socket channel with default configuration.
    pub fn new(event_loop: &EventLoop, address: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::with_config(event_loop, address, mode, ChannelConfig::default())
    }

    /// Create a Unix domain socket channel with explicit configuration.
    pub fn with_config(
        event_loop: &EventLoop,
        address: impl AsRef<Path>,
        mode: Mode,
        config: ChannelConfig,
    ) -> Result<Self> {
        Self::with_transport(
            event_loop,
            address,
            mode,
            config,
            Arc::new(UdsTransport::new()),
        )
    }

    /// Create a channel over an explicit transport implementation.
    pub fn with_transport(
        event_loop: &EventLoop,
        address: impl AsRef<Path>,
        mode: Mode,
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let address = address.as_ref().to_path_buf();
        config.validate()?;
        transport
            .validate_address(&address)
            .map_err(ChannelError::Address)?;

        let id = event_loop.next_channel_id();
        let inner = Arc::new(ChannelInner {
            id,
            accumulator: Mutex::new(FrameDecoder::with_config(config.frame_config())),
            io: Mutex::new(Binding::new(transport, config.read_buffer_size)),
            address,
            mode,
            config,
            event_loop: event_loop.clone(),
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(OutboundQueue::default()),
            inbound: Mutex::new(VecDeque::new()),
            inbound_signal: Condvar::new(),
            events: Event::new(),
            messages: Event::new(),
            frames_written: AtomicU64::new(0),
        });
        event_loop.register(&inner);
        debug!(channel = %id, address = ?inner.address, ?mode, "channel created");

        Ok(Self { inner })
    }

    /// Ask the loop to start listening (server) or connecting (client).
    ///
    /// No-op unless the channel is `Disconnected`. Completion is reported by
    /// `ConnectedToClient` / `ConnectedToServer`.
    pub fn connect(&self) {
        if self.inner.state() != ConnectionState::Disconnected {
            return;
        }
        self.inner.event_loop.request_connect(self.inner.id);
    }

    /// Ask the loop to close the connection. Idempotent.
    ///
    /// The intent is always queued, so a disconnect issued right after
    /// [`Channel::connect`] still applies once the loop has run the connect.
    /// On a channel that is already `Disconnected` the loop ignores it.
    pub fn disconnect(&self) {
        self.inner.event_loop.request_disconnect(self.inner.id);
    }

    /// Queue a message for delivery.
    ///
    /// The message stays queued until it is written or the channel
    /// disconnects. Returns `false` when no prompt delivery could be
    /// scheduled: the channel is not connected, or the message was too large
    /// to frame (in which case it is not queued at all).
    pub fn send(&self, msg: &Message) -> bool {
        self.inner.send(msg)
    }

    /// Serialize `value` and queue it. See [`Channel::send`].
    pub fn send_value<T: MessageType>(&self, value: &T) -> bool {
        match Message::encode(value) {
            Ok(msg) => self.inner.send(&msg),
            Err(err) => {
                warn!(channel = %self.inner.id, error = %err, "failed to serialize message");
                false
            }
        }
    }

    /// Hand every queued inbound message to the message handlers, in order.
    ///
    /// Returns whether anything was processed.
    pub fn process_messages(&self) -> bool {
        self.inner.process_messages()
    }

    /// Block until a message arrives, the channel leaves `Connected`, or the
    /// timeout elapses; then process queued messages.
    ///
    /// Returns [`WaitOutcome::Ready`] immediately if the channel is not connected.
    pub fn wait_for_messages(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.inner.wait_for_messages(timeout)
    }

    /// Register a handler for connection and arrival events.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    /// Register a handler invoked by [`Channel::process_messages`].
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(handler)
    }

    pub fn remove_event_handler(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn remove_message_handler(&self, id: SubscriptionId) -> bool {
        self.inner.messages.unsubscribe(id)
    }

    /// The connection event broadcaster, for scoped subscriptions.
    pub fn events(&self) -> &Event<ChannelEvent> {
        &self.inner.events
    }

    /// The message broadcaster, for scoped subscriptions.
    pub fn messages(&self) -> &Event<Message> {
        &self.inner.messages
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn address(&self) -> &Path {
        &self.inner.address
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    /// Frames queued but not yet completely written.
    pub fn pending_outbound(&self) -> usize {
        lock(&self.inner.outbound).frames.len()
    }

    /// Frames completely written to a connection since the channel was created.
    ///
    /// Frames discarded by a disconnect are not counted.
    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::SeqCst)
    }

    /// Decoded messages waiting for [`Channel::process_messages`].
    pub fn pending_inbound(&self) -> usize {
        lock(&self.inner.inbound).len()
    }

    /// Bytes of a partially received frame.
    pub fn buffered_inbound_bytes(&self) -> usize {
        lock(&self.inner.accumulator).buffered_len()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("mode", &self.inner.mode)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.event_loop.unregister(self.inner.id);
    }
}

impl ChannelInner {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn address(&self) -> &Path {
        &self.address
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *lock(&self.state), next);
        if prev != next {
            trace!(channel = %self.id, from = ?prev, to = ?next, "state change");
        }
    }

    pub(crate) fn raise(&self, event: ChannelEvent) {
        self.events.broadcast(&event);
    }

    fn send(&self, msg: &Message) -> bool {
        let frame = match encode_to_bytes(msg, self.config.max_frame_size) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(channel = %self.id, error = %err, "message rejected");
                return false;
            }
        };

        // Lock order: outbound, then state.
        let (connected, schedule) = {
            let mut outbound = lock(&self.outbound);
            outbound.frames.push_back(frame);
            let connected = self.state() == ConnectionState::Connected;
            let schedule = connected && !outbound.flush_scheduled;
            if schedule {
                outbound.flush_scheduled = true;
            }
            (connected, schedule)
        };

        if schedule {
            self.event_loop.request_send(self.id);
        }
        connected
    }

    fn process_messages(&self) -> bool {
        let batch = std::mem::take(&mut *lock(&self.inbound));
        if batch.is_empty() {
            return false;
        }
        trace!(channel = %self.id, count = batch.len(), "processing messages");
        for msg in &batch {
            self.messages.broadcast(msg);
        }
        true
    }

    fn wait_for_messages(&self, timeout: Option<Duration>) -> WaitOutcome {
        if self.state() != ConnectionState::Connected {
            return WaitOutcome::Ready;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        {
            // Lock order: inbound, then state.
            let mut inbound = lock(&self.inbound);
            while inbound.is_empty() && self.state() == ConnectionState::Connected {
                match deadline {
                    None => {
                        inbound = self
                            .inbound_signal
                            .wait(inbound)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return WaitOutcome::TimedOut;
                        }
                        inbound = self
                            .inbound_signal
                            .wait_timeout(inbound, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        }

        self.process_messages();
        WaitOutcome::Ready
    }

    /// Feed bytes read from the connection. Loop thread only.
    ///
    /// Messages completed before a protocol violation are still queued; the
    /// error is returned after they are.
    pub(crate) fn receive_raw_bytes(&self, data: &[u8]) -> std::result::Result<usize, FrameError> {
        let mut decoded = Vec::new();
        let fed = lock(&self.accumulator).feed_into(data, &mut decoded);

        if !decoded.is_empty() {
            let count = decoded.len();
            lock(&self.inbound).extend(decoded);
            self.inbound_signal.notify_all();
            trace!(channel = %self.id, count, "messages received");
            self.raise(ChannelEvent::NewMessages);
        }
        fed
    }

    /// Oldest queued frame, or `None` after clearing the flush flag.
    pub(crate) fn next_outbound(&self) -> Option<Bytes> {
        let mut outbound = lock(&self.outbound);
        match outbound.frames.front() {
            Some(frame) => Some(frame.clone()),
            None => {
                outbound.flush_scheduled = false;
                None
            }
        }
    }

    pub(crate) fn pop_outbound(&self) {
        if lock(&self.outbound).frames.pop_front().is_some() {
            self.frames_written.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop queued and partially received data after a disconnect, then wake
    /// blocked waiters so they observe the new state.
    pub(crate) fn discard_buffers(&self, clear_inbound: bool) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.frames.clear();
            outbound.flush_scheduled = false;
        }
        lock(&self.accumulator).reset();

        let mut inbound = lock(&self.inbound);
        if clear_inbound {
            inbound.clear();
        }
        self.inbound_signal.notify_all();
    }

    pub(crate) fn internal_connect(&self) {
        lock(&self.io).connect(self);
    }

    pub(crate) fn internal_disconnect(&self, reason: DisconnectReason) {
        lock(&self.io).disconnect(self, reason);
    }

    pub(crate) fn internal_send(&self) {
        lock(&self.io).flush(self);
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        let state = self.state();
        lock(&self.io).interest(state)
    }

    pub(crate) fn on_ready(&self, readiness: Readiness) {
        lock(&self.io).on_ready(self, readiness);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::EventLoopConfig;

    fn test_loop() -> EventLoop {
        EventLoop::start(EventLoopConfig::default()).expect("event loop should start")
    }

    fn sock_path(tag: &str) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/ipcloop-ch-{tag}-{}-{}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .subsec_nanos()
        ))
    }

    fn text(s: &str) -> Message {
        Message::new("text", s.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn new_channel_starts_disconnected() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("new"), Mode::Client).unwrap();

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.mode(), Mode::Client);
        assert!(!channel.is_connected());
        assert_eq!(event_loop.channel_count(), 1);

        drop(channel);
        assert_eq!(event_loop.channel_count(), 0);
        event_loop.shutdown();
    }

    #[test]
    fn over_long_address_is_rejected_at_construction() {
        let event_loop = test_loop();
        let long = format!("/tmp/{}.sock", "x".repeat(200));

        let err = Channel::new(&event_loop, long, Mode::Server).unwrap_err();
        assert!(matches!(err, ChannelError::Address(_)));
        assert_eq!(event_loop.channel_count(), 0);
        event_loop.shutdown();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let event_loop = test_loop();
        let config = ChannelConfig {
            read_buffer_size: 0,
            ..ChannelConfig::default()
        };
        let err = Channel::with_config(&event_loop, sock_path("cfg"), Mode::Server, config)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
        event_loop.shutdown();
    }

    #[test]
    fn send_while_disconnected_queues_and_returns_false() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("queue"), Mode::Client).unwrap();

        assert!(!channel.send(&text("early")));
        assert!(!channel.send_value(&"typed".to_string()));
        assert_eq!(channel.pending_outbound(), 2);
        event_loop.shutdown();
    }

    #[test]
    fn oversized_message_is_not_queued() {
        let event_loop = test_loop();
        let config = ChannelConfig {
            max_frame_size: 32,
            ..ChannelConfig::default()
        };
        let channel =
            Channel::with_config(&event_loop, sock_path("big"), Mode::Client, config).unwrap();

        assert!(!channel.send(&text(&"x".repeat(64))));
        assert_eq!(channel.pending_outbound(), 0);
        event_loop.shutdown();
    }

    #[test]
    fn disconnect_while_disconnected_raises_nothing() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("idle"), Mode::Server).unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        channel.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.disconnect();
        channel.inner.internal_disconnect(DisconnectReason::Requested);

        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        event_loop.shutdown();
    }

    #[test]
    fn wait_for_messages_returns_immediately_when_not_connected() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("wait"), Mode::Client).unwrap();

        let start = Instant::now();
        let outcome = channel.wait_for_messages(Some(Duration::from_secs(5)));
        assert_eq!(outcome, WaitOutcome::Ready);
        assert!(start.elapsed() < Duration::from_secs(1));
        event_loop.shutdown();
    }

    #[test]
    fn received_bytes_are_processed_in_order() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("recv"), Mode::Client).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on_message(move |msg| {
            sink.lock()
                .unwrap()
                .push(String::from_utf8(msg.body().to_vec()).unwrap());
        });
        let new_messages = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&new_messages);
        channel.on_event(move |event| {
            if *event == ChannelEvent::NewMessages {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let first = encode_to_bytes(&text("one"), 1024).unwrap();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&encode_to_bytes(&text("two"), 1024).unwrap());
        let split = wire.len() - 3;

        assert_eq!(channel.inner.receive_raw_bytes(&wire[..split]).unwrap(), 1);
        assert_eq!(channel.buffered_inbound_bytes(), split - first.len());
        assert_eq!(channel.inner.receive_raw_bytes(&wire[split..]).unwrap(), 1);
        assert_eq!(channel.pending_inbound(), 2);
        assert_eq!(new_messages.load(Ordering::SeqCst), 2);

        assert!(channel.process_messages());
        assert!(!channel.process_messages());
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
        event_loop.shutdown();
    }

    #[test]
    fn receive_raw_bytes_rejects_bad_magic() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("magic"), Mode::Client).unwrap();

        let err = channel
            .inner
            .receive_raw_bytes(b"NOPE\x10\x00\x00\x00payload!")
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(channel.pending_inbound(), 0);
        assert_eq!(channel.buffered_inbound_bytes(), 0);
        event_loop.shutdown();
    }

    #[test]
    fn receive_raw_bytes_queues_messages_ahead_of_a_bad_frame() {
        let event_loop = test_loop();
        let channel = Channel::new(&event_loop, sock_path("ahead"), Mode::Client).unwrap();

        let mut wire = encode_to_bytes(&text("valid-first"), 1024).unwrap().to_vec();
        wire.extend_from_slice(b"NOPE\x10\x00\x00\x00payload!");

        let err = channel.inner.receive_raw_bytes(&wire).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(channel.pending_inbound(), 1);
        assert_eq!(channel.buffered_inbound_bytes(), 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on_message(move |msg| sink.lock().unwrap().push(msg.clone()));
        assert!(channel.process_messages());
        assert_eq!(*seen.lock().unwrap(), vec![text("valid-first")]);
        event_loop.shutdown();
    }
}
