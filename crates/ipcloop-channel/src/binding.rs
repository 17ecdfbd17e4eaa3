//! Per-channel socket state driven by the event loop thread.
//!
//! A [`Binding`] turns a channel's intents (connect, flush, disconnect) into
//! non-blocking transport calls and turns readiness reported by the loop
//! into state transitions. It lives behind the channel's `io` lock, which
//! only the loop thread ever takes.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

use ipcloop_transport::{ConnectStatus, Connection, Listener, Transport};
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelEvent, ChannelInner, ConnectionState, Mode};

/// Readable chunks consumed per readiness notification before yielding to
/// other channels. The loop polls level-triggered, so leftovers are picked up
/// on the next iteration.
const MAX_READS_PER_WAKE: usize = 64;

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectReason {
    /// `Channel::disconnect` was called.
    Requested,
    /// The peer closed its end (read returned 0).
    PeerClosed,
    /// The peer reset the connection.
    Reset,
    /// Any other read or write failure.
    IoError,
    /// The peer sent bytes that are not a valid frame stream.
    ProtocolViolation,
    /// The event loop is stopping.
    Shutdown,
    /// The loop reported the descriptor as invalid.
    InvalidHandle,
}

impl DisconnectReason {
    fn is_peer_loss(self) -> bool {
        matches!(
            self,
            Self::PeerClosed | Self::Reset | Self::IoError | Self::ProtocolViolation
        )
    }

    /// Only an explicit disconnect discards messages already received.
    fn clears_inbound(self) -> bool {
        self == Self::Requested
    }
}

/// The descriptor a channel wants the loop to wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub(crate) fn poll_events(&self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// What the loop observed on a channel's descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub invalid: bool,
}

impl Readiness {
    pub(crate) fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & (libc::POLLIN | libc::POLLHUP) != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & libc::POLLERR != 0,
            invalid: revents & libc::POLLNVAL != 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error || self.invalid)
    }
}

pub(crate) struct Binding {
    transport: Arc<dyn Transport>,
    listener: Option<Box<dyn Listener>>,
    conn: Option<Box<dyn Connection>>,
    /// Bytes of the front outbound frame already written.
    send_offset: usize,
    wants_write: bool,
    scratch: Vec<u8>,
}

impl Binding {
    pub(crate) fn new(transport: Arc<dyn Transport>, read_buffer_size: usize) -> Self {
        Self {
            transport,
            listener: None,
            conn: None,
            send_offset: 0,
            wants_write: false,
            scratch: vec![0u8; read_buffer_size],
        }
    }

    pub(crate) fn connect(&mut self, ch: &ChannelInner) {
        if ch.state() != ConnectionState::Disconnected {
            return;
        }

        match ch.mode() {
            Mode::Server => match self.transport.listen(ch.address()) {
                Ok(listener) => {
                    info!(channel = %ch.id(), address = ?ch.address(), "listening");
                    self.listener = Some(listener);
                    ch.set_state(ConnectionState::Connecting);
                }
                Err(err) => {
                    warn!(channel = %ch.id(), error = %err, "listen failed");
                }
            },
            Mode::Client => match self.transport.connect(ch.address()) {
                Ok((conn, status)) => {
                    self.conn = Some(conn);
                    ch.set_state(ConnectionState::Connecting);
                    match status {
                        ConnectStatus::Connected => self.complete_connect(ch),
                        ConnectStatus::InProgress => {
                            debug!(channel = %ch.id(), "connect in progress");
                        }
                    }
                }
                Err(err) => {
                    warn!(channel = %ch.id(), error = %err, "connect failed");
                }
            },
        }
    }

    pub(crate) fn interest(&self, state: ConnectionState) -> Option<Interest> {
        match state {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting => match (&self.conn, &self.listener) {
                (Some(conn), _) => Some(Interest {
                    fd: conn.raw_fd(),
                    readable: false,
                    writable: true,
                }),
                (None, Some(listener)) => Some(Interest {
                    fd: listener.raw_fd(),
                    readable: true,
                    writable: false,
                }),
                (None, None) => None,
            },
            ConnectionState::Connected => self.conn.as_ref().map(|conn| Interest {
                fd: conn.raw_fd(),
                readable: true,
                writable: self.wants_write,
            }),
        }
    }

    pub(crate) fn on_ready(&mut self, ch: &ChannelInner, readiness: Readiness) {
        if readiness.invalid {
            self.disconnect(ch, DisconnectReason::InvalidHandle);
            return;
        }

        match ch.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                if self.conn.is_some() {
                    self.complete_connect(ch);
                } else {
                    self.accept(ch);
                }
            }
            ConnectionState::Connected => {
                if readiness.readable || readiness.error {
                    self.read(ch);
                }
                if readiness.writable && ch.state() == ConnectionState::Connected {
                    self.wants_write = false;
                    self.flush(ch);
                }
            }
        }
    }

    fn accept(&mut self, ch: &ChannelInner) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        match listener.accept() {
            Ok(conn) => {
                self.conn = Some(conn);
                ch.set_state(ConnectionState::Connected);
                info!(channel = %ch.id(), "client connected");
                ch.raise(ChannelEvent::ConnectedToClient);
                self.flush(ch);
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(channel = %ch.id(), error = %err, "accept failed");
            }
        }
    }

    fn complete_connect(&mut self, ch: &ChannelInner) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };

        match conn.take_error() {
            Ok(None) => {
                ch.set_state(ConnectionState::Connected);
                info!(channel = %ch.id(), address = ?ch.address(), "connected to server");
                ch.raise(ChannelEvent::ConnectedToServer);
                self.flush(ch);
            }
            Ok(Some(err)) | Err(err) => {
                warn!(channel = %ch.id(), error = %err, "connect failed");
                self.conn = None;
                ch.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn read(&mut self, ch: &ChannelInner) {
        for _ in 0..MAX_READS_PER_WAKE {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };

            let n = match conn.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(channel = %ch.id(), "peer closed connection");
                    self.disconnect(ch, DisconnectReason::PeerClosed);
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    debug!(channel = %ch.id(), "connection reset by peer");
                    self.disconnect(ch, DisconnectReason::Reset);
                    return;
                }
                Err(err) => {
                    warn!(channel = %ch.id(), error = %err, "read failed");
                    self.disconnect(ch, DisconnectReason::IoError);
                    return;
                }
            };

            trace!(channel = %ch.id(), bytes = n, "read");
            if let Err(err) = ch.receive_raw_bytes(&self.scratch[..n]) {
                warn!(channel = %ch.id(), error = %err, "protocol violation, dropping connection");
                self.disconnect(ch, DisconnectReason::ProtocolViolation);
                return;
            }
        }
    }

    /// Write queued frames until the queue is empty or the socket would block.
    pub(crate) fn flush(&mut self, ch: &ChannelInner) {
        while ch.state() == ConnectionState::Connected {
            let Some(frame) = ch.next_outbound() else {
                self.wants_write = false;
                return;
            };
            let Some(conn) = self.conn.as_mut() else {
                return;
            };

            match conn.write(&frame[self.send_offset..]) {
                Ok(0) => {
                    warn!(channel = %ch.id(), "write returned zero bytes");
                    self.disconnect(ch, DisconnectReason::IoError);
                    return;
                }
                Ok(n) => {
                    self.send_offset += n;
                    trace!(
                        channel = %ch.id(),
                        written = n,
                        offset = self.send_offset,
                        frame_len = frame.len(),
                        "write"
                    );
                    if self.send_offset == frame.len() {
                        ch.pop_outbound();
                        self.send_offset = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    debug!(channel = %ch.id(), offset = self.send_offset, "write would block");
                    self.wants_write = true;
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err)
                    if err.kind() == io::ErrorKind::BrokenPipe
                        || err.kind() == io::ErrorKind::ConnectionReset =>
                {
                    debug!(channel = %ch.id(), error = %err, "peer gone during write");
                    self.disconnect(ch, DisconnectReason::Reset);
                    return;
                }
                Err(err) => {
                    warn!(channel = %ch.id(), error = %err, "write failed");
                    self.disconnect(ch, DisconnectReason::IoError);
                    return;
                }
            }
        }
    }

    pub(crate) fn disconnect(&mut self, ch: &ChannelInner, reason: DisconnectReason) {
        let previous = ch.state();
        if previous == ConnectionState::Disconnected {
            return;
        }

        self.conn = None;
        self.send_offset = 0;
        self.wants_write = false;

        let keep_listening =
            ch.mode() == Mode::Server && reason.is_peer_loss() && self.listener.is_some();
        if !keep_listening {
            self.listener = None;
        }

        ch.set_state(ConnectionState::Disconnected);
        ch.discard_buffers(reason.clears_inbound());
        info!(channel = %ch.id(), ?reason, "disconnected");

        if previous == ConnectionState::Connected {
            ch.raise(match ch.mode() {
                Mode::Server => ChannelEvent::DisconnectedFromClient,
                Mode::Client => ChannelEvent::DisconnectedFromServer,
            });
        }

        if keep_listening && ch.state() == ConnectionState::Disconnected {
            debug!(channel = %ch.id(), "waiting for next client");
            ch.set_state(ConnectionState::Connecting);
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("transport", &self.transport.name())
            .field("listening", &self.listener.is_some())
            .field("connected", &self.conn.is_some())
            .field("send_offset", &self.send_offset)
            .field("wants_write", &self.wants_write)
            .finish()
    }
}
