//! Framed IPC channels driven by a single event loop thread.
//!
//! A [`Channel`] is one end of a local, bidirectional, message-oriented
//! connection. Producer threads call [`Channel::send`] and return at once;
//! the [`EventLoop`] thread owns every socket, writes queued frames as the
//! socket accepts them, and reassembles incoming frames into [`Message`]s.
//! Consumers drain those with [`Channel::process_messages`] or block in
//! [`Channel::wait_for_messages`].
//!
//! ```no_run
//! use ipcloop_channel::{Channel, ChannelEvent, EventLoop, Mode};
//!
//! let event_loop = EventLoop::global()?;
//! let client = Channel::new(&event_loop, "/tmp/app.sock", Mode::Client)?;
//! client.on_event(|event| {
//!     if *event == ChannelEvent::ConnectedToServer {
//!         println!("connected");
//!     }
//! });
//! client.connect();
//! client.send_value(&"hello".to_string());
//! # Ok::<(), ipcloop_channel::ChannelError>(())
//! ```

mod binding;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{Channel, ChannelEvent, ChannelId, ConnectionState, Mode, WaitOutcome};
pub use config::{ChannelConfig, EventLoopConfig};
pub use error::{ChannelError, Result};
pub use event::{Event, Subscription, SubscriptionId};
pub use event_loop::EventLoop;

pub use ipcloop_frame::{Message, MessageType};
pub use ipcloop_transport::{ConnectStatus, Connection, Listener, Transport};

#[cfg(unix)]
pub use ipcloop_transport::UdsTransport;

/// Lock a mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
