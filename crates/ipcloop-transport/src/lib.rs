//! Non-blocking local socket transport primitives.
//!
//! This is the syscall layer of ipcloop. It knows nothing about frames or
//! channels: it creates listeners and connections that never block, and
//! exposes raw descriptors so a single reactor thread can wait on all of
//! them at once.
//!
//! Platform variants implement the [`Transport`] trait; the channel layer
//! picks one at construction time and shares everything else.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use traits::{ConnectStatus, Connection, Listener, Transport};

#[cfg(unix)]
pub use uds::{UdsConnection, UdsTransport, UnixDomainSocket};
