use std::fmt;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::path::Path;

use crate::error::Result;

/// Outcome of starting a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The connection is established and usable right away.
    Connected,
    /// The connect is in flight; wait for writability, then call
    /// [`Connection::take_error`] to learn the result.
    InProgress,
}

/// A platform transport: the syscall layer behind a channel.
///
/// Implementations create non-blocking endpoints only. Every handle they
/// return exposes a raw descriptor so a single reactor thread can multiplex
/// readiness across all of them.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;

    /// Check that `address` is usable before any socket is created.
    fn validate_address(&self, address: &Path) -> Result<()>;

    /// Create, bind and listen on `address`.
    fn listen(&self, address: &Path) -> Result<Box<dyn Listener>>;

    /// Start a non-blocking connect to `address`.
    fn connect(&self, address: &Path) -> Result<(Box<dyn Connection>, ConnectStatus)>;
}

/// A bound, listening, non-blocking endpoint.
pub trait Listener: Send + fmt::Debug {
    /// Accept one pending connection. Returns `WouldBlock` when none is queued.
    fn accept(&self) -> std::io::Result<Box<dyn Connection>>;

    /// Descriptor to wait on for accept-readiness.
    fn raw_fd(&self) -> RawFd;
}

/// A connected (or connecting) non-blocking byte stream.
pub trait Connection: Read + Write + Send + fmt::Debug {
    /// Fetch and clear the pending socket error (`SO_ERROR`).
    ///
    /// After a connect reported [`ConnectStatus::InProgress`] and the
    /// descriptor became writable, `Ok(None)` means the connect succeeded.
    fn take_error(&self) -> std::io::Result<Option<std::io::Error>>;

    /// Descriptor to wait on for readability/writability.
    fn raw_fd(&self) -> RawFd;
}
