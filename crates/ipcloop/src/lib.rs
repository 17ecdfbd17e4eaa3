//! Framed local IPC channels driven by a single event loop thread.
//!
//! ipcloop moves type-tagged messages between processes over Unix domain
//! sockets. Any number of threads may send and receive; one loop thread owns
//! every socket and does all of the non-blocking I/O.
//!
//! # Crate Structure
//!
//! - [`transport`]: non-blocking socket primitives behind the `Transport` trait
//! - [`frame`]: the `IPCL` wire format and incremental frame reassembly
//! - [`channel`]: channels, the event loop, and event subscriptions (behind
//!   the default `channel` feature)

/// Re-export transport types.
pub mod transport {
    pub use ipcloop_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipcloop_frame::*;
}

/// Re-export channel types (requires `channel` feature).
#[cfg(feature = "channel")]
pub mod channel {
    pub use ipcloop_channel::*;
}
