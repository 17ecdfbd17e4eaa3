//! Minimal echo server: serves one client at a time and sends every message
//! straight back.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send /tmp/ipcloop-echo-<pid>/echo.sock \
//!     --json '{"hello":"world"}'

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use ipcloop::channel::{Channel, ChannelEvent, EventLoop, Mode};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("ipcloop-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let event_loop = EventLoop::global()?;
    let server = Arc::new(Channel::new(&event_loop, &sock_path, Mode::Server)?);

    server.on_event(|event| match event {
        ChannelEvent::ConnectedToClient => eprintln!("client connected"),
        ChannelEvent::DisconnectedFromClient => eprintln!("client disconnected"),
        _ => {}
    });

    let echo = Arc::downgrade(&server);
    server.on_message(move |msg| {
        eprintln!("received {} ({} bytes)", msg.type_name(), msg.body().len());
        if let Some(server) = echo.upgrade() {
            server.send(msg);
        }
    });

    server.connect();
    eprintln!("Listening on {}", sock_path.display());

    loop {
        server.wait_for_messages(Some(Duration::from_millis(500)));
        if !server.is_connected() {
            server.process_messages();
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}
