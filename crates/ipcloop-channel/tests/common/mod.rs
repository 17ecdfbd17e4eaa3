#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ipcloop_channel::{Channel, ChannelEvent, EventLoop, EventLoopConfig, Message};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn unique_sock_path(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/ipcloop-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join("channel.sock")
}

pub fn cleanup(path: &std::path::Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}

pub fn start_loop() -> EventLoop {
    EventLoop::start(EventLoopConfig {
        poll_timeout: Duration::from_millis(20),
        ..EventLoopConfig::default()
    })
    .expect("event loop should start")
}

/// Poll `cond` until it holds or `TIMEOUT` elapses.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn text(s: &str) -> Message {
    Message::new("text", s.as_bytes().to_vec()).expect("type name is short")
}

pub fn body_text(msg: &Message) -> String {
    String::from_utf8(msg.body().to_vec()).expect("body should be UTF-8")
}

pub type Recorded<T> = Arc<Mutex<Vec<T>>>;

pub fn record_events(channel: &Channel) -> Recorded<ChannelEvent> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    channel.on_event(move |event| sink.lock().unwrap().push(*event));
    events
}

pub fn record_messages(channel: &Channel) -> Recorded<String> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    channel.on_message(move |msg| sink.lock().unwrap().push(body_text(msg)));
    messages
}

pub fn count_of<T: PartialEq>(recorded: &Recorded<T>, value: &T) -> usize {
    recorded.lock().unwrap().iter().filter(|v| *v == value).count()
}
