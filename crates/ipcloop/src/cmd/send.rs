use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ipcloop_channel::{
    Channel, ChannelConfig, ChannelEvent, ConnectionState, EventLoop, EventLoopConfig, Message,
    Mode,
};
use ipcloop_frame::encode_to_bytes;
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{
    channel_error, frame_error, io_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE,
};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub fn run(args: SendArgs, config: ChannelConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let message = resolve_message(&args)?;
    encode_to_bytes(&message, config.max_frame_size)
        .map_err(|err| frame_error("message rejected", err))?;

    let event_loop = EventLoop::start(EventLoopConfig::default())
        .map_err(|err| io_error("event loop start failed", err))?;
    let client = Channel::with_config(&event_loop, &args.path, Mode::Client, config)
        .map_err(|err| channel_error("invalid address", err))?;

    let result = deliver(&client, &message, timeout);

    client.disconnect();
    let start = Instant::now();
    while client.state() != ConnectionState::Disconnected && start.elapsed() < timeout {
        thread::sleep(POLL_INTERVAL);
    }
    drop(client);
    event_loop.shutdown();

    result.map(|()| SUCCESS)
}

/// Queue `message`, connect (retrying until `timeout`), and wait until the
/// loop has written every byte of it.
///
/// A connection lost before the frame is fully written fails, even though the
/// disconnect leaves the outbound queue empty.
fn deliver(client: &Channel, message: &Message, timeout: Duration) -> CliResult<()> {
    let connected = Arc::new(AtomicBool::new(false));
    let lost = Arc::new(AtomicBool::new(false));
    {
        let connected = connected.clone();
        let lost = lost.clone();
        client.on_event(move |event| match event {
            ChannelEvent::ConnectedToServer => connected.store(true, Ordering::SeqCst),
            ChannelEvent::DisconnectedFromServer => lost.store(true, Ordering::SeqCst),
            _ => {}
        });
    }

    let written_before = client.frames_written();
    client.send(message);

    let start = Instant::now();
    loop {
        if client.frames_written() > written_before {
            debug!(type_name = message.type_name(), "message flushed");
            return Ok(());
        }
        if lost.load(Ordering::SeqCst) {
            return Err(CliError::new(
                FAILURE,
                format!(
                    "connection to {} closed before the message was sent",
                    client.address().display()
                ),
            ));
        }
        if start.elapsed() >= timeout {
            let what = if connected.load(Ordering::SeqCst) {
                "sending to"
            } else {
                "connecting to"
            };
            return Err(CliError::new(
                TIMEOUT,
                format!(
                    "timed out {what} {} after {timeout:?}",
                    client.address().display()
                ),
            ));
        }
        if client.state() == ConnectionState::Disconnected {
            client.connect();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn resolve_message(args: &SendArgs) -> CliResult<Message> {
    let invalid = |err| frame_error("invalid message", err);

    if let Some(json) = &args.json {
        let value = serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return match &args.type_name {
            Some(name) => Message::new(name.as_str(), json.clone().into_bytes()),
            None => Message::encode(&value),
        }
        .map_err(invalid);
    }
    if let Some(data) = &args.data {
        return match &args.type_name {
            Some(name) => Message::new(name.as_str(), data.clone().into_bytes()),
            None => Message::encode(data),
        }
        .map_err(invalid);
    }
    if let Some(path) = &args.file {
        let body = fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        })?;
        let name = args.type_name.as_deref().unwrap_or("bytes");
        return Message::new(name, body).map_err(invalid);
    }

    Message::new(args.type_name.as_deref().unwrap_or("empty"), Vec::new()).map_err(invalid)
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
