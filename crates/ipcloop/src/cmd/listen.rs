use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use ipcloop_channel::{
    Channel, ChannelConfig, ChannelEvent, ConnectionState, EventLoop, EventLoopConfig, Message,
    Mode,
};
use tracing::info;

use crate::cmd::ListenArgs;
use crate::exit::{channel_error, io_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_message, OutputFormat};

const WAIT_SLICE: Duration = Duration::from_millis(200);
const LISTEN_GRACE: Duration = Duration::from_secs(2);

pub fn run(args: ListenArgs, format: OutputFormat, config: ChannelConfig) -> CliResult<i32> {
    let event_loop = EventLoop::start(EventLoopConfig::default())
        .map_err(|err| io_error("event loop start failed", err))?;
    let server = Channel::with_config(&event_loop, &args.path, Mode::Server, config)
        .map_err(|err| channel_error("invalid listen address", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let (tx, rx) = mpsc::channel::<Message>();
    server.on_message(move |msg| {
        let _ = tx.send(msg.clone());
    });
    server.on_event(|event| match event {
        ChannelEvent::ConnectedToClient => info!("client connected"),
        ChannelEvent::DisconnectedFromClient => info!("client disconnected"),
        _ => {}
    });

    server.connect();
    wait_for_listening(&server)?;

    let mut printed = 0usize;
    let result = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(SUCCESS);
        }

        server.wait_for_messages(Some(WAIT_SLICE));
        server.process_messages();

        let mut reached_count = false;
        for msg in rx.try_iter() {
            printed = printed.saturating_add(1);
            print_message(&msg, printed, format);
            if args.count.is_some_and(|count| printed >= count) {
                reached_count = true;
                break;
            }
        }
        if reached_count {
            break Ok(SUCCESS);
        }

        match server.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => thread::sleep(WAIT_SLICE / 4),
            ConnectionState::Disconnected => {
                break Err(CliError::new(
                    TRANSPORT_ERROR,
                    format!("stopped listening on {}", args.path.display()),
                ));
            }
        }
    };

    drop(server);
    event_loop.shutdown();
    result
}

/// Listen failures never raise an event, so watch for the channel to leave
/// `Disconnected` instead.
fn wait_for_listening(server: &Channel) -> CliResult<()> {
    let start = Instant::now();
    while start.elapsed() < LISTEN_GRACE {
        if server.state() != ConnectionState::Disconnected {
            info!(path = %server.address().display(), "listening");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    Err(CliError::new(
        TRANSPORT_ERROR,
        format!("failed to listen on {}", server.address().display()),
    ))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
