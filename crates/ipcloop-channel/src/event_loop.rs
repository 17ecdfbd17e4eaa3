use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::binding::{DisconnectReason, Readiness};
use crate::channel::{ChannelId, ChannelInner};
use crate::config::EventLoopConfig;
use crate::lock;

/// The thread that performs all socket I/O for its channels.
///
/// Cloning yields another handle to the same loop. The thread runs until
/// [`EventLoop::shutdown`] is called; dropping handles does not stop it.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

struct LoopShared {
    config: EventLoopConfig,
    requests: Mutex<Requests>,
    waker: Waker,
    running: AtomicBool,
    next_channel_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Everything producer threads hand to the loop. One lock guards it all.
#[derive(Default)]
struct Requests {
    channels: HashMap<ChannelId, Weak<ChannelInner>>,
    connect: Vec<ChannelId>,
    disconnect: Vec<ChannelId>,
    send: Vec<ChannelId>,
}

type Batch = Vec<Arc<ChannelInner>>;

impl Requests {
    fn upgrade(&self, ids: &[ChannelId]) -> Batch {
        ids.iter()
            .filter_map(|id| self.channels.get(id).and_then(Weak::upgrade))
            .collect()
    }

    /// Take the pending intents and snapshot the live channels.
    fn drain(&mut self) -> (Batch, Batch, Batch, Batch) {
        self.channels.retain(|_, weak| weak.strong_count() > 0);
        let connect_ids = std::mem::take(&mut self.connect);
        let disconnect_ids = std::mem::take(&mut self.disconnect);
        let send_ids = std::mem::take(&mut self.send);
        let connect = self.upgrade(&connect_ids);
        let disconnect = self.upgrade(&disconnect_ids);
        let send = self.upgrade(&send_ids);
        let live = self.channels.values().filter_map(Weak::upgrade).collect();
        (connect, disconnect, send, live)
    }
}

static GLOBAL: Mutex<Option<EventLoop>> = Mutex::new(None);

impl EventLoop {
    /// Spawn a new loop thread.
    pub fn start(config: EventLoopConfig) -> io::Result<Self> {
        let shared = Arc::new(LoopShared {
            waker: Waker::new()?,
            requests: Mutex::new(Requests::default()),
            running: AtomicBool::new(true),
            next_channel_id: AtomicU64::new(1),
            thread: Mutex::new(None),
            config,
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(shared.config.thread_name.clone())
            .spawn(move || worker.run())?;
        *lock(&shared.thread) = Some(handle);

        info!(thread = %shared.config.thread_name, "event loop started");
        Ok(Self { shared })
    }

    /// The process-wide default loop, started on first use.
    ///
    /// If the default loop was shut down, the next call starts a fresh one.
    pub fn global() -> io::Result<Self> {
        let mut slot = lock(&GLOBAL);
        if let Some(existing) = slot.as_ref() {
            if existing.is_running() {
                return Ok(existing.clone());
            }
        }
        let started = Self::start(EventLoopConfig::default())?;
        *slot = Some(started.clone());
        Ok(started)
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// Every channel still registered is disconnected first. Channels keep
    /// their queues but no further I/O happens on them. Safe to call more
    /// than once and from a channel event handler.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.waker.wake();

        let handle = lock(&self.shared.thread).take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("event loop thread panicked");
        }
        info!("event loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of live channels registered with this loop.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared.requests)
            .channels
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.shared.config
    }

    /// Interrupt the loop's OS wait.
    pub fn wake(&self) {
        self.shared.waker.wake();
    }

    pub(crate) fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, channel: &Arc<ChannelInner>) {
        lock(&self.shared.requests)
            .channels
            .insert(channel.id(), Arc::downgrade(channel));
    }

    pub(crate) fn unregister(&self, id: ChannelId) {
        {
            let mut requests = lock(&self.shared.requests);
            requests.channels.remove(&id);
            requests.connect.retain(|pending| *pending != id);
            requests.disconnect.retain(|pending| *pending != id);
            requests.send.retain(|pending| *pending != id);
        }
        debug!(channel = %id, "channel unregistered");
        self.shared.waker.wake();
    }

    pub(crate) fn request_connect(&self, id: ChannelId) {
        lock(&self.shared.requests).connect.push(id);
        self.shared.waker.wake();
    }

    pub(crate) fn request_disconnect(&self, id: ChannelId) {
        lock(&self.shared.requests).disconnect.push(id);
        self.shared.waker.wake();
    }

    pub(crate) fn request_send(&self, id: ChannelId) {
        lock(&self.shared.requests).send.push(id);
        self.shared.waker.wake();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.config.thread_name)
            .field("running", &self.is_running())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl LoopShared {
    fn run(&self) {
        let timeout_ms = self
            .config
            .poll_timeout
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int;

        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut polled: Vec<Arc<ChannelInner>> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            let (connect, disconnect, send, live) = lock(&self.requests).drain();

            for ch in &connect {
                ch.internal_connect();
            }
            for ch in &disconnect {
                ch.internal_disconnect(DisconnectReason::Requested);
            }
            for ch in &send {
                ch.internal_send();
            }
            drop((connect, disconnect, send));

            pollfds.clear();
            polled.clear();
            pollfds.push(libc::pollfd {
                fd: self.waker.reader_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for ch in live {
                if let Some(interest) = ch.interest() {
                    pollfds.push(libc::pollfd {
                        fd: interest.fd,
                        events: interest.poll_events(),
                        revents: 0,
                    });
                    polled.push(ch);
                }
            }

            // SAFETY: `pollfds` is a valid, initialized slice for the duration of
            // the call and its length fits in nfds_t.
            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "poll failed, stopping event loop");
                self.running.store(false, Ordering::SeqCst);
                break;
            }
            if rc == 0 {
                continue;
            }

            if pollfds[0].revents != 0 {
                self.waker.drain();
            }
            for (pfd, ch) in pollfds[1..].iter().zip(&polled) {
                let readiness = Readiness::from_revents(pfd.revents);
                if !readiness.is_empty() {
                    trace!(channel = %ch.id(), ?readiness, "ready");
                    ch.on_ready(readiness);
                }
            }
        }

        let live: Batch = lock(&self.requests)
            .channels
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for ch in live {
            ch.internal_disconnect(DisconnectReason::Shutdown);
        }
        debug!("event loop thread exiting");
    }
}

/// Self-pipe used to interrupt `poll` from other threads.
struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    fn reader_fd(&self) -> libc::c_int {
        self.reader.as_raw_fd()
    }

    /// A full pipe already guarantees a pending wake-up.
    fn wake(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(error = %err, "failed to wake event loop"),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }
}
