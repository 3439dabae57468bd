//! Unix domain socket front end: each accepted stream becomes an application channel.

use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{next_channel_id, AppChannel, ChannelId};
use crate::error::TapError;
use crate::fdpass;
use crate::tap::Tap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interest {
    readable: bool,
    writable: bool,
}

/// An application channel backed by a Unix stream owned by the service runtime.
pub struct UnixChannel {
    id: ChannelId,
    stream: UnixStream,
    /// Duplicate of the descriptor, used to shut the socket down from any thread.
    control: std::os::unix::net::UnixStream,
    interest: watch::Sender<Interest>,
    closed: AtomicBool,
    handle: Handle,
    tap: Weak<Tap>,
    read_chunk: usize,
}

impl UnixChannel {
    /// Wraps `stream` and starts its I/O task on `handle`.
    fn register(
        stream: std::os::unix::net::UnixStream,
        handle: &Handle,
        tap: Weak<Tap>,
        read_chunk: usize,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let control = stream.try_clone()?;
        let stream = {
            let _guard = handle.enter();
            UnixStream::from_std(stream)?
        };
        let (interest, rx) = watch::channel(Interest {
            readable: true,
            writable: false,
        });
        let channel = Arc::new(Self {
            id: next_channel_id(),
            stream,
            control,
            interest,
            closed: AtomicBool::new(false),
            handle: handle.clone(),
            tap,
            read_chunk,
        });
        handle.spawn(drive(channel.clone(), rx));
        Ok(channel)
    }

    fn update(&self, f: impl FnOnce(&mut Interest)) {
        self.interest.send_if_modified(|interest| {
            let before = *interest;
            f(interest);
            before != *interest
        });
    }
}

impl AppChannel for UnixChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        match self.stream.try_write(data) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn probe(&self) -> io::Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        fdpass::peek_alive(self.control.as_raw_fd())
    }

    fn set_notify_readable(&self, on: bool) {
        self.update(|i| i.readable = on);
    }

    fn set_notify_writable(&self, on: bool) {
        self.update(|i| i.writable = on);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(channel = self.id, %err, "shutdown failed");
        }
        // Wakes the I/O task so it notices the close.
        self.interest.send_modify(|_| {});
    }

    fn spawn_accepted(&self) -> io::Result<Arc<dyn AppChannel>> {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
        fdpass::send_fd(self.control.as_raw_fd(), theirs.as_raw_fd())?;
        drop(theirs);
        let channel = UnixChannel::register(ours, &self.handle, self.tap.clone(), self.read_chunk)?;
        Ok(channel)
    }
}

/// Per-channel I/O task. Feeds reads to the tap while read interest is on and reports
/// writability while write interest is on.
async fn drive(channel: Arc<UnixChannel>, mut interest: watch::Receiver<Interest>) {
    let mut buf = vec![0u8; channel.read_chunk];
    let as_dyn: Arc<dyn AppChannel> = channel.clone();
    loop {
        if channel.closed.load(Ordering::Acquire) {
            break;
        }
        let Interest { readable, writable } = *interest.borrow_and_update();
        tokio::select! {
            changed = interest.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            ready = channel.stream.readable(), if readable => {
                if ready.is_err() {
                    break;
                }
                match channel.stream.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let Some(tap) = channel.tap.upgrade() else {
                            break;
                        };
                        tap.on_channel_data(&as_dyn, &buf[..n]);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        debug!(channel = channel.id, %err, "channel read failed");
                        break;
                    }
                }
            }
            ready = channel.stream.writable(), if writable => {
                if ready.is_err() {
                    break;
                }
                match channel.tap.upgrade() {
                    Some(tap) => tap.on_channel_writable(channel.id),
                    None => break,
                }
            }
        }
    }
    channel.closed.store(true, Ordering::Release);
    if let Some(tap) = channel.tap.upgrade() {
        tap.on_channel_closed(channel.id);
    }
}

/// Listens on a Unix socket path and serves application channels for one tap.
pub struct ChannelService {
    path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ChannelService {
    /// Binds `path`, replacing a stale socket file, and starts serving on a dedicated thread.
    pub fn bind(path: impl AsRef<Path>, tap: &Arc<Tap>) -> Result<Self, TapError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tap = Arc::downgrade(tap);
        let thread = std::thread::Builder::new()
            .name("netcon-channels".into())
            .spawn(move || runtime.block_on(serve(listener, tap, shutdown_rx)))
            .map_err(|err| TapError::Spawn("channel service", err))?;

        info!(path = %path.display(), "channel service listening");
        Ok(Self {
            path,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and tears down the service runtime. Connections already handed to the
    /// tap stay with it until the tap shuts down.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("channel service thread panicked");
            }
            if let Err(err) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), %err, "socket cleanup failed");
            }
        }
    }
}

impl Drop for ChannelService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    listener: std::os::unix::net::UnixListener,
    tap: Weak<Tap>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match UnixListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "failed to register listener");
            return;
        }
    };
    let handle = Handle::current();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let stream = match accepted.and_then(|(stream, _)| stream.into_std()) {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let Some(strong) = tap.upgrade() else {
                    break;
                };
                let read_chunk = strong.config().read_chunk;
                drop(strong);
                match UnixChannel::register(stream, &handle, tap.clone(), read_chunk) {
                    Ok(channel) => debug!(channel = channel.id, "application connected"),
                    Err(err) => warn!(%err, "failed to register channel"),
                }
            }
        }
    }
    debug!("channel service stopped");
}
