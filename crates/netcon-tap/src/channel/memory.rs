use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{next_channel_id, AppChannel, ChannelId};

#[derive(Debug)]
struct State {
    written: Vec<u8>,
    /// Bytes the channel will still accept; `None` is unlimited.
    write_limit: Option<usize>,
    notify_readable: bool,
    notify_writable: bool,
    closed: bool,
    hung_up: bool,
    fail_accept: bool,
    accepted: VecDeque<Arc<MemoryChannel>>,
}

/// A channel whose application side is the test itself.
#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    state: Mutex<State>,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            state: Mutex::new(State {
                written: Vec::new(),
                write_limit: None,
                notify_readable: true,
                notify_writable: false,
                closed: false,
                hung_up: false,
                fail_accept: false,
                accepted: VecDeque::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everything the tap has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().written)
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.lock().write_limit = limit;
    }

    pub fn notify_readable(&self) -> bool {
        self.lock().notify_readable
    }

    pub fn notify_writable(&self) -> bool {
        self.lock().notify_writable
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Simulates the application closing its end.
    pub fn hang_up(&self) {
        self.lock().hung_up = true;
    }

    pub fn fail_next_accept(&self) {
        self.lock().fail_accept = true;
    }

    /// Next channel created by [`AppChannel::spawn_accepted`], in creation order.
    pub fn next_accepted(&self) -> Option<Arc<MemoryChannel>> {
        self.lock().accepted.pop_front()
    }
}

impl AppChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed || state.hung_up {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match state.write_limit {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        if let Some(limit) = state.write_limit.as_mut() {
            *limit -= n;
        }
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn probe(&self) -> io::Result<bool> {
        let state = self.lock();
        Ok(!state.hung_up && !state.closed)
    }

    fn set_notify_readable(&self, on: bool) {
        self.lock().notify_readable = on;
    }

    fn set_notify_writable(&self, on: bool) {
        self.lock().notify_writable = on;
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn spawn_accepted(&self) -> io::Result<Arc<dyn AppChannel>> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_accept) {
            return Err(io::Error::new(io::ErrorKind::Other, "accept hand-off refused"));
        }
        let channel = MemoryChannel::new();
        state.accepted.push_back(channel.clone());
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_limit_caps_and_counts_down() {
        let ch = MemoryChannel::new();
        ch.set_write_limit(Some(5));
        assert_eq!(ch.write(b"abc").unwrap(), 3);
        assert_eq!(ch.write(b"defg").unwrap(), 2);
        assert_eq!(ch.write(b"h").unwrap(), 0);
        assert_eq!(ch.written(), b"abcde");
    }

    #[test]
    fn hang_up_fails_probe_and_writes() {
        let ch = MemoryChannel::new();
        assert!(ch.probe().unwrap());
        ch.hang_up();
        assert!(!ch.probe().unwrap());
        assert!(ch.write(b"x").is_err());
    }

    #[test]
    fn accepted_channels_are_recorded() {
        let ch = MemoryChannel::new();
        let a = ch.spawn_accepted().unwrap();
        assert_eq!(ch.next_accepted().map(|c| c.id()), Some(a.id()));
        ch.fail_next_accept();
        assert!(ch.spawn_accepted().is_err());
        assert!(ch.spawn_accepted().is_ok());
    }
}
