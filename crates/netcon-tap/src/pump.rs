//! The I/O pump: one thread per tap feeding frames into the stack, running its timers and moving
//! bytes between connection buffers and application channels.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use netcon_stack::{Millis, SocketKind};
use tracing::{debug, trace};

use crate::channel::ChannelId;
use crate::tap::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    debug!(device = %shared.cfg.device_name, "pump started");
    while shared.running.load(Ordering::Acquire) {
        let timeout = shared.cycle(false);
        shared.wait(timeout);
    }
    debug!(device = %shared.cfg.device_name, "pump stopped");
}

fn millis(d: Duration) -> Millis {
    d.as_millis() as Millis
}

impl Shared {
    /// One pump iteration. `force` runs the periodic steps regardless of their interval. Returns
    /// how long the pump may sleep before the next iteration.
    pub(crate) fn cycle(&self, force: bool) -> Duration {
        let now = self.now();
        let mut guard = self.lock_core();
        let core = &mut *guard;

        let frames = self.frames.drain();
        if !frames.is_empty() {
            trace!(count = frames.len(), "injecting frames");
            self.with_sink(core, |stack, sink| {
                for frame in &frames {
                    stack.inject(frame, now, sink);
                }
            });
        }
        self.with_sink(core, |stack, sink| stack.poll(now, sink));

        let discovery = millis(self.cfg.discovery_interval);
        if force || now.saturating_sub(core.last_discovery) >= discovery {
            core.stack.discovery_tick(now);
            core.last_discovery = now;
        }

        if force || now.saturating_sub(core.last_status) >= millis(self.cfg.status_interval) {
            core.last_status = now;
            let dead: Vec<ChannelId> = core
                .table
                .connections()
                .iter()
                .filter(|c| c.kind == SocketKind::Stream)
                .filter(|c| match c.channel.probe() {
                    Ok(alive) => !alive,
                    Err(err) => {
                        debug!(channel = c.id, %err, "channel probe failed");
                        true
                    }
                })
                .map(|c| c.id)
                .collect();
            for id in dead {
                debug!(channel = id, "application end gone");
                self.destroy(core, id);
            }
        }

        for conn in core.table.connections() {
            if !conn.lock().tx.is_empty() {
                self.handle_write(core, &conn, now);
            }
        }
        for conn in core.table.connections() {
            self.deliver(core, &conn, now);
        }

        let mut timeout = self
            .cfg
            .tcp_timer_interval
            .min(Duration::from_millis(
                discovery.saturating_sub(now.saturating_sub(core.last_discovery)),
            ));
        if let Some(delay) = core.stack.poll_delay(now) {
            timeout = timeout.min(delay);
        }
        timeout.max(Duration::from_millis(1))
    }
}
