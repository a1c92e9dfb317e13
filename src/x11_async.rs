//! Async X11 event delivery.
//!
//! x11rb's `RustConnection` has no async interface, so a small
//! blocking thread watches the connection's file descriptor with mio
//! and pokes a `tokio::sync::Notify` whenever it turns readable. The
//! main loop awaits the notify, then drains the buffered events in one
//! burst. The poller owns no compositor state and exits on its own
//! once the stream is dropped.

use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

const X_SOCKET: mio::Token = mio::Token(0);

pub struct XEventStream {
    conn: Arc<RustConnection>,
    /// Sole strong reference; the poller holds a `Weak` and stops when
    /// it can no longer upgrade.
    notify: Arc<Notify>,
}

impl XEventStream {
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let notify = Arc::new(Notify::new());

        let mut poll = mio::Poll::new().context("failed to create mio poll")?;
        poll.registry()
            .register(
                &mut mio::unix::SourceFd(&fd),
                X_SOCKET,
                mio::Interest::READABLE,
            )
            .context("failed to register the X connection with mio")?;

        spawn_poller(poll, Arc::downgrade(&notify));
        Ok(Self { conn, notify })
    }

    /// Everything buffered right now, without blocking. One call per
    /// wakeup keeps event handling and painting interleaved at burst
    /// granularity.
    pub fn drain(&self) -> Result<Vec<Event>> {
        let mut burst = Vec::new();
        while let Some(event) = self.conn.poll_for_event()? {
            burst.push(event);
        }
        Ok(burst)
    }

    /// Resolves once the X socket has data to read.
    pub async fn wait_readable(&self) {
        self.notify.notified().await;
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }
}

fn spawn_poller(mut poll: mio::Poll, notify: Weak<Notify>) {
    // The poll timeout bounds how long the thread lingers after the
    // stream is dropped.
    let timeout = Duration::from_millis(100);
    let mut events = mio::Events::with_capacity(1);
    tokio::task::spawn_blocking(move || loop {
        let Some(notify) = notify.upgrade() else {
            tracing::debug!("X readability poller shutting down");
            return;
        };
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            tracing::warn!("X socket poll failed: {:?}", err);
            continue;
        }
        if events.iter().any(|event| event.token() == X_SOCKET) {
            notify.notify_one();
        }
    });
}
