//! penumbra: a damage-driven X11 compositor.
//!
//! Single-threaded core: X events are drained in bursts inside a
//! tokio select loop, state mutates in place, and at most one frame is
//! painted per cycle, paced by the vsync policy.

mod atoms;
mod backend;
mod config;
mod damage;
mod errors;
mod events;
mod fade;
mod geometry;
mod ignore;
mod registry;
mod session;
mod shadow;
mod timers;
mod vsync;
mod x11_async;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::session::Session;
use crate::x11_async::XEventStream;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::load().context("loading configuration")?;
    let (conn, screen_num) =
        x11rb::rust_connection::RustConnection::connect(None).context("connecting to X")?;
    let conn = Arc::new(conn);

    let mut session = match Session::new(conn.clone(), screen_num, config) {
        Ok(session) => session,
        Err(e) => {
            // Composite ownership and forced-backend failures are not
            // recoverable; a supervisor restarts us if appropriate.
            error!("startup failed: {:#}", e);
            std::process::exit(1);
        }
    };
    let stream = XEventStream::new(conn)?;
    info!("compositor running");

    loop {
        // Drain the whole burst, paint at most once afterwards.
        for event in stream.drain()? {
            session.dispatch_event(event);
        }
        session.run_timers(Instant::now())?;
        // Everything queued this cycle goes out before we block.
        stream.flush()?;

        match session.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = stream.wait_readable() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            None => stream.wait_readable().await,
        }
    }
}
