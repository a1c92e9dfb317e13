//! Typed errors for unrecoverable conditions.
//!
//! Only startup failures get their own type; everything recoverable
//! travels as `anyhow::Error` context or is handled in place (skip the
//! window, retry the region next frame).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Another compositor already owns the screen's composite
    /// selection. There is exactly one compositing manager per screen.
    #[error("screen {0} already has a compositing manager")]
    ScreenOwned(usize),

    /// A protocol extension the core cannot run without.
    #[error("required X extension missing: {0}")]
    MissingExtension(&'static str),

    /// An explicitly requested backend failed to come up. Only fatal
    /// when the backend was forced; the auto default falls back.
    #[error("backend {0} failed to initialize: {1}")]
    BackendInit(&'static str, String),
}
