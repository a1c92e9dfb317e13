//! Render backends.
//!
//! One contract, two strategies: direct compositing through the
//! RENDER extension (`xrender`) and GPU compositing through GLX
//! texture-from-pixmap (`glx`). The strategy is chosen once at
//! startup; an explicitly forced backend that fails to initialize is
//! fatal, while the auto default degrades to XRender.

pub mod glx;
pub mod xrender;

use anyhow::Result;
use tracing::{info, warn};
use x11rb::rust_connection::RustConnection;

use crate::config::{BackendKind, Config};
use crate::errors::CoreError;
use crate::geometry::Region;
use crate::ignore::IgnoreQueue;
use crate::registry::{WindowRecord, WindowRegistry};
use crate::shadow::ShadowTables;

/// Backend-minted key for a window's render resource (picture or
/// texture). Opaque outside this module: records carry it, only the
/// backend that created it can look anything up with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub(crate) u64);

/// The render-backend contract.
///
/// `paint` must produce exactly one composited frame covering `region`
/// and present it. A single window's bind or draw failure must degrade
/// to skipping that window, never to aborting the frame.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    /// Recreate the paint target after a root-size change.
    fn resize(&mut self, conn: &RustConnection, width: u16, height: u16) -> Result<()>;

    /// Create or refresh the window's render resource from its named
    /// pixmap. Called on map and geometry change, never per frame.
    /// Requests that can race the window's destruction are registered
    /// in `ignore`.
    fn bind_window(
        &mut self,
        conn: &RustConnection,
        win: &mut WindowRecord,
        ignore: &mut IgnoreQueue,
    ) -> Result<()>;

    /// Drop the window's render resource. Must tolerate the server
    /// side already being gone.
    fn release_window(
        &mut self,
        conn: &RustConnection,
        win: &mut WindowRecord,
        ignore: &mut IgnoreQueue,
    );

    /// Age in frames of the buffer the next paint will reuse.
    /// 0 means unknown (full redraw required).
    fn buffer_age(&mut self) -> usize;

    /// Use the desktop background pixmap as the bottom paint layer.
    /// Backends without root-tile support keep their clear color.
    fn set_root_pixmap(&mut self, _conn: &RustConnection, _pixmap: Option<u32>) -> Result<()> {
        Ok(())
    }

    /// Composite every visible window in `order` (bottom to top)
    /// into `region` and present.
    fn paint(
        &mut self,
        conn: &RustConnection,
        registry: &mut WindowRegistry,
        order: &[u32],
        region: &Region,
        shadow: &ShadowTables,
        config: &Config,
        ignore: &mut IgnoreQueue,
    ) -> Result<()>;
}

/// Pick and initialize the render backend per configuration.
pub fn init(
    conn: &RustConnection,
    screen_num: usize,
    target: u32,
    width: u16,
    height: u16,
    config: &Config,
) -> Result<Box<dyn RenderBackend>> {
    match config.backend.kind {
        BackendKind::Xrender => {
            let backend = xrender::XrenderBackend::new(conn, screen_num, target, width, height, config)
                .map_err(|e| CoreError::BackendInit("xrender", e.to_string()))?;
            info!("Using XRender backend");
            Ok(Box::new(backend))
        }
        BackendKind::Glx => {
            let backend = glx::GlxBackend::new(conn, screen_num, target, width, height, config)
                .map_err(|e| CoreError::BackendInit("glx", e.to_string()))?;
            info!("Using GLX backend");
            Ok(Box::new(backend))
        }
        BackendKind::Auto => {
            match glx::GlxBackend::new(conn, screen_num, target, width, height, config) {
                Ok(backend) => {
                    info!("Using GLX backend");
                    Ok(Box::new(backend))
                }
                Err(e) => {
                    warn!("GLX backend unavailable ({}), falling back to XRender", e);
                    let backend =
                        xrender::XrenderBackend::new(conn, screen_num, target, width, height, config)
                            .map_err(|e| CoreError::BackendInit("xrender", e.to_string()))?;
                    info!("Using XRender backend (fallback)");
                    Ok(Box::new(backend))
                }
            }
        }
    }
}
