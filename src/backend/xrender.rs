//! Direct compositing through the RENDER extension.
//!
//! Windows are composited from their named backing pixmaps into an
//! off-screen buffer picture, clipped to the damage region, then the
//! buffer is copied onto the target in one operation. Shadows and dim
//! are solid 1x1 repeating pictures masked by precomputed alpha maps;
//! background blur uses the server-side convolution filter when the
//! server advertises one and is silently disabled otherwise.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, info, trace};
use x11rb::connection::Connection;
use x11rb::protocol::render::{
    self, Color, ConnectionExt as RenderExt, CreatePictureAux, PictOp, PictType, Pictformat,
    Pictforminfo, Picture,
};
use x11rb::protocol::xproto::{ConnectionExt as XprotoExt, ImageFormat, Rectangle};
use x11rb::rust_connection::RustConnection;

use super::{RenderBackend, SurfaceHandle};
use crate::config::{Config, OPAQUE};
use crate::geometry::{Rect, Region};
use crate::ignore::IgnoreQueue;
use crate::registry::{PaintMode, WindowRecord, WindowRegistry};
use crate::shadow::ShadowTables;

const FILTER_CONVOLUTION: &[u8] = b"convolution";

/// 16.16 fixed point, the RENDER wire format for filter parameters.
fn fixed(v: f64) -> render::Fixed {
    (v * 65536.0).round() as render::Fixed
}

fn color_from_rgba(r: f64, g: f64, b: f64, a: f64) -> Color {
    Color {
        red: (r * a * 65535.0) as u16,
        green: (g * a * 65535.0) as u16,
        blue: (b * a * 65535.0) as u16,
        alpha: (a * 65535.0) as u16,
    }
}

fn to_xrects(region: &Region) -> Vec<Rectangle> {
    region
        .rects()
        .iter()
        .map(|r| Rectangle {
            x: r.x1 as i16,
            y: r.y1 as i16,
            width: r.width() as u16,
            height: r.height() as u16,
        })
        .collect()
}

/// Per-window RENDER resources.
struct WinSurface {
    picture: Picture,
    /// Shadow alpha picture plus the window size it was built for.
    shadow: Option<(Picture, u32, u32)>,
}

pub struct XrenderBackend {
    width: u16,
    height: u16,
    depth: u8,
    /// Picture on the overlay window; what the user sees.
    target: Picture,
    /// Off-screen paint buffer. Persists across frames, so partial
    /// redraw against it is always valid (age 1).
    buffer: Picture,
    buffer_pixmap: u32,
    root: u32,
    format_screen: Pictformat,
    format_argb32: Pictformat,
    format_a8: Pictformat,
    /// 1x1 repeating solid in the configured shadow color.
    solid_shadow: Picture,
    solid_white: Picture,
    /// Solid alpha pictures keyed by opacity level, built on demand.
    alpha_picts: HashMap<u16, Picture>,
    surfaces: HashMap<SurfaceHandle, WinSurface>,
    next_handle: u64,
    /// Convolution kernel for background blur, wire-ready, or None
    /// when the server lacks the filter or blur is disabled.
    blur_kernel: Option<Vec<render::Fixed>>,
    root_tile: Option<Picture>,
}

impl XrenderBackend {
    pub fn new(
        conn: &RustConnection,
        screen_num: usize,
        target_window: u32,
        width: u16,
        height: u16,
        config: &Config,
    ) -> Result<Self> {
        conn.render_query_version(0, 11)?
            .reply()
            .context("RENDER extension not available")?;

        let screen = &conn.setup().roots[screen_num];
        let depth = screen.root_depth;
        let formats = conn.render_query_pict_formats()?.reply()?;
        let format_screen = find_visual_format(&formats, screen.root_visual)
            .context("no picture format for the root visual")?;
        let format_argb32 = find_standard_format(&formats, 32, PictType::DIRECT)
            .context("no ARGB32 picture format")?;
        let format_a8 = find_standard_format(&formats, 8, PictType::DIRECT)
            .context("no A8 picture format")?;

        let target = conn.generate_id()?;
        conn.render_create_picture(target, target_window, format_screen, &CreatePictureAux::new())?;

        let (buffer, buffer_pixmap) =
            create_buffer(conn, screen.root, depth, format_screen, width, height)?;

        let [r, g, b] = config.shadow.color;
        let solid_shadow = conn.generate_id()?;
        conn.render_create_solid_fill(solid_shadow, color_from_rgba(r, g, b, 1.0))?;
        let solid_white = conn.generate_id()?;
        conn.render_create_solid_fill(solid_white, color_from_rgba(1.0, 1.0, 1.0, 1.0))?;

        let blur_kernel = if config.blur.enabled {
            if server_has_convolution(conn, screen.root)? {
                Some(box_kernel(config.blur.strength))
            } else {
                info!("RENDER convolution filter not available, blur disabled");
                None
            }
        } else {
            None
        };

        conn.flush()?;
        debug!("XRender backend ready, {}x{} depth {}", width, height, depth);

        Ok(Self {
            width,
            height,
            depth,
            target,
            buffer,
            buffer_pixmap,
            root: screen.root,
            format_screen,
            format_argb32,
            format_a8,
            solid_shadow,
            solid_white,
            alpha_picts: HashMap::new(),
            surfaces: HashMap::new(),
            next_handle: 1,
            blur_kernel,
            root_tile: None,
        })
    }

    fn alpha_picture(&mut self, conn: &RustConnection, opacity: u16) -> Result<Picture> {
        if let Some(&p) = self.alpha_picts.get(&opacity) {
            return Ok(p);
        }
        let picture = conn.generate_id()?;
        let alpha = opacity as f64 / OPAQUE as f64;
        conn.render_create_solid_fill(picture, color_from_rgba(0.0, 0.0, 0.0, alpha))?;
        self.alpha_picts.insert(opacity, picture);
        Ok(picture)
    }

    /// Upload a window's shadow alpha map into an A8 picture, cached
    /// per window until its size changes.
    fn shadow_picture(
        &mut self,
        conn: &RustConnection,
        handle: SurfaceHandle,
        win_w: u32,
        win_h: u32,
        shadow: &ShadowTables,
    ) -> Result<Picture> {
        if let Some(surface) = self.surfaces.get(&handle) {
            if let Some((pict, w, h)) = surface.shadow {
                if w == win_w && h == win_h {
                    return Ok(pict);
                }
                conn.render_free_picture(pict)?;
            }
        }
        let (sw, sh) = shadow.image_size(win_w, win_h);
        let data = shadow.image(win_w, win_h);
        let pixmap = conn.generate_id()?;
        conn.create_pixmap(8, pixmap, self.root, sw as u16, sh as u16)?;
        let gc = conn.generate_id()?;
        conn.create_gc(gc, pixmap, &Default::default())?;
        // A8 rows are padded to 4 bytes on the wire.
        let stride = (sw as usize + 3) & !3;
        let mut padded = vec![0u8; stride * sh as usize];
        for y in 0..sh as usize {
            let src = &data[y * sw as usize..(y + 1) * sw as usize];
            padded[y * stride..y * stride + sw as usize].copy_from_slice(src);
        }
        conn.put_image(
            ImageFormat::Z_PIXMAP,
            pixmap,
            gc,
            sw as u16,
            sh as u16,
            0,
            0,
            0,
            8,
            &padded,
        )?;
        conn.free_gc(gc)?;
        let picture = conn.generate_id()?;
        conn.render_create_picture(picture, pixmap, self.format_a8, &CreatePictureAux::new())?;
        conn.free_pixmap(pixmap)?;
        if let Some(surface) = self.surfaces.get_mut(&handle) {
            surface.shadow = Some((picture, win_w, win_h));
        }
        Ok(picture)
    }

    /// Run the convolution filter over the buffer area beneath a
    /// translucent window. Round-trips through a scratch picture
    /// because a picture cannot filter onto itself.
    fn blur_under(
        &self,
        conn: &RustConnection,
        kernel: &[render::Fixed],
        bounds: &Rect,
    ) -> Result<()> {
        let (w, h) = (bounds.width() as u16, bounds.height() as u16);
        let scratch_pixmap = conn.generate_id()?;
        conn.create_pixmap(self.depth, scratch_pixmap, self.root, w, h)?;
        let scratch = conn.generate_id()?;
        conn.render_create_picture(scratch, scratch_pixmap, self.format_screen, &CreatePictureAux::new())?;
        conn.free_pixmap(scratch_pixmap)?;

        conn.render_set_picture_filter(self.buffer, FILTER_CONVOLUTION, kernel)?;
        conn.render_composite(
            PictOp::SRC,
            self.buffer,
            x11rb::NONE,
            scratch,
            bounds.x1 as i16,
            bounds.y1 as i16,
            0,
            0,
            0,
            0,
            w,
            h,
        )?;
        // Back to the default nearest filter before anyone else
        // samples the buffer.
        conn.render_set_picture_filter(self.buffer, b"Nearest", &[])?;
        conn.render_composite(
            PictOp::SRC,
            scratch,
            x11rb::NONE,
            self.buffer,
            0,
            0,
            0,
            0,
            bounds.x1 as i16,
            bounds.y1 as i16,
            w,
            h,
        )?;
        conn.render_free_picture(scratch)?;
        Ok(())
    }
}

impl RenderBackend for XrenderBackend {
    fn name(&self) -> &'static str {
        "xrender"
    }

    fn resize(&mut self, conn: &RustConnection, width: u16, height: u16) -> Result<()> {
        conn.render_free_picture(self.buffer)?;
        conn.free_pixmap(self.buffer_pixmap)?;
        let (buffer, pixmap) = create_buffer(
            conn,
            self.root,
            self.depth,
            self.format_screen,
            width,
            height,
        )?;
        self.buffer = buffer;
        self.buffer_pixmap = pixmap;
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn bind_window(
        &mut self,
        conn: &RustConnection,
        win: &mut WindowRecord,
        ignore: &mut IgnoreQueue,
    ) -> Result<()> {
        self.release_window(conn, win, ignore);
        let Some(pixmap) = win.pixmap else {
            anyhow::bail!("window {} has no named pixmap", win.id);
        };
        let format = if win.depth == 32 {
            self.format_argb32
        } else {
            self.format_screen
        };
        let picture = conn.generate_id()?;
        // The window may be gone by the time the server sees this.
        let cookie = conn.render_create_picture(picture, pixmap, format, &CreatePictureAux::new())?;
        ignore.expect(cookie.sequence_number());
        let handle = SurfaceHandle(self.next_handle);
        self.next_handle += 1;
        self.surfaces.insert(
            handle,
            WinSurface {
                picture,
                shadow: None,
            },
        );
        win.surface = Some(handle);
        trace!("bound window {} to picture {}", win.id, picture);
        Ok(())
    }

    fn release_window(
        &mut self,
        conn: &RustConnection,
        win: &mut WindowRecord,
        ignore: &mut IgnoreQueue,
    ) {
        let Some(handle) = win.surface.take() else {
            return;
        };
        let Some(surface) = self.surfaces.remove(&handle) else {
            return;
        };
        if let Ok(cookie) = conn.render_free_picture(surface.picture) {
            ignore.expect(cookie.sequence_number());
        }
        if let Some((shadow, _, _)) = surface.shadow {
            if let Ok(cookie) = conn.render_free_picture(shadow) {
                ignore.expect(cookie.sequence_number());
            }
        }
    }

    fn buffer_age(&mut self) -> usize {
        // The buffer picture persists; it always holds last frame.
        1
    }

    /// `None` falls back to the solid background fill.
    fn set_root_pixmap(&mut self, conn: &RustConnection, pixmap: Option<u32>) -> Result<()> {
        if let Some(old) = self.root_tile.take() {
            conn.render_free_picture(old)?;
        }
        if let Some(pixmap) = pixmap {
            let picture = conn.generate_id()?;
            conn.render_create_picture(
                picture,
                pixmap,
                self.format_screen,
                &CreatePictureAux::new().repeat(render::Repeat::NORMAL),
            )?;
            self.root_tile = Some(picture);
        }
        Ok(())
    }

    fn paint(
        &mut self,
        conn: &RustConnection,
        registry: &mut WindowRegistry,
        order: &[u32],
        region: &Region,
        shadow: &ShadowTables,
        config: &Config,
        ignore: &mut IgnoreQueue,
    ) -> Result<()> {
        let clip = to_xrects(region);
        conn.render_set_picture_clip_rectangles(self.buffer, 0, 0, &clip)?;

        // Bottom layer: desktop background.
        match self.root_tile {
            Some(tile) => {
                conn.render_composite(
                    PictOp::SRC,
                    tile,
                    x11rb::NONE,
                    self.buffer,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    self.width,
                    self.height,
                )?;
            }
            None => {
                conn.render_fill_rectangles(
                    PictOp::SRC,
                    self.buffer,
                    color_from_rgba(0.15, 0.15, 0.15, 1.0),
                    &[Rectangle {
                        x: 0,
                        y: 0,
                        width: self.width,
                        height: self.height,
                    }],
                )?;
            }
        }

        let ids: Vec<u32> = order.to_vec();
        for id in ids {
            let Some(w) = registry.find(id) else { continue };
            if !w.is_visible() || w.surface.is_none() {
                continue;
            }
            if crate::config::any_match(&config.paint_exclude, &w.name, &w.class, &w.role) {
                continue;
            }
            // Partial redraw: untouched windows stay as painted.
            if !region.intersects_rect(&w.paint_extents(&config.shadow)) {
                continue;
            }
            let Some(handle) = w.surface else { continue };
            let bounds = w.bounds();
            let opacity = w.opacity;
            let mode = w.mode;
            let has_shadow = w.shadow;
            let wants_blur = w.blur && mode == PaintMode::Blended;
            let invert = w.invert_color;
            let dim = w.dim;
            let (win_w, win_h) = (bounds.width() as u32, bounds.height() as u32);

            // Shadow pass sits beneath the window's own draw.
            if has_shadow {
                let shadow_pict = self.shadow_picture(conn, handle, win_w, win_h, shadow)?;
                let srect = shadow.placement(&bounds, &config.shadow);
                let cookie = conn.render_composite(
                    PictOp::OVER,
                    self.solid_shadow,
                    shadow_pict,
                    self.buffer,
                    0,
                    0,
                    0,
                    0,
                    srect.x1 as i16,
                    srect.y1 as i16,
                    srect.width() as u16,
                    srect.height() as u16,
                )?;
                ignore.expect(cookie.sequence_number());
            }

            // Blur what is already in the buffer beneath a translucent
            // window, before the window itself goes down.
            if wants_blur {
                if let Some(kernel) = self.blur_kernel.clone() {
                    let visible = bounds.intersection(&Rect::from_xywh(
                        0,
                        0,
                        self.width as u32,
                        self.height as u32,
                    ));
                    if !visible.is_empty() {
                        self.blur_under(conn, &kernel, &visible)?;
                    }
                }
            }

            let mask = match mode {
                PaintMode::Opaque => x11rb::NONE,
                PaintMode::Blended => self.alpha_picture(conn, opacity)?,
            };
            let Some(surface) = self.surfaces.get(&handle) else { continue };
            let cookie = conn.render_composite(
                PictOp::OVER,
                surface.picture,
                mask,
                self.buffer,
                0,
                0,
                0,
                0,
                bounds.x1 as i16,
                bounds.y1 as i16,
                bounds.width() as u16,
                bounds.height() as u16,
            )?;
            // The named pixmap may outrace destruction; never fail the
            // frame for one window.
            ignore.expect(cookie.sequence_number());

            if invert {
                let alpha = match mode {
                    PaintMode::Opaque => x11rb::NONE,
                    PaintMode::Blended => self.alpha_picture(conn, opacity)?,
                };
                conn.render_composite(
                    PictOp::DIFFERENCE,
                    self.solid_white,
                    alpha,
                    self.buffer,
                    0,
                    0,
                    0,
                    0,
                    bounds.x1 as i16,
                    bounds.y1 as i16,
                    bounds.width() as u16,
                    bounds.height() as u16,
                )?;
            }

            if dim {
                let dim_alpha = config.opacity.inactive_dim * (opacity as f64 / OPAQUE as f64);
                conn.render_fill_rectangles(
                    PictOp::OVER,
                    self.buffer,
                    color_from_rgba(0.0, 0.0, 0.0, dim_alpha),
                    &[Rectangle {
                        x: bounds.x1 as i16,
                        y: bounds.y1 as i16,
                        width: bounds.width() as u16,
                        height: bounds.height() as u16,
                    }],
                )?;
            }
        }

        // Present: one copy from the buffer to the visible target,
        // clipped to the damage region.
        conn.render_set_picture_clip_rectangles(self.target, 0, 0, &clip)?;
        conn.render_composite(
            PictOp::SRC,
            self.buffer,
            x11rb::NONE,
            self.target,
            0,
            0,
            0,
            0,
            0,
            0,
            self.width,
            self.height,
        )?;
        conn.flush()?;
        Ok(())
    }
}

fn create_buffer(
    conn: &RustConnection,
    root: u32,
    depth: u8,
    format: Pictformat,
    width: u16,
    height: u16,
) -> Result<(Picture, u32)> {
    let pixmap = conn.generate_id()?;
    conn.create_pixmap(depth, pixmap, root, width, height)?;
    let picture = conn.generate_id()?;
    conn.render_create_picture(picture, pixmap, format, &CreatePictureAux::new())?;
    Ok((picture, pixmap))
}

fn find_visual_format(
    formats: &render::QueryPictFormatsReply,
    visual: u32,
) -> Option<Pictformat> {
    for screen in &formats.screens {
        for depth in &screen.depths {
            for pv in &depth.visuals {
                if pv.visual == visual {
                    return Some(pv.format);
                }
            }
        }
    }
    None
}

fn find_standard_format(
    formats: &render::QueryPictFormatsReply,
    depth: u8,
    type_: PictType,
) -> Option<Pictformat> {
    formats
        .formats
        .iter()
        .find(|f: &&Pictforminfo| f.depth == depth && f.type_ == type_)
        .map(|f| f.id)
}

fn server_has_convolution(conn: &RustConnection, drawable: u32) -> Result<bool> {
    let reply = conn.render_query_filters(drawable)?.reply()?;
    Ok(reply
        .filters
        .iter()
        .any(|f| f.name.as_slice() == FILTER_CONVOLUTION))
}

/// Normalized box kernel in the RENDER convolution wire format:
/// width, height, then row-major weights.
fn box_kernel(strength: u32) -> Vec<render::Fixed> {
    let side = (2 * strength + 1) as usize;
    let weight = 1.0 / (side * side) as f64;
    let mut out = Vec::with_capacity(2 + side * side);
    out.push(fixed(side as f64));
    out.push(fixed(side as f64));
    out.extend(std::iter::repeat(fixed(weight)).take(side * side));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point() {
        assert_eq!(fixed(1.0), 65536);
        assert_eq!(fixed(0.5), 32768);
        assert_eq!(fixed(3.0), 3 * 65536);
    }

    #[test]
    fn test_box_kernel_layout() {
        let k = box_kernel(1);
        assert_eq!(k.len(), 2 + 9);
        assert_eq!(k[0], fixed(3.0));
        assert_eq!(k[1], fixed(3.0));
        // Weights sum to ~1.0 in fixed point.
        let sum: i64 = k[2..].iter().map(|&v| v as i64).sum();
        assert!((sum - 65536).abs() < 16);
    }

    #[test]
    fn test_color_premultiplied() {
        let c = color_from_rgba(1.0, 0.5, 0.0, 0.5);
        assert_eq!(c.alpha, 32767);
        assert_eq!(c.red, 32767);
        assert_eq!(c.green, 16383);
        assert_eq!(c.blue, 0);
    }

    #[test]
    fn test_region_to_xrects() {
        let mut region = Region::new();
        region.add_rect(Rect::from_xywh(10, 20, 30, 40));
        let rects = to_xrects(&region);
        assert_eq!(rects.len(), 1);
        assert_eq!(
            (rects[0].x, rects[0].y, rects[0].width, rects[0].height),
            (10, 20, 30, 40)
        );
    }
}
