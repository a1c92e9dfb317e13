//! GPU compositing through GLX texture-from-pixmap.
//!
//! A GLX context is made current on the overlay window and every
//! mapped window's named pixmap becomes a texture via
//! GLX_EXT_texture_from_pixmap, bound strictly (per frame) so the
//! texture always shows current content. Partial redraw relies on
//! GLX_EXT_buffer_age where the driver advertises it; without it every
//! swap repaints the whole frame.

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};
use x11rb::rust_connection::RustConnection;

use super::{RenderBackend, SurfaceHandle};
use crate::config::{Config, SwapMethod, VsyncMode, OPAQUE};
use crate::geometry::{Rect, Region};
use crate::ignore::IgnoreQueue;
use crate::registry::{PaintMode, WindowRecord, WindowRegistry};
use crate::shadow::ShadowTables;

const GLX_BIND_TO_TEXTURE_RGBA_EXT: i32 = 0x20D1;
const GLX_BIND_TO_TEXTURE_RGB_EXT: i32 = 0x20D0;
const GLX_BIND_TO_TEXTURE_TARGETS_EXT: i32 = 0x20D3;
const GLX_TEXTURE_2D_BIT_EXT: i32 = 0x0002;
const GLX_TEXTURE_FORMAT_EXT: i32 = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: i32 = 0x20D6;
const GLX_TEXTURE_2D_EXT: i32 = 0x20DC;
const GLX_TEXTURE_FORMAT_RGBA_EXT: i32 = 0x20DA;
const GLX_TEXTURE_FORMAT_RGB_EXT: i32 = 0x20D9;
const GLX_FRONT_LEFT_EXT: i32 = 0x20DE;
const GLX_MIPMAP_TEXTURE_EXT: i32 = 0x20D7;
const GLX_Y_INVERTED_EXT: i32 = 0x20D8;
const GLX_BACK_BUFFER_AGE_EXT: u32 = 0x20F4;

// Protocol errors raised by Xlib calls on this display land here
// instead of killing the process.
static X_ERROR_OCCURRED: AtomicBool = AtomicBool::new(false);
static X_ERROR_CODE: AtomicI32 = AtomicI32::new(0);

unsafe extern "C" fn x_error_handler(
    _display: *mut xlib::Display,
    event: *mut xlib::XErrorEvent,
) -> i32 {
    if !event.is_null() {
        let error_code = unsafe { (*event).error_code };
        X_ERROR_CODE.store(error_code as i32, Ordering::Relaxed);
        X_ERROR_OCCURRED.store(true, Ordering::Relaxed);
    }
    0
}

fn clear_error_trap() {
    X_ERROR_OCCURRED.store(false, Ordering::Relaxed);
    X_ERROR_CODE.store(0, Ordering::Relaxed);
}

fn trapped_error() -> Option<i32> {
    if X_ERROR_OCCURRED.load(Ordering::Relaxed) {
        Some(X_ERROR_CODE.load(Ordering::Relaxed))
    } else {
        None
    }
}

/// Best pixmap FBConfig for one visual depth.
#[derive(Clone, Copy)]
struct DepthFBConfig {
    fb_config: glx::GLXFBConfig,
    texture_format: i32,
    y_inverted: bool,
}

struct WinTexture {
    texture: u32,
    glx_pixmap: u64,
    x11_pixmap: u32,
    y_inverted: bool,
    /// Pixmap content is latched into the texture and left bound
    /// (no-rebind mode only).
    bound: bool,
    /// Shadow alpha texture and the window size it was built for.
    shadow: Option<(u32, u32, u32)>,
}

/// Uniform locations resolved once after link.
struct ProgramUniforms {
    position: i32,
    size: i32,
    opacity: i32,
    mode: i32,
    invert: i32,
    solid: i32,
    texture: i32,
}

pub struct GlxBackend {
    glx: Glx,
    xlib: Xlib,
    display: *mut xlib::Display,
    context: glx::GLXContext,
    /// Drawable for makeCurrent and swap; the overlay window itself.
    drawable: u64,
    width: u16,
    height: u16,
    depth_configs: [Option<DepthFBConfig>; 33],
    bind_tex_image: unsafe extern "C" fn(*mut xlib::Display, u64, i32, *mut i32),
    release_tex_image: unsafe extern "C" fn(*mut xlib::Display, u64, i32, *mut i32),
    has_buffer_age: bool,
    swap_method: SwapMethod,
    program: u32,
    uniforms: ProgramUniforms,
    blur_program: u32,
    vao: u32,
    vbo: u32,
    textures: HashMap<SurfaceHandle, WinTexture>,
    next_handle: u64,
    blur_radius: i32,
}

impl GlxBackend {
    pub fn new(
        _conn: &RustConnection,
        screen_num: usize,
        target: u32,
        width: u16,
        height: u16,
        config: &Config,
    ) -> Result<Self> {
        let xlib = Xlib::open().context("failed to load libX11")?;
        let glx = Glx::open().context("failed to load libGLX")?;

        let display_name = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
        let display_cstr = CString::new(display_name)?;
        let display = unsafe { (xlib.XOpenDisplay)(display_cstr.as_ptr()) };
        if display.is_null() {
            anyhow::bail!("failed to open X display for GLX");
        }
        unsafe {
            (xlib.XSetErrorHandler)(Some(x_error_handler));
        }

        let screen = screen_num as i32;
        let mut major = 0;
        let mut minor = 0;
        unsafe {
            (glx.glXQueryVersion)(display, &mut major, &mut minor);
        }
        debug!("GLX version {}.{}", major, minor);

        let extensions = unsafe {
            let s = (glx.glXQueryExtensionsString)(display, screen);
            if s.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(s).to_str().unwrap_or("")
            }
        };
        if !extensions.contains("GLX_EXT_texture_from_pixmap") {
            unsafe { (xlib.XCloseDisplay)(display) };
            anyhow::bail!("GLX_EXT_texture_from_pixmap not supported");
        }
        let has_buffer_age = extensions.contains("GLX_EXT_buffer_age");

        // FBConfig for the overlay: its visual decides whether
        // glXMakeCurrent on the overlay works at all.
        let overlay_visual = unsafe {
            let mut attrs = std::mem::zeroed::<xlib::XWindowAttributes>();
            if (xlib.XGetWindowAttributes)(display, target as u64, &mut attrs) != 0
                && !attrs.visual.is_null()
            {
                (*attrs.visual).visualid
            } else {
                0
            }
        };

        let basic_attribs = [
            glx::GLX_DRAWABLE_TYPE as i32,
            glx::GLX_WINDOW_BIT as i32 | glx::GLX_PIXMAP_BIT as i32,
            glx::GLX_RENDER_TYPE as i32,
            glx::GLX_RGBA_BIT as i32,
            glx::GLX_DOUBLEBUFFER as i32,
            1,
            glx::GLX_RED_SIZE as i32,
            8,
            glx::GLX_GREEN_SIZE as i32,
            8,
            glx::GLX_BLUE_SIZE as i32,
            8,
            0,
        ];
        let mut num_configs = 0;
        let configs_ptr = unsafe {
            (glx.glXChooseFBConfig)(display, screen, basic_attribs.as_ptr(), &mut num_configs)
        };
        if configs_ptr.is_null() || num_configs == 0 {
            unsafe { (xlib.XCloseDisplay)(display) };
            anyhow::bail!("no suitable GLX FBConfig");
        }

        let mut fb_config: Option<glx::GLXFBConfig> = None;
        if overlay_visual != 0 {
            for i in 0..num_configs as usize {
                let candidate = unsafe { *configs_ptr.add(i) };
                let vinfo = unsafe { (glx.glXGetVisualFromFBConfig)(display, candidate) };
                if vinfo.is_null() {
                    continue;
                }
                let visual_id = unsafe { (*vinfo).visualid };
                unsafe { (xlib.XFree)(vinfo as *mut _) };
                if visual_id == overlay_visual {
                    fb_config = Some(candidate);
                    break;
                }
            }
        }
        let fb_config = fb_config.unwrap_or_else(|| unsafe { *configs_ptr });
        unsafe { (xlib.XFree)(configs_ptr as *mut _) };

        let context = unsafe {
            (glx.glXCreateNewContext)(display, fb_config, glx::GLX_RGBA_TYPE as i32, ptr::null_mut(), 1)
        };
        if context.is_null() {
            unsafe { (xlib.XCloseDisplay)(display) };
            anyhow::bail!("glXCreateNewContext failed");
        }

        let drawable = target as u64;
        let current = unsafe { (glx.glXMakeCurrent)(display, drawable, context) };
        unsafe { (xlib.XSync)(display, 0) };
        if current == 0 {
            unsafe {
                (glx.glXDestroyContext)(display, context);
                (xlib.XCloseDisplay)(display);
            }
            anyhow::bail!("glXMakeCurrent on the overlay window failed");
        }

        gl::load_with(|symbol| {
            let Ok(symbol_cstr) = CString::new(symbol) else {
                return ptr::null();
            };
            unsafe {
                match (glx.glXGetProcAddress)(symbol_cstr.as_ptr() as *const _) {
                    Some(f) => f as *const _,
                    None => ptr::null(),
                }
            }
        });

        let bind_tex = load_glx_fn(&glx, "glXBindTexImageEXT");
        let release_tex = load_glx_fn(&glx, "glXReleaseTexImageEXT");
        let (Some(bind_tex), Some(release_tex)) = (bind_tex, release_tex) else {
            unsafe {
                (glx.glXDestroyContext)(display, context);
                (xlib.XCloseDisplay)(display);
            }
            anyhow::bail!("texture-from-pixmap entry points missing");
        };
        let bind_tex_image: unsafe extern "C" fn(*mut xlib::Display, u64, i32, *mut i32) =
            unsafe { std::mem::transmute(bind_tex) };
        let release_tex_image: unsafe extern "C" fn(*mut xlib::Display, u64, i32, *mut i32) =
            unsafe { std::mem::transmute(release_tex) };

        // Swap interval per the configured pacing mode. Tearing
        // control belongs to the driver once this is set.
        let interval = match config.vsync.mode {
            VsyncMode::None => 0,
            VsyncMode::Retrace | VsyncMode::BufferAge => 1,
        };
        if let Some(swap_fn) = load_glx_fn(&glx, "glXSwapIntervalEXT") {
            let swap_interval: unsafe extern "C" fn(*mut xlib::Display, u64, i32) =
                unsafe { std::mem::transmute(swap_fn) };
            unsafe {
                swap_interval(display, drawable, interval);
                (xlib.XSync)(display, 0);
            }
        } else if interval != 0 {
            warn!("glXSwapIntervalEXT not supported, retrace sync unavailable");
        }

        let swap_method = match config.backend.glx_swap_method {
            SwapMethod::Undefined | SwapMethod::BufferAge if has_buffer_age => SwapMethod::BufferAge,
            SwapMethod::BufferAge => {
                warn!("GLX_EXT_buffer_age not advertised, treating swaps as undefined");
                SwapMethod::Undefined
            }
            other => other,
        };

        let (program, uniforms, blur_program, vao, vbo) = unsafe { init_gl_state(width, height)? };

        let mut backend = Self {
            glx,
            xlib,
            display,
            context,
            drawable,
            width,
            height,
            depth_configs: [None; 33],
            bind_tex_image,
            release_tex_image,
            has_buffer_age,
            swap_method,
            program,
            uniforms,
            blur_program,
            vao,
            vbo,
            textures: HashMap::new(),
            next_handle: 1,
            blur_radius: if config.blur.enabled {
                config.blur.strength as i32
            } else {
                0
            },
        };
        backend.initialize_depth_configs();
        info!(
            "GLX backend ready, {}x{}, buffer-age={}, swap={:?}",
            width, height, has_buffer_age, backend.swap_method
        );
        Ok(backend)
    }

    /// Best FBConfig per visual depth, compiz style: buffer size must
    /// match the depth and the config must bind to a texture format
    /// appropriate for it.
    fn initialize_depth_configs(&mut self) {
        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32,
            glx::GLX_WINDOW_BIT as i32 | glx::GLX_PIXMAP_BIT as i32,
            glx::GLX_RENDER_TYPE as i32,
            glx::GLX_RGBA_BIT as i32,
            0,
        ];
        let screen = unsafe { (self.xlib.XDefaultScreen)(self.display) };
        let mut num_configs = 0;
        let configs_ptr = unsafe {
            (self.glx.glXChooseFBConfig)(self.display, screen, attribs.as_ptr(), &mut num_configs)
        };
        if configs_ptr.is_null() || num_configs == 0 {
            warn!("no FBConfigs available for pixmap binding");
            return;
        }

        for depth in [8u8, 15, 16, 24, 32] {
            let mut best: Option<DepthFBConfig> = None;
            let mut best_depth_size = i32::MAX;
            for i in 0..num_configs as usize {
                let candidate = unsafe { *configs_ptr.add(i) };
                let vinfo = unsafe { (self.glx.glXGetVisualFromFBConfig)(self.display, candidate) };
                if vinfo.is_null() {
                    continue;
                }
                let visual_depth = unsafe { (*vinfo).depth } as u8;
                unsafe { (self.xlib.XFree)(vinfo as *mut _) };
                if visual_depth != depth {
                    continue;
                }

                let buffer_size = self.config_attrib(candidate, glx::GLX_BUFFER_SIZE as i32);
                let alpha_size = self.config_attrib(candidate, glx::GLX_ALPHA_SIZE as i32);
                if buffer_size != depth as i32 && buffer_size - alpha_size != depth as i32 {
                    continue;
                }

                let texture_format = if depth == 32 {
                    if self.config_attrib(candidate, GLX_BIND_TO_TEXTURE_RGBA_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGBA_EXT
                } else {
                    if self.config_attrib(candidate, GLX_BIND_TO_TEXTURE_RGB_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGB_EXT
                };
                if self.config_attrib(candidate, GLX_BIND_TO_TEXTURE_TARGETS_EXT)
                    & GLX_TEXTURE_2D_BIT_EXT
                    == 0
                {
                    continue;
                }

                let depth_size = self.config_attrib(candidate, glx::GLX_DEPTH_SIZE as i32);
                if depth_size > best_depth_size {
                    continue;
                }
                best = Some(DepthFBConfig {
                    fb_config: candidate,
                    texture_format,
                    y_inverted: self.config_attrib(candidate, GLX_Y_INVERTED_EXT) != 0,
                });
                best_depth_size = depth_size;
            }
            if let Some(found) = best {
                self.depth_configs[depth as usize] = Some(found);
                trace!("pixmap FBConfig for depth {}: y_inverted={}", depth, found.y_inverted);
            }
        }
        unsafe { (self.xlib.XFree)(configs_ptr as *mut _) };
    }

    fn config_attrib(&self, config: glx::GLXFBConfig, attrib: i32) -> i32 {
        let mut value = 0;
        unsafe {
            (self.glx.glXGetFBConfigAttrib)(self.display, config, attrib, &mut value);
        }
        value
    }

    /// GLX pixmap from a named X pixmap, trapping the BadPixmap /
    /// BadMatch races that happen when the window dies underneath us.
    fn create_glx_pixmap(&self, pixmap: u32, depth: u8) -> Result<(u64, bool)> {
        let Some(depth_config) = self.depth_configs.get(depth as usize).copied().flatten() else {
            anyhow::bail!("no pixmap FBConfig for depth {}", depth);
        };
        let attribs = [
            GLX_TEXTURE_FORMAT_EXT,
            depth_config.texture_format,
            GLX_TEXTURE_TARGET_EXT,
            GLX_TEXTURE_2D_EXT,
            GLX_MIPMAP_TEXTURE_EXT,
            0,
            0,
        ];
        unsafe { (self.xlib.XSync)(self.display, 0) };
        clear_error_trap();
        let glx_pixmap = unsafe {
            (self.glx.glXCreatePixmap)(self.display, depth_config.fb_config, pixmap as u64, attribs.as_ptr())
        };
        unsafe { (self.xlib.XSync)(self.display, 0) };
        if let Some(code) = trapped_error() {
            clear_error_trap();
            anyhow::bail!("glXCreatePixmap for pixmap {} failed with X error {}", pixmap, code);
        }
        if glx_pixmap == 0 {
            anyhow::bail!("glXCreatePixmap returned 0 for pixmap {}", pixmap);
        }
        Ok((glx_pixmap, depth_config.y_inverted))
    }

    /// Normalized device coordinates for a screen-space rect.
    fn to_ndc(&self, bounds: &Rect) -> (f32, f32, f32, f32) {
        let sw = self.width as f32;
        let sh = self.height as f32;
        let x = (bounds.x1 as f32 / sw) * 2.0 - 1.0;
        let y = 1.0 - (bounds.y2 as f32 / sh) * 2.0;
        let w = (bounds.width() as f32 / sw) * 2.0;
        let h = (bounds.height() as f32 / sh) * 2.0;
        (x, y, w, h)
    }

    unsafe fn draw_quad(&self, y_inverted: bool) {
        let vertices: [f32; 16] = if y_inverted {
            [
                0.0, 0.0, 0.0, 0.0, //
                1.0, 0.0, 1.0, 0.0, //
                1.0, 1.0, 1.0, 1.0, //
                0.0, 1.0, 0.0, 1.0,
            ]
        } else {
            [
                0.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 1.0, 1.0, //
                1.0, 1.0, 1.0, 0.0, //
                0.0, 1.0, 0.0, 0.0,
            ]
        };
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        unsafe {
            gl::BindVertexArray(self.vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                bytes.len() as isize,
                bytes.as_ptr() as *const _,
                gl::DYNAMIC_DRAW,
            );
            gl::DrawArrays(gl::TRIANGLE_FAN, 0, 4);
            gl::BindVertexArray(0);
        }
    }

    unsafe fn set_rect_uniforms(&self, bounds: &Rect) {
        let (x, y, w, h) = self.to_ndc(bounds);
        unsafe {
            gl::Uniform2f(self.uniforms.position, x, y);
            gl::Uniform2f(self.uniforms.size, w, h);
        }
    }

    /// Shadow alpha texture for a window, rebuilt when its size
    /// changes.
    fn shadow_texture(
        &mut self,
        handle: SurfaceHandle,
        win_w: u32,
        win_h: u32,
        shadow: &ShadowTables,
    ) -> Option<u32> {
        let entry = self.textures.get_mut(&handle)?;
        if let Some((tex, w, h)) = entry.shadow {
            if w == win_w && h == win_h {
                return Some(tex);
            }
            unsafe { gl::DeleteTextures(1, &tex) };
            entry.shadow = None;
        }
        let (sw, sh) = shadow.image_size(win_w, win_h);
        let data = shadow.image(win_w, win_h);
        let mut tex = 0;
        unsafe {
            gl::GenTextures(1, &mut tex);
            gl::BindTexture(gl::TEXTURE_2D, tex);
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 1);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RED as i32,
                sw as i32,
                sh as i32,
                0,
                gl::RED,
                gl::UNSIGNED_BYTE,
                data.as_ptr() as *const _,
            );
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        entry.shadow = Some((tex, win_w, win_h));
        Some(tex)
    }

    /// Blur the framebuffer content under a window: copy the backdrop
    /// into a scratch texture and draw it back through the blur
    /// program.
    unsafe fn blur_backdrop(&self, bounds: &Rect) {
        let w = bounds.width() as i32;
        let h = bounds.height() as i32;
        // Framebuffer origin is bottom-left.
        let fb_y = self.height as i32 - bounds.y2;
        unsafe {
            let mut backdrop = 0;
            gl::GenTextures(1, &mut backdrop);
            gl::BindTexture(gl::TEXTURE_2D, backdrop);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA as i32,
                w,
                h,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                ptr::null(),
            );
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::ReadBuffer(gl::BACK);
            gl::CopyTexSubImage2D(gl::TEXTURE_2D, 0, 0, 0, bounds.x1, fb_y, w, h);

            gl::UseProgram(self.blur_program);
            let pos = gl::GetUniformLocation(self.blur_program, b"uPosition\0".as_ptr() as *const _);
            let size = gl::GetUniformLocation(self.blur_program, b"uSize\0".as_ptr() as *const _);
            let texel =
                gl::GetUniformLocation(self.blur_program, b"uTexelSize\0".as_ptr() as *const _);
            let radius = gl::GetUniformLocation(self.blur_program, b"uRadius\0".as_ptr() as *const _);
            let tex = gl::GetUniformLocation(self.blur_program, b"uTexture\0".as_ptr() as *const _);
            let sw = self.width as f32;
            let sh = self.height as f32;
            gl::Uniform2f(
                pos,
                (bounds.x1 as f32 / sw) * 2.0 - 1.0,
                1.0 - (bounds.y2 as f32 / sh) * 2.0,
            );
            gl::Uniform2f(size, (w as f32 / sw) * 2.0, (h as f32 / sh) * 2.0);
            gl::Uniform2f(texel, 1.0 / w as f32, 1.0 / h as f32);
            gl::Uniform1i(radius, self.blur_radius);
            gl::Uniform1i(tex, 0);
            gl::ActiveTexture(gl::TEXTURE0);
            // The copy read the framebuffer bottom-up, so the quad is
            // drawn y-inverted to land right side up.
            self.draw_quad(true);
            gl::BindTexture(gl::TEXTURE_2D, 0);
            gl::DeleteTextures(1, &backdrop);
            gl::UseProgram(self.program);
        }
    }

    fn make_current(&self) -> Result<()> {
        let result =
            unsafe { (self.glx.glXMakeCurrent)(self.display, self.drawable, self.context) };
        if result == 0 {
            anyhow::bail!("glXMakeCurrent failed");
        }
        Ok(())
    }
}

impl RenderBackend for GlxBackend {
    fn name(&self) -> &'static str {
        "glx"
    }

    fn resize(&mut self, _conn: &RustConnection, width: u16, height: u16) -> Result<()> {
        self.width = width;
        self.height = height;
        self.make_current()?;
        unsafe {
            gl::Viewport(0, 0, width as i32, height as i32);
        }
        Ok(())
    }

    fn bind_window(
        &mut self,
        conn: &RustConnection,
        win: &mut WindowRecord,
        ignore: &mut IgnoreQueue,
    ) -> Result<()> {
        let Some(pixmap) = win.pixmap else {
            anyhow::bail!("window {} has no named pixmap", win.id);
        };
        if let Some(handle) = win.surface {
            if let Some(existing) = self.textures.get(&handle) {
                if existing.x11_pixmap == pixmap {
                    return Ok(());
                }
            }
        }
        self.release_window(conn, win, ignore);

        let (glx_pixmap, y_inverted) = self
            .create_glx_pixmap(pixmap, win.depth)
            .with_context(|| format!("binding window {}", win.id))?;
        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        let handle = SurfaceHandle(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(
            handle,
            WinTexture {
                texture,
                glx_pixmap,
                x11_pixmap: pixmap,
                y_inverted,
                bound: false,
                shadow: None,
            },
        );
        win.surface = Some(handle);
        trace!("bound window {} to texture {}", win.id, texture);
        Ok(())
    }

    fn release_window(
        &mut self,
        _conn: &RustConnection,
        win: &mut WindowRecord,
        _ignore: &mut IgnoreQueue,
    ) {
        let Some(handle) = win.surface.take() else {
            return;
        };
        let Some(entry) = self.textures.remove(&handle) else {
            return;
        };
        clear_error_trap();
        unsafe {
            (self.release_tex_image)(self.display, entry.glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null_mut());
            (self.glx.glXDestroyPixmap)(self.display, entry.glx_pixmap);
            (self.xlib.XSync)(self.display, 0);
            gl::DeleteTextures(1, &entry.texture);
            if let Some((shadow_tex, _, _)) = entry.shadow {
                gl::DeleteTextures(1, &shadow_tex);
            }
        }
        // Destruction races are expected here.
        clear_error_trap();
    }

    fn buffer_age(&mut self) -> usize {
        match self.swap_method {
            SwapMethod::Copy => 1,
            SwapMethod::BufferAge if self.has_buffer_age => {
                let mut age: u32 = 0;
                unsafe {
                    (self.glx.glXQueryDrawable)(
                        self.display,
                        self.drawable,
                        GLX_BACK_BUFFER_AGE_EXT as i32,
                        &mut age,
                    );
                }
                age as usize
            }
            _ => 0,
        }
    }

    fn paint(
        &mut self,
        _conn: &RustConnection,
        registry: &mut WindowRegistry,
        order: &[u32],
        region: &Region,
        shadow: &ShadowTables,
        config: &Config,
        _ignore: &mut IgnoreQueue,
    ) -> Result<()> {
        self.make_current()?;
        let Some(extents) = region.extents() else {
            return Ok(());
        };

        unsafe {
            gl::Enable(gl::BLEND);
            gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
            gl::Enable(gl::SCISSOR_TEST);
            gl::Scissor(
                extents.x1,
                self.height as i32 - extents.y2,
                extents.width() as i32,
                extents.height() as i32,
            );
            gl::ClearColor(0.15, 0.15, 0.15, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);
            gl::UseProgram(self.program);
            gl::Uniform1i(self.uniforms.texture, 0);
        }

        let [shadow_r, shadow_g, shadow_b] = config.shadow.color;
        let ids: Vec<u32> = order.to_vec();
        for id in ids {
            let Some(w) = registry.find(id) else { continue };
            if !w.is_visible() || w.surface.is_none() {
                continue;
            }
            if crate::config::any_match(&config.paint_exclude, &w.name, &w.class, &w.role) {
                continue;
            }
            // The whole scissor box was cleared, so every window
            // touching it must be redrawn; testing the individual
            // damage rects would leave cleared-but-unpainted holes.
            if culled(&extents, &w.paint_extents(&config.shadow)) {
                continue;
            }
            let Some(handle) = w.surface else { continue };
            let bounds = w.bounds();
            let opacity = w.opacity as f32 / OPAQUE as f32;
            let mode = w.mode;
            let has_shadow = w.shadow;
            let wants_blur = w.blur && mode == PaintMode::Blended && self.blur_radius > 0;
            let invert = w.invert_color;
            let dim = w.dim;
            let (win_w, win_h) = (bounds.width() as u32, bounds.height() as u32);

            if has_shadow {
                if let Some(shadow_tex) = self.shadow_texture(handle, win_w, win_h, shadow) {
                    let shadow_rect = shadow.placement(&bounds, &config.shadow);
                    unsafe {
                        self.set_rect_uniforms(&shadow_rect);
                        gl::Uniform1i(self.uniforms.mode, 1);
                        gl::Uniform4f(
                            self.uniforms.solid,
                            shadow_r as f32,
                            shadow_g as f32,
                            shadow_b as f32,
                            1.0,
                        );
                        gl::ActiveTexture(gl::TEXTURE0);
                        gl::BindTexture(gl::TEXTURE_2D, shadow_tex);
                        self.draw_quad(false);
                    }
                }
            }

            if wants_blur {
                let visible = bounds.intersection(&Rect::from_xywh(
                    0,
                    0,
                    self.width as u32,
                    self.height as u32,
                ));
                if !visible.is_empty() {
                    unsafe { self.blur_backdrop(&visible) };
                }
            }

            let (texture, glx_pixmap, y_inverted, already_bound) =
                match self.textures.get(&handle) {
                    Some(e) => (e.texture, e.glx_pixmap, e.y_inverted, e.bound),
                    None => continue,
                };
            // Strict binding latches current pixmap content into the
            // texture every frame; no-rebind mode leaves the texture
            // bound and trusts the server to keep it current.
            let keep_bound = config.backend.glx_no_rebind_pixmap;
            unsafe {
                self.set_rect_uniforms(&bounds);
                gl::Uniform1i(self.uniforms.mode, 0);
                gl::Uniform1f(self.uniforms.opacity, opacity);
                gl::Uniform1i(self.uniforms.invert, invert as i32);
                gl::ActiveTexture(gl::TEXTURE0);
                gl::BindTexture(gl::TEXTURE_2D, texture);

                if !already_bound || !keep_bound {
                    clear_error_trap();
                    (self.glx.glXWaitX)();
                    (self.bind_tex_image)(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null_mut());
                    if let Some(code) = trapped_error() {
                        trace!("bind_tex_image for window {} raced destruction (X error {})", id, code);
                        clear_error_trap();
                        gl::BindTexture(gl::TEXTURE_2D, 0);
                        continue;
                    }
                }
                self.draw_quad(y_inverted);
                if !keep_bound {
                    (self.release_tex_image)(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null_mut());
                }
                gl::BindTexture(gl::TEXTURE_2D, 0);
            }
            if keep_bound {
                if let Some(e) = self.textures.get_mut(&handle) {
                    e.bound = true;
                }
            }

            if dim {
                let dim_alpha = (config.opacity.inactive_dim as f32) * opacity;
                unsafe {
                    self.set_rect_uniforms(&bounds);
                    gl::Uniform1i(self.uniforms.mode, 2);
                    gl::Uniform4f(self.uniforms.solid, 0.0, 0.0, 0.0, dim_alpha);
                    self.draw_quad(false);
                }
            }
        }

        unsafe {
            gl::Disable(gl::SCISSOR_TEST);
            let err = gl::GetError();
            if err != gl::NO_ERROR {
                warn!("OpenGL error during frame: 0x{:x}", err);
            }
            (self.glx.glXSwapBuffers)(self.display, self.drawable);
        }
        Ok(())
    }
}

impl Drop for GlxBackend {
    fn drop(&mut self) {
        unsafe {
            if (self.glx.glXMakeCurrent)(self.display, self.drawable, self.context) != 0 {
                for entry in self.textures.values() {
                    (self.glx.glXDestroyPixmap)(self.display, entry.glx_pixmap);
                    gl::DeleteTextures(1, &entry.texture);
                    if let Some((shadow_tex, _, _)) = entry.shadow {
                        gl::DeleteTextures(1, &shadow_tex);
                    }
                }
                gl::DeleteBuffers(1, &self.vbo);
                gl::DeleteVertexArrays(1, &self.vao);
                gl::DeleteProgram(self.program);
                gl::DeleteProgram(self.blur_program);
            }
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            (self.glx.glXDestroyContext)(self.display, self.context);
            (self.xlib.XCloseDisplay)(self.display);
        }
    }
}

/// Frame culling under the scissor-box clear: a window is skippable
/// only when it misses the cleared extents entirely.
fn culled(extents: &Rect, win_extents: &Rect) -> bool {
    !extents.intersects(win_extents)
}

fn load_glx_fn(glx: &Glx, name: &str) -> Option<unsafe extern "C" fn()> {
    let Ok(sym) = CString::new(name) else {
        return None;
    };
    unsafe { (glx.glXGetProcAddress)(sym.as_ptr() as *const _) }
}

const VERTEX_SHADER: &str = r#"
    #version 330 core
    layout (location = 0) in vec2 aPos;
    layout (location = 1) in vec2 aTexCoord;

    uniform vec2 uPosition;
    uniform vec2 uSize;

    out vec2 TexCoord;

    void main() {
        vec2 pos = aPos * uSize + uPosition;
        gl_Position = vec4(pos.x, pos.y, 0.0, 1.0);
        TexCoord = aTexCoord;
    }
"#;

const FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;
    uniform float uOpacity;
    uniform int uMode;
    uniform int uInvert;
    uniform vec4 uSolid;

    void main() {
        if (uMode == 1) {
            // Solid color through a single-channel alpha mask.
            float a = texture(uTexture, TexCoord).r;
            FragColor = vec4(uSolid.rgb * uSolid.a * a, uSolid.a * a);
        } else if (uMode == 2) {
            FragColor = uSolid;
        } else {
            vec4 c = texture(uTexture, TexCoord);
            if (uInvert != 0) {
                c.rgb = vec3(1.0) - c.rgb;
            }
            FragColor = vec4(c.rgb, c.a * uOpacity);
        }
    }
"#;

const BLUR_FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;
    uniform vec2 uTexelSize;
    uniform int uRadius;

    void main() {
        vec3 acc = vec3(0.0);
        float count = 0.0;
        for (int dy = -uRadius; dy <= uRadius; ++dy) {
            for (int dx = -uRadius; dx <= uRadius; ++dx) {
                acc += texture(uTexture, TexCoord + vec2(dx, dy) * uTexelSize).rgb;
                count += 1.0;
            }
        }
        FragColor = vec4(acc / count, 1.0);
    }
"#;

unsafe fn init_gl_state(
    width: u16,
    height: u16,
) -> Result<(u32, ProgramUniforms, u32, u32, u32)> {
    unsafe {
        gl::Viewport(0, 0, width as i32, height as i32);

        let vs = compile_shader(VERTEX_SHADER, gl::VERTEX_SHADER)?;
        let fs = compile_shader(FRAGMENT_SHADER, gl::FRAGMENT_SHADER)?;
        let program = link_program(vs, fs)?;
        let blur_fs = compile_shader(BLUR_FRAGMENT_SHADER, gl::FRAGMENT_SHADER)?;
        let blur_program = link_program(vs, blur_fs)?;
        gl::DeleteShader(vs);
        gl::DeleteShader(fs);
        gl::DeleteShader(blur_fs);

        let uniforms = ProgramUniforms {
            position: gl::GetUniformLocation(program, b"uPosition\0".as_ptr() as *const _),
            size: gl::GetUniformLocation(program, b"uSize\0".as_ptr() as *const _),
            opacity: gl::GetUniformLocation(program, b"uOpacity\0".as_ptr() as *const _),
            mode: gl::GetUniformLocation(program, b"uMode\0".as_ptr() as *const _),
            invert: gl::GetUniformLocation(program, b"uInvert\0".as_ptr() as *const _),
            solid: gl::GetUniformLocation(program, b"uSolid\0".as_ptr() as *const _),
            texture: gl::GetUniformLocation(program, b"uTexture\0".as_ptr() as *const _),
        };

        let mut vao = 0;
        let mut vbo = 0;
        gl::GenVertexArrays(1, &mut vao);
        gl::GenBuffers(1, &mut vbo);
        gl::BindVertexArray(vao);
        gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
        gl::VertexAttribPointer(
            0,
            2,
            gl::FLOAT,
            gl::FALSE,
            4 * std::mem::size_of::<f32>() as i32,
            ptr::null(),
        );
        gl::EnableVertexAttribArray(0);
        gl::VertexAttribPointer(
            1,
            2,
            gl::FLOAT,
            gl::FALSE,
            4 * std::mem::size_of::<f32>() as i32,
            (2 * std::mem::size_of::<f32>()) as *const _,
        );
        gl::EnableVertexAttribArray(1);
        gl::BindVertexArray(0);

        Ok((program, uniforms, blur_program, vao, vbo))
    }
}

unsafe fn compile_shader(source: &str, shader_type: u32) -> Result<u32> {
    unsafe {
        let shader = gl::CreateShader(shader_type);
        let c_str = CString::new(source)?;
        gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut success = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len as usize];
            gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            let log = String::from_utf8_lossy(&buffer);
            gl::DeleteShader(shader);
            anyhow::bail!("shader compilation failed: {}", log);
        }
        Ok(shader)
    }
}

unsafe fn link_program(vs: u32, fs: u32) -> Result<u32> {
    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut success = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len as usize];
            gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            let log = String::from_utf8_lossy(&buffer);
            gl::DeleteProgram(program);
            anyhow::bail!("program linking failed: {}", log);
        }
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_between_disjoint_damage_not_culled() {
        // Two damage rects at opposite corners: the scissor clear wipes
        // the whole bounding box, so a window in the untouched middle
        // must still be repainted even though it misses every damage
        // rect individually.
        let mut region = Region::new();
        region.add_rect(Rect::from_xywh(0, 0, 50, 50));
        region.add_rect(Rect::from_xywh(500, 500, 50, 50));
        let extents = region.extents().unwrap();
        let middle = Rect::from_xywh(200, 200, 100, 100);
        assert!(!region.intersects_rect(&middle));
        assert!(!culled(&extents, &middle));
    }

    #[test]
    fn test_window_outside_cleared_extents_culled() {
        let mut region = Region::new();
        region.add_rect(Rect::from_xywh(0, 0, 50, 50));
        region.add_rect(Rect::from_xywh(500, 500, 50, 50));
        let extents = region.extents().unwrap();
        assert!(culled(&extents, &Rect::from_xywh(600, 0, 50, 50)));
    }
}
