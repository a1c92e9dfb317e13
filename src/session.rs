//! The compositor session: one mutable aggregate owning the X
//! connection, the window registry, damage state, the fade engine and
//! the render backend. Everything mutates on the event-loop task; the
//! only helper thread is the readability poller, which owns nothing.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{ConnectionExt as CompositeExt, Redirect};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt};
use x11rb::protocol::render;
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt};
use x11rb::protocol::xfixes::{self, ConnectionExt as XfixesExt};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ConnectionExt, CreateWindowAux, EventMask, MapState,
    WindowClass,
};
use x11rb::rust_connection::RustConnection;

use crate::atoms::Atoms;
use crate::backend::{self, RenderBackend};
use crate::config::Config;
use crate::damage::DamageBoard;
use crate::errors::CoreError;
use crate::fade::FadeEngine;
use crate::geometry::Rect;
use crate::ignore::IgnoreQueue;
use crate::registry::{
    Force, InitialAttrs, PaintMode, WinState, WindowRegistry, WindowType, MAX_LEADER_DEPTH,
};
use crate::shadow::ShadowTables;
use crate::timers::Timers;
use crate::vsync::VsyncPacer;

pub struct Session {
    pub(crate) conn: Arc<RustConnection>,
    pub(crate) screen_num: usize,
    pub(crate) root: u32,
    pub(crate) overlay: u32,
    /// Owner of the _NET_WM_CM_Sn selection; never painted.
    pub(crate) selection_window: u32,
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) config: Config,
    pub(crate) atoms: Atoms,
    pub(crate) registry: WindowRegistry,
    pub(crate) board: DamageBoard,
    pub(crate) fade: FadeEngine,
    pub(crate) shadow: ShadowTables,
    pub(crate) backend: Box<dyn RenderBackend>,
    pub(crate) pacer: VsyncPacer,
    pub(crate) ignore: IgnoreQueue,
    pub(crate) timers: Timers,
    /// _NET_ACTIVE_WINDOW, when tracked.
    pub(crate) active_win: Option<u32>,
    /// Control plane: painting suspended entirely.
    pub(crate) paused: bool,
    /// Control plane: tri-state redirection override.
    pub(crate) redirect_force: Force,
    /// Whether composite redirection is currently active.
    pub(crate) redirected: bool,
    /// A fullscreen opaque window qualifies for unredirection and the
    /// delay timer is running toward it.
    pub(crate) unredirect_pending: bool,
    /// Monotonic origin for the fade step clock.
    pub(crate) epoch: Instant,
}

impl Session {
    pub fn new(conn: Arc<RustConnection>, screen_num: usize, config: Config) -> Result<Self> {
        let setup = conn.setup();
        let screen = &setup.roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels;
        let height = screen.height_in_pixels;

        check_extensions(&conn)?;
        conn.composite_query_version(0, 4)?.reply()?;
        conn.damage_query_version(1, 1)?.reply()?;
        conn.xfixes_query_version(5, 0)?.reply()?;
        conn.shape_query_version()?.reply()?;
        let has_randr = conn
            .extension_information(randr::X11_EXTENSION_NAME)?
            .is_some();
        if has_randr {
            conn.randr_query_version(1, 2)?.reply()?;
        }

        let atoms = Atoms::new(&conn)?.reply()?;

        let selection_window = acquire_cm_selection(&conn, screen_num, root)?;

        conn.composite_redirect_subwindows(root, Redirect::MANUAL)
            .context("redirecting subwindows")?
            .check()
            .map_err(|_| CoreError::ScreenOwned(screen_num))?;

        let overlay = conn.composite_get_overlay_window(root)?.reply()?.overlay_win;
        // Input passes through the overlay untouched.
        let empty_region = conn.generate_id()?;
        conn.xfixes_create_region(empty_region, &[])?;
        conn.xfixes_set_window_shape_region(overlay, shape::SK::INPUT, 0, 0, empty_region)?;
        conn.xfixes_destroy_region(empty_region)?;

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::STRUCTURE_NOTIFY
                    | EventMask::PROPERTY_CHANGE
                    | EventMask::EXPOSURE,
            ),
        )?;
        if has_randr {
            conn.randr_select_input(root, randr::NotifyMask::SCREEN_CHANGE)?;
        }

        let backend = backend::init(&conn, screen_num, overlay, width, height, &config)?;
        let shadow = ShadowTables::build(&config.shadow);
        let pacer = VsyncPacer::new(&config.vsync);
        let mut board = DamageBoard::new(width, height);
        board.damage_whole_screen();

        let mut session = Self {
            conn,
            screen_num,
            root,
            overlay,
            selection_window,
            width,
            height,
            config,
            atoms,
            registry: WindowRegistry::new(),
            board,
            fade: FadeEngine::new(),
            shadow,
            backend,
            pacer,
            ignore: IgnoreQueue::new(),
            timers: Timers::new(),
            active_win: None,
            paused: false,
            redirect_force: Force::Default,
            redirected: true,
            unredirect_pending: false,
            epoch: Instant::now(),
        };

        session.scan_existing_windows()?;
        session.refresh_root_tile()?;
        if session.config.focus.use_ewmh_active_win {
            let active = session.get_window_prop(root, session.atoms._NET_ACTIVE_WINDOW);
            session.set_active_window(active);
        }
        session.conn.flush()?;
        info!(
            "session up: screen {}, {}x{}, {} existing windows, {} backend",
            screen_num,
            width,
            height,
            session.registry.len(),
            session.backend.name()
        );
        Ok(session)
    }

    /// Adopt every pre-existing child of the root, bottom-to-top.
    fn scan_existing_windows(&mut self) -> Result<()> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        for child in tree.children {
            if let Err(e) = self.track_window(child) {
                debug!("skipping window {:#x}: {:#}", child, e);
            }
        }
        Ok(())
    }

    /// Begin tracking a toplevel. Tolerates the window racing away
    /// between notification and inspection.
    pub(crate) fn track_window(&mut self, id: u32) -> Result<()> {
        if id == self.overlay || id == self.selection_window || self.registry.find(id).is_some() {
            return Ok(());
        }
        let attrs = self
            .conn
            .get_window_attributes(id)?
            .reply()
            .context("window gone before attributes")?;
        if attrs.class == WindowClass::INPUT_ONLY {
            return Ok(());
        }
        let geom = self
            .conn
            .get_geometry(id)?
            .reply()
            .context("window gone before geometry")?;

        let mapped = attrs.map_state == MapState::VIEWABLE;
        self.registry.observe(
            id,
            self.root,
            InitialAttrs {
                x: geom.x as i32,
                y: geom.y as i32,
                width: geom.width as u32,
                height: geom.height as u32,
                border_width: geom.border_width as u32,
                depth: geom.depth,
                mapped,
                override_redirect: attrs.override_redirect,
            },
        );

        // Take the sequence numbers in the same statement so the
        // cookies drop before the registry is touched again.
        let seq = self
            .conn
            .change_window_attributes(
                id,
                &ChangeWindowAttributesAux::new()
                    .event_mask(EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE),
            )?
            .sequence_number();
        self.ignore.expect(seq);
        let seq = self.conn.shape_select_input(id, true)?.sequence_number();
        self.ignore.expect(seq);

        let damage_id = self.conn.generate_id()?;
        let seq = self
            .conn
            .damage_create(damage_id, id, damage::ReportLevel::NON_EMPTY)?
            .sequence_number();
        self.ignore.expect(seq);
        if let Some(w) = self.registry.find_mut(id) {
            w.damage = Some(damage_id);
        }

        self.refresh_window_props(id);
        if mapped {
            self.window_mapped(id)?;
        }
        trace!("tracking window {:#x} (mapped={})", id, mapped);
        Ok(())
    }

    /// Map-time work shared by MapNotify and the startup scan: name
    /// the backing pixmap, bind it, start the fade-in, damage the
    /// extents.
    pub(crate) fn window_mapped(&mut self, id: u32) -> Result<()> {
        if let Some(w) = self.registry.find_mut(id) {
            w.state = WinState::Mapped;
            w.bind_failed = false;
            w.refresh_policy(&self.config);
        }
        self.rebind_pixmap(id);
        self.fade
            .retarget_openclose(&mut self.registry, id, &self.config);
        self.damage_window_extents(id);
        Ok(())
    }

    /// Name a fresh backing pixmap for the window and hand it to the
    /// backend. A failure latches `bind_failed` so the window is
    /// skipped instead of retried every frame.
    pub(crate) fn rebind_pixmap(&mut self, id: u32) {
        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        if w.state != WinState::Mapped || w.bind_failed {
            return;
        }
        if let Some(old) = w.pixmap.take() {
            if let Ok(cookie) = self.conn.free_pixmap(old) {
                self.ignore.expect(cookie.sequence_number());
            }
        }
        let pixmap = match self.conn.generate_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("id allocation failed: {}", e);
                return;
            }
        };
        match self.conn.composite_name_window_pixmap(id, pixmap) {
            Ok(cookie) => self.ignore.expect(cookie.sequence_number()),
            Err(e) => {
                warn!("naming pixmap for window {:#x} failed: {}", id, e);
                return;
            }
        }
        w.pixmap = Some(pixmap);
        // Reborrow dance: the backend needs the record mutably.
        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        if let Err(e) = self.backend.bind_window(&self.conn, w, &mut self.ignore) {
            warn!("bind failed for window {:#x}: {:#}", id, e);
            w.bind_failed = true;
        }
    }

    /// Union a window's shadow-inclusive extents into pending damage.
    pub(crate) fn damage_window_extents(&mut self, id: u32) {
        if let Some(w) = self.registry.find(id) {
            let ext = w.paint_extents(&self.config.shadow);
            self.board.add_rect(ext);
        }
    }

    /// Re-read every tracked property of a window and re-derive its
    /// policy attributes. Damages the extents when anything visible
    /// changed.
    pub(crate) fn refresh_window_props(&mut self, id: u32) {
        let name = self
            .get_text_prop(id, self.atoms._NET_WM_NAME)
            .or_else(|| self.get_text_prop(id, AtomEnum::WM_NAME.into()))
            .unwrap_or_default();
        let class = self
            .get_text_prop(id, AtomEnum::WM_CLASS.into())
            .map(|raw| raw.split('\0').nth(1).unwrap_or(&raw).to_owned())
            .unwrap_or_default();
        let role = self
            .get_text_prop(id, self.atoms.WM_WINDOW_ROLE)
            .unwrap_or_default();
        let transient_for = self.get_window_prop(id, AtomEnum::WM_TRANSIENT_FOR.into());
        let leader = self.get_window_prop(id, self.atoms.WM_CLIENT_LEADER);
        let opacity_prop = self
            .get_u32_prop(id, self.atoms._NET_WM_WINDOW_OPACITY)
            .map(|raw| ((raw as u64 * 255) / u32::MAX as u64) as u16);
        let shadow_hint = self
            .get_u32_prop(id, self.atoms._PENUMBRA_SHADOW)
            .map(|v| v != 0);
        let window_type = self.get_window_type(id);
        let client = self.find_client_window(id, MAX_LEADER_DEPTH);

        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        w.name = name;
        w.class = class;
        w.role = role;
        w.transient_for = transient_for;
        w.leader = leader;
        w.opacity_prop = opacity_prop;
        w.shadow_hint = shadow_hint;
        w.window_type = window_type;
        w.client = client;
        if w.refresh_policy(&self.config) {
            // A policy flip repaints even when the opacity target did
            // not move (shadow toggles, invert toggles).
            self.fade.retarget(&mut self.registry, id, &self.config);
            self.damage_window_extents(id);
        }
    }

    fn get_window_type(&self, id: u32) -> WindowType {
        let Some(atom) = self.get_atom_prop(id, self.atoms._NET_WM_WINDOW_TYPE) else {
            return WindowType::Unknown;
        };
        let a = &self.atoms;
        match atom {
            x if x == a._NET_WM_WINDOW_TYPE_NORMAL => WindowType::Normal,
            x if x == a._NET_WM_WINDOW_TYPE_DOCK => WindowType::Dock,
            x if x == a._NET_WM_WINDOW_TYPE_TOOLBAR => WindowType::Toolbar,
            x if x == a._NET_WM_WINDOW_TYPE_MENU => WindowType::Menu,
            x if x == a._NET_WM_WINDOW_TYPE_UTILITY => WindowType::Utility,
            x if x == a._NET_WM_WINDOW_TYPE_SPLASH => WindowType::Splash,
            x if x == a._NET_WM_WINDOW_TYPE_DIALOG => WindowType::Dialog,
            x if x == a._NET_WM_WINDOW_TYPE_DROPDOWN_MENU => WindowType::DropdownMenu,
            x if x == a._NET_WM_WINDOW_TYPE_POPUP_MENU => WindowType::PopupMenu,
            x if x == a._NET_WM_WINDOW_TYPE_TOOLTIP => WindowType::Tooltip,
            x if x == a._NET_WM_WINDOW_TYPE_NOTIFICATION => WindowType::Notification,
            x if x == a._NET_WM_WINDOW_TYPE_COMBO => WindowType::Combo,
            x if x == a._NET_WM_WINDOW_TYPE_DND => WindowType::Dnd,
            x if x == a._NET_WM_WINDOW_TYPE_DESKTOP => WindowType::Desktop,
            _ => WindowType::Unknown,
        }
    }

    /// The WM client subwindow: the descendant carrying WM_STATE, with
    /// a bounded depth-first search.
    fn find_client_window(&self, win: u32, depth: usize) -> Option<u32> {
        if self.get_u32_prop(win, self.atoms.WM_STATE).is_some() {
            return Some(win);
        }
        if depth == 0 {
            return None;
        }
        let tree = self.conn.query_tree(win).ok()?.reply().ok()?;
        tree.children
            .into_iter()
            .find_map(|child| self.find_client_window(child, depth - 1))
    }

    pub(crate) fn get_text_prop(&self, win: u32, atom: u32) -> Option<String> {
        let reply = self
            .conn
            .get_property(false, win, atom, AtomEnum::ANY, 0, u32::MAX)
            .ok()?
            .reply()
            .ok()?;
        if reply.value.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&reply.value).into_owned())
    }

    pub(crate) fn get_u32_prop(&self, win: u32, atom: u32) -> Option<u32> {
        let reply = self
            .conn
            .get_property(false, win, atom, AtomEnum::ANY, 0, 1)
            .ok()?
            .reply()
            .ok()?;
        let first = reply.value32().and_then(|mut values| values.next());
        first
    }

    pub(crate) fn get_atom_prop(&self, win: u32, atom: u32) -> Option<u32> {
        self.get_u32_prop(win, atom)
    }

    pub(crate) fn get_window_prop(&self, win: u32, atom: u32) -> Option<u32> {
        self.get_u32_prop(win, atom).filter(|&w| w != 0)
    }

    /// Track the EWMH active window and propagate focus, damaging
    /// every window whose focus state flipped.
    pub(crate) fn set_active_window(&mut self, active: Option<u32>) {
        self.active_win = active;
        let flipped = self.registry.update_focus(active, &self.config);
        for id in flipped {
            if let Some(w) = self.registry.find_mut(id) {
                if w.refresh_policy(&self.config) {
                    self.fade.retarget(&mut self.registry, id, &self.config);
                    self.damage_window_extents(id);
                }
            }
        }
    }

    /// Desktop background pixmap, painted beneath all windows.
    pub(crate) fn refresh_root_tile(&mut self) -> Result<()> {
        let pixmap = self
            .get_u32_prop(self.root, self.atoms._XROOTPMAP_ID)
            .or_else(|| self.get_u32_prop(self.root, self.atoms._XSETROOT_ID))
            .filter(|&p| p != 0);
        self.backend.set_root_pixmap(&self.conn, pixmap)?;
        self.board.damage_whole_screen();
        Ok(())
    }

    pub(crate) fn handle_root_resize(&mut self, width: u16, height: u16) -> Result<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        info!("root resized to {}x{}", width, height);
        self.width = width;
        self.height = height;
        self.board.resize(width, height);
        self.backend.resize(&self.conn, width, height)?;
        Ok(())
    }

    /// Advance fades, damage stepped windows, finalize settled
    /// unmaps/destroys.
    pub(crate) fn fade_tick(&mut self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let stepped = self.fade.tick(now_ms, &mut self.registry, &self.config);
        for id in stepped {
            self.damage_window_extents(id);
            self.finalize_if_settled(id);
        }
    }

    /// An unmapping window whose fade-out settled releases its pixmap
    /// and surface; destruction itself is finalized by `reap` at paint
    /// time.
    pub(crate) fn finalize_if_settled(&mut self, id: u32) {
        let Some(w) = self.registry.find(id) else {
            return;
        };
        if w.opacity != 0 || w.state != WinState::Unmapping || w.destroy_pending {
            return;
        }
        if let Some(w) = self.registry.find_mut(id) {
            w.state = WinState::Unmapped;
        }
        self.release_window_resources(id);
    }

    pub(crate) fn release_window_resources(&mut self, id: u32) {
        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        self.backend.release_window(&self.conn, w, &mut self.ignore);
        if let Some(pixmap) = w.pixmap.take() {
            if let Ok(cookie) = self.conn.free_pixmap(pixmap) {
                self.ignore.expect(cookie.sequence_number());
            }
        }
    }

    /// Free every destroy-settled record and its server resources.
    fn reap_destroyed(&mut self) {
        let freed = self.registry.reap(self.config.fade.enabled);
        for mut w in freed {
            self.backend
                .release_window(&self.conn, &mut w, &mut self.ignore);
            if let Some(pixmap) = w.pixmap {
                if let Ok(cookie) = self.conn.free_pixmap(pixmap) {
                    self.ignore.expect(cookie.sequence_number());
                }
            }
            if let Some(damage_id) = w.damage {
                if let Ok(cookie) = self.conn.damage_destroy(damage_id) {
                    self.ignore.expect(cookie.sequence_number());
                }
            }
            self.fade.forget(w.id);
            trace!("reaped window {:#x}", w.id);
        }
    }

    /// Paint exactly one frame covering all pending damage (plus the
    /// stale region for aged buffers). Failed frames keep their damage
    /// for retry.
    pub(crate) fn paint_frame(&mut self, now: Instant) -> Result<()> {
        self.reap_destroyed();
        if self.paused || !self.redirected {
            // Nothing is composited; the server draws directly.
            let _ = self.board.begin_frame();
            return Ok(());
        }

        // Windows whose geometry changed need a fresh named pixmap
        // before they can be drawn.
        let rebind: Vec<u32> = self
            .registry
            .iter()
            .filter(|w| {
                w.state == WinState::Mapped
                    && !w.bind_failed
                    && (w.pixmap.is_none() || w.dirty.contains(crate::registry::Dirty::GEOMETRY))
            })
            .map(|w| w.id)
            .collect();
        for id in rebind {
            self.rebind_pixmap(id);
            if let Some(w) = self.registry.find_mut(id) {
                w.dirty = crate::registry::Dirty::empty();
            }
        }

        let mut region = self.board.begin_frame();
        let age = self.backend.buffer_age();
        if age != 1 {
            match self.pacer.stale_region(age, &self.board) {
                Some(stale) => region.union_with(&stale),
                // Unusable age: everything in the buffer is suspect.
                None => region.add_rect(self.board.screen_bounds()),
            }
        }
        region.clip_to(&self.board.screen_bounds());
        if region.is_empty() {
            return Ok(());
        }

        let order = self.registry.stacking_order().to_vec();
        let result = self.backend.paint(
            &self.conn,
            &mut self.registry,
            &order,
            &region,
            &self.shadow,
            &self.config,
            &mut self.ignore,
        );
        match result {
            Ok(()) => {
                self.board.commit(region);
                self.pacer.frame_presented(now);
            }
            Err(e) => {
                warn!("frame failed, retrying next cycle: {:#}", e);
                self.board.restore(region);
            }
        }
        Ok(())
    }

    /// A single opaque fullscreen window on top means compositing adds
    /// nothing but latency; after the configured delay the screen is
    /// unredirected until the condition breaks.
    pub(crate) fn evaluate_unredirection(&mut self, now: Instant) {
        if !self.config.unredirect.enabled || self.redirect_force != Force::Default {
            return;
        }
        let qualifies = self.topmost_fullscreen_opaque();
        if qualifies && self.redirected {
            self.unredirect_pending = true;
            self.timers.arm_unredirect(
                true,
                now,
                std::time::Duration::from_millis(self.config.unredirect.delay_ms),
            );
        } else if !qualifies {
            self.unredirect_pending = false;
            self.timers.arm_unredirect(false, now, std::time::Duration::ZERO);
            if !self.redirected {
                if let Err(e) = self.redirect_screen() {
                    warn!("re-redirecting failed: {:#}", e);
                }
            }
        }
    }

    fn topmost_fullscreen_opaque(&self) -> bool {
        let screen = Rect::from_xywh(0, 0, self.width as u32, self.height as u32);
        for &id in self.registry.stacking_order().iter().rev() {
            let Some(w) = self.registry.find(id) else {
                continue;
            };
            if !w.is_visible() {
                continue;
            }
            return w.mode == PaintMode::Opaque && w.bounds().contains(&screen);
        }
        false
    }

    pub(crate) fn apply_unredirection(&mut self) {
        if !self.unredirect_pending || !self.redirected {
            return;
        }
        self.unredirect_pending = false;
        if let Err(e) = self.unredirect_screen() {
            warn!("unredirecting failed: {:#}", e);
        }
    }

    fn unredirect_screen(&mut self) -> Result<()> {
        self.conn
            .composite_unredirect_subwindows(self.root, Redirect::MANUAL)?;
        self.conn.flush()?;
        self.redirected = false;
        info!("screen unredirected");
        Ok(())
    }

    fn redirect_screen(&mut self) -> Result<()> {
        self.conn
            .composite_redirect_subwindows(self.root, Redirect::MANUAL)?;
        self.conn.flush()?;
        self.redirected = true;
        self.board.damage_whole_screen();
        // Named pixmaps were invalidated while unredirected.
        let ids: Vec<u32> = self.registry.iter().map(|w| w.id).collect();
        for id in ids {
            if let Some(w) = self.registry.find_mut(id) {
                w.bind_failed = false;
                w.dirty |= crate::registry::Dirty::GEOMETRY;
            }
        }
        info!("screen redirected");
        Ok(())
    }

    // Control-plane setters. Transport lives outside the core; these
    // are the operations it invokes.

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if !paused {
            self.board.damage_whole_screen();
        }
        info!("painting {}", if paused { "paused" } else { "resumed" });
    }

    pub fn set_redirected_force(&mut self, force: Force) -> Result<()> {
        self.redirect_force = force;
        let want = force.apply(true);
        if want && !self.redirected {
            self.redirect_screen()?;
        } else if !want && self.redirected {
            self.unredirect_screen()?;
        }
        Ok(())
    }

    pub fn set_shadow_force(&mut self, id: u32, force: Force) {
        self.set_window_force(id, |w| w.shadow_force = force);
    }

    pub fn set_fade_force(&mut self, id: u32, force: Force) {
        self.set_window_force(id, |w| w.fade_force = force);
    }

    pub fn set_invert_force(&mut self, id: u32, force: Force) {
        self.set_window_force(id, |w| w.invert_force = force);
    }

    pub fn set_focus_force(&mut self, id: u32, force: Force) {
        self.set_window_force(id, |w| w.focus_force = force);
    }

    fn set_window_force<F>(&mut self, id: u32, apply: F)
    where
        F: FnOnce(&mut crate::registry::WindowRecord),
    {
        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        apply(w);
        if w.refresh_policy(&self.config) {
            self.fade.retarget(&mut self.registry, id, &self.config);
            self.damage_window_extents(id);
        }
    }

    /// Run every due timer, then re-evaluate arm predicates.
    pub fn run_timers(&mut self, now: Instant) -> Result<()> {
        if self.timers.fade_due(now) {
            self.fade_tick();
            self.timers.fade_fired(now, self.config.fade.delta());
        }
        if self.timers.unredirect_due(now) {
            self.apply_unredirection();
            self.timers.unredirect_fired();
        }
        if self.timers.repaint_due(now) {
            self.paint_frame(now)?;
            self.timers.repaint_fired();
        }
        self.evaluate_unredirection(now);
        self.timers
            .arm_fade(self.fade.is_active(), now, self.config.fade.delta());
        let want_paint = self.board.has_pending() && !self.paused && self.redirected;
        self.timers
            .arm_repaint(want_paint, self.pacer.paint_deadline(now));
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }
}

fn check_extensions(conn: &RustConnection) -> Result<()> {
    for (name, label) in [
        (x11rb::protocol::composite::X11_EXTENSION_NAME, "Composite"),
        (damage::X11_EXTENSION_NAME, "Damage"),
        (xfixes::X11_EXTENSION_NAME, "XFixes"),
        (render::X11_EXTENSION_NAME, "Render"),
        (shape::X11_EXTENSION_NAME, "Shape"),
    ] {
        if conn.extension_information(name)?.is_none() {
            return Err(CoreError::MissingExtension(label).into());
        }
    }
    Ok(())
}

/// Own the _NET_WM_CM_Sn manager selection. Exactly one compositing
/// manager may hold it per screen.
fn acquire_cm_selection(conn: &RustConnection, screen_num: usize, root: u32) -> Result<u32> {
    let name = format!("_NET_WM_CM_S{}", screen_num);
    let atom = conn.intern_atom(false, name.as_bytes())?.reply()?.atom;
    let owner = conn.get_selection_owner(atom)?.reply()?.owner;
    if owner != x11rb::NONE {
        return Err(CoreError::ScreenOwned(screen_num).into());
    }
    let win = conn.generate_id()?;
    conn.create_window(
        x11rb::COPY_DEPTH_FROM_PARENT,
        win,
        root,
        -1,
        -1,
        1,
        1,
        0,
        WindowClass::INPUT_ONLY,
        x11rb::COPY_FROM_PARENT,
        &CreateWindowAux::new(),
    )?;
    conn.set_selection_owner(win, atom, x11rb::CURRENT_TIME)?;
    let owner = conn.get_selection_owner(atom)?.reply()?.owner;
    if owner != win {
        return Err(CoreError::ScreenOwned(screen_num).into());
    }
    Ok(win)
}
