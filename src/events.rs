//! X event dispatch: every server notification becomes a registry or
//! damage mutation here. Nothing paints from this module; the driver
//! paints once after the whole burst is drained.

use tracing::{debug, trace};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt};
use x11rb::protocol::xproto::{
    CirculateNotifyEvent, ConfigureNotifyEvent, ConnectionExt as XprotoExt, Place,
    PropertyNotifyEvent,
};
use x11rb::protocol::Event;

use crate::geometry::Rect;
use crate::registry::Dirty;
use crate::session::Session;

/// A bounding shape rect within this many pixels of the full window
/// still counts as "rectangle with rounded corners".
const ROUNDED_PIXELS: u32 = 10;

impl Session {
    pub fn dispatch_event(&mut self, event: Event) {
        match event {
            Event::CreateNotify(e) => {
                if e.parent == self.root {
                    if let Err(err) = self.track_window(e.window) {
                        debug!("cannot track new window {:#x}: {:#}", e.window, err);
                    }
                }
            }
            Event::DestroyNotify(e) => {
                self.damage_window_extents(e.window);
                self.registry.on_destroy_notify(e.window);
                self.fade
                    .retarget_openclose(&mut self.registry, e.window, &self.config);
            }
            Event::MapNotify(e) => {
                if self.registry.find(e.window).is_some() {
                    if let Err(err) = self.window_mapped(e.window) {
                        debug!("map handling for {:#x} failed: {:#}", e.window, err);
                    }
                } else if let Err(err) = self.track_window(e.window) {
                    debug!("cannot track mapped window {:#x}: {:#}", e.window, err);
                }
            }
            Event::UnmapNotify(e) => self.on_unmap(e.window),
            Event::ConfigureNotify(e) => self.on_configure(e),
            Event::ReparentNotify(e) => {
                if e.parent == self.root {
                    if let Err(err) = self.track_window(e.window) {
                        debug!("cannot track reparented window {:#x}: {:#}", e.window, err);
                    }
                } else if self.registry.find(e.window).is_some() {
                    // Reparented away from the root: no longer a
                    // toplevel we composite.
                    self.damage_window_extents(e.window);
                    self.registry.on_destroy_notify(e.window);
                    self.fade
                        .retarget_openclose(&mut self.registry, e.window, &self.config);
                }
            }
            Event::CirculateNotify(e) => self.on_circulate(e),
            Event::Expose(e) => {
                if e.window == self.root || e.window == self.overlay {
                    self.board.add_rect(Rect::from_xywh(
                        e.x as i32,
                        e.y as i32,
                        e.width as u32,
                        e.height as u32,
                    ));
                }
            }
            Event::PropertyNotify(e) => self.on_property(e),
            Event::FocusIn(e) => {
                if !self.config.focus.use_ewmh_active_win {
                    let id = self
                        .registry
                        .resolve_toplevel(e.event, |w| self.query_parent(w))
                        .map(|w| w.id);
                    if id.is_some() {
                        self.set_active_window(id);
                    }
                }
            }
            Event::FocusOut(e) => {
                if !self.config.focus.use_ewmh_active_win && self.active_win == Some(e.event) {
                    self.set_active_window(None);
                }
            }
            Event::DamageNotify(e) => self.on_damage(e),
            Event::ShapeNotify(e) => self.on_shape(e),
            Event::RandrScreenChangeNotify(e) => {
                if let Err(err) = self.handle_root_resize(e.width, e.height) {
                    debug!("screen change handling failed: {:#}", err);
                }
            }
            Event::Error(e) => {
                if !self.ignore.should_ignore(e.sequence as u64) {
                    debug!(
                        "X error: code={} seq={} major={} minor={} resource={:#x}",
                        e.error_code, e.sequence, e.major_opcode, e.minor_opcode, e.bad_value
                    );
                }
            }
            other => trace!("unhandled event: {:?}", other),
        }
    }

    fn on_unmap(&mut self, id: u32) {
        let Some(w) = self.registry.find_mut(id) else {
            return;
        };
        if w.state != crate::registry::WinState::Mapped {
            return;
        }
        w.state = crate::registry::WinState::Unmapping;
        w.refresh_policy(&self.config);
        self.damage_window_extents(id);
        self.fade
            .retarget_openclose(&mut self.registry, id, &self.config);
        self.finalize_if_settled(id);
    }

    fn on_configure(&mut self, e: ConfigureNotifyEvent) {
        if e.window == self.root {
            if let Err(err) = self.handle_root_resize(e.width, e.height) {
                debug!("root resize handling failed: {:#}", err);
            }
            return;
        }
        let Some(w) = self.registry.find(e.window) else {
            return;
        };
        let old_extents = w.paint_extents(&self.config.shadow);
        let resized = w.width != e.width as u32
            || w.height != e.height as u32
            || w.border_width != e.border_width as u32;
        let Some(w) = self.registry.find_mut(e.window) else {
            return;
        };
        w.x = e.x as i32;
        w.y = e.y as i32;
        w.width = e.width as u32;
        w.height = e.height as u32;
        w.border_width = e.border_width as u32;
        w.override_redirect = e.override_redirect;
        if resized {
            // The named pixmap no longer matches the window.
            w.dirty |= Dirty::GEOMETRY;
            w.bind_failed = false;
        }
        let above = (e.above_sibling != x11rb::NONE).then_some(e.above_sibling);
        self.registry.restack(e.window, above);
        self.board.add_rect(old_extents);
        self.damage_window_extents(e.window);
    }

    fn on_circulate(&mut self, e: CirculateNotifyEvent) {
        if self.registry.find(e.window).is_none() {
            return;
        }
        if e.place == Place::ON_TOP {
            self.registry.raise_to_top(e.window);
        } else {
            self.registry.restack(e.window, None);
        }
        self.damage_window_extents(e.window);
    }

    fn on_property(&mut self, e: PropertyNotifyEvent) {
        let a = &self.atoms;
        if e.window == self.root {
            if e.atom == a._NET_ACTIVE_WINDOW && self.config.focus.use_ewmh_active_win {
                let active = self.get_window_prop(self.root, self.atoms._NET_ACTIVE_WINDOW);
                self.set_active_window(active);
            } else if e.atom == a._XROOTPMAP_ID || e.atom == a._XSETROOT_ID {
                if let Err(err) = self.refresh_root_tile() {
                    debug!("root tile refresh failed: {:#}", err);
                }
            }
            return;
        }

        let tracked = e.atom == a.WM_NAME
            || e.atom == a._NET_WM_NAME
            || e.atom == a.WM_CLASS
            || e.atom == a.WM_WINDOW_ROLE
            || e.atom == a.WM_TRANSIENT_FOR
            || e.atom == a.WM_CLIENT_LEADER
            || e.atom == a.WM_STATE
            || e.atom == a._NET_WM_WINDOW_OPACITY
            || e.atom == a._NET_WM_WINDOW_TYPE
            || e.atom == a._PENUMBRA_SHADOW;
        if !tracked {
            return;
        }
        // The notification may arrive on the client subwindow, or even
        // deeper; walk ancestors until a tracked toplevel is found.
        let Some(id) = self
            .registry
            .resolve_toplevel(e.window, |w| self.query_parent(w))
            .map(|w| w.id)
        else {
            return;
        };
        if let Some(w) = self.registry.find_mut(id) {
            w.dirty |= Dirty::PROPS;
        }
        self.refresh_window_props(id);
    }

    fn on_damage(&mut self, e: damage::NotifyEvent) {
        // Acknowledge regardless of tracking state, or the damage
        // object keeps firing.
        if let Ok(cookie) = self.conn.damage_subtract(e.damage, x11rb::NONE, x11rb::NONE) {
            self.ignore.expect(cookie.sequence_number());
        }
        let Some(w) = self.registry.find_mut(e.drawable) else {
            return;
        };
        let rect = Rect::from_xywh(
            w.x + e.area.x as i32,
            w.y + e.area.y as i32,
            e.area.width as u32,
            e.area.height as u32,
        );
        w.dirty |= Dirty::CONTENT;
        self.board.add_rect(rect);
    }

    fn on_shape(&mut self, e: shape::NotifyEvent) {
        if e.shape_kind != shape::SK::BOUNDING {
            return;
        }
        let Some(w) = self.registry.find_mut(e.affected_window) else {
            return;
        };
        w.bounding_shaped = e.shaped;
        w.dirty |= Dirty::SHAPE;
        self.detect_rounded_corners(e.affected_window);
        let changed = match self.registry.find_mut(e.affected_window) {
            Some(w) => w.refresh_policy(&self.config),
            None => false,
        };
        if changed {
            self.fade
                .retarget(&mut self.registry, e.affected_window, &self.config);
        }
        self.damage_window_extents(e.affected_window);
    }

    fn query_parent(&self, win: u32) -> Option<u32> {
        let reply = self.conn.query_tree(win).ok()?.reply().ok()?;
        (reply.parent != x11rb::NONE).then_some(reply.parent)
    }

    /// A shaped window whose bounding region still covers almost the
    /// whole rectangle is treated as a rectangle with rounded corners.
    fn detect_rounded_corners(&mut self, id: u32) {
        let Some(w) = self.registry.find(id) else {
            return;
        };
        if !w.bounding_shaped {
            if let Some(w) = self.registry.find_mut(id) {
                w.rounded_corners = false;
            }
            return;
        }
        let (ww, wh) = (w.width, w.height);
        let rounded = self
            .conn
            .shape_get_rectangles(id, shape::SK::BOUNDING)
            .ok()
            .and_then(|c| c.reply().ok())
            .map(|reply| {
                let tw = ww.saturating_sub((ww / 20).max(ROUNDED_PIXELS));
                let th = wh.saturating_sub((wh / 20).max(ROUNDED_PIXELS));
                reply
                    .rectangles
                    .iter()
                    .any(|r| r.width as u32 >= tw && r.height as u32 >= th)
            })
            .unwrap_or(false);
        if let Some(w) = self.registry.find_mut(id) {
            w.rounded_corners = rounded;
        }
    }
}
