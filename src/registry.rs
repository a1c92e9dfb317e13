//! Window registry: one record per live window, arena-allocated.
//!
//! The registry exclusively owns all window records. Slots are reused
//! through a free list; freeing one window never invalidates another
//! window's slot index. Stacking order is tracked bottom-to-top, the
//! order the backends composite in.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::backend::SurfaceHandle;
use crate::config::{self, Config, OPAQUE};
use crate::geometry::Rect;

/// Parent/leader walks give up after this many hops. Malformed or
/// cyclic client hierarchies then resolve to "no leader found".
pub const MAX_LEADER_DEPTH: usize = 8;

bitflags! {
    /// What changed since the last paint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dirty: u8 {
        const GEOMETRY = 1 << 0;
        const CONTENT  = 1 << 1;
        const SHAPE    = 1 << 2;
        const PROPS    = 1 << 3;
    }
}

/// Window lifecycle. `Destroyed` is terminal; the record is freed once
/// it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinState {
    Unmapped,
    Mapped,
    /// Unmap seen, fade-out (if any) still running.
    Unmapping,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintMode {
    /// Fully opaque; can be drawn without blending.
    Opaque,
    /// Translucent or ARGB; needs alpha blending.
    Blended,
}

/// EWMH window types we distinguish for policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Normal,
    Dock,
    Toolbar,
    Menu,
    Utility,
    Splash,
    Dialog,
    DropdownMenu,
    PopupMenu,
    Tooltip,
    Notification,
    Combo,
    Dnd,
    Desktop,
    Unknown,
}

/// Tri-state override used by the control-plane setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
    #[default]
    Default,
    On,
    Off,
}

impl Force {
    pub fn apply(self, default: bool) -> bool {
        match self {
            Force::Default => default,
            Force::On => true,
            Force::Off => false,
        }
    }
}

/// Everything the compositor tracks about one top-level window.
#[derive(Debug)]
pub struct WindowRecord {
    pub id: u32,
    /// The WM-level client subwindow inside a decorating frame, if
    /// distinct from `id`.
    pub client: Option<u32>,
    pub parent: u32,
    /// Group leader (WM_CLIENT_LEADER), when tracked.
    pub leader: Option<u32>,
    pub transient_for: Option<u32>,

    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,

    pub state: WinState,
    /// Destroy-notify received; teardown completes when the fade-out
    /// settles.
    pub destroy_pending: bool,
    pub override_redirect: bool,

    pub opacity: u16,
    pub opacity_target: u16,
    /// Explicit _NET_WM_WINDOW_OPACITY override, scaled to 0..=255.
    pub opacity_prop: Option<u16>,

    pub mode: PaintMode,
    pub argb: bool,
    pub depth: u8,

    pub shadow: bool,
    pub blur: bool,
    pub invert_color: bool,
    pub dim: bool,
    pub focused: bool,

    pub shadow_force: Force,
    pub fade_force: Force,
    pub invert_force: Force,
    pub focus_force: Force,

    pub bounding_shaped: bool,
    pub rounded_corners: bool,
    /// _PENUMBRA_SHADOW property: explicit per-window shadow hint.
    pub shadow_hint: Option<bool>,

    pub name: String,
    pub class: String,
    pub role: String,
    pub window_type: WindowType,

    /// Server-side damage object for this window, if created.
    pub damage: Option<u32>,
    /// Named backing-store pixmap, refreshed on geometry change.
    pub pixmap: Option<u32>,
    /// Backend-owned render resource. Opaque here; only the backend
    /// that minted it can interpret it.
    pub surface: Option<SurfaceHandle>,
    /// Latched after a pixmap bind failure so we stop retrying every
    /// frame. Cleared on geometry change.
    pub bind_failed: bool,

    pub dirty: Dirty,
}

impl WindowRecord {
    fn new(id: u32, parent: u32, attrs: InitialAttrs) -> Self {
        Self {
            id,
            client: None,
            parent,
            leader: None,
            transient_for: None,
            x: attrs.x,
            y: attrs.y,
            width: attrs.width,
            height: attrs.height,
            border_width: attrs.border_width,
            state: if attrs.mapped { WinState::Mapped } else { WinState::Unmapped },
            destroy_pending: false,
            override_redirect: attrs.override_redirect,
            opacity: 0,
            opacity_target: OPAQUE,
            opacity_prop: None,
            mode: PaintMode::Opaque,
            argb: attrs.depth == 32,
            depth: attrs.depth,
            shadow: false,
            blur: false,
            invert_color: false,
            dim: false,
            focused: false,
            shadow_force: Force::Default,
            fade_force: Force::Default,
            invert_force: Force::Default,
            focus_force: Force::Default,
            bounding_shaped: false,
            rounded_corners: false,
            shadow_hint: None,
            name: String::new(),
            class: String::new(),
            role: String::new(),
            window_type: WindowType::Unknown,
            damage: None,
            pixmap: None,
            surface: None,
            bind_failed: false,
            dirty: Dirty::GEOMETRY | Dirty::CONTENT,
        }
    }

    /// Window bounds including the X border.
    pub fn bounds(&self) -> Rect {
        let b = self.border_width as i32;
        Rect::from_xywh(
            self.x,
            self.y,
            self.width + 2 * b as u32,
            self.height + 2 * b as u32,
        )
    }

    /// Bounds expanded by the shadow, when this window casts one.
    /// This is the full extent that must be damaged when the window
    /// appears, moves, or disappears.
    pub fn paint_extents(&self, shadow: &config::ShadowConfig) -> Rect {
        let bounds = self.bounds();
        if !self.shadow {
            return bounds;
        }
        let grow = 2 * shadow.radius;
        let shadow_rect = Rect::from_xywh(
            bounds.x1 + shadow.offset_x,
            bounds.y1 + shadow.offset_y,
            (bounds.width() + grow).max(0) as u32,
            (bounds.height() + grow).max(0) as u32,
        );
        let mut ext = bounds;
        ext.x1 = ext.x1.min(shadow_rect.x1);
        ext.y1 = ext.y1.min(shadow_rect.y1);
        ext.x2 = ext.x2.max(shadow_rect.x2);
        ext.y2 = ext.y2.max(shadow_rect.y2);
        ext
    }

    pub fn is_visible(&self) -> bool {
        matches!(self.state, WinState::Mapped | WinState::Unmapping) && self.opacity > 0
    }

    /// Recompute paint mode from opacity and pixel format.
    pub fn update_mode(&mut self) {
        self.mode = if self.opacity < OPAQUE || self.argb {
            PaintMode::Blended
        } else {
            PaintMode::Opaque
        };
    }

    /// Recompute shadow/blur/invert eligibility and the opacity target
    /// from config policy plus per-window state. Returns true when any
    /// visible attribute changed.
    pub fn refresh_policy(&mut self, config: &Config) -> bool {
        let shadow_default = config.shadow.enabled
            && !matches!(
                self.window_type,
                WindowType::Dock | WindowType::Dnd | WindowType::Desktop
            )
            && self.shadow_hint != Some(false)
            && !(config.shadow.ignore_shaped
                && self.bounding_shaped
                && !(config.shadow.detect_rounded_corners && self.rounded_corners))
            && !config::any_match(&config.shadow.exclude, &self.name, &self.class, &self.role);
        let shadow = self.shadow_force.apply(shadow_default || self.shadow_hint == Some(true));

        let blur = config.blur.enabled
            && !config::any_match(&config.blur.exclude, &self.name, &self.class, &self.role);

        let invert = self.invert_force.apply(config::any_match(
            &config.invert_color,
            &self.name,
            &self.class,
            &self.role,
        ));

        let focused = self.focus_force.apply(
            self.focused
                || config::any_match(
                    &config.focus.focus_exclude,
                    &self.name,
                    &self.class,
                    &self.role,
                ),
        );

        let dim = config.opacity.inactive_dim > 0.0 && !focused;

        let target = self.policy_opacity(config, focused);

        let changed = shadow != self.shadow
            || blur != self.blur
            || invert != self.invert_color
            || dim != self.dim
            || target != self.opacity_target;
        self.shadow = shadow;
        self.blur = blur;
        self.invert_color = invert;
        self.dim = dim;
        self.opacity_target = target;
        changed
    }

    /// Opacity policy: explicit per-window override, else first
    /// matching rule, else the active/inactive default.
    fn policy_opacity(&self, config: &Config, focused: bool) -> u16 {
        if self.state == WinState::Unmapping || self.destroy_pending {
            return 0;
        }
        if let Some(explicit) = self.opacity_prop {
            if !(config.opacity.inactive_override && !focused) {
                return explicit;
            }
        }
        for rule in &config.opacity.rules {
            if rule.rule.matches(&self.name, &self.class, &self.role) {
                return config::opacity_fixed(rule.opacity);
            }
        }
        if focused {
            config::opacity_fixed(config.opacity.active)
        } else {
            config::opacity_fixed(config.opacity.inactive)
        }
    }

    /// Whether fading applies to this window under `config` policy.
    pub fn fade_allowed(&self, config: &Config) -> bool {
        let default = config.fade.enabled
            && !config::any_match(&config.fade.exclude, &self.name, &self.class, &self.role);
        self.fade_force.apply(default)
    }
}

/// Geometry and format of a window at first observation.
#[derive(Debug, Clone, Copy)]
pub struct InitialAttrs {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    pub depth: u8,
    pub mapped: bool,
    pub override_redirect: bool,
}

#[derive(Debug, Default)]
pub struct WindowRegistry {
    slots: Vec<Option<WindowRecord>>,
    free: Vec<usize>,
    by_id: HashMap<u32, usize>,
    /// Window ids bottom-to-top; compositing order.
    stacking: Vec<u32>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Create a record for a newly observed window. Re-observing a
    /// live id is a no-op returning the existing record, so at most
    /// one live record exists per window id.
    pub fn observe(&mut self, id: u32, parent: u32, attrs: InitialAttrs) -> &mut WindowRecord {
        if let Some(&slot) = self.by_id.get(&id) {
            return self.slots[slot].as_mut().expect("live slot");
        }
        let record = WindowRecord::new(id, parent, attrs);
        let slot = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(record);
                idx
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);
        self.stacking.push(id);
        self.slots[slot].as_mut().expect("just inserted")
    }

    pub fn find(&self, id: u32) -> Option<&WindowRecord> {
        self.by_id.get(&id).and_then(|&s| self.slots[s].as_ref())
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut WindowRecord> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_mut()
    }

    /// Find the toplevel record owning `client` as its WM client
    /// subwindow.
    pub fn find_by_client(&self, client: u32) -> Option<&WindowRecord> {
        self.iter().find(|w| w.client == Some(client))
    }

    /// Resolve an arbitrary window id to a tracked toplevel: the id
    /// itself, a record's client, or an ancestor found by walking
    /// `parent_of`. The walk stops after [`MAX_LEADER_DEPTH`] hops.
    pub fn resolve_toplevel<F>(&self, id: u32, parent_of: F) -> Option<&WindowRecord>
    where
        F: Fn(u32) -> Option<u32>,
    {
        let mut cur = id;
        for _ in 0..MAX_LEADER_DEPTH {
            if let Some(w) = self.find(cur) {
                return Some(w);
            }
            if let Some(w) = self.find_by_client(cur) {
                return Some(w);
            }
            cur = parent_of(cur)?;
        }
        None
    }

    /// Follow a window's leader chain to its root leader. Cycles and
    /// over-deep chains resolve to the last id reached inside the cap.
    pub fn root_leader(&self, id: u32) -> u32 {
        let mut cur = id;
        for _ in 0..MAX_LEADER_DEPTH {
            let next = match self.find(cur).and_then(|w| w.leader) {
                Some(l) if l != cur => l,
                _ => break,
            };
            cur = next;
        }
        cur
    }

    /// All live records, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &WindowRecord> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Live window ids bottom-to-top.
    pub fn stacking_order(&self) -> &[u32] {
        &self.stacking
    }

    /// Restack `id` directly above `sibling` (or to the bottom when
    /// `sibling` is `None`), mirroring ConfigureNotify semantics.
    pub fn restack(&mut self, id: u32, above_sibling: Option<u32>) {
        let Some(pos) = self.stacking.iter().position(|&w| w == id) else {
            return;
        };
        self.stacking.remove(pos);
        let insert_at = match above_sibling {
            Some(sib) => self
                .stacking
                .iter()
                .position(|&w| w == sib)
                .map(|p| p + 1)
                .unwrap_or(self.stacking.len()),
            None => 0,
        };
        self.stacking.insert(insert_at, id);
    }

    pub fn raise_to_top(&mut self, id: u32) {
        if let Some(pos) = self.stacking.iter().position(|&w| w == id) {
            self.stacking.remove(pos);
            self.stacking.push(id);
        }
    }

    /// Mark a destroy notification. The record is only freed once any
    /// running fade-out settles; `reap` does the actual freeing.
    pub fn on_destroy_notify(&mut self, id: u32) {
        if let Some(w) = self.find_mut(id) {
            w.destroy_pending = true;
            w.opacity_target = 0;
        }
    }

    /// Free every record whose destruction has fully settled: destroy
    /// seen and opacity at zero (or fading not applicable). Returns the
    /// freed records so the caller can release their server resources.
    pub fn reap(&mut self, fading: bool) -> Vec<WindowRecord> {
        let ready: Vec<u32> = self
            .iter()
            .filter(|w| w.destroy_pending && (!fading || w.opacity == 0))
            .map(|w| w.id)
            .collect();
        let mut freed = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(slot) = self.by_id.remove(&id) {
                if let Some(mut w) = self.slots[slot].take() {
                    w.state = WinState::Destroyed;
                    freed.push(w);
                }
                self.free.push(slot);
            }
            self.stacking.retain(|&w| w != id);
        }
        freed
    }

    /// Propagate focus: `active` (and every window sharing its root
    /// leader or transient ancestry, per config) is focused, everything
    /// else is not. Returns ids whose focus flag flipped.
    pub fn update_focus(&mut self, active: Option<u32>, config: &Config) -> Vec<u32> {
        let active_leader = active.map(|id| self.root_leader(id));
        let related: Vec<(u32, bool)> = self
            .iter()
            .map(|w| {
                let mut f = Some(w.id) == active;
                if !f {
                    if config.focus.detect_client_leader {
                        if let (Some(al), l) = (active_leader, self.root_leader(w.id)) {
                            f |= w.leader.is_some() && l == al;
                        }
                    }
                    if config.focus.detect_transient {
                        f |= w.transient_for.is_some() && w.transient_for == active;
                    }
                }
                (w.id, f)
            })
            .collect();
        let mut flipped = Vec::new();
        for (id, focused) in related {
            if let Some(w) = self.find_mut(id) {
                if w.focused != focused {
                    w.focused = focused;
                    flipped.push(id);
                }
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(x: i32, y: i32, w: u32, h: u32) -> InitialAttrs {
        InitialAttrs {
            x,
            y,
            width: w,
            height: h,
            border_width: 0,
            depth: 24,
            mapped: true,
            override_redirect: false,
        }
    }

    #[test]
    fn test_one_live_record_per_id() {
        let mut reg = WindowRegistry::new();
        reg.observe(7, 1, attrs(0, 0, 10, 10));
        reg.observe(7, 1, attrs(5, 5, 20, 20));
        assert_eq!(reg.len(), 1);
        // Re-observation must not clobber the live record.
        assert_eq!(reg.find(7).unwrap().width, 10);
    }

    #[test]
    fn test_slot_reuse_keeps_other_indices() {
        let mut reg = WindowRegistry::new();
        reg.observe(1, 0, attrs(0, 0, 1, 1));
        reg.observe(2, 0, attrs(0, 0, 2, 2));
        reg.on_destroy_notify(1);
        let freed = reg.reap(false);
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].state, WinState::Destroyed);
        // New window lands in the freed slot; window 2 unaffected.
        reg.observe(3, 0, attrs(0, 0, 3, 3));
        assert_eq!(reg.find(2).unwrap().height, 2);
        assert_eq!(reg.find(3).unwrap().height, 3);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_destroy_waits_for_fade_out() {
        let mut reg = WindowRegistry::new();
        let w = reg.observe(9, 0, attrs(0, 0, 10, 10));
        w.opacity = 40;
        reg.on_destroy_notify(9);
        // Mid fade-out: not freed yet.
        assert!(reg.reap(true).is_empty());
        assert_eq!(reg.find(9).unwrap().opacity_target, 0);
        // Fade settles at zero: freed now.
        reg.find_mut(9).unwrap().opacity = 0;
        assert_eq!(reg.reap(true).len(), 1);
        assert!(reg.find(9).is_none());
    }

    #[test]
    fn test_destroy_immediate_without_fading() {
        let mut reg = WindowRegistry::new();
        let w = reg.observe(9, 0, attrs(0, 0, 10, 10));
        w.opacity = 200;
        reg.on_destroy_notify(9);
        assert_eq!(reg.reap(false).len(), 1);
    }

    #[test]
    fn test_event_interleavings_never_duplicate() {
        // create/map/configure/unmap/destroy in odd orders.
        let mut reg = WindowRegistry::new();
        for _ in 0..3 {
            reg.observe(5, 0, attrs(0, 0, 10, 10));
            if let Some(w) = reg.find_mut(5) {
                w.state = WinState::Mapped;
            }
            if let Some(w) = reg.find_mut(5) {
                w.state = WinState::Unmapping;
            }
            reg.observe(5, 0, attrs(0, 0, 10, 10));
            assert_eq!(reg.iter().filter(|w| w.id == 5).count(), 1);
            reg.on_destroy_notify(5);
            reg.reap(false);
            assert!(reg.find(5).is_none());
        }
    }

    #[test]
    fn test_stacking_restack() {
        let mut reg = WindowRegistry::new();
        for id in [1, 2, 3] {
            reg.observe(id, 0, attrs(0, 0, 1, 1));
        }
        assert_eq!(reg.stacking_order(), &[1, 2, 3]);
        reg.restack(3, Some(1));
        assert_eq!(reg.stacking_order(), &[1, 3, 2]);
        reg.restack(2, None);
        assert_eq!(reg.stacking_order(), &[2, 1, 3]);
        reg.raise_to_top(1);
        assert_eq!(reg.stacking_order(), &[2, 3, 1]);
    }

    #[test]
    fn test_resolve_toplevel_bounded() {
        let mut reg = WindowRegistry::new();
        reg.observe(100, 1, attrs(0, 0, 10, 10));
        reg.find_mut(100).unwrap().client = Some(200);

        // Direct hit, client hit, ancestor hit.
        assert_eq!(reg.resolve_toplevel(100, |_| None).unwrap().id, 100);
        assert_eq!(reg.resolve_toplevel(200, |_| None).unwrap().id, 100);
        let parents = |id: u32| if id == 300 { Some(200) } else { None };
        assert_eq!(reg.resolve_toplevel(300, parents).unwrap().id, 100);

        // A parent cycle must terminate with "not found".
        let cycle = |id: u32| Some(if id == 400 { 401 } else { 400 });
        assert!(reg.resolve_toplevel(400, cycle).is_none());
    }

    #[test]
    fn test_root_leader_cycle_capped() {
        let mut reg = WindowRegistry::new();
        reg.observe(1, 0, attrs(0, 0, 1, 1));
        reg.observe(2, 0, attrs(0, 0, 1, 1));
        reg.find_mut(1).unwrap().leader = Some(2);
        reg.find_mut(2).unwrap().leader = Some(1);
        // Must terminate; exact endpoint is unimportant.
        let _ = reg.root_leader(1);
    }

    #[test]
    fn test_focus_propagates_to_transients() {
        let mut reg = WindowRegistry::new();
        let config = Config::default();
        reg.observe(1, 0, attrs(0, 0, 1, 1));
        reg.observe(2, 0, attrs(0, 0, 1, 1));
        reg.find_mut(2).unwrap().transient_for = Some(1);
        reg.observe(3, 0, attrs(0, 0, 1, 1));

        let flipped = reg.update_focus(Some(1), &config);
        assert!(flipped.contains(&1) && flipped.contains(&2));
        assert!(reg.find(1).unwrap().focused);
        assert!(reg.find(2).unwrap().focused);
        assert!(!reg.find(3).unwrap().focused);

        let flipped = reg.update_focus(Some(3), &config);
        assert_eq!(flipped.len(), 3);
    }

    #[test]
    fn test_shadow_policy() {
        let config = Config::default();
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(0, 0, 10, 10));
        w.window_type = WindowType::Normal;
        assert!(w.refresh_policy(&config));
        assert!(w.shadow);

        // Bounding-shaped windows lose the shadow unless rounded.
        w.bounding_shaped = true;
        w.rounded_corners = false;
        w.refresh_policy(&config);
        assert!(!w.shadow);
        w.rounded_corners = true;
        w.refresh_policy(&config);
        assert!(w.shadow);

        // Explicit hint wins over type exclusion.
        w.bounding_shaped = false;
        w.window_type = WindowType::Dock;
        w.refresh_policy(&config);
        assert!(!w.shadow);
        w.shadow_hint = Some(true);
        w.refresh_policy(&config);
        assert!(w.shadow);

        // Control-plane force beats everything.
        w.shadow_force = Force::Off;
        w.refresh_policy(&config);
        assert!(!w.shadow);
    }

    #[test]
    fn test_opacity_policy_order() {
        let mut config = Config::default();
        config.opacity.rules.push(crate::config::OpacityRule {
            rule: crate::config::MatchRule {
                target: crate::config::MatchTarget::Class,
                mode: crate::config::MatchMode::Exact,
                value: "term".into(),
                ignore_case: false,
            },
            opacity: 0.5,
        });
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(0, 0, 10, 10));
        w.class = "term".into();
        w.refresh_policy(&config);
        assert_eq!(w.opacity_target, 128);

        // Explicit property override beats the rule.
        w.opacity_prop = Some(30);
        w.refresh_policy(&config);
        assert_eq!(w.opacity_target, 30);

        // Unmapping windows always target zero.
        w.state = WinState::Unmapping;
        w.refresh_policy(&config);
        assert_eq!(w.opacity_target, 0);
    }

    #[test]
    fn test_paint_extents_with_shadow() {
        let config = Config::default();
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(100, 100, 200, 200));
        w.refresh_policy(&config);
        assert!(w.shadow);
        let ext = w.paint_extents(&config.shadow);
        // Shadow offset is negative, radius expands on all sides; the
        // extents may exceed the bounds by at most radius + |offset|.
        let bounds = w.bounds();
        assert!(ext.contains(&bounds));
        let max_grow = (2 * config.shadow.radius + config.shadow.offset_x.abs()) as i32;
        assert!(bounds.x1 - ext.x1 <= max_grow);
        assert!(ext.x2 - bounds.x2 <= max_grow);
        assert!(bounds.y1 - ext.y1 <= max_grow);
        assert!(ext.y2 - bounds.y2 <= max_grow);
    }

    #[test]
    fn test_paint_extents_cover_shadow_placement() {
        // The rect the backends draw the shadow into must sit inside
        // the extents damaged when the window appears or moves, or the
        // shadow leaves trails outside the repainted area.
        let config = Config::default();
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(100, 100, 200, 200));
        w.refresh_policy(&config);
        assert!(w.shadow);
        let ext = w.paint_extents(&config.shadow);
        let tables = crate::shadow::ShadowTables::build(&config.shadow);
        let placed = tables.placement(&w.bounds(), &config.shadow);
        assert!(
            ext.contains(&placed),
            "extents {:?} must cover the drawn shadow {:?}",
            ext,
            placed
        );
    }

    #[test]
    fn test_shadow_flip_reports_change_with_settled_opacity() {
        let config = Config::default();
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(0, 0, 10, 10));
        w.window_type = WindowType::Normal;
        w.refresh_policy(&config);
        w.opacity = w.opacity_target;
        assert!(w.shadow);
        // Withdrawing the shadow changes what is on screen while the
        // opacity target stays put; repaints key off this return value.
        w.shadow_hint = Some(false);
        assert!(w.refresh_policy(&config));
        assert_eq!(w.opacity, w.opacity_target);
        assert!(!w.shadow);
    }

    #[test]
    fn test_update_mode() {
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, attrs(0, 0, 1, 1));
        w.opacity = OPAQUE;
        w.update_mode();
        assert_eq!(w.mode, PaintMode::Opaque);
        w.opacity = 128;
        w.update_mode();
        assert_eq!(w.mode, PaintMode::Blended);
        w.opacity = OPAQUE;
        w.argb = true;
        w.update_mode();
        assert_eq!(w.mode, PaintMode::Blended);
    }
}
