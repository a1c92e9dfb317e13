//! Opacity fade engine.
//!
//! Windows whose opacity has not yet reached its target live in the
//! fading set; the fade timer is armed exactly while that set is
//! non-empty. Each tick converts elapsed real time into whole fade
//! steps and advances every fading window toward its target, clamped
//! so it never overshoots.

use std::collections::BTreeSet;

use crate::config::Config;
use crate::registry::{WindowRegistry, WinState};

#[derive(Debug, Default)]
pub struct FadeEngine {
    /// Ids of windows whose opacity != target.
    fading: BTreeSet<u32>,
    /// Monotonic-ms timestamp the step clock last advanced to.
    fade_time: Option<u64>,
}

impl FadeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fade timer's arm predicate.
    pub fn is_active(&self) -> bool {
        !self.fading.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.fading.contains(&id)
    }

    pub fn forget(&mut self, id: u32) {
        self.fading.remove(&id);
        if self.fading.is_empty() {
            self.fade_time = None;
        }
    }

    /// (Re)target a window after a policy change. Animating windows
    /// join the fading set; windows denied animation, or not yet
    /// visible on screen, jump straight to target. Returns true when
    /// the window's opacity or membership changed in a way that needs
    /// a repaint.
    pub fn retarget(
        &mut self,
        registry: &mut WindowRegistry,
        id: u32,
        config: &Config,
    ) -> bool {
        let Some(w) = registry.find_mut(id) else {
            self.forget(id);
            return false;
        };
        if w.opacity == w.opacity_target {
            self.forget(id);
            return false;
        }
        let jump = !w.fade_allowed(config) || w.state == WinState::Unmapped;
        if jump {
            w.opacity = w.opacity_target;
            w.update_mode();
            self.forget(id);
            return true;
        }
        self.fading.insert(id);
        true
    }

    /// Retarget for a map/unmap/destroy transition. Open/close fades
    /// can be disabled independently of every other fade; with
    /// `no_fading_openclose` set the window jumps straight to target.
    pub fn retarget_openclose(
        &mut self,
        registry: &mut WindowRegistry,
        id: u32,
        config: &Config,
    ) -> bool {
        if !config.fade.no_fading_openclose {
            return self.retarget(registry, id, config);
        }
        let Some(w) = registry.find_mut(id) else {
            self.forget(id);
            return false;
        };
        if w.opacity == w.opacity_target {
            self.forget(id);
            return false;
        }
        w.opacity = w.opacity_target;
        w.update_mode();
        self.forget(id);
        true
    }

    /// Advance the step clock and every fading window. `now_ms` is a
    /// monotonic millisecond timestamp. Returns the ids that actually
    /// stepped this tick; each needs damage emitted for its bounds.
    pub fn tick(
        &mut self,
        now_ms: u64,
        registry: &mut WindowRegistry,
        config: &Config,
    ) -> Vec<u32> {
        if self.fading.is_empty() {
            self.fade_time = None;
            return Vec::new();
        }
        let steps = self.elapsed_steps(now_ms, config.fade.delta_ms.max(1));
        if steps == 0 {
            return Vec::new();
        }

        let mut stepped = Vec::new();
        let mut settled = Vec::new();
        for &id in &self.fading {
            let Some(w) = registry.find_mut(id) else {
                settled.push(id);
                continue;
            };
            let target = w.opacity_target;
            if w.opacity == target {
                settled.push(id);
                continue;
            }
            let fading_in = w.opacity < target;
            let rate = if fading_in {
                config.fade.step_in
            } else {
                config.fade.step_out
            } as u64;
            let delta = (rate * steps).min(u16::MAX as u64) as u16;
            w.opacity = if fading_in {
                w.opacity.saturating_add(delta).min(target)
            } else {
                w.opacity.saturating_sub(delta).max(target)
            };
            w.update_mode();
            stepped.push(id);
            if w.opacity == target {
                settled.push(id);
            }
        }
        for id in settled {
            self.fading.remove(&id);
        }
        if self.fading.is_empty() {
            self.fade_time = None;
        }
        stepped
    }

    /// Whole steps elapsed since the clock last advanced. The first
    /// tick after arming counts as one step so a fade makes progress
    /// immediately.
    fn elapsed_steps(&mut self, now_ms: u64, delta_ms: u64) -> u64 {
        match self.fade_time {
            None => {
                self.fade_time = Some(now_ms);
                1
            }
            Some(t) if now_ms >= t + delta_ms => {
                let steps = (now_ms - t) / delta_ms;
                self.fade_time = Some(t + steps * delta_ms);
                steps
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OPAQUE;
    use crate::registry::InitialAttrs;

    fn mapped(w: u32, h: u32) -> InitialAttrs {
        InitialAttrs {
            x: 0,
            y: 0,
            width: w,
            height: h,
            border_width: 0,
            depth: 24,
            mapped: true,
            override_redirect: false,
        }
    }

    fn fade_config(step: u16, delta_ms: u64) -> Config {
        let mut config = Config::default();
        config.fade.step_in = step;
        config.fade.step_out = step;
        config.fade.delta_ms = delta_ms;
        config
    }

    #[test]
    fn test_fade_in_settles_in_exact_tick_count() {
        // 0 -> 255 at 5 per 10ms tick: ceil(255/5) = 51 ticks.
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let mut fade = FadeEngine::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = OPAQUE;
        assert!(fade.retarget(&mut reg, 1, &config));

        let mut ticks = 0;
        let mut last = 0u16;
        let mut now = 0u64;
        while fade.is_active() {
            let stepped = fade.tick(now, &mut reg, &config);
            assert_eq!(stepped, vec![1], "every tick repaints");
            let opacity = reg.find(1).unwrap().opacity;
            assert!(opacity >= last, "monotonic toward target");
            assert!(opacity <= OPAQUE, "never overshoots");
            last = opacity;
            ticks += 1;
            now += 10;
            assert!(ticks <= 60, "runaway fade");
        }
        assert_eq!(ticks, 51);
        assert_eq!(reg.find(1).unwrap().opacity, OPAQUE);
        assert!(!fade.contains(1));
    }

    #[test]
    fn test_fade_out_clamps_at_target() {
        let config = fade_config(8, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 20;
        w.opacity_target = 0;
        let mut fade = FadeEngine::new();
        fade.retarget(&mut reg, 1, &config);
        fade.tick(0, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 12);
        fade.tick(10, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 4);
        fade.tick(20, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 0);
        assert!(!fade.is_active());
    }

    #[test]
    fn test_missed_ticks_catch_up() {
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = 100;
        let mut fade = FadeEngine::new();
        fade.retarget(&mut reg, 1, &config);
        fade.tick(0, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 5);
        // 50ms late: five steps at once, still clamped.
        fade.tick(50, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 30);
        fade.tick(1000, &mut reg, &config);
        assert_eq!(reg.find(1).unwrap().opacity, 100);
    }

    #[test]
    fn test_settled_window_leaves_set_within_one_tick() {
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 95;
        w.opacity_target = 100;
        let mut fade = FadeEngine::new();
        fade.retarget(&mut reg, 1, &config);
        fade.tick(0, &mut reg, &config);
        assert!(!fade.contains(1));
        assert!(!fade.is_active());
    }

    #[test]
    fn test_no_animation_policy_jumps() {
        let mut config = fade_config(5, 10);
        config.fade.enabled = false;
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = OPAQUE;
        let mut fade = FadeEngine::new();
        assert!(fade.retarget(&mut reg, 1, &config));
        assert_eq!(reg.find(1).unwrap().opacity, OPAQUE);
        assert!(!fade.is_active());
    }

    #[test]
    fn test_retarget_noop_when_at_target() {
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = OPAQUE;
        w.opacity_target = OPAQUE;
        let mut fade = FadeEngine::new();
        assert!(!fade.retarget(&mut reg, 1, &config));
        assert!(!fade.is_active());
    }

    #[test]
    fn test_no_fading_openclose_jumps_but_other_fades_animate() {
        let mut config = fade_config(5, 10);
        config.fade.no_fading_openclose = true;
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = OPAQUE;
        let mut fade = FadeEngine::new();
        // Map transition: no animation, straight to target.
        assert!(fade.retarget_openclose(&mut reg, 1, &config));
        assert_eq!(reg.find(1).unwrap().opacity, OPAQUE);
        assert!(!fade.is_active());
        // An ordinary policy retarget still animates.
        reg.find_mut(1).unwrap().opacity_target = 100;
        assert!(fade.retarget(&mut reg, 1, &config));
        assert!(fade.is_active());
    }

    #[test]
    fn test_openclose_fades_by_default() {
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = OPAQUE;
        let mut fade = FadeEngine::new();
        assert!(fade.retarget_openclose(&mut reg, 1, &config));
        assert_eq!(reg.find(1).unwrap().opacity, 0);
        assert!(fade.is_active());
    }

    #[test]
    fn test_destroyed_window_dropped_from_set() {
        let config = fade_config(5, 10);
        let mut reg = WindowRegistry::new();
        let w = reg.observe(1, 0, mapped(10, 10));
        w.opacity = 0;
        w.opacity_target = OPAQUE;
        let mut fade = FadeEngine::new();
        fade.retarget(&mut reg, 1, &config);
        reg.on_destroy_notify(1);
        reg.find_mut(1).unwrap().opacity = 0;
        reg.reap(true);
        let stepped = fade.tick(0, &mut reg, &config);
        assert!(stepped.is_empty());
        assert!(!fade.is_active());
    }
}
