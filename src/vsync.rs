//! VSync pacing.
//!
//! The pacer decides *when* the repaint scheduler may fire and, for
//! the buffer-age swap discipline, *how much* of the reused buffer is
//! stale and must be redrawn. The actual retrace wait is performed by
//! the backend at present time; the pacer only owns the timing policy.

use std::time::{Duration, Instant};

use crate::config::{VsyncConfig, VsyncMode};
use crate::damage::{DamageBoard, MAX_BUFFER_AGE};
use crate::geometry::Region;

#[derive(Debug)]
pub struct VsyncPacer {
    mode: VsyncMode,
    frame_interval: Duration,
    /// With aggressive pacing the trigger is pulled earlier by this
    /// much, to land the paint just after retrace. Wrong estimates
    /// show up as tearing, which is why it is off by default.
    aggressive_offset: Duration,
    last_present: Option<Instant>,
}

impl VsyncPacer {
    pub fn new(config: &VsyncConfig) -> Self {
        let hz = config.refresh_rate.max(1);
        let frame_interval = Duration::from_secs(1) / hz;
        let aggressive_offset = if config.aggressive {
            frame_interval / 10
        } else {
            Duration::ZERO
        };
        Self {
            mode: config.mode,
            frame_interval,
            aggressive_offset,
            last_present: None,
        }
    }

    /// Earliest instant the pending repaint may run. `None` pacing
    /// never delays.
    pub fn paint_deadline(&self, now: Instant) -> Instant {
        if self.mode == VsyncMode::None {
            return now;
        }
        match self.last_present {
            None => now,
            Some(t) => t + self.frame_interval - self.aggressive_offset,
        }
    }

    pub fn may_paint(&self, now: Instant) -> bool {
        self.paint_deadline(now) <= now
    }

    pub fn frame_presented(&mut self, now: Instant) {
        self.last_present = Some(now);
    }

    /// Extra region that must be redrawn because the about-to-be-reused
    /// buffer is `age` frames old: the union of the damage committed in
    /// the `age - 1` frames presented since that buffer last held the
    /// screen. `None` means the age is unusable and the whole target
    /// must be redrawn.
    pub fn stale_region(&self, age: usize, board: &DamageBoard) -> Option<Region> {
        if self.mode != VsyncMode::BufferAge {
            return None;
        }
        if age == 0 || age > MAX_BUFFER_AGE || age - 1 > board.history_len() {
            return None;
        }
        Some(board.recent(age - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    fn pacer(mode: VsyncMode) -> VsyncPacer {
        VsyncPacer::new(&VsyncConfig {
            mode,
            aggressive: false,
            refresh_rate: 60,
        })
    }

    fn board_with_frames(frames: &[Rect]) -> DamageBoard {
        let mut board = DamageBoard::new(1000, 1000);
        // Oldest first; commit pushes most-recent to the front.
        for rect in frames {
            board.add_rect(*rect);
            let frame = board.begin_frame();
            board.commit(frame);
        }
        board
    }

    #[test]
    fn test_age_one_needs_only_pending() {
        let pacer = pacer(VsyncMode::BufferAge);
        let board = board_with_frames(&[Rect::from_xywh(0, 0, 10, 10)]);
        let stale = pacer.stale_region(1, &board).unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_age_k_unions_last_k_minus_one_frames() {
        let pacer = pacer(VsyncMode::BufferAge);
        let board = board_with_frames(&[
            Rect::from_xywh(0, 0, 10, 10),   // oldest
            Rect::from_xywh(100, 0, 10, 10),
            Rect::from_xywh(200, 0, 10, 10), // newest
        ]);
        let stale = pacer.stale_region(3, &board).unwrap();
        // The two newest frames are stale; the oldest must be assumed
        // valid and left undrawn.
        assert!(stale.intersects_rect(&Rect::from_xywh(205, 5, 1, 1)));
        assert!(stale.intersects_rect(&Rect::from_xywh(105, 5, 1, 1)));
        assert!(!stale.intersects_rect(&Rect::from_xywh(5, 5, 1, 1)));
    }

    #[test]
    fn test_unusable_age_forces_full_redraw() {
        let pacer = pacer(VsyncMode::BufferAge);
        let board = board_with_frames(&[Rect::from_xywh(0, 0, 10, 10)]);
        assert!(pacer.stale_region(0, &board).is_none());
        assert!(pacer.stale_region(MAX_BUFFER_AGE + 1, &board).is_none());
        // More frames claimed than history holds.
        assert!(pacer.stale_region(3, &board).is_none());
    }

    #[test]
    fn test_non_age_modes_ignore_age() {
        let board = board_with_frames(&[Rect::from_xywh(0, 0, 10, 10)]);
        assert!(pacer(VsyncMode::None).stale_region(1, &board).is_none());
        assert!(pacer(VsyncMode::Retrace).stale_region(1, &board).is_none());
    }

    #[test]
    fn test_pacing_spaces_frames() {
        let mut p = pacer(VsyncMode::Retrace);
        let t0 = Instant::now();
        assert!(p.may_paint(t0));
        p.frame_presented(t0);
        assert!(!p.may_paint(t0 + Duration::from_millis(1)));
        assert!(p.may_paint(t0 + Duration::from_millis(17)));
    }

    #[test]
    fn test_none_mode_never_delays() {
        let mut p = pacer(VsyncMode::None);
        let t0 = Instant::now();
        p.frame_presented(t0);
        assert!(p.may_paint(t0));
    }

    #[test]
    fn test_aggressive_pulls_deadline_earlier() {
        let mut relaxed = pacer(VsyncMode::Retrace);
        let mut aggressive = VsyncPacer::new(&VsyncConfig {
            mode: VsyncMode::Retrace,
            aggressive: true,
            refresh_rate: 60,
        });
        let t0 = Instant::now();
        relaxed.frame_presented(t0);
        aggressive.frame_presented(t0);
        let t = t0 + Duration::from_millis(1);
        assert!(aggressive.paint_deadline(t) < relaxed.paint_deadline(t));
    }
}
