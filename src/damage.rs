//! Damage accumulation and repaint scheduling.
//!
//! Every mutation that can change visible pixels unions its bounding
//! box into one pending region. The event loop drains a whole burst
//! of X events, then paints exactly once; `DamageBoard` carries the
//! pending region across that boundary and keeps a short history ring
//! of committed frames for buffer-age partial redraw.

use crate::geometry::{Rect, Region};

/// How many past frames of damage we keep for buffer-age redraw.
pub const MAX_BUFFER_AGE: usize = 5;

#[derive(Debug, Default)]
pub struct DamageBoard {
    /// Region that must be repainted on the next frame.
    pending: Region,
    /// Committed damage of recent frames, most recent first.
    history: Vec<Region>,
    /// Screen bounds; pending damage is clipped against this.
    bounds: Rect,
}

impl DamageBoard {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            pending: Region::new(),
            history: Vec::with_capacity(MAX_BUFFER_AGE),
            bounds: Rect::from_xywh(0, 0, width as u32, height as u32),
        }
    }

    pub fn screen_bounds(&self) -> Rect {
        self.bounds
    }

    /// Screen resize invalidates everything, including history.
    pub fn resize(&mut self, width: u16, height: u16) {
        self.bounds = Rect::from_xywh(0, 0, width as u32, height as u32);
        self.history.clear();
        self.damage_whole_screen();
    }

    pub fn add_rect(&mut self, rect: Rect) {
        let clipped = rect.intersection(&self.bounds);
        self.pending.add_rect(clipped);
    }

    pub fn add_region(&mut self, region: &Region) {
        for rect in region.rects() {
            self.add_rect(*rect);
        }
    }

    pub fn damage_whole_screen(&mut self) {
        self.pending.add_rect(self.bounds);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &Region {
        &self.pending
    }

    /// Take the pending region for painting. If the paint fails the
    /// caller must hand it back via [`DamageBoard::restore`] so the
    /// next cycle retries the same area.
    pub fn begin_frame(&mut self) -> Region {
        self.pending.take()
    }

    /// Record a successfully presented frame's damage in the history
    /// ring. The pending region stays empty afterwards.
    pub fn commit(&mut self, painted: Region) {
        self.history.insert(0, painted);
        self.history.truncate(MAX_BUFFER_AGE);
    }

    /// Re-union an unpainted region after a failed frame.
    pub fn restore(&mut self, unpainted: Region) {
        for rect in unpainted.rects() {
            self.pending.add_rect(*rect);
        }
    }

    /// Union of the most recent `frames` committed frames. Used by the
    /// buffer-age pacer: a buffer of age `k` is stale exactly where
    /// the last `k` frames drew.
    pub fn recent(&self, frames: usize) -> Region {
        let mut out = Region::new();
        for region in self.history.iter().take(frames) {
            out.union_with(region);
        }
        out
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_empty_after_commit() {
        let mut board = DamageBoard::new(1920, 1080);
        board.add_rect(Rect::from_xywh(0, 0, 100, 100));
        assert!(board.has_pending());
        let frame = board.begin_frame();
        board.commit(frame);
        assert!(!board.has_pending());
        assert_eq!(board.history_len(), 1);
    }

    #[test]
    fn test_failed_frame_retries_same_area() {
        let mut board = DamageBoard::new(800, 600);
        board.add_rect(Rect::from_xywh(10, 10, 50, 50));
        let frame = board.begin_frame();
        assert!(!board.has_pending());
        board.restore(frame);
        assert!(board.has_pending());
        assert_eq!(board.pending().area(), 50 * 50);
    }

    #[test]
    fn test_damage_clipped_to_screen() {
        let mut board = DamageBoard::new(100, 100);
        board.add_rect(Rect::from_xywh(50, 50, 200, 200));
        assert_eq!(board.pending().area(), 50 * 50);
        board.add_rect(Rect::from_xywh(-100, -100, 50, 50));
        assert_eq!(board.pending().area(), 50 * 50);
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut board = DamageBoard::new(100, 100);
        for i in 0..10 {
            board.add_rect(Rect::from_xywh(i, 0, 1, 1));
            let frame = board.begin_frame();
            board.commit(frame);
        }
        assert_eq!(board.history_len(), MAX_BUFFER_AGE);
    }

    #[test]
    fn test_recent_unions_newest_first() {
        let mut board = DamageBoard::new(100, 100);
        for i in 0..4 {
            board.add_rect(Rect::from_xywh(i * 10, 0, 10, 10));
            let frame = board.begin_frame();
            board.commit(frame);
        }
        // Last 2 frames covered x in [20, 40).
        let recent = board.recent(2);
        assert_eq!(recent.area(), 200);
        assert!(recent.intersects_rect(&Rect::from_xywh(25, 5, 1, 1)));
        assert!(!recent.intersects_rect(&Rect::from_xywh(5, 5, 1, 1)));
    }

    #[test]
    fn test_resize_invalidates_everything() {
        let mut board = DamageBoard::new(100, 100);
        let frame = board.begin_frame();
        board.commit(frame);
        board.resize(200, 150);
        assert_eq!(board.history_len(), 0);
        assert_eq!(board.pending().area(), 200 * 150);
    }
}
