//! Screen-space rectangles and damage regions.
//!
//! A `Region` is a set of non-overlapping rectangles kept in a simple
//! normal form: rectangles are stored disjoint, in insertion order.
//! Operations never produce overlapping members, so area accounting
//! and clip-rect export stay exact.

/// An axis-aligned rectangle in screen coordinates, stored as edges.
///
/// Empty rectangles (x2 <= x1 or y2 <= y1) are valid values and are
/// dropped by all `Region` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from position and size, the form X11 geometry arrives in.
    pub fn from_xywh(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width as i32,
            y2: y + height as i32,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x1 < other.x2 && other.x1 < self.x2 && self.y1 < other.y2 && other.y1 < self.y2
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        Rect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// Pieces of `self` not covered by `other`. At most four rects.
    fn subtract(&self, other: &Rect) -> Vec<Rect> {
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(4);
        // Band above
        if other.y1 > self.y1 {
            out.push(Rect::new(self.x1, self.y1, self.x2, other.y1));
        }
        // Band below
        if other.y2 < self.y2 {
            out.push(Rect::new(self.x1, other.y2, self.x2, self.y2));
        }
        let mid_y1 = self.y1.max(other.y1);
        let mid_y2 = self.y2.min(other.y2);
        // Left sliver
        if other.x1 > self.x1 {
            out.push(Rect::new(self.x1, mid_y1, other.x1, mid_y2));
        }
        // Right sliver
        if other.x2 < self.x2 {
            out.push(Rect::new(other.x2, mid_y1, self.x2, mid_y2));
        }
        out.retain(|r| !r.is_empty());
        out
    }
}

/// A set of disjoint rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut reg = Self::new();
        reg.add_rect(rect);
        reg
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Union a single rectangle into the region.
    ///
    /// The incoming rect is split against existing members so the
    /// disjointness invariant holds; a rect already fully covered is
    /// a no-op, making union idempotent.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pending = vec![rect];
        for existing in &self.rects {
            let mut next = Vec::new();
            for piece in pending {
                next.extend(piece.subtract(existing));
            }
            pending = next;
            if pending.is_empty() {
                return;
            }
        }
        self.rects.extend(pending);
    }

    pub fn union_with(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Remove everything covered by `rect`.
    pub fn subtract_rect(&mut self, rect: &Rect) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for existing in &self.rects {
            out.extend(existing.subtract(rect));
        }
        self.rects = out;
    }

    /// Clip the region to `bounds`, dropping what falls outside.
    pub fn clip_to(&mut self, bounds: &Rect) {
        self.rects = self
            .rects
            .iter()
            .map(|r| r.intersection(bounds))
            .filter(|r| !r.is_empty())
            .collect();
    }

    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Bounding box of the whole region, `None` when empty.
    pub fn extents(&self) -> Option<Rect> {
        let first = self.rects.first()?;
        let mut ext = *first;
        for r in &self.rects[1..] {
            ext.x1 = ext.x1.min(r.x1);
            ext.y1 = ext.y1.min(r.y1);
            ext.x2 = ext.x2.max(r.x2);
            ext.y2 = ext.y2.max(r.y2);
        }
        Some(ext)
    }

    /// Replace the contents with another region, returning the old one.
    pub fn take(&mut self) -> Region {
        Region {
            rects: std::mem::take(&mut self.rects),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_idempotent() {
        let mut reg = Region::new();
        let r = Rect::from_xywh(10, 10, 100, 100);
        reg.add_rect(r);
        let area = reg.area();
        reg.add_rect(r);
        reg.add_rect(r);
        assert_eq!(reg.area(), area);
    }

    #[test]
    fn test_union_commutative() {
        let a = Rect::from_xywh(0, 0, 50, 50);
        let b = Rect::from_xywh(25, 25, 50, 50);

        let mut reg1 = Region::new();
        reg1.add_rect(a);
        reg1.add_rect(b);

        let mut reg2 = Region::new();
        reg2.add_rect(b);
        reg2.add_rect(a);

        // Normal forms may differ; areas and membership must not.
        assert_eq!(reg1.area(), reg2.area());
        assert_eq!(reg1.area(), 50 * 50 + 50 * 50 - 25 * 25);
        for probe in [(10, 10), (30, 30), (60, 60), (49, 70)] {
            let p = Rect::new(probe.0, probe.1, probe.0 + 1, probe.1 + 1);
            assert_eq!(reg1.intersects_rect(&p), reg2.intersects_rect(&p));
        }
    }

    #[test]
    fn test_union_empty_is_noop() {
        let mut reg = Region::from_rect(Rect::from_xywh(0, 0, 10, 10));
        reg.add_rect(Rect::new(5, 5, 5, 5));
        reg.union_with(&Region::new());
        assert_eq!(reg.area(), 100);
    }

    #[test]
    fn test_members_stay_disjoint() {
        let mut reg = Region::new();
        reg.add_rect(Rect::from_xywh(0, 0, 30, 30));
        reg.add_rect(Rect::from_xywh(10, 10, 30, 30));
        reg.add_rect(Rect::from_xywh(20, 0, 30, 30));
        let rects = reg.rects();
        for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                assert!(!rects[i].intersects(&rects[j]), "{:?} vs {:?}", rects[i], rects[j]);
            }
        }
    }

    #[test]
    fn test_subtract() {
        let mut reg = Region::from_rect(Rect::from_xywh(0, 0, 100, 100));
        reg.subtract_rect(&Rect::from_xywh(25, 25, 50, 50));
        assert_eq!(reg.area(), 100 * 100 - 50 * 50);
        assert!(!reg.intersects_rect(&Rect::from_xywh(40, 40, 1, 1)));
        assert!(reg.intersects_rect(&Rect::from_xywh(10, 10, 1, 1)));
    }

    #[test]
    fn test_clip_to_bounds() {
        let mut reg = Region::from_rect(Rect::from_xywh(-50, -50, 200, 200));
        reg.clip_to(&Rect::from_xywh(0, 0, 100, 100));
        assert_eq!(reg.area(), 100 * 100);
    }

    #[test]
    fn test_extents() {
        let mut reg = Region::new();
        reg.add_rect(Rect::from_xywh(10, 20, 5, 5));
        reg.add_rect(Rect::from_xywh(100, 0, 10, 10));
        assert_eq!(reg.extents(), Some(Rect::new(10, 0, 110, 25)));
        assert_eq!(Region::new().extents(), None);
    }
}
