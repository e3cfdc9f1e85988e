//! Damage rectangles reported by the compositor for a captured frame.

/// Axis-aligned rectangle in output buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect {
            x,
            y,
            width: (right - x as i64).clamp(0, u32::MAX as i64) as u32,
            height: (bottom - y as i64).clamp(0, u32::MAX as i64) as u32,
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Bounding box of a list of rectangles.
pub fn bounding_box(rects: &[Rect]) -> Option<Rect> {
    let (first, rest) = rects.split_first()?;
    Some(rest.iter().fold(*first, |acc, r| acc.union(r)))
}

/// Fit a damage list into `capacity` metadata slots.
///
/// Lists that fit are returned unchanged. Otherwise the first `capacity - 1`
/// rectangles are kept and the last slot holds the bounding box of every
/// remaining rectangle.
pub fn fit_to_capacity(damage: &[Rect], capacity: usize) -> Vec<Rect> {
    if capacity == 0 {
        return Vec::new();
    }
    if damage.len() <= capacity {
        return damage.to_vec();
    }

    let keep = capacity - 1;
    let mut fitted = damage[..keep].to_vec();
    if let Some(merged) = bounding_box(&damage[keep..]) {
        fitted.push(merged);
    }
    fitted
}

/// Damage accumulated for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DamageTracker {
    rects: Vec<Rect>,
}

impl DamageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.rects.push(rect);
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}
