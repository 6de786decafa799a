//! Transparent object ordering
//!
//! Alpha objects are sorted nearest-first by the distance from the eye to
//! their bounding-box center; passes draw the list in reverse. Each object
//! also gets a mask id so that overlapping transparent objects write to
//! different mask channels. Overlap is a conservative screen-rectangle test
//! on the projected bounding boxes, so the ids are an approximation.

use glam::{IVec2, Mat4, Vec3};

/// Highest mask id handed out; further overlapping objects share it.
pub const MAX_MASK_ID: u32 = 3;

/// Mask id of objects with no visible projection.
pub const MASK_ID_OFFSCREEN: u32 = u32::MAX;

/// Oriented bounding box: local bounds, a model transform and a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtBBox {
    pub min: Vec3,
    pub max: Vec3,
    pub position: Vec3,
    /// Rotation and scale applied to the local corners
    pub transform: Mat4,
}

impl ExtBBox {
    #[must_use]
    pub fn new(min: Vec3, max: Vec3, position: Vec3) -> Self {
        Self {
            min,
            max,
            position,
            transform: Mat4::IDENTITY,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    /// Center in world space, as used for sorting.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        self.position + (self.min + self.max) * 0.5
    }

    /// The eight corners in world space.
    #[must_use]
    pub fn corners(&self) -> [Vec3; 8] {
        let (min, max) = (self.min, self.max);
        [
            min,
            max,
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(min.x, max.y, max.z),
        ]
        .map(|corner| self.transform.transform_point3(corner) + self.position)
    }
}

/// Window coordinates of `point`, or `None` if it lies behind the eye.
#[must_use]
pub fn project(point: Vec3, view_projection: Mat4, screen: (u32, u32)) -> Option<IVec2> {
    let clip = view_projection * point.extend(1.0);
    if clip.w <= f32::EPSILON {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    let x = (ndc.x * 0.5 + 0.5) * screen.0 as f32;
    let y = (ndc.y * 0.5 + 0.5) * screen.1 as f32;
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    // keep far-off points representable
    let limit = i32::MAX as f32 / 2.0;
    Some(IVec2::new(
        x.clamp(-limit, limit) as i32,
        y.clamp(-limit, limit) as i32,
    ))
}

/// Screen rectangle of an alpha object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenRect {
    pub min: IVec2,
    pub max: IVec2,
}

impl ScreenRect {
    /// Bounds of the projected `corners`, clamped to the screen. `None` if no
    /// corner projects or the bounds lie entirely off screen.
    #[must_use]
    pub fn from_corners(
        corners: &[Vec3],
        view_projection: Mat4,
        screen: (u32, u32),
    ) -> Option<Self> {
        let mut projected = corners
            .iter()
            .filter_map(|&c| project(c, view_projection, screen));
        let first = projected.next()?;
        let (min, max) = projected.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));

        let screen = IVec2::new(screen.0 as i32, screen.1 as i32);
        if max.x < 0 || max.y < 0 || min.x > screen.x || min.y > screen.y {
            return None;
        }
        Some(Self {
            min: min.clamp(IVec2::ZERO, screen),
            max: max.clamp(IVec2::ZERO, screen),
        })
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
    }
}

/// One sorted alpha object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortedAlpha<K> {
    pub key: K,
    pub mask_id: u32,
}

/// Sort `objects` nearest-first from `eye` and assign mask ids.
///
/// An object's mask id is one more than the highest id among the overlapping
/// objects before it in the list, capped at [`MAX_MASK_ID`]. Objects without a
/// visible rectangle get [`MASK_ID_OFFSCREEN`] and take no part in overlap.
#[must_use]
pub fn sort_alpha_objects<K: Copy>(
    objects: &[(K, ExtBBox)],
    eye: Vec3,
    view_projection: Mat4,
    screen: (u32, u32),
) -> Vec<SortedAlpha<K>> {
    let mut order: Vec<(K, ExtBBox, f32)> = objects
        .iter()
        .map(|&(key, bbox)| (key, bbox, eye.distance(bbox.center())))
        .collect();
    // stable, so equal distances keep registration order
    order.sort_by(|a, b| a.2.total_cmp(&b.2));

    let rects: Vec<Option<ScreenRect>> = order
        .iter()
        .map(|(_, bbox, _)| ScreenRect::from_corners(&bbox.corners(), view_projection, screen))
        .collect();

    let mut masks: Vec<u32> = Vec::with_capacity(order.len());
    for (i, rect) in rects.iter().enumerate() {
        let Some(rect) = rect else {
            masks.push(MASK_ID_OFFSCREEN);
            continue;
        };
        let highest = rects[..i]
            .iter()
            .zip(&masks)
            .filter_map(|(other, &mask)| {
                other.filter(|o| o.overlaps(rect)).map(|_| mask)
            })
            .max()
            .unwrap_or(0);
        masks.push((highest + 1).min(MAX_MASK_ID));
    }

    order
        .into_iter()
        .zip(masks)
        .map(|((key, _, _), mask_id)| SortedAlpha { key, mask_id })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN: (u32, u32) = (800, 600);

    fn view_projection(eye: Vec3) -> Mat4 {
        let projection = Mat4::perspective_rh(60.0_f32.to_radians(), 800.0 / 600.0, 1.0, 1000.0);
        projection * Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y)
    }

    fn unit_box(x: f32, z: f32) -> ExtBBox {
        ExtBBox::new(Vec3::splat(-0.5), Vec3::splat(0.5), Vec3::new(x, 0.0, z))
    }

    fn mask_of(sorted: &[SortedAlpha<char>], key: char) -> u32 {
        sorted.iter().find(|s| s.key == key).map(|s| s.mask_id).unwrap()
    }

    #[test]
    fn test_sorted_nearest_first() {
        let eye = Vec3::new(0.0, 0.0, 2.0);
        let objects = [
            ('f', unit_box(0.0, -30.0)),
            ('n', unit_box(1.0, -3.0)),
            ('m', unit_box(-1.0, -10.0)),
        ];
        let sorted = sort_alpha_objects(&objects, eye, view_projection(eye), SCREEN);
        let keys: Vec<char> = sorted.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!['n', 'm', 'f']);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let eye = Vec3::ZERO;
        let vp = view_projection(eye);
        let objects = [
            ('a', unit_box(0.0, -5.0)),
            ('b', unit_box(0.6, -6.0)),
            ('c', unit_box(-3.0, -8.0)),
            ('d', unit_box(0.0, 10.0)),
        ];

        let first = sort_alpha_objects(&objects, eye, vp, SCREEN);
        let second = sort_alpha_objects(&objects, eye, vp, SCREEN);
        assert_eq!(first, second);
        assert_eq!(first[0].key, 'a');
        for sorted in &first {
            assert!(sorted.mask_id == MASK_ID_OFFSCREEN || (1..=MAX_MASK_ID).contains(&sorted.mask_id));
        }
    }

    #[test]
    fn test_behind_eye_is_offscreen() {
        let eye = Vec3::ZERO;
        let objects = [('x', unit_box(0.0, 10.0))];
        let sorted = sort_alpha_objects(&objects, eye, view_projection(eye), SCREEN);
        assert_eq!(sorted[0].mask_id, MASK_ID_OFFSCREEN);
    }

    #[test]
    fn test_chain_overlap_separates_ids() {
        // A overlaps B, B overlaps C, A and C are apart
        let eye = Vec3::ZERO;
        let objects = [
            ('a', unit_box(-0.8, -5.0)),
            ('b', unit_box(0.0, -5.1)),
            ('c', unit_box(0.8, -5.2)),
        ];
        let vp = view_projection(eye);
        let rect = |b: &ExtBBox| ScreenRect::from_corners(&b.corners(), vp, SCREEN).unwrap();
        let (ra, rb, rc) = (rect(&objects[0].1), rect(&objects[1].1), rect(&objects[2].1));
        assert!(ra.overlaps(&rb));
        assert!(rb.overlaps(&rc));
        assert!(!ra.overlaps(&rc));

        let sorted = sort_alpha_objects(&objects, eye, vp, SCREEN);
        let (a, b, c) = (mask_of(&sorted, 'a'), mask_of(&sorted, 'b'), mask_of(&sorted, 'c'));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_mask_ids_are_capped() {
        let eye = Vec3::ZERO;
        let objects: Vec<(char, ExtBBox)> = ['a', 'b', 'c', 'd', 'e']
            .into_iter()
            .enumerate()
            .map(|(i, key)| (key, unit_box(0.0, -4.0 - i as f32)))
            .collect();
        let sorted = sort_alpha_objects(&objects, eye, view_projection(eye), SCREEN);
        let masks: Vec<u32> = sorted.iter().map(|s| s.mask_id).collect();
        assert_eq!(masks, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn test_isolated_objects_get_first_id() {
        let eye = Vec3::ZERO;
        let objects = [('l', unit_box(-3.0, -6.0)), ('r', unit_box(3.0, -6.0))];
        let sorted = sort_alpha_objects(&objects, eye, view_projection(eye), SCREEN);
        assert!(sorted.iter().all(|s| s.mask_id == 1));
    }
}
