//! Screen-space overlay geometry cache.
//!
//! The overlay consumer draws form outlines over the most recent backbuf.
//! Recomputing polylines on every expose is wasteful, so per-form geometry
//! is cached keyed by the backbuf hash it was built against; when the pipe
//! publishes a new backbuf the stale geometry is rebuilt on first use.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::masks::{points_border, Form, FormId, MaskGeometry};

const CACHED_FORMS: usize = 64;

/// Ready-to-draw polylines of one form, interleaved x/y floats in backbuf
/// coordinates.
#[derive(Debug, Clone)]
pub struct ScreenGeometry {
    pub points: Vec<f32>,
    pub border: Option<Vec<f32>>,
    /// Clone forms also carry their source outline.
    pub source: Option<Vec<f32>>,
}

struct CachedGeometry {
    backbuf_hash: u64,
    geometry: ScreenGeometry,
}

pub struct OverlayCache {
    cache: LruCache<FormId, CachedGeometry>,
}

impl Default for OverlayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayCache {
    pub fn new() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(CACHED_FORMS).expect("nonzero capacity")),
        }
    }

    /// Geometry of `form` valid for the backbuf identified by
    /// `backbuf_hash`; rebuilt when the cached entry was produced against
    /// an older backbuf.
    pub fn get(
        &mut self,
        form: &Form,
        geo: &MaskGeometry,
        backbuf_hash: u64,
    ) -> Option<ScreenGeometry> {
        if let Some(cached) = self.cache.get(&form.id) {
            if cached.backbuf_hash == backbuf_hash {
                return Some(cached.geometry.clone());
            }
        }

        let (points, border) = points_border(form, geo, false)?;
        let source = if form.is_clone {
            points_border(form, geo, true).map(|(pts, _)| pts)
        } else {
            None
        };
        let geometry = ScreenGeometry {
            points,
            border,
            source,
        };
        self.cache.put(
            form.id,
            CachedGeometry {
                backbuf_hash,
                geometry: geometry.clone(),
            },
        );
        Some(geometry)
    }

    /// Drop everything, e.g. when the image changes.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{Circle, FormShape};

    fn circle_form() -> Form {
        Form {
            id: 5,
            name: "circle #1".into(),
            version: 1,
            is_clone: false,
            source: [0.0, 0.0],
            shape: FormShape::Circle(Circle {
                center: [0.5, 0.5],
                radius: 0.1,
                border: 0.02,
            }),
        }
    }

    #[test]
    fn geometry_is_rebuilt_when_the_backbuf_moves() {
        let mut overlay = OverlayCache::new();
        let form = circle_form();
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);

        let first = overlay.get(&form, &geo, 0xAA).unwrap();
        let zoomed = MaskGeometry::new(100, 100, 1.0, 2.0);
        let second = overlay.get(&form, &zoomed, 0xBB).unwrap();
        assert_ne!(first.points[2], second.points[2]);

        // same hash returns the cached geometry even with a stale geo
        let third = overlay.get(&form, &geo, 0xBB).unwrap();
        assert_eq!(second.points[2], third.points[2]);
    }

    #[test]
    fn groups_have_no_overlay_polyline() {
        let mut overlay = OverlayCache::new();
        let group = Form {
            shape: FormShape::Group(Default::default()),
            ..circle_form()
        };
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        assert!(overlay.get(&group, &geo, 1).is_none());
    }
}
