//! Vector mask catalogue: shapes, groups, rasterization and persistence.
//!
//! Shapes ("forms") are stored in `[0,1]²` image-relative coordinates and
//! rasterized on demand for a given pipeline stage. A module's blending
//! mask is a *group* form whose references combine child masks with fuzzy
//! set operators and per-reference opacity.

use smallvec::SmallVec;

pub mod circle;
pub mod group;
pub mod overlay;
pub mod path;
pub mod store;

mod blob;

pub use store::{FormRow, FormStore, FormsDb, MemoryFormsDb};

/// Process-wide unique shape identity.
pub type FormId = i64;

bitflags::bitflags! {
    /// Per-reference state inside a group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormState: u32 {
        /// Drawn in the on-screen overlay.
        const SHOW = 1 << 0;
        /// Contributes to the composite mask.
        const USE = 1 << 1;
        const UNION = 1 << 2;
        const INTERSECTION = 1 << 3;
        const DIFFERENCE = 1 << 4;
        const EXCLUSION = 1 << 5;
    }
}

/// Tangent behaviour of one path node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    /// Handles follow the Catmull-Rom tangent through the node.
    Smooth,
    /// Handles are taken verbatim; coincident handles give a sharp corner.
    Corner,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Circle {
    /// Centre in normalised image coordinates.
    pub center: [f32; 2],
    /// Radius as a fraction of the smaller image dimension.
    pub radius: f32,
    /// Falloff band width outside the radius, same unit.
    pub border: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathPoint {
    pub corner: [f32; 2],
    pub ctrl1: [f32; 2],
    pub ctrl2: [f32; 2],
    /// Feather width at this node, as a fraction of the smaller dimension.
    pub border: f32,
    pub state: PointState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRef {
    pub form_id: FormId,
    pub parent_id: FormId,
    pub state: FormState,
    pub opacity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormShape {
    Circle(Circle),
    Path(Vec<PathPoint>),
    Group(SmallVec<[GroupRef; 4]>),
}

/// One catalogued shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub id: FormId,
    pub name: String,
    pub version: i32,
    /// Clone shapes carry their geometry twice: at the drawn position and
    /// offset to `source`.
    pub is_clone: bool,
    /// Source point for clone shapes, normalised image coordinates.
    pub source: [f32; 2],
    pub shape: FormShape,
}

impl Form {
    pub fn is_group(&self) -> bool {
        matches!(self.shape, FormShape::Group(_))
    }

    pub fn group_refs(&self) -> Option<&[GroupRef]> {
        match &self.shape {
            FormShape::Group(refs) => Some(refs),
            _ => None,
        }
    }

    pub fn group_refs_mut(&mut self) -> Option<&mut SmallVec<[GroupRef; 4]>> {
        match &mut self.shape {
            FormShape::Group(refs) => Some(refs),
            _ => None,
        }
    }
}

/// Geometry of the stage a mask is rasterized for.
///
/// Normalised form coordinates are scaled by `(iwidth·iscale, iheight·iscale)`
/// and then by the stage's local `scale`; `x`/`y` shift into the stage's
/// buffer origin.
#[derive(Debug, Clone, Copy)]
pub struct MaskGeometry {
    pub iwidth: i32,
    pub iheight: i32,
    pub iscale: f32,
    pub scale: f32,
    pub x: i32,
    pub y: i32,
}

impl MaskGeometry {
    pub fn new(iwidth: i32, iheight: i32, iscale: f32, scale: f32) -> Self {
        Self {
            iwidth,
            iheight,
            iscale,
            scale,
            x: 0,
            y: 0,
        }
    }

    /// Full pixel extent of the stage.
    pub fn stage_size(&self) -> (f32, f32) {
        (
            self.iwidth as f32 * self.iscale * self.scale,
            self.iheight as f32 * self.iscale * self.scale,
        )
    }

    /// Map a normalised point into stage pixels.
    pub fn to_pixels(&self, p: [f32; 2]) -> (f32, f32) {
        let (w, h) = self.stage_size();
        (p[0] * w - self.x as f32, p[1] * h - self.y as f32)
    }

    /// Pixel length of a fraction of the smaller image dimension (the unit
    /// of radii and border widths).
    pub fn unit(&self) -> f32 {
        let (w, h) = self.stage_size();
        w.min(h)
    }
}

/// A dense alpha mask with its bounding box in stage coordinates.
#[derive(Debug, Clone)]
pub struct MaskBuffer {
    pub buffer: Vec<f32>,
    pub width: i32,
    pub height: i32,
    pub x: i32,
    pub y: i32,
}

impl MaskBuffer {
    pub fn sample(&self, x: i32, y: i32) -> f32 {
        let lx = x - self.x;
        let ly = y - self.y;
        if lx < 0 || ly < 0 || lx >= self.width || ly >= self.height {
            return 0.0;
        }
        self.buffer[(ly * self.width + lx) as usize]
    }
}

/// Linear lookup in a form list; groups keep references by id, never by
/// pointer, so this is the only way shapes find each other.
pub fn form_by_id(forms: &[Form], id: FormId) -> Option<&Form> {
    forms.iter().find(|f| f.id == id)
}

/// Drawable outline polyline(s) for a single (non-group) form:
/// `(points, border)`, interleaved x/y floats in stage pixels. With
/// `source` set, clone forms yield the geometry shifted to their source
/// point.
pub fn points_border(
    form: &Form,
    geo: &MaskGeometry,
    source: bool,
) -> Option<(Vec<f32>, Option<Vec<f32>>)> {
    match &form.shape {
        FormShape::Circle(c) => {
            let center = if source && form.is_clone {
                form.source
            } else {
                c.center
            };
            let points = circle::outline(center, c.radius, geo);
            let border = circle::outline(center, c.radius + c.border, geo);
            Some((points, Some(border)))
        }
        FormShape::Path(points) => path::points_border(points, form, geo, source),
        FormShape::Group(_) => None,
    }
}

/// Axis-aligned bounding box `(width, height, x, y)` of a form at a stage.
pub fn area(form: &Form, geo: &MaskGeometry) -> Option<(i32, i32, i32, i32)> {
    match &form.shape {
        FormShape::Circle(c) => Some(circle::area(c, geo)),
        FormShape::Path(points) => path::area(points, geo),
        FormShape::Group(_) => None,
    }
}

/// Rasterize a form into a dense alpha mask. Groups compose their
/// children in reference order.
pub fn get_mask(forms: &[Form], form: &Form, geo: &MaskGeometry) -> Option<MaskBuffer> {
    match &form.shape {
        FormShape::Circle(c) => Some(circle::mask(c, geo)),
        FormShape::Path(points) => path::mask(points, geo),
        FormShape::Group(refs) => group::compose(forms, refs, geo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_maps_normalised_points() {
        let geo = MaskGeometry::new(200, 100, 1.0, 0.5);
        assert_eq!(geo.stage_size(), (100.0, 50.0));
        assert_eq!(geo.to_pixels([0.5, 0.5]), (50.0, 25.0));
        assert_eq!(geo.unit(), 50.0);
    }

    #[test]
    fn mask_buffer_sampling_is_zero_outside() {
        let mask = MaskBuffer {
            buffer: vec![0.5; 4],
            width: 2,
            height: 2,
            x: 10,
            y: 10,
        };
        assert_eq!(mask.sample(10, 10), 0.5);
        assert_eq!(mask.sample(9, 10), 0.0);
        assert_eq!(mask.sample(12, 11), 0.0);
    }
}
