//! Group mask composition.
//!
//! References are evaluated in order into an accumulator using fuzzy set
//! operators: union = `max`, intersection = `min`, difference =
//! `max(a − b, 0)`, exclusion = `|a − b|`. Each child mask is scaled by its
//! reference opacity before combining. Only references carrying `USE`
//! contribute; `SHOW` is an overlay concern and ignored here.

use super::{form_by_id, Form, FormState, GroupRef, MaskBuffer, MaskGeometry};

/// Compose a group's references into a single mask. Returns `None` when no
/// reference contributes.
pub fn compose(forms: &[Form], refs: &[GroupRef], geo: &MaskGeometry) -> Option<MaskBuffer> {
    let mut children: Vec<(&GroupRef, MaskBuffer)> = Vec::new();
    for r in refs {
        if !r.state.contains(FormState::USE) {
            continue;
        }
        let Some(form) = form_by_id(forms, r.form_id) else {
            tracing::warn!(target: "darkroom::dev", form_id = r.form_id, "dangling group reference");
            continue;
        };
        if let Some(mask) = super::get_mask(forms, form, geo) {
            children.push((r, mask));
        }
    }
    if children.is_empty() {
        return None;
    }

    // accumulator spans the union of all contributing boxes
    let min_x = children.iter().map(|(_, m)| m.x).min().unwrap_or(0);
    let min_y = children.iter().map(|(_, m)| m.y).min().unwrap_or(0);
    let max_x = children
        .iter()
        .map(|(_, m)| m.x + m.width)
        .max()
        .unwrap_or(0);
    let max_y = children
        .iter()
        .map(|(_, m)| m.y + m.height)
        .max()
        .unwrap_or(0);
    let width = max_x - min_x;
    let height = max_y - min_y;
    if width <= 0 || height <= 0 {
        return None;
    }

    let mut acc = vec![0.0f32; (width * height) as usize];
    for (index, (r, mask)) in children.iter().enumerate() {
        let opacity = r.opacity.clamp(0.0, 1.0);
        for j in 0..height {
            for i in 0..width {
                let value = opacity * mask.sample(min_x + i, min_y + j);
                let idx = (j * width + i) as usize;
                let a = acc[idx];
                acc[idx] = if index == 0 {
                    value
                } else if r.state.contains(FormState::UNION) {
                    a.max(value)
                } else if r.state.contains(FormState::INTERSECTION) {
                    a.min(value)
                } else if r.state.contains(FormState::DIFFERENCE) {
                    (a - value).max(0.0)
                } else if r.state.contains(FormState::EXCLUSION) {
                    (a - value).abs()
                } else {
                    a.max(value)
                };
            }
        }
    }

    Some(MaskBuffer {
        buffer: acc,
        width,
        height,
        x: min_x,
        y: min_y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{Circle, FormShape};
    use smallvec::smallvec;

    fn circle_form(id: i64, cx: f32, cy: f32) -> Form {
        Form {
            id,
            name: format!("circle #{id}"),
            version: 1,
            is_clone: false,
            source: [0.0, 0.0],
            shape: FormShape::Circle(Circle {
                center: [cx, cy],
                radius: 0.1,
                border: 0.02,
            }),
        }
    }

    fn reference(form_id: i64, state: FormState, opacity: f32) -> GroupRef {
        GroupRef {
            form_id,
            parent_id: 100,
            state: state | FormState::SHOW | FormState::USE,
            opacity,
        }
    }

    #[test]
    fn union_of_two_circles_keeps_both_peaks() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let forms = vec![circle_form(1, 0.3, 0.3), circle_form(2, 0.7, 0.7)];
        let refs = vec![
            reference(1, FormState::empty(), 1.0),
            reference(2, FormState::UNION, 0.5),
        ];
        let mask = compose(&forms, &refs, &geo).unwrap();
        assert!((mask.sample(30, 30) - 1.0).abs() < 1e-4);
        assert!((mask.sample(70, 70) - 0.5).abs() < 1e-4);
        assert!(mask.sample(50, 50) < 1e-4);
    }

    #[test]
    fn intersection_of_disjoint_circles_is_empty() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let forms = vec![circle_form(1, 0.3, 0.3), circle_form(2, 0.7, 0.7)];
        let refs = vec![
            reference(1, FormState::empty(), 1.0),
            reference(2, FormState::INTERSECTION, 1.0),
        ];
        let mask = compose(&forms, &refs, &geo).unwrap();
        for v in &mask.buffer {
            assert!(*v < 1e-4);
        }
    }

    #[test]
    fn difference_cuts_a_hole() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let forms = vec![circle_form(1, 0.5, 0.5), circle_form(2, 0.5, 0.5)];
        let refs = vec![
            reference(1, FormState::empty(), 1.0),
            reference(2, FormState::DIFFERENCE, 1.0),
        ];
        let mask = compose(&forms, &refs, &geo).unwrap();
        assert!(mask.sample(50, 50) < 1e-4);
    }

    #[test]
    fn skips_references_without_use() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let forms = vec![circle_form(1, 0.3, 0.3), circle_form(2, 0.7, 0.7)];
        let refs = vec![
            reference(1, FormState::empty(), 1.0),
            GroupRef {
                form_id: 2,
                parent_id: 100,
                state: FormState::SHOW | FormState::UNION,
                opacity: 1.0,
            },
        ];
        let mask = compose(&forms, &refs, &geo).unwrap();
        assert!(mask.sample(70, 70) < 1e-4);
    }

    #[test]
    fn composite_stays_in_unit_range() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let forms = vec![circle_form(1, 0.45, 0.5), circle_form(2, 0.55, 0.5)];
        let refs = vec![
            reference(1, FormState::empty(), 0.8),
            reference(2, FormState::EXCLUSION, 0.9),
        ];
        let mask = compose(&forms, &refs, &geo).unwrap();
        for v in &mask.buffer {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn nested_groups_recurse() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let inner = Form {
            id: 10,
            name: "grp inner".into(),
            version: 1,
            is_clone: false,
            source: [0.0, 0.0],
            shape: FormShape::Group(smallvec![reference(1, FormState::empty(), 1.0)]),
        };
        let forms = vec![circle_form(1, 0.3, 0.3), inner];
        let refs = vec![reference(10, FormState::empty(), 0.5)];
        let mask = compose(&forms, &refs, &geo).unwrap();
        assert!((mask.sample(30, 30) - 0.5).abs() < 1e-4);
    }
}
