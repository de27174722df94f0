//! Packed persistence records.
//!
//! Payload blobs are native-endian `#[repr(C)]` records cast with
//! `bytemuck`; the row's `payload_count` says how many records the blob
//! holds. Decoding validates the byte length against the count and the
//! form's declared kind.

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::masks::{Circle, FormShape, FormState, GroupRef, PathPoint, PointState};

pub const TYPE_CIRCLE: u32 = 1 << 0;
pub const TYPE_PATH: u32 = 1 << 1;
pub const TYPE_GROUP: u32 = 1 << 2;
pub const TYPE_CLONE: u32 = 1 << 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CircleRecord {
    center: [f32; 2],
    radius: f32,
    border: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PathPointRecord {
    corner: [f32; 2],
    ctrl1: [f32; 2],
    ctrl2: [f32; 2],
    border: f32,
    state: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GroupRefRecord {
    form_id: i64,
    parent_id: i64,
    state: u32,
    opacity: f32,
}

const POINT_SMOOTH: u32 = 0;
const POINT_CORNER: u32 = 1;

/// Type bits of a shape variant plus the clone flag.
pub fn type_bits(shape: &FormShape, is_clone: bool) -> u32 {
    let base = match shape {
        FormShape::Circle(_) => TYPE_CIRCLE,
        FormShape::Path(_) => TYPE_PATH,
        FormShape::Group(_) => TYPE_GROUP,
    };
    if is_clone {
        base | TYPE_CLONE
    } else {
        base
    }
}

/// Serialize a shape payload; returns `(blob, record_count)`.
pub fn encode(shape: &FormShape) -> (Vec<u8>, u32) {
    match shape {
        FormShape::Circle(c) => {
            let record = CircleRecord {
                center: c.center,
                radius: c.radius,
                border: c.border,
            };
            (bytemuck::bytes_of(&record).to_vec(), 1)
        }
        FormShape::Path(points) => {
            let records: Vec<PathPointRecord> = points
                .iter()
                .map(|p| PathPointRecord {
                    corner: p.corner,
                    ctrl1: p.ctrl1,
                    ctrl2: p.ctrl2,
                    border: p.border,
                    state: match p.state {
                        PointState::Smooth => POINT_SMOOTH,
                        PointState::Corner => POINT_CORNER,
                    },
                })
                .collect();
            (bytemuck::cast_slice(&records).to_vec(), records.len() as u32)
        }
        FormShape::Group(refs) => {
            let records: Vec<GroupRefRecord> = refs
                .iter()
                .map(|r| GroupRefRecord {
                    form_id: r.form_id,
                    parent_id: r.parent_id,
                    state: r.state.bits(),
                    opacity: r.opacity,
                })
                .collect();
            (bytemuck::cast_slice(&records).to_vec(), records.len() as u32)
        }
    }
}

fn cast_records<T: Pod>(blob: &[u8], count: u32, what: &str) -> Result<Vec<T>, StoreError> {
    let expected = count as usize * std::mem::size_of::<T>();
    if blob.len() != expected {
        return Err(StoreError::Corrupt(format!(
            "{what} blob holds {} bytes, expected {expected}",
            blob.len()
        )));
    }
    bytemuck::try_cast_slice(blob)
        .map(|records: &[T]| records.to_vec())
        .map_err(|err| StoreError::Corrupt(format!("{what} blob misaligned: {err}")))
}

/// Deserialize a payload blob back into a shape. Owned copies per record;
/// nothing aliases the blob.
pub fn decode(type_bits: u32, blob: &[u8], count: u32) -> Result<FormShape, StoreError> {
    if type_bits & TYPE_CIRCLE != 0 {
        if count != 1 {
            return Err(StoreError::Corrupt(format!(
                "circle rows carry one record, found {count}"
            )));
        }
        let records: Vec<CircleRecord> = cast_records(blob, count, "circle")?;
        let record = records[0];
        Ok(FormShape::Circle(Circle {
            center: record.center,
            radius: record.radius,
            border: record.border,
        }))
    } else if type_bits & TYPE_PATH != 0 {
        let records: Vec<PathPointRecord> = cast_records(blob, count, "path")?;
        let points = records
            .into_iter()
            .map(|r| {
                Ok(PathPoint {
                    corner: r.corner,
                    ctrl1: r.ctrl1,
                    ctrl2: r.ctrl2,
                    border: r.border,
                    state: match r.state {
                        POINT_SMOOTH => PointState::Smooth,
                        POINT_CORNER => PointState::Corner,
                        other => {
                            return Err(StoreError::Corrupt(format!(
                                "unknown path point state {other}"
                            )))
                        }
                    },
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(FormShape::Path(points))
    } else if type_bits & TYPE_GROUP != 0 {
        let records: Vec<GroupRefRecord> = cast_records(blob, count, "group")?;
        let refs = records
            .into_iter()
            .map(|r| {
                Ok(GroupRef {
                    form_id: r.form_id,
                    parent_id: r.parent_id,
                    state: FormState::from_bits(r.state).ok_or_else(|| {
                        StoreError::Corrupt(format!("unknown group state bits {:#x}", r.state))
                    })?,
                    opacity: r.opacity,
                })
            })
            .collect::<Result<SmallVec<[GroupRef; 4]>, StoreError>>()?;
        Ok(FormShape::Group(refs))
    } else {
        Err(StoreError::Corrupt(format!(
            "unknown form type bits {type_bits:#x}"
        )))
    }
}
