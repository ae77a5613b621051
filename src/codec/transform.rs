//! Pre-compression field transforms (spec §4.1): relative-delta packing,
//! unique-string pool dedup, and scaled-double storage. Applied in this
//! order before compression by [`crate::codec::pack`]; reversed (where a
//! reversal is needed at all) by [`crate::codec::unpack`].
//!
//! `pack_scale` operates on `Int64` fields whose raw bytes are the bit
//! pattern of an `f64` (this crate's [`crate::types::FieldType`] has no
//! dedicated floating type, matching spec §3's field-type list verbatim;
//! see `DESIGN.md` for this open-question resolution).

use crate::error::Result;
use crate::extent::Extent;
use crate::types::ExtentType;

/// Apply `pack_relative` to every eligible field of `extent`, returning a
/// transformed copy. Each record's stored value becomes `value -
/// reference`, where `reference` is the named field's value in the
/// *previous* record (0 for the first record).
pub fn apply_relative_pack(ty: &ExtentType, extent: &Extent) -> Result<Extent> {
    let mut out = extent.clone();
    for field in ty.fields() {
        let Some(ref_name) = &field.pack.relative_to else { continue };
        let ref_field = ty.field(ref_name).cloned().unwrap();
        let n = extent.n_records();
        if n == 0 {
            continue;
        }
        match field.field_type {
            crate::types::FieldType::Int32 => {
                let mut prev_ref = 0i32;
                for r in 0..n {
                    let reference = extent.get_i32(r, &ref_field)?;
                    let value = extent.get_i32(r, field)?;
                    out.set_i32(r, field, value.wrapping_sub(prev_ref))?;
                    prev_ref = reference;
                }
            }
            crate::types::FieldType::Int64 => {
                let mut prev_ref = 0i64;
                for r in 0..n {
                    let reference = extent.get_i64(r, &ref_field)?;
                    let value = extent.get_i64(r, field)?;
                    out.set_i64(r, field, value.wrapping_sub(prev_ref))?;
                    prev_ref = reference;
                }
            }
            _ => return Err(crate::error::Error::UnsupportedTransform(format!(
                "pack_relative is only supported on int32/int64 fields, field '{}' is {}",
                field.name, field.field_type
            ))),
        }
    }
    Ok(out)
}

/// Reverse [`apply_relative_pack`]: restores absolute values from stored
/// deltas, in record order (each record's reference is the already-restored
/// previous record's absolute value).
pub fn undo_relative_pack(ty: &ExtentType, extent: &Extent) -> Result<Extent> {
    let mut out = extent.clone();
    for field in ty.fields() {
        let Some(ref_name) = &field.pack.relative_to else { continue };
        let ref_field = ty.field(ref_name).cloned().unwrap();
        let self_referential = ref_name == &field.name;
        let n = extent.n_records();
        if n == 0 {
            continue;
        }
        match field.field_type {
            crate::types::FieldType::Int32 => {
                let mut prev_ref = 0i32;
                for r in 0..n {
                    let delta = extent.get_i32(r, field)?;
                    let absolute = delta.wrapping_add(prev_ref);
                    out.set_i32(r, field, absolute)?;
                    prev_ref = if self_referential {
                        absolute
                    } else {
                        out.get_i32(r, &ref_field)?
                    };
                }
            }
            crate::types::FieldType::Int64 => {
                let mut prev_ref = 0i64;
                for r in 0..n {
                    let delta = extent.get_i64(r, field)?;
                    let absolute = delta.wrapping_add(prev_ref);
                    out.set_i64(r, field, absolute)?;
                    prev_ref = if self_referential {
                        absolute
                    } else {
                        out.get_i64(r, &ref_field)?
                    };
                }
            }
            _ => return Err(crate::error::Error::UnsupportedTransform(format!(
                "pack_relative is only supported on int32/int64 fields, field '{}' is {}",
                field.name, field.field_type
            ))),
        }
    }
    Ok(out)
}

/// Rebuild the variable pool so each distinct value of a `pack_unique`
/// field occupies exactly one entry, with every record referencing the
/// shared offset. Non-unique fields keep their existing pool entries.
/// Reading the result back is transparent: `get_variable32` just follows
/// whatever offset is stored, so no inverse step is needed on unpack.
pub fn apply_unique_pack(ty: &ExtentType, extent: &Extent) -> Result<Extent> {
    use std::collections::HashMap;

    let mut out = extent.clone();
    for field in ty.fields() {
        if field.field_type != crate::types::FieldType::Variable32 || !field.pack.unique {
            continue;
        }
        let mut offsets: HashMap<Vec<u8>, u32> = HashMap::new();
        for r in 0..extent.n_records() {
            if extent.is_null(r, field) {
                continue;
            }
            let value = extent.get_variable32(r, field)?.to_vec();
            if let Some(&existing_offset) = offsets.get(&value) {
                out.point_variable32_at(r, field, existing_offset);
            } else {
                out.set_variable32(r, field, &value)?;
                let new_offset = out.get_variable32_offset(r, field)?;
                offsets.insert(value, new_offset);
            }
        }
    }
    Ok(out)
}

/// Scale an `f64` stored as the bit pattern of an `Int64` field: store
/// `round(value / scale)` as a plain integer.
pub fn apply_scale_pack(ty: &ExtentType, extent: &Extent) -> Result<Extent> {
    let mut out = extent.clone();
    for field in ty.fields() {
        let Some(scale) = field.pack.scale else { continue };
        if field.field_type != crate::types::FieldType::Int64 {
            return Err(crate::error::Error::UnsupportedTransform(format!(
                "pack_scale requires an int64-backed field, field '{}' is {}",
                field.name, field.field_type
            )));
        }
        for r in 0..extent.n_records() {
            if extent.is_null(r, field) {
                continue;
            }
            let bits = extent.get_i64(r, field)? as u64;
            let value = f64::from_bits(bits);
            let scaled = (value / scale).round() as i64;
            out.set_i64(r, field, scaled)?;
        }
    }
    Ok(out)
}

/// Reverse [`apply_scale_pack`]: `value = stored * scale`, re-encoded as
/// the bit pattern of an `f64`.
pub fn undo_scale_pack(ty: &ExtentType, extent: &Extent) -> Result<Extent> {
    let mut out = extent.clone();
    for field in ty.fields() {
        let Some(scale) = field.pack.scale else { continue };
        for r in 0..extent.n_records() {
            if extent.is_null(r, field) {
                continue;
            }
            let scaled = extent.get_i64(r, field)?;
            let value = scaled as f64 * scale;
            out.set_i64(r, field, value.to_bits() as i64)?;
        }
    }
    Ok(out)
}
